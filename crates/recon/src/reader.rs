//! Ledger reader: pulls every page of raw records for one source.
//!
//! The store is reached through [`LedgerQuery`]; the reader owns the cursor
//! loop and a fixed retry budget per page. Backoff, if any, belongs to the
//! store client.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{parse_timestamp, DateRange};
use crate::error::ReconError;
use crate::model::RawRecord;

/// Equality predicate on one field, pushed down to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPredicate {
    pub field: String,
    pub value: String,
}

/// One page request against the ledger store.
#[derive(Debug, Clone)]
pub struct LedgerRequest<'a> {
    pub tenant_id: &'a str,
    /// Index / collection hint.
    pub index: &'a str,
    pub key: Option<&'a KeyPredicate>,
    pub range_field: &'a str,
    pub range: DateRange,
    pub page_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LedgerPage {
    pub records: Vec<RawRecord>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Transient: worth another attempt.
    #[error("ledger store unavailable: {0}")]
    Unavailable(String),
    /// The store rejected the request; retrying will not help.
    #[error("ledger store rejected request: {0}")]
    Rejected(String),
}

/// The narrow interface to an upstream ledger store.
pub trait LedgerQuery: Send + Sync {
    fn query(
        &self,
        request: &LedgerRequest<'_>,
        cursor: Option<&str>,
    ) -> Result<LedgerPage, LedgerError>;
}

/// Follows cursors until exhausted, retrying each page a fixed number of times.
pub struct LedgerReader<'a> {
    store: &'a dyn LedgerQuery,
    max_retries: u32,
}

impl<'a> LedgerReader<'a> {
    pub fn new(store: &'a dyn LedgerQuery, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    /// Fetch every record of `request.index` for the tenant inside the range.
    pub fn fetch(&self, request: &LedgerRequest<'_>) -> Result<Vec<RawRecord>, ReconError> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        let mut page = 0u32;

        loop {
            page += 1;
            let result = self.fetch_page(request, cursor.as_deref())?;
            debug!(
                tenant = request.tenant_id,
                index = request.index,
                page,
                records = result.records.len(),
                "ledger page"
            );

            let has_more = result.next_cursor.is_some();
            if has_more && result.records.is_empty() {
                return Err(ReconError::Pagination {
                    source_name: request.index.to_string(),
                    message: "cursor returned with an empty page".into(),
                });
            }
            all.extend(result.records);

            let Some(next) = result.next_cursor else {
                break;
            };
            // Loop protection: a store that hands back the same cursor would
            // otherwise be followed forever.
            if cursor.as_deref() == Some(next.as_str()) {
                return Err(ReconError::Pagination {
                    source_name: request.index.to_string(),
                    message: format!("cursor '{next}' repeated"),
                });
            }
            cursor = Some(next);
        }

        Ok(all)
    }

    fn fetch_page(
        &self,
        request: &LedgerRequest<'_>,
        cursor: Option<&str>,
    ) -> Result<LedgerPage, ReconError> {
        let mut attempt = 0u32;
        loop {
            match self.store.query(request, cursor) {
                Ok(page) => return Ok(page),
                Err(LedgerError::Rejected(message)) => {
                    return Err(ReconError::SourceUnavailable {
                        source_name: request.index.to_string(),
                        attempts: attempt + 1,
                        message,
                    });
                }
                Err(LedgerError::Unavailable(message)) => {
                    if attempt >= self.max_retries {
                        return Err(ReconError::SourceUnavailable {
                            source_name: request.index.to_string(),
                            attempts: attempt + 1,
                            message,
                        });
                    }
                    attempt += 1;
                    warn!(
                        index = request.index,
                        attempt,
                        max_retries = self.max_retries,
                        error = %message,
                        "ledger page failed, retrying"
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-process ledger
// ---------------------------------------------------------------------------

const TENANT_FIELD: &str = "tenant_id";

/// Ledger held in memory, paged with the same cursor protocol as a remote
/// store. Backs file-driven runs and tests.
///
/// Records are stored per index. A record is visible to a tenant when its
/// `tenant_id` equals the tenant, or when the record has no such field.
pub struct MemoryLedger {
    indexes: BTreeMap<String, Vec<RawRecord>>,
    outages: Mutex<BTreeMap<String, u32>>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            indexes: BTreeMap::new(),
            outages: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn insert(&mut self, index: impl Into<String>, records: Vec<RawRecord>) {
        self.indexes.entry(index.into()).or_default().extend(records);
    }

    /// Make the next `failures` queries against `index` report unavailability.
    pub fn fail_next(&self, index: impl Into<String>, failures: u32) {
        self.outages.lock().insert(index.into(), failures);
    }

    /// Load `<dir>/<index>.csv` for every index name given.
    pub fn from_csv_dir<'i>(
        dir: &Path,
        indexes: impl IntoIterator<Item = &'i str>,
    ) -> Result<Self, ReconError> {
        let mut ledger = Self::new();
        for index in indexes {
            let path = dir.join(format!("{index}.csv"));
            let data = std::fs::read_to_string(&path)
                .map_err(|e| ReconError::Io(format!("cannot read {}: {e}", path.display())))?;
            ledger.insert(index, load_csv_records(&data)?);
        }
        Ok(ledger)
    }

    fn visible(&self, request: &LedgerRequest<'_>, record: &RawRecord) -> bool {
        if let Some(tenant) = record.text(TENANT_FIELD) {
            if tenant != request.tenant_id {
                return false;
            }
        }
        if let Some(key) = request.key {
            if record.text(&key.field).as_deref() != Some(key.value.as_str()) {
                return false;
            }
        }
        record
            .text(request.range_field)
            .and_then(|v| parse_timestamp(&v))
            .is_some_and(|ts| request.range.contains(ts))
    }
}

impl LedgerQuery for MemoryLedger {
    fn query(
        &self,
        request: &LedgerRequest<'_>,
        cursor: Option<&str>,
    ) -> Result<LedgerPage, LedgerError> {
        {
            let mut outages = self.outages.lock();
            if let Some(remaining) = outages.get_mut(request.index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(LedgerError::Unavailable(format!(
                        "index '{}' temporarily unavailable",
                        request.index
                    )));
                }
            }
        }

        let offset: usize = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| LedgerError::Rejected(format!("bad cursor '{c}'")))?,
            None => 0,
        };

        let matching: Vec<&RawRecord> = self
            .indexes
            .get(request.index)
            .map(|records| records.iter().filter(|r| self.visible(request, r)).collect())
            .unwrap_or_default();

        let page_size = request.page_size.max(1);
        let end = (offset + page_size).min(matching.len());
        let records = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|r| (*r).clone())
            .collect();
        let next_cursor = (end < matching.len()).then(|| end.to_string());

        Ok(LedgerPage {
            records,
            next_cursor,
        })
    }
}

/// Parse a headed CSV export into raw records, one JSON string field per column.
pub fn load_csv_records(csv_data: &str) -> Result<Vec<RawRecord>, ReconError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(csv_data.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ReconError::Io(e.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| ReconError::Io(e.to_string()))?;
        let mut fields = serde_json::Map::new();
        for (i, h) in headers.iter().enumerate() {
            if let Some(val) = row.get(i) {
                fields.insert(h.clone(), serde_json::Value::String(val.to_string()));
            }
        }
        records.push(RawRecord::new(fields));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(tenant: &str, ts: &str, id: &str) -> RawRecord {
        RawRecord::from(json!({ "tenant_id": tenant, "ts": ts, "id": id, "channel": "card" }))
    }

    fn request<'a>(index: &'a str, page_size: usize) -> LedgerRequest<'a> {
        LedgerRequest {
            tenant_id: "m1",
            index,
            key: None,
            range_field: "ts",
            range: DateRange::parse("2026-01-15", "2026-01-15").unwrap(),
            page_size,
        }
    }

    fn ledger_with(n: usize) -> MemoryLedger {
        let mut ledger = MemoryLedger::new();
        let records = (0..n)
            .map(|i| rec("m1", "2026-01-15T10:00:00", &format!("r{i}")))
            .collect();
        ledger.insert("pos", records);
        ledger
    }

    #[test]
    fn follows_cursor_until_exhausted() {
        let ledger = ledger_with(5);
        let reader = LedgerReader::new(&ledger, 3);
        let records = reader.fetch(&request("pos", 2)).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[4].text("id").as_deref(), Some("r4"));
    }

    #[test]
    fn filters_tenant_and_range() {
        let mut ledger = MemoryLedger::new();
        ledger.insert(
            "pos",
            vec![
                rec("m1", "2026-01-15T23:59:59.999", "in"),
                rec("m1", "2026-01-16T00:00:00", "next_day"),
                rec("m2", "2026-01-15T10:00:00", "other_tenant"),
                rec("m1", "not a date", "bad_ts"),
            ],
        );
        let reader = LedgerReader::new(&ledger, 0);
        let records = reader.fetch(&request("pos", 10)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text("id").as_deref(), Some("in"));
    }

    #[test]
    fn key_predicate_pushed_down() {
        let mut ledger = MemoryLedger::new();
        ledger.insert(
            "pos",
            vec![
                rec("m1", "2026-01-15T10:00:00", "a"),
                RawRecord::from(json!({ "tenant_id": "m1", "ts": "2026-01-15", "id": "b", "channel": "cash" })),
            ],
        );
        let key = KeyPredicate { field: "channel".into(), value: "cash".into() };
        let mut req = request("pos", 10);
        req.key = Some(&key);
        let records = LedgerReader::new(&ledger, 0).fetch(&req).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text("id").as_deref(), Some("b"));
    }

    #[test]
    fn retries_transient_failures() {
        let ledger = ledger_with(3);
        ledger.fail_next("pos", 2);
        let reader = LedgerReader::new(&ledger, 3);
        let records = reader.fetch(&request("pos", 10)).unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn unavailable_after_retries_exhausted() {
        let ledger = ledger_with(3);
        ledger.fail_next("pos", 10);
        let reader = LedgerReader::new(&ledger, 3);
        let err = reader.fetch(&request("pos", 10)).unwrap_err();
        match err {
            ReconError::SourceUnavailable { attempts, ref source_name, .. } => {
                assert_eq!(attempts, 4);
                assert_eq!(source_name, "pos");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    struct StuckStore;

    impl LedgerQuery for StuckStore {
        fn query(&self, _: &LedgerRequest<'_>, _: Option<&str>) -> Result<LedgerPage, LedgerError> {
            Ok(LedgerPage {
                records: vec![RawRecord::default()],
                next_cursor: Some("same".into()),
            })
        }
    }

    #[test]
    fn repeated_cursor_is_an_error() {
        let reader = LedgerReader::new(&StuckStore, 0);
        let err = reader.fetch(&request("pos", 10)).unwrap_err();
        assert!(err.to_string().contains("repeated"), "{err}");
    }

    struct EmptyPageWithCursor;

    impl LedgerQuery for EmptyPageWithCursor {
        fn query(&self, _: &LedgerRequest<'_>, _: Option<&str>) -> Result<LedgerPage, LedgerError> {
            Ok(LedgerPage { records: vec![], next_cursor: Some("1".into()) })
        }
    }

    #[test]
    fn empty_page_with_cursor_is_an_error() {
        let reader = LedgerReader::new(&EmptyPageWithCursor, 0);
        let err = reader.fetch(&request("pos", 10)).unwrap_err();
        assert!(err.to_string().contains("empty page"));
    }

    #[test]
    fn csv_records_keep_all_columns() {
        let data = "branch_code,net_amount,cancelled\nBR01,100.50,FALSE\nBR02,,TRUE\n";
        let records = load_csv_records(data).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].text("net_amount").as_deref(), Some("100.50"));
        assert_eq!(records[1].text("net_amount"), None);
        assert_eq!(records[1].text("cancelled").as_deref(), Some("TRUE"));
    }

    #[test]
    fn csv_dir_loads_named_indexes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pos.csv"),
            "tenant_id,ts,id\nm1,2026-01-15,a\nm1,2026-01-15,b\n",
        )
        .unwrap();
        let ledger = MemoryLedger::from_csv_dir(dir.path(), ["pos"]).unwrap();
        let records = LedgerReader::new(&ledger, 0).fetch(&request("pos", 1)).unwrap();
        assert_eq!(records.len(), 2);

        let err = MemoryLedger::from_csv_dir(dir.path(), ["bank"]).err().unwrap();
        assert!(err.to_string().contains("bank.csv"));
    }
}
