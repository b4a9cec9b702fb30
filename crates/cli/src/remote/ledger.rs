//! Ledger store over HTTP.
//!
//! `GET {base}/ledgers/{index}/records` with the chunk filter as query
//! parameters; the response is one page:
//!
//! ```json
//! { "records": [ { "...": "..." } ], "nextCursor": "opaque-or-null" }
//! ```

use serde::Deserialize;
use tillmatch_recon::model::RawRecord;
use tillmatch_recon::reader::{LedgerError, LedgerPage, LedgerQuery, LedgerRequest};

use super::common::{HttpError, RemoteClient};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageBody {
    #[serde(default)]
    records: Vec<RawRecord>,
    #[serde(default)]
    next_cursor: Option<String>,
}

pub struct HttpLedger {
    client: RemoteClient,
}

impl HttpLedger {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }

    fn params(request: &LedgerRequest<'_>, cursor: Option<&str>) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("tenant", request.tenant_id.to_string()),
            ("rangeField", request.range_field.to_string()),
            ("from", request.range.start.format(TIMESTAMP_FORMAT).to_string()),
            ("to", request.range.end.format(TIMESTAMP_FORMAT).to_string()),
            ("pageSize", request.page_size.to_string()),
        ];
        if let Some(key) = request.key {
            params.push(("keyField", key.field.clone()));
            params.push(("keyValue", key.value.clone()));
        }
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        params
    }
}

impl LedgerQuery for HttpLedger {
    fn query(
        &self,
        request: &LedgerRequest<'_>,
        cursor: Option<&str>,
    ) -> Result<LedgerPage, LedgerError> {
        let url = self
            .client
            .endpoint(&["ledgers", request.index, "records"]);
        let params = Self::params(request, cursor);

        let body: PageBody = self
            .client
            .get_json(&url, &params)
            .map_err(ledger_error)?
            .ok_or_else(|| {
                LedgerError::Rejected(format!("index '{}' not found", request.index))
            })?;

        Ok(LedgerPage {
            records: body.records,
            next_cursor: body.next_cursor.filter(|c| !c.is_empty()),
        })
    }
}

fn ledger_error(err: HttpError) -> LedgerError {
    if err.is_transient() {
        LedgerError::Unavailable(err.to_string())
    } else {
        LedgerError::Rejected(err.to_string())
    }
}
