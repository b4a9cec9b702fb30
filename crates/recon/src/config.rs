use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::ReconError;
use crate::model::{ReconciliationSubType, ReconciliationType, StageRole};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default)]
    pub tolerance: ToleranceConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    pub sources: BTreeMap<String, SourceConfig>,
    #[serde(default)]
    pub pipelines: Vec<PipelineDef>,
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// One upstream ledger feeding a pipeline stage.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub stage: StageRole,
    /// Index / collection hint passed to the ledger store. Defaults to the
    /// source name.
    #[serde(default)]
    pub index: Option<String>,
    /// Timestamp-like field the chunk's date range is applied to.
    pub range_field: String,
    pub fields: FieldMapping,
    /// Fixed channel for sources that serve a single channel.
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub exclude: Option<ExclusionRule>,
    #[serde(default)]
    pub transform: Option<AmountTransform>,
}

impl SourceConfig {
    pub fn index_name<'a>(&'a self, source_name: &'a str) -> &'a str {
        self.index.as_deref().unwrap_or(source_name)
    }
}

/// Raw field names for each canonical attribute.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldMapping {
    /// Fields joined (with `key_separator`) into the group key, e.g. a branch
    /// code, or a PO number.
    pub key: Vec<String>,
    #[serde(default = "default_key_separator")]
    pub key_separator: String,
    /// When set, the date part of this field joins the group key.
    #[serde(default)]
    pub date: Option<String>,
    /// When set, this field's value joins the group key as the channel.
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub quantity: Option<String>,
    #[serde(default)]
    pub unit_price: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    /// Line number within a multi-line document. Duplicates are detected on
    /// reference plus line.
    #[serde(default)]
    pub line: Option<String>,
    #[serde(default)]
    pub upstream_ref: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub supplier: Option<String>,
    #[serde(default)]
    pub approval: Option<ApprovalRule>,
}

fn default_key_separator() -> String {
    "-".into()
}

/// Records whose `field` holds one of `values` are kept but excluded from
/// aggregation (e.g. `cancelled = "TRUE"`).
#[derive(Debug, Clone, Deserialize)]
pub struct ExclusionRule {
    pub field: String,
    pub values: Vec<String>,
}

/// `field` holding one of `approved_values` marks a record as approved; any
/// other present value marks it unapproved.
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalRule {
    pub field: String,
    pub approved_values: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AmountTransform {
    pub multiply: Decimal,
    #[serde(default)]
    pub when_field: Option<String>,
    #[serde(default)]
    pub when_values: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

/// Ordered stage sequence for one reconciliation type / sub-type branch.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDef {
    #[serde(rename = "type")]
    pub reconciliation_type: ReconciliationType,
    pub sub_type: ReconciliationSubType,
    /// Source names, upstream first.
    pub stages: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tolerance + Reader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ToleranceConfig {
    #[serde(default)]
    pub amount: Decimal,
    #[serde(default)]
    pub quantity: i64,
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            amount: Decimal::ZERO,
            quantity: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaderConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_page_size() -> usize {
    500
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            page_size: default_page_size(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl PipelineConfig {
    pub fn from_toml(input: &str) -> Result<Self, ReconError> {
        let config: PipelineConfig =
            toml::from_str(input).map_err(|e| ReconError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        if self.sources.is_empty() {
            return Err(ReconError::ConfigValidation(
                "at least one source is required".into(),
            ));
        }

        for (name, source) in &self.sources {
            if source.fields.key.is_empty() {
                return Err(ReconError::ConfigValidation(format!(
                    "source '{name}': fields.key must name at least one field"
                )));
            }
            if source.fields.amount.is_none()
                && !(source.fields.quantity.is_some() && source.fields.unit_price.is_some())
            {
                return Err(ReconError::ConfigValidation(format!(
                    "source '{name}': needs fields.amount or fields.quantity + fields.unit_price"
                )));
            }
        }

        let mut seen = HashSet::new();
        for pipeline in &self.pipelines {
            let label = format!("{}/{}", pipeline.reconciliation_type, pipeline.sub_type);
            if !seen.insert((pipeline.reconciliation_type, pipeline.sub_type)) {
                return Err(ReconError::ConfigValidation(format!(
                    "pipeline '{label}' declared more than once"
                )));
            }
            if pipeline.stages.len() < 2 {
                return Err(ReconError::ConfigValidation(format!(
                    "pipeline '{label}' needs at least 2 stages, found {}",
                    pipeline.stages.len()
                )));
            }
            let mut roles = HashSet::new();
            for stage in &pipeline.stages {
                let source = self.sources.get(stage).ok_or_else(|| {
                    ReconError::UnknownSource(format!("pipeline '{label}': source '{stage}' not found"))
                })?;
                if !roles.insert(source.stage) {
                    return Err(ReconError::ConfigValidation(format!(
                        "pipeline '{label}': stage role '{}' appears more than once",
                        source.stage
                    )));
                }
            }
        }

        Ok(())
    }

    /// Stage sequence for a type / sub-type pair, if one is configured.
    pub fn pipeline_for(
        &self,
        reconciliation_type: ReconciliationType,
        sub_type: ReconciliationSubType,
    ) -> Option<&PipelineDef> {
        self.pipelines
            .iter()
            .find(|p| p.reconciliation_type == reconciliation_type && p.sub_type == sub_type)
    }
}

// ---------------------------------------------------------------------------
// Chunk request
// ---------------------------------------------------------------------------

/// One bounded unit of work: tenant + date range + type/sub-type + channel.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub tenant_id: String,
    pub range: DateRange,
    pub reconciliation_type: ReconciliationType,
    pub sub_type: ReconciliationSubType,
    pub channel: Option<String>,
}

/// Inclusive timestamp range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl DateRange {
    /// Parse chunk bounds. Date-only start becomes `00:00:00.000`, date-only
    /// end becomes `23:59:59.999`; full timestamps are kept as given.
    pub fn parse(start: &str, end: &str) -> Result<Self, ReconError> {
        let start_ts = parse_bound(start, Bound::Start)
            .ok_or_else(|| ReconError::InvalidRequest(format!("cannot parse start date '{start}'")))?;
        let end_ts = parse_bound(end, Bound::End)
            .ok_or_else(|| ReconError::InvalidRequest(format!("cannot parse end date '{end}'")))?;
        if start_ts > end_ts {
            return Err(ReconError::InvalidRequest(format!(
                "start ({start_ts}) is after end ({end_ts})"
            )));
        }
        Ok(Self {
            start: start_ts,
            end: end_ts,
        })
    }

    pub fn from_dates(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: start.and_time(NaiveTime::MIN),
            end: end.and_time(end_of_day()),
        }
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Split into consecutive day-aligned chunks of at most `days` days.
    pub fn split_days(&self, days: u32) -> Vec<DateRange> {
        let days = i64::from(days.max(1));
        let mut chunks = Vec::new();
        let mut cursor = self.start;
        while cursor <= self.end {
            let last_day = cursor.date() + Duration::days(days - 1);
            let chunk_end = last_day.and_time(end_of_day()).min(self.end);
            chunks.push(DateRange {
                start: cursor,
                end: chunk_end,
            });
            cursor = (last_day + Duration::days(1)).and_time(NaiveTime::MIN);
        }
        chunks
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start.format("%Y-%m-%dT%H:%M:%S%.3f"),
            self.end.format("%Y-%m-%dT%H:%M:%S%.3f")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Start,
    End,
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN)
}

/// Parse a range bound; date-only values snap to the start or end of day.
pub fn parse_bound(value: &str, bound: Bound) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(match bound {
            Bound::Start => date.and_time(NaiveTime::MIN),
            Bound::End => date.and_time(end_of_day()),
        });
    }
    parse_timestamp(value)
}

/// Parse the timestamp shapes upstream ledgers emit: RFC 3339, ISO-like
/// naive timestamps, bare dates, and epoch seconds or milliseconds.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_local());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(ts);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date.and_time(NaiveTime::MIN));
    }
    if value.chars().all(|c| c.is_ascii_digit()) {
        let n: i64 = value.parse().ok()?;
        // Anything past year ~5138 in seconds is read as milliseconds.
        let dt = if n > 99_999_999_999 {
            DateTime::from_timestamp_millis(n)?
        } else {
            DateTime::from_timestamp(n, 0)?
        };
        return Some(dt.naive_utc());
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
