use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Round a money value to 2 decimal places, midpoint away from zero.
///
/// The only place rounding happens: aggregation keeps exact sums and this is
/// applied when a value leaves the engine (comparison variance, results).
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// The ledger or document role a record plays in a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    Sales,
    Payment,
    Gateway,
    Bank,
    Erp,
    Po,
    Grn,
    Invoice,
}

impl StageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sales => "sales",
            Self::Payment => "payment",
            Self::Gateway => "gateway",
            Self::Bank => "bank",
            Self::Erp => "erp",
            Self::Po => "po",
            Self::Grn => "grn",
            Self::Invoice => "invoice",
        }
    }

    /// Procurement documents carry quantities that must agree, not just amounts.
    pub fn is_procurement(&self) -> bool {
        matches!(self, Self::Po | Self::Grn | Self::Invoice)
    }
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Reconciliation type / sub-type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconciliationType {
    SalesAmount,
    SettlementAmount,
    ThreeWayMatch,
}

impl fmt::Display for ReconciliationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SalesAmount => write!(f, "salesAmount"),
            Self::SettlementAmount => write!(f, "settlementAmount"),
            Self::ThreeWayMatch => write!(f, "threeWayMatch"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconciliationSubType {
    FoodMarketplace,
    CreditCard,
    PurchaseOrder,
}

impl fmt::Display for ReconciliationSubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FoodMarketplace => write!(f, "foodMarketplace"),
            Self::CreditCard => write!(f, "creditCard"),
            Self::PurchaseOrder => write!(f, "purchaseOrder"),
        }
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// One record exactly as the ledger store returned it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord {
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl RawRecord {
    pub fn new(fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Self { fields }
    }

    /// Field value rendered as trimmed text. Numbers and booleans are
    /// stringified; null and missing fields are `None`.
    pub fn text(&self, field: &str) -> Option<String> {
        match self.fields.get(field)? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => {
                let t = s.trim();
                if t.is_empty() {
                    None
                } else {
                    Some(t.to_string())
                }
            }
            other => Some(other.to_string()),
        }
    }
}

impl From<serde_json::Value> for RawRecord {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(fields) => Self { fields },
            _ => Self::default(),
        }
    }
}

/// Composite identity under which records from different stages are compared.
///
/// Sales-style pipelines key on branch + date + channel; procurement keys on
/// the PO number alone (date and channel are `None`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl GroupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            date: None,
            channel: None,
        }
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// A key that could not be derived from the configured fields.
    pub fn is_unmapped(&self) -> bool {
        self.key.is_empty()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.key.is_empty() { "<unmapped>" } else { &self.key })?;
        if let Some(date) = self.date {
            write!(f, "/{date}")?;
        }
        if let Some(ref channel) = self.channel {
            write!(f, "/{channel}")?;
        }
        Ok(())
    }
}

/// One transaction as reported by one ledger stage.
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalRecord {
    pub group_key: GroupKey,
    pub stage: StageRole,
    pub source: String,
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<NaiveDateTime>,
    pub reference_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    /// Upstream document this record points at (e.g. the PO number printed on
    /// an invoice), when the source carries one separately from the key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supplier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    /// Flagged out of aggregation (e.g. cancelled).
    pub excluded: bool,
    /// Mapped fields that were absent or unparseable on the raw record.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,
    #[serde(skip)]
    pub raw: RawRecord,
}

impl CanonicalRecord {
    pub fn date(&self) -> Option<NaiveDate> {
        self.timestamp.map(|ts| ts.date())
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// All records of one stage sharing a group key.
///
/// Totals are computed once from the members at construction and cannot be
/// changed afterwards, so `total_amount == sum(members.amount)` always holds.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedGroup {
    group_key: GroupKey,
    stage: StageRole,
    total_amount: Decimal,
    total_quantity: Option<i64>,
    members: Vec<CanonicalRecord>,
}

impl AggregatedGroup {
    /// Build a group from its members. Returns `None` if a sum overflows.
    pub fn from_members(
        group_key: GroupKey,
        stage: StageRole,
        members: Vec<CanonicalRecord>,
    ) -> Option<Self> {
        let mut total_amount = Decimal::ZERO;
        let mut total_quantity: Option<i64> = None;
        for m in &members {
            total_amount = total_amount.checked_add(m.amount)?;
            if let Some(q) = m.quantity {
                total_quantity = Some(total_quantity.unwrap_or(0).checked_add(q)?);
            }
        }
        Some(Self {
            group_key,
            stage,
            total_amount,
            total_quantity,
            members,
        })
    }

    pub fn group_key(&self) -> &GroupKey {
        &self.group_key
    }

    pub fn stage(&self) -> StageRole {
        self.stage
    }

    pub fn total_amount(&self) -> Decimal {
        self.total_amount
    }

    pub fn total_quantity(&self) -> Option<i64> {
        self.total_quantity
    }

    pub fn members(&self) -> &[CanonicalRecord] {
        &self.members
    }

    pub fn record_count(&self) -> usize {
        self.members.len()
    }

    /// Latest member date, used as the group's transaction date.
    pub fn latest_date(&self) -> Option<NaiveDate> {
        self.members.iter().filter_map(|m| m.date()).max()
    }

    /// Earliest member date.
    pub fn earliest_date(&self) -> Option<NaiveDate> {
        self.members.iter().filter_map(|m| m.date()).min()
    }
}

// ---------------------------------------------------------------------------
// Stage comparison
// ---------------------------------------------------------------------------

/// What a comparison measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measure {
    Amount,
    Quantity,
}

/// Verdict of one stage transition. `Matched` carries no variance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ComparisonOutcome {
    Matched,
    PartialMatched { variance: Decimal },
    Mismatched { variance: Decimal },
    MissingReference { variance: Decimal },
}

impl ComparisonOutcome {
    pub fn variance(&self) -> Decimal {
        match self {
            Self::Matched => Decimal::ZERO,
            Self::PartialMatched { variance }
            | Self::Mismatched { variance }
            | Self::MissingReference { variance } => *variance,
        }
    }

    pub fn is_matched(&self) -> bool {
        matches!(self, Self::Matched)
    }
}

/// Result of comparing one stage against the next for one group key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageComparison {
    pub upstream: StageRole,
    pub downstream: StageRole,
    pub measure: Measure,
    pub expected: Option<Decimal>,
    pub found: Option<Decimal>,
    #[serde(flatten)]
    pub outcome: ComparisonOutcome,
    pub diagnostic: String,
}

impl StageComparison {
    pub fn variance(&self) -> Decimal {
        self.outcome.variance()
    }

    pub fn is_matched(&self) -> bool {
        self.outcome.is_matched()
    }

    /// Re-read a mismatch as a partial fulfilment. Returns a new comparison;
    /// `self` is left untouched.
    pub fn as_partial(&self, note: &str) -> StageComparison {
        StageComparison {
            outcome: ComparisonOutcome::PartialMatched {
                variance: self.variance(),
            },
            diagnostic: format!("{} ({note})", self.diagnostic),
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Fixed exception taxonomy, declared in priority order (highest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExceptionCategory {
    DuplicateDetected,
    MasterMappingIncomplete,
    ReferenceMismatch,
    QuantityDiscrepancy,
    PriceDiscrepancy,
    AmountDiscrepancy,
    CurrencyMismatch,
    MissingReference,
    SupplierMismatch,
    DateDiscrepancy,
    ApprovalViolation,
    MissingFields,
    PartialDeliveryOrSplit,
    NoException,
}

impl ExceptionCategory {
    pub fn matching_status(&self) -> MatchingStatus {
        match self {
            Self::NoException => MatchingStatus::Matched,
            Self::PartialDeliveryOrSplit => MatchingStatus::PartialMatched,
            _ => MatchingStatus::Mismatched,
        }
    }
}

impl fmt::Display for ExceptionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DuplicateDetected => "duplicateDetected",
            Self::MasterMappingIncomplete => "masterMappingIncomplete",
            Self::ReferenceMismatch => "referenceMismatch",
            Self::QuantityDiscrepancy => "quantityDiscrepancy",
            Self::PriceDiscrepancy => "priceDiscrepancy",
            Self::AmountDiscrepancy => "amountDiscrepancy",
            Self::CurrencyMismatch => "currencyMismatch",
            Self::MissingReference => "missingReference",
            Self::SupplierMismatch => "supplierMismatch",
            Self::DateDiscrepancy => "dateDiscrepancy",
            Self::ApprovalViolation => "approvalViolation",
            Self::MissingFields => "missingFields",
            Self::PartialDeliveryOrSplit => "partialDeliveryOrSplit",
            Self::NoException => "noException",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchingStatus {
    Matched,
    PartialMatched,
    Mismatched,
    /// Placeholder for a group whose processing raised an error.
    Failed,
}

impl fmt::Display for MatchingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matched => write!(f, "matched"),
            Self::PartialMatched => write!(f, "partialMatched"),
            Self::Mismatched => write!(f, "mismatched"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Classifier output for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub variance: Decimal,
    pub category: ExceptionCategory,
    pub description: String,
}

impl Classification {
    pub fn status(&self) -> MatchingStatus {
        self.category.matching_status()
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// The externally emitted record for one group.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub unique_key: String,
    pub group_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub reconciliation_type: ReconciliationType,
    pub reconciliation_sub_type: ReconciliationSubType,
    pub matching_status: MatchingStatus,
    pub variance_amount: Decimal,
    pub exception_category: Option<ExceptionCategory>,
    pub exception_description: String,
    pub stage_amounts: BTreeMap<StageRole, Decimal>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub stage_quantities: BTreeMap<StageRole, i64>,
    pub record_counts: BTreeMap<StageRole, usize>,
    pub comparisons: Vec<StageComparison>,
}

/// Job progress across chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkJob {
    pub job_id: String,
    pub total_chunks: u64,
    pub completed_chunks: u64,
    pub failed_chunks: u64,
    pub status: JobStatus,
}

impl ChunkJob {
    pub fn accounted(&self) -> u64 {
        self.completed_chunks + self.failed_chunks
    }

    pub fn all_chunks_accounted(&self) -> bool {
        self.accounted() >= self.total_chunks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => write!(f, "inProgress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk report
// ---------------------------------------------------------------------------

/// How one group left the chunk.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GroupOutcome {
    Published {
        result: ReconciliationResult,
    },
    Dropped {
        unique_key: String,
        reason: DropReason,
    },
    /// Processing raised an error; a `Failed` placeholder was emitted in its
    /// place when possible.
    Failed {
        group_key: String,
        error: String,
        placeholder_published: bool,
    },
    PublishFailed {
        unique_key: String,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    DuplicateKey,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkSummary {
    pub total_groups: usize,
    pub matched: usize,
    pub partial_matched: usize,
    pub mismatched: usize,
    pub failed: usize,
    pub published: usize,
    pub dropped_duplicates: usize,
    pub publish_failures: usize,
    pub category_counts: BTreeMap<String, usize>,
}

/// Everything one chunk run produced.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkReport {
    pub tenant_id: String,
    pub reconciliation_type: ReconciliationType,
    pub reconciliation_sub_type: ReconciliationSubType,
    /// False when no pipeline is configured for the type/sub-type pair.
    pub supported: bool,
    pub summary: ChunkSummary,
    pub groups: Vec<GroupOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn rounding_is_midpoint_away_from_zero() {
        assert_eq!(round_money(d("0.005")), d("0.01"));
        assert_eq!(round_money(d("-0.005")), d("-0.01"));
        assert_eq!(round_money(d("12.344")), d("12.34"));
    }

    #[test]
    fn category_priority_order() {
        assert!(ExceptionCategory::DuplicateDetected < ExceptionCategory::QuantityDiscrepancy);
        assert!(ExceptionCategory::AmountDiscrepancy < ExceptionCategory::MissingReference);
        assert!(ExceptionCategory::PartialDeliveryOrSplit < ExceptionCategory::NoException);
    }

    #[test]
    fn category_drives_status() {
        assert_eq!(ExceptionCategory::NoException.matching_status(), MatchingStatus::Matched);
        assert_eq!(
            ExceptionCategory::PartialDeliveryOrSplit.matching_status(),
            MatchingStatus::PartialMatched
        );
        assert_eq!(
            ExceptionCategory::SupplierMismatch.matching_status(),
            MatchingStatus::Mismatched
        );
    }

    #[test]
    fn raw_text_stringifies_scalars() {
        let raw = RawRecord::from(serde_json::json!({
            "a": " x ",
            "b": 12.5,
            "c": true,
            "d": null,
            "e": ""
        }));
        assert_eq!(raw.text("a").as_deref(), Some("x"));
        assert_eq!(raw.text("b").as_deref(), Some("12.5"));
        assert_eq!(raw.text("c").as_deref(), Some("true"));
        assert_eq!(raw.text("d"), None);
        assert_eq!(raw.text("e"), None);
        assert_eq!(raw.text("missing"), None);
    }

    #[test]
    fn group_key_display() {
        let key = GroupKey::new("BR01")
            .with_date(NaiveDate::from_ymd_opt(2026, 1, 15).unwrap())
            .with_channel("credit_card");
        assert_eq!(key.to_string(), "BR01/2026-01-15/credit_card");
        assert_eq!(GroupKey::new("").to_string(), "<unmapped>");
    }

    #[test]
    fn comparison_serializes_status_tag() {
        let c = StageComparison {
            upstream: StageRole::Sales,
            downstream: StageRole::Payment,
            measure: Measure::Amount,
            expected: Some(d("10.00")),
            found: Some(d("9.00")),
            outcome: ComparisonOutcome::Mismatched { variance: d("1.00") },
            diagnostic: "Expected: 10.00, Found: 9.00".into(),
        };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["status"], "mismatched");
        assert_eq!(v["variance"], "1.00");
        assert_eq!(v["upstream"], "sales");
    }
}
