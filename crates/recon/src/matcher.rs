use rust_decimal::Decimal;

use crate::config::ToleranceConfig;
use crate::error::ReconError;
use crate::model::{round_money, AggregatedGroup, ComparisonOutcome, Measure, StageComparison, StageRole};

/// The two stages a comparison sits between, upstream first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePair {
    pub upstream: StageRole,
    pub downstream: StageRole,
}

impl StagePair {
    pub fn new(upstream: StageRole, downstream: StageRole) -> Self {
        Self {
            upstream,
            downstream,
        }
    }
}

/// Compare two stages' aggregated amounts for one group key.
///
/// Either side may be absent. A missing downstream carries the whole expected
/// total as variance; a missing upstream carries the negated found total.
/// Fails only when the difference leaves the decimal range.
pub fn compare(
    pair: StagePair,
    expected: Option<&AggregatedGroup>,
    found: Option<&AggregatedGroup>,
    tolerance: &ToleranceConfig,
) -> Result<StageComparison, ReconError> {
    judge(
        pair,
        Measure::Amount,
        expected.map(AggregatedGroup::total_amount),
        found.map(AggregatedGroup::total_amount),
        tolerance.amount,
    )
    .ok_or_else(|| overflow(pair, expected.or(found)))
}

/// Compare total quantities. Only meaningful when both stages carry quantities;
/// returns `Ok(None)` otherwise.
pub fn compare_quantity(
    pair: StagePair,
    expected: Option<&AggregatedGroup>,
    found: Option<&AggregatedGroup>,
    tolerance: &ToleranceConfig,
) -> Result<Option<StageComparison>, ReconError> {
    let (Some(e), Some(f)) = (
        expected.and_then(AggregatedGroup::total_quantity),
        found.and_then(AggregatedGroup::total_quantity),
    ) else {
        return Ok(None);
    };
    judge(
        pair,
        Measure::Quantity,
        Some(Decimal::from(e)),
        Some(Decimal::from(f)),
        Decimal::from(tolerance.quantity),
    )
    .map(Some)
    .ok_or_else(|| overflow(pair, expected.or(found)))
}

fn overflow(pair: StagePair, group: Option<&AggregatedGroup>) -> ReconError {
    ReconError::VarianceOverflow {
        group: group.map(|g| g.group_key().to_string()).unwrap_or_default(),
        upstream: pair.upstream.to_string(),
        downstream: pair.downstream.to_string(),
    }
}

/// `None` when `expected - found` overflows.
fn judge(
    pair: StagePair,
    measure: Measure,
    expected: Option<Decimal>,
    found: Option<Decimal>,
    tolerance: Decimal,
) -> Option<StageComparison> {
    let render = |v: Option<Decimal>| v.map_or_else(|| "none".to_string(), |d| d.normalize().to_string());
    let sides = format!("Expected: {}, Found: {}", render(expected), render(found));

    let (outcome, diagnostic) = match (expected, found) {
        (Some(e), None) => (
            ComparisonOutcome::MissingReference { variance: round_money(e) },
            format!("{sides} (no {} records)", pair.downstream),
        ),
        (None, Some(f)) => (
            ComparisonOutcome::MissingReference { variance: round_money(-f) },
            format!("{sides} (no {} records)", pair.upstream),
        ),
        (None, None) => (ComparisonOutcome::Matched, sides),
        (Some(e), Some(f)) => {
            let variance = round_money(e.checked_sub(f)?);
            if variance.is_zero() {
                (ComparisonOutcome::Matched, sides)
            } else if variance.abs() <= tolerance {
                (
                    ComparisonOutcome::Matched,
                    format!("{sides} (within tolerance {tolerance}, absorbed {variance})"),
                )
            } else {
                (ComparisonOutcome::Mismatched { variance }, sides)
            }
        }
    };

    Some(StageComparison {
        upstream: pair.upstream,
        downstream: pair.downstream,
        measure,
        expected,
        found,
        outcome,
        diagnostic,
    })
}
