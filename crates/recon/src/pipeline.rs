//! Stage chain for one group key.
//!
//! Walks the configured stage sequence, comparing each stage against the last
//! stage that had data. Nothing here halts on a disagreement: every adjacent
//! pair is compared and the full comparison trail goes to the classifier.

use crate::config::ToleranceConfig;
use crate::error::ReconError;
use crate::matcher::{compare, compare_quantity, StagePair};
use crate::model::{
    round_money, AggregatedGroup, CanonicalRecord, ComparisonOutcome, GroupKey, Measure,
    StageComparison, StageRole,
};

/// One position in the chain and whatever the ledger reported for it.
#[derive(Debug, Clone)]
pub struct StageSlot {
    pub role: StageRole,
    pub source: String,
    pub group: Option<AggregatedGroup>,
}

/// Everything known about one group after the chain has run.
#[derive(Debug, Clone)]
pub struct GroupEvidence {
    pub group_key: GroupKey,
    pub stages: Vec<StageSlot>,
    pub comparisons: Vec<StageComparison>,
}

impl GroupEvidence {
    pub fn group(&self, role: StageRole) -> Option<&AggregatedGroup> {
        self.stages
            .iter()
            .find(|s| s.role == role)
            .and_then(|s| s.group.as_ref())
    }

    /// Present stage groups in chain order.
    pub fn present(&self) -> impl Iterator<Item = &AggregatedGroup> {
        self.stages.iter().filter_map(|s| s.group.as_ref())
    }

    pub fn members(&self) -> impl Iterator<Item = &CanonicalRecord> {
        self.present().flat_map(|g| g.members())
    }

    /// Latest document date across every stage.
    pub fn latest_date(&self) -> Option<chrono::NaiveDate> {
        self.present().filter_map(|g| g.latest_date()).max()
    }
}

/// Run the stage chain for one group key.
pub fn reconcile_group(
    group_key: GroupKey,
    stages: Vec<StageSlot>,
    tolerance: &ToleranceConfig,
) -> Result<GroupEvidence, ReconError> {
    let mut comparisons = Vec::new();
    let mut carried = stages.first().and_then(|s| s.group.as_ref()).map(|_| 0usize);

    for i in 1..stages.len() {
        let found = stages[i].group.as_ref();
        let upstream_idx = carried.unwrap_or(0);
        let expected = carried.and_then(|c| stages[c].group.as_ref());
        if expected.is_none() && found.is_none() {
            continue;
        }

        let pair = StagePair::new(stages[upstream_idx].role, stages[i].role);
        comparisons.push(compare(pair, expected, found, tolerance)?);
        if let Some(q) = compare_quantity(pair, expected, found, tolerance)? {
            comparisons.push(q);
        }

        if found.is_some() {
            carried = Some(i);
        }
    }

    let comparisons = apply_split_rule(&stages, comparisons);

    Ok(GroupEvidence {
        group_key,
        stages,
        comparisons,
    })
}

/// Re-read head shortfalls as partial fulfilment.
///
/// For a procurement chain headed by the PO where every stage has data and
/// every downstream pairing agrees, the head mismatches become
/// `PartialMatched` when the later stages fall short of the order. With
/// quantities on both sides the shortfall must be in quantity and the unit
/// price must hold, so a full delivery at the wrong price stays a mismatch.
/// Anything else is returned untouched.
fn apply_split_rule(stages: &[StageSlot], comparisons: Vec<StageComparison>) -> Vec<StageComparison> {
    let Some(head) = stages.first() else {
        return comparisons;
    };
    if head.role != StageRole::Po || stages.iter().any(|s| s.group.is_none()) {
        return comparisons;
    }

    let is_head = |c: &StageComparison| c.upstream == head.role;
    let downstream_agree = comparisons
        .iter()
        .filter(|&c| !is_head(c))
        .all(StageComparison::is_matched);
    let short = |c: &StageComparison| match c.outcome {
        ComparisonOutcome::Mismatched { variance } => variance.is_sign_positive(),
        _ => false,
    };
    let head_quantities: Vec<_> = comparisons
        .iter()
        .filter(|&c| is_head(c) && c.measure == Measure::Quantity)
        .collect();
    let head_short = if head_quantities.is_empty() {
        comparisons
            .iter()
            .filter(|&c| is_head(c))
            .all(|c| c.is_matched() || short(c))
    } else {
        head_quantities.iter().all(|q| short(*q))
            && comparisons
                .iter()
                .filter(|&c| is_head(c) && c.measure == Measure::Amount)
                .all(|a| same_unit_price(a, &head_quantities))
    };
    let any_short = comparisons.iter().any(|c| is_head(c) && !c.is_matched());

    if !(downstream_agree && head_short && any_short) {
        return comparisons;
    }

    let note = format!(
        "{} of {} fulfilled so far",
        stages
            .get(1)
            .and_then(|s| s.group.as_ref())
            .map(describe_total)
            .unwrap_or_default(),
        head.group.as_ref().map(describe_total).unwrap_or_default(),
    );

    comparisons
        .iter()
        .map(|c| {
            if is_head(c) && !c.is_matched() {
                c.as_partial(&note)
            } else {
                c.clone()
            }
        })
        .collect()
}

/// `expected_amount / expected_qty == found_amount / found_qty` for the
/// quantity comparison on the same stage pair, checked by cross-multiplying.
fn same_unit_price(amount: &StageComparison, quantities: &[&StageComparison]) -> bool {
    let Some(qty) = quantities.iter().find(|q| q.downstream == amount.downstream) else {
        return false;
    };
    let (Some(ea), Some(fa), Some(eq), Some(fq)) = (amount.expected, amount.found, qty.expected, qty.found) else {
        return false;
    };
    match (ea.checked_mul(fq), fa.checked_mul(eq)) {
        (Some(l), Some(r)) => round_money(l) == round_money(r),
        _ => false,
    }
}

fn describe_total(group: &AggregatedGroup) -> String {
    match group.total_quantity() {
        Some(q) => format!("{q} units"),
        None => group.total_amount().normalize().to_string(),
    }
}
