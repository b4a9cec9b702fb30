use std::collections::{BTreeSet, HashSet};

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::model::{
    round_money, CanonicalRecord, Classification, ComparisonOutcome, ExceptionCategory, Measure,
    StageComparison, StageRole,
};
use crate::pipeline::GroupEvidence;

/// Classify one group's evidence into a single exception category.
///
/// Rules are checked in taxonomy priority order and the first hit wins. The
/// reported variance does not depend on which rule fired: it is always the
/// largest unresolved amount variance in the comparison trail.
pub fn classify(evidence: &GroupEvidence) -> Classification {
    let (category, headline) = detect(evidence);
    let variance = reported_variance(&evidence.comparisons);

    let trail: Vec<String> = evidence
        .comparisons
        .iter()
        .filter(|c| !c.is_matched())
        .map(describe_comparison)
        .collect();
    let description = if trail.is_empty() {
        headline
    } else {
        format!("{headline} | {}", trail.join("; "))
    };

    Classification {
        variance,
        category,
        description,
    }
}

/// Largest-magnitude variance among amount comparisons that did not match.
/// Sign is preserved; on equal magnitude the earlier comparison wins.
pub fn reported_variance(comparisons: &[StageComparison]) -> Decimal {
    let mut best = Decimal::ZERO;
    for c in comparisons {
        if c.measure != Measure::Amount || c.is_matched() {
            continue;
        }
        if c.variance().abs() > best.abs() {
            best = c.variance();
        }
    }
    round_money(best)
}

fn detect(ev: &GroupEvidence) -> (ExceptionCategory, String) {
    use ExceptionCategory::*;

    if let Some(msg) = duplicate_reference(ev) {
        return (DuplicateDetected, msg);
    }
    if ev.group_key.is_unmapped() {
        return (
            MasterMappingIncomplete,
            "records could not be mapped to a group key".to_string(),
        );
    }
    if let Some(msg) = foreign_reference(ev) {
        return (ReferenceMismatch, msg);
    }

    let unresolved = |measure: Measure| {
        ev.comparisons.iter().filter(move |c| {
            c.measure == measure && matches!(c.outcome, ComparisonOutcome::Mismatched { .. })
        })
    };

    if let Some(c) = unresolved(Measure::Quantity).next() {
        return (
            QuantityDiscrepancy,
            format!("{} quantity differs from {}", c.downstream, c.upstream),
        );
    }
    if let Some(c) = unresolved(Measure::Amount).find(|a| quantities_agree(ev, a)) {
        return (
            PriceDiscrepancy,
            format!(
                "{} quantities agree with {} but amounts differ",
                c.downstream, c.upstream
            ),
        );
    }
    if let Some(c) = unresolved(Measure::Amount).next() {
        return (
            AmountDiscrepancy,
            format!("{} amount differs from {}", c.downstream, c.upstream),
        );
    }
    if let Some(msg) = distinct_values(ev, |m| m.currency.as_deref(), "currencies") {
        return (CurrencyMismatch, msg);
    }
    if let Some(c) = ev
        .comparisons
        .iter()
        .find(|c| matches!(c.outcome, ComparisonOutcome::MissingReference { .. }))
    {
        let absent = if c.found.is_none() {
            c.downstream
        } else {
            c.upstream
        };
        return (MissingReference, format!("no {absent} records for this group"));
    }
    if let Some(msg) = distinct_values(ev, |m| m.supplier.as_deref(), "suppliers") {
        return (SupplierMismatch, msg);
    }
    if let Some(msg) = backdated_stage(ev) {
        return (DateDiscrepancy, msg);
    }
    if let Some(m) = ev.members().find(|m| m.approved == Some(false)) {
        return (
            ApprovalViolation,
            format!("{} record '{}' is not approved", m.stage, m.reference_id),
        );
    }
    if let Some(m) = ev.members().find(|m| !m.missing_fields.is_empty()) {
        return (
            MissingFields,
            format!(
                "{} record '{}' is missing {}",
                m.stage,
                m.reference_id,
                m.missing_fields.join(", ")
            ),
        );
    }
    if ev
        .comparisons
        .iter()
        .any(|c| matches!(c.outcome, ComparisonOutcome::PartialMatched { .. }))
    {
        return (
            PartialDeliveryOrSplit,
            "partially fulfilled: downstream documents agree but fall short of the order"
                .to_string(),
        );
    }

    (NoException, "all stages agree".to_string())
}

/// Two records in one stage sharing a reference and line. Without a line
/// number, a reference equal to the group key is the document itself and
/// repeats on each of its lines.
fn duplicate_reference(ev: &GroupEvidence) -> Option<String> {
    for group in ev.present() {
        let mut seen = HashSet::new();
        for m in group.members() {
            if m.reference_id.is_empty() {
                continue;
            }
            if m.line.is_none() && m.reference_id == ev.group_key.key {
                continue;
            }
            if !seen.insert((m.reference_id.as_str(), m.line.as_deref())) {
                let line = m
                    .line
                    .as_deref()
                    .map(|l| format!(" line {l}"))
                    .unwrap_or_default();
                return Some(format!(
                    "{} reference '{}'{line} appears more than once",
                    group.stage(),
                    m.reference_id
                ));
            }
        }
    }
    None
}

fn foreign_reference(ev: &GroupEvidence) -> Option<String> {
    ev.members().find_map(|m| match m.upstream_ref {
        Some(ref r) if *r != ev.group_key.key => Some(format!(
            "{} record '{}' references '{r}', expected '{}'",
            m.stage, m.reference_id, ev.group_key.key
        )),
        _ => None,
    })
}

/// True when the same stage pair also has a quantity comparison that matched.
fn quantities_agree(ev: &GroupEvidence, amount: &StageComparison) -> bool {
    ev.comparisons.iter().any(|q| {
        q.measure == Measure::Quantity
            && q.upstream == amount.upstream
            && q.downstream == amount.downstream
            && q.is_matched()
    })
}

fn distinct_values<'a>(
    ev: &'a GroupEvidence,
    value: impl Fn(&'a CanonicalRecord) -> Option<&'a str>,
    label: &str,
) -> Option<String> {
    let seen: BTreeSet<&str> = ev.members().filter_map(value).collect();
    if seen.len() > 1 {
        let list: Vec<&str> = seen.into_iter().collect();
        Some(format!("{label} differ across stages: {}", list.join(", ")))
    } else {
        None
    }
}

/// A downstream document dated before the upstream one it answers.
fn backdated_stage(ev: &GroupEvidence) -> Option<String> {
    let mut previous: Option<(StageRole, NaiveDate)> = None;
    for group in ev.present() {
        let Some(date) = group.earliest_date() else {
            continue;
        };
        if let Some((role, upstream_date)) = previous {
            if date < upstream_date {
                return Some(format!(
                    "{} dated {date} before {role} dated {upstream_date}",
                    group.stage()
                ));
            }
        }
        previous = Some((group.stage(), date));
    }
    None
}

fn describe_comparison(c: &StageComparison) -> String {
    let measure = match c.measure {
        Measure::Amount => "amount",
        Measure::Quantity => "quantity",
    };
    format!("{}->{} {measure}: {}", c.upstream, c.downstream, c.diagnostic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToleranceConfig;
    use crate::model::{AggregatedGroup, GroupKey, MatchingStatus, RawRecord};
    use crate::pipeline::{reconcile_group, StageSlot};
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn rec(stage: StageRole, amount: &str, qty: Option<i64>, reference: &str) -> CanonicalRecord {
        CanonicalRecord {
            group_key: GroupKey::new("PO-1"),
            stage,
            source: stage.to_string(),
            amount: d(amount),
            quantity: qty,
            unit_price: None,
            timestamp: None,
            reference_id: reference.to_string(),
            line: None,
            upstream_ref: None,
            currency: None,
            supplier: None,
            approved: None,
            excluded: false,
            missing_fields: Vec::new(),
            raw: RawRecord::default(),
        }
    }

    fn dated(mut r: CanonicalRecord, day: u32) -> CanonicalRecord {
        r.timestamp = NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(9, 0, 0);
        r
    }

    fn slot(role: StageRole, members: Vec<CanonicalRecord>) -> StageSlot {
        let group = if members.is_empty() {
            None
        } else {
            AggregatedGroup::from_members(GroupKey::new("PO-1"), role, members)
        };
        StageSlot {
            role,
            source: role.to_string(),
            group,
        }
    }

    fn evidence(key: GroupKey, stages: Vec<StageSlot>) -> GroupEvidence {
        reconcile_group(key, stages, &ToleranceConfig::default()).unwrap()
    }

    fn classify_stages(stages: Vec<StageSlot>) -> Classification {
        classify(&evidence(GroupKey::new("PO-1"), stages))
    }

    fn comparison(variance: &str) -> StageComparison {
        StageComparison {
            upstream: StageRole::Sales,
            downstream: StageRole::Payment,
            measure: Measure::Amount,
            expected: None,
            found: None,
            outcome: ComparisonOutcome::Mismatched { variance: d(variance) },
            diagnostic: String::new(),
        }
    }

    #[test]
    fn larger_magnitude_variance_wins() {
        let cs = vec![comparison("5.00"), comparison("-12.00")];
        assert_eq!(reported_variance(&cs), d("-12.00"));
    }

    #[test]
    fn variance_tie_keeps_earliest() {
        let cs = vec![comparison("-7.00"), comparison("7.00")];
        assert_eq!(reported_variance(&cs), d("-7.00"));
    }

    #[test]
    fn quantity_variance_not_reported_as_money() {
        let mut q = comparison("40");
        q.measure = Measure::Quantity;
        assert_eq!(reported_variance(&[q, comparison("3.50")]), d("3.50"));
    }

    #[test]
    fn agreeing_chain_is_matched() {
        let c = classify_stages(vec![
            slot(StageRole::Sales, vec![rec(StageRole::Sales, "100.00", None, "s1")]),
            slot(StageRole::Payment, vec![rec(StageRole::Payment, "100.00", None, "p1")]),
        ]);
        assert_eq!(c.category, ExceptionCategory::NoException);
        assert_eq!(c.status(), MatchingStatus::Matched);
        assert_eq!(c.variance, Decimal::ZERO);
        assert_eq!(c.description, "all stages agree");
    }

    #[test]
    fn amount_discrepancy_reports_largest_variance() {
        let c = classify_stages(vec![
            slot(StageRole::Sales, vec![rec(StageRole::Sales, "100.00", None, "s1")]),
            slot(StageRole::Payment, vec![rec(StageRole::Payment, "95.00", None, "p1")]),
            slot(StageRole::Erp, vec![rec(StageRole::Erp, "107.00", None, "e1")]),
        ]);
        assert_eq!(c.category, ExceptionCategory::AmountDiscrepancy);
        assert_eq!(c.status(), MatchingStatus::Mismatched);
        assert_eq!(c.variance, d("-12.00"));
        assert!(c.description.contains("sales->payment amount: Expected: 100, Found: 95"));
        assert!(c.description.contains("payment->erp amount: Expected: 95, Found: 107"));
    }

    #[test]
    fn missing_stage_is_missing_reference() {
        let c = classify_stages(vec![
            slot(StageRole::Sales, vec![rec(StageRole::Sales, "250.00", None, "s1")]),
            slot(StageRole::Payment, vec![]),
        ]);
        assert_eq!(c.category, ExceptionCategory::MissingReference);
        assert_eq!(c.variance, d("250.00"));
        assert_eq!(c.status(), MatchingStatus::Mismatched);
    }

    #[test]
    fn duplicate_reference_outranks_everything() {
        let c = classify_stages(vec![
            slot(
                StageRole::Sales,
                vec![
                    rec(StageRole::Sales, "50.00", None, "s1"),
                    rec(StageRole::Sales, "50.00", None, "s1"),
                ],
            ),
            slot(StageRole::Payment, vec![rec(StageRole::Payment, "10.00", None, "p1")]),
        ]);
        assert_eq!(c.category, ExceptionCategory::DuplicateDetected);
        assert_eq!(c.variance, d("90.00"));
    }

    #[test]
    fn multi_line_po_is_not_a_duplicate() {
        let c = classify_stages(vec![
            slot(
                StageRole::Po,
                vec![
                    rec(StageRole::Po, "300", Some(30), "PO-1"),
                    rec(StageRole::Po, "200", Some(10), "PO-1"),
                ],
            ),
            slot(StageRole::Invoice, vec![rec(StageRole::Invoice, "500", Some(40), "INV-1")]),
        ]);
        assert_eq!(c.category, ExceptionCategory::NoException);
        assert_eq!(c.status(), MatchingStatus::Matched);
    }

    #[test]
    fn repeated_line_is_a_duplicate() {
        let line = |n: &str| {
            let mut r = rec(StageRole::Po, "100", Some(10), "PO-1");
            r.line = Some(n.to_string());
            r
        };
        let c = classify_stages(vec![
            slot(StageRole::Po, vec![line("1"), line("2"), line("2")]),
            slot(StageRole::Invoice, vec![rec(StageRole::Invoice, "300", Some(30), "INV-1")]),
        ]);
        assert_eq!(c.category, ExceptionCategory::DuplicateDetected);
        assert!(c.description.starts_with("po reference 'PO-1' line 2 appears more than once"));
    }

    #[test]
    fn unmapped_key() {
        let ev = evidence(
            GroupKey::new(""),
            vec![
                slot(StageRole::Sales, vec![rec(StageRole::Sales, "5.00", None, "s1")]),
                slot(StageRole::Payment, vec![rec(StageRole::Payment, "5.00", None, "p1")]),
            ],
        );
        assert_eq!(classify(&ev).category, ExceptionCategory::MasterMappingIncomplete);
    }

    #[test]
    fn reference_to_another_key() {
        let mut inv = rec(StageRole::Invoice, "100", None, "INV-1");
        inv.upstream_ref = Some("PO-2".into());
        let c = classify_stages(vec![
            slot(StageRole::Po, vec![rec(StageRole::Po, "100", None, "PO-1")]),
            slot(StageRole::Invoice, vec![inv]),
        ]);
        assert_eq!(c.category, ExceptionCategory::ReferenceMismatch);
    }

    #[test]
    fn quantity_then_price() {
        let c = classify_stages(vec![
            slot(StageRole::Grn, vec![rec(StageRole::Grn, "600", Some(60), "g1")]),
            slot(StageRole::Invoice, vec![rec(StageRole::Invoice, "700", Some(70), "i1")]),
        ]);
        assert_eq!(c.category, ExceptionCategory::QuantityDiscrepancy);
        assert_eq!(c.variance, d("-100"));

        let c = classify_stages(vec![
            slot(StageRole::Grn, vec![rec(StageRole::Grn, "600", Some(60), "g1")]),
            slot(StageRole::Invoice, vec![rec(StageRole::Invoice, "660", Some(60), "i1")]),
        ]);
        assert_eq!(c.category, ExceptionCategory::PriceDiscrepancy);
        assert_eq!(c.variance, d("-60"));
    }

    #[test]
    fn currency_and_supplier_disagreement() {
        let mut a = rec(StageRole::Po, "100", None, "PO-1");
        a.currency = Some("USD".into());
        let mut b = rec(StageRole::Invoice, "100", None, "INV-1");
        b.currency = Some("EUR".into());
        let c = classify_stages(vec![slot(StageRole::Po, vec![a]), slot(StageRole::Invoice, vec![b])]);
        assert_eq!(c.category, ExceptionCategory::CurrencyMismatch);
        assert_eq!(c.description, "currencies differ across stages: EUR, USD");

        let mut a = rec(StageRole::Po, "100", None, "PO-1");
        a.supplier = Some("Acme".into());
        let mut b = rec(StageRole::Invoice, "100", None, "INV-1");
        b.supplier = Some("Apex".into());
        let c = classify_stages(vec![slot(StageRole::Po, vec![a]), slot(StageRole::Invoice, vec![b])]);
        assert_eq!(c.category, ExceptionCategory::SupplierMismatch);
    }

    #[test]
    fn backdated_invoice() {
        let c = classify_stages(vec![
            slot(StageRole::Po, vec![dated(rec(StageRole::Po, "100", None, "PO-1"), 10)]),
            slot(StageRole::Invoice, vec![dated(rec(StageRole::Invoice, "100", None, "INV-1"), 4)]),
        ]);
        assert_eq!(c.category, ExceptionCategory::DateDiscrepancy);
        assert_eq!(c.description, "invoice dated 2026-03-04 before po dated 2026-03-10");
    }

    #[test]
    fn approval_then_missing_fields() {
        let mut po = rec(StageRole::Po, "100", None, "PO-1");
        po.approved = Some(false);
        po.missing_fields = vec!["buyer".into()];
        let c = classify_stages(vec![
            slot(StageRole::Po, vec![po.clone()]),
            slot(StageRole::Invoice, vec![rec(StageRole::Invoice, "100", None, "INV-1")]),
        ]);
        assert_eq!(c.category, ExceptionCategory::ApprovalViolation);

        po.approved = Some(true);
        let c = classify_stages(vec![
            slot(StageRole::Po, vec![po]),
            slot(StageRole::Invoice, vec![rec(StageRole::Invoice, "100", None, "INV-1")]),
        ]);
        assert_eq!(c.category, ExceptionCategory::MissingFields);
        assert_eq!(c.description, "po record 'PO-1' is missing buyer");
    }

    #[test]
    fn full_delivery_at_wrong_price_is_price_discrepancy() {
        let c = classify_stages(vec![
            slot(StageRole::Po, vec![rec(StageRole::Po, "1000", Some(100), "PO-1")]),
            slot(StageRole::Grn, vec![rec(StageRole::Grn, "900", Some(100), "GRN-1")]),
            slot(StageRole::Invoice, vec![rec(StageRole::Invoice, "900", Some(100), "INV-1")]),
        ]);
        assert_eq!(c.category, ExceptionCategory::PriceDiscrepancy);
        assert_eq!(c.status(), MatchingStatus::Mismatched);
        assert_eq!(c.variance, d("100.00"));
    }

    #[test]
    fn split_delivery_in_progress_then_complete() {
        // Day 5: 60 of 100 received and invoiced.
        let po = dated(rec(StageRole::Po, "1000", Some(100), "PO-1"), 1);
        let grn1 = dated(rec(StageRole::Grn, "600", Some(60), "GRN-1"), 3);
        let inv1 = dated(rec(StageRole::Invoice, "600", Some(60), "INV-1"), 5);
        let c = classify_stages(vec![
            slot(StageRole::Po, vec![po.clone()]),
            slot(StageRole::Grn, vec![grn1.clone()]),
            slot(StageRole::Invoice, vec![inv1.clone()]),
        ]);
        assert_eq!(c.category, ExceptionCategory::PartialDeliveryOrSplit);
        assert_eq!(c.status(), MatchingStatus::PartialMatched);
        assert_eq!(c.variance, d("400.00"));

        // Day 10: the rest arrives.
        let grn2 = dated(rec(StageRole::Grn, "400", Some(40), "GRN-2"), 8);
        let inv2 = dated(rec(StageRole::Invoice, "400", Some(40), "INV-2"), 10);
        let c = classify_stages(vec![
            slot(StageRole::Po, vec![po]),
            slot(StageRole::Grn, vec![grn1, grn2]),
            slot(StageRole::Invoice, vec![inv1, inv2]),
        ]);
        assert_eq!(c.category, ExceptionCategory::NoException);
        assert_eq!(c.status(), MatchingStatus::Matched);
        assert_eq!(c.variance, d("0.00"));
    }
}
