use std::collections::BTreeMap;

use crate::error::ReconError;
use crate::model::{AggregatedGroup, CanonicalRecord, GroupKey, StageRole};

/// Per-group aggregation result. Overflow is scoped to the group it happened in.
pub type GroupTotals = BTreeMap<GroupKey, Result<AggregatedGroup, ReconError>>;

/// Group one stage's records by exact group key and sum them.
///
/// Excluded records are skipped entirely. A group whose sum overflows becomes
/// an error entry for that key only.
pub fn aggregate(stage: StageRole, records: Vec<CanonicalRecord>) -> GroupTotals {
    let mut buckets: BTreeMap<GroupKey, Vec<CanonicalRecord>> = BTreeMap::new();
    for record in records {
        if record.excluded {
            continue;
        }
        buckets
            .entry(record.group_key.clone())
            .or_default()
            .push(record);
    }

    buckets
        .into_iter()
        .map(|(key, members)| {
            let group = AggregatedGroup::from_members(key.clone(), stage, members).ok_or_else(|| {
                ReconError::AmountOverflow {
                    group: key.to_string(),
                    stage: stage.to_string(),
                }
            });
            (key, group)
        })
        .collect()
}
