use crate::model::{ChunkSummary, GroupOutcome, MatchingStatus};

/// Summarise one chunk's group outcomes.
///
/// Status and category counts cover the results this run published; dropped
/// duplicates were published by an earlier delivery of the same chunk.
pub fn compute_summary(groups: &[GroupOutcome]) -> ChunkSummary {
    let mut summary = ChunkSummary {
        total_groups: groups.len(),
        ..ChunkSummary::default()
    };

    for outcome in groups {
        match outcome {
            GroupOutcome::Published { result } => {
                summary.published += 1;
                match result.matching_status {
                    MatchingStatus::Matched => summary.matched += 1,
                    MatchingStatus::PartialMatched => summary.partial_matched += 1,
                    MatchingStatus::Mismatched => summary.mismatched += 1,
                    MatchingStatus::Failed => summary.failed += 1,
                }
                if let Some(category) = result.exception_category {
                    *summary
                        .category_counts
                        .entry(category.to_string())
                        .or_insert(0) += 1;
                }
            }
            GroupOutcome::Dropped { .. } => summary.dropped_duplicates += 1,
            GroupOutcome::Failed { .. } => summary.failed += 1,
            GroupOutcome::PublishFailed { .. } => summary.publish_failures += 1,
        }
    }

    summary
}
