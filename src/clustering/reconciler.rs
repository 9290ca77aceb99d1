//! Coverage reconciliation
//!
//! Every eligible record of a unit must land in exactly one group. The
//! capability's proposal is normalized against the full eligible id set and
//! whatever it left out goes into a residual group ranked last.

use super::schema::ProposedGroup;
use super::ClusterUnit;
use crate::types::{FeedbackId, GroupId, ProcessingStatus, ReviewGroup};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::debug;

pub const RESIDUAL_TITLE: &str = "Uncategorized residual issues";

const RESIDUAL_ROOT_CAUSE: &str =
    "Feedback the clustering pass did not assign to any representative issue.";
const RESIDUAL_ACTION: &str =
    "Review these records manually; recurring themes may need their own group.";

/// Percentage of `count` in `total`, rounded to 2 decimals; 0 when `total` is 0
pub fn percentage(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(count as f64 / total as f64 * 100.0)
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Normalize `proposed` against `all_ids` and close the coverage gap
///
/// Groups are taken in rank order. An id claimed by several groups stays in
/// the best-ranked one, ids outside `all_ids` are dropped, groups left empty
/// disappear, and ranks are renumbered from 1. Counts and percentages are
/// recomputed from membership over `|all_ids|`.
pub fn reconcile(
    all_ids: &BTreeSet<FeedbackId>,
    mut proposed: Vec<ProposedGroup>,
    unit: &ClusterUnit,
    now: DateTime<Utc>,
) -> Vec<ReviewGroup> {
    proposed.sort_by_key(|g| g.rank);

    let total = all_ids.len();
    let mut assigned: BTreeSet<FeedbackId> = BTreeSet::new();
    let mut groups: Vec<ReviewGroup> = Vec::with_capacity(proposed.len() + 1);

    for group in proposed {
        let members: BTreeSet<FeedbackId> = group
            .review_ids
            .iter()
            .copied()
            .filter(|id| all_ids.contains(id) && !assigned.contains(id))
            .collect();

        if members.is_empty() {
            debug!("Dropping empty group '{}' for {}", group.title, unit.key());
            continue;
        }

        assigned.extend(members.iter().copied());
        groups.push(ReviewGroup {
            id: GroupId::new(),
            app_id: unit.app_id.clone(),
            scope: unit.scope.clone(),
            period_key: unit.period_key.clone(),
            title: group.title.trim().to_string(),
            rank: groups.len() as u32 + 1,
            review_count: members.len(),
            percentage: percentage(members.len(), total),
            review_ids: members,
            root_cause_summary: group.root_cause_summary,
            action_suggestion: group.action_suggestion,
            sample_quotes: group.sample_quotes,
            processing_status: ProcessingStatus::Clustered,
            created_at: now,
        });
    }

    let leftover: BTreeSet<FeedbackId> = all_ids.difference(&assigned).copied().collect();
    if !leftover.is_empty() {
        debug!(
            "{} records left unassigned for {}, adding residual group",
            leftover.len(),
            unit.key()
        );
        groups.push(ReviewGroup {
            id: GroupId::new(),
            app_id: unit.app_id.clone(),
            scope: unit.scope.clone(),
            period_key: unit.period_key.clone(),
            title: RESIDUAL_TITLE.to_string(),
            rank: groups.len() as u32 + 1,
            review_count: leftover.len(),
            percentage: percentage(leftover.len(), total),
            review_ids: leftover,
            root_cause_summary: RESIDUAL_ROOT_CAUSE.to_string(),
            action_suggestion: RESIDUAL_ACTION.to_string(),
            sample_quotes: Vec::new(),
            processing_status: ProcessingStatus::Residual,
            created_at: now,
        });
    }

    groups
}
