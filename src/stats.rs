//! Who decided what, and how much is left.

use crate::item::{Filter, ItemKind, ReviewStatus};
use crate::store::RecordStore;
use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Bucket for decisions that carry no reviewer.
pub const UNKNOWN_REVIEWER: &str = "__unknown__";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Decision tallies for one reviewer.
pub struct ReviewerStats {
    /// Reviewer id, or [`UNKNOWN_REVIEWER`].
    pub reviewer: String,
    /// Items approved.
    pub approved: usize,
    /// Items rejected.
    pub rejected: usize,
    /// Items sent back for a replacement asset.
    pub needs_replacement: usize,
}

impl ReviewerStats {
    /// Total decisions.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.approved
            .saturating_add(self.rejected)
            .saturating_add(self.needs_replacement)
    }
}

/// Per-reviewer tallies over decided items, most approvals first.
///
/// # Errors
/// Returns an error if the store cannot be read.
pub fn decision_stats<S: RecordStore + ?Sized>(
    store: &S,
    kind: Option<ItemKind>,
) -> anyhow::Result<Vec<ReviewerStats>> {
    let decided = store
        .query(&Filter::Decided.and_kind(kind), None)
        .context("read decided items")?;

    let mut by_reviewer: BTreeMap<String, ReviewerStats> = BTreeMap::new();
    for item in decided {
        let reviewer = item
            .decided_by
            .unwrap_or_else(|| UNKNOWN_REVIEWER.to_string());
        let entry = by_reviewer
            .entry(reviewer.clone())
            .or_insert_with(|| ReviewerStats {
                reviewer,
                ..ReviewerStats::default()
            });
        let slot = match item.review_status {
            ReviewStatus::Approved => &mut entry.approved,
            ReviewStatus::Rejected => &mut entry.rejected,
            ReviewStatus::NeedsReplacement => &mut entry.needs_replacement,
            ReviewStatus::Unset => continue,
        };
        *slot = slot.saturating_add(1);
    }

    let mut rows: Vec<ReviewerStats> = by_reviewer.into_values().collect();
    rows.sort_by(|a, b| {
        b.approved
            .cmp(&a.approved)
            .then_with(|| a.reviewer.cmp(&b.reviewer))
    });
    Ok(rows)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
/// Queue totals at one instant.
pub struct QueueSummary {
    /// Items awaiting a decision ("left to review").
    pub remaining: usize,
    /// Undecided items with a live lease at the time of the summary.
    pub locked: usize,
    /// Items with a decision.
    pub decided: usize,
}

/// Count remaining, currently locked and decided items.
///
/// # Errors
/// Returns an error if the store cannot be read.
pub fn queue_summary<S: RecordStore + ?Sized>(
    store: &S,
    kind: Option<ItemKind>,
    now: OffsetDateTime,
) -> anyhow::Result<QueueSummary> {
    let unset = Filter::Status(ReviewStatus::Unset).and_kind(kind);
    Ok(QueueSummary {
        remaining: store.count(&unset).context("count remaining items")?,
        locked: store
            .count(&unset.and(Filter::locked_at(now)))
            .context("count locked items")?,
        decided: store
            .count(&Filter::Decided.and_kind(kind))
            .context("count decided items")?,
    })
}
