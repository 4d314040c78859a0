//! Reviewable catalog records, the predicates used to select them, and the patches used
//! to change them.
//!
//! The data invariants live in [`ReviewableItem::apply`], so every store that applies a
//! [`Patch`] through it inherits them:
//! - a decision (status away from `unset`) always clears `locked_until`;
//! - a reset (status back to `unset`) clears `decided_by`/`decided_at` and the lock.

use crate::identity::Reviewer;
use clap::builder::PossibleValue;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// What kind of catalog record is under review.
pub enum ItemKind {
    /// A product description.
    Product,
    /// A category description.
    Category,
    /// A product image.
    Image,
}

impl ItemKind {
    /// Canonical lowercase name, as stored.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Category => "category",
            Self::Image => "image",
        }
    }
}

impl ValueEnum for ItemKind {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Product, Self::Category, Self::Image]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        let pv = match self {
            Self::Product => PossibleValue::new("product").help("Product description"),
            Self::Category => PossibleValue::new("category").help("Category description"),
            Self::Image => PossibleValue::new("image").help("Product image"),
        };
        Some(pv)
    }
}

impl std::str::FromStr for ItemKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            s if s.eq_ignore_ascii_case("product") => Ok(Self::Product),
            s if s.eq_ignore_ascii_case("category") => Ok(Self::Category),
            s if s.eq_ignore_ascii_case("image") => Ok(Self::Image),
            _ => Err(anyhow::anyhow!("invalid ItemKind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Review outcome stored on an item.
pub enum ReviewStatus {
    /// Not decided yet; eligible for the review queue.
    #[default]
    Unset,
    /// Accepted as-is.
    Approved,
    /// Rejected.
    Rejected,
    /// Acceptable text, but the asset must be replaced later.
    NeedsReplacement,
}

impl ReviewStatus {
    /// Canonical lowercase name, as stored.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::NeedsReplacement => "needs_replacement",
        }
    }

    /// Whether a reviewer has decided this item.
    #[must_use]
    pub const fn is_decided(self) -> bool {
        !matches!(self, Self::Unset)
    }
}

impl ValueEnum for ReviewStatus {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            Self::Unset,
            Self::Approved,
            Self::Rejected,
            Self::NeedsReplacement,
        ]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        let pv = match self {
            Self::Unset => PossibleValue::new("unset").help("Awaiting review"),
            Self::Approved => PossibleValue::new("approved").help("Approved"),
            Self::Rejected => PossibleValue::new("rejected").help("Rejected"),
            Self::NeedsReplacement => {
                PossibleValue::new("needs_replacement")
                    .alias("replace_later")
                    .help("Replace the asset later")
            }
        };
        Some(pv)
    }
}

impl std::str::FromStr for ReviewStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            s if s.eq_ignore_ascii_case("unset") => Ok(Self::Unset),
            s if s.eq_ignore_ascii_case("approved") => Ok(Self::Approved),
            s if s.eq_ignore_ascii_case("rejected") => Ok(Self::Rejected),
            s if s.eq_ignore_ascii_case("needs_replacement")
                || s.eq_ignore_ascii_case("replace_later") =>
            {
                Ok(Self::NeedsReplacement)
            }
            _ => Err(anyhow::anyhow!("invalid ReviewStatus: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// A terminal outcome a reviewer can submit.
pub enum Decision {
    /// Approve the item.
    Approved,
    /// Reject the item.
    Rejected,
    /// Keep it out of the queue until the asset is replaced.
    NeedsReplacement,
}

impl Decision {
    /// The status this decision writes.
    #[must_use]
    pub const fn status(self) -> ReviewStatus {
        match self {
            Self::Approved => ReviewStatus::Approved,
            Self::Rejected => ReviewStatus::Rejected,
            Self::NeedsReplacement => ReviewStatus::NeedsReplacement,
        }
    }
}

impl ValueEnum for Decision {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Approved, Self::Rejected, Self::NeedsReplacement]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        let pv = match self {
            Self::Approved => PossibleValue::new("approved").help("Approve"),
            Self::Rejected => PossibleValue::new("rejected").help("Reject"),
            Self::NeedsReplacement => {
                PossibleValue::new("needs_replacement")
                    .alias("replace_later")
                    .help("Replace the asset later")
            }
        };
        Some(pv)
    }
}

impl std::str::FromStr for Decision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<ReviewStatus>()? {
            ReviewStatus::Approved => Ok(Self::Approved),
            ReviewStatus::Rejected => Ok(Self::Rejected),
            ReviewStatus::NeedsReplacement => Ok(Self::NeedsReplacement),
            ReviewStatus::Unset => Err(anyhow::anyhow!("`unset` is not a decision; use reset")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// A catalog record subject to human review.
pub struct ReviewableItem {
    /// Opaque, stable identifier.
    pub id: String,
    /// Record kind.
    pub kind: ItemKind,
    /// Optional display label.
    #[serde(default)]
    pub title: Option<String>,
    /// Advisory lease expiry; `None` or a past instant means unlocked.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub locked_until: Option<OffsetDateTime>,
    /// Review outcome.
    #[serde(default)]
    pub review_status: ReviewStatus,
    /// Reviewer who last set `review_status`.
    #[serde(default)]
    pub decided_by: Option<String>,
    /// When `review_status` was last set.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub decided_at: Option<OffsetDateTime>,
    /// Last write to this record.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ReviewableItem {
    /// A freshly ingested item: undecided, unlocked.
    #[must_use]
    pub fn new(id: String, kind: ItemKind, title: Option<String>, now: OffsetDateTime) -> Self {
        Self {
            id,
            kind,
            title,
            locked_until: None,
            review_status: ReviewStatus::Unset,
            decided_by: None,
            decided_at: None,
            updated_at: now,
        }
    }

    /// Whether a live lease is held on this item at `now`.
    #[must_use]
    pub fn is_locked(&self, now: OffsetDateTime) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// Apply `patch`, then restore the decision/lock invariants.
    pub fn apply(&mut self, patch: &Patch, at: OffsetDateTime) {
        if let Some(locked_until) = patch.locked_until {
            self.locked_until = locked_until;
        }
        if let Some(ref decided_by) = patch.decided_by {
            self.decided_by.clone_from(decided_by);
        }
        if let Some(decided_at) = patch.decided_at {
            self.decided_at = decided_at;
        }
        if let Some(status) = patch.review_status {
            self.review_status = status;
            // A decided item is released; an undecided one forgets who decided it.
            self.locked_until = None;
            if !status.is_decided() {
                self.decided_by = None;
                self.decided_at = None;
            }
        }
        self.updated_at = at;
    }
}

/// Row predicate understood by every [`crate::store::RecordStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Every row.
    All,
    /// `id = ..`
    Id(String),
    /// `review_status = ..`
    Status(ReviewStatus),
    /// `review_status != unset`
    Decided,
    /// `kind = ..`
    Kind(ItemKind),
    /// `decided_by = ..`
    DecidedBy(String),
    /// `locked_until IS NULL`
    Unlocked,
    /// `locked_until <= t` (present and expired at `t`).
    LockExpiredBy(OffsetDateTime),
    /// `locked_until < t` (present and strictly older than `t`).
    LockBefore(OffsetDateTime),
    /// Negation.
    Not(Box<Filter>),
    /// Conjunction; empty means true.
    And(Vec<Filter>),
    /// Disjunction; empty means false.
    Or(Vec<Filter>),
}

impl Filter {
    /// Evaluate against one row.
    #[must_use]
    pub fn matches(&self, item: &ReviewableItem) -> bool {
        match self {
            Self::All => true,
            Self::Id(id) => item.id == *id,
            Self::Status(status) => item.review_status == *status,
            Self::Decided => item.review_status.is_decided(),
            Self::Kind(kind) => item.kind == *kind,
            Self::DecidedBy(reviewer) => item.decided_by.as_deref() == Some(reviewer.as_str()),
            Self::Unlocked => item.locked_until.is_none(),
            Self::LockExpiredBy(t) => item.locked_until.is_some_and(|until| until <= *t),
            Self::LockBefore(t) => item.locked_until.is_some_and(|until| until < *t),
            Self::Not(inner) => !inner.matches(item),
            Self::And(all) => all.iter().all(|f| f.matches(item)),
            Self::Or(any) => any.iter().any(|f| f.matches(item)),
        }
    }

    /// No live lease at `now`: the claim guard.
    #[must_use]
    pub fn lock_free_at(now: OffsetDateTime) -> Self {
        Self::Or(vec![Self::Unlocked, Self::LockExpiredBy(now)])
    }

    /// A live lease is held at `now`.
    #[must_use]
    pub fn locked_at(now: OffsetDateTime) -> Self {
        Self::Not(Box::new(Self::lock_free_at(now)))
    }

    /// Undecided and free to claim at `now`, optionally restricted to one kind.
    #[must_use]
    pub fn claimable(kind: Option<ItemKind>, now: OffsetDateTime) -> Self {
        Self::Status(ReviewStatus::Unset)
            .and(Self::lock_free_at(now))
            .and_kind(kind)
    }

    /// `self AND other`, flattening nested conjunctions.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::All, f) | (f, Self::All) => f,
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), f) => {
                left.push(f);
                Self::And(left)
            }
            (f, Self::And(mut right)) => {
                right.insert(0, f);
                Self::And(right)
            }
            (left, right) => Self::And(vec![left, right]),
        }
    }

    /// Restrict to `kind` when given.
    #[must_use]
    pub fn and_kind(self, kind: Option<ItemKind>) -> Self {
        match kind {
            Some(kind) => self.and(Self::Kind(kind)),
            None => self,
        }
    }
}

/// Field updates for one row. Each outer `None` leaves the field untouched; for nullable
/// fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    /// New `locked_until`.
    pub locked_until: Option<Option<OffsetDateTime>>,
    /// New `review_status`.
    pub review_status: Option<ReviewStatus>,
    /// New `decided_by`.
    pub decided_by: Option<Option<String>>,
    /// New `decided_at`.
    pub decided_at: Option<Option<OffsetDateTime>>,
}

impl Patch {
    /// Set the lease expiry.
    #[must_use]
    pub const fn lock_until(until: OffsetDateTime) -> Self {
        Self {
            locked_until: Some(Some(until)),
            review_status: None,
            decided_by: None,
            decided_at: None,
        }
    }

    /// Clear the lease.
    #[must_use]
    pub const fn release() -> Self {
        Self {
            locked_until: Some(None),
            review_status: None,
            decided_by: None,
            decided_at: None,
        }
    }

    /// Record a decision; releases the lease in the same write.
    #[must_use]
    pub fn decision(decision: Decision, reviewer: &Reviewer, at: OffsetDateTime) -> Self {
        Self {
            locked_until: Some(None),
            review_status: Some(decision.status()),
            decided_by: Some(Some(reviewer.as_str().to_string())),
            decided_at: Some(Some(at)),
        }
    }

    /// Return the item to the queue: undecided, unattributed, unlocked.
    #[must_use]
    pub const fn reset() -> Self {
        Self {
            locked_until: Some(None),
            review_status: Some(ReviewStatus::Unset),
            decided_by: Some(None),
            decided_at: Some(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::parse_ts;
    use anyhow::ensure;
    use time::Duration;

    fn item(now: OffsetDateTime) -> ReviewableItem {
        ReviewableItem::new("sku-1".to_string(), ItemKind::Image, None, now)
    }

    #[test]
    fn expired_lock_is_not_locked() -> anyhow::Result<()> {
        let now = parse_ts("2026-03-02T10:00:00Z")?;
        let mut it = item(now);
        ensure!(!it.is_locked(now));
        it.locked_until = Some(now);
        ensure!(!it.is_locked(now));
        it.locked_until = Some(now + Duration::SECOND);
        ensure!(it.is_locked(now));
        Ok(())
    }

    #[test]
    fn decision_patch_releases_and_attributes() -> anyhow::Result<()> {
        let now = parse_ts("2026-03-02T10:00:00Z")?;
        let mut it = item(now);
        it.apply(&Patch::lock_until(now + Duration::minutes(3)), now);
        ensure!(it.is_locked(now));

        let reviewer = Reviewer::new("anna@example.com")?;
        it.apply(&Patch::decision(Decision::Approved, &reviewer, now), now);
        ensure!(it.review_status == ReviewStatus::Approved);
        ensure!(it.decided_by.as_deref() == Some("anna@example.com"));
        ensure!(it.locked_until.is_none());
        Ok(())
    }

    #[test]
    fn status_change_without_lock_field_still_releases() -> anyhow::Result<()> {
        let now = parse_ts("2026-03-02T10:00:00Z")?;
        let mut it = item(now);
        it.locked_until = Some(now + Duration::minutes(3));
        let patch = Patch {
            review_status: Some(ReviewStatus::Rejected),
            ..Patch::default()
        };
        it.apply(&patch, now);
        ensure!(it.locked_until.is_none());
        Ok(())
    }

    #[test]
    fn reset_clears_attribution() -> anyhow::Result<()> {
        let now = parse_ts("2026-03-02T10:00:00Z")?;
        let mut it = item(now);
        let reviewer = Reviewer::new("anna@example.com")?;
        it.apply(&Patch::decision(Decision::Rejected, &reviewer, now), now);
        it.apply(&Patch::reset(), now + Duration::minutes(1));
        ensure!(it.review_status == ReviewStatus::Unset);
        ensure!(it.decided_by.is_none());
        ensure!(it.decided_at.is_none());
        ensure!(it.updated_at == now + Duration::minutes(1));
        Ok(())
    }

    #[test]
    fn claimable_filter_excludes_live_locks_and_decided() -> anyhow::Result<()> {
        let now = parse_ts("2026-03-02T10:00:00Z")?;
        let filter = Filter::claimable(Some(ItemKind::Image), now);

        let free = item(now);
        ensure!(filter.matches(&free));

        let mut expired = item(now);
        expired.locked_until = Some(now - Duration::SECOND);
        ensure!(filter.matches(&expired));

        let mut held = item(now);
        held.locked_until = Some(now + Duration::SECOND);
        ensure!(!filter.matches(&held));

        let mut decided = item(now);
        decided.review_status = ReviewStatus::Approved;
        ensure!(!filter.matches(&decided));

        let mut product = item(now);
        product.kind = ItemKind::Product;
        ensure!(!filter.matches(&product));
        Ok(())
    }

    #[test]
    fn filter_and_flattens() {
        let f = Filter::Decided
            .and(Filter::All)
            .and(Filter::Kind(ItemKind::Product))
            .and(Filter::Unlocked);
        assert_eq!(
            f,
            Filter::And(vec![
                Filter::Decided,
                Filter::Kind(ItemKind::Product),
                Filter::Unlocked
            ])
        );
    }

    #[test]
    fn decision_parse_refuses_unset() {
        assert!("unset".parse::<Decision>().is_err());
        assert!(matches!(
            "replace_later".parse::<Decision>(),
            Ok(Decision::NeedsReplacement)
        ));
    }

    #[test]
    fn item_json_uses_rfc3339() -> anyhow::Result<()> {
        let now = parse_ts("2026-03-02T10:00:00Z")?;
        let mut it = item(now);
        it.locked_until = Some(now + Duration::minutes(3));
        let raw = serde_json::to_value(&it)?;
        ensure!(raw["locked_until"] == "2026-03-02T10:03:00Z");
        ensure!(raw["review_status"] == "unset");
        let back: ReviewableItem = serde_json::from_value(raw)?;
        ensure!(back == it);
        Ok(())
    }
}
