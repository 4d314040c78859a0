//! Soft reservations on reviewable items.
//!
//! A reservation is nothing more than the `locked_until` timestamp on the record itself.
//! There is no lock table and no coordinator: the record store's conditional update is the
//! only arbiter, and an expired timestamp is as good as none.
//!
//! Lease writes (claim, extend, release) are infrastructure: their failures are logged and
//! folded into the returned outcome, never raised. Decision writes are the opposite: losing
//! a reviewer's verdict silently would be data loss, so they return errors and leave the
//! lease in place for a retry.

use crate::clock::lease_expiry;
use crate::identity::Reviewer;
use crate::item::{Decision, Filter, ItemKind, Patch, ReviewStatus, ReviewableItem};
use crate::store::RecordStore;
use anyhow::Context;
use serde::Serialize;
use std::collections::HashSet;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

/// Default lease length.
pub const DEFAULT_LOCK_TTL: Duration = Duration::minutes(3);
/// Default age past expiry after which the sweep clears a lease.
pub const DEFAULT_SWEEP_AFTER: Duration = Duration::minutes(10);
/// Default number of queue candidates read per batch.
pub const DEFAULT_QUEUE_BATCH: usize = 50;

/// Lease and queue tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationConfig {
    /// How long a claim or extend holds an item.
    pub lock_ttl: Duration,
    /// Leases that expired more than this long ago are cleared by [`ReservationManager::sweep`].
    pub sweep_after: Duration,
    /// Candidates fetched per queue read.
    pub queue_batch: usize,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            sweep_after: DEFAULT_SWEEP_AFTER,
            queue_batch: DEFAULT_QUEUE_BATCH,
        }
    }
}

/// Whether `item` carries a live lease at `now`.
#[must_use]
pub fn is_locked(item: &ReviewableItem, now: OffsetDateTime) -> bool {
    item.is_locked(now)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
/// Result of a claim attempt.
pub enum ClaimOutcome {
    /// The conditional write succeeded; the caller holds the item until `locked_until`.
    Acquired {
        /// Lease expiry.
        #[serde(with = "time::serde::rfc3339")]
        locked_until: OffsetDateTime,
    },
    /// Someone else holds a live lease.
    Held {
        /// The current holder's expiry, when it could be read back.
        #[serde(with = "time::serde::rfc3339::option")]
        locked_until: Option<OffsetDateTime>,
    },
    /// The item already carries a decision and is out of the queue.
    Decided {
        /// The recorded decision.
        status: ReviewStatus,
    },
    /// No such item.
    Missing,
    /// The store failed; nothing is known about the lease.
    Unavailable {
        /// Store error, for display.
        reason: String,
    },
}

impl ClaimOutcome {
    /// Whether the caller now holds the item.
    #[must_use]
    pub const fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Result of an extend or release.
pub enum LockWrite {
    /// The lease field was written.
    Applied,
    /// Nothing to write: the item is missing, or (for extend) already decided.
    Skipped,
    /// The store failed; the write was dropped.
    Failed,
}

#[derive(Debug, Clone)]
/// Parameters for [`ReservationManager::claim`].
pub struct ClaimParams<'a> {
    /// Item to claim.
    pub item_id: &'a str,
    /// Claiming reviewer (audit only).
    pub reviewer: &'a Reviewer,
    /// Current time.
    pub now: OffsetDateTime,
    /// Lease length.
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
/// Parameters for [`ReservationManager::extend`].
pub struct ExtendParams<'a> {
    /// Item whose lease is renewed.
    pub item_id: &'a str,
    /// Reviewer asking for more time (audit only; no ownership check).
    pub reviewer: &'a Reviewer,
    /// Current time.
    pub now: OffsetDateTime,
    /// New lease length, counted from `now`.
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
/// Parameters for [`ReservationManager::decide`].
pub struct DecideParams<'a> {
    /// Item being decided.
    pub item_id: &'a str,
    /// Reviewer recorded in `decided_by`.
    pub reviewer: &'a Reviewer,
    /// Outcome.
    pub decision: Decision,
    /// Timestamp recorded in `decided_at`.
    pub now: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
/// An item taken from the review queue together with its fresh lease.
pub struct QueuedItem {
    /// The item as read before the claim.
    pub item: ReviewableItem,
    /// Lease expiry of the claim.
    #[serde(with = "time::serde::rfc3339")]
    pub locked_until: OffsetDateTime,
}

/// Gatekeeper for concurrent review of the items in a [`RecordStore`].
#[derive(Debug)]
pub struct ReservationManager<S> {
    store: S,
    config: ReservationConfig,
}

impl<S: RecordStore> ReservationManager<S> {
    /// Wrap `store`.
    pub const fn new(store: S, config: ReservationConfig) -> Self {
        Self { store, config }
    }

    /// The underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Active configuration.
    pub const fn config(&self) -> ReservationConfig {
        self.config
    }

    /// Try to take the lease on an item.
    ///
    /// The guard "no lock, or lock expired at `now`" is checked by the store at write time,
    /// so of two reviewers who both saw a free item only one gets `Acquired`.
    pub fn claim(&self, params: &ClaimParams<'_>) -> ClaimOutcome {
        let until = lease_expiry(params.now, params.ttl);
        let guard = Filter::Status(ReviewStatus::Unset).and(Filter::lock_free_at(params.now));
        match self.store.update_where(
            params.item_id,
            &guard,
            &Patch::lock_until(until),
            params.now,
        ) {
            Ok(0) => self.explain_refusal(params.item_id),
            Ok(_) => {
                debug!(item = params.item_id, reviewer = %params.reviewer, %until, "claimed");
                ClaimOutcome::Acquired {
                    locked_until: until,
                }
            }
            Err(err) => {
                warn!(
                    item = params.item_id,
                    reviewer = %params.reviewer,
                    error = %err,
                    "claim write failed"
                );
                ClaimOutcome::Unavailable {
                    reason: format!("{err:#}"),
                }
            }
        }
    }

    fn explain_refusal(&self, item_id: &str) -> ClaimOutcome {
        match self.store.get(item_id) {
            Ok(None) => ClaimOutcome::Missing,
            Ok(Some(item)) if item.review_status.is_decided() => {
                debug!(item = item_id, status = ?item.review_status, "claim refused: decided");
                ClaimOutcome::Decided {
                    status: item.review_status,
                }
            }
            Ok(Some(item)) => {
                debug!(item = item_id, locked_until = ?item.locked_until, "claim refused");
                ClaimOutcome::Held {
                    locked_until: item.locked_until,
                }
            }
            Err(err) => {
                warn!(item = item_id, error = %err, "claim read-back failed");
                ClaimOutcome::Held { locked_until: None }
            }
        }
    }

    /// Push the lease out to `now + ttl`, whoever holds it.
    ///
    /// Decided items are skipped so a late extend cannot re-lock them.
    pub fn extend(&self, params: &ExtendParams<'_>) -> LockWrite {
        let until = lease_expiry(params.now, params.ttl);
        let result = self.store.update_where(
            params.item_id,
            &Filter::Status(ReviewStatus::Unset),
            &Patch::lock_until(until),
            params.now,
        );
        let outcome = lock_write(result, params.item_id, "extend");
        if outcome == LockWrite::Applied {
            debug!(item = params.item_id, reviewer = %params.reviewer, %until, "lease extended");
        }
        outcome
    }

    /// Drop the lease. Safe to repeat.
    pub fn release(&self, item_id: &str, now: OffsetDateTime) -> LockWrite {
        let result = self
            .store
            .update_where(item_id, &Filter::All, &Patch::release(), now);
        let outcome = lock_write(result, item_id, "release");
        if outcome == LockWrite::Applied {
            debug!(item = item_id, "lease released");
        }
        outcome
    }

    /// Record a decision and release the lease in one write.
    ///
    /// # Errors
    /// Returns an error if the item does not exist or the store write fails; the lease is
    /// left untouched in both cases.
    pub fn decide(&self, params: &DecideParams<'_>) -> anyhow::Result<ReviewableItem> {
        let patch = Patch::decision(params.decision, params.reviewer, params.now);
        let affected = self
            .store
            .update_where(params.item_id, &Filter::All, &patch, params.now)
            .with_context(|| format!("record decision for item {}", params.item_id))?;
        if affected == 0 {
            return Err(anyhow::anyhow!("item not found: {}", params.item_id));
        }
        info!(
            item = params.item_id,
            reviewer = %params.reviewer,
            decision = ?params.decision,
            "decision recorded"
        );
        self.reload(params.item_id)
    }

    /// Put a decided item back in the queue ("change decision").
    ///
    /// # Errors
    /// Returns an error if the item does not exist or the store write fails.
    pub fn reset_decision(
        &self,
        item_id: &str,
        now: OffsetDateTime,
    ) -> anyhow::Result<ReviewableItem> {
        let affected = self
            .store
            .update_where(item_id, &Filter::All, &Patch::reset(), now)
            .with_context(|| format!("reset decision for item {item_id}"))?;
        if affected == 0 {
            return Err(anyhow::anyhow!("item not found: {item_id}"));
        }
        info!(item = item_id, "decision reset");
        self.reload(item_id)
    }

    fn reload(&self, item_id: &str) -> anyhow::Result<ReviewableItem> {
        self.store
            .get(item_id)?
            .ok_or_else(|| anyhow::anyhow!("item vanished after write: {item_id}"))
    }

    /// Clear leases that expired more than `sweep_after` ago. Backstop for sessions that
    /// died without releasing.
    ///
    /// # Errors
    /// Returns an error if the store write fails.
    pub fn sweep(&self, now: OffsetDateTime) -> anyhow::Result<usize> {
        let cutoff = now.saturating_sub(self.config.sweep_after);
        let cleared = self
            .store
            .update_matching(&Filter::LockBefore(cutoff), &Patch::release(), now)
            .context("sweep stale leases")?;
        if cleared > 0 {
            info!(cleared, %cutoff, "stale leases cleared");
        }
        Ok(cleared)
    }

    /// Claim the first free, undecided item in the queue.
    ///
    /// Candidates are read `queue_batch` at a time. Those lost to another reviewer between
    /// read and claim are skipped; when a whole batch is lost the queue is read again, and
    /// `None` means a read turned up nothing that had not been tried.
    ///
    /// # Errors
    /// Returns an error if the queue cannot be read.
    pub fn next_available(
        &self,
        kind: Option<ItemKind>,
        reviewer: &Reviewer,
        now: OffsetDateTime,
    ) -> anyhow::Result<Option<QueuedItem>> {
        let filter = Filter::claimable(kind, now);
        let mut tried = HashSet::new();
        loop {
            let candidates = self
                .store
                .query(&filter, Some(self.config.queue_batch))
                .context("read review queue")?;
            let full = candidates.len() >= self.config.queue_batch;
            let mut fresh = 0_usize;
            for item in candidates {
                if !tried.insert(item.id.clone()) {
                    continue;
                }
                fresh += 1;
                let outcome = self.claim(&ClaimParams {
                    item_id: &item.id,
                    reviewer,
                    now,
                    ttl: self.config.lock_ttl,
                });
                if let ClaimOutcome::Acquired { locked_until } = outcome {
                    return Ok(Some(QueuedItem { item, locked_until }));
                }
            }
            if fresh == 0 || !full {
                return Ok(None);
            }
            debug!(lost = fresh, "queue batch taken by other reviewers; reading on");
        }
    }

    /// Items still waiting for a decision.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub fn remaining(&self, kind: Option<ItemKind>) -> anyhow::Result<usize> {
        self.store
            .count(&Filter::Status(ReviewStatus::Unset).and_kind(kind))
            .context("count remaining items")
    }
}

fn lock_write(result: anyhow::Result<usize>, item_id: &str, op: &str) -> LockWrite {
    match result {
        Ok(0) => LockWrite::Skipped,
        Ok(_) => LockWrite::Applied,
        Err(err) => {
            warn!(item = item_id, op, error = %err, "lease write failed");
            LockWrite::Failed
        }
    }
}
