//! One reviewer working through items, with an idle timeout.
//!
//! A [`ReviewSession`] ties together the pieces a review screen needs:
//! - the reviewer's [`Credential`] (checked before any decision is written);
//! - a borrowed [`ReservationManager`] for claims, extends, releases and decisions;
//! - an [`ActivityMonitor`] that expires the session after a period of inactivity;
//! - a [`Navigator`] told where to go once the session is over;
//! - the item currently held, if any.
//!
//! A session never holds more than one item. Whatever it holds is released when the
//! session expires, is closed, or is dropped.

use crate::activity::{ActivityConfig, ActivityMonitor, ActivityState, Transition};
use crate::clock::{lease_expiry, Clock};
use crate::identity::{Credential, Reviewer};
use crate::item::{Decision, ItemKind, ReviewableItem};
use crate::reservation::{
    ClaimOutcome, ClaimParams, DecideParams, ExtendParams, LockWrite, QueuedItem,
    ReservationManager,
};
use crate::store::RecordStore;
use serde::Serialize;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Why a session sent the reviewer away.
pub enum RedirectReason {
    /// The idle timeout elapsed.
    Idle,
}

/// Where the reviewer goes when a session ends on its own.
pub trait Navigator {
    /// Leave the review screen.
    fn redirect(&mut self, reason: RedirectReason);
}

/// The item a session currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldItem {
    /// Item id.
    pub item_id: String,
    /// Expiry of the lease as last written by this session.
    pub locked_until: OffsetDateTime,
}

/// A reviewer's session over the review queue.
#[derive(Debug)]
pub struct ReviewSession<'m, S: RecordStore, N: Navigator> {
    manager: &'m ReservationManager<S>,
    credential: Credential,
    monitor: ActivityMonitor,
    navigator: N,
    held: Option<HeldItem>,
    last_seen: OffsetDateTime,
}

impl<'m, S: RecordStore, N: Navigator> ReviewSession<'m, S, N> {
    /// Start a session at `now`; it holds nothing yet.
    pub const fn new(
        manager: &'m ReservationManager<S>,
        credential: Credential,
        navigator: N,
        activity: ActivityConfig,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            manager,
            credential,
            monitor: ActivityMonitor::new(activity, now),
            navigator,
            held: None,
            last_seen: now,
        }
    }

    /// Reviewer the session belongs to.
    pub const fn reviewer(&self) -> &Reviewer {
        self.credential.reviewer()
    }

    /// The item currently held.
    pub const fn held(&self) -> Option<&HeldItem> {
        self.held.as_ref()
    }

    /// Idle state as of the last tick or action.
    pub const fn state(&self) -> ActivityState {
        self.monitor.state()
    }

    /// Countdown to idle expiry at `now`.
    pub fn remaining(&self, now: OffsetDateTime) -> Duration {
        self.monitor.remaining(now)
    }

    /// The navigator, for inspection.
    pub const fn navigator(&self) -> &N {
        &self.navigator
    }

    fn observe(&mut self, now: OffsetDateTime) {
        self.last_seen = self.last_seen.max(now);
    }

    fn touch(&mut self, now: OffsetDateTime) -> anyhow::Result<()> {
        self.observe(now);
        if self.monitor.touch(now) {
            Ok(())
        } else {
            Err(anyhow::anyhow!("review session expired; start a new one"))
        }
    }

    fn release_held(&mut self, now: OffsetDateTime) {
        if let Some(held) = self.held.take() {
            let write = self.manager.release(&held.item_id, now);
            debug!(item = %held.item_id, reviewer = %self.reviewer(), ?write, "released held item");
        }
    }

    /// Claim `item_id`, first releasing whatever the session held.
    ///
    /// # Errors
    /// Returns an error if the session has expired.
    pub fn open(&mut self, item_id: &str, now: OffsetDateTime) -> anyhow::Result<ClaimOutcome> {
        self.touch(now)?;
        // Re-opening the held item releases it first so the claim below does not lose to
        // our own live lease.
        self.release_held(now);
        let outcome = self.manager.claim(&ClaimParams {
            item_id,
            reviewer: self.credential.reviewer(),
            now,
            ttl: self.manager.config().lock_ttl,
        });
        if let ClaimOutcome::Acquired { locked_until } = outcome {
            self.held = Some(HeldItem {
                item_id: item_id.to_string(),
                locked_until,
            });
        }
        Ok(outcome)
    }

    /// Release whatever is held and take the next free item from the queue.
    ///
    /// # Errors
    /// Returns an error if the session has expired or the queue cannot be read.
    pub fn open_next(
        &mut self,
        kind: Option<ItemKind>,
        now: OffsetDateTime,
    ) -> anyhow::Result<Option<QueuedItem>> {
        self.touch(now)?;
        self.release_held(now);
        let next = self
            .manager
            .next_available(kind, self.credential.reviewer(), now)?;
        if let Some(ref queued) = next {
            self.held = Some(HeldItem {
                item_id: queued.item.id.clone(),
                locked_until: queued.locked_until,
            });
        }
        Ok(next)
    }

    /// "I'm still here": renew the held lease and reset the idle timer.
    ///
    /// # Errors
    /// Returns an error if the session has expired.
    pub fn extend(&mut self, now: OffsetDateTime) -> anyhow::Result<LockWrite> {
        self.touch(now)?;
        let Some(held) = self.held.as_mut() else {
            return Ok(LockWrite::Skipped);
        };
        let ttl = self.manager.config().lock_ttl;
        let write = self.manager.extend(&ExtendParams {
            item_id: &held.item_id,
            reviewer: self.credential.reviewer(),
            now,
            ttl,
        });
        if write == LockWrite::Applied {
            held.locked_until = lease_expiry(now, ttl);
        }
        Ok(write)
    }

    /// Submit a decision for the held item.
    ///
    /// Counts as activity even when it fails. On failure the item stays held so the
    /// reviewer can retry.
    ///
    /// # Errors
    /// Returns an error if the session expired, the credential expired, nothing is held,
    /// or the decision could not be written.
    pub fn decide(
        &mut self,
        decision: Decision,
        now: OffsetDateTime,
    ) -> anyhow::Result<ReviewableItem> {
        self.touch(now)?;
        let reviewer = self.credential.ensure_valid(now)?;
        let Some(held) = self.held.as_ref() else {
            return Err(anyhow::anyhow!("no item is open for review"));
        };
        let item = self.manager.decide(&DecideParams {
            item_id: &held.item_id,
            reviewer,
            decision,
            now,
        })?;
        self.held = None;
        Ok(item)
    }

    /// Re-check the idle timer. On the transition into `Expired` the held item is released
    /// and the navigator is told to leave.
    pub fn tick(&mut self, now: OffsetDateTime) -> Option<Transition> {
        self.observe(now);
        let transition = self.monitor.poll(now)?;
        if transition.expired() {
            info!(reviewer = %self.reviewer(), "review session expired");
            self.release_held(now);
            self.navigator.redirect(RedirectReason::Idle);
        }
        Some(transition)
    }

    /// Release the held item; the reviewer is leaving.
    pub fn close(&mut self, now: OffsetDateTime) {
        self.observe(now);
        self.release_held(now);
    }
}

// Drop has no clock of its own; it reuses the latest time the session was given.
impl<S: RecordStore, N: Navigator> Drop for ReviewSession<'_, S, N> {
    fn drop(&mut self) {
        self.release_held(self.last_seen);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Input to [`drive`].
pub enum SessionEvent {
    /// Renew the held lease.
    Extend,
    /// Decide the held item.
    Decide(Decision),
    /// Move to the next item in the queue.
    OpenNext(Option<ItemKind>),
    /// Leave the session.
    Close,
}

#[derive(Debug)]
/// What [`drive`] reports back after each event or tick.
pub enum Step {
    /// A new item is held.
    Opened(QueuedItem),
    /// The queue has nothing left to claim.
    QueueEmpty,
    /// Result of an extend.
    Extended(LockWrite),
    /// A decision was recorded.
    Decided(ReviewableItem),
    /// An event failed; the session continues.
    Failed(anyhow::Error),
    /// Idle state changed.
    Changed(Transition),
    /// Time left while the warning is showing.
    Countdown(Duration),
    /// The held item was released and the session is over.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Why [`drive`] returned.
pub enum SessionEnd {
    /// The idle timeout elapsed.
    Expired,
    /// A [`SessionEvent::Close`] was received.
    Closed,
    /// The event source went away.
    Disconnected,
}

/// Run a session until it expires or its event source ends.
///
/// Wakes up on every event and at least every `poll_interval`; after each wakeup the idle
/// timer is re-checked against `clock`.
pub fn drive<S, N, C>(
    session: &mut ReviewSession<'_, S, N>,
    clock: &C,
    events: &Receiver<SessionEvent>,
    poll_interval: std::time::Duration,
    mut on_step: impl FnMut(Step),
) -> SessionEnd
where
    S: RecordStore,
    N: Navigator,
    C: Clock + ?Sized,
{
    loop {
        match events.recv_timeout(poll_interval) {
            Ok(event) => {
                let step = handle(session, event, clock.now());
                let closed = matches!(step, Step::Closed);
                on_step(step);
                if closed {
                    return SessionEnd::Closed;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                session.close(clock.now());
                return SessionEnd::Disconnected;
            }
        }

        let now = clock.now();
        if let Some(transition) = session.tick(now) {
            on_step(Step::Changed(transition));
            if transition.expired() {
                return SessionEnd::Expired;
            }
        }
        if session.state() == ActivityState::Warning {
            on_step(Step::Countdown(session.remaining(now)));
        }
    }
}

fn handle<S: RecordStore, N: Navigator>(
    session: &mut ReviewSession<'_, S, N>,
    event: SessionEvent,
    now: OffsetDateTime,
) -> Step {
    let result = match event {
        SessionEvent::Extend => session.extend(now).map(Step::Extended),
        SessionEvent::Decide(decision) => session.decide(decision, now).map(Step::Decided),
        SessionEvent::OpenNext(kind) => session
            .open_next(kind, now)
            .map(|next| next.map_or(Step::QueueEmpty, Step::Opened)),
        SessionEvent::Close => {
            session.close(now);
            Ok(Step::Closed)
        }
    };
    result.unwrap_or_else(Step::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{parse_ts, ManualClock};
    use crate::item::{Filter, Patch, ReviewStatus};
    use crate::reservation::ReservationConfig;
    use crate::store::MemoryStore;
    use anyhow::{bail, ensure};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;

    /// Memory store that can be told to fail writes, and counts releases.
    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_writes: AtomicBool,
        releases: AtomicUsize,
    }

    impl FlakyStore {
        fn check(&self) -> anyhow::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                bail!("store unavailable");
            }
            Ok(())
        }
    }

    impl RecordStore for FlakyStore {
        fn insert(&self, item: ReviewableItem) -> anyhow::Result<()> {
            self.inner.insert(item)
        }

        fn get(&self, id: &str) -> anyhow::Result<Option<ReviewableItem>> {
            self.inner.get(id)
        }

        fn query(
            &self,
            filter: &Filter,
            limit: Option<usize>,
        ) -> anyhow::Result<Vec<ReviewableItem>> {
            self.inner.query(filter, limit)
        }

        fn count(&self, filter: &Filter) -> anyhow::Result<usize> {
            self.inner.count(filter)
        }

        fn update_where(
            &self,
            id: &str,
            guard: &Filter,
            patch: &Patch,
            at: OffsetDateTime,
        ) -> anyhow::Result<usize> {
            self.check()?;
            if *patch == Patch::release() {
                self.releases.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.update_where(id, guard, patch, at)
        }

        fn update_matching(
            &self,
            filter: &Filter,
            patch: &Patch,
            at: OffsetDateTime,
        ) -> anyhow::Result<usize> {
            self.check()?;
            self.inner.update_matching(filter, patch, at)
        }
    }

    #[derive(Debug, Default)]
    struct Recorder {
        redirects: Vec<RedirectReason>,
    }

    impl Navigator for Recorder {
        fn redirect(&mut self, reason: RedirectReason) {
            self.redirects.push(reason);
        }
    }

    fn setup(ids: &[&str]) -> anyhow::Result<(ReservationManager<FlakyStore>, OffsetDateTime)> {
        let t = parse_ts("2026-03-02T10:00:00Z")?;
        let store = FlakyStore::default();
        for id in ids {
            store.insert(ReviewableItem::new((*id).to_string(), ItemKind::Image, None, t))?;
        }
        Ok((ReservationManager::new(store, ReservationConfig::default()), t))
    }

    fn credential(t: OffsetDateTime) -> anyhow::Result<Credential> {
        let reviewer = Reviewer::new("anna@example.com")?;
        Ok(Credential::issue(reviewer, t, Duration::minutes(50)))
    }

    fn session_at(
        manager: &ReservationManager<FlakyStore>,
        credential: Credential,
        t: OffsetDateTime,
    ) -> ReviewSession<'_, FlakyStore, Recorder> {
        ReviewSession::new(
            manager,
            credential,
            Recorder::default(),
            ActivityConfig::default(),
            t,
        )
    }

    #[test]
    fn idle_expiry_releases_once_and_redirects() -> anyhow::Result<()> {
        let (manager, t) = setup(&["img-1"])?;
        {
            let mut session = session_at(&manager, credential(t)?, t);
            let outcome = session.open("img-1", t)?;
            ensure!(outcome.is_acquired());

            ensure!(session.tick(t + Duration::seconds(119)).is_none());
            let Some(warning) = session.tick(t + Duration::seconds(120)) else {
                bail!("expected warning at 120s");
            };
            ensure!(warning.to == ActivityState::Warning);
            ensure!(manager.store().releases.load(Ordering::SeqCst) == 0);

            let Some(expired) = session.tick(t + Duration::seconds(180)) else {
                bail!("expected expiry at 180s");
            };
            ensure!(expired.expired());
            ensure!(session.tick(t + Duration::seconds(181)).is_none());
            ensure!(session.held().is_none());
            ensure!(session.navigator().redirects == [RedirectReason::Idle]);
            ensure!(session.extend(t + Duration::seconds(182)).is_err());
        }
        ensure!(manager.store().releases.load(Ordering::SeqCst) == 1);
        let item = manager.store().get("img-1")?;
        ensure!(item.and_then(|i| i.locked_until).is_none());
        Ok(())
    }

    #[test]
    fn decision_resets_idle_timer_and_clears_held() -> anyhow::Result<()> {
        let (manager, t) = setup(&["img-1", "img-2"])?;
        let mut session = session_at(&manager, credential(t)?, t);
        let Some(first) = session.open_next(None, t)? else {
            bail!("queue should not be empty");
        };
        ensure!(first.item.id == "img-1");

        let at = t + Duration::seconds(150);
        let item = session.decide(Decision::Approved, at)?;
        ensure!(item.review_status == ReviewStatus::Approved);
        ensure!(item.decided_by.as_deref() == Some("anna@example.com"));
        ensure!(session.held().is_none());
        ensure!(session.state() == ActivityState::Active);
        ensure!(session.remaining(at) == Duration::seconds(180));
        Ok(())
    }

    #[test]
    fn failed_decision_keeps_the_lease() -> anyhow::Result<()> {
        let (manager, t) = setup(&["img-1"])?;
        let mut session = session_at(&manager, credential(t)?, t);
        session.open("img-1", t)?;

        manager.store().fail_writes.store(true, Ordering::SeqCst);
        ensure!(session.decide(Decision::Rejected, t + Duration::seconds(5)).is_err());
        manager.store().fail_writes.store(false, Ordering::SeqCst);

        ensure!(session.held().map(|h| h.item_id.as_str()) == Some("img-1"));
        let stored = manager.store().get("img-1")?;
        ensure!(stored.as_ref().is_some_and(|i| i.is_locked(t + Duration::seconds(5))));
        ensure!(stored.is_some_and(|i| i.review_status == ReviewStatus::Unset));

        session.decide(Decision::Rejected, t + Duration::seconds(10))?;
        ensure!(session.held().is_none());
        Ok(())
    }

    #[test]
    fn expired_credential_blocks_decision() -> anyhow::Result<()> {
        let (manager, t) = setup(&["img-1"])?;
        let short = Credential::issue(Reviewer::new("anna")?, t, Duration::seconds(30));
        let mut session = session_at(&manager, short, t);
        session.open("img-1", t)?;

        let Err(err) = session.decide(Decision::Approved, t + Duration::seconds(60)) else {
            bail!("expired credential should block the decision");
        };
        ensure!(err.to_string().contains("sign in again"));
        ensure!(session.held().is_some());
        Ok(())
    }

    #[test]
    fn claim_failure_is_reported_not_raised() -> anyhow::Result<()> {
        let (manager, t) = setup(&["img-1"])?;
        let mut session = session_at(&manager, credential(t)?, t);
        manager.store().fail_writes.store(true, Ordering::SeqCst);
        let outcome = session.open("img-1", t)?;
        ensure!(matches!(outcome, ClaimOutcome::Unavailable { .. }));
        ensure!(session.held().is_none());
        Ok(())
    }

    #[test]
    fn drop_releases_held_item_at_session_time() -> anyhow::Result<()> {
        let (manager, t) = setup(&["img-1"])?;
        let clock = ManualClock::new(t);
        {
            let mut session = session_at(&manager, credential(t)?, t);
            session.open("img-1", clock.now())?;
            clock.advance(Duration::seconds(45));
            ensure!(session.tick(clock.now()).is_none());
        }
        let Some(item) = manager.store().get("img-1")? else {
            bail!("item vanished");
        };
        ensure!(item.locked_until.is_none());
        ensure!(item.updated_at == t + Duration::seconds(45));
        Ok(())
    }

    #[test]
    fn extend_with_huge_ttl_saturates() -> anyhow::Result<()> {
        let t = parse_ts("2026-03-02T10:00:00Z")?;
        let store = FlakyStore::default();
        store.insert(ReviewableItem::new("img-1".into(), ItemKind::Image, None, t))?;
        let config = ReservationConfig {
            lock_ttl: Duration::seconds(i64::MAX),
            ..ReservationConfig::default()
        };
        let manager = ReservationManager::new(store, config);
        let mut session = session_at(&manager, credential(t)?, t);
        ensure!(session.open("img-1", t)?.is_acquired());

        ensure!(session.extend(t + Duration::seconds(5))? == LockWrite::Applied);
        let expected = lease_expiry(t, Duration::seconds(i64::MAX));
        ensure!(session.held().map(|h| h.locked_until) == Some(expected));
        Ok(())
    }

    #[test]
    fn drive_runs_events_then_stops_on_disconnect() -> anyhow::Result<()> {
        let (manager, t) = setup(&["img-1", "img-2"])?;
        let clock = ManualClock::new(t);
        let mut session = session_at(&manager, credential(t)?, t);

        let (tx, rx) = mpsc::channel();
        tx.send(SessionEvent::OpenNext(None))?;
        tx.send(SessionEvent::Decide(Decision::NeedsReplacement))?;
        tx.send(SessionEvent::OpenNext(None))?;
        tx.send(SessionEvent::Extend)?;
        drop(tx);

        let mut steps = Vec::new();
        let tick = std::time::Duration::from_millis(1);
        let end = drive(&mut session, &clock, &rx, tick, |s| steps.push(s));
        ensure!(end == SessionEnd::Disconnected);
        ensure!(steps.len() == 4);
        ensure!(matches!(steps.first(), Some(Step::Opened(q)) if q.item.id == "img-1"));
        ensure!(matches!(steps.get(1), Some(Step::Decided(_))));
        ensure!(matches!(steps.get(2), Some(Step::Opened(q)) if q.item.id == "img-2"));
        ensure!(matches!(steps.get(3), Some(Step::Extended(LockWrite::Applied))));
        ensure!(session.held().is_none());
        ensure!(manager.store().get("img-2")?.is_some_and(|i| i.locked_until.is_none()));
        Ok(())
    }

    #[test]
    fn drive_ends_on_idle_expiry() -> anyhow::Result<()> {
        let (manager, t) = setup(&["img-1"])?;
        let clock = ManualClock::new(t);
        let mut session = session_at(&manager, credential(t)?, t);
        session.open("img-1", t)?;

        let (_tx, rx) = mpsc::channel::<SessionEvent>();
        clock.advance(Duration::minutes(4));
        let mut expired_steps = 0_usize;
        let tick = std::time::Duration::from_millis(1);
        let end = drive(&mut session, &clock, &rx, tick, |s| {
            if matches!(s, Step::Changed(tr) if tr.expired()) {
                expired_steps += 1;
            }
        });
        ensure!(end == SessionEnd::Expired);
        ensure!(expired_steps == 1);
        ensure!(session.navigator().redirects == [RedirectReason::Idle]);
        ensure!(manager.store().releases.load(Ordering::SeqCst) == 1);
        Ok(())
    }
}
