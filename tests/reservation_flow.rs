//! Integration tests for reservations over the shared JSON file store.

use anyhow::{bail, ensure};
use revlock::activity::{ActivityConfig, ActivityState};
use revlock::clock::{parse_ts, Clock, ManualClock};
use revlock::identity::{Credential, Reviewer};
use revlock::item::{Decision, ItemKind, ReviewStatus, ReviewableItem};
use revlock::reservation::{
    is_locked, ClaimOutcome, ClaimParams, DecideParams, LockWrite, ReservationConfig,
    ReservationManager,
};
use revlock::session::{Navigator, RedirectReason, ReviewSession};
use revlock::stats;
use revlock::store::{JsonFileStore, RecordStore};
use std::path::Path;
use std::sync::{Arc, Barrier};
use time::{Duration, OffsetDateTime};

fn start() -> anyhow::Result<OffsetDateTime> {
    parse_ts("2026-03-02T10:00:00Z")
}

fn seeded_store(dir: &Path, ids: &[&str], now: OffsetDateTime) -> anyhow::Result<JsonFileStore> {
    let store = JsonFileStore::open(dir)?;
    for id in ids {
        store.insert(ReviewableItem::new((*id).to_string(), ItemKind::Image, None, now))?;
    }
    Ok(store)
}

fn manager(dir: &Path) -> anyhow::Result<ReservationManager<JsonFileStore>> {
    Ok(ReservationManager::new(
        JsonFileStore::open(dir)?,
        ReservationConfig::default(),
    ))
}

fn item(store: &JsonFileStore, id: &str) -> anyhow::Result<ReviewableItem> {
    store
        .get(id)?
        .ok_or_else(|| anyhow::anyhow!("missing {id}"))
}

#[derive(Default)]
struct Recorder(Vec<RedirectReason>);

impl Navigator for Recorder {
    fn redirect(&mut self, reason: RedirectReason) {
        self.0.push(reason);
    }
}

#[test]
fn claim_is_visible_and_exclusive_across_processes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let t = start()?;
    seeded_store(dir.path(), &["img-1"], t)?;

    // Two handles stand in for two reviewer processes sharing the directory.
    let a = manager(dir.path())?;
    let b = manager(dir.path())?;
    let u1 = Reviewer::new("u1@example.com")?;
    let u2 = Reviewer::new("u2@example.com")?;
    let ttl = Duration::seconds(180);

    let first = a.claim(&ClaimParams {
        item_id: "img-1",
        reviewer: &u1,
        now: t,
        ttl,
    });
    ensure!(first.is_acquired());

    let second = b.claim(&ClaimParams {
        item_id: "img-1",
        reviewer: &u2,
        now: t + Duration::seconds(10),
        ttl,
    });
    let ClaimOutcome::Held { locked_until } = second else {
        bail!("second reviewer should see the item held, got {second:?}");
    };
    ensure!(locked_until == Some(t + ttl));

    let stored = item(b.store(), "img-1")?;
    ensure!(is_locked(&stored, t + Duration::seconds(179)));
    ensure!(!is_locked(&stored, t + Duration::seconds(181)));
    Ok(())
}

#[test]
fn racing_claims_have_exactly_one_winner() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let t = start()?;
    seeded_store(dir.path(), &["img-1"], t)?;

    let contenders = 4;
    let barrier = Arc::new(Barrier::new(contenders));
    let mut handles = Vec::new();
    for n in 0..contenders {
        let barrier = Arc::clone(&barrier);
        let path = dir.path().to_path_buf();
        handles.push(std::thread::spawn(move || -> anyhow::Result<bool> {
            let contender = manager(&path)?;
            let reviewer = Reviewer::new(format!("u{n}"))?;
            barrier.wait();
            let outcome = contender.claim(&ClaimParams {
                item_id: "img-1",
                reviewer: &reviewer,
                now: t,
                ttl: Duration::seconds(180),
            });
            Ok(outcome.is_acquired())
        }));
    }

    let mut winners = 0_usize;
    for handle in handles {
        match handle.join() {
            Ok(result) => {
                if result? {
                    winners += 1;
                }
            }
            Err(_) => bail!("claim thread panicked"),
        }
    }
    ensure!(winners == 1, "expected one winner, got {winners}");
    Ok(())
}

#[test]
fn decision_and_release_persist() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let t = start()?;
    let store = seeded_store(dir.path(), &["img-1", "img-2"], t)?;
    let manager = ReservationManager::new(store, ReservationConfig::default());
    let u = Reviewer::new("anna@example.com")?;

    manager.claim(&ClaimParams {
        item_id: "img-1",
        reviewer: &u,
        now: t,
        ttl: Duration::minutes(3),
    });
    manager.decide(&DecideParams {
        item_id: "img-1",
        reviewer: &u,
        decision: Decision::Approved,
        now: t + Duration::seconds(20),
    })?;

    let reopened = JsonFileStore::open(dir.path())?;
    let decided = item(&reopened, "img-1")?;
    ensure!(decided.review_status == ReviewStatus::Approved);
    ensure!(decided.decided_by.as_deref() == Some("anna@example.com"));
    ensure!(decided.locked_until.is_none());

    ensure!(manager.release("img-2", t) == LockWrite::Applied);
    ensure!(manager.release("img-2", t) == LockWrite::Applied);
    ensure!(item(&reopened, "img-2")?.locked_until.is_none());

    let summary = stats::queue_summary(&reopened, None, t)?;
    ensure!(summary.remaining == 1 && summary.decided == 1 && summary.locked == 0);
    Ok(())
}

#[test]
fn abandoned_session_lease_is_swept_later() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let t = start()?;
    let store = seeded_store(dir.path(), &["img-1"], t)?;
    let manager = ReservationManager::new(store, ReservationConfig::default());
    let u = Reviewer::new("anna")?;

    // A crashed client: claim, then nothing.
    manager.claim(&ClaimParams {
        item_id: "img-1",
        reviewer: &u,
        now: t,
        ttl: Duration::minutes(3),
    });

    ensure!(manager.sweep(t + Duration::minutes(5))? == 0);
    ensure!(manager.sweep(t + Duration::minutes(14))? == 1);
    ensure!(item(manager.store(), "img-1")?.locked_until.is_none());
    Ok(())
}

#[test]
fn idle_session_hands_item_to_next_reviewer() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let t = start()?;
    let store = seeded_store(dir.path(), &["img-1"], t)?;
    let manager = ReservationManager::new(store, ReservationConfig::default());
    let clock = ManualClock::new(t);

    let anna = Credential::issue(Reviewer::new("anna")?, t, Duration::minutes(50));
    let mut session = ReviewSession::new(
        &manager,
        anna,
        Recorder::default(),
        ActivityConfig::default(),
        t,
    );
    let Some(opened) = session.open_next(Some(ItemKind::Image), t)? else {
        bail!("expected an item");
    };
    ensure!(opened.item.id == "img-1");

    clock.advance(Duration::seconds(100));
    ensure!(session.extend(clock.now())? == LockWrite::Applied);

    clock.advance(Duration::seconds(180));
    session.tick(clock.now());
    ensure!(session.state() == ActivityState::Expired);
    ensure!(session.navigator().0 == [RedirectReason::Idle]);

    let bob = Reviewer::new("bob")?;
    let Some(next) = manager.next_available(None, &bob, clock.now())? else {
        bail!("released item should be back in the queue");
    };
    ensure!(next.item.id == "img-1");
    Ok(())
}
