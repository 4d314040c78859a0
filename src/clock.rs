//! Wall-clock access and lease timestamp arithmetic.
//!
//! Every lease decision in this crate compares a stored `locked_until` against a `now`
//! supplied by a [`Clock`]. Production code uses [`SystemClock`]; tests drive time by hand
//! with [`ManualClock`].

use anyhow::Context;
use std::sync::{Mutex, PoisonError};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time (UTC).
    fn now(&self) -> OffsetDateTime;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    #[must_use]
    pub const fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move forward (or backward, for a negative step) by `step`.
    pub fn advance(&self, step: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = now.saturating_add(step);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Expiry for a lease taken at `now` for `ttl`.
#[must_use]
pub fn lease_expiry(now: OffsetDateTime, ttl: Duration) -> OffsetDateTime {
    now.saturating_add(ttl)
}

/// Whether `deadline` is no longer in the future at `now`.
#[must_use]
pub fn has_passed(deadline: OffsetDateTime, now: OffsetDateTime) -> bool {
    deadline <= now
}

/// Elapsed time from `since` to `now`, clamped at zero when the clock went backwards.
#[must_use]
pub fn elapsed_since(since: OffsetDateTime, now: OffsetDateTime) -> Duration {
    let elapsed = now - since;
    if elapsed.is_negative() {
        Duration::ZERO
    } else {
        elapsed
    }
}

/// Format a timestamp as RFC3339.
///
/// # Errors
/// Returns an error if the timestamp cannot be represented in RFC3339.
pub fn format_ts(ts: OffsetDateTime) -> anyhow::Result<String> {
    ts.format(&Rfc3339).context("format RFC3339 timestamp")
}

/// Parse an RFC3339 timestamp.
///
/// # Errors
/// Returns an error if `raw` is not valid RFC3339.
pub fn parse_ts(raw: &str) -> anyhow::Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).with_context(|| format!("parse RFC3339 timestamp {raw:?}"))
}
