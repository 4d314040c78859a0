//! Idle timeout for a review session.
//!
//! The monitor only remembers when the reviewer last did something. Every query recomputes
//! the elapsed time from that timestamp, so a poller that was starved for a while (a
//! suspended laptop, a throttled background tab) sees the right state on its next wakeup.

use crate::clock::elapsed_since;
use serde::Serialize;
use time::{Duration, OffsetDateTime};

/// Default idle time before a session expires.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::seconds(180);
/// Default length of the visible countdown before expiry.
pub const DEFAULT_WARNING_WINDOW: Duration = Duration::seconds(60);
/// Default poll interval for the session loop.
pub const DEFAULT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Idle timeout tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityConfig {
    /// Idle time after which the session expires.
    pub timeout: Duration,
    /// How long before `timeout` the warning starts.
    pub warning_window: Duration,
    /// How often the session loop wakes up to re-check.
    pub poll_interval: std::time::Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_IDLE_TIMEOUT,
            warning_window: DEFAULT_WARNING_WINDOW,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ActivityConfig {
    /// Elapsed idle time at which the warning starts.
    #[must_use]
    pub fn warning_after(&self) -> Duration {
        self.timeout - self.warning_window
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Where an idle session stands.
pub enum ActivityState {
    /// Reviewer is active.
    Active,
    /// Countdown visible; any action returns to `Active`.
    Warning,
    /// Timed out. Terminal.
    Expired,
}

/// A state change reported by [`ActivityMonitor::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the poll.
    pub from: ActivityState,
    /// State after the poll.
    pub to: ActivityState,
}

impl Transition {
    /// Whether this transition is the one into `Expired`.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.to == ActivityState::Expired
    }
}

/// Idle-time state machine.
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    config: ActivityConfig,
    last_activity: OffsetDateTime,
    state: ActivityState,
}

impl ActivityMonitor {
    /// Start a monitor whose idle clock begins at `now`.
    #[must_use]
    pub const fn new(config: ActivityConfig, now: OffsetDateTime) -> Self {
        Self {
            config,
            last_activity: now,
            state: ActivityState::Active,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> ActivityConfig {
        self.config
    }

    /// State as of the last [`ActivityMonitor::poll`] or [`ActivityMonitor::touch`].
    #[must_use]
    pub const fn state(&self) -> ActivityState {
        self.state
    }

    /// Idle time at `now`.
    #[must_use]
    pub fn elapsed(&self, now: OffsetDateTime) -> Duration {
        elapsed_since(self.last_activity, now)
    }

    /// Countdown until expiry at `now`, never negative.
    #[must_use]
    pub fn remaining(&self, now: OffsetDateTime) -> Duration {
        let left = self.config.timeout - self.elapsed(now);
        if left.is_negative() {
            Duration::ZERO
        } else {
            left
        }
    }

    /// The state the monitor would be in at `now`, without recording it.
    #[must_use]
    pub fn state_at(&self, now: OffsetDateTime) -> ActivityState {
        if self.state == ActivityState::Expired {
            return ActivityState::Expired;
        }
        let elapsed = self.elapsed(now);
        if elapsed >= self.config.timeout {
            ActivityState::Expired
        } else if elapsed >= self.config.warning_after() {
            ActivityState::Warning
        } else {
            ActivityState::Active
        }
    }

    /// Recompute the state at `now` and report a change, if any.
    ///
    /// Entering `Expired` is reported once; later polls return `None`.
    pub fn poll(&mut self, now: OffsetDateTime) -> Option<Transition> {
        let next = self.state_at(now);
        if next == self.state {
            return None;
        }
        let transition = Transition {
            from: self.state,
            to: next,
        };
        self.state = next;
        Some(transition)
    }

    /// Record reviewer activity at `now`. Returns `false` (and changes nothing) once the
    /// session has expired.
    pub fn touch(&mut self, now: OffsetDateTime) -> bool {
        if self.state_at(now) == ActivityState::Expired {
            return false;
        }
        self.last_activity = now;
        self.state = ActivityState::Active;
        true
    }
}
