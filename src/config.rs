//! Tunables for leases, the idle timeout and credentials.

use crate::activity::ActivityConfig;
use crate::reservation::ReservationConfig;
use time::Duration;

/// Default credential lifetime.
pub const DEFAULT_CREDENTIAL_TTL: Duration = Duration::minutes(50);
/// Longest accepted value for any timing setting.
pub const MAX_SETTING: Duration = Duration::days(366);

/// Everything a reviewer-facing process needs to know about timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Lease and queue tuning.
    pub reservation: ReservationConfig,
    /// Idle timeout tuning.
    pub activity: ActivityConfig,
    /// How long an issued credential stays valid.
    pub credential_ttl: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reservation: ReservationConfig::default(),
            activity: ActivityConfig::default(),
            credential_ttl: DEFAULT_CREDENTIAL_TTL,
        }
    }
}

impl Settings {
    /// Check that the values make sense together.
    ///
    /// # Errors
    /// Returns an error naming the first offending value.
    pub fn validate(&self) -> anyhow::Result<()> {
        let durations = [
            ("lock ttl", self.reservation.lock_ttl),
            ("sweep threshold", self.reservation.sweep_after),
            ("idle timeout", self.activity.timeout),
            ("warning window", self.activity.warning_window),
            ("credential ttl", self.credential_ttl),
        ];
        for (name, value) in durations {
            if !value.is_positive() {
                return Err(anyhow::anyhow!("{name} must be positive (got {value})"));
            }
            if value > MAX_SETTING {
                return Err(anyhow::anyhow!(
                    "{name} must not exceed {MAX_SETTING} (got {value})"
                ));
            }
        }
        if self.reservation.queue_batch == 0 {
            return Err(anyhow::anyhow!("queue batch must be at least 1"));
        }
        if self.activity.poll_interval.is_zero() {
            return Err(anyhow::anyhow!("poll interval must be positive"));
        }
        if self.activity.warning_window >= self.activity.timeout {
            return Err(anyhow::anyhow!(
                "warning window ({}) must be shorter than the idle timeout ({})",
                self.activity.warning_window,
                self.activity.timeout
            ));
        }
        if self.reservation.sweep_after < self.reservation.lock_ttl {
            return Err(anyhow::anyhow!(
                "sweep threshold ({}) must not be shorter than the lock ttl ({})",
                self.reservation.sweep_after,
                self.reservation.lock_ttl
            ));
        }
        Ok(())
    }
}
