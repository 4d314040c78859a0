//! Who is reviewing, and proof that they signed in recently.
//!
//! A [`Reviewer`] is an opaque identity string supplied by the external auth provider. It
//! is recorded in `decided_by` and in logs; nothing in this crate authorizes on it.
//!
//! A [`Credential`] is owned by whoever needs it (usually a [`crate::session::ReviewSession`])
//! and carries its own expiry, so there is no process-wide token cache to go stale.

use crate::clock::{has_passed, lease_expiry};
use serde::Serialize;
use std::fmt;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
/// Opaque reviewer identity (typically an e-mail address).
pub struct Reviewer(String);

impl Reviewer {
    /// Build from a raw identity string; surrounding whitespace is dropped.
    ///
    /// # Errors
    /// Returns an error if the identity is blank.
    pub fn new(raw: impl AsRef<str>) -> anyhow::Result<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(anyhow::anyhow!("reviewer identity must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Borrow the identity string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Reviewer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Short-lived sign-in proof for one reviewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    reviewer: Reviewer,
    expires_at: OffsetDateTime,
}

impl Credential {
    /// Issue a fresh credential valid for `ttl` from `now`.
    #[must_use]
    pub fn issue(reviewer: Reviewer, now: OffsetDateTime, ttl: Duration) -> Self {
        Self {
            reviewer,
            expires_at: lease_expiry(now, ttl),
        }
    }

    /// The reviewer this credential belongs to.
    #[must_use]
    pub const fn reviewer(&self) -> &Reviewer {
        &self.reviewer
    }

    /// Instant after which the credential is useless.
    #[must_use]
    pub const fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    /// Whether the credential can still be used at `now`.
    #[must_use]
    pub fn is_valid(&self, now: OffsetDateTime) -> bool {
        !has_passed(self.expires_at, now)
    }

    /// The reviewer, if the credential is still valid at `now`.
    ///
    /// # Errors
    /// Returns an error asking the reviewer to sign in again once the credential expired.
    pub fn ensure_valid(&self, now: OffsetDateTime) -> anyhow::Result<&Reviewer> {
        if self.is_valid(now) {
            Ok(&self.reviewer)
        } else {
            Err(anyhow::anyhow!(
                "credential for {} expired; sign in again",
                self.reviewer
            ))
        }
    }
}
