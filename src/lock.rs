use crate::{id, paths};
use anyhow::Context;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

const DEFAULT_MAX_RETRIES: usize = 8;
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF_MS: u64 = 50;
const MAX_BACKOFF_MS: u64 = 3_200;

/// Tuning for [`acquire_store_lock`].
#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// Retries after the first failed attempt before giving up with `STORE_LOCK_TIMEOUT`.
    pub max_retries: usize,
    /// A lock file older than this is assumed to belong to a crashed writer and is broken.
    /// `None` never breaks a lock.
    pub stale_after: Option<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            stale_after: Some(DEFAULT_STALE_AFTER),
        }
    }
}

/// Holds the store write lock; released on drop.
#[derive(Debug)]
pub struct StoreLockGuard {
    lock_file: Option<PathBuf>,
    owner: String,
}

impl StoreLockGuard {
    /// Release explicitly, surfacing I/O errors that `Drop` would swallow.
    ///
    /// # Errors
    /// Returns an error if the lock file exists but cannot be read or removed.
    pub fn release(mut self) -> anyhow::Result<()> {
        self.release_inner()
    }

    /// The owner id written into the lock file.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Fail unless the lock file still names this guard's owner. Writers call this right
    /// before committing so a lock that was broken underneath them never loses an update.
    ///
    /// # Errors
    /// Returns an error if the lock was released, taken over, or cannot be read.
    pub fn ensure_held(&self) -> anyhow::Result<()> {
        let Some(lock_file) = self.lock_file.as_deref() else {
            return Err(anyhow::anyhow!("store lock already released"));
        };
        match read_owner(lock_file)? {
            Some(current) if current == self.owner => Ok(()),
            current => Err(anyhow::anyhow!(
                "store lock lost by {} (now held by {})",
                self.owner,
                current.as_deref().unwrap_or("nobody")
            )),
        }
    }

    fn release_inner(&mut self) -> anyhow::Result<()> {
        let Some(lock_file) = self.lock_file.take() else {
            return Ok(());
        };
        release_if_owned(&lock_file, &self.owner)
    }
}

impl Drop for StoreLockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(owner = %self.owner, error = %err, "failed to release store lock");
        }
    }
}

fn read_owner(lock_file: &Path) -> anyhow::Result<Option<String>> {
    match fs::read_to_string(lock_file) {
        Ok(raw) => Ok(raw.lines().next().map(str::to_string)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context("read store lock owner"),
    }
}

fn release_if_owned(lock_file: &Path, owner: &str) -> anyhow::Result<()> {
    match read_owner(lock_file)? {
        Some(current) if current == owner => match fs::remove_file(lock_file) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context("remove store lock file"),
        },
        // Someone broke our lock as stale and took it over; leave theirs alone.
        _ => Ok(()),
    }
}

fn lock_age(lock_file: &Path) -> Option<Duration> {
    let modified = fs::metadata(lock_file).ok()?.modified().ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}

fn is_stale(lock_file: &Path, stale_after: Duration) -> bool {
    lock_age(lock_file).is_some_and(|age| age >= stale_after)
}

/// Owner of the lock file if it has been held for at least `stale_after`.
fn stale_holder(lock_file: &Path, stale_after: Duration) -> anyhow::Result<Option<String>> {
    // Owner first: if the file is replaced in between, the age check sees the new one.
    // A writer that died before writing its id leaves an empty owner.
    let holder = read_owner(lock_file)?.unwrap_or_default();
    Ok(is_stale(lock_file, stale_after).then_some(holder))
}

fn remove_tombstone(tombstone: &Path) {
    if let Err(err) = fs::remove_file(tombstone) {
        warn!(file = %tombstone.display(), error = %err, "failed to remove stale lock tombstone");
    }
}

/// Break the lock that `holder` left behind.
///
/// The lock file is renamed to a tombstone unique to this attempt, so of several writers
/// that saw the same stale lock only one moves it. The tombstone is then checked: if it is
/// not `holder`'s stale lock (another writer broke that one first and took a fresh lock),
/// it is linked back into place and the caller backs off. Returns whether the caller
/// should retry `create_new` at once.
fn break_stale(
    store_dir: &Path,
    holder: &str,
    stale_after: Duration,
    breaker: &str,
) -> anyhow::Result<bool> {
    let lock_file = paths::store_paths(store_dir).lock_file;
    let tag = format!("{breaker}.{}", id::random_id8()?);
    let tombstone = paths::stale_lock_file(store_dir, &tag);

    match fs::rename(&lock_file, &tombstone) {
        Ok(()) => {}
        // Already gone: someone released or broke it.
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(err).context("move stale store lock aside"),
    }

    let moved = read_owner(&tombstone)?.unwrap_or_default();
    if moved == holder && is_stale(&tombstone, stale_after) {
        warn!(holder = %holder, breaker = %breaker, "broke stale store lock");
        remove_tombstone(&tombstone);
        return Ok(true);
    }

    debug!(holder = %moved, breaker = %breaker, "stale store lock already replaced; restoring");
    let restored = match fs::hard_link(&tombstone, &lock_file) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            // A third writer got in while the lock was aside; `moved` finds out through
            // `ensure_held` before it commits anything.
            warn!(holder = %moved, "store lock re-taken while restoring it");
            Ok(())
        }
        Err(err) => Err(err).context("restore store lock"),
    };
    remove_tombstone(&tombstone);
    restored.map(|()| false)
}

/// Take the write lock for the store in `store_dir`, retrying with exponential backoff.
///
/// # Errors
/// Returns `STORE_LOCK_TIMEOUT` when the lock stays held past `cfg.max_retries`, or an
/// I/O error if the lock file cannot be created.
pub fn acquire_store_lock(
    store_dir: &Path,
    owner: impl Into<String>,
    cfg: LockConfig,
) -> anyhow::Result<StoreLockGuard> {
    let owner = owner.into();
    let lock_file = paths::store_paths(store_dir).lock_file;

    let mut attempt: usize = 0;
    let mut wait_ms: u64 = INITIAL_BACKOFF_MS;

    loop {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_file)
        {
            Ok(mut f) => {
                writeln!(f, "{owner}").context("write store lock owner")?;
                f.flush().context("flush store lock owner")?;
                debug!(owner = %owner, "store lock acquired");
                return Ok(StoreLockGuard {
                    lock_file: Some(lock_file),
                    owner,
                });
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if let Some(stale_after) = cfg.stale_after {
                    if let Some(holder) = stale_holder(&lock_file, stale_after)? {
                        if break_stale(store_dir, &holder, stale_after, &owner)? {
                            continue;
                        }
                    }
                }
                if attempt >= cfg.max_retries {
                    return Err(anyhow::anyhow!("STORE_LOCK_TIMEOUT"));
                }
                sleep(Duration::from_millis(wait_ms));
                attempt = attempt.saturating_add(1);
                wait_ms = wait_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("create store lock file {}", lock_file.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, ensure};

    fn no_wait() -> LockConfig {
        LockConfig {
            max_retries: 0,
            stale_after: None,
        }
    }

    #[test]
    fn second_writer_times_out_until_release() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let guard = acquire_store_lock(dir.path(), "aaaa0001", no_wait())?;

        let Err(err) = acquire_store_lock(dir.path(), "bbbb0002", no_wait()) else {
            bail!("second writer should not get the lock");
        };
        ensure!(err.to_string().contains("STORE_LOCK_TIMEOUT"));

        guard.release()?;
        let again = acquire_store_lock(dir.path(), "bbbb0002", no_wait())?;
        ensure!(again.owner() == "bbbb0002");
        Ok(())
    }

    #[test]
    fn drop_releases_lock() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let _guard = acquire_store_lock(dir.path(), "aaaa0001", no_wait())?;
            ensure!(paths::store_paths(dir.path()).lock_file.exists());
        }
        ensure!(!paths::store_paths(dir.path()).lock_file.exists());
        Ok(())
    }

    #[test]
    fn stale_lock_is_broken() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lock_file = paths::store_paths(dir.path()).lock_file;
        fs::write(&lock_file, "crashed1\n")?;

        let cfg = LockConfig {
            max_retries: 0,
            stale_after: Some(Duration::ZERO),
        };
        let guard = acquire_store_lock(dir.path(), "aaaa0001", cfg)?;
        ensure!(fs::read_to_string(&lock_file)?.starts_with("aaaa0001"));
        guard.release()?;
        Ok(())
    }

    #[test]
    fn release_by_other_owner_is_noop() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lock_file = paths::store_paths(dir.path()).lock_file;
        let guard = acquire_store_lock(dir.path(), "aaaa0001", no_wait())?;
        release_if_owned(&lock_file, "bbbb0002")?;
        ensure!(lock_file.exists());
        guard.release()?;
        Ok(())
    }

    #[test]
    fn late_breaker_leaves_the_new_lock_alone() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lock_file = paths::store_paths(dir.path()).lock_file;
        fs::write(&lock_file, "crashed1\n")?;
        let cfg = LockConfig {
            max_retries: 0,
            stale_after: Some(Duration::ZERO),
        };

        // Writer B notices the stale lock first...
        let Some(seen_by_b) = stale_holder(&lock_file, Duration::ZERO)? else {
            bail!("lock should look stale");
        };
        ensure!(seen_by_b == "crashed1");

        // ...but writer A breaks it and takes the lock before B acts.
        let a = acquire_store_lock(dir.path(), "aaaa0001", cfg)?;

        ensure!(!break_stale(dir.path(), &seen_by_b, Duration::ZERO, "bbbb0002")?);
        ensure!(fs::read_to_string(&lock_file)?.starts_with("aaaa0001"));
        a.ensure_held()?;

        let leftovers = fs::read_dir(dir.path())?
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".stale."))
            .count();
        ensure!(leftovers == 0);
        a.release()?;
        ensure!(!lock_file.exists());
        Ok(())
    }

    #[test]
    fn guard_notices_a_lost_lock() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lock_file = paths::store_paths(dir.path()).lock_file;
        let guard = acquire_store_lock(dir.path(), "aaaa0001", no_wait())?;
        guard.ensure_held()?;

        fs::write(&lock_file, "bbbb0002\n")?;
        let Err(err) = guard.ensure_held() else {
            bail!("a replaced lock should be reported");
        };
        ensure!(err.to_string().contains("store lock lost"));

        drop(guard);
        ensure!(fs::read_to_string(&lock_file)?.starts_with("bbbb0002"));
        Ok(())
    }
}
