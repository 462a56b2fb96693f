//! Advisory, named, bounded-timeout locks.
//!
//! Every durable mutation in baton runs while holding a [`LockGuard`] for the
//! resource it touches. Locks are OS advisory locks on a sibling
//! `<resource>.lock` file, so they vanish with the owning process even if it
//! crashes. The lock file itself is never removed: unlinking a lock file
//! while another process waits on it would let two holders coexist.

use crate::error::{BatonError, Result};
use crate::paths;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct LockManager {
    timeout: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire the lock for `resource` with the manager's default timeout.
    pub fn acquire(&self, resource: &Path) -> Result<LockGuard> {
        self.acquire_with_timeout(resource, self.timeout)
    }

    /// Acquire an exclusive lock for `resource`, waiting at most `timeout`.
    ///
    /// Fails with [`BatonError::LockUnavailable`] when the lock file cannot be
    /// created or locked for a reason other than contention, and with
    /// [`BatonError::LockTimeout`] when another holder keeps it past the
    /// deadline.
    pub fn acquire_with_timeout(&self, resource: &Path, timeout: Duration) -> Result<LockGuard> {
        let path = paths::lock_path(resource);
        let unavailable = |source: std::io::Error| BatonError::LockUnavailable {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(unavailable)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(unavailable)?;

        let start = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(lock = %path.display(), waited_ms = start.elapsed().as_millis() as u64, "lock acquired");
                    return Ok(LockGuard {
                        file: Some(file),
                        path,
                    });
                }
                Err(e) if is_contended(&e) => {
                    let waited = start.elapsed();
                    if waited >= timeout {
                        return Err(BatonError::LockTimeout { path, waited });
                    }
                    trace!(lock = %path.display(), "lock busy, backing off");
                    std::thread::sleep(backoff.min(timeout - waited));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(unavailable(e)),
            }
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Held lock. Dropping the guard releases it.
#[derive(Debug)]
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, surfacing any unlock error.
    pub fn release(mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.unlock().map_err(|source| BatonError::LockUnavailable {
                path: self.path.clone(),
                source,
            })?;
            debug!(lock = %self.path.display(), "lock released");
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
