//! Host-local named locks.
//!
//! Long-running operations (`images-cleanup.<repo>`,
//! `stages-purge.<project>`) take a per-host lock in addition to the
//! distributed one, so two local invocations of the same kind never run
//! concurrently. The lock is a file under the stagehand home directory
//! holding the owner's pid; a lock whose owner process is gone is stale
//! and taken over.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Default acquisition timeout for host locks (600 seconds).
pub const DEFAULT_HOST_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

/// Poll interval while waiting for a contended host lock.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Serialize, Deserialize)]
struct HostLockFile {
    pid: u32,
    acquired_at: chrono::DateTime<chrono::Utc>,
}

/// Acquires named per-host locks under a common directory.
pub struct HostLocker {
    dir: PathBuf,
}

impl HostLocker {
    /// Creates a locker rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| Error::Internal {
            message: format!("create host lock dir {}: {e}", dir.display()),
        })?;
        Ok(Self { dir })
    }

    /// Creates a locker under the default stagehand home
    /// (`$STAGEHAND_HOME` or `~/.stagehand`), in its `locks` subdirectory.
    ///
    /// # Errors
    ///
    /// Returns an error if no home directory can be determined.
    pub fn default_for_host() -> Result<Self> {
        let home = std::env::var_os("STAGEHAND_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".stagehand")))
            .ok_or_else(|| Error::Config {
                message: "neither STAGEHAND_HOME nor HOME is set".into(),
            })?;
        Self::new(home.join("locks"))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        let sanitized: String = name
            .chars()
            .map(|c| if c == '/' || c == ':' { '_' } else { c })
            .collect();
        self.dir.join(format!("{sanitized}.lock"))
    }

    /// Acquires the named lock, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockUnavailable`] on timeout and
    /// [`Error::Cancelled`] when the caller cancels the wait.
    pub async fn acquire(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HostLockGuard> {
        let path = self.lock_path(name);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.try_acquire(&path).await? {
                Some(guard) => {
                    tracing::debug!(lock = name, "acquired host lock");
                    return Ok(guard);
                }
                None => {
                    if tokio::time::Instant::now() + POLL_INTERVAL >= deadline {
                        return Err(Error::LockUnavailable {
                            name: name.to_string(),
                            message: format!(
                                "another local invocation holds it past {}s",
                                timeout.as_secs()
                            ),
                        });
                    }
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Err(Error::Cancelled {
                                operation: format!("acquire host lock {name}"),
                            });
                        }
                        () = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                }
            }
        }
    }

    async fn try_acquire(&self, path: &PathBuf) -> Result<Option<HostLockGuard>> {
        let contents = serde_json::to_vec(&HostLockFile {
            pid: std::process::id(),
            acquired_at: chrono::Utc::now(),
        })
        .map_err(|e| Error::Internal {
            message: format!("serialize host lock: {e}"),
        })?;

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                use std::io::Write as _;
                file.write_all(&contents).map_err(|e| Error::Internal {
                    message: format!("write host lock: {e}"),
                })?;
                Ok(Some(HostLockGuard { path: path.clone() }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if self.owner_is_gone(path) {
                    // Stale lock from a dead process; remove and retry on
                    // the next poll tick.
                    let _ = std::fs::remove_file(path);
                }
                Ok(None)
            }
            Err(e) => Err(Error::Internal {
                message: format!("create host lock {}: {e}", path.display()),
            }),
        }
    }

    /// Returns true when the lock file's owner process no longer exists.
    fn owner_is_gone(&self, path: &PathBuf) -> bool {
        let Ok(data) = std::fs::read(path) else {
            return false;
        };
        let Ok(lock) = serde_json::from_slice::<HostLockFile>(&data) else {
            // Unreadable lock file: treat as stale.
            return true;
        };
        if lock.pid == std::process::id() {
            return false;
        }
        !PathBuf::from(format!("/proc/{}", lock.pid)).exists()
    }
}

/// RAII guard for a held host lock; deletes the lock file on drop.
#[derive(Debug)]
pub struct HostLockGuard {
    path: PathBuf,
}

impl HostLockGuard {
    /// Explicitly releases the lock.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for HostLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let locker = HostLocker::new(dir.path()).expect("locker");
        let cancel = CancellationToken::new();

        let guard = locker
            .acquire("images-cleanup.registry.local_demo", Duration::from_secs(1), &cancel)
            .await
            .expect("acquire");
        guard.release();

        // Released lock can be re-acquired immediately.
        let guard = locker
            .acquire("images-cleanup.registry.local_demo", Duration::from_secs(1), &cancel)
            .await
            .expect("re-acquire");
        drop(guard);
    }

    #[tokio::test]
    async fn test_contended_lock_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let locker = HostLocker::new(dir.path()).expect("locker");
        let cancel = CancellationToken::new();

        let _guard = locker
            .acquire("stages-purge.demo", Duration::from_secs(1), &cancel)
            .await
            .expect("acquire");

        let err = locker
            .acquire("stages-purge.demo", Duration::from_millis(100), &cancel)
            .await
            .expect_err("second acquire must time out");
        assert!(matches!(err, Error::LockUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_distinct_names_do_not_contend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let locker = HostLocker::new(dir.path()).expect("locker");
        let cancel = CancellationToken::new();

        let _a = locker
            .acquire("images-cleanup.repo-a", Duration::from_secs(1), &cancel)
            .await
            .expect("a");
        let _b = locker
            .acquire("images-cleanup.repo-b", Duration::from_secs(1), &cancel)
            .await
            .expect("b");
    }
}
