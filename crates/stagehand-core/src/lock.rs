//! Distributed lock protecting the shared stages-and-images repository.
//!
//! Many hosts may build against (and clean) the same remote repository,
//! so every mutation of it happens under a distributed lock. The lock is
//! implemented over a pluggable CAS backend:
//!
//! - **CAS (Compare-and-Swap)**: atomic acquisition via preconditioned writes
//! - **TTL (Time-to-Live)**: automatic expiry to prevent deadlocks
//! - **Lease renewal**: long operations extend their lease periodically
//! - **Retry with backoff**: transient conflicts are retried with jitter
//!
//! Two acquisition modes exist: `Exclusive` (cleanup, purge, stage
//! writes) and `Shared` (read-mostly operations that only need to fence
//! out exclusive writers). Shared holders coexist; an exclusive holder
//! excludes everyone.
//!
//! Backends: [`MemoryLockBackend`] for tests, [`FileLockBackend`] for a
//! single host, and a Kubernetes ConfigMap backend (in the kube crate)
//! for repositories shared between hosts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Default lock lease TTL (30 seconds).
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Default acquisition timeout for the stages-and-images lock.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(600);

/// Base backoff duration for retries.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Maximum backoff duration.
const BACKOFF_MAX: Duration = Duration::from_secs(5);

// ============================================================================
// Backend contract
// ============================================================================

/// Precondition for conditional writes (CAS operations).
///
/// The version token is opaque - backends interpret it according to their
/// semantics (file counter, ConfigMap resourceVersion, ...).
#[derive(Debug, Clone)]
pub enum WritePrecondition {
    /// Write only if the record does not exist.
    DoesNotExist,
    /// Write only if the record's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

/// Metadata about a stored lock record.
#[derive(Debug, Clone)]
pub struct LockRecordMeta {
    /// Version token for CAS operations.
    pub version: String,
}

/// Storage backend for distributed lock records.
///
/// The contract matches cloud CAS semantics: `put` never errors on a
/// failed precondition, that is a normal result.
#[async_trait]
pub trait LockBackend: Send + Sync + 'static {
    /// Reads a lock record.
    ///
    /// Returns `Error::NotFound` if the record doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Gets record metadata without reading content.
    ///
    /// Returns `None` if the record doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<LockRecordMeta>>;

    /// Writes a record with the given precondition.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes a record. Succeeds even if it doesn't exist (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;
}

// ============================================================================
// Lock record
// ============================================================================

/// Acquisition mode for the distributed lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LockMode {
    /// Multiple shared holders may coexist.
    Shared,
    /// A single holder excludes everyone else.
    Exclusive,
}

/// A single holder's lease within a lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HolderLease {
    /// Unique lock holder ID.
    pub holder_id: String,
    /// When this holder's lease expires.
    pub expires_at: DateTime<Utc>,
    /// When this holder acquired the lock.
    pub acquired_at: DateTime<Utc>,
}

impl HolderLease {
    fn new(holder_id: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.to_string(),
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30)),
            acquired_at: now,
        }
    }

    /// Returns whether this lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Lock record contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Current acquisition mode.
    pub mode: LockMode,
    /// Active leases. Expired leases are pruned on the next write.
    pub holders: Vec<HolderLease>,
    /// Monotonically increasing sequence number for distributed fencing.
    #[serde(default)]
    pub sequence_number: u64,
    /// Optional description of the operation holding the lock.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LockRecord {
    /// Returns the holders whose lease has not expired.
    #[must_use]
    pub fn live_holders(&self) -> Vec<&HolderLease> {
        self.holders.iter().filter(|h| !h.is_expired()).collect()
    }

    fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self).map_err(|e| {
            Error::Internal {
                message: format!("serialize lock record: {e}"),
            }
        })?))
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Internal {
            message: format!("parse lock record: {e}"),
        })
    }
}

// ============================================================================
// Distributed lock
// ============================================================================

/// A distributed lock backed by a CAS record store.
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    lock_path: String,
    holder_id: String,
}

impl DistributedLock {
    /// Creates a new distributed lock handle.
    ///
    /// Each handle gets a unique holder ID for identification.
    #[must_use]
    pub fn new(backend: Arc<dyn LockBackend>, lock_path: impl Into<String>) -> Self {
        Self {
            backend,
            lock_path: lock_path.into(),
            holder_id: Ulid::new().to_string(),
        }
    }

    /// Returns the holder ID for this lock handle.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Acquires the lock, retrying with backoff until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockUnavailable`] if the lock stays contended past
    /// the timeout, [`Error::Cancelled`] if the caller cancels the acquire.
    pub async fn acquire(
        &self,
        mode: LockMode,
        ttl: Duration,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockGuard> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = BACKOFF_BASE;
        let mut last_holder = String::from("unknown");

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    operation: format!("acquire lock {}", self.lock_path),
                });
            }

            match self.try_acquire(mode, ttl).await {
                Ok(guard) => return Ok(guard),
                Err(TryAcquireError::Contended(holder)) => {
                    last_holder = holder;
                }
                Err(TryAcquireError::Backend(e)) => return Err(e),
            }

            let jitter = Duration::from_millis(rand_jitter());
            let delay = backoff.min(BACKOFF_MAX) + jitter;
            if tokio::time::Instant::now() + delay >= deadline {
                return Err(Error::LockUnavailable {
                    name: self.lock_path.clone(),
                    message: format!("held by {last_holder} past acquire timeout"),
                });
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(Error::Cancelled {
                        operation: format!("acquire lock {}", self.lock_path),
                    });
                }
                () = tokio::time::sleep(delay) => {}
            }
            backoff = backoff.saturating_mul(2);
        }
    }

    /// Attempts to acquire the lock once (no retries).
    async fn try_acquire(
        &self,
        mode: LockMode,
        ttl: Duration,
    ) -> std::result::Result<LockGuard, TryAcquireError> {
        // Fast path: create a fresh record with DoesNotExist.
        let record = LockRecord {
            mode,
            holders: vec![HolderLease::new(&self.holder_id, ttl)],
            sequence_number: 1,
            operation: None,
        };
        let data = record.to_bytes().map_err(TryAcquireError::Backend)?;

        match self
            .backend
            .put(&self.lock_path, data, WritePrecondition::DoesNotExist)
            .await
            .map_err(TryAcquireError::Backend)?
        {
            WriteResult::Success { version } => {
                return Ok(LockGuard {
                    backend: Arc::clone(&self.backend),
                    lock_path: self.lock_path.clone(),
                    holder_id: self.holder_id.clone(),
                    version,
                    ttl,
                    released: false,
                });
            }
            WriteResult::PreconditionFailed { .. } => {
                // Record exists - fall through to the takeover/join path.
            }
        }

        // Version FIRST, then contents: the takeover decision must be bound
        // to the same version used for the CAS write below.
        let meta = self
            .backend
            .head(&self.lock_path)
            .await
            .map_err(TryAcquireError::Backend)?;
        let Some(meta) = meta else {
            // Record disappeared between the create attempt and now - retry.
            return Err(TryAcquireError::Contended("race".into()));
        };

        let existing = match self.backend.get(&self.lock_path).await {
            Ok(data) => LockRecord::from_bytes(&data).map_err(TryAcquireError::Backend)?,
            Err(Error::NotFound(_)) => return Err(TryAcquireError::Contended("race".into())),
            Err(e) => return Err(TryAcquireError::Backend(e)),
        };

        let live: Vec<HolderLease> = existing
            .holders
            .iter()
            .filter(|h| !h.is_expired())
            .cloned()
            .collect();

        let compatible = match mode {
            LockMode::Shared => live.is_empty() || existing.mode == LockMode::Shared,
            LockMode::Exclusive => live.is_empty(),
        };
        if !compatible {
            let holder = live
                .first()
                .map_or_else(|| "unknown".to_string(), |h| h.holder_id.clone());
            return Err(TryAcquireError::Contended(holder));
        }

        let mut holders = live;
        holders.push(HolderLease::new(&self.holder_id, ttl));
        let new_record = LockRecord {
            mode,
            holders,
            sequence_number: existing.sequence_number.saturating_add(1),
            operation: None,
        };
        let data = new_record.to_bytes().map_err(TryAcquireError::Backend)?;

        match self
            .backend
            .put(
                &self.lock_path,
                data,
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await
            .map_err(TryAcquireError::Backend)?
        {
            WriteResult::Success { version } => Ok(LockGuard {
                backend: Arc::clone(&self.backend),
                lock_path: self.lock_path.clone(),
                holder_id: self.holder_id.clone(),
                version,
                ttl,
                released: false,
            }),
            WriteResult::PreconditionFailed { .. } => {
                // Someone else raced us - retry.
                Err(TryAcquireError::Contended("unknown".into()))
            }
        }
    }

    /// Returns whether the lock currently has any live holder.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock state could not be read.
    pub async fn is_locked(&self) -> Result<bool> {
        match self.backend.get(&self.lock_path).await {
            Ok(data) => Ok(!LockRecord::from_bytes(&data)?.live_holders().is_empty()),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Forcefully breaks an existing lock (admin operation).
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be deleted.
    pub async fn force_break(&self) -> Result<()> {
        self.backend.delete(&self.lock_path).await
    }
}

enum TryAcquireError {
    Contended(String),
    Backend(Error),
}

// ============================================================================
// Guard
// ============================================================================

/// RAII guard for a held lock lease.
///
/// Prefer calling [`LockGuard::release`] explicitly; the drop path is
/// best-effort only.
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    lock_path: String,
    holder_id: String,
    version: String,
    ttl: Duration,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock_path", &self.lock_path)
            .field("holder_id", &self.holder_id)
            .field("version", &self.version)
            .field("ttl", &self.ttl)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    /// Returns the holder ID for this lease.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Explicitly releases this holder's lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the release write.
    pub async fn release(mut self) -> Result<()> {
        self.do_release().await
    }

    /// Extends this holder's lease by its TTL.
    ///
    /// Called periodically by the renewal task of long operations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PreconditionFailed`] if the lease was lost.
    pub async fn extend(&mut self) -> Result<()> {
        let meta = self
            .backend
            .head(&self.lock_path)
            .await?
            .ok_or_else(|| Error::NotFound(self.lock_path.clone()))?;
        let data = self.backend.get(&self.lock_path).await?;
        let mut record = LockRecord::from_bytes(&data)?;

        let Some(lease) = record
            .holders
            .iter_mut()
            .find(|h| h.holder_id == self.holder_id)
        else {
            return Err(Error::PreconditionFailed {
                message: format!("lease on {} lost before renewal", self.lock_path),
            });
        };
        lease.expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(30));
        record.holders.retain(|h| !h.is_expired());

        match self
            .backend
            .put(
                &self.lock_path,
                record.to_bytes()?,
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await?
        {
            WriteResult::Success { version } => {
                self.version = version;
                Ok(())
            }
            WriteResult::PreconditionFailed { .. } => Err(Error::PreconditionFailed {
                message: "lock record modified by another holder during renewal".into(),
            }),
        }
    }

    /// Removes this holder's lease from the record.
    ///
    /// Remaining shared holders keep the lock; when the last lease goes,
    /// the record stays behind with an empty holder list and is taken
    /// over by the next acquire.
    async fn do_release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }

        let meta = self.backend.head(&self.lock_path).await?;
        if let Some(meta) = meta {
            if let Ok(data) = self.backend.get(&self.lock_path).await {
                let mut record = LockRecord::from_bytes(&data)?;
                let before = record.holders.len();
                record
                    .holders
                    .retain(|h| h.holder_id != self.holder_id && !h.is_expired());

                if record.holders.len() != before {
                    // CAS with our version: if another holder raced us, leave
                    // their record intact and let TTL expiry clean our lease.
                    let _ = self
                        .backend
                        .put(
                            &self.lock_path,
                            record.to_bytes()?,
                            WritePrecondition::MatchesVersion(meta.version),
                        )
                        .await?;
                }
            }
        }

        self.released = true;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            // Best-effort async release; without a runtime the TTL handles
            // eventual cleanup.
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                return;
            };

            let backend = Arc::clone(&self.backend);
            let path = self.lock_path.clone();
            let holder = self.holder_id.clone();
            let version = self.version.clone();

            handle.spawn(async move {
                if let Ok(Some(meta)) = backend.head(&path).await {
                    if meta.version == version {
                        if let Ok(data) = backend.get(&path).await {
                            if let Ok(mut record) = LockRecord::from_bytes(&data) {
                                record.holders.retain(|h| h.holder_id != holder);
                                if let Ok(bytes) = record.to_bytes() {
                                    let _ = backend
                                        .put(
                                            &path,
                                            bytes,
                                            WritePrecondition::MatchesVersion(version),
                                        )
                                        .await;
                                }
                            }
                        }
                    }
                }
            });
        }
    }
}

/// Generates random jitter for backoff (0-50ms).
fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 50
}

// ============================================================================
// Memory backend
// ============================================================================

/// In-memory lock backend for tests.
#[derive(Default)]
pub struct MemoryLockBackend {
    records: std::sync::RwLock<std::collections::HashMap<String, (Bytes, u64)>>,
}

impl MemoryLockBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let records = self.records.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        records
            .get(path)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| Error::NotFound(format!("lock record not found: {path}")))
    }

    async fn head(&self, path: &str) -> Result<Option<LockRecordMeta>> {
        let records = self.records.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        Ok(records.get(path).map(|(_, version)| LockRecordMeta {
            version: version.to_string(),
        }))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut records = self.records.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        let current = records.get(path).map(|(_, v)| *v);
        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(version) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected: u64 = expected.parse().unwrap_or(0);
                match current {
                    Some(version) if version == expected => {}
                    Some(version) => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".into(),
                        });
                    }
                }
            }
            WritePrecondition::None => {}
        }

        let next = current.unwrap_or(0) + 1;
        records.insert(path.to_string(), (data, next));
        Ok(WriteResult::Success {
            version: next.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut records = self.records.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        records.remove(path);
        Ok(())
    }
}

// ============================================================================
// File backend
// ============================================================================

/// File-based lock backend for a single host.
///
/// Stores each record as `{"version": N, "payload": "..."}` in a file
/// under the backend directory. The read-compare-rename CAS is not atomic
/// across hosts; repositories shared between hosts must use the
/// Kubernetes ConfigMap backend instead.
pub struct FileLockBackend {
    dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct FileRecord {
    version: u64,
    payload: String,
}

impl FileLockBackend {
    /// Creates a backend rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| Error::Internal {
            message: format!("create lock dir {}: {e}", dir.display()),
        })?;
        Ok(Self { dir })
    }

    fn record_path(&self, path: &str) -> PathBuf {
        let sanitized: String = path
            .chars()
            .map(|c| if c == '/' || c == ':' { '_' } else { c })
            .collect();
        self.dir.join(sanitized)
    }

    async fn read_record(&self, path: &str) -> Result<Option<FileRecord>> {
        match tokio::fs::read(self.record_path(path)).await {
            Ok(data) => {
                let record: FileRecord =
                    serde_json::from_slice(&data).map_err(|e| Error::Internal {
                        message: format!("parse lock file: {e}"),
                    })?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Internal {
                message: format!("read lock file: {e}"),
            }),
        }
    }

    async fn write_record(&self, path: &str, record: &FileRecord) -> Result<()> {
        let target = self.record_path(path);
        let tmp = target.with_extension("tmp");
        let data = serde_json::to_vec(record).map_err(|e| Error::Internal {
            message: format!("serialize lock file: {e}"),
        })?;
        tokio::fs::write(&tmp, data).await.map_err(|e| Error::Internal {
            message: format!("write lock file: {e}"),
        })?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| Error::Internal {
                message: format!("rename lock file: {e}"),
            })
    }
}

#[async_trait]
impl LockBackend for FileLockBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        match self.read_record(path).await? {
            Some(record) => Ok(Bytes::from(record.payload.into_bytes())),
            None => Err(Error::NotFound(format!("lock record not found: {path}"))),
        }
    }

    async fn head(&self, path: &str) -> Result<Option<LockRecordMeta>> {
        Ok(self.read_record(path).await?.map(|r| LockRecordMeta {
            version: r.version.to_string(),
        }))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let payload = String::from_utf8(data.to_vec()).map_err(|e| Error::Internal {
            message: format!("lock payload not utf-8: {e}"),
        })?;
        let current = self.read_record(path).await?;

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(record) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: record.version.to_string(),
                    });
                }
                let record = FileRecord {
                    version: 1,
                    payload,
                };
                self.write_record(path, &record).await?;
                Ok(WriteResult::Success {
                    version: "1".into(),
                })
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected: u64 = expected.parse().unwrap_or(0);
                match current {
                    Some(record) if record.version == expected => {
                        let next = FileRecord {
                            version: expected + 1,
                            payload,
                        };
                        self.write_record(path, &next).await?;
                        Ok(WriteResult::Success {
                            version: next.version.to_string(),
                        })
                    }
                    Some(record) => Ok(WriteResult::PreconditionFailed {
                        current_version: record.version.to_string(),
                    }),
                    None => Ok(WriteResult::PreconditionFailed {
                        current_version: "0".into(),
                    }),
                }
            }
            WritePrecondition::None => {
                let version = current.map_or(1, |r| r.version + 1);
                let record = FileRecord { version, payload };
                self.write_record(path, &record).await?;
                Ok(WriteResult::Success {
                    version: version.to_string(),
                })
            }
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Internal {
                message: format!("delete lock file: {e}"),
            }),
        }
    }
}

// ============================================================================
// Project lock manager
// ============================================================================

/// Options for [`LockManager::lock_stages_and_images`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LockStagesAndImagesOptions {
    /// Acquire in shared mode: only fences out exclusive writers, for
    /// operations that create image records but never delete.
    pub get_or_create_images_only: bool,
}

/// Per-project lock manager for the shared stages-and-images repository.
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    ttl: Duration,
    acquire_timeout: Duration,
}

impl LockManager {
    /// Creates a lock manager over the given backend with default timings.
    #[must_use]
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend,
            ttl: DEFAULT_LOCK_TTL,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Overrides the lease TTL (tests).
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Overrides the acquisition timeout (tests).
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Locks the project's stages-and-images resource.
    ///
    /// The returned handle renews its lease in the background until
    /// released. Release explicitly; dropping the handle cancels renewal
    /// and releases best-effort.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockUnavailable`] on acquire timeout and
    /// [`Error::Cancelled`] when the caller cancels.
    pub async fn lock_stages_and_images(
        &self,
        project: &str,
        options: LockStagesAndImagesOptions,
        cancel: &CancellationToken,
    ) -> Result<StagesAndImagesLock> {
        let mode = if options.get_or_create_images_only {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };
        let path = format!("{project}.stages-and-images.lock");
        let lock = DistributedLock::new(Arc::clone(&self.backend), path.clone());
        let mut guard = lock.acquire(mode, self.ttl, self.acquire_timeout, cancel).await?;

        tracing::debug!(project, mode = ?mode, "acquired stages-and-images lock");

        let stop = CancellationToken::new();
        let renew_stop = stop.clone();
        let renew_interval = self.ttl / 3;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = renew_stop.cancelled() => {
                        return guard.release().await;
                    }
                    () = tokio::time::sleep(renew_interval) => {
                        if let Err(e) = guard.extend().await {
                            tracing::warn!(error = %e, "stages-and-images lease renewal failed");
                        }
                    }
                }
            }
        });

        Ok(StagesAndImagesLock { stop, task: Some(task) })
    }
}

/// A held stages-and-images lock with background lease renewal.
pub struct StagesAndImagesLock {
    stop: CancellationToken,
    task: Option<tokio::task::JoinHandle<Result<()>>>,
}

impl StagesAndImagesLock {
    /// Stops renewal and releases the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the release write failed.
    pub async fn release(mut self) -> Result<()> {
        self.stop.cancel();
        match self.task.take().expect("task present until release").await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal {
                message: format!("lock renewal task failed: {e}"),
            }),
        }
    }
}

impl Drop for StagesAndImagesLock {
    fn drop(&mut self) {
        // Cancelling the renewal task triggers the guard release path.
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Arc<dyn LockBackend> {
        Arc::new(MemoryLockBackend::new())
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let backend = memory();
        let lock = DistributedLock::new(Arc::clone(&backend), "test.lock");
        let cancel = CancellationToken::new();

        let guard = lock
            .acquire(
                LockMode::Exclusive,
                Duration::from_secs(30),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .expect("acquire");
        assert!(!guard.holder_id().is_empty());
        assert!(lock.is_locked().await.expect("check"));

        guard.release().await.expect("release");
        assert!(!lock.is_locked().await.expect("check"));
    }

    #[tokio::test]
    async fn test_exclusive_excludes_second_holder() {
        let backend = memory();
        let first = DistributedLock::new(Arc::clone(&backend), "test.lock");
        let second = DistributedLock::new(Arc::clone(&backend), "test.lock");
        let cancel = CancellationToken::new();

        let _guard = first
            .acquire(
                LockMode::Exclusive,
                Duration::from_secs(30),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .expect("acquire");

        let err = second
            .acquire(
                LockMode::Exclusive,
                Duration::from_secs(30),
                Duration::from_millis(300),
                &cancel,
            )
            .await
            .expect_err("second acquire should time out");
        assert!(matches!(err, Error::LockUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_shared_holders_coexist() {
        let backend = memory();
        let first = DistributedLock::new(Arc::clone(&backend), "test.lock");
        let second = DistributedLock::new(Arc::clone(&backend), "test.lock");
        let cancel = CancellationToken::new();

        let a = first
            .acquire(
                LockMode::Shared,
                Duration::from_secs(30),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .expect("first shared");
        let b = second
            .acquire(
                LockMode::Shared,
                Duration::from_secs(30),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .expect("second shared");

        a.release().await.expect("release a");
        b.release().await.expect("release b");
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let backend = memory();
        let first = DistributedLock::new(Arc::clone(&backend), "test.lock");
        let second = DistributedLock::new(Arc::clone(&backend), "test.lock");
        let cancel = CancellationToken::new();

        let guard = first
            .acquire(
                LockMode::Exclusive,
                Duration::from_millis(20),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .expect("acquire");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let taken = second
            .acquire(
                LockMode::Exclusive,
                Duration::from_secs(30),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .expect("takeover of expired lease");
        taken.release().await.expect("release");
        drop(guard);
    }

    #[tokio::test]
    async fn test_extend_renews_lease() {
        let backend = memory();
        let lock = DistributedLock::new(Arc::clone(&backend), "test.lock");
        let cancel = CancellationToken::new();

        let mut guard = lock
            .acquire(
                LockMode::Exclusive,
                Duration::from_secs(30),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .expect("acquire");
        guard.extend().await.expect("extend");
        guard.release().await.expect("release");
    }

    #[tokio::test]
    async fn test_cancelled_acquire_aborts() {
        let backend = memory();
        let first = DistributedLock::new(Arc::clone(&backend), "test.lock");
        let second = DistributedLock::new(Arc::clone(&backend), "test.lock");
        let cancel = CancellationToken::new();

        let _guard = first
            .acquire(
                LockMode::Exclusive,
                Duration::from_secs(30),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .expect("acquire");

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = second
            .acquire(
                LockMode::Exclusive,
                Duration::from_secs(30),
                Duration::from_secs(5),
                &cancelled,
            )
            .await
            .expect_err("cancelled acquire");
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_lock_manager_round_trip() {
        let backend = memory();
        let manager = LockManager::new(backend).with_ttl(Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let lock = manager
            .lock_stages_and_images("demo", LockStagesAndImagesOptions::default(), &cancel)
            .await
            .expect("lock");
        lock.release().await.expect("release");
    }

    #[tokio::test]
    async fn test_file_backend_cas() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FileLockBackend::new(dir.path()).expect("backend");

        let result = backend
            .put(
                "demo.lock",
                Bytes::from_static(b"{}"),
                WritePrecondition::DoesNotExist,
            )
            .await
            .expect("put");
        let version = match result {
            WriteResult::Success { version } => version,
            WriteResult::PreconditionFailed { .. } => panic!("fresh record must succeed"),
        };

        let conflict = backend
            .put(
                "demo.lock",
                Bytes::from_static(b"{}"),
                WritePrecondition::DoesNotExist,
            )
            .await
            .expect("put");
        assert!(matches!(conflict, WriteResult::PreconditionFailed { .. }));

        let update = backend
            .put(
                "demo.lock",
                Bytes::from_static(b"{\"x\":1}"),
                WritePrecondition::MatchesVersion(version),
            )
            .await
            .expect("put");
        assert!(matches!(update, WriteResult::Success { .. }));

        backend.delete("demo.lock").await.expect("delete");
        assert!(backend.head("demo.lock").await.expect("head").is_none());
    }
}
