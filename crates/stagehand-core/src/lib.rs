//! # stagehand-core
//!
//! Core abstractions for the stagehand cleanup orchestrator.
//!
//! This crate provides the foundational types and traits used across all
//! stagehand components:
//!
//! - **Error Types**: shared error definitions and result types
//! - **Locks**: the distributed stages-and-images lock and per-host named locks
//! - **Configuration**: cleanup/keep-policy config parsed from YAML
//! - **Probe Contract**: the deployed-images probe the engine consumes
//! - **Observability**: logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `stagehand-core` is the only crate allowed to define shared
//! primitives. All cross-component interaction happens via the contracts
//! defined here.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cancel;
pub mod config;
pub mod error;
pub mod host_lock;
pub mod lock;
pub mod observability;
pub mod probe;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{CleanupConfig, GitHistoryCleanupConfig, ReferencePolicy};
    pub use crate::error::{Error, Result};
    pub use crate::host_lock::{HostLockGuard, HostLocker};
    pub use crate::lock::{
        DistributedLock, LockBackend, LockGuard, LockManager, LockMode, MemoryLockBackend,
    };
    pub use crate::probe::DeployedImagesProbe;
}

pub use config::{CleanupConfig, GitHistoryCleanupConfig, ReferencePolicy, RetentionPolicies};
pub use error::{Error, Result};
pub use host_lock::{HostLockGuard, HostLocker, DEFAULT_HOST_LOCK_TIMEOUT};
pub use lock::{
    DistributedLock, FileLockBackend, LockBackend, LockGuard, LockManager, LockMode,
    LockRecordMeta, LockStagesAndImagesOptions, MemoryLockBackend, StagesAndImagesLock,
    WritePrecondition, WriteResult,
};
pub use observability::{init_logging, LogFormat};
pub use probe::{DeployedImagesProbe, StaticImagesProbe};
