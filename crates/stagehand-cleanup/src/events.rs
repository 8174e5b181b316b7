//! Progress events.
//!
//! The engine reports progress as structured events into a passive sink,
//! keeping control flow free of logging concerns and the engine testable
//! without a live log collaborator.

use std::sync::Mutex;

/// A structured cleanup progress event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupEvent {
    /// A phase began.
    PhaseStarted {
        /// Phase name.
        phase: &'static str,
    },
    /// A phase finished.
    PhaseCompleted {
        /// Phase name.
        phase: &'static str,
        /// Tags deleted during the phase.
        deleted: usize,
        /// Tags kept by the phase.
        kept: usize,
    },
    /// A phase failed.
    PhaseFailed {
        /// Phase name.
        phase: &'static str,
        /// Failure description.
        error: String,
    },
    /// A published image tag was deleted (or would be, in dry-run).
    ImageDeleted {
        /// Owning image name.
        image: String,
        /// The deleted tag.
        tag: String,
        /// Whether this was a dry-run intention.
        dry_run: bool,
    },
    /// A published image tag was kept.
    ImageKept {
        /// Owning image name.
        image: String,
        /// The kept tag.
        tag: String,
        /// Why the tag survived.
        reason: &'static str,
    },
    /// A per-commit metadata record was deleted (or would be, in dry-run).
    MetadataDeleted {
        /// Owning image name.
        image: String,
        /// The record's commit.
        commit: String,
        /// Whether this was a dry-run intention.
        dry_run: bool,
    },
}

/// A passive consumer of cleanup events.
pub trait ProgressSink: Send + Sync {
    /// Consumes one event.
    fn emit(&self, event: &CleanupEvent);
}

/// Sink that forwards events to structured logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: &CleanupEvent) {
        match event {
            CleanupEvent::PhaseStarted { phase } => {
                tracing::info!(phase, "phase started");
            }
            CleanupEvent::PhaseCompleted {
                phase,
                deleted,
                kept,
            } => {
                tracing::info!(phase, deleted, kept, "phase completed");
            }
            CleanupEvent::PhaseFailed { phase, error } => {
                tracing::error!(phase, error, "phase failed");
            }
            CleanupEvent::ImageDeleted { image, tag, dry_run } => {
                if *dry_run {
                    tracing::info!(image, tag, "would delete tag (dry run)");
                } else {
                    tracing::info!(image, tag, "deleted tag");
                }
            }
            CleanupEvent::ImageKept { image, tag, reason } => {
                tracing::info!(image, tag, reason, "kept tag");
            }
            CleanupEvent::MetadataDeleted {
                image,
                commit,
                dry_run,
            } => {
                if *dry_run {
                    tracing::info!(image, commit, "would delete metadata record (dry run)");
                } else {
                    tracing::info!(image, commit, "deleted metadata record");
                }
            }
        }
    }
}

/// Sink that records events for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<CleanupEvent>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the recorded events.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (test-only type).
    #[must_use]
    pub fn events(&self) -> Vec<CleanupEvent> {
        self.events.lock().expect("lock").clone()
    }
}

impl ProgressSink for CollectingSink {
    fn emit(&self, event: &CleanupEvent) {
        self.events.lock().expect("lock").push(event.clone());
    }
}
