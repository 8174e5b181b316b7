//! Error types and result aliases shared across stagehand components.
//!
//! Errors are structured for programmatic handling: the cleanup engine
//! reacts differently to an absent tag, a malformed tag, a lock timeout,
//! or an unauthorized registry, so each of those is its own variant
//! rather than a stringly-typed message.

use std::fmt;

/// The result type used throughout stagehand.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in stagehand operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A repository tag did not match any known record format.
    ///
    /// Enumeration code treats this as "skip the tag", never as a fatal
    /// condition; it exists as a variant so callers can match on it.
    #[error("unexpected tag format: {tag}")]
    UnexpectedTagFormat {
        /// The offending tag.
        tag: String,
    },

    /// A registry operation failed.
    #[error("registry error: {message}")]
    Registry {
        /// Description of the registry failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The registry rejected the caller's credentials.
    ///
    /// Fatal for the invocation; retrying without new credentials cannot
    /// succeed.
    #[error("registry unauthorized: {message}")]
    Unauthorized {
        /// Description of the authorization failure.
        message: String,
    },

    /// A git repository operation failed.
    #[error("git error: {message}")]
    Git {
        /// Description of the git failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A Kubernetes workload listing failed.
    ///
    /// Carries the workload kind so the operator knows which list call
    /// broke the probe.
    #[error("kubernetes error listing {kind}: {message}")]
    Kubernetes {
        /// The workload kind whose list call failed (e.g. `Deployments`).
        kind: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// A lock could not be acquired within its timeout.
    #[error("lock {name} unavailable: {message}")]
    LockUnavailable {
        /// The lock name.
        name: String,
        /// Description of the contention.
        message: String,
    },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled: {operation}")]
    Cancelled {
        /// The operation that was interrupted.
        operation: String,
    },

    /// The requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A validation rule was violated.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the violated rule.
        message: String,
    },

    /// The configuration could not be parsed or is inconsistent.
    #[error("config error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// A precondition for the operation was not met.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new registry error with the given message.
    #[must_use]
    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new registry error with a source cause.
    #[must_use]
    pub fn registry_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Registry {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new git error with the given message.
    #[must_use]
    pub fn git(message: impl Into<String>) -> Self {
        Self::Git {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new git error with a source cause.
    #[must_use]
    pub fn git_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Git {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new unexpected-tag-format error.
    #[must_use]
    pub fn unexpected_tag_format(tag: impl fmt::Display) -> Self {
        Self::UnexpectedTagFormat {
            tag: tag.to_string(),
        }
    }

    /// Returns true if this error is the unexpected-tag-format kind.
    ///
    /// Enumeration loops use this to decide between "skip the tag" and
    /// "abort the listing".
    #[must_use]
    pub fn is_unexpected_tag_format(&self) -> bool {
        matches!(self, Self::UnexpectedTagFormat { .. })
    }

    /// Returns true if this error is fatal for the whole invocation.
    ///
    /// Unauthorized registries and unavailable locks cannot be recovered
    /// by skipping one item.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized { .. } | Self::LockUnavailable { .. } | Self::Cancelled { .. }
        )
    }
}
