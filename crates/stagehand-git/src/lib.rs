//! # stagehand-git
//!
//! Read-only git access for the cleanup engine: commit existence, tag
//! and remote-branch listings, reference heads, and first-parent history
//! walks. The engine consumes the [`GitRepository`] trait; the real
//! implementation is gix-backed, and [`FakeGitRepository`] provides an
//! in-memory commit DAG for tests.
//!
//! No write operation exists anywhere in this crate.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

mod gix_repo;
mod memory;

pub use gix_repo::GixRepository;
pub use memory::FakeGitRepository;

use chrono::{DateTime, Utc};

use stagehand_core::error::Result;

/// A commit with the fields history scanning needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    /// Hex commit id.
    pub id: String,
    /// Parent commit ids, first parent first.
    pub parents: Vec<String>,
    /// Committer timestamp.
    pub committer_time: DateTime<Utc>,
}

/// The kind of git reference a keep policy selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// A remote branch.
    Branch,
    /// A tag.
    Tag,
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Branch => f.write_str("branch"),
            Self::Tag => f.write_str("tag"),
        }
    }
}

/// Read-only repository operations the cleanup engine consumes.
pub trait GitRepository: Send + Sync {
    /// Returns whether `commit` names an existing commit.
    ///
    /// A malformed hash is `Ok(false)`; other repository errors
    /// propagate.
    ///
    /// # Errors
    ///
    /// Fails on repository access errors.
    fn is_commit_exists(&self, commit: &str) -> Result<bool>;

    /// Lists local tag names.
    ///
    /// # Errors
    ///
    /// Fails on repository access errors.
    fn tags_list(&self) -> Result<Vec<String>>;

    /// Lists remote branch names, without the remote prefix.
    ///
    /// # Errors
    ///
    /// Fails on repository access errors.
    fn remote_branches_list(&self) -> Result<Vec<String>>;

    /// Resolves a reference to its head commit, or `None` when the
    /// reference does not exist.
    ///
    /// # Errors
    ///
    /// Fails on repository access errors.
    fn reference_head(&self, kind: ReferenceKind, name: &str) -> Result<Option<CommitInfo>>;

    /// Walks the first-parent chain from `head`, newest first.
    ///
    /// # Errors
    ///
    /// Fails when `head` or an ancestor cannot be read.
    fn walk_first_parent(&self, head: &str) -> Result<Vec<CommitInfo>>;
}
