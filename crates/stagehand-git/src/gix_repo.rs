//! gix-backed repository adapter.

use std::path::Path;

use chrono::{DateTime, Utc};

use stagehand_core::error::{Error, Result};

use crate::{CommitInfo, GitRepository, ReferenceKind};

/// A local git working copy opened read-only.
pub struct GixRepository {
    repo: gix::ThreadSafeRepository,
}

impl GixRepository {
    /// Opens the repository at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Git`] when `path` is not a git repository.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let repo = gix::open(path.as_ref())
            .map_err(|e| Error::git(format!("open {}: {e}", path.as_ref().display())))?;
        Ok(Self {
            repo: repo.into_sync(),
        })
    }

    fn commit_info(&self, repo: &gix::Repository, id: gix::ObjectId) -> Result<CommitInfo> {
        let object = repo
            .try_find_object(id)
            .map_err(|e| Error::git(format!("find object {id}: {e}")))?
            .ok_or_else(|| Error::git(format!("object {id} disappeared during walk")))?;
        let commit = object
            .try_into_commit()
            .map_err(|e| Error::git(format!("object {id} is not a commit: {e}")))?;
        let time = commit
            .time()
            .map_err(|e| Error::git(format!("read commit {id} time: {e}")))?;

        Ok(CommitInfo {
            id: id.to_string(),
            parents: commit.parent_ids().map(|parent| parent.to_string()).collect(),
            committer_time: DateTime::<Utc>::from_timestamp(time.seconds, 0)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        })
    }

    fn head_of_reference(
        &self,
        repo: &gix::Repository,
        full_name: &str,
    ) -> Result<Option<CommitInfo>> {
        let reference = repo
            .try_find_reference(full_name)
            .map_err(|e| Error::git(format!("find reference {full_name}: {e}")))?;
        let Some(mut reference) = reference else {
            return Ok(None);
        };
        let id = reference
            .peel_to_id_in_place()
            .map_err(|e| Error::git(format!("peel reference {full_name}: {e}")))?;
        self.commit_info(repo, id.detach()).map(Some)
    }
}

impl GitRepository for GixRepository {
    fn is_commit_exists(&self, commit: &str) -> Result<bool> {
        let repo = self.repo.to_thread_local();
        // A malformed hash is "does not exist", not an error.
        let Ok(id) = gix::ObjectId::from_hex(commit.as_bytes()) else {
            tracing::debug!(commit, "bad commit hash");
            return Ok(false);
        };
        let result = match repo.try_find_object(id) {
            Ok(Some(object)) => Ok(object.kind == gix::object::Kind::Commit),
            Ok(None) => Ok(false),
            Err(e) => Err(Error::git(format!("find commit {commit}: {e}"))),
        };
        result
    }

    fn tags_list(&self) -> Result<Vec<String>> {
        let repo = self.repo.to_thread_local();
        let platform = repo
            .references()
            .map_err(|e| Error::git(format!("read references: {e}")))?;
        let mut tags = Vec::new();
        for reference in platform
            .tags()
            .map_err(|e| Error::git(format!("iterate tags: {e}")))?
        {
            let reference = reference.map_err(|e| Error::git(format!("read tag: {e}")))?;
            tags.push(reference.name().shorten().to_string());
        }
        tags.sort();
        Ok(tags)
    }

    fn remote_branches_list(&self) -> Result<Vec<String>> {
        let repo = self.repo.to_thread_local();
        let platform = repo
            .references()
            .map_err(|e| Error::git(format!("read references: {e}")))?;
        let mut branches = Vec::new();
        for reference in platform
            .remote_branches()
            .map_err(|e| Error::git(format!("iterate remote branches: {e}")))?
        {
            let reference =
                reference.map_err(|e| Error::git(format!("read remote branch: {e}")))?;
            let short = reference.name().shorten().to_string();
            // "origin/main" -> "main"; symbolic "origin/HEAD" is noise.
            let Some((_, name)) = short.split_once('/') else {
                continue;
            };
            if name == "HEAD" {
                continue;
            }
            branches.push(name.to_string());
        }
        branches.sort();
        branches.dedup();
        Ok(branches)
    }

    fn reference_head(&self, kind: ReferenceKind, name: &str) -> Result<Option<CommitInfo>> {
        let repo = self.repo.to_thread_local();
        match kind {
            ReferenceKind::Tag => self.head_of_reference(&repo, &format!("refs/tags/{name}")),
            ReferenceKind::Branch => {
                if let Some(info) =
                    self.head_of_reference(&repo, &format!("refs/remotes/origin/{name}"))?
                {
                    return Ok(Some(info));
                }
                // Branch tracked under a non-origin remote.
                let platform = repo
                    .references()
                    .map_err(|e| Error::git(format!("read references: {e}")))?;
                for reference in platform
                    .remote_branches()
                    .map_err(|e| Error::git(format!("iterate remote branches: {e}")))?
                {
                    let reference =
                        reference.map_err(|e| Error::git(format!("read remote branch: {e}")))?;
                    let short = reference.name().shorten().to_string();
                    if short.split_once('/').map(|(_, rest)| rest) == Some(name) {
                        let full = reference.name().as_bstr().to_string();
                        return self.head_of_reference(&repo, &full);
                    }
                }
                Ok(None)
            }
        }
    }

    fn walk_first_parent(&self, head: &str) -> Result<Vec<CommitInfo>> {
        let repo = self.repo.to_thread_local();
        let mut current = Some(
            gix::ObjectId::from_hex(head.as_bytes())
                .map_err(|e| Error::git(format!("bad commit hash {head}: {e}")))?,
        );

        let mut chain = Vec::new();
        while let Some(id) = current {
            let info = self.commit_info(&repo, id)?;
            current = match info.parents.first() {
                Some(parent) => Some(
                    gix::ObjectId::from_hex(parent.as_bytes())
                        .map_err(|e| Error::git(format!("bad parent hash {parent}: {e}")))?,
                ),
                None => None,
            };
            chain.push(info);
        }
        Ok(chain)
    }
}
