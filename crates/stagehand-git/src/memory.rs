//! In-memory commit DAG for tests.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use stagehand_core::error::{Error, Result};

use crate::{CommitInfo, GitRepository, ReferenceKind};

/// A fake repository built commit by commit.
#[derive(Debug, Default)]
pub struct FakeGitRepository {
    commits: HashMap<String, CommitInfo>,
    branches: HashMap<String, String>,
    tags: HashMap<String, String>,
}

impl FakeGitRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a commit with the given parents and committer time.
    pub fn add_commit(&mut self, id: &str, parents: &[&str], committer_time: DateTime<Utc>) {
        self.commits.insert(
            id.to_string(),
            CommitInfo {
                id: id.to_string(),
                parents: parents.iter().map(ToString::to_string).collect(),
                committer_time,
            },
        );
    }

    /// Points a remote branch at a head commit.
    pub fn add_branch(&mut self, name: &str, head: &str) {
        self.branches.insert(name.to_string(), head.to_string());
    }

    /// Points a tag at a head commit.
    pub fn add_tag(&mut self, name: &str, head: &str) {
        self.tags.insert(name.to_string(), head.to_string());
    }
}

impl GitRepository for FakeGitRepository {
    fn is_commit_exists(&self, commit: &str) -> Result<bool> {
        Ok(self.commits.contains_key(commit))
    }

    fn tags_list(&self) -> Result<Vec<String>> {
        let mut tags: Vec<String> = self.tags.keys().cloned().collect();
        tags.sort();
        Ok(tags)
    }

    fn remote_branches_list(&self) -> Result<Vec<String>> {
        let mut branches: Vec<String> = self.branches.keys().cloned().collect();
        branches.sort();
        Ok(branches)
    }

    fn reference_head(&self, kind: ReferenceKind, name: &str) -> Result<Option<CommitInfo>> {
        let head = match kind {
            ReferenceKind::Branch => self.branches.get(name),
            ReferenceKind::Tag => self.tags.get(name),
        };
        Ok(head.and_then(|head| self.commits.get(head)).cloned())
    }

    fn walk_first_parent(&self, head: &str) -> Result<Vec<CommitInfo>> {
        let mut chain = Vec::new();
        let mut current = Some(head.to_string());
        while let Some(id) = current {
            let info = self
                .commits
                .get(&id)
                .ok_or_else(|| Error::git(format!("unknown commit {id}")))?
                .clone();
            current = info.parents.first().cloned();
            chain.push(info);
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_walk_follows_first_parent() {
        let mut repo = FakeGitRepository::new();
        repo.add_commit("c1", &[], at(1));
        repo.add_commit("c2", &["c1"], at(2));
        // Merge commit: first parent c2, second parent c1.
        repo.add_commit("c3", &["c2", "c1"], at(3));
        repo.add_branch("main", "c3");

        let chain = repo.walk_first_parent("c3").expect("walk");
        let ids: Vec<&str> = chain.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c3", "c2", "c1"]);
    }

    #[test]
    fn test_reference_head_lookup() {
        let mut repo = FakeGitRepository::new();
        repo.add_commit("c1", &[], at(1));
        repo.add_tag("v1", "c1");

        let head = repo
            .reference_head(ReferenceKind::Tag, "v1")
            .expect("lookup")
            .expect("present");
        assert_eq!(head.id, "c1");
        assert!(repo
            .reference_head(ReferenceKind::Branch, "main")
            .expect("lookup")
            .is_none());
    }

    #[test]
    fn test_commit_existence() {
        let mut repo = FakeGitRepository::new();
        repo.add_commit("c1", &[], at(1));
        assert!(repo.is_commit_exists("c1").expect("check"));
        assert!(!repo.is_commit_exists("nope").expect("check"));
    }
}
