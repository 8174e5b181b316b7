//! Git history scanning.
//!
//! Walks the commits reachable from each selected reference, newest
//! first, and records which content signatures were encountered before
//! the reference's limit or expiry cutoff stopped the walk. The union
//! across references is the kept set.
//!
//! Limit and expiry decisions follow the branch's first-parent chain;
//! whether a signature's commits still exist at all is decided against
//! the whole repository before scanning (the engine only passes
//! signatures with existing commits in here).

use std::collections::{BTreeSet, HashMap, HashSet};

use stagehand_core::error::Result;
use stagehand_git::GitRepository;

use crate::reference::ReferenceToScan;

/// Scans the references and returns the reached content signatures,
/// sorted for determinism.
///
/// `signature_commits` maps each content signature to the commits it was
/// recorded at. A commit shared by several references is counted once
/// per reference scan.
///
/// # Errors
///
/// Fails on git access errors during the walks.
pub fn scan_references_history(
    git: &dyn GitRepository,
    references: &[ReferenceToScan],
    signature_commits: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>> {
    let mut commit_signatures: HashMap<&str, Vec<&str>> = HashMap::new();
    for (signature, commits) in signature_commits {
        for commit in commits {
            commit_signatures
                .entry(commit.as_str())
                .or_default()
                .push(signature.as_str());
        }
    }
    if commit_signatures.is_empty() {
        tracing::debug!("scanning stopped: nothing to seek");
        return Ok(Vec::new());
    }

    let mut reached: BTreeSet<String> = BTreeSet::new();
    let mut pending: HashSet<&str> = signature_commits.keys().map(String::as_str).collect();

    for reference in references {
        if pending.is_empty() {
            break;
        }

        let mut scanned = 0u32;
        for commit in git.walk_first_parent(&reference.head.id)? {
            if let Some(limit) = reference.limit {
                if scanned >= limit {
                    break;
                }
            }
            if let Some(cutoff) = reference.expiry_cutoff {
                if commit.committer_time < cutoff {
                    break;
                }
            }
            scanned += 1;

            if let Some(signatures) = commit_signatures.get(commit.id.as_str()) {
                for signature in signatures {
                    if reached.insert((*signature).to_string()) {
                        tracing::debug!(
                            reference = reference.name,
                            commit = commit.id,
                            signature,
                            "reached content signature"
                        );
                    }
                    pending.remove(signature);
                }
            }
        }
    }

    Ok(reached.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use stagehand_git::{FakeGitRepository, ReferenceKind};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn linear_repo(depth: u32) -> FakeGitRepository {
        let mut repo = FakeGitRepository::new();
        for i in 1..=depth {
            let id = format!("c{i}");
            if i == 1 {
                repo.add_commit(&id, &[], at(i));
            } else {
                let parent = format!("c{}", i - 1);
                repo.add_commit(&id, &[parent.as_str()], at(i));
            }
        }
        repo.add_branch("main", &format!("c{depth}"));
        repo
    }

    fn reference(repo: &FakeGitRepository, limit: Option<u32>) -> ReferenceToScan {
        ReferenceToScan {
            name: "main".into(),
            kind: ReferenceKind::Branch,
            head: repo
                .reference_head(ReferenceKind::Branch, "main")
                .expect("head")
                .expect("present"),
            limit,
            expiry_cutoff: None,
        }
    }

    #[test]
    fn test_limit_bounds_the_walk() {
        // Ancestry c5 -> c4 -> c3 -> c2 -> c1; sigA at c4, sigB at c2.
        let repo = linear_repo(5);
        let signature_commits = HashMap::from([
            ("sigA".to_string(), vec!["c4".to_string()]),
            ("sigB".to_string(), vec!["c2".to_string()]),
        ]);

        let reached = scan_references_history(
            &repo,
            &[reference(&repo, Some(2))],
            &signature_commits,
        )
        .expect("scan");
        assert_eq!(reached, vec!["sigA".to_string()]);
    }

    #[test]
    fn test_expiry_cutoff_bounds_the_walk() {
        let repo = linear_repo(5);
        let signature_commits = HashMap::from([
            ("sigA".to_string(), vec!["c5".to_string()]),
            ("sigB".to_string(), vec!["c1".to_string()]),
        ]);

        let mut scan_reference = reference(&repo, None);
        scan_reference.expiry_cutoff = Some(at(3));
        let reached =
            scan_references_history(&repo, &[scan_reference], &signature_commits).expect("scan");
        assert_eq!(reached, vec!["sigA".to_string()]);
    }

    #[test]
    fn test_union_across_references() {
        let mut repo = FakeGitRepository::new();
        repo.add_commit("m1", &[], at(1));
        repo.add_commit("m2", &["m1"], at(2));
        repo.add_commit("f1", &["m1"], at(3));
        repo.add_branch("main", "m2");
        repo.add_branch("feature", "f1");

        let signature_commits = HashMap::from([
            ("sigMain".to_string(), vec!["m2".to_string()]),
            ("sigFeature".to_string(), vec!["f1".to_string()]),
        ]);

        let references = vec![
            ReferenceToScan {
                name: "main".into(),
                kind: ReferenceKind::Branch,
                head: repo
                    .reference_head(ReferenceKind::Branch, "main")
                    .expect("head")
                    .expect("present"),
                limit: Some(1),
                expiry_cutoff: None,
            },
            ReferenceToScan {
                name: "feature".into(),
                kind: ReferenceKind::Branch,
                head: repo
                    .reference_head(ReferenceKind::Branch, "feature")
                    .expect("head")
                    .expect("present"),
                limit: Some(1),
                expiry_cutoff: None,
            },
        ];

        let reached =
            scan_references_history(&repo, &references, &signature_commits).expect("scan");
        assert_eq!(
            reached,
            vec!["sigFeature".to_string(), "sigMain".to_string()]
        );
    }

    #[test]
    fn test_no_signatures_short_circuits() {
        let repo = linear_repo(3);
        let reached = scan_references_history(&repo, &[reference(&repo, None)], &HashMap::new())
            .expect("scan");
        assert!(reached.is_empty());
    }

    #[test]
    fn test_signature_with_multiple_commits_needs_any_reachable() {
        let repo = linear_repo(5);
        let signature_commits = HashMap::from([(
            "sigA".to_string(),
            vec!["c1".to_string(), "c5".to_string()],
        )]);

        let reached = scan_references_history(
            &repo,
            &[reference(&repo, Some(1))],
            &signature_commits,
        )
        .expect("scan");
        assert_eq!(reached, vec!["sigA".to_string()]);
    }
}
