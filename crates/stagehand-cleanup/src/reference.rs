//! Reference resolution for git-history-based cleanup.
//!
//! Turns the declarative keep-policy config into the concrete list of
//! references to scan, each annotated with its per-reference commit
//! limit and expiry cutoff. Patterns wrapped in slashes are regular
//! expressions matched against the current branch/tag lists; anything
//! else matches literally. Unmatched patterns are reported, not fatal.

use chrono::{DateTime, Utc};
use regex::Regex;

use stagehand_core::config::GitHistoryCleanupConfig;
use stagehand_core::error::{Error, Result};
use stagehand_git::{CommitInfo, GitRepository, ReferenceKind};

/// Default keep depth for remote branches when no policy is configured:
/// the last 10 commits of each branch. Tags are kept in full by default.
pub const DEFAULT_COMMITS_PER_BRANCH: u32 = 10;

/// A reference selected for history scanning.
#[derive(Debug, Clone)]
pub struct ReferenceToScan {
    /// Branch or tag name.
    pub name: String,
    /// Whether the reference is a branch or a tag.
    pub kind: ReferenceKind,
    /// The reference's head commit.
    pub head: CommitInfo,
    /// Maximum commits to scan from the head.
    pub limit: Option<u32>,
    /// Oldest committer time to scan.
    pub expiry_cutoff: Option<DateTime<Utc>>,
}

/// Resolves the keep-policy config into references to scan.
///
/// With no config (or an empty reference list) the default policy
/// applies: every remote branch limited to
/// [`DEFAULT_COMMITS_PER_BRANCH`] commits, every tag unlimited.
///
/// # Errors
///
/// Fails on git access errors or malformed regex patterns.
pub fn resolve_references(
    git: &dyn GitRepository,
    config: Option<&GitHistoryCleanupConfig>,
    now: DateTime<Utc>,
) -> Result<Vec<ReferenceToScan>> {
    let branches = git.remote_branches_list()?;
    let tags = git.tags_list()?;

    let mut references = Vec::new();

    let policies = config.map(|c| c.references.as_slice()).unwrap_or_default();
    if policies.is_empty() {
        for branch in &branches {
            push_reference(
                git,
                &mut references,
                ReferenceKind::Branch,
                branch,
                Some(DEFAULT_COMMITS_PER_BRANCH),
                None,
            )?;
        }
        for tag in &tags {
            push_reference(git, &mut references, ReferenceKind::Tag, tag, None, None)?;
        }
        return Ok(references);
    }

    let fallback_limit = config.and_then(|c| c.images_per_reference);
    for policy in policies {
        let (kind, pattern, candidates) = match (&policy.branch, &policy.tag) {
            (Some(pattern), None) => (ReferenceKind::Branch, pattern, &branches),
            (None, Some(pattern)) => (ReferenceKind::Tag, pattern, &tags),
            _ => {
                return Err(Error::Config {
                    message: "keep policy needs exactly one of branch or tag".into(),
                });
            }
        };

        let matched = match_names(pattern, candidates)?;
        if matched.is_empty() {
            tracing::warn!(kind = %kind, pattern, "keep policy matched no references");
            continue;
        }

        let limit = policy.limit.or(fallback_limit);
        let expiry_cutoff = policy.within.map(|within| now - within);
        for name in matched {
            push_reference(git, &mut references, kind, &name, limit, expiry_cutoff)?;
        }
    }

    Ok(references)
}

fn push_reference(
    git: &dyn GitRepository,
    references: &mut Vec<ReferenceToScan>,
    kind: ReferenceKind,
    name: &str,
    limit: Option<u32>,
    expiry_cutoff: Option<DateTime<Utc>>,
) -> Result<()> {
    let Some(head) = git.reference_head(kind, name)? else {
        tracing::warn!(kind = %kind, name, "reference vanished between listing and resolution");
        return Ok(());
    };
    references.push(ReferenceToScan {
        name: name.to_string(),
        kind,
        head,
        limit,
        expiry_cutoff,
    });
    Ok(())
}

/// Matches a policy pattern against the candidate names.
///
/// `/.../` delimits a regex; anything else is a literal.
fn match_names(pattern: &str, candidates: &[String]) -> Result<Vec<String>> {
    if let Some(inner) = pattern
        .strip_prefix('/')
        .and_then(|rest| rest.strip_suffix('/'))
    {
        let regex = Regex::new(inner).map_err(|e| Error::Config {
            message: format!("invalid reference pattern {pattern:?}: {e}"),
        })?;
        return Ok(candidates
            .iter()
            .filter(|candidate| regex.is_match(candidate))
            .cloned()
            .collect());
    }
    Ok(candidates
        .iter()
        .filter(|candidate| candidate.as_str() == pattern)
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stagehand_core::config::ReferencePolicy;
    use stagehand_git::FakeGitRepository;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn repo() -> FakeGitRepository {
        let mut repo = FakeGitRepository::new();
        repo.add_commit("c1", &[], at(1));
        repo.add_commit("c2", &["c1"], at(2));
        repo.add_branch("main", "c2");
        repo.add_branch("release-1.0", "c1");
        repo.add_tag("v1", "c1");
        repo.add_tag("v2", "c2");
        repo
    }

    #[test]
    fn test_default_policy_covers_branches_and_tags() {
        let repo = repo();
        let references = resolve_references(&repo, None, at(12)).expect("resolve");

        let branches: Vec<&ReferenceToScan> = references
            .iter()
            .filter(|r| r.kind == ReferenceKind::Branch)
            .collect();
        assert_eq!(branches.len(), 2);
        for branch in branches {
            assert_eq!(branch.limit, Some(DEFAULT_COMMITS_PER_BRANCH));
            assert_eq!(branch.expiry_cutoff, None);
        }

        let tags: Vec<&ReferenceToScan> = references
            .iter()
            .filter(|r| r.kind == ReferenceKind::Tag)
            .collect();
        assert_eq!(tags.len(), 2);
        for tag in tags {
            assert_eq!(tag.limit, None);
        }
    }

    #[test]
    fn test_literal_and_regex_patterns() {
        let repo = repo();
        let config = GitHistoryCleanupConfig {
            references: vec![
                ReferencePolicy {
                    branch: Some("main".into()),
                    limit: Some(50),
                    ..ReferencePolicy::default()
                },
                ReferencePolicy {
                    tag: Some("/v.*/".into()),
                    ..ReferencePolicy::default()
                },
            ],
            images_per_reference: Some(5),
        };

        let references = resolve_references(&repo, Some(&config), at(12)).expect("resolve");
        assert_eq!(references.len(), 3);
        assert_eq!(references[0].name, "main");
        assert_eq!(references[0].limit, Some(50));
        // Tags matched by the pattern fall back to imagesPerReference.
        assert_eq!(references[1].limit, Some(5));
        assert_eq!(references[2].limit, Some(5));
    }

    #[test]
    fn test_unmatched_pattern_is_not_fatal() {
        let repo = repo();
        let config = GitHistoryCleanupConfig {
            references: vec![ReferencePolicy {
                branch: Some("hotfix".into()),
                ..ReferencePolicy::default()
            }],
            images_per_reference: None,
        };
        let references = resolve_references(&repo, Some(&config), at(12)).expect("resolve");
        assert!(references.is_empty());
    }

    #[test]
    fn test_expiry_cutoff_is_relative_to_now() {
        let repo = repo();
        let config = GitHistoryCleanupConfig {
            references: vec![ReferencePolicy {
                branch: Some("main".into()),
                within: Some(chrono::Duration::hours(2)),
                ..ReferencePolicy::default()
            }],
            images_per_reference: None,
        };
        let references = resolve_references(&repo, Some(&config), at(12)).expect("resolve");
        assert_eq!(references[0].expiry_cutoff, Some(at(10)));
    }

    #[test]
    fn test_invalid_regex_is_an_error() {
        let repo = repo();
        let config = GitHistoryCleanupConfig {
            references: vec![ReferencePolicy {
                tag: Some("/(/".into()),
                ..ReferencePolicy::default()
            }],
            images_per_reference: None,
        };
        assert!(resolve_references(&repo, Some(&config), at(12)).is_err());
    }
}
