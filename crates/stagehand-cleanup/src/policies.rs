//! Per-strategy retention.
//!
//! When git-history mode is off, images are retained per tag strategy:
//! an expiry pass deletes anything created before `now - expiry`, then a
//! limit pass deletes the oldest images past the count limit. Absent
//! limit and expiry mean the strategy keeps everything.

use chrono::{DateTime, Utc};

use stagehand_core::config::RetentionPolicies;
use stagehand_registry::{ImageInfo, TagStrategy};

/// Retention settings for one tag strategy.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// The strategy the policy applies to.
    pub strategy: TagStrategy,
    /// Keep at most this many images.
    pub limit: Option<u64>,
    /// Delete images older than this.
    pub expiry: Option<chrono::Duration>,
}

/// The outcome of applying one retention policy.
#[derive(Debug, Default)]
pub struct RetentionOutcome {
    /// Images the policy keeps.
    pub keep: Vec<ImageInfo>,
    /// Images deleted by the expiry pass.
    pub expired: Vec<ImageInfo>,
    /// Images deleted by the limit pass (oldest first).
    pub excess: Vec<ImageInfo>,
}

/// The retention policies the cleanup engine applies, in pass order.
#[must_use]
pub fn strategy_policies(config: &RetentionPolicies) -> Vec<RetentionPolicy> {
    vec![
        RetentionPolicy {
            strategy: TagStrategy::GitTag,
            limit: config.git_tag.limit,
            expiry: config.git_tag.expiry,
        },
        RetentionPolicy {
            strategy: TagStrategy::GitCommit,
            limit: config.git_commit.limit,
            expiry: config.git_commit.expiry,
        },
        RetentionPolicy {
            strategy: TagStrategy::StagesSignature,
            limit: config.stages_signature.limit,
            expiry: config.stages_signature.expiry,
        },
    ]
}

/// Applies one retention policy to the images of its strategy.
///
/// `images` must all carry the policy's strategy; the caller partitions
/// by strategy first.
#[must_use]
pub fn apply_retention(
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    mut images: Vec<ImageInfo>,
) -> RetentionOutcome {
    images.sort_by_key(|info| info.created_at);

    let mut outcome = RetentionOutcome::default();
    let mut remaining = Vec::new();
    if let Some(expiry) = policy.expiry {
        let cutoff = now - expiry;
        for info in images {
            if info.created_at < cutoff {
                outcome.expired.push(info);
            } else {
                remaining.push(info);
            }
        }
    } else {
        remaining = images;
    }

    if let Some(limit) = policy.limit {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        if remaining.len() > limit {
            let excess = remaining.len() - limit;
            outcome.excess = remaining.drain(..excess).collect();
        }
    }

    outcome.keep = remaining;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap()
    }

    fn image(tag: &str, created: DateTime<Utc>) -> ImageInfo {
        ImageInfo {
            repository: "registry.local/demo".into(),
            tag: tag.into(),
            digest: None,
            labels: HashMap::new(),
            created_at: created,
        }
    }

    #[test]
    fn test_limit_deletes_oldest() {
        let policy = RetentionPolicy {
            strategy: TagStrategy::GitCommit,
            limit: Some(3),
            expiry: None,
        };
        let images = vec![
            image("t3", at(3)),
            image("t1", at(1)),
            image("t5", at(5)),
            image("t2", at(2)),
            image("t4", at(4)),
        ];

        let outcome = apply_retention(&policy, at(10), images);
        let excess: Vec<&str> = outcome.excess.iter().map(|i| i.tag.as_str()).collect();
        let keep: Vec<&str> = outcome.keep.iter().map(|i| i.tag.as_str()).collect();
        assert_eq!(excess, vec!["t1", "t2"]);
        assert_eq!(keep, vec!["t3", "t4", "t5"]);
        assert!(outcome.expired.is_empty());
    }

    #[test]
    fn test_expiry_runs_before_limit() {
        let policy = RetentionPolicy {
            strategy: TagStrategy::GitTag,
            limit: Some(1),
            expiry: Some(chrono::Duration::days(5)),
        };
        let images = vec![image("old", at(1)), image("mid", at(8)), image("new", at(9))];

        let outcome = apply_retention(&policy, at(10), images);
        assert_eq!(outcome.expired.len(), 1);
        assert_eq!(outcome.expired[0].tag, "old");
        assert_eq!(outcome.excess.len(), 1);
        assert_eq!(outcome.excess[0].tag, "mid");
        assert_eq!(outcome.keep.len(), 1);
        assert_eq!(outcome.keep[0].tag, "new");
    }

    #[test]
    fn test_no_policy_keeps_everything() {
        let policy = RetentionPolicy {
            strategy: TagStrategy::StagesSignature,
            limit: None,
            expiry: None,
        };
        let outcome = apply_retention(&policy, at(10), vec![image("a", at(1)), image("b", at(2))]);
        assert_eq!(outcome.keep.len(), 2);
        assert!(outcome.expired.is_empty());
        assert!(outcome.excess.is_empty());
    }
}
