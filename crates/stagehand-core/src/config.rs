//! Cleanup configuration.
//!
//! The YAML config file controls the two policy families the engine
//! applies:
//!
//! - **Keep policies** for git-history-based cleanup: which references to
//!   scan and how deep.
//! - **Retention policies** per tag strategy: limit and expiry applied
//!   when git-history mode is off.
//!
//! Durations in YAML are strings with a unit suffix (`"90s"`, `"48h"`,
//! `"30d"`).
//!
//! # Example
//!
//! ```yaml
//! gitHistoryBasedCleanup:
//!   references:
//!     - branch: main
//!       limit: 100
//!     - branch: /release-.*/
//!       in: 90d
//!     - tag: /v.*/
//!   imagesPerReference: 5
//! policies:
//!   gitTag:
//!     limit: 10
//!   gitCommit:
//!     limit: 50
//!     in: 30d
//!   stagesSignature: {}
//! parallel: 10
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default bound on concurrent registry/kube calls within a phase.
pub const DEFAULT_PARALLEL: usize = 10;

/// Top-level cleanup configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CleanupConfig {
    /// Keep policies for git-history-based cleanup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_history_based_cleanup: Option<GitHistoryCleanupConfig>,

    /// Per-strategy retention policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies: Option<RetentionPolicies>,

    /// Bound on concurrent calls within a phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<usize>,
}

impl CleanupConfig {
    /// Loads and validates a config from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read, parsed, or
    /// fails validation.
    pub fn from_yaml_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("read {}: {e}", path.display()),
        })?;
        Self::from_yaml(&data)
    }

    /// Parses and validates a config from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on parse or validation failure.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(data).map_err(|e| Error::Config {
            message: format!("parse cleanup config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the effective fan-out bound.
    #[must_use]
    pub fn parallel(&self) -> usize {
        self.parallel.unwrap_or(DEFAULT_PARALLEL).max(1)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if let Some(history) = &self.git_history_based_cleanup {
            for (i, reference) in history.references.iter().enumerate() {
                match (&reference.branch, &reference.tag) {
                    (None, None) => {
                        return Err(Error::Config {
                            message: format!("references[{i}]: needs either branch or tag"),
                        });
                    }
                    (Some(_), Some(_)) => {
                        return Err(Error::Config {
                            message: format!("references[{i}]: branch and tag are exclusive"),
                        });
                    }
                    _ => {}
                }
            }
        }
        if self.parallel == Some(0) {
            return Err(Error::Config {
                message: "parallel must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Keep policies for git-history-based cleanup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GitHistoryCleanupConfig {
    /// Ordered reference policies.
    #[serde(default)]
    pub references: Vec<ReferencePolicy>,

    /// Fallback commit limit applied to references without their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images_per_reference: Option<u32>,
}

/// A single keep policy: which references it selects and how deep the
/// history scan goes for each of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReferencePolicy {
    /// Branch name or `/regex/` pattern matched against remote branches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Tag name or `/regex/` pattern matched against local tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Maximum commits scanned per matched reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,

    /// Maximum commit age scanned per matched reference.
    #[serde(
        default,
        rename = "in",
        with = "opt_duration_str",
        skip_serializing_if = "Option::is_none"
    )]
    pub within: Option<chrono::Duration>,
}

/// Per-strategy retention policies for non-history cleanup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetentionPolicies {
    /// Policy for `git-tag` strategy images.
    #[serde(default)]
    pub git_tag: StrategyPolicy,
    /// Policy for `git-commit` strategy images.
    #[serde(default)]
    pub git_commit: StrategyPolicy,
    /// Policy for `stages-signature` strategy images.
    #[serde(default)]
    pub stages_signature: StrategyPolicy,
}

/// Limit and expiry for one tag strategy. Absent fields mean unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StrategyPolicy {
    /// Keep at most this many images of the strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Delete images of the strategy older than this.
    #[serde(
        default,
        rename = "in",
        with = "opt_duration_str",
        skip_serializing_if = "Option::is_none"
    )]
    pub expiry: Option<chrono::Duration>,
}

/// Parses a duration string with a unit suffix: `s`, `m`, `h`, or `d`.
///
/// # Errors
///
/// Returns [`Error::Config`] on an unknown suffix or non-numeric value.
pub fn parse_duration(value: &str) -> Result<chrono::Duration> {
    let value = value.trim();
    let split = value.len().saturating_sub(1);
    let (number, unit) = value.split_at(split);
    let amount: i64 = number.parse().map_err(|_| Error::Config {
        message: format!("invalid duration: {value}"),
    })?;
    if amount < 0 {
        return Err(Error::Config {
            message: format!("duration must not be negative: {value}"),
        });
    }
    match unit {
        "s" => Ok(chrono::Duration::seconds(amount)),
        "m" => Ok(chrono::Duration::minutes(amount)),
        "h" => Ok(chrono::Duration::hours(amount)),
        "d" => Ok(chrono::Duration::days(amount)),
        _ => Err(Error::Config {
            message: format!("invalid duration (expected s/m/h/d suffix): {value}"),
        }),
    }
}

/// Formats a duration back into its canonical string form.
#[must_use]
pub fn format_duration(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds();
    if secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs % 3_600 == 0 {
        format!("{}h", secs / 3_600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

mod opt_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<chrono::Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_str(&super::format_duration(*duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<chrono::Duration>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        value
            .map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("90s").unwrap(), chrono::Duration::seconds(90));
        assert_eq!(parse_duration("15m").unwrap(), chrono::Duration::minutes(15));
        assert_eq!(parse_duration("48h").unwrap(), chrono::Duration::hours(48));
        assert_eq!(parse_duration("30d").unwrap(), chrono::Duration::days(30));
        assert!(parse_duration("30w").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_full_config_parses() {
        let config = CleanupConfig::from_yaml(
            r"
gitHistoryBasedCleanup:
  references:
    - branch: main
      limit: 100
    - branch: /release-.*/
      in: 90d
    - tag: /v.*/
  imagesPerReference: 5
policies:
  gitTag:
    limit: 10
  gitCommit:
    limit: 50
    in: 30d
parallel: 4
",
        )
        .expect("parse");

        let history = config.git_history_based_cleanup.expect("history config");
        assert_eq!(history.references.len(), 3);
        assert_eq!(history.references[0].limit, Some(100));
        assert_eq!(
            history.references[1].within,
            Some(chrono::Duration::days(90))
        );
        assert_eq!(history.images_per_reference, Some(5));
        assert_eq!(config.parallel, Some(4));

        let policies = config.policies.expect("policies");
        assert_eq!(policies.git_tag.limit, Some(10));
        assert_eq!(policies.git_commit.expiry, Some(chrono::Duration::days(30)));
        assert_eq!(policies.stages_signature.limit, None);
    }

    #[test]
    fn test_reference_needs_branch_or_tag() {
        let err = CleanupConfig::from_yaml(
            r"
gitHistoryBasedCleanup:
  references:
    - limit: 10
",
        )
        .expect_err("must reject");
        assert!(err.to_string().contains("branch or tag"));
    }

    #[test]
    fn test_branch_and_tag_are_exclusive() {
        let err = CleanupConfig::from_yaml(
            r"
gitHistoryBasedCleanup:
  references:
    - branch: main
      tag: v1
",
        )
        .expect_err("must reject");
        assert!(err.to_string().contains("exclusive"));
    }

    #[test]
    fn test_zero_parallel_rejected() {
        assert!(CleanupConfig::from_yaml("parallel: 0").is_err());
    }

    #[test]
    fn test_default_parallel() {
        assert_eq!(CleanupConfig::default().parallel(), DEFAULT_PARALLEL);
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = CleanupConfig::from_yaml(
            r"
policies:
  gitCommit:
    limit: 3
    in: 48h
",
        )
        .expect("parse");
        let yaml = serde_yaml::to_string(&config).expect("serialize");
        let parsed = CleanupConfig::from_yaml(&yaml).expect("reparse");
        assert_eq!(config, parsed);
    }
}
