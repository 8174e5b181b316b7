//! Image and stage data model.
//!
//! These are the records the cleanup engine reasons about: stage
//! identities, registry-side image descriptions, per-commit metadata and
//! client-id records, plus the well-known labels published images carry.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};

/// Well-known label keys on published and record images.
pub mod labels {
    /// How the published image was tagged (`git-tag`, `git-branch`, ...).
    pub const TAG_STRATEGY: &str = "werf-tag-strategy";

    /// The raw meta tag before slugging.
    pub const META_TAG: &str = "werf-image-tag";

    /// The published image's content fingerprint.
    pub const CONTENT_SIGNATURE: &str = "werf-content-signature";

    /// The sole payload label of per-commit metadata images.
    pub const METADATA_CONTENT_SIGNATURE: &str = "ContentSignature";
}

/// Identity of a cached build stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageId {
    /// Stable fingerprint of the stage's inputs.
    pub signature: String,
    /// Millisecond timestamp distinguishing same-signature stages.
    pub unique_id: i64,
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.signature, self.unique_id)
    }
}

/// A stage identity paired with its registry-side description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescription {
    /// The stage identity.
    pub stage_id: StageId,
    /// The registry-side image description.
    pub info: ImageInfo,
}

/// Registry-side description of an image under one tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// The repository address (`host/path`).
    pub repository: String,
    /// The tag within the repository.
    pub tag: String,
    /// Manifest digest, when the registry reported one.
    pub digest: Option<String>,
    /// Image config labels.
    pub labels: HashMap<String, String>,
    /// Image creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl ImageInfo {
    /// Returns the full `repository:tag` reference.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// Returns the image's tag strategy, if the label is present and known.
    ///
    /// A missing or unknown strategy label means the image is not
    /// cleanup-eligible by policy.
    #[must_use]
    pub fn tag_strategy(&self) -> Option<TagStrategy> {
        self.labels
            .get(labels::TAG_STRATEGY)
            .and_then(|value| value.parse().ok())
    }

    /// Returns the raw meta tag: the pre-slug tag label when present,
    /// the registry tag otherwise.
    #[must_use]
    pub fn meta_tag(&self) -> &str {
        self.labels
            .get(labels::META_TAG)
            .map_or(self.tag.as_str(), String::as_str)
    }

    /// Returns the content signature label, if present.
    #[must_use]
    pub fn content_signature(&self) -> Option<&str> {
        self.labels.get(labels::CONTENT_SIGNATURE).map(String::as_str)
    }
}

/// Per-commit image metadata payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    /// The content fingerprint the image had at the recorded commit.
    pub content_signature: String,
}

/// A client-id record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdRecord {
    /// The client identifier; may itself contain dashes.
    pub client_id: String,
    /// Record creation time in milliseconds since the epoch.
    pub timestamp_millis: i64,
}

impl fmt::Display for ClientIdRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.client_id, self.timestamp_millis)
    }
}

/// How a published image was tagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagStrategy {
    /// Tagged from a git tag.
    GitTag,
    /// Tagged from a git branch.
    GitBranch,
    /// Tagged from a git commit.
    GitCommit,
    /// Tagged from the stages signature.
    StagesSignature,
    /// Custom user-supplied tag.
    Custom,
}

impl TagStrategy {
    /// The strategy's wire form, as stored in the tag-strategy label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GitTag => "git-tag",
            Self::GitBranch => "git-branch",
            Self::GitCommit => "git-commit",
            Self::StagesSignature => "stages-signature",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for TagStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TagStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "git-tag" => Ok(Self::GitTag),
            "git-branch" => Ok(Self::GitBranch),
            "git-commit" => Ok(Self::GitCommit),
            "stages-signature" => Ok(Self::StagesSignature),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown tag strategy: {other}")),
        }
    }
}
