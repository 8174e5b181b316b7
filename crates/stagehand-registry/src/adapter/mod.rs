//! Registry adapter contract and flavor resolution.
//!
//! Every registry flavor exposes the same capability set; upper layers
//! never see flavor-specific auth or delete semantics. A flavor is
//! picked explicitly (`--repo-implementation`) or detected from the
//! repository hostname.

mod default;
mod docker_hub;
mod gcr;
mod quay;

pub use default::DefaultRegistry;
pub use docker_hub::DockerHubRegistry;
pub use gcr::GcrRegistry;
pub use quay::QuayRegistry;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use stagehand_core::error::{Error, Result};

use crate::auth::{resolve_credentials, RegistryCredentials};
use crate::image::ImageInfo;

/// The capability set every registry flavor implements.
///
/// An instance is bound to a single backing repository. Mutating calls
/// are only issued by callers holding the stages-and-images lock.
#[async_trait]
pub trait Registry: Send + Sync {
    /// The bound repository address (`host/path`).
    fn repo_address(&self) -> &str;

    /// Lists every tag in the repository.
    async fn list_tags(&self) -> Result<Vec<String>>;

    /// Fetches the image description behind `tag`, or `None` when absent.
    async fn try_get_image_info(&self, tag: &str) -> Result<Option<ImageInfo>>;

    /// Returns whether an image exists behind `tag`.
    async fn image_exists(&self, tag: &str) -> Result<bool>;

    /// Pushes an image carrying only config labels under `tag`.
    ///
    /// Callers check [`Registry::image_exists`] first; the push itself
    /// overwrites whatever the tag pointed at.
    async fn push_label_only_image(
        &self,
        tag: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()>;

    /// Deletes the image behind the description's tag.
    ///
    /// An already-absent tag is success.
    async fn delete_repo_image(&self, info: &ImageInfo) -> Result<()>;

    /// Creates the backing repository where the flavor requires it.
    async fn create_repo(&self) -> Result<()>;

    /// Deletes the backing repository (or all of its tags).
    async fn delete_repo(&self) -> Result<()>;
}

/// A parsed repository reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Registry hostname (with optional port).
    pub host: String,
    /// Repository path within the registry.
    pub path: String,
    /// Tag, when the reference carries one.
    pub tag: Option<String>,
}

impl Reference {
    /// Parses `host/path[:tag]`.
    ///
    /// A first segment without a dot, colon, or `localhost` is not a
    /// hostname; such references default to Docker Hub.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for empty or path-less references.
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.is_empty() {
            return Err(Error::InvalidInput("empty repository reference".into()));
        }

        let (repo, tag) = match reference.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag.to_string())),
            _ => (reference, None),
        };

        let (host, path) = match repo.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => ("docker.io".to_string(), repo.to_string()),
        };
        if path.is_empty() {
            return Err(Error::InvalidInput(format!(
                "repository reference {reference:?} has no path"
            )));
        }

        Ok(Self { host, path, tag })
    }

    /// Returns the `host/path` form without any tag.
    #[must_use]
    pub fn repo_address(&self) -> String {
        format!("{}/{}", self.host, self.path)
    }
}

/// Known registry flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Implementation {
    /// Generic V2 registry.
    Default,
    /// Docker Hub (hub API deletes).
    DockerHub,
    /// Google Container Registry.
    Gcr,
    /// Azure Container Registry.
    Acr,
    /// AWS Elastic Container Registry.
    Ecr,
    /// Harbor.
    Harbor,
    /// Quay (quay API tag deletes).
    Quay,
    /// GitLab container registry.
    GitLab,
    /// GitHub packages.
    GitHub,
}

impl Implementation {
    /// All selectable implementation names.
    pub const NAMES: [&'static str; 9] = [
        "default", "dockerhub", "gcr", "acr", "ecr", "harbor", "quay", "gitlab", "github",
    ];

    /// Resolves an explicit implementation name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for unknown names.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "default" => Ok(Self::Default),
            "dockerhub" => Ok(Self::DockerHub),
            "gcr" => Ok(Self::Gcr),
            "acr" => Ok(Self::Acr),
            "ecr" => Ok(Self::Ecr),
            "harbor" => Ok(Self::Harbor),
            "quay" => Ok(Self::Quay),
            "gitlab" => Ok(Self::GitLab),
            "github" => Ok(Self::GitHub),
            other => Err(Error::InvalidInput(format!(
                "unknown registry implementation {other:?} (expected one of {})",
                Self::NAMES.join(", ")
            ))),
        }
    }

    /// Detects the flavor from a registry hostname.
    #[must_use]
    pub fn detect(host: &str) -> Self {
        let host = host.split(':').next().unwrap_or(host);
        if host == "docker.io" || host == "index.docker.io" || host == "registry-1.docker.io" {
            Self::DockerHub
        } else if host == "gcr.io" || host.ends_with(".gcr.io") {
            Self::Gcr
        } else if host.ends_with(".azurecr.io") {
            Self::Acr
        } else if host.ends_with(".amazonaws.com") && host.contains(".ecr.") {
            Self::Ecr
        } else if host == "quay.io" || host.ends_with(".quay.io") {
            Self::Quay
        } else if host == "registry.gitlab.com" {
            Self::GitLab
        } else if host == "ghcr.io" || host == "docker.pkg.github.com" {
            Self::GitHub
        } else {
            Self::Default
        }
    }

    /// The implementation's selectable name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::DockerHub => "dockerhub",
            Self::Gcr => "gcr",
            Self::Acr => "acr",
            Self::Ecr => "ecr",
            Self::Harbor => "harbor",
            Self::Quay => "quay",
            Self::GitLab => "gitlab",
            Self::GitHub => "github",
        }
    }
}

/// Options for constructing a registry adapter.
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// Explicit implementation override.
    pub implementation: Option<Implementation>,
    /// Explicit credentials; docker-config discovery otherwise.
    pub credentials: Option<RegistryCredentials>,
    /// Use plain HTTP.
    pub insecure: bool,
}

/// Constructs the adapter for `repo_address`, resolving flavor and
/// credentials.
///
/// # Errors
///
/// Returns an error for unparsable references or failed client setup.
pub fn new_registry(repo_address: &str, options: RegistryOptions) -> Result<Arc<dyn Registry>> {
    let reference = Reference::parse(repo_address)?;
    let implementation = options
        .implementation
        .unwrap_or_else(|| Implementation::detect(&reference.host));
    let credentials = match options.credentials {
        Some(credentials) => Some(credentials),
        None => resolve_credentials(&reference.host)?,
    };

    tracing::debug!(
        repo = repo_address,
        implementation = implementation.name(),
        "constructing registry adapter"
    );

    match implementation {
        Implementation::DockerHub => Ok(Arc::new(DockerHubRegistry::new(
            &reference,
            credentials,
            options.insecure,
        )?)),
        Implementation::Gcr => Ok(Arc::new(GcrRegistry::new(
            &reference,
            credentials,
            options.insecure,
        )?)),
        Implementation::Quay => Ok(Arc::new(QuayRegistry::new(
            &reference,
            credentials,
            options.insecure,
        )?)),
        // ACR, ECR, Harbor, GitLab and GitHub speak plain V2 delete
        // semantics with docker-config auth.
        Implementation::Default
        | Implementation::Acr
        | Implementation::Ecr
        | Implementation::Harbor
        | Implementation::GitLab
        | Implementation::GitHub => Ok(Arc::new(DefaultRegistry::new(
            &reference,
            credentials,
            options.insecure,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_parse_with_host_and_tag() {
        let reference = Reference::parse("registry.local:5000/team/app:v1").expect("parse");
        assert_eq!(reference.host, "registry.local:5000");
        assert_eq!(reference.path, "team/app");
        assert_eq!(reference.tag.as_deref(), Some("v1"));
        assert_eq!(reference.repo_address(), "registry.local:5000/team/app");
    }

    #[test]
    fn test_reference_defaults_to_docker_hub() {
        let reference = Reference::parse("library/app").expect("parse");
        assert_eq!(reference.host, "docker.io");
        assert_eq!(reference.path, "library/app");
        assert_eq!(reference.tag, None);
    }

    #[test]
    fn test_reference_rejects_empty() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("registry.local/").is_err());
    }

    #[test]
    fn test_implementation_detection() {
        assert_eq!(Implementation::detect("docker.io"), Implementation::DockerHub);
        assert_eq!(Implementation::detect("eu.gcr.io"), Implementation::Gcr);
        assert_eq!(Implementation::detect("demo.azurecr.io"), Implementation::Acr);
        assert_eq!(
            Implementation::detect("123.dkr.ecr.us-east-1.amazonaws.com"),
            Implementation::Ecr
        );
        assert_eq!(Implementation::detect("quay.io"), Implementation::Quay);
        assert_eq!(Implementation::detect("ghcr.io"), Implementation::GitHub);
        assert_eq!(
            Implementation::detect("registry.example.com:5000"),
            Implementation::Default
        );
    }

    #[test]
    fn test_implementation_names_round_trip() {
        for name in Implementation::NAMES {
            assert_eq!(Implementation::from_name(name).expect("known").name(), name);
        }
        assert!(Implementation::from_name("podman").is_err());
    }
}
