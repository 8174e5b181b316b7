//! Deployed-images probe contract.
//!
//! The cleanup engine never talks to Kubernetes directly; it consumes
//! this trait, implemented by the kube crate against real clusters and
//! by in-memory fakes in tests. The probe returns the exact image
//! reference strings (`repository:tag`) found in workload specs; the
//! engine excludes candidates by string equality against that set.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Enumerates container image references deployed in one or more clusters.
#[async_trait]
pub trait DeployedImagesProbe: Send + Sync {
    /// Returns the de-duplicated union of image references across all
    /// configured contexts.
    ///
    /// # Errors
    ///
    /// Fails if any workload kind's list call fails; the error names the
    /// kind.
    async fn deployed_images(&self, cancel: &CancellationToken) -> Result<HashSet<String>>;
}

/// Probe with a fixed answer, for tests and `--without-kube` stubs.
#[derive(Debug, Clone, Default)]
pub struct StaticImagesProbe {
    images: HashSet<String>,
}

impl StaticImagesProbe {
    /// Creates a probe reporting exactly `images` as deployed.
    #[must_use]
    pub fn new(images: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            images: images.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl DeployedImagesProbe for StaticImagesProbe {
    async fn deployed_images(&self, _cancel: &CancellationToken) -> Result<HashSet<String>> {
        Ok(self.images.clone())
    }
}
