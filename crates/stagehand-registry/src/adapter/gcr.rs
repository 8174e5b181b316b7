//! Google Container Registry flavor.
//!
//! GCR requires deleting the tag reference before the manifest digest
//! becomes deletable; plain V2 semantics otherwise.

use std::collections::HashMap;

use async_trait::async_trait;

use stagehand_core::error::Result;

use crate::api::{V2Api, V2ApiOptions};
use crate::auth::RegistryCredentials;
use crate::image::ImageInfo;

use super::{Reference, Registry};

/// GCR registry adapter.
pub struct GcrRegistry {
    api: V2Api,
    repo_address: String,
    repo_path: String,
}

impl GcrRegistry {
    /// Creates the adapter for the parsed repository reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        reference: &Reference,
        credentials: Option<RegistryCredentials>,
        insecure: bool,
    ) -> Result<Self> {
        let api = V2Api::new(
            &reference.host,
            V2ApiOptions {
                insecure,
                credentials,
                timeout: None,
            },
        )?;
        Ok(Self {
            api,
            repo_address: reference.repo_address(),
            repo_path: reference.path.clone(),
        })
    }
}

#[async_trait]
impl Registry for GcrRegistry {
    fn repo_address(&self) -> &str {
        &self.repo_address
    }

    async fn list_tags(&self) -> Result<Vec<String>> {
        self.api.list_tags(&self.repo_path).await
    }

    async fn try_get_image_info(&self, tag: &str) -> Result<Option<ImageInfo>> {
        Ok(self
            .api
            .try_get_image_info(&self.repo_path, tag)
            .await?
            .map(|mut info| {
                info.repository = self.repo_address.clone();
                info
            }))
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        self.api.manifest_exists(&self.repo_path, tag).await
    }

    async fn push_label_only_image(
        &self,
        tag: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        self.api
            .push_label_only_image(&self.repo_path, tag, labels)
            .await
    }

    async fn delete_repo_image(&self, info: &ImageInfo) -> Result<()> {
        let digest = match &info.digest {
            Some(digest) => Some(digest.clone()),
            None => self.api.manifest_digest(&self.repo_path, &info.tag).await?,
        };

        // Untag first; GCR refuses digest deletes for referenced manifests.
        self.api.delete_manifest(&self.repo_path, &info.tag).await?;
        if let Some(digest) = digest {
            self.api.delete_manifest(&self.repo_path, &digest).await?;
        }
        Ok(())
    }

    async fn create_repo(&self) -> Result<()> {
        Ok(())
    }

    async fn delete_repo(&self) -> Result<()> {
        for tag in self.api.list_tags(&self.repo_path).await? {
            let info = ImageInfo {
                repository: self.repo_address.clone(),
                tag,
                digest: None,
                labels: HashMap::new(),
                created_at: chrono::DateTime::UNIX_EPOCH,
            };
            self.delete_repo_image(&info).await?;
        }
        Ok(())
    }
}
