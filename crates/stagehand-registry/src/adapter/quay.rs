//! Quay flavor.
//!
//! Reads use the plain V2 API; tag deletes use the quay application API
//! with an OAuth bearer token (the configured password).

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::StatusCode;

use stagehand_core::error::{Error, Result};

use crate::api::{V2Api, V2ApiOptions};
use crate::auth::RegistryCredentials;
use crate::image::ImageInfo;

use super::{Reference, Registry};

/// Quay registry adapter.
pub struct QuayRegistry {
    api: V2Api,
    client: reqwest::Client,
    credentials: Option<RegistryCredentials>,
    host: String,
    repo_address: String,
    repo_path: String,
}

impl QuayRegistry {
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
                credentials: credentials.clone(),
                timeout: None,
            },
        )?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::registry_with_source("failed to create HTTP client", e))?;

        Ok(Self {
            api,
            client,
            credentials,
            host: reference.host.clone(),
            repo_address: reference.repo_address(),
            repo_path: reference.path.clone(),
        })
    }

    async fn quay_delete(&self, url: String) -> Result<()> {
        let Some(credentials) = &self.credentials else {
            return Err(Error::Unauthorized {
                message: "quay deletes require an OAuth token as the password".into(),
            });
        };

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&credentials.password)
            .send()
            .await
            .map_err(|e| Error::registry_with_source("quay delete failed", e))?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => {
                Ok(())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Unauthorized {
                message: format!("quay delete returned {}", response.status()),
            }),
            status => Err(Error::registry(format!(
                "quay delete {url} returned {status}"
            ))),
        }
    }
}

#[async_trait]
impl Registry for QuayRegistry {
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
        self.quay_delete(format!(
            "https://{}/api/v1/repository/{}/tag/{}",
            self.host, self.repo_path, info.tag
        ))
        .await
    }

    async fn create_repo(&self) -> Result<()> {
        Ok(())
    }

    async fn delete_repo(&self) -> Result<()> {
        self.quay_delete(format!(
            "https://{}/api/v1/repository/{}",
            self.host, self.repo_path
        ))
        .await
    }
}
