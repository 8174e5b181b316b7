//! Docker Hub flavor.
//!
//! Reads go through the plain V2 API on `registry-1.docker.io`; deletes
//! go through the hub API (`hub.docker.com/v2/repositories/...`), which
//! requires a JWT from the hub login endpoint. The V2 manifest-delete
//! endpoint is not available on Docker Hub.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::RwLock;

use stagehand_core::error::{Error, Result};

use crate::api::{V2Api, V2ApiOptions};
use crate::auth::RegistryCredentials;
use crate::image::ImageInfo;

use super::{Reference, Registry};

const HUB_API_BASE: &str = "https://hub.docker.com/v2";

/// Docker Hub registry adapter.
pub struct DockerHubRegistry {
    api: V2Api,
    client: reqwest::Client,
    credentials: Option<RegistryCredentials>,
    token: RwLock<Option<String>>,
    repo_address: String,
    repo_path: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    token: Option<String>,
}

impl DockerHubRegistry {
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
            "registry-1.docker.io",
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

        let mut repo_path = reference.path.clone();
        if !repo_path.contains('/') {
            repo_path = format!("library/{repo_path}");
        }

        Ok(Self {
            api,
            client,
            credentials,
            token: RwLock::new(None),
            repo_address: reference.repo_address(),
            repo_path,
        })
    }

    /// Logs in to the hub API and caches the JWT.
    async fn hub_token(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        let Some(credentials) = &self.credentials else {
            return Err(Error::Unauthorized {
                message: "Docker Hub deletes require credentials".into(),
            });
        };

        let response = self
            .client
            .post(format!("{HUB_API_BASE}/users/login/"))
            .json(&serde_json::json!({
                "username": credentials.username,
                "password": credentials.password,
            }))
            .send()
            .await
            .map_err(|e| Error::registry_with_source("Docker Hub login failed", e))?;
        if !response.status().is_success() {
            return Err(Error::Unauthorized {
                message: format!("Docker Hub login returned {}", response.status()),
            });
        }
        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| Error::registry_with_source("parse Docker Hub login response", e))?;
        let Some(token) = body.token else {
            return Err(Error::registry("Docker Hub login returned no token"));
        };

        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn hub_delete(&self, url: String) -> Result<()> {
        let token = self.hub_token().await?;
        let response = self
            .client
            .delete(&url)
            .header("Accept", "application/json")
            .header("Authorization", format!("JWT {token}"))
            .send()
            .await
            .map_err(|e| Error::registry_with_source("Docker Hub delete failed", e))?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => {
                Ok(())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Unauthorized {
                message: format!("Docker Hub delete returned {}", response.status()),
            }),
            status => Err(Error::registry(format!(
                "Docker Hub delete {url} returned {status}"
            ))),
        }
    }
}

#[async_trait]
impl Registry for DockerHubRegistry {
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
        self.hub_delete(format!(
            "{HUB_API_BASE}/repositories/{}/tags/{}/",
            self.repo_path, info.tag
        ))
        .await
    }

    async fn create_repo(&self) -> Result<()> {
        // Hub repositories are created by the first push.
        Ok(())
    }

    async fn delete_repo(&self) -> Result<()> {
        self.hub_delete(format!("{HUB_API_BASE}/repositories/{}/", self.repo_path))
            .await
    }
}
