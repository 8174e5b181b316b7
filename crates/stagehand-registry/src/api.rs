//! Generic Docker Registry HTTP API V2 client.
//!
//! Implements the slice of the distribution API the adapters need: tag
//! listing with Link-header pagination, manifest and config-blob reads,
//! label-only image pushes, and manifest deletes. Token (Bearer) auth is
//! negotiated from `WWW-Authenticate` challenges with Basic as the
//! fallback; transient failures retry with backoff inside the client.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use stagehand_core::error::{Error, Result};

use crate::auth::RegistryCredentials;
use crate::image::ImageInfo;

/// Docker schema 2 manifest media type.
pub const MANIFEST_V2_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// OCI manifest media type.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Docker image config media type.
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";

const ACCEPTED_MANIFEST_TYPES: &str =
    "application/vnd.docker.distribution.manifest.v2+json, application/vnd.oci.image.manifest.v1+json";

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Options for constructing a [`V2Api`].
#[derive(Debug, Clone, Default)]
pub struct V2ApiOptions {
    /// Use plain HTTP instead of HTTPS.
    pub insecure: bool,
    /// Credentials for Basic auth and token fetches.
    pub credentials: Option<RegistryCredentials>,
    /// Per-request timeout; defaults to 30 seconds.
    pub timeout: Option<Duration>,
}

/// A V2 API client bound to one registry host.
pub struct V2Api {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<RegistryCredentials>,
    tokens: RwLock<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ManifestResponse {
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    manifests: Option<Vec<Descriptor>>,
}

#[derive(Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    config: Option<ConfigSection>,
}

#[derive(Deserialize)]
struct ConfigSection {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl V2Api {
    /// Creates a client for the given registry host.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(host: &str, options: V2ApiOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout.unwrap_or(Duration::from_secs(30)))
            .build()
            .map_err(|e| Error::registry_with_source("failed to create HTTP client", e))?;
        let scheme = if options.insecure { "http" } else { "https" };

        Ok(Self {
            client,
            base_url: format!("{scheme}://{host}"),
            credentials: options.credentials,
            tokens: RwLock::new(HashMap::new()),
        })
    }

    /// Lists every tag of the repository, following pagination links.
    ///
    /// # Errors
    ///
    /// Returns a registry error after retry exhaustion, or
    /// [`Error::Unauthorized`] when credentials are rejected.
    pub async fn list_tags(&self, repo_path: &str) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut next_url = Some(format!("{}/v2/{repo_path}/tags/list", self.base_url));
        let scope = pull_scope(repo_path);

        while let Some(url) = next_url {
            let response = self
                .request(Method::GET, &url, None, None, None, &scope)
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                // Repository without any pushed image yet.
                return Ok(tags);
            }
            let response = fail_on_status(response, "list tags").await?;

            next_url = next_link(&response, &self.base_url);
            let body: TagsResponse = response
                .json()
                .await
                .map_err(|e| Error::registry_with_source("parse tags response", e))?;
            tags.extend(body.tags.unwrap_or_default());
        }

        Ok(tags)
    }

    /// Fetches the image description behind `reference` (tag or digest).
    ///
    /// Returns `None` when the manifest does not exist.
    ///
    /// # Errors
    ///
    /// Returns a registry error for any failure other than absence.
    pub async fn try_get_image_info(
        &self,
        repo_path: &str,
        reference: &str,
    ) -> Result<Option<ImageInfo>> {
        let scope = pull_scope(repo_path);
        let url = self.manifest_url(repo_path, reference);
        let response = self
            .request(
                Method::GET,
                &url,
                Some(ACCEPTED_MANIFEST_TYPES),
                None,
                None,
                &scope,
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = fail_on_status(response, "get manifest").await?;

        let digest = header_string(&response, "Docker-Content-Digest");
        let manifest: ManifestResponse = response
            .json()
            .await
            .map_err(|e| Error::registry_with_source("parse manifest", e))?;

        let config_digest = match (&manifest.config, &manifest.manifests) {
            (Some(config), _) => config.digest.clone(),
            (None, Some(children)) => {
                // Manifest list: descend into the first child manifest.
                let Some(child) = children.first() else {
                    return Ok(None);
                };
                let child_url = self.manifest_url(repo_path, &child.digest);
                let response = self
                    .request(
                        Method::GET,
                        &child_url,
                        Some(ACCEPTED_MANIFEST_TYPES),
                        None,
                        None,
                        &scope,
                    )
                    .await?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                let response = fail_on_status(response, "get child manifest").await?;
                let child_manifest: ManifestResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::registry_with_source("parse child manifest", e))?;
                match child_manifest.config {
                    Some(config) => config.digest,
                    None => return Ok(None),
                }
            }
            (None, None) => return Ok(None),
        };

        let blob_url = format!("{}/v2/{repo_path}/blobs/{config_digest}", self.base_url);
        let response = self
            .request(Method::GET, &blob_url, None, None, None, &scope)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = fail_on_status(response, "get config blob").await?;
        let config: ConfigBlob = response
            .json()
            .await
            .map_err(|e| Error::registry_with_source("parse config blob", e))?;

        let created_at = config
            .created
            .as_deref()
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map_or_else(|| DateTime::<Utc>::UNIX_EPOCH, |value| value.with_timezone(&Utc));

        Ok(Some(ImageInfo {
            repository: String::new(),
            tag: reference.to_string(),
            digest,
            labels: config.config.and_then(|c| c.labels).unwrap_or_default(),
            created_at,
        }))
    }

    /// Returns whether a manifest exists behind `reference`.
    ///
    /// # Errors
    ///
    /// Returns a registry error for failures other than absence.
    pub async fn manifest_exists(&self, repo_path: &str, reference: &str) -> Result<bool> {
        Ok(self.manifest_digest(repo_path, reference).await?.is_some())
    }

    /// Resolves the manifest digest behind `reference`, if it exists.
    ///
    /// # Errors
    ///
    /// Returns a registry error for failures other than absence.
    pub async fn manifest_digest(
        &self,
        repo_path: &str,
        reference: &str,
    ) -> Result<Option<String>> {
        let url = self.manifest_url(repo_path, reference);
        let response = self
            .request(
                Method::HEAD,
                &url,
                Some(ACCEPTED_MANIFEST_TYPES),
                None,
                None,
                &pull_scope(repo_path),
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = fail_on_status(response, "head manifest").await?;
        Ok(header_string(&response, "Docker-Content-Digest"))
    }

    /// Pushes an image that carries nothing but config labels under `tag`.
    ///
    /// # Errors
    ///
    /// Returns a registry error if the blob upload or manifest put fails.
    pub async fn push_label_only_image(
        &self,
        repo_path: &str,
        tag: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "created": Utc::now().to_rfc3339(),
            "config": { "Labels": labels },
            "rootfs": { "type": "layers", "diff_ids": [] },
        });
        let config_bytes = Bytes::from(serde_json::to_vec(&config).map_err(|e| {
            Error::Internal {
                message: format!("serialize image config: {e}"),
            }
        })?);
        let config_digest = format!("sha256:{:x}", Sha256::digest(&config_bytes));

        self.upload_blob(repo_path, &config_digest, config_bytes.clone())
            .await?;

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_V2_MEDIA_TYPE,
            "config": {
                "mediaType": CONFIG_MEDIA_TYPE,
                "size": config_bytes.len(),
                "digest": config_digest,
            },
            "layers": [],
        });
        let manifest_bytes = Bytes::from(serde_json::to_vec(&manifest).map_err(|e| {
            Error::Internal {
                message: format!("serialize manifest: {e}"),
            }
        })?);

        let url = self.manifest_url(repo_path, tag);
        let response = self
            .request(
                Method::PUT,
                &url,
                None,
                Some(MANIFEST_V2_MEDIA_TYPE),
                Some(manifest_bytes),
                &push_scope(repo_path),
            )
            .await?;
        fail_on_status(response, "put manifest").await?;
        Ok(())
    }

    /// Deletes the manifest behind `reference` (usually a digest).
    ///
    /// An already-absent manifest is success.
    ///
    /// # Errors
    ///
    /// Returns a registry error when the registry rejects the delete,
    /// including registries with the delete API disabled.
    pub async fn delete_manifest(&self, repo_path: &str, reference: &str) -> Result<()> {
        let url = self.manifest_url(repo_path, reference);
        let response = self
            .request(Method::DELETE, &url, None, None, None, &push_scope(repo_path))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED => Err(Error::registry(format!(
                "registry does not allow manifest deletes (delete {reference})"
            ))),
            _ => {
                fail_on_status(response, "delete manifest").await?;
                Ok(())
            }
        }
    }

    async fn upload_blob(&self, repo_path: &str, digest: &str, data: Bytes) -> Result<()> {
        let scope = push_scope(repo_path);

        // Blobs are content-addressed; skip the upload when present.
        let head_url = format!("{}/v2/{repo_path}/blobs/{digest}", self.base_url);
        let response = self
            .request(Method::HEAD, &head_url, None, None, None, &scope)
            .await?;
        if response.status().is_success() {
            return Ok(());
        }

        let start_url = format!("{}/v2/{repo_path}/blobs/uploads/", self.base_url);
        let response = self
            .request(Method::POST, &start_url, None, None, None, &scope)
            .await?;
        let response = fail_on_status(response, "start blob upload").await?;
        let location = header_string(&response, "Location").ok_or_else(|| {
            Error::registry("registry did not return an upload location")
        })?;
        let location = if location.starts_with("http") {
            location
        } else {
            format!("{}{location}", self.base_url)
        };
        let separator = if location.contains('?') { '&' } else { '?' };
        let put_url = format!("{location}{separator}digest={digest}");

        let response = self
            .request(
                Method::PUT,
                &put_url,
                None,
                Some("application/octet-stream"),
                Some(data),
                &scope,
            )
            .await?;
        fail_on_status(response, "complete blob upload").await?;
        Ok(())
    }

    fn manifest_url(&self, repo_path: &str, reference: &str) -> String {
        format!("{}/v2/{repo_path}/manifests/{reference}", self.base_url)
    }

    /// Sends a request with auth and bounded retries.
    ///
    /// Responses come back as-is for the caller to interpret status
    /// codes; only transient failures (5xx, transport errors) and the
    /// auth handshake are handled here.
    async fn request(
        &self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        content_type: Option<&str>,
        body: Option<Bytes>,
        scope: &str,
    ) -> Result<reqwest::Response> {
        let mut backoff = RETRY_BACKOFF_BASE;
        let mut refreshed_token = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut builder = self.client.request(method.clone(), url);
            if let Some(accept) = accept {
                builder = builder.header("Accept", accept);
            }
            if let Some(content_type) = content_type {
                builder = builder.header("Content-Type", content_type);
            }
            if let Some(body) = &body {
                builder = builder.body(body.clone());
            }

            let token = self.tokens.read().await.get(scope).cloned();
            if let Some(token) = token {
                builder = builder.bearer_auth(token);
            } else if let Some(credentials) = &self.credentials {
                builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
            }

            let result = builder.send().await;
            let response = match result {
                Ok(response) => response,
                Err(e) if attempt < MAX_ATTEMPTS => {
                    tracing::debug!(url, attempt, error = %e, "registry request failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    continue;
                }
                Err(e) => {
                    return Err(Error::registry_with_source(
                        format!("request to {url} failed after {attempt} attempts"),
                        e,
                    ));
                }
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !refreshed_token {
                if let Some(challenge) = header_string(&response, "WWW-Authenticate") {
                    if self.refresh_token(&challenge, scope).await? {
                        refreshed_token = true;
                        continue;
                    }
                }
                return Err(Error::Unauthorized {
                    message: format!("registry rejected credentials for {url}"),
                });
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(Error::Unauthorized {
                    message: format!("registry returned {status} for {url}"),
                });
            }
            if status.is_server_error() && attempt < MAX_ATTEMPTS {
                tracing::debug!(url, attempt, %status, "registry server error, retrying");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                continue;
            }

            return Ok(response);
        }
    }

    /// Performs the Bearer token dance against the challenge's realm.
    ///
    /// Returns false for non-Bearer challenges.
    async fn refresh_token(&self, challenge: &str, scope: &str) -> Result<bool> {
        let Some(params) = challenge.strip_prefix("Bearer ") else {
            return Ok(false);
        };
        let params: HashMap<&str, &str> = params
            .split(',')
            .filter_map(|part| {
                let (key, value) = part.trim().split_once('=')?;
                Some((key, value.trim_matches('"')))
            })
            .collect();
        let Some(realm) = params.get("realm") else {
            return Ok(false);
        };

        let mut builder = self.client.get(*realm).query(&[("scope", scope)]);
        if let Some(service) = params.get("service") {
            builder = builder.query(&[("service", *service)]);
        }
        if let Some(credentials) = &self.credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::registry_with_source("token request failed", e))?;
        if !response.status().is_success() {
            return Err(Error::Unauthorized {
                message: format!("token endpoint returned {}", response.status()),
            });
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::registry_with_source("parse token response", e))?;
        let Some(token) = body.token.or(body.access_token) else {
            return Err(Error::registry("token endpoint returned no token"));
        };

        self.tokens.write().await.insert(scope.to_string(), token);
        Ok(true)
    }
}

fn pull_scope(repo_path: &str) -> String {
    format!("repository:{repo_path}:pull")
}

fn push_scope(repo_path: &str) -> String {
    format!("repository:{repo_path}:pull,push")
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

/// Extracts the next page URL from a Link header (`<url>; rel="next"`).
fn next_link(response: &reqwest::Response, base_url: &str) -> Option<String> {
    let link = header_string(response, "Link")?;
    link.split(',')
        .find(|part| part.contains("rel=\"next\""))
        .and_then(|next| next.split(';').next())
        .map(|url| {
            let url = url.trim().trim_matches('<').trim_matches('>');
            if url.starts_with('/') {
                format!("{base_url}{url}")
            } else {
                url.to_string()
            }
        })
}

async fn fail_on_status(response: reqwest::Response, operation: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::registry(format!(
        "{operation} returned {status}: {body}"
    )))
}
