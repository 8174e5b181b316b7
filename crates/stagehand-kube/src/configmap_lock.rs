//! ConfigMap-backed distributed lock backend.
//!
//! Repositories shared between hosts need a coordination point all of
//! them can reach; a ConfigMap per lock record gives one, with
//! `resourceVersion` as the CAS token: creates conflict on existing
//! names, replaces conflict on stale versions.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{DeleteParams, ObjectMeta, PostParams};
use kube::{Api, Client};

use stagehand_core::error::{Error, Result};
use stagehand_core::lock::{LockBackend, LockRecordMeta, WritePrecondition, WriteResult};

const PAYLOAD_KEY: &str = "payload";
const NAME_PREFIX: &str = "stagehand-lock-";
const MAX_NAME_LENGTH: usize = 253;

/// Lock backend storing records as ConfigMaps in one namespace.
pub struct ConfigMapLockBackend {
    api: Api<ConfigMap>,
}

impl ConfigMapLockBackend {
    /// Creates a backend over the given namespace.
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    fn object_name(path: &str) -> String {
        let mut name = String::with_capacity(NAME_PREFIX.len() + path.len());
        name.push_str(NAME_PREFIX);
        for c in path.chars() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                name.push(c.to_ascii_lowercase());
            } else {
                name.push('-');
            }
        }
        name.truncate(MAX_NAME_LENGTH);
        name
    }

    async fn fetch(&self, path: &str) -> Result<Option<ConfigMap>> {
        self.api
            .get_opt(&Self::object_name(path))
            .await
            .map_err(|e| Error::Kubernetes {
                kind: "ConfigMaps",
                message: e.to_string(),
            })
    }

    fn build(path: &str, data: &Bytes, resource_version: Option<String>) -> Result<ConfigMap> {
        let payload = String::from_utf8(data.to_vec()).map_err(|e| Error::Internal {
            message: format!("lock payload not utf-8: {e}"),
        })?;
        let mut map = BTreeMap::new();
        map.insert(PAYLOAD_KEY.to_string(), payload);
        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(Self::object_name(path)),
                resource_version,
                ..ObjectMeta::default()
            },
            data: Some(map),
            ..ConfigMap::default()
        })
    }

    async fn current_version(&self, path: &str) -> Result<String> {
        Ok(self
            .fetch(path)
            .await?
            .and_then(|cm| cm.metadata.resource_version)
            .unwrap_or_default())
    }
}

fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

#[async_trait]
impl LockBackend for ConfigMapLockBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let config_map = self
            .fetch(path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("lock record not found: {path}")))?;
        let payload = config_map
            .data
            .and_then(|mut data| data.remove(PAYLOAD_KEY))
            .ok_or_else(|| Error::NotFound(format!("lock record has no payload: {path}")))?;
        Ok(Bytes::from(payload.into_bytes()))
    }

    async fn head(&self, path: &str) -> Result<Option<LockRecordMeta>> {
        Ok(self.fetch(path).await?.map(|config_map| LockRecordMeta {
            version: config_map.metadata.resource_version.unwrap_or_default(),
        }))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let name = Self::object_name(path);
        match precondition {
            WritePrecondition::DoesNotExist => {
                let config_map = Self::build(path, &data, None)?;
                match self.api.create(&PostParams::default(), &config_map).await {
                    Ok(created) => Ok(WriteResult::Success {
                        version: created.metadata.resource_version.unwrap_or_default(),
                    }),
                    Err(e) if is_conflict(&e) => Ok(WriteResult::PreconditionFailed {
                        current_version: self.current_version(path).await?,
                    }),
                    Err(e) => Err(Error::Kubernetes {
                        kind: "ConfigMaps",
                        message: e.to_string(),
                    }),
                }
            }
            WritePrecondition::MatchesVersion(version) => {
                let config_map = Self::build(path, &data, Some(version))?;
                match self
                    .api
                    .replace(&name, &PostParams::default(), &config_map)
                    .await
                {
                    Ok(updated) => Ok(WriteResult::Success {
                        version: updated.metadata.resource_version.unwrap_or_default(),
                    }),
                    Err(e) if is_conflict(&e) || is_not_found(&e) => {
                        Ok(WriteResult::PreconditionFailed {
                            current_version: self.current_version(path).await?,
                        })
                    }
                    Err(e) => Err(Error::Kubernetes {
                        kind: "ConfigMaps",
                        message: e.to_string(),
                    }),
                }
            }
            WritePrecondition::None => {
                let existing = self.fetch(path).await?;
                let config_map = Self::build(
                    path,
                    &data,
                    existing.as_ref().and_then(|cm| cm.metadata.resource_version.clone()),
                )?;
                let result = if existing.is_some() {
                    self.api.replace(&name, &PostParams::default(), &config_map).await
                } else {
                    self.api.create(&PostParams::default(), &config_map).await
                };
                match result {
                    Ok(written) => Ok(WriteResult::Success {
                        version: written.metadata.resource_version.unwrap_or_default(),
                    }),
                    Err(e) => Err(Error::Kubernetes {
                        kind: "ConfigMaps",
                        message: e.to_string(),
                    }),
                }
            }
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self
            .api
            .delete(&Self::object_name(path), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::Kubernetes {
                kind: "ConfigMaps",
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_name_sanitization() {
        let name = ConfigMapLockBackend::object_name("Demo.stages-and-images.lock");
        assert_eq!(name, "stagehand-lock-demo.stages-and-images.lock");

        let weird = ConfigMapLockBackend::object_name("a/b:c_d");
        assert_eq!(weird, "stagehand-lock-a-b-c-d");
    }

    #[test]
    fn test_object_name_is_bounded() {
        let long = "x".repeat(400);
        assert!(ConfigMapLockBackend::object_name(&long).len() <= MAX_NAME_LENGTH);
    }
}
