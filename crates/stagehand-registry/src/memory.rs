//! In-memory registry for tests.
//!
//! Behaves like a generic V2 flavor over a map of tags and counts every
//! write, so tests can assert that dry-run paths never touch the
//! adapter.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stagehand_core::error::{Error, Result};

use crate::image::ImageInfo;

use super::adapter::Registry;

#[derive(Debug, Clone)]
struct StoredImage {
    labels: HashMap<String, String>,
    created_at: DateTime<Utc>,
    digest: String,
}

/// In-memory registry bound to one repository address.
pub struct MemoryRegistry {
    repo_address: String,
    images: RwLock<BTreeMap<String, StoredImage>>,
    deletes: AtomicUsize,
    pushes: AtomicUsize,
    digest_counter: AtomicUsize,
}

impl MemoryRegistry {
    /// Creates an empty registry for `repo_address`.
    #[must_use]
    pub fn new(repo_address: impl Into<String>) -> Self {
        Self {
            repo_address: repo_address.into(),
            images: RwLock::new(BTreeMap::new()),
            deletes: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
            digest_counter: AtomicUsize::new(0),
        }
    }

    /// Seeds an image without counting it as a push.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (test-only type).
    pub fn seed_image(
        &self,
        tag: &str,
        labels: &[(&str, &str)],
        created_at: DateTime<Utc>,
    ) {
        let digest = format!(
            "sha256:{:064x}",
            self.digest_counter.fetch_add(1, Ordering::SeqCst)
        );
        self.images.write().expect("lock").insert(
            tag.to_string(),
            StoredImage {
                labels: labels
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
                created_at,
                digest,
            },
        );
    }

    /// Number of delete calls the registry has served.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Number of push calls the registry has served.
    #[must_use]
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Total write calls (pushes + deletes).
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.delete_count() + self.push_count()
    }

    /// Current tags, sorted.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (test-only type).
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        self.images.read().expect("lock").keys().cloned().collect()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn repo_address(&self) -> &str {
        &self.repo_address
    }

    async fn list_tags(&self) -> Result<Vec<String>> {
        Ok(self.tags())
    }

    async fn try_get_image_info(&self, tag: &str) -> Result<Option<ImageInfo>> {
        let images = self.images.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        Ok(images.get(tag).map(|stored| ImageInfo {
            repository: self.repo_address.clone(),
            tag: tag.to_string(),
            digest: Some(stored.digest.clone()),
            labels: stored.labels.clone(),
            created_at: stored.created_at,
        }))
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        let images = self.images.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        Ok(images.contains_key(tag))
    }

    async fn push_label_only_image(
        &self,
        tag: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let digest = format!(
            "sha256:{:064x}",
            self.digest_counter.fetch_add(1, Ordering::SeqCst)
        );
        let mut images = self.images.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        images.insert(
            tag.to_string(),
            StoredImage {
                labels: labels.clone(),
                created_at: Utc::now(),
                digest,
            },
        );
        Ok(())
    }

    async fn delete_repo_image(&self, info: &ImageInfo) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let mut images = self.images.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        // Tag already absent is success.
        images.remove(&info.tag);
        Ok(())
    }

    async fn create_repo(&self) -> Result<()> {
        Ok(())
    }

    async fn delete_repo(&self) -> Result<()> {
        let mut images = self.images.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        let removed = images.len();
        self.deletes.fetch_add(removed, Ordering::SeqCst);
        images.clear();
        Ok(())
    }
}
