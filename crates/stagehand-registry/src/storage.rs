//! Repo stages storage.
//!
//! The logical record API over the tag codec and a registry adapter:
//! stages, managed image markers, per-commit metadata and client-id
//! records, all encoded as tags on the single backing repository.
//!
//! Enumeration operations share one pattern: a single `list_tags` call
//! followed by prefix filtering and codec decoding, skipping inert tags
//! with a debug log.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use stagehand_core::cancel::checked;
use stagehand_core::error::Result;

use crate::adapter::Registry;
use crate::image::{
    labels, ClientIdRecord, ImageMetadata, StageDescription, StageId,
};
use crate::tag;

/// Stages storage over a registry-backed repository.
pub struct RepoStagesStorage {
    registry: Arc<dyn Registry>,
}

impl RepoStagesStorage {
    /// Creates storage over the given registry adapter.
    #[must_use]
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    /// The backing repository address.
    #[must_use]
    pub fn repo_address(&self) -> &str {
        self.registry.repo_address()
    }

    /// The underlying registry adapter.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Enumerates every stage in the repository.
    ///
    /// # Errors
    ///
    /// Fails on registry errors; malformed tags are skipped, not errors.
    pub async fn get_all_stages(&self, cancel: &CancellationToken) -> Result<Vec<StageId>> {
        let tags = self.list_tags(cancel).await?;
        let mut stages = Vec::new();
        for tag in tags {
            if has_record_prefix(&tag) {
                continue;
            }
            match tag::decode_stage(&tag) {
                Ok(stage_id) => stages.push(stage_id),
                Err(e) if e.is_unexpected_tag_format() => {
                    tracing::debug!(tag, "skipping tag: not a stage");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(stages)
    }

    /// Enumerates the stages with the given signature.
    ///
    /// # Errors
    ///
    /// Fails on registry errors.
    pub async fn get_stages_by_signature(
        &self,
        signature: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<StageId>> {
        Ok(self
            .get_all_stages(cancel)
            .await?
            .into_iter()
            .filter(|stage_id| stage_id.signature == signature)
            .collect())
    }

    /// Fetches a stage's registry-side description, or `None` when the
    /// stage tag is gone.
    ///
    /// # Errors
    ///
    /// Fails on registry errors other than absence.
    pub async fn get_stage_description(
        &self,
        stage_id: &StageId,
        cancel: &CancellationToken,
    ) -> Result<Option<StageDescription>> {
        let tag = tag::encode_stage(&stage_id.signature, stage_id.unique_id);
        let info = checked(cancel, "fetch stage description", async {
            self.registry.try_get_image_info(&tag).await
        })
        .await?;
        Ok(info.map(|info| StageDescription {
            stage_id: stage_id.clone(),
            info,
        }))
    }

    /// Deletes the given stages.
    ///
    /// # Errors
    ///
    /// Fails on the first registry delete error.
    pub async fn delete_stages(
        &self,
        stages: &[StageDescription],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for stage in stages {
            checked(cancel, "delete stage", async {
                self.registry.delete_repo_image(&stage.info).await
            })
            .await?;
            tracing::debug!(stage = %stage.stage_id, "deleted stage");
        }
        Ok(())
    }

    /// Records that the named image exists in this repository.
    ///
    /// Idempotent; invalid (upper-case) names are silently skipped.
    ///
    /// # Errors
    ///
    /// Fails on registry errors.
    pub async fn add_managed_image(
        &self,
        image_name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if tag::validate_image_name(image_name).is_err() {
            tracing::debug!(image = image_name, "skipping managed image record: invalid name");
            return Ok(());
        }

        let record_tag = tag::encode_managed(image_name);
        let exists = checked(cancel, "check managed image record", async {
            self.registry.image_exists(&record_tag).await
        })
        .await?;
        if exists {
            tracing::debug!(tag = record_tag, "managed image record already present");
            return Ok(());
        }

        checked(cancel, "push managed image record", async {
            self.registry
                .push_label_only_image(&record_tag, &HashMap::new())
                .await
        })
        .await
    }

    /// Removes the named image's managed record, if present.
    ///
    /// # Errors
    ///
    /// Fails on registry errors.
    pub async fn rm_managed_image(
        &self,
        image_name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let record_tag = tag::encode_managed(image_name);
        let info = checked(cancel, "fetch managed image record", async {
            self.registry.try_get_image_info(&record_tag).await
        })
        .await?;
        let Some(info) = info else {
            tracing::debug!(tag = record_tag, "managed image record already absent");
            return Ok(());
        };
        checked(cancel, "delete managed image record", async {
            self.registry.delete_repo_image(&info).await
        })
        .await
    }

    /// Lists the recorded managed image names.
    ///
    /// # Errors
    ///
    /// Fails on registry errors.
    pub async fn get_managed_images(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let tags = self.list_tags(cancel).await?;
        let mut names = Vec::new();
        for tag in tags {
            let Some(name) = tag::decode_managed(&tag) else {
                continue;
            };
            if tag::validate_image_name(&name).is_err() {
                tracing::debug!(tag, "skipping managed image record: invalid name");
                continue;
            }
            names.push(name);
        }
        Ok(names)
    }

    /// Records the image's content signature at a commit.
    ///
    /// # Errors
    ///
    /// Fails on registry errors.
    pub async fn put_image_commit(
        &self,
        image_name: &str,
        commit: &str,
        metadata: &ImageMetadata,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let record_tag = tag::encode_metadata(image_name, commit);
        let mut record_labels = HashMap::new();
        record_labels.insert(
            labels::METADATA_CONTENT_SIGNATURE.to_string(),
            metadata.content_signature.clone(),
        );
        checked(cancel, "push image metadata record", async {
            self.registry
                .push_label_only_image(&record_tag, &record_labels)
                .await
        })
        .await?;
        tracing::info!(
            image = image_name,
            commit,
            content_signature = metadata.content_signature,
            "recorded image metadata by commit"
        );
        Ok(())
    }

    /// Removes the image's metadata record for a commit, if present.
    ///
    /// # Errors
    ///
    /// Fails on registry errors.
    pub async fn rm_image_commit(
        &self,
        image_name: &str,
        commit: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let record_tag = tag::encode_metadata(image_name, commit);
        let info = checked(cancel, "fetch image metadata record", async {
            self.registry.try_get_image_info(&record_tag).await
        })
        .await?;
        if let Some(info) = info {
            checked(cancel, "delete image metadata record", async {
                self.registry.delete_repo_image(&info).await
            })
            .await?;
            tracing::info!(image = image_name, commit, "removed image metadata by commit");
        }
        Ok(())
    }

    /// Reads the image's content signature at a commit.
    ///
    /// Missing record or missing payload label both return `None`.
    ///
    /// # Errors
    ///
    /// Fails on registry errors other than absence.
    pub async fn get_image_metadata_by_commit(
        &self,
        image_name: &str,
        commit: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ImageMetadata>> {
        let record_tag = tag::encode_metadata(image_name, commit);
        let info = checked(cancel, "fetch image metadata record", async {
            self.registry.try_get_image_info(&record_tag).await
        })
        .await?;
        Ok(info.and_then(|info| {
            info.labels
                .get(labels::METADATA_CONTENT_SIGNATURE)
                .map(|content_signature| ImageMetadata {
                    content_signature: content_signature.clone(),
                })
        }))
    }

    /// Lists the commits the named image has metadata records for.
    ///
    /// The shrunk slug makes metadata tags lossy, so membership is
    /// decided by re-encoding the candidate, never by decoding the tag.
    ///
    /// # Errors
    ///
    /// Fails on registry errors.
    pub async fn get_image_commits(
        &self,
        image_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let tags = self.list_tags(cancel).await?;
        let mut commits = Vec::new();
        for candidate in tags {
            let Ok(tag::RepoTag::ImageMetadata { commit, .. }) = tag::RepoTag::parse(&candidate)
            else {
                continue;
            };
            if tag::encode_metadata(image_name, &commit) == candidate {
                commits.push(commit);
            }
        }
        Ok(commits)
    }

    /// Lists client-id records ordered by their embedded timestamp.
    ///
    /// # Errors
    ///
    /// Fails on registry errors.
    pub async fn get_client_id_records(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ClientIdRecord>> {
        let tags = self.list_tags(cancel).await?;
        let mut records = Vec::new();
        for tag in tags {
            if !tag.starts_with(tag::CLIENT_ID_TAG_PREFIX) {
                continue;
            }
            match tag::decode_client_id(&tag) {
                Ok(record) => records.push(record),
                Err(_) => {
                    tracing::debug!(tag, "skipping tag: malformed client-id record");
                }
            }
        }
        records.sort_by_key(|record| record.timestamp_millis);
        Ok(records)
    }

    /// Posts a client-id record; already-present records are kept as-is.
    ///
    /// # Errors
    ///
    /// Fails on registry errors.
    pub async fn post_client_id_record(
        &self,
        record: &ClientIdRecord,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let record_tag = tag::encode_client_id(&record.client_id, record.timestamp_millis);
        let exists = checked(cancel, "check client-id record", async {
            self.registry.image_exists(&record_tag).await
        })
        .await?;
        if exists {
            tracing::debug!(tag = record_tag, "client-id record already present");
            return Ok(());
        }
        checked(cancel, "push client-id record", async {
            self.registry
                .push_label_only_image(&record_tag, &HashMap::new())
                .await
        })
        .await?;
        tracing::info!(client_id = record.client_id, "posted client-id record");
        Ok(())
    }

    /// Creates the backing repository where the flavor requires it.
    ///
    /// # Errors
    ///
    /// Fails on registry errors.
    pub async fn create_repo(&self, cancel: &CancellationToken) -> Result<()> {
        checked(cancel, "create repo", self.registry.create_repo()).await
    }

    /// Deletes the backing repository.
    ///
    /// # Errors
    ///
    /// Fails on registry errors.
    pub async fn delete_repo(&self, cancel: &CancellationToken) -> Result<()> {
        checked(cancel, "delete repo", self.registry.delete_repo()).await
    }

    async fn list_tags(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let tags = checked(cancel, "list repo tags", self.registry.list_tags()).await?;
        tracing::debug!(repo = self.repo_address(), count = tags.len(), "fetched repo tags");
        Ok(tags)
    }
}

fn has_record_prefix(tag: &str) -> bool {
    tag.starts_with(tag::MANAGED_IMAGE_TAG_PREFIX)
        || tag.starts_with(tag::IMAGE_METADATA_BY_COMMIT_TAG_PREFIX)
        || tag.starts_with(tag::CLIENT_ID_TAG_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegistry;
    use chrono::Utc;

    fn storage() -> (Arc<MemoryRegistry>, RepoStagesStorage) {
        let registry = Arc::new(MemoryRegistry::new("registry.local/demo"));
        let storage = RepoStagesStorage::new(registry.clone());
        (registry, storage)
    }

    #[tokio::test]
    async fn test_get_all_stages_skips_records_and_noise() {
        let (registry, storage) = storage();
        let now = Utc::now();
        for tag in [
            "abc123-1700000000000",
            "abc123-1700000001000",
            "managed-image-myapp",
            "noise",
            "def-notanumber",
        ] {
            registry.seed_image(tag, &[], now);
        }

        let cancel = CancellationToken::new();
        let stages = storage.get_all_stages(&cancel).await.expect("stages");
        assert_eq!(
            stages,
            vec![
                StageId {
                    signature: "abc123".into(),
                    unique_id: 1_700_000_000_000
                },
                StageId {
                    signature: "abc123".into(),
                    unique_id: 1_700_000_001_000
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_stages_by_signature() {
        let (registry, storage) = storage();
        let now = Utc::now();
        registry.seed_image("abc123-1700000000000", &[], now);
        registry.seed_image("ffff00-1700000000000", &[], now);

        let cancel = CancellationToken::new();
        let stages = storage
            .get_stages_by_signature("abc123", &cancel)
            .await
            .expect("stages");
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].signature, "abc123");
    }

    #[tokio::test]
    async fn test_managed_image_slug_round_trip() {
        let (registry, storage) = storage();
        let cancel = CancellationToken::new();

        storage
            .add_managed_image("backend/api+v2", &cancel)
            .await
            .expect("add");
        assert_eq!(
            registry.tags(),
            vec!["managed-image-backend__slash__api__plus__v2".to_string()]
        );
        assert_eq!(
            storage.get_managed_images(&cancel).await.expect("list"),
            vec!["backend/api+v2".to_string()]
        );

        // Second add is a no-op.
        storage
            .add_managed_image("backend/api+v2", &cancel)
            .await
            .expect("re-add");
        assert_eq!(registry.push_count(), 1);

        storage
            .rm_managed_image("backend/api+v2", &cancel)
            .await
            .expect("rm");
        assert!(storage.get_managed_images(&cancel).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_add_managed_image_skips_upcase_names() {
        let (registry, storage) = storage();
        let cancel = CancellationToken::new();
        storage
            .add_managed_image("Backend", &cancel)
            .await
            .expect("skip is not an error");
        assert_eq!(registry.push_count(), 0);
    }

    #[tokio::test]
    async fn test_image_metadata_round_trip() {
        let (_registry, storage) = storage();
        let cancel = CancellationToken::new();
        let commit = "0123456789abcdef0123456789abcdef01234567";

        storage
            .put_image_commit(
                "backend",
                commit,
                &ImageMetadata {
                    content_signature: "sig-a".into(),
                },
                &cancel,
            )
            .await
            .expect("put");

        let metadata = storage
            .get_image_metadata_by_commit("backend", commit, &cancel)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(metadata.content_signature, "sig-a");

        assert_eq!(
            storage.get_image_commits("backend", &cancel).await.expect("commits"),
            vec![commit.to_string()]
        );
        // Another image has no commits here.
        assert!(storage
            .get_image_commits("frontend", &cancel)
            .await
            .expect("commits")
            .is_empty());

        storage
            .rm_image_commit("backend", commit, &cancel)
            .await
            .expect("rm");
        assert!(storage
            .get_image_metadata_by_commit("backend", commit, &cancel)
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn test_metadata_without_label_reads_as_none() {
        let (registry, storage) = storage();
        let cancel = CancellationToken::new();
        let commit = "0123456789abcdef0123456789abcdef01234567";
        registry.seed_image(
            &crate::tag::encode_metadata("backend", commit),
            &[],
            Utc::now(),
        );

        assert!(storage
            .get_image_metadata_by_commit("backend", commit, &cancel)
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn test_client_id_records_ordered_by_timestamp() {
        let (_registry, storage) = storage();
        let cancel = CancellationToken::new();

        for (client_id, timestamp) in [("host-b", 2_000), ("host-a", 1_000), ("host-c", 3_000)] {
            storage
                .post_client_id_record(
                    &ClientIdRecord {
                        client_id: client_id.into(),
                        timestamp_millis: timestamp,
                    },
                    &cancel,
                )
                .await
                .expect("post");
        }

        let records = storage.get_client_id_records(&cancel).await.expect("records");
        let ids: Vec<&str> = records.iter().map(|r| r.client_id.as_str()).collect();
        assert_eq!(ids, vec!["host-a", "host-b", "host-c"]);
    }

    #[tokio::test]
    async fn test_cancelled_listing_aborts() {
        let (_registry, storage) = storage();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = storage.get_all_stages(&cancel).await.expect_err("cancelled");
        assert!(matches!(err, stagehand_core::Error::Cancelled { .. }));
    }
}
