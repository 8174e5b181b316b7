//! Purge engines.
//!
//! Purge is unconditional: every stage, every managed image and its
//! published tags, every metadata and client-id record of the project's
//! repository goes away. Kubernetes and git are never consulted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use stagehand_core::error::{Error, Result};
use stagehand_core::host_lock::{HostLocker, DEFAULT_HOST_LOCK_TIMEOUT};
use stagehand_core::lock::{LockManager, LockStagesAndImagesOptions};
use stagehand_registry::{ImagesRepo, RepoStagesStorage};

use crate::events::{CleanupEvent, ProgressSink, TracingSink};
use crate::metrics;

/// Options for stage purging.
#[derive(Debug, Clone, Default)]
pub struct StagesPurgeOptions {
    /// Log intended writes without performing them.
    pub dry_run: bool,
}

/// Result of a purge invocation.
#[derive(Debug, Default)]
pub struct PurgeReport {
    /// Deleted (or dry-run deleted) stage tags.
    pub deleted_stages: Vec<String>,
    /// Deleted (or dry-run deleted) record and published tags.
    pub deleted_tags: Vec<String>,
    /// Per-item failures that did not abort the run.
    pub errors: Vec<String>,
}

impl PurgeReport {
    /// Returns true if any per-item failure occurred.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Deletes every stage and repository record of a project.
pub struct StagesPurge {
    project: String,
    storage: Arc<RepoStagesStorage>,
    lock_manager: Arc<LockManager>,
    host_locker: Arc<HostLocker>,
    sink: Arc<dyn ProgressSink>,
    options: StagesPurgeOptions,
}

impl StagesPurge {
    /// Creates the stages purge engine.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        storage: Arc<RepoStagesStorage>,
        lock_manager: Arc<LockManager>,
        host_locker: Arc<HostLocker>,
        options: StagesPurgeOptions,
    ) -> Self {
        Self {
            project: project.into(),
            storage,
            lock_manager,
            host_locker,
            sink: Arc::new(TracingSink),
            options,
        }
    }

    /// Replaces the progress sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Runs the purge under the distributed and host locks.
    ///
    /// # Errors
    ///
    /// Fails on lock acquisition, registry access, or cancellation.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<PurgeReport> {
        let start = Instant::now();
        let lock = self
            .lock_manager
            .lock_stages_and_images(
                &self.project,
                LockStagesAndImagesOptions::default(),
                cancel,
            )
            .await?;

        let result = self.run_host_locked(cancel).await;
        let released = lock.release().await;
        let report = result?;
        released?;

        metrics::record_run_duration("stages-purge", start.elapsed().as_secs_f64());
        Ok(report)
    }

    async fn run_host_locked(&self, cancel: &CancellationToken) -> Result<PurgeReport> {
        let lock_name = format!("stages-purge.{}", self.project);
        let guard = self
            .host_locker
            .acquire(&lock_name, DEFAULT_HOST_LOCK_TIMEOUT, cancel)
            .await?;
        let result = self.run_locked(cancel).await;
        drop(guard);
        result
    }

    /// Runs the purge phases assuming both locks are held.
    ///
    /// Also used by [`Purge`] which takes the locks itself.
    pub(crate) async fn run_locked(&self, cancel: &CancellationToken) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();

        self.sink
            .emit(&CleanupEvent::PhaseStarted { phase: "delete-stages" });
        let stages = self.storage.get_all_stages(cancel).await?;
        let mut deleted = 0;
        for stage_id in stages {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    operation: "stages purge: remaining deletes skipped".into(),
                });
            }
            let Some(description) = self.storage.get_stage_description(&stage_id, cancel).await?
            else {
                // Stage vanished between listing and fetch.
                continue;
            };

            tracing::info!(stage = %stage_id, dry_run = self.options.dry_run, "deleting stage");
            report.deleted_stages.push(stage_id.to_string());
            deleted += 1;
            if !self.options.dry_run {
                if let Err(e) = self.storage.delete_stages(&[description], cancel).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    tracing::warn!(stage = %stage_id, error = %e, "stage deletion failed");
                    report.errors.push(format!("delete stage {stage_id}: {e}"));
                }
            }
        }
        self.sink.emit(&CleanupEvent::PhaseCompleted {
            phase: "delete-stages",
            deleted,
            kept: 0,
        });

        self.sink.emit(&CleanupEvent::PhaseStarted {
            phase: "delete-managed-images",
        });
        let managed = self.storage.get_managed_images(cancel).await?;
        let mut records = 0;
        for image_name in &managed {
            tracing::info!(
                image = display_image_name(image_name),
                dry_run = self.options.dry_run,
                "deleting managed image record"
            );
            report
                .deleted_tags
                .push(stagehand_registry::tag::encode_managed(image_name));
            records += 1;
            if !self.options.dry_run {
                if let Err(e) = self.storage.rm_managed_image(image_name, cancel).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    report
                        .errors
                        .push(format!("delete managed image record {image_name:?}: {e}"));
                }
            }
        }
        self.sink.emit(&CleanupEvent::PhaseCompleted {
            phase: "delete-managed-images",
            deleted: records,
            kept: 0,
        });

        self.delete_metadata_records(&managed, &mut report, cancel).await?;
        self.delete_client_id_records(&mut report, cancel).await?;

        Ok(report)
    }

    async fn delete_metadata_records(
        &self,
        managed: &[String],
        report: &mut PurgeReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.sink.emit(&CleanupEvent::PhaseStarted {
            phase: "delete-images-metadata",
        });
        let mut deleted = 0;
        for image_name in managed {
            for commit in self.storage.get_image_commits(image_name, cancel).await? {
                self.sink.emit(&CleanupEvent::MetadataDeleted {
                    image: image_name.clone(),
                    commit: commit.clone(),
                    dry_run: self.options.dry_run,
                });
                report
                    .deleted_tags
                    .push(stagehand_registry::tag::encode_metadata(image_name, &commit));
                deleted += 1;
                if !self.options.dry_run {
                    if let Err(e) = self.storage.rm_image_commit(image_name, &commit, cancel).await
                    {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        report
                            .errors
                            .push(format!("delete metadata {image_name}@{commit}: {e}"));
                    }
                }
            }
        }
        self.sink.emit(&CleanupEvent::PhaseCompleted {
            phase: "delete-images-metadata",
            deleted,
            kept: 0,
        });
        Ok(())
    }

    async fn delete_client_id_records(
        &self,
        report: &mut PurgeReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.sink.emit(&CleanupEvent::PhaseStarted {
            phase: "delete-client-id-records",
        });
        let mut deleted = 0;
        for record in self.storage.get_client_id_records(cancel).await? {
            let tag =
                stagehand_registry::tag::encode_client_id(&record.client_id, record.timestamp_millis);
            tracing::info!(tag, dry_run = self.options.dry_run, "deleting client-id record");
            report.deleted_tags.push(tag.clone());
            deleted += 1;
            if !self.options.dry_run {
                let info = self.storage.registry().try_get_image_info(&tag).await?;
                if let Some(info) = info {
                    if let Err(e) = self.storage.registry().delete_repo_image(&info).await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        report.errors.push(format!("delete client-id {tag}: {e}"));
                    }
                }
            }
        }
        self.sink.emit(&CleanupEvent::PhaseCompleted {
            phase: "delete-client-id-records",
            deleted,
            kept: 0,
        });
        Ok(())
    }
}

/// Full project purge: published images first, stages and records after.
pub struct Purge {
    project: String,
    storage: Arc<RepoStagesStorage>,
    images_repo: Arc<ImagesRepo>,
    lock_manager: Arc<LockManager>,
    host_locker: Arc<HostLocker>,
    sink: Arc<dyn ProgressSink>,
    image_names: Vec<String>,
    options: StagesPurgeOptions,
}

impl Purge {
    /// Creates the purge engine; `image_names` extends the scope beyond
    /// the recorded managed images.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        storage: Arc<RepoStagesStorage>,
        images_repo: Arc<ImagesRepo>,
        lock_manager: Arc<LockManager>,
        host_locker: Arc<HostLocker>,
        image_names: Vec<String>,
        options: StagesPurgeOptions,
    ) -> Self {
        Self {
            project: project.into(),
            storage,
            images_repo,
            lock_manager,
            host_locker,
            sink: Arc::new(TracingSink),
            image_names,
            options,
        }
    }

    /// Replaces the progress sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Runs the full purge under the distributed and host locks.
    ///
    /// # Errors
    ///
    /// Fails on lock acquisition, registry access, or cancellation.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<PurgeReport> {
        let start = Instant::now();
        let lock = self
            .lock_manager
            .lock_stages_and_images(
                &self.project,
                LockStagesAndImagesOptions::default(),
                cancel,
            )
            .await?;

        let result = self.run_host_locked(cancel).await;
        let released = lock.release().await;
        let report = result?;
        released?;

        metrics::record_run_duration("purge", start.elapsed().as_secs_f64());
        Ok(report)
    }

    async fn run_host_locked(&self, cancel: &CancellationToken) -> Result<PurgeReport> {
        let lock_name = format!("stages-purge.{}", self.project);
        let guard = self
            .host_locker
            .acquire(&lock_name, DEFAULT_HOST_LOCK_TIMEOUT, cancel)
            .await?;
        let result = self.run_locked(cancel).await;
        drop(guard);
        result
    }

    async fn run_locked(&self, cancel: &CancellationToken) -> Result<PurgeReport> {
        let mut report = self.purge_published_images(cancel).await?;

        let stages = StagesPurge {
            project: self.project.clone(),
            storage: Arc::clone(&self.storage),
            lock_manager: Arc::clone(&self.lock_manager),
            host_locker: Arc::clone(&self.host_locker),
            sink: Arc::clone(&self.sink),
            options: self.options.clone(),
        };
        let stages_report = stages.run_locked(cancel).await?;

        report.deleted_stages.extend(stages_report.deleted_stages);
        report.deleted_tags.extend(stages_report.deleted_tags);
        report.errors.extend(stages_report.errors);
        Ok(report)
    }

    async fn purge_published_images(&self, cancel: &CancellationToken) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();
        self.sink.emit(&CleanupEvent::PhaseStarted {
            phase: "delete-published-images",
        });

        // Scope: every recorded managed image, plus the explicit names.
        let mut scope: HashSet<String> =
            self.storage.get_managed_images(cancel).await?.into_iter().collect();
        scope.extend(self.image_names.iter().cloned());
        let mut scope: Vec<String> = scope.into_iter().collect();
        scope.sort();

        let images = self.images_repo.get_repo_images(&scope, cancel).await?;
        let mut deleted = 0;
        for (image, image_list) in images {
            for info in image_list {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled {
                        operation: "images purge: remaining deletes skipped".into(),
                    });
                }
                self.sink.emit(&CleanupEvent::ImageDeleted {
                    image: image.clone(),
                    tag: info.tag.clone(),
                    dry_run: self.options.dry_run,
                });
                report.deleted_tags.push(info.name());
                deleted += 1;
                if !self.options.dry_run {
                    if let Err(e) = self.images_repo.delete_repo_image(&info, cancel).await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        report.errors.push(format!("delete {}: {e}", info.name()));
                    }
                }
            }
        }

        self.sink.emit(&CleanupEvent::PhaseCompleted {
            phase: "delete-published-images",
            deleted,
            kept: 0,
        });
        Ok(report)
    }
}

fn display_image_name(name: &str) -> &str {
    if name.is_empty() {
        stagehand_registry::tag::NAMELESS_IMAGE_RECORD_TAG
    } else {
        name
    }
}
