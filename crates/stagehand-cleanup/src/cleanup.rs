//! Images cleanup engine.
//!
//! Orchestrates one cleanup invocation: lock acquisition (distributed
//! outer, host inner), published-image fetching, Kubernetes exclusion,
//! the nonexistent-git-primitive passes, either git-history-based
//! cleanup or per-strategy retention, and orphaned-metadata collection.
//! Phase order is strict; fan-out happens inside phases.
//!
//! Per-image delete failures are logged and counted without aborting the
//! run; the caller turns a non-empty error list into a non-zero exit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

use stagehand_core::config::{GitHistoryCleanupConfig, RetentionPolicies};
use stagehand_core::error::{Error, Result};
use stagehand_core::host_lock::{HostLocker, DEFAULT_HOST_LOCK_TIMEOUT};
use stagehand_core::lock::{LockManager, LockStagesAndImagesOptions};
use stagehand_core::probe::DeployedImagesProbe;
use stagehand_git::GitRepository;
use stagehand_registry::{ImageInfo, ImageMetadata, ImagesRepo, RepoStagesStorage, TagStrategy};

use crate::events::{CleanupEvent, ProgressSink, TracingSink};
use crate::metrics;
use crate::policies::{apply_retention, strategy_policies};
use crate::reference::resolve_references;
use crate::scanner::scan_references_history;

/// Options controlling one cleanup invocation.
#[derive(Debug, Clone, Default)]
pub struct ImagesCleanupOptions {
    /// Image names in scope (empty string is the nameless image).
    pub image_names: Vec<String>,
    /// Skip Kubernetes exclusion even when a probe is configured.
    pub without_kube: bool,
    /// Use git-history-based cleanup instead of per-strategy retention.
    pub git_history_based_cleanup: bool,
    /// Delete tags lacking related metadata instead of keeping them.
    pub git_history_based_cleanup_v12: bool,
    /// Keep policies for git-history-based cleanup.
    pub history_config: Option<GitHistoryCleanupConfig>,
    /// Per-strategy retention policies.
    pub policies: RetentionPolicies,
    /// Log intended writes without performing them.
    pub dry_run: bool,
}

/// Result of one cleanup invocation.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Deleted (or dry-run deleted) tag references.
    pub deleted_tags: Vec<String>,
    /// Deleted (or dry-run deleted) metadata records as (image, commit).
    pub deleted_metadata: Vec<(String, String)>,
    /// Tags surviving the invocation.
    pub kept_tags: Vec<String>,
    /// Per-item failures that did not abort the run.
    pub errors: Vec<String>,
}

impl CleanupReport {
    /// Returns true if any per-item failure occurred.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Composite grouping key for survivor images per content signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ImageSignatureKey {
    image: String,
    signature: String,
}

/// The images cleanup engine.
pub struct ImagesCleanup {
    project: String,
    storage: Arc<RepoStagesStorage>,
    images_repo: Arc<ImagesRepo>,
    lock_manager: Arc<LockManager>,
    host_locker: Arc<HostLocker>,
    git: Option<Arc<dyn GitRepository>>,
    probe: Option<Arc<dyn DeployedImagesProbe>>,
    sink: Arc<dyn ProgressSink>,
    parallel: usize,
    options: ImagesCleanupOptions,
}

impl ImagesCleanup {
    /// Creates the engine; git, probe and sink are attached with the
    /// builder methods.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        storage: Arc<RepoStagesStorage>,
        images_repo: Arc<ImagesRepo>,
        lock_manager: Arc<LockManager>,
        host_locker: Arc<HostLocker>,
        options: ImagesCleanupOptions,
    ) -> Self {
        Self {
            project: project.into(),
            storage,
            images_repo,
            lock_manager,
            host_locker,
            git: None,
            probe: None,
            sink: Arc::new(TracingSink),
            parallel: stagehand_core::config::DEFAULT_PARALLEL,
            options,
        }
    }

    /// Attaches the local git repository.
    #[must_use]
    pub fn with_git(mut self, git: Arc<dyn GitRepository>) -> Self {
        self.git = Some(git);
        self
    }

    /// Attaches the deployed-images probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn DeployedImagesProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Replaces the progress sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Overrides the per-phase fan-out bound.
    #[must_use]
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    /// Runs the cleanup under the distributed and host locks.
    ///
    /// # Errors
    ///
    /// Fails on lock acquisition, registry/git/kube access, or
    /// cancellation. Per-image delete failures do not fail the run; they
    /// are collected in the report.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<CleanupReport> {
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

        metrics::record_run_duration("images-cleanup", start.elapsed().as_secs_f64());
        Ok(report)
    }

    async fn run_host_locked(&self, cancel: &CancellationToken) -> Result<CleanupReport> {
        let lock_name = format!("images-cleanup.{}", self.images_repo.repo_address());
        let guard = self
            .host_locker
            .acquire(&lock_name, DEFAULT_HOST_LOCK_TIMEOUT, cancel)
            .await?;
        let result = self.run_locked(cancel).await;
        drop(guard);
        result
    }

    async fn run_locked(&self, cancel: &CancellationToken) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        let Some(git) = self.git.clone() else {
            tracing::info!("images cleanup skipped: no local git repository");
            return Ok(report);
        };
        let history_mode =
            self.options.git_history_based_cleanup || self.options.git_history_based_cleanup_v12;

        self.phase_start("fetch-repo-images");
        let mut to_cleanup = self
            .images_repo
            .get_repo_images(&self.options.image_names, cancel)
            .await?;
        let fetched: usize = to_cleanup.values().map(Vec::len).sum();
        self.phase_done("fetch-repo-images", 0, fetched);

        let metadata = if history_mode {
            self.phase_start("fetch-images-metadata");
            let metadata = self.fetch_metadata(cancel).await?;
            let records: usize = metadata.values().map(HashMap::len).sum();
            self.phase_done("fetch-images-metadata", 0, records);
            metadata
        } else {
            HashMap::new()
        };

        let mut in_use: HashMap<String, Vec<ImageInfo>> = HashMap::new();
        if !self.options.without_kube {
            if let Some(probe) = &self.probe {
                self.phase_start("exclude-deployed-images");
                let deployed = probe.deployed_images(cancel).await?;
                let mut excluded = 0;
                for (image, image_list) in &mut to_cleanup {
                    let (used, candidates): (Vec<ImageInfo>, Vec<ImageInfo>) = image_list
                        .drain(..)
                        .partition(|info| deployed.contains(&info.name()));
                    for info in &used {
                        self.sink.emit(&CleanupEvent::ImageKept {
                            image: image.clone(),
                            tag: info.tag.clone(),
                            reason: "deployed in kubernetes",
                        });
                    }
                    excluded += used.len();
                    in_use.entry(image.clone()).or_default().extend(used);
                    *image_list = candidates;
                }
                self.phase_done("exclude-deployed-images", 0, excluded);
            }
        }

        self.cleanup_nonexistent_primitives(git.as_ref(), &mut to_cleanup, &mut report, cancel)
            .await?;

        let mut kept = if history_mode {
            self.git_history_based_cleanup(git.as_ref(), to_cleanup, &metadata, &mut report, cancel)
                .await?
        } else {
            self.cleanup_by_policies(to_cleanup, &mut report, cancel).await?
        };

        // Deployed images are never deleted but belong to the final result.
        for (image, image_list) in in_use {
            kept.entry(image).or_default().extend(image_list);
        }

        if history_mode {
            self.delete_orphaned_metadata(&kept, &metadata, &mut report, cancel)
                .await?;
        }

        for image_list in kept.values() {
            for info in image_list {
                report.kept_tags.push(info.name());
            }
        }
        report.kept_tags.sort();
        Ok(report)
    }

    /// Fetches per-commit metadata for every image in scope.
    async fn fetch_metadata(
        &self,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, HashMap<String, ImageMetadata>>> {
        let mut metadata = HashMap::new();
        for image in &self.options.image_names {
            let commits = self.storage.get_image_commits(image, cancel).await?;
            let entries: Vec<(String, Option<ImageMetadata>)> = stream::iter(commits)
                .map(|commit| {
                    let storage = Arc::clone(&self.storage);
                    let image = image.clone();
                    async move {
                        let meta = storage
                            .get_image_metadata_by_commit(&image, &commit, cancel)
                            .await?;
                        Ok::<_, Error>((commit, meta))
                    }
                })
                .buffer_unordered(self.parallel)
                .try_collect()
                .await?;

            let commit_metadata: HashMap<String, ImageMetadata> = entries
                .into_iter()
                .filter_map(|(commit, meta)| meta.map(|meta| (commit, meta)))
                .collect();
            metadata.insert(image.clone(), commit_metadata);
        }
        Ok(metadata)
    }

    /// Deletes images whose git tag/branch/commit no longer exists.
    ///
    /// Three passes, each logged under its own phase.
    async fn cleanup_nonexistent_primitives(
        &self,
        git: &dyn GitRepository,
        to_cleanup: &mut HashMap<String, Vec<ImageInfo>>,
        report: &mut CleanupReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let git_tags = git.tags_list()?;
        let git_branches = git.remote_branches_list()?;

        let mut by_tag: HashMap<String, Vec<ImageInfo>> = HashMap::new();
        let mut by_branch: HashMap<String, Vec<ImageInfo>> = HashMap::new();
        let mut by_commit: HashMap<String, Vec<ImageInfo>> = HashMap::new();

        for (image, image_list) in to_cleanup.iter_mut() {
            let mut keep = Vec::new();
            for info in image_list.drain(..) {
                match info.tag_strategy() {
                    Some(TagStrategy::GitTag) => {
                        if meta_tag_matches(info.meta_tag(), &git_tags) {
                            keep.push(info);
                        } else {
                            by_tag.entry(image.clone()).or_default().push(info);
                        }
                    }
                    Some(TagStrategy::GitBranch) => {
                        if meta_tag_matches(info.meta_tag(), &git_branches) {
                            keep.push(info);
                        } else {
                            by_branch.entry(image.clone()).or_default().push(info);
                        }
                    }
                    Some(TagStrategy::GitCommit) => {
                        if git.is_commit_exists(info.meta_tag())? {
                            keep.push(info);
                        } else {
                            by_commit.entry(image.clone()).or_default().push(info);
                        }
                    }
                    _ => keep.push(info),
                }
            }
            *image_list = keep;
        }

        for (phase, group) in [
            ("nonexistent-git-tag", by_tag),
            ("nonexistent-git-branch", by_branch),
            ("nonexistent-git-commit", by_commit),
        ] {
            if group.values().all(Vec::is_empty) {
                continue;
            }
            self.phase_start(phase);
            let mut deleted = 0;
            for (image, image_list) in group {
                deleted += image_list.len();
                self.delete_image_list(phase, &image, image_list, report, cancel)
                    .await?;
            }
            self.phase_done(phase, deleted, 0);
        }
        Ok(())
    }

    /// Per-strategy retention cleanup.
    async fn cleanup_by_policies(
        &self,
        to_cleanup: HashMap<String, Vec<ImageInfo>>,
        report: &mut CleanupReport,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Vec<ImageInfo>>> {
        self.phase_start("retention-policies");
        let now = Utc::now();
        let policies = strategy_policies(&self.options.policies);
        let mut kept: HashMap<String, Vec<ImageInfo>> = HashMap::new();
        let mut deleted = 0;
        let mut kept_count = 0;

        for (image, image_list) in to_cleanup {
            let mut remaining = Vec::new();
            let mut per_strategy: HashMap<&'static str, Vec<ImageInfo>> = HashMap::new();
            for info in image_list {
                match info.tag_strategy() {
                    Some(strategy @ (TagStrategy::GitTag
                    | TagStrategy::GitCommit
                    | TagStrategy::StagesSignature)) => {
                        per_strategy.entry(strategy.as_str()).or_default().push(info);
                    }
                    // Unlabeled, branch- and custom-tagged images are not
                    // policy-eligible.
                    _ => remaining.push(info),
                }
            }

            for policy in &policies {
                let images = per_strategy.remove(policy.strategy.as_str()).unwrap_or_default();
                let outcome = apply_retention(policy, now, images);

                if !outcome.expired.is_empty() {
                    tracing::info!(
                        image,
                        strategy = policy.strategy.as_str(),
                        count = outcome.expired.len(),
                        "removing tags by date policy"
                    );
                    deleted += outcome.expired.len();
                    self.delete_image_list(
                        "retention-policies",
                        &image,
                        outcome.expired,
                        report,
                        cancel,
                    )
                    .await?;
                }
                if !outcome.excess.is_empty() {
                    tracing::info!(
                        image,
                        strategy = policy.strategy.as_str(),
                        count = outcome.excess.len(),
                        "removing tags by limit policy"
                    );
                    deleted += outcome.excess.len();
                    self.delete_image_list(
                        "retention-policies",
                        &image,
                        outcome.excess,
                        report,
                        cancel,
                    )
                    .await?;
                }
                remaining.extend(outcome.keep);
            }

            kept_count += remaining.len();
            kept.insert(image, remaining);
        }

        self.phase_done("retention-policies", deleted, kept_count);
        Ok(kept)
    }

    /// Git-history-based cleanup: keep images whose content signature is
    /// reachable from the configured references, delete the rest.
    async fn git_history_based_cleanup(
        &self,
        git: &dyn GitRepository,
        to_cleanup: HashMap<String, Vec<ImageInfo>>,
        metadata: &HashMap<String, HashMap<String, ImageMetadata>>,
        report: &mut CleanupReport,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Vec<ImageInfo>>> {
        self.phase_start("git-history-based-cleanup");
        let references =
            resolve_references(git, self.options.history_config.as_ref(), Utc::now())?;
        tracing::debug!(count = references.len(), "prepared references to scan");

        let mut kept: HashMap<String, Vec<ImageInfo>> = HashMap::new();
        let mut deleted = 0;
        let mut kept_count = 0;

        for (image, image_list) in to_cleanup {
            let image_metadata = metadata.get(&image).cloned().unwrap_or_default();
            let covered_signatures: HashSet<&str> = image_metadata
                .values()
                .map(|meta| meta.content_signature.as_str())
                .collect();

            // Group candidates by content signature; tags with no related
            // metadata are handled per the v1.2 flag.
            let mut grouped: HashMap<ImageSignatureKey, Vec<ImageInfo>> = HashMap::new();
            let mut without_metadata = Vec::new();
            for info in image_list {
                match info.content_signature() {
                    Some(signature) if covered_signatures.contains(signature) => {
                        grouped
                            .entry(ImageSignatureKey {
                                image: image.clone(),
                                signature: signature.to_string(),
                            })
                            .or_default()
                            .push(info);
                    }
                    _ => without_metadata.push(info),
                }
            }

            if !self.options.git_history_based_cleanup_v12 && !without_metadata.is_empty() {
                tracing::warn!(
                    image,
                    count = without_metadata.len(),
                    "tags without related image metadata are kept; \
                     use the v1.2 behavior to delete them"
                );
                for info in &without_metadata {
                    self.sink.emit(&CleanupEvent::ImageKept {
                        image: image.clone(),
                        tag: info.tag.clone(),
                        reason: "no related image metadata",
                    });
                }
                kept_count += without_metadata.len();
                kept.entry(image.clone()).or_default().extend(without_metadata);
                without_metadata = Vec::new();
            }

            // Signature -> commits still existing in the repository; a
            // signature attached only to vanished commits is unreachable.
            let mut signature_commits: HashMap<String, Vec<String>> = HashMap::new();
            for (commit, meta) in &image_metadata {
                if !covered_signatures.contains(meta.content_signature.as_str()) {
                    continue;
                }
                if git.is_commit_exists(commit)? {
                    signature_commits
                        .entry(meta.content_signature.clone())
                        .or_default()
                        .push(commit.clone());
                }
            }

            let reached: HashSet<String> =
                scan_references_history(git, &references, &signature_commits)?
                    .into_iter()
                    .collect();

            let mut delete_list = without_metadata;
            for (key, image_infos) in grouped {
                if reached.contains(&key.signature) {
                    for info in &image_infos {
                        self.sink.emit(&CleanupEvent::ImageKept {
                            image: image.clone(),
                            tag: info.tag.clone(),
                            reason: "content signature reachable from scanned references",
                        });
                    }
                    kept_count += image_infos.len();
                    kept.entry(image.clone()).or_default().extend(image_infos);
                } else {
                    delete_list.extend(image_infos);
                }
            }

            deleted += delete_list.len();
            self.delete_image_list(
                "git-history-based-cleanup",
                &image,
                delete_list,
                report,
                cancel,
            )
            .await?;
        }

        self.phase_done("git-history-based-cleanup", deleted, kept_count);
        Ok(kept)
    }

    /// Deletes metadata records whose content signature no surviving
    /// image carries.
    async fn delete_orphaned_metadata(
        &self,
        kept: &HashMap<String, Vec<ImageInfo>>,
        metadata: &HashMap<String, HashMap<String, ImageMetadata>>,
        report: &mut CleanupReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.phase_start("delete-unused-metadata");
        let mut deleted = 0;

        for (image, commit_metadata) in metadata {
            let kept_signatures: HashSet<&str> = kept
                .get(image)
                .map(|image_list| {
                    image_list
                        .iter()
                        .filter_map(ImageInfo::content_signature)
                        .collect()
                })
                .unwrap_or_default();

            let mut commits: Vec<&String> = commit_metadata
                .iter()
                .filter(|(_, meta)| !kept_signatures.contains(meta.content_signature.as_str()))
                .map(|(commit, _)| commit)
                .collect();
            commits.sort();

            for commit in commits {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled {
                        operation: "delete unused metadata".into(),
                    });
                }
                self.sink.emit(&CleanupEvent::MetadataDeleted {
                    image: image.clone(),
                    commit: commit.clone(),
                    dry_run: self.options.dry_run,
                });
                report.deleted_metadata.push((image.clone(), commit.clone()));
                deleted += 1;

                if !self.options.dry_run {
                    if let Err(e) = self.storage.rm_image_commit(image, commit, cancel).await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        tracing::warn!(
                            image,
                            commit,
                            error = %e,
                            "metadata record deletion failed"
                        );
                        report
                            .errors
                            .push(format!("delete metadata {image}@{commit}: {e}"));
                    }
                }
            }
        }

        metrics::record_metadata_deleted(deleted);
        self.phase_done("delete-unused-metadata", usize::try_from(deleted).unwrap_or(0), 0);
        Ok(())
    }

    /// Deletes one image list, honoring dry-run and collecting per-item
    /// failures. Cancellation skips the not-yet-started deletes.
    async fn delete_image_list(
        &self,
        phase: &'static str,
        image: &str,
        image_list: Vec<ImageInfo>,
        report: &mut CleanupReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for info in image_list {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    operation: format!("{phase}: remaining deletes skipped"),
                });
            }

            self.sink.emit(&CleanupEvent::ImageDeleted {
                image: image.to_string(),
                tag: info.tag.clone(),
                dry_run: self.options.dry_run,
            });
            report.deleted_tags.push(info.name());

            if !self.options.dry_run {
                if let Err(e) = self.images_repo.delete_repo_image(&info, cancel).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    tracing::warn!(image, tag = info.tag, error = %e, "tag deletion failed");
                    metrics::record_delete_error(phase);
                    report.errors.push(format!("delete {}: {e}", info.name()));
                }
            }
        }
        Ok(())
    }

    fn phase_start(&self, phase: &'static str) {
        self.sink.emit(&CleanupEvent::PhaseStarted { phase });
    }

    fn phase_done(&self, phase: &'static str, deleted: usize, kept: usize) {
        metrics::record_phase(phase, deleted as u64, kept as u64);
        self.sink.emit(&CleanupEvent::PhaseCompleted {
            phase,
            deleted,
            kept,
        });
    }
}

/// Matches a published image's meta tag against git reference names.
///
/// Reference names that are not valid tag text (e.g. `feature/x`) were
/// sanitized at publish time, so both the raw and sanitized forms count.
fn meta_tag_matches(meta_tag: &str, names: &[String]) -> bool {
    names
        .iter()
        .any(|name| meta_tag == name || meta_tag == sanitized_reference_name(name))
}

/// The tag form of a git reference name: every character outside
/// `[A-Za-z0-9_.-]` becomes `-`.
fn sanitized_reference_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_tag_matches_raw_and_sanitized() {
        let names = vec!["v1".to_string(), "feature/x".to_string()];
        assert!(meta_tag_matches("v1", &names));
        assert!(meta_tag_matches("feature/x", &names));
        assert!(meta_tag_matches("feature-x", &names));
        assert!(!meta_tag_matches("v9", &names));
    }

    #[test]
    fn test_report_error_tracking() {
        let mut report = CleanupReport::default();
        assert!(!report.has_errors());
        report.errors.push("delete failed".into());
        assert!(report.has_errors());
    }
}
