//! `stagehand cleanup`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Args;

use stagehand_cleanup::{ImagesCleanup, ImagesCleanupOptions};
use stagehand_core::config::{RetentionPolicies, StrategyPolicy};
use stagehand_git::GixRepository;
use stagehand_kube::KubeImagesProbe;
use tokio_util::sync::CancellationToken;

use crate::setup::{build_common, Common};
use crate::GlobalArgs;

/// Arguments for `stagehand cleanup`.
#[derive(Debug, Args)]
pub struct CleanupArgs {
    /// Log intended deletions without performing them.
    #[arg(long)]
    pub dry_run: bool,

    /// Use git-history-based cleanup instead of per-strategy retention.
    #[arg(long)]
    pub git_history_based_cleanup: bool,

    /// Also delete tags lacking related image metadata.
    #[arg(long = "git-history-based-cleanup-v1-2")]
    pub git_history_based_cleanup_v12: bool,

    /// Skip the Kubernetes deployed-image exclusion.
    #[arg(long)]
    pub without_kube: bool,

    /// Kube context to probe; repeatable. Empty means the current context.
    #[arg(long = "kube-context")]
    pub kube_contexts: Vec<String>,

    /// Local git working copy to consult.
    #[arg(long, default_value = ".")]
    pub git_dir: PathBuf,

    /// Image name in scope; repeatable. Defaults to the recorded
    /// managed images.
    #[arg(long = "image")]
    pub images: Vec<String>,

    /// Keep at most this many git-tag strategy images.
    #[arg(long)]
    pub git_tag_strategy_limit: Option<u64>,

    /// Delete git-tag strategy images older than this many days.
    #[arg(long)]
    pub git_tag_strategy_expiry_days: Option<i64>,

    /// Keep at most this many git-commit strategy images.
    #[arg(long)]
    pub git_commit_strategy_limit: Option<u64>,

    /// Delete git-commit strategy images older than this many days.
    #[arg(long)]
    pub git_commit_strategy_expiry_days: Option<i64>,

    /// Keep at most this many stages-signature strategy images.
    #[arg(long)]
    pub stages_signature_strategy_limit: Option<u64>,

    /// Delete stages-signature strategy images older than this many days.
    #[arg(long)]
    pub stages_signature_strategy_expiry_days: Option<i64>,
}

/// Runs the cleanup command.
///
/// # Errors
///
/// Fails on setup errors, fatal engine errors, or when per-item delete
/// failures occurred (non-zero exit).
pub async fn execute(args: CleanupArgs, cli: &GlobalArgs) -> anyhow::Result<()> {
    let common = build_common(cli).await?;
    let cancel = crate::setup::cancellation_on_ctrl_c();

    let image_names = resolve_scope(&args, &common, &cancel).await?;
    let options = ImagesCleanupOptions {
        image_names,
        without_kube: args.without_kube,
        git_history_based_cleanup: args.git_history_based_cleanup,
        git_history_based_cleanup_v12: args.git_history_based_cleanup_v12,
        history_config: common.config.git_history_based_cleanup.clone(),
        policies: effective_policies(&args, &common),
        dry_run: args.dry_run,
    };

    let mut engine = ImagesCleanup::new(
        &common.project,
        Arc::clone(&common.storage),
        Arc::clone(&common.images_repo),
        Arc::clone(&common.lock_manager),
        Arc::clone(&common.host_locker),
        options,
    )
    .with_parallel(common.parallel);

    match GixRepository::open(&args.git_dir) {
        Ok(git) => {
            engine = engine.with_git(Arc::new(git));
        }
        Err(e) => {
            tracing::warn!(
                git_dir = %args.git_dir.display(),
                error = %e,
                "no usable local git repository; cleanup will be skipped"
            );
        }
    }

    if !args.without_kube {
        let probe = KubeImagesProbe::from_contexts(&args.kube_contexts)
            .await
            .context("build kubernetes clients (use --without-kube to skip)")?;
        engine = engine.with_probe(Arc::new(probe));
    }

    let report = engine.run(&cancel).await?;
    println!(
        "cleanup finished: {} deleted, {} kept, {} metadata records removed",
        report.deleted_tags.len(),
        report.kept_tags.len(),
        report.deleted_metadata.len()
    );

    if report.has_errors() {
        anyhow::bail!("{} deletion(s) failed; see the log", report.errors.len());
    }
    Ok(())
}

/// The image names to clean: explicit `--image` flags, the recorded
/// managed images otherwise, the nameless image as the last resort.
async fn resolve_scope(
    args: &CleanupArgs,
    common: &Common,
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<String>> {
    if !args.images.is_empty() {
        return Ok(args.images.clone());
    }
    let mut managed = common.storage.get_managed_images(cancel).await?;
    if managed.is_empty() {
        managed.push(String::new());
    }
    Ok(managed)
}

fn effective_policies(args: &CleanupArgs, common: &Common) -> RetentionPolicies {
    let mut policies = common.config.policies.clone().unwrap_or_default();
    apply_overrides(
        &mut policies.git_tag,
        args.git_tag_strategy_limit,
        args.git_tag_strategy_expiry_days,
    );
    apply_overrides(
        &mut policies.git_commit,
        args.git_commit_strategy_limit,
        args.git_commit_strategy_expiry_days,
    );
    apply_overrides(
        &mut policies.stages_signature,
        args.stages_signature_strategy_limit,
        args.stages_signature_strategy_expiry_days,
    );
    policies
}

fn apply_overrides(policy: &mut StrategyPolicy, limit: Option<u64>, expiry_days: Option<i64>) {
    if limit.is_some() {
        policy.limit = limit;
    }
    if let Some(days) = expiry_days {
        policy.expiry = Some(chrono::Duration::days(days));
    }
}
