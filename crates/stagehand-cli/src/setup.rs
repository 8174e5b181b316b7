//! Shared construction of the engine collaborators from CLI settings.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;

use stagehand_core::config::CleanupConfig;
use stagehand_core::host_lock::HostLocker;
use stagehand_core::lock::{FileLockBackend, LockBackend, LockManager};
use stagehand_kube::ConfigMapLockBackend;
use stagehand_registry::{
    new_registry, Implementation, ImagesRepo, RegistryOptions, RepoStagesStorage,
};

use crate::GlobalArgs;

/// Collaborators shared by every command.
pub struct Common {
    /// Backing repository address.
    pub repo: String,
    /// Project name.
    pub project: String,
    /// Parsed cleanup config (empty when no file was given).
    pub config: CleanupConfig,
    /// Stages storage over the registry adapter.
    pub storage: Arc<RepoStagesStorage>,
    /// Published-image access.
    pub images_repo: Arc<ImagesRepo>,
    /// Distributed lock manager.
    pub lock_manager: Arc<LockManager>,
    /// Host lock manager.
    pub host_locker: Arc<HostLocker>,
    /// Effective fan-out bound.
    pub parallel: usize,
}

/// Builds the shared collaborators.
///
/// # Errors
///
/// Fails on missing repo/project, unreadable config, or registry/lock
/// backend construction errors.
pub async fn build_common(cli: &GlobalArgs) -> anyhow::Result<Common> {
    let repo = cli
        .repo
        .clone()
        .context("--repo (or STAGEHAND_REPO) is required")?;
    let project = cli
        .project
        .clone()
        .context("--project (or STAGEHAND_PROJECT) is required")?;

    let config = match &cli.config {
        Some(path) => CleanupConfig::from_yaml_path(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => CleanupConfig::default(),
    };
    let parallel = cli.parallel.unwrap_or_else(|| config.parallel());

    let implementation = cli
        .repo_implementation
        .as_deref()
        .map(Implementation::from_name)
        .transpose()?;
    let registry = new_registry(
        &repo,
        RegistryOptions {
            implementation,
            credentials: None,
            insecure: cli.insecure_registry,
        },
    )?;

    let storage = Arc::new(RepoStagesStorage::new(Arc::clone(&registry)));
    let images_repo = Arc::new(ImagesRepo::new(registry, parallel));

    let lock_backend: Arc<dyn LockBackend> = match cli.distributed_lock.as_str() {
        "file" => Arc::new(FileLockBackend::new(home_dir()?.join("distributed-locks"))?),
        "kubernetes" => {
            let client = kube::Client::try_default()
                .await
                .context("build kube client for the lock backend")?;
            Arc::new(ConfigMapLockBackend::new(client, &cli.lock_namespace))
        }
        other => anyhow::bail!("unknown distributed lock backend {other:?} (file, kubernetes)"),
    };
    let lock_manager = Arc::new(LockManager::new(lock_backend));
    let host_locker = Arc::new(HostLocker::new(home_dir()?.join("locks"))?);

    Ok(Common {
        repo,
        project,
        config,
        storage,
        images_repo,
        lock_manager,
        host_locker,
        parallel,
    })
}

/// The stagehand state directory (`$STAGEHAND_HOME` or `~/.stagehand`).
///
/// # Errors
///
/// Fails when neither `STAGEHAND_HOME` nor `HOME` is set.
pub fn home_dir() -> anyhow::Result<PathBuf> {
    if let Some(home) = std::env::var_os("STAGEHAND_HOME") {
        return Ok(PathBuf::from(home));
    }
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".stagehand"))
        .context("neither STAGEHAND_HOME nor HOME is set")
}

/// Returns a token that fires on Ctrl-C.
#[must_use]
pub fn cancellation_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing the current write and stopping");
            trigger.cancel();
        }
    });
    cancel
}
