//! `stagehand purge`.

use std::sync::Arc;

use clap::Args;

use stagehand_cleanup::{Purge, StagesPurgeOptions};

use crate::setup::build_common;
use crate::GlobalArgs;

/// Arguments for `stagehand purge`.
#[derive(Debug, Args)]
pub struct PurgeArgs {
    /// Log intended deletions without performing them.
    #[arg(long)]
    pub dry_run: bool,

    /// Image name to include beyond the recorded managed images;
    /// repeatable.
    #[arg(long = "image")]
    pub images: Vec<String>,

    /// Accepted for compatibility; this invocation only touches the
    /// remote repository.
    #[arg(long = "rm-containers-that-use-images")]
    pub rm_containers_that_use_images: bool,
}

/// Runs the purge command.
///
/// # Errors
///
/// Fails on setup errors, fatal engine errors, or when per-item delete
/// failures occurred (non-zero exit).
pub async fn execute(args: PurgeArgs, cli: &GlobalArgs) -> anyhow::Result<()> {
    let common = build_common(cli).await?;
    let cancel = crate::setup::cancellation_on_ctrl_c();

    if args.rm_containers_that_use_images {
        tracing::warn!(
            "--rm-containers-that-use-images has no effect: purge only touches the remote repository"
        );
    }

    let purge = Purge::new(
        &common.project,
        Arc::clone(&common.storage),
        Arc::clone(&common.images_repo),
        Arc::clone(&common.lock_manager),
        Arc::clone(&common.host_locker),
        args.images,
        StagesPurgeOptions {
            dry_run: args.dry_run,
        },
    );
    let report = purge.run(&cancel).await?;
    println!(
        "purge finished: {} stages and {} tags removed",
        report.deleted_stages.len(),
        report.deleted_tags.len()
    );

    if report.has_errors() {
        anyhow::bail!("{} deletion(s) failed; see the log", report.errors.len());
    }
    Ok(())
}
