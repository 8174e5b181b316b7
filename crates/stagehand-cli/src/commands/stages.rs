//! `stagehand stages purge`.

use std::sync::Arc;

use clap::Args;

use stagehand_cleanup::{StagesPurge, StagesPurgeOptions};

use crate::setup::build_common;
use crate::GlobalArgs;

/// Arguments for `stagehand stages purge`.
#[derive(Debug, Args)]
pub struct StagesPurgeArgs {
    /// Log intended deletions without performing them.
    #[arg(long)]
    pub dry_run: bool,

    /// Accepted for compatibility; this invocation only touches the
    /// remote repository.
    #[arg(long = "rm-containers-that-use-images")]
    pub rm_containers_that_use_images: bool,
}

/// Runs the stages purge command.
///
/// # Errors
///
/// Fails on setup errors, fatal engine errors, or when per-item delete
/// failures occurred (non-zero exit).
pub async fn execute(args: StagesPurgeArgs, cli: &GlobalArgs) -> anyhow::Result<()> {
    let common = build_common(cli).await?;
    let cancel = crate::setup::cancellation_on_ctrl_c();

    if args.rm_containers_that_use_images {
        tracing::warn!(
            "--rm-containers-that-use-images has no effect: purge only touches the remote repository"
        );
    }

    let purge = StagesPurge::new(
        &common.project,
        Arc::clone(&common.storage),
        Arc::clone(&common.lock_manager),
        Arc::clone(&common.host_locker),
        StagesPurgeOptions {
            dry_run: args.dry_run,
        },
    );
    let report = purge.run(&cancel).await?;
    println!(
        "stages purge finished: {} stages and {} record tags removed",
        report.deleted_stages.len(),
        report.deleted_tags.len()
    );

    if report.has_errors() {
        anyhow::bail!("{} deletion(s) failed; see the log", report.errors.len());
    }
    Ok(())
}
