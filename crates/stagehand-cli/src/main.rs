//! stagehand CLI - the `stagehand` binary entry point.

use anyhow::Result;
use clap::Parser;

use stagehand_cli::{Cli, Commands, StagesCommands};
use stagehand_core::observability::init_logging;

fn main() -> Result<()> {
    let Cli { globals, command } = Cli::parse();
    init_logging(globals.log_format);
    stagehand_cleanup::metrics::register_metrics();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match command {
            Commands::Cleanup(args) => {
                stagehand_cli::commands::cleanup::execute(args, &globals).await
            }
            Commands::Purge(args) => stagehand_cli::commands::purge::execute(args, &globals).await,
            Commands::Stages(StagesCommands::Purge(args)) => {
                stagehand_cli::commands::stages::execute(args, &globals).await
            }
        }
    })
}
