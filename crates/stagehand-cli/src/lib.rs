//! # stagehand-cli
//!
//! Command-line interface for the stagehand cleanup orchestrator.
//!
//! ## Commands
//!
//! - `stagehand cleanup` - policy-driven cleanup of published images
//! - `stagehand purge` - unconditional removal of images, stages and records
//! - `stagehand stages purge` - unconditional removal of stages and records
//!
//! ## Configuration
//!
//! Shared settings come from flags or environment variables:
//!
//! - `STAGEHAND_REPO` - backing repository address (`host/path`)
//! - `STAGEHAND_PROJECT` - project name
//! - `STAGEHAND_HOME` - state directory (locks); defaults to `~/.stagehand`
//!
//! Registry credentials use standard docker-config discovery; kube
//! access uses standard kubeconfig discovery with `--kube-context`
//! overrides.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI prints reports intentionally
#![allow(clippy::print_stdout)]

pub mod commands;
pub mod setup;

use clap::{Args, Parser, Subcommand};

use stagehand_core::observability::LogFormat;

/// stagehand - cleanup orchestrator for container image repositories.
#[derive(Debug, Parser)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Settings shared by every command.
    #[command(flatten)]
    pub globals: GlobalArgs,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Settings shared by every command.
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Backing repository address (`host/path`).
    #[arg(long, env = "STAGEHAND_REPO", global = true)]
    pub repo: Option<String>,

    /// Project name.
    #[arg(long, env = "STAGEHAND_PROJECT", global = true)]
    pub project: Option<String>,

    /// Cleanup config file (YAML).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<std::path::PathBuf>,

    /// Registry implementation override (default, dockerhub, gcr, ...).
    #[arg(long, global = true)]
    pub repo_implementation: Option<String>,

    /// Use plain HTTP to reach the registry.
    #[arg(long, global = true)]
    pub insecure_registry: bool,

    /// Bound on concurrent registry/kube calls within a phase.
    #[arg(long, global = true)]
    pub parallel: Option<usize>,

    /// Distributed lock backend: `file` or `kubernetes`.
    #[arg(long, default_value = "file", global = true)]
    pub distributed_lock: String,

    /// Namespace for the kubernetes lock backend.
    #[arg(long, default_value = "default", global = true)]
    pub lock_namespace: String,

    /// Log output format: `pretty` or `json`.
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: LogFormat,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Policy-driven cleanup of published images.
    Cleanup(commands::cleanup::CleanupArgs),
    /// Unconditional removal of images, stages and records.
    Purge(commands::purge::PurgeArgs),
    /// Stage-scoped operations.
    #[command(subcommand)]
    Stages(StagesCommands),
}

/// `stagehand stages` subcommands.
#[derive(Debug, Subcommand)]
pub enum StagesCommands {
    /// Unconditional removal of stages and records.
    Purge(commands::stages::StagesPurgeArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_cleanup_flags() {
        let cli = Cli::try_parse_from([
            "stagehand",
            "--repo",
            "registry.local/demo",
            "--project",
            "demo",
            "cleanup",
            "--dry-run",
            "--git-history-based-cleanup",
            "--kube-context",
            "staging",
            "--kube-context",
            "production",
        ])
        .expect("parse");

        assert_eq!(cli.globals.repo.as_deref(), Some("registry.local/demo"));
        let Commands::Cleanup(args) = cli.command else {
            panic!("expected cleanup command");
        };
        assert!(args.dry_run);
        assert!(args.git_history_based_cleanup);
        assert_eq!(args.kube_contexts, vec!["staging", "production"]);
    }

    #[test]
    fn test_cli_parses_stages_purge() {
        let cli = Cli::try_parse_from([
            "stagehand",
            "--repo",
            "registry.local/demo",
            "--project",
            "demo",
            "stages",
            "purge",
            "--dry-run",
        ])
        .expect("parse");

        let Commands::Stages(StagesCommands::Purge(args)) = cli.command else {
            panic!("expected stages purge command");
        };
        assert!(args.dry_run);
    }
}
