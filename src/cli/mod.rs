// src/cli/mod.rs
//! CLI definitions for tsuku
//!
//! This module contains the command-line interface definitions using clap.
//! The command implementations are in the `commands` module.
//!
//! - `validate` - Preflight a recipe
//! - `deps` - Show a recipe's resolved dependencies
//! - `plan` - Generate an installation plan
//! - `install` - Execute a plan
//! - `cache` - Inspect or clear the download cache

use clap::{Parser, Subcommand};

mod cache;

pub use cache::CacheCommands;

#[derive(Parser)]
#[command(name = "tsuku")]
#[command(version)]
#[command(about = "Install developer tools from recipes, no root required", long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Platform selection shared by commands that evaluate a recipe
#[derive(clap::Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Target operating system (default: host)
    #[arg(long)]
    pub os: Option<String>,

    /// Target architecture (default: host)
    #[arg(long)]
    pub arch: Option<String>,

    /// Linux distribution family (debian, rhel, arch, alpine, suse)
    #[arg(long)]
    pub family: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a recipe without side effects
    Validate {
        /// Path to the recipe file
        recipe: String,
    },

    /// Show install-time and runtime dependencies of a recipe
    Deps {
        /// Path to the recipe file
        recipe: String,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Generate an installation plan
    Plan {
        /// Path to the recipe file
        recipe: String,

        /// Version to plan for
        #[arg(long)]
        version: String,

        /// Upstream tag (default: v<version>)
        #[arg(long)]
        version_tag: Option<String>,

        #[command(flatten)]
        target: TargetArgs,

        /// Write the plan here instead of stdout
        #[arg(short, long)]
        output: Option<String>,

        /// Do not download artifacts to pin checksums
        #[arg(long)]
        no_download: bool,
    },

    /// Execute an installation plan
    Install {
        /// Path to the plan JSON
        plan: String,

        /// Abort after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Download cache management
    #[command(subcommand)]
    Cache(CacheCommands),
}
