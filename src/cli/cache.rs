// src/cli/cache.rs
//! Download cache commands

use clap::Subcommand;

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Show cache location, entry count and size
    Info {
        /// List every entry
        #[arg(long)]
        entries: bool,
    },

    /// Remove every cached artifact
    Clear,
}
