// src/main.rs

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{CacheCommands, Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { recipe } => commands::cmd_validate(&recipe),
        Commands::Deps { recipe, target } => commands::cmd_deps(&recipe, &target),
        Commands::Plan {
            recipe,
            version,
            version_tag,
            target,
            output,
            no_download,
        } => commands::cmd_plan(
            &recipe,
            &version,
            version_tag.as_deref(),
            &target,
            output.as_deref(),
            no_download,
        ),
        Commands::Install { plan, timeout } => commands::cmd_install(&plan, timeout),
        Commands::Cache(CacheCommands::Info { entries }) => commands::cmd_cache_info(entries),
        Commands::Cache(CacheCommands::Clear) => commands::cmd_cache_clear(),
    }
}
