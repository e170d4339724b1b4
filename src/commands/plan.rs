// src/commands/plan.rs
//! Plan generation command

use super::{home, load_recipe, resolve_target};
use crate::cli::TargetArgs;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tsuku::download::{DownloadCache, PreDownloader, ReqwestTransport, SecureDownloader};
use tsuku::{PlanConfig, Planner, default_registry};
use tracing::info;

/// Generate a plan for one version and target
pub fn cmd_plan(
    recipe_path: &str,
    version: &str,
    version_tag: Option<&str>,
    target: &TargetArgs,
    output: Option<&str>,
    no_download: bool,
) -> Result<()> {
    let recipe = load_recipe(recipe_path)?;
    let home = home()?;
    let target = resolve_target(target);

    let mut config = PlanConfig::new(target, version).with_recipe_source(recipe_path);
    if let Some(tag) = version_tag {
        config = config.with_version_tag(tag);
    }

    let cache = Arc::new(DownloadCache::new(home.download_cache_dir()));
    let mut planner = Planner::new(default_registry(), home).with_download_cache(Arc::clone(&cache));
    if !no_download {
        let transport = Arc::new(ReqwestTransport::new()?);
        let downloader = Arc::new(SecureDownloader::new(transport).with_cache(cache));
        planner = planner.with_downloader(Arc::new(PreDownloader::new(downloader)));
    }

    let plan = planner
        .generate(&recipe, &config)
        .with_context(|| format!("Failed to plan {} {}", recipe.name(), version))?;

    match output {
        Some(path) => {
            plan.save(Path::new(path))?;
            info!("Wrote plan to {}", path);
            println!(
                "Plan for {} {} ({}): {} step(s) -> {}",
                plan.tool,
                plan.version,
                plan.platform,
                plan.steps.len(),
                path
            );
        }
        None => println!("{}", plan.to_json()?),
    }
    Ok(())
}
