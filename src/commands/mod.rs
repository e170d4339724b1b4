// src/commands/mod.rs
//! Command handlers for the tsuku CLI

mod cache;
mod install;
mod plan;
mod recipe;

pub use cache::{cmd_cache_clear, cmd_cache_info};
pub use install::cmd_install;
pub use plan::cmd_plan;
pub use recipe::{cmd_deps, cmd_validate};

use crate::cli::TargetArgs;
use anyhow::{Context, Result};
use std::path::Path;
use tsuku::{Recipe, Target, TsukuHome};

/// Host target with any command-line overrides applied
fn resolve_target(args: &TargetArgs) -> Target {
    let host = Target::host();
    let os = args.os.clone().unwrap_or_else(|| host.os.clone());
    let arch = args.arch.clone().unwrap_or_else(|| host.arch.clone());
    let family = match (&args.family, os == host.os) {
        (Some(family), _) => family.clone(),
        (None, true) => host.linux_family.clone(),
        (None, false) => String::new(),
    };
    Target::new(os, arch).with_family(family)
}

fn load_recipe(path: &str) -> Result<Recipe> {
    Recipe::load(Path::new(path)).with_context(|| format!("Failed to load recipe: {}", path))
}

fn home() -> Result<TsukuHome> {
    TsukuHome::from_env().context("Failed to locate tsuku home")
}
