// src/commands/recipe.rs
//! Recipe inspection commands

use super::{load_recipe, resolve_target};
use crate::cli::TargetArgs;
use anyhow::{Context, Result, bail};
use tsuku::actions::{resolve_dependencies, validate_recipe};
use tsuku::default_registry;

/// Preflight every step of a recipe
pub fn cmd_validate(recipe_path: &str) -> Result<()> {
    let recipe = load_recipe(recipe_path)?;
    println!("Validating recipe: {}", recipe.name());

    let result = validate_recipe(default_registry(), &recipe);
    for warning in &result.warnings {
        println!("Warning: {}", warning);
    }
    for error in &result.errors {
        println!("Error: {}", error);
    }

    if result.has_errors() {
        bail!("{} error(s) in {}", result.errors.len(), recipe_path);
    }
    if result.warnings.is_empty() {
        println!("[OK] No issues found");
    } else {
        println!("[OK] {} warning(s)", result.warnings.len());
    }
    Ok(())
}

/// Print install-time and runtime dependencies
pub fn cmd_deps(recipe_path: &str, target: &TargetArgs) -> Result<()> {
    let recipe = load_recipe(recipe_path)?;
    let target = resolve_target(target);
    let deps = resolve_dependencies(default_registry(), &recipe, Some(&target))
        .with_context(|| format!("Failed to resolve dependencies of {}", recipe.name()))?;

    println!("{} ({})", recipe.name(), target);
    if deps.is_empty() {
        println!("  no dependencies");
        return Ok(());
    }
    println!("  install-time:");
    for (name, version) in &deps.install_time {
        println!("    {}@{}", name, version);
    }
    println!("  runtime:");
    for (name, version) in &deps.runtime {
        println!("    {}@{}", name, version);
    }
    Ok(())
}
