// src/commands/install.rs
//! Plan execution command

use super::home;
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tsuku::{CancelToken, Executor, InstallationPlan, default_registry};

/// Execute a saved plan
pub fn cmd_install(plan_path: &str, timeout: Option<u64>) -> Result<()> {
    let plan = InstallationPlan::load(Path::new(plan_path))
        .with_context(|| format!("Failed to load plan: {}", plan_path))?;
    let cancel = match timeout {
        Some(secs) => CancelToken::with_timeout(Duration::from_secs(secs)),
        None => CancelToken::new(),
    };

    println!("Installing {} {} ({})", plan.tool, plan.version, plan.platform);
    if !plan.deterministic {
        println!("Note: plan contains non-deterministic steps");
    }

    let executor = Executor::new(default_registry(), home()?)?;
    let outcome = executor
        .execute(&plan, &cancel)
        .with_context(|| format!("Failed to install {} {}", plan.tool, plan.version))?;

    println!("[OK] Installed to {}", outcome.install_dir.display());
    for link in &outcome.linked {
        println!("  {}", link.display());
    }
    Ok(())
}
