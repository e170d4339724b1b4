// src/executor.rs

//! Plan execution
//!
//! Runs a plan's primitive steps in order against a scratch work directory
//! and the tool's install directory, runs the recipe's verify command, then
//! exposes the installed executables in `$TSUKU_HOME/bin`.
//!
//! Execution is strictly sequential. Cancellation is checked before every
//! step and propagates into running child processes. The first failure
//! aborts the install and removes the partially populated install
//! directory; checksum and signature failures are never retried.

use crate::actions::{ExecutionContext, Registry};
use crate::cancel::CancelToken;
use crate::config::TsukuHome;
use crate::download::{DownloadCache, ReqwestTransport, SecureDownloader};
use crate::error::{Error, Result};
use crate::params;
use crate::planner::InstallationPlan;
use crate::process;
use crate::recipe::Verify;
use crate::security;
use crate::signature::PgpKeyCache;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What an execution produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub install_dir: PathBuf,
    /// Symlinks created in `$TSUKU_HOME/bin`
    pub linked: Vec<PathBuf>,
}

pub struct Executor<'a> {
    registry: &'a Registry,
    home: TsukuHome,
    downloader: Arc<SecureDownloader>,
    key_cache: Arc<PgpKeyCache>,
}

impl<'a> Executor<'a> {
    /// Executor using the network and the home's download and key caches
    pub fn new(registry: &'a Registry, home: TsukuHome) -> Result<Self> {
        let cache = Arc::new(DownloadCache::new(home.download_cache_dir()));
        let transport = Arc::new(ReqwestTransport::new()?);
        let downloader = Arc::new(SecureDownloader::new(transport).with_cache(cache));
        Ok(Self::with_downloader(registry, home, downloader))
    }

    pub fn with_downloader(registry: &'a Registry, home: TsukuHome, downloader: Arc<SecureDownloader>) -> Self {
        let key_cache = Arc::new(PgpKeyCache::new(home.key_cache_dir(), Arc::clone(&downloader)));
        Self {
            registry,
            home,
            downloader,
            key_cache,
        }
    }

    pub fn home(&self) -> &TsukuHome {
        &self.home
    }

    pub fn execute(&self, plan: &InstallationPlan, cancel: &CancelToken) -> Result<InstallOutcome> {
        cancel.check()?;
        self.home.ensure_layout()?;

        let install_dir = self.home.tool_dir(&plan.tool, &plan.version)?;
        if install_dir.exists() {
            info!("Replacing existing installation at {}", install_dir.display());
            fs::remove_dir_all(&install_dir).map_err(|e| {
                Error::IoError(format!("Failed to remove {}: {}", install_dir.display(), e))
            })?;
        }
        fs::create_dir_all(&install_dir).map_err(|e| {
            Error::IoError(format!("Failed to create {}: {}", install_dir.display(), e))
        })?;

        let work = tempfile::Builder::new()
            .prefix("tsuku-work-")
            .tempdir()
            .map_err(|e| Error::IoError(format!("Failed to create work directory: {}", e)))?;

        let ctx = ExecutionContext {
            home: self.home.clone(),
            work_dir: work.path().to_path_buf(),
            install_dir: install_dir.clone(),
            tool_name: plan.tool.clone(),
            version: plan.version.clone(),
            version_tag: plan.version_tag.clone(),
            target: plan.platform.clone(),
            downloader: Arc::clone(&self.downloader),
            key_cache: Arc::clone(&self.key_cache),
            cancel: cancel.clone(),
        };

        match self.install(plan, &ctx) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if e.is_trust_failure() {
                    warn!("Aborting {} {}: {}", plan.tool, plan.version, e);
                }
                if let Err(cleanup) = fs::remove_dir_all(&install_dir) {
                    debug!("Failed to clean up {}: {}", install_dir.display(), cleanup);
                }
                Err(e)
            }
        }
    }

    fn install(&self, plan: &InstallationPlan, ctx: &ExecutionContext) -> Result<InstallOutcome> {
        let total = plan.steps.len();
        for (i, resolved) in plan.steps.iter().enumerate() {
            ctx.cancel.check()?;
            let step = resolved.to_step();
            info!("[{}/{}] {}", i + 1, total, step.action);

            let wrap = |source: Error| Error::StepFailed {
                step: i + 1,
                action: step.action.clone(),
                source: Box::new(source),
            };
            let action = self.registry.require(&step.action).map_err(wrap)?;
            action.execute(ctx, &step.pinned_params()).map_err(wrap)?;
        }

        if let Some(verify) = &plan.verify {
            ctx.cancel.check()?;
            run_verify(verify, ctx)?;
        }

        // Only a verified install is exposed on PATH
        let linked = link_executables(&ctx.install_dir, &self.home.bin_dir())?;

        info!(
            "Installed {} {} to {}",
            plan.tool,
            plan.version,
            ctx.install_dir.display()
        );
        Ok(InstallOutcome {
            install_dir: ctx.install_dir.clone(),
            linked,
        })
    }
}

/// Symlink every entry of `<install_dir>/bin` into `bin_dir`
///
/// Existing symlinks are replaced; any other file in the way is an error.
fn link_executables(install_dir: &Path, bin_dir: &Path) -> Result<Vec<PathBuf>> {
    let source_bin = install_dir.join("bin");
    if !source_bin.is_dir() {
        debug!("No bin/ in {}, nothing to link", install_dir.display());
        return Ok(Vec::new());
    }
    fs::create_dir_all(bin_dir)
        .map_err(|e| Error::IoError(format!("Failed to create {}: {}", bin_dir.display(), e)))?;

    let mut entries: Vec<_> = fs::read_dir(&source_bin)
        .map_err(|e| Error::IoError(format!("Failed to read {}: {}", source_bin.display(), e)))?
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut linked = Vec::with_capacity(entries.len());
    for entry in entries {
        let link = bin_dir.join(entry.file_name());
        let target = security::relative_path(bin_dir, &entry.path());

        if let Ok(metadata) = link.symlink_metadata() {
            if !metadata.file_type().is_symlink() {
                return Err(Error::IoError(format!(
                    "collision: {} exists and is not a symlink",
                    link.display()
                )));
            }
            fs::remove_file(&link)
                .map_err(|e| Error::IoError(format!("Failed to replace {}: {}", link.display(), e)))?;
        }
        symlink(&target, &link)
            .map_err(|e| Error::IoError(format!("Failed to link {}: {}", link.display(), e)))?;
        debug!("Linked {} -> {}", link.display(), target.display());
        linked.push(link);
    }
    Ok(linked)
}

/// Run the verify command with the install's bin directory first on PATH
fn run_verify(verify: &Verify, ctx: &ExecutionContext) -> Result<()> {
    let mut vars = BTreeMap::new();
    vars.insert("version".to_string(), ctx.version.clone());
    vars.insert("install_dir".to_string(), ctx.install_dir.display().to_string());
    let command = params::expand_vars(&verify.command, &vars);

    let mut dirs = vec![ctx.install_dir.join("bin")];
    if let Some(existing) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&existing));
    }
    let path = std::env::join_paths(dirs)
        .map_err(|e| Error::InitError(format!("invalid PATH entry: {}", e)))?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&command).env("PATH", path).current_dir(&ctx.install_dir);
    let output = process::run_command(cmd, &ctx.cancel).map_err(|e| match e {
        Error::CommandFailed { output, .. } => {
            Error::VerificationFailed(format!("'{}' failed: {}", command, output.trim()))
        }
        other => other,
    })?;

    if !verify.pattern.is_empty() {
        let pattern = params::expand_vars(&verify.pattern, &vars);
        if !output.output.contains(&pattern) {
            return Err(Error::VerificationFailed(format!(
                "output of '{}' does not contain '{}'",
                command, pattern
            )));
        }
    }
    info!("Verified with '{}'", command);
    Ok(())
}
