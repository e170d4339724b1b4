// src/actions/mod.rs

//! Action framework
//!
//! An action is one kind of installation operation (download a file,
//! extract an archive, install an npm package). Actions are registered once
//! per process in a [`Registry`] and looked up by name when a recipe or plan
//! refers to them.
//!
//! # Architecture
//!
//! ```text
//!   Recipe step ──► preflight ──► decompose (composites only) ──► Plan
//!                  (no side       (may download to pin             │
//!                   effects)       checksums)                      ▼
//!                                                         execute (primitives)
//! ```
//!
//! Actions come in two shapes:
//!
//! - **Primitive**: executes directly. Plans contain only primitives.
//! - **Composite**: implements [`Decomposable`] and expands into further
//!   steps at plan time. Expansion repeats until only primitives remain.
//!
//! Optional capabilities are expressed as trait methods with defaults, so a
//! new action only overrides what it needs.

pub mod archive;
pub mod decompose;
pub mod download;
pub mod ecosystem;
pub mod fs_actions;
pub mod patch;
pub mod preflight;
pub mod registry;
pub mod resolver;
pub mod system;

pub use decompose::{MAX_DECOMPOSITION_DEPTH, decompose_to_primitives};
pub use preflight::{PreflightResult, validate_action, validate_recipe};
pub use registry::{Registry, default_registry};
pub use resolver::{
    DependencyMap, check_eval_deps, get_eval_deps, parse_dependency, resolve_dependencies,
};

use crate::cancel::CancelToken;
use crate::config::TsukuHome;
use crate::download::{DownloadCache, PreDownloader, SecureDownloader};
use crate::error::Result;
use crate::params::Params;
use crate::platform::{Constraint, Target};
use crate::signature::PgpKeyCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Dependencies an action needs, by the phase that needs them
///
/// `eval_time` tools must be present before decomposition runs.
/// `install_time` and `runtime` are satisfied by the surrounding installer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionDeps {
    pub install_time: Vec<String>,
    pub runtime: Vec<String>,
    pub eval_time: Vec<String>,
    /// Install-time deps only needed when targeting Linux
    pub linux_install_time: Vec<String>,
    /// Install-time deps only needed when targeting macOS
    pub darwin_install_time: Vec<String>,
}

impl ActionDeps {
    /// Same tool needed at install time and at run time
    pub fn install_and_runtime(dep: &str) -> Self {
        Self {
            install_time: vec![dep.to_string()],
            runtime: vec![dep.to_string()],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.install_time.is_empty()
            && self.runtime.is_empty()
            && self.eval_time.is_empty()
            && self.linux_install_time.is_empty()
            && self.darwin_install_time.is_empty()
    }

    pub fn with_eval_time(mut self, dep: &str) -> Self {
        self.eval_time.push(dep.to_string());
        self
    }

    /// Install-time deps including those specific to `os`
    pub fn install_time_for(&self, os: Option<&str>) -> Vec<String> {
        let mut deps = self.install_time.clone();
        match os {
            Some("linux") => deps.extend(self.linux_install_time.iter().cloned()),
            Some("darwin") => deps.extend(self.darwin_install_time.iter().cloned()),
            _ => {}
        }
        deps
    }
}

/// One action invocation inside a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub action: String,
    pub params: Params,
    /// Pinned checksum for download-bearing steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Expected size in bytes for download-bearing steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl Step {
    pub fn new(action: impl Into<String>, params: Params) -> Self {
        Self {
            action: action.into(),
            params,
            checksum: None,
            size: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>, size: Option<u64>) -> Self {
        self.checksum = Some(checksum.into());
        self.size = size;
        self
    }

    /// Params with the pinned checksum and size filled in where absent
    ///
    /// Only `download_file` reads them; other actions get their params as is.
    pub fn pinned_params(&self) -> Params {
        let mut params = self.params.clone();
        if self.action == download::DOWNLOAD_FILE {
            if let Some(checksum) = &self.checksum
                && !params.contains_key("checksum")
            {
                params.insert("checksum".to_string(), Value::from(checksum.clone()));
            }
            if let Some(size) = self.size
                && !params.contains_key("size")
            {
                params.insert("size".to_string(), Value::from(size));
            }
        }
        params
    }
}

/// Result of fetching an artifact at plan time to compute its checksum
pub struct DownloadResult {
    pub path: PathBuf,
    /// Lowercase hex sha256
    pub checksum: String,
    pub size: u64,
    _guard: Option<TempDir>,
}

impl DownloadResult {
    pub fn new(path: PathBuf, checksum: String, size: u64) -> Self {
        Self {
            path,
            checksum,
            size,
            _guard: None,
        }
    }

    /// Keep `dir` alive for as long as the result; it is removed on drop
    pub fn with_guard(mut self, dir: TempDir) -> Self {
        self._guard = Some(dir);
        self
    }
}

/// Fetches artifacts during decomposition so checksums can be pinned
pub trait Downloader: Send + Sync {
    fn download(&self, cancel: &CancelToken, url: &str) -> Result<DownloadResult>;
}

/// Inputs available to composite actions while decomposing
#[derive(Clone, Default)]
pub struct EvalContext {
    pub version: String,
    pub version_tag: String,
    pub os: String,
    pub arch: String,
    pub downloader: Option<Arc<dyn Downloader>>,
    pub download_cache: Option<Arc<DownloadCache>>,
    pub cancel: CancelToken,
}

impl EvalContext {
    pub fn new(version: &str, version_tag: &str, target: &Target) -> Self {
        Self {
            version: version.to_string(),
            version_tag: version_tag.to_string(),
            os: target.os.clone(),
            arch: target.arch.clone(),
            ..Default::default()
        }
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn with_download_cache(mut self, cache: Arc<DownloadCache>) -> Self {
        self.download_cache = Some(cache);
        self
    }

    /// Template variables for URL and path expansion
    pub fn vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("version".to_string(), self.version.clone());
        vars.insert("version_tag".to_string(), self.version_tag.clone());
        vars.insert("os".to_string(), self.os.clone());
        vars.insert("arch".to_string(), self.arch.clone());
        vars
    }
}

/// Live environment for executing primitive steps
pub struct ExecutionContext {
    pub home: TsukuHome,
    /// Scratch directory; downloads and extraction happen here
    pub work_dir: PathBuf,
    /// `tools/<name>-<version>`
    pub install_dir: PathBuf,
    pub tool_name: String,
    pub version: String,
    pub version_tag: String,
    pub target: Target,
    pub downloader: Arc<SecureDownloader>,
    pub key_cache: Arc<PgpKeyCache>,
    pub cancel: CancelToken,
}

impl ExecutionContext {
    pub fn vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("version".to_string(), self.version.clone());
        vars.insert("version_tag".to_string(), self.version_tag.clone());
        vars.insert("os".to_string(), self.target.os.clone());
        vars.insert("arch".to_string(), self.target.arch.clone());
        vars.insert("install_dir".to_string(), self.install_dir.display().to_string());
        vars.insert("work_dir".to_string(), self.work_dir.display().to_string());
        vars.insert("libs_dir".to_string(), self.home.libs_dir().display().to_string());
        vars
    }

    pub fn work_path(&self, relative: &str) -> Result<PathBuf> {
        crate::security::safe_join(&self.work_dir, relative)
    }

    pub fn install_path(&self, relative: &str) -> Result<PathBuf> {
        crate::security::safe_join(&self.install_dir, relative)
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.home.tools_dir()
    }

    pub fn libs_dir(&self) -> PathBuf {
        self.home.libs_dir()
    }

    /// Directories that should precede PATH when running ecosystem tools
    pub fn dependency_bin_dirs(&self, deps: &[String]) -> Vec<PathBuf> {
        let tools = self.tools_dir();
        deps.iter()
            .filter_map(|dep| self.home.find_installed(&tools, dep))
            .map(|dir| dir.join("bin"))
            .filter(|dir| dir.is_dir())
            .collect()
    }

    pub fn is_within_install_dir(&self, path: &Path) -> bool {
        crate::security::is_path_within(path, &self.install_dir)
    }

    /// Decomposition context for running a composite directly
    ///
    /// Plan-time fetches land in the work dir and share the download cache,
    /// so the primitives that follow restore from cache instead of refetching.
    pub fn eval_context(&self) -> EvalContext {
        let predownloader =
            PreDownloader::new(Arc::clone(&self.downloader)).with_temp_dir(self.work_dir.clone());
        let mut ctx = EvalContext::new(&self.version, &self.version_tag, &self.target)
            .with_downloader(Arc::new(predownloader));
        ctx.cancel = self.cancel.clone();
        if let Some(cache) = self.downloader.cache() {
            ctx = ctx.with_download_cache(Arc::clone(cache));
        }
        ctx
    }
}

/// An installation operation
pub trait Action: Send + Sync {
    /// Stable name, unique within a registry
    fn name(&self) -> &str;

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()>;

    /// Identical inputs always produce identical results
    fn is_deterministic(&self) -> bool {
        false
    }

    fn dependencies(&self) -> ActionDeps {
        ActionDeps::default()
    }

    fn requires_network(&self) -> bool {
        false
    }

    /// Fixed platform requirement; steps failing it are dropped from a plan
    fn implicit_constraint(&self) -> Option<Constraint> {
        None
    }

    /// Side-effect-free parameter validation; `None` means the action has none
    fn preflight(&self, _params: &Params) -> Option<PreflightResult> {
        None
    }

    fn as_decomposable(&self) -> Option<&dyn Decomposable> {
        None
    }
}

/// Composite actions expand into further steps at plan time
pub trait Decomposable {
    /// Expand into steps, which may themselves be composite
    ///
    /// Must be deterministic for identical `(ctx, params)`, and must not
    /// return a partial list on failure.
    fn decompose(&self, ctx: &EvalContext, params: &Params) -> Result<Vec<Step>>;
}

/// Execute a composite by decomposing it and running the resulting primitives
///
/// Plans never contain composites; this serves callers that execute a
/// recipe step directly.
pub(crate) fn execute_composite(name: &str, ctx: &ExecutionContext, params: &Params) -> Result<()> {
    let registry = default_registry();
    let steps = decompose_to_primitives(registry, &ctx.eval_context(), name, params)?;
    for step in steps {
        ctx.cancel.check()?;
        registry
            .require(&step.action)?
            .execute(ctx, &step.pinned_params())?;
    }
    Ok(())
}

/// Convert a typed parameter parse into a preflight result
pub(crate) fn preflight_from<T>(parsed: Result<T>) -> PreflightResult {
    let mut result = PreflightResult::default();
    if let Err(e) = parsed {
        result.add_error(e.to_string());
    }
    result
}
