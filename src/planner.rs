// src/planner.rs

//! Installation plan generation
//!
//! A plan is a recipe evaluated for one target and one version: steps that
//! do not apply to the target are dropped, composites are expanded into
//! primitives, and every download carries a pinned checksum. The result is
//! a self-contained JSON document the executor can run without consulting
//! the recipe again.
//!
//! Planning happens in this order:
//!
//! 1. Preflight every step; any error aborts with all messages collected
//! 2. Resolve install-time and runtime dependencies for the target
//! 3. Filter steps by implicit action constraint, then by `when`
//! 4. Check eval-time tools for the remaining steps
//! 5. Decompose composites, pinning checksums as they are discovered

use crate::actions::{
    DependencyMap, download, Downloader, EvalContext, Registry, Step, check_eval_deps,
    decompose_to_primitives, get_eval_deps, resolve_dependencies, validate_recipe,
};
use crate::cancel::CancelToken;
use crate::config::TsukuHome;
use crate::download::DownloadCache;
use crate::error::{Error, Result};
use crate::params::{self, Params};
use crate::platform::Target;
use crate::recipe::{Recipe, Verify};
use crate::security;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Plan document layout version
pub const PLAN_FORMAT_VERSION: u32 = 2;

/// A primitive step in a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedStep {
    pub action: String,
    pub params: Params,
    /// Deterministic action: replaying the plan gives identical results
    pub evaluable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl ResolvedStep {
    fn from_step(registry: &Registry, step: Step) -> Self {
        let evaluable = registry.is_deterministic(&step.action);
        let url = if step.action == download::DOWNLOAD_FILE {
            params::get_string(&step.params, "url").map(str::to_string)
        } else {
            None
        };
        let checksum = step
            .checksum
            .clone()
            .or_else(|| params::get_string(&step.params, "checksum").map(str::to_string));
        let size = step.size.or_else(|| {
            params::get_int(&step.params, "size").and_then(|s| u64::try_from(s).ok())
        });
        Self {
            action: step.action,
            params: step.params,
            evaluable,
            url,
            checksum,
            size,
        }
    }

    /// The step as the executor runs it
    pub fn to_step(&self) -> Step {
        Step {
            action: self.action.clone(),
            params: self.params.clone(),
            checksum: self.checksum.clone(),
            size: self.size,
        }
    }
}

/// A fully evaluated installation for one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationPlan {
    pub format_version: u32,
    pub tool: String,
    pub version: String,
    pub version_tag: String,
    pub platform: Target,
    pub generated_at: DateTime<Utc>,
    /// Where the recipe came from (path or registry name)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recipe_source: String,
    /// sha256 of the canonical recipe JSON
    pub recipe_hash: String,
    /// True when every step is evaluable
    pub deterministic: bool,
    #[serde(default)]
    pub dependencies: DependencyMap,
    pub steps: Vec<ResolvedStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<Verify>,
}

impl InstallationPlan {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let plan: Self = serde_json::from_str(content)
            .map_err(|e| Error::ParseError(format!("Invalid plan: {}", e)))?;
        if plan.format_version != PLAN_FORMAT_VERSION {
            return Err(Error::ParseError(format!(
                "unsupported plan format version {} (expected {})",
                plan.format_version, PLAN_FORMAT_VERSION
            )));
        }
        security::validate_install_id(&plan.tool, &plan.version)?;
        Ok(plan)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)
            .map_err(|e| Error::IoError(format!("Failed to write plan {}: {}", path.display(), e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::IoError(format!("Failed to read plan {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    /// Steps that download something
    pub fn download_steps(&self) -> impl Iterator<Item = &ResolvedStep> {
        self.steps.iter().filter(|s| s.url.is_some())
    }
}

/// What to plan for
#[derive(Debug, Clone)]
pub struct PlanConfig {
    pub target: Target,
    pub version: String,
    /// Upstream tag; defaults to `v<version>`
    pub version_tag: String,
    pub recipe_source: String,
}

impl PlanConfig {
    pub fn new(target: Target, version: impl Into<String>) -> Self {
        let version = version.into();
        let version_tag = if version.starts_with('v') {
            version.clone()
        } else {
            format!("v{}", version)
        };
        Self {
            target,
            version,
            version_tag,
            recipe_source: String::new(),
        }
    }

    pub fn with_version_tag(mut self, tag: impl Into<String>) -> Self {
        self.version_tag = tag.into();
        self
    }

    pub fn with_recipe_source(mut self, source: impl Into<String>) -> Self {
        self.recipe_source = source.into();
        self
    }
}

/// Turns recipes into installation plans
pub struct Planner<'a> {
    registry: &'a Registry,
    home: TsukuHome,
    downloader: Option<Arc<dyn Downloader>>,
    download_cache: Option<Arc<DownloadCache>>,
    cancel: CancelToken,
}

impl<'a> Planner<'a> {
    pub fn new(registry: &'a Registry, home: TsukuHome) -> Self {
        Self {
            registry,
            home,
            downloader: None,
            download_cache: None,
            cancel: CancelToken::new(),
        }
    }

    /// Fetch artifacts without a static checksum to pin one
    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn with_download_cache(mut self, cache: Arc<DownloadCache>) -> Self {
        self.download_cache = Some(cache);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn eval_context(&self, config: &PlanConfig) -> EvalContext {
        let mut ctx = EvalContext::new(&config.version, &config.version_tag, &config.target);
        ctx.cancel = self.cancel.clone();
        if let Some(downloader) = &self.downloader {
            ctx = ctx.with_downloader(Arc::clone(downloader));
        }
        if let Some(cache) = &self.download_cache {
            ctx = ctx.with_download_cache(Arc::clone(cache));
        }
        ctx
    }

    /// Recipe steps that apply to the target, in order
    fn applicable_steps<'r>(&self, recipe: &'r Recipe, target: &Target) -> Result<Vec<&'r crate::recipe::Step>> {
        let mut kept = Vec::with_capacity(recipe.steps.len());
        for (i, step) in recipe.steps.iter().enumerate() {
            let action = self.registry.require(&step.action)?;
            if let Some(constraint) = action.implicit_constraint()
                && !constraint.matches_target(target)
            {
                debug!("Step {} ({}) requires {}, skipping for {}", i + 1, step.action, constraint, target);
                continue;
            }
            if let Some(when) = &step.when
                && !when.matches(target)
            {
                debug!("Step {} ({}) does not apply to {}", i + 1, step.action, target);
                continue;
            }
            kept.push(step);
        }
        Ok(kept)
    }

    pub fn generate(&self, recipe: &Recipe, config: &PlanConfig) -> Result<InstallationPlan> {
        security::validate_install_id(recipe.name(), &config.version)?;
        let preflight = validate_recipe(self.registry, recipe);
        for warning in &preflight.warnings {
            warn!("{}", warning);
        }
        if let Some(err) = preflight.to_error(recipe.name()) {
            return Err(err);
        }

        let dependencies = resolve_dependencies(self.registry, recipe, Some(&config.target))?;
        let steps = self.applicable_steps(recipe, &config.target)?;

        let mut eval_deps: Vec<String> = Vec::new();
        for step in &steps {
            for dep in get_eval_deps(self.registry, &step.action) {
                if !eval_deps.contains(&dep) {
                    eval_deps.push(dep);
                }
            }
        }
        let missing = check_eval_deps(&self.home.tools_dir(), &eval_deps);
        if !missing.is_empty() {
            return Err(Error::MissingEvalDependencies(missing));
        }

        let ctx = self.eval_context(config);
        let mut resolved = Vec::new();
        for step in steps {
            self.cancel.check()?;
            let primitives = decompose_to_primitives(self.registry, &ctx, &step.action, &step.params)?;
            resolved.extend(
                primitives
                    .into_iter()
                    .map(|p| ResolvedStep::from_step(self.registry, p)),
            );
        }

        let deterministic = resolved.iter().all(|s| s.evaluable);
        info!(
            "Planned {} {} for {}: {} step(s), {}",
            recipe.name(),
            config.version,
            config.target,
            resolved.len(),
            if deterministic { "deterministic" } else { "non-deterministic" }
        );

        Ok(InstallationPlan {
            format_version: PLAN_FORMAT_VERSION,
            tool: recipe.name().to_string(),
            version: config.version.clone(),
            version_tag: config.version_tag.clone(),
            platform: config.target.clone(),
            generated_at: Utc::now(),
            recipe_source: config.recipe_source.clone(),
            recipe_hash: recipe.content_hash()?,
            deterministic,
            dependencies,
            steps: resolved,
            verify: recipe.verify.clone(),
        })
    }
}
