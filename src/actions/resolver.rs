// src/actions/resolver.rs

//! Dependency resolution
//!
//! Folds a recipe's static step list into install-time and runtime
//! dependency sets. Precedence, lowest to highest:
//!
//! 1. Per step: the `dependencies` parameter replaces the action's implicit
//!    install-time deps; otherwise implicit deps plus `extra_dependencies`.
//!    Runtime works the same with `runtime_dependencies` and
//!    `extra_runtime_dependencies`.
//! 2. Recipe metadata `dependencies` / `runtime_dependencies` replace the
//!    aggregated sets.
//! 3. Recipe metadata `extra_*` entries extend them.
//!
//! Across steps, two different explicit versions of one dependency are a
//! conflict. `latest` yields to any explicit version. Recipe-level entries
//! are authoritative and never conflict.
//!
//! Nothing here touches the network; [`check_eval_deps`] only lists a
//! directory.

use super::Registry;
use crate::error::{Error, Result};
use crate::params::{self, Params};
use crate::platform::Target;
use crate::recipe::Recipe;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Version used when a dependency names none
pub const LATEST: &str = "latest";

/// Resolved dependency sets, name -> version
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DependencyMap {
    #[serde(default)]
    pub install_time: BTreeMap<String, String>,
    #[serde(default)]
    pub runtime: BTreeMap<String, String>,
}

impl DependencyMap {
    pub fn is_empty(&self) -> bool {
        self.install_time.is_empty() && self.runtime.is_empty()
    }

    /// Every dependency name in either set, sorted and deduplicated
    pub fn all_names(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self.install_time.keys().chain(self.runtime.keys()).collect();
        names.into_iter().cloned().collect()
    }
}

/// Split `name` or `name@version`; the version defaults to `latest`
pub fn parse_dependency(dep: &str) -> (String, String) {
    match dep.split_once('@') {
        Some((name, version)) => (name.to_string(), version.to_string()),
        None => (dep.to_string(), LATEST.to_string()),
    }
}

/// Merge one entry under the cross-step conflict policy
fn merge_entry(map: &mut BTreeMap<String, String>, name: String, version: String) -> Result<()> {
    match map.get(&name).cloned() {
        None => {
            map.insert(name, version);
        }
        Some(existing) if existing == version || version == LATEST => {}
        Some(existing) if existing == LATEST => {
            debug!("Dependency {} pinned to {}", name, version);
            map.insert(name, version);
        }
        Some(existing) => {
            return Err(Error::DependencyConflict {
                name,
                first: existing,
                second: version,
            });
        }
    }
    Ok(())
}

fn merge_specs(map: &mut BTreeMap<String, String>, specs: &[String]) -> Result<()> {
    for spec in specs {
        let (name, version) = parse_dependency(spec);
        merge_entry(map, name, version)?;
    }
    Ok(())
}

fn merge_implicit(map: &mut BTreeMap<String, String>, deps: &[String]) -> Result<()> {
    for dep in deps {
        merge_entry(map, dep.clone(), LATEST.to_string())?;
    }
    Ok(())
}

/// Apply one phase (install-time or runtime) of a single step
fn collect_step_phase(
    map: &mut BTreeMap<String, String>,
    step_params: &Params,
    implicit: &[String],
    replace_key: &str,
    extend_key: &str,
) -> Result<()> {
    if let Some(replacement) = params::get_string_slice(step_params, replace_key) {
        return merge_specs(map, &replacement);
    }
    merge_implicit(map, implicit)?;
    if let Some(extra) = params::get_string_slice(step_params, extend_key) {
        merge_specs(map, &extra)?;
    }
    Ok(())
}

/// Resolve a recipe's install-time and runtime dependencies
///
/// When `target` is given, platform-specific install-time deps for its OS
/// are included. Unknown actions contribute no implicit deps.
pub fn resolve_dependencies(
    registry: &Registry,
    recipe: &Recipe,
    target: Option<&Target>,
) -> Result<DependencyMap> {
    let mut result = DependencyMap::default();
    let os = target.map(Target::os);

    for step in &recipe.steps {
        let deps = registry
            .get(&step.action)
            .map(|action| action.dependencies())
            .unwrap_or_default();

        collect_step_phase(
            &mut result.install_time,
            &step.params,
            &deps.install_time_for(os),
            "dependencies",
            "extra_dependencies",
        )?;
        collect_step_phase(
            &mut result.runtime,
            &step.params,
            &deps.runtime,
            "runtime_dependencies",
            "extra_runtime_dependencies",
        )?;
    }

    let metadata = &recipe.metadata;
    if !metadata.dependencies.is_empty() {
        result.install_time = metadata.dependencies.iter().map(|d| parse_dependency(d)).collect();
    }
    if !metadata.runtime_dependencies.is_empty() {
        result.runtime = metadata
            .runtime_dependencies
            .iter()
            .map(|d| parse_dependency(d))
            .collect();
    }

    for spec in &metadata.extra_dependencies {
        let (name, version) = parse_dependency(spec);
        result.install_time.insert(name, version);
    }
    for spec in &metadata.extra_runtime_dependencies {
        let (name, version) = parse_dependency(spec);
        result.runtime.insert(name, version);
    }

    Ok(result)
}

/// Eval-time dependencies of one action; empty for unknown actions
pub fn get_eval_deps(registry: &Registry, action: &str) -> Vec<String> {
    registry
        .get(action)
        .map(|a| a.dependencies().eval_time)
        .unwrap_or_default()
}

/// Names from `deps` with no `<name>-*` directory under `tools_dir`
///
/// A missing or unreadable tools directory means everything is missing.
pub fn check_eval_deps(tools_dir: &Path, deps: &[String]) -> Vec<String> {
    let installed: Vec<String> = fs::read_dir(tools_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();

    deps.iter()
        .filter(|dep| {
            let prefix = format!("{}-", dep);
            !installed.iter().any(|dir| dir.starts_with(&prefix))
        })
        .cloned()
        .collect()
}

/// Expand `deps` with the dependencies of each dependency
///
/// `lookup` returns the resolved map for a dependency's own recipe, or
/// `None` when no recipe is known (a leaf). Direct entries keep their
/// versions; transitive ones merge under the same conflict policy as steps.
pub fn resolve_transitive<F>(deps: &DependencyMap, lookup: F) -> Result<DependencyMap>
where
    F: Fn(&str) -> Result<Option<DependencyMap>>,
{
    let mut result = deps.clone();
    let mut finished = BTreeSet::new();

    for name in deps.all_names() {
        let mut chain = Vec::new();
        visit(&name, &lookup, &mut chain, &mut finished, &mut result)?;
    }

    Ok(result)
}

fn visit<F>(
    name: &str,
    lookup: &F,
    chain: &mut Vec<String>,
    finished: &mut BTreeSet<String>,
    result: &mut DependencyMap,
) -> Result<()>
where
    F: Fn(&str) -> Result<Option<DependencyMap>>,
{
    if chain.iter().any(|n| n == name) {
        chain.push(name.to_string());
        return Err(Error::DependencyCycle(chain.join(" -> ")));
    }
    if finished.contains(name) {
        return Ok(());
    }

    let Some(own) = lookup(name)? else {
        finished.insert(name.to_string());
        return Ok(());
    };

    chain.push(name.to_string());
    for (dep, version) in &own.install_time {
        merge_entry(&mut result.install_time, dep.clone(), version.clone())?;
        visit(dep, lookup, chain, finished, result)?;
    }
    for (dep, version) in &own.runtime {
        merge_entry(&mut result.runtime, dep.clone(), version.clone())?;
        visit(dep, lookup, chain, finished, result)?;
    }
    chain.pop();

    finished.insert(name.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionDeps;
    use crate::recipe::Step;
    use serde_json::json;
    use tempfile::TempDir;

    fn recipe(steps: Vec<Step>) -> Recipe {
        let mut recipe = Recipe::default();
        recipe.metadata.name = "demo".to_string();
        recipe.steps = steps;
        recipe
    }

    fn step(action: &str, value: serde_json::Value) -> Step {
        Step::new(action, value.as_object().cloned().unwrap())
    }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_dependency() {
        assert_eq!(parse_dependency("curl"), ("curl".into(), "latest".into()));
        assert_eq!(parse_dependency("curl@7.0"), ("curl".into(), "7.0".into()));
        assert_eq!(parse_dependency("a@b@c"), ("a".into(), "b@c".into()));
    }

    #[test]
    fn test_npm_install_implicit() {
        let registry = Registry::with_builtins();
        let r = recipe(vec![step("npm_install", json!({"package": "prettier"}))]);
        let deps = resolve_dependencies(&registry, &r, None).unwrap();
        assert_eq!(deps.install_time, map(&[("nodejs", "latest")]));
        assert_eq!(deps.runtime, map(&[("nodejs", "latest")]));
    }

    #[test]
    fn test_step_extra_dependencies() {
        let registry = Registry::with_builtins();
        let r = recipe(vec![step(
            "download",
            json!({"url": "https://x/y", "extra_dependencies": ["wget", "curl@7.0"]}),
        )]);
        let deps = resolve_dependencies(&registry, &r, None).unwrap();
        assert_eq!(deps.install_time, map(&[("wget", "latest"), ("curl", "7.0")]));
        assert!(deps.runtime.is_empty());
    }

    #[test]
    fn test_step_replace_drops_implicit() {
        let registry = Registry::with_builtins();
        let r = recipe(vec![step(
            "npm_install",
            json!({"package": "x", "dependencies": ["nodejs@20"], "runtime_dependencies": []}),
        )]);
        let deps = resolve_dependencies(&registry, &r, None).unwrap();
        assert_eq!(deps.install_time, map(&[("nodejs", "20")]));
        assert!(deps.runtime.is_empty());
    }

    #[test]
    fn test_recipe_level_replace_and_extend() {
        let registry = Registry::with_builtins();
        let mut r = recipe(vec![step("npm_install", json!({"package": "x"}))]);
        r.metadata.dependencies = vec!["make".to_string()];
        r.metadata.extra_dependencies = vec!["nodejs@18".to_string()];
        r.metadata.extra_runtime_dependencies = vec!["openssl@3".to_string()];

        let deps = resolve_dependencies(&registry, &r, None).unwrap();
        assert_eq!(deps.install_time, map(&[("make", "latest"), ("nodejs", "18")]));
        assert_eq!(deps.runtime, map(&[("nodejs", "latest"), ("openssl", "3")]));
    }

    #[test]
    fn test_latest_yields_to_explicit() {
        let registry = Registry::with_builtins();
        let r = recipe(vec![
            step("npm_install", json!({"package": "x"})),
            step("download", json!({"url": "https://x", "extra_dependencies": ["nodejs@20"]})),
            step("npm_install", json!({"package": "y"})),
        ]);
        let deps = resolve_dependencies(&registry, &r, None).unwrap();
        assert_eq!(deps.install_time["nodejs"], "20");
    }

    #[test]
    fn test_conflicting_explicit_versions() {
        let registry = Registry::with_builtins();
        let r = recipe(vec![
            step("download", json!({"url": "https://a", "extra_dependencies": ["curl@7"]})),
            step("download", json!({"url": "https://b", "extra_dependencies": ["curl@8"]})),
        ]);
        let err = resolve_dependencies(&registry, &r, None).unwrap_err();
        assert!(matches!(err, Error::DependencyConflict { ref name, .. } if name == "curl"));
    }

    struct RelocateAction;

    impl crate::actions::Action for RelocateAction {
        fn name(&self) -> &str {
            "relocate"
        }

        fn execute(&self, _ctx: &crate::actions::ExecutionContext, _params: &Params) -> Result<()> {
            Ok(())
        }

        fn dependencies(&self) -> ActionDeps {
            ActionDeps {
                linux_install_time: vec!["patchelf".to_string()],
                ..Default::default()
            }
        }
    }

    #[test]
    fn test_platform_specific_install_deps() {
        let registry = Registry::new();
        registry.register(std::sync::Arc::new(RelocateAction));
        let r = recipe(vec![step("relocate", json!({}))]);

        let linux = Target::new("linux", "amd64");
        let deps = resolve_dependencies(&registry, &r, Some(&linux)).unwrap();
        assert_eq!(deps.install_time, map(&[("patchelf", "latest")]));

        let darwin = Target::new("darwin", "arm64");
        let deps = resolve_dependencies(&registry, &r, Some(&darwin)).unwrap();
        assert!(deps.install_time.is_empty());

        let deps = resolve_dependencies(&registry, &r, None).unwrap();
        assert!(deps.install_time.is_empty());
    }

    #[test]
    fn test_eval_deps() {
        let registry = Registry::with_builtins();
        assert_eq!(get_eval_deps(&registry, "npm_install"), vec!["nodejs"]);
        assert!(get_eval_deps(&registry, "download_file").is_empty());
        assert!(get_eval_deps(&registry, "nope").is_empty());
    }

    #[test]
    fn test_check_eval_deps() {
        let tools = TempDir::new().unwrap();
        fs::create_dir(tools.path().join("nodejs-20.1.0")).unwrap();
        fs::write(tools.path().join("go-1.22"), b"not a dir").unwrap();

        let missing = check_eval_deps(
            tools.path(),
            &["nodejs".to_string(), "go".to_string(), "ruby".to_string()],
        );
        assert_eq!(missing, vec!["go", "ruby"]);

        let missing = check_eval_deps(&tools.path().join("absent"), &["nodejs".to_string()]);
        assert_eq!(missing, vec!["nodejs"]);
    }

    #[test]
    fn test_resolve_transitive() {
        let mut direct = DependencyMap::default();
        direct.install_time.insert("a".into(), "latest".into());

        let resolved = resolve_transitive(&direct, |name| {
            Ok(match name {
                "a" => Some(DependencyMap {
                    install_time: map(&[("b", "2")]),
                    runtime: BTreeMap::new(),
                }),
                "b" => Some(DependencyMap {
                    install_time: BTreeMap::new(),
                    runtime: map(&[("c", "latest")]),
                }),
                _ => None,
            })
        })
        .unwrap();

        assert_eq!(resolved.install_time, map(&[("a", "latest"), ("b", "2")]));
        assert_eq!(resolved.runtime, map(&[("c", "latest")]));
    }

    #[test]
    fn test_resolve_transitive_cycle() {
        let mut direct = DependencyMap::default();
        direct.install_time.insert("a".into(), "latest".into());

        let err = resolve_transitive(&direct, |name| {
            let next = if name == "a" { "b" } else { "a" };
            Ok(Some(DependencyMap {
                install_time: map(&[(next, "latest")]),
                runtime: BTreeMap::new(),
            }))
        })
        .unwrap_err();
        assert!(matches!(err, Error::DependencyCycle(ref chain) if chain == "a -> b -> a"));
    }
}
