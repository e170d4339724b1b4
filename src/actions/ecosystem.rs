// src/actions/ecosystem.rs

//! Language ecosystem installers
//!
//! Each installer drives the ecosystem's own tool (npm, gem, cargo, pipx,
//! go) to build a package into the install directory. Names and versions
//! pass through the matching allow-list validator both in preflight and
//! again right before the command line is built; nothing reaches the
//! command without that check.
//!
//! The tool binary is looked up in the tsuku-managed dependency first
//! (`tools/<dep>-*/bin`) and only then on `PATH`. Those directories are
//! also prepended to the child's `PATH` so helper binaries (node for npm,
//! rustc for cargo) resolve the same way.

use super::{Action, ActionDeps, ExecutionContext, PreflightResult, preflight_from};
use crate::error::{Error, Result};
use crate::params::{self, Params};
use crate::process;
use crate::security;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info};

/// An ecosystem package manager wrapped as an action
trait Installer: Send + Sync + 'static {
    /// Action name
    const NAME: &'static str;
    /// Parameter holding the package identifier
    const PACKAGE_PARAM: &'static str;
    /// Executable that performs the install
    const TOOL: &'static str;
    /// tsuku-managed tool providing [`Self::TOOL`]
    const PROVIDER: &'static str;

    fn is_valid_package(name: &str) -> bool;
    fn is_valid_version(version: &str) -> bool;
    fn dependencies() -> ActionDeps;

    /// Version as the tool expects it
    fn format_version(version: &str) -> String {
        version.to_string()
    }

    /// Extra parameters beyond package, version and executables
    fn check_extra(_params: &Params) -> Result<()> {
        Ok(())
    }

    /// Build the install command for a validated request
    fn command(tool: &Path, request: &InstallRequest<'_>, ctx: &ExecutionContext) -> Result<Command>;
}

/// A validated ecosystem install
struct InstallRequest<'a> {
    package: &'a str,
    version: String,
    executables: Vec<String>,
    params: &'a Params,
}

impl<'a> InstallRequest<'a> {
    fn parse<I: Installer>(params: &'a Params, default_version: Option<&str>) -> Result<Self> {
        let package = params::require_string(params, I::NAME, I::PACKAGE_PARAM)?;
        if !I::is_valid_package(package) {
            return Err(Error::invalid_param(
                I::NAME,
                I::PACKAGE_PARAM,
                format!("'{}' is not a valid name", package),
            ));
        }

        let version = params::get_non_empty(params, "version")
            .or(default_version)
            .map(I::format_version);
        if let Some(version) = &version
            && !I::is_valid_version(version)
        {
            return Err(Error::invalid_param(
                I::NAME,
                "version",
                format!("'{}' is not a valid version", version),
            ));
        }

        let executables = params::get_string_slice(params, "executables")
            .ok_or_else(|| Error::missing_param(I::NAME, "executables"))?;
        if executables.is_empty() {
            return Err(Error::invalid_param(I::NAME, "executables", "must not be empty"));
        }
        if let Some(bad) = executables.iter().find(|e| !security::is_valid_command_name(e)) {
            return Err(Error::invalid_param(
                I::NAME,
                "executables",
                format!("'{}' is not a valid executable name", bad),
            ));
        }

        I::check_extra(params)?;

        Ok(Self {
            package,
            // Preflight has no context version; execution always supplies one
            version: version.unwrap_or_default(),
            executables,
            params,
        })
    }
}

/// Find `tool` in the provider's managed bin directories, then on PATH
fn resolve_tool(bin_dirs: &[PathBuf], tool: &str) -> Result<PathBuf> {
    if let Some(path) = bin_dirs.iter().map(|dir| dir.join(tool)).find(|p| p.is_file()) {
        return Ok(path);
    }
    which::which(tool).map_err(|_| Error::ToolNotFound(tool.to_string()))
}

/// PATH with the managed bin directories in front
fn search_path(bin_dirs: &[PathBuf]) -> Result<OsString> {
    let mut dirs = bin_dirs.to_vec();
    if let Some(existing) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(dirs).map_err(|e| Error::InitError(format!("invalid PATH entry: {}", e)))
}

struct Ecosystem<I>(std::marker::PhantomData<I>);

impl<I: Installer> Ecosystem<I> {
    fn new() -> Self {
        Self(std::marker::PhantomData)
    }
}

impl<I: Installer> Action for Ecosystem<I> {
    fn name(&self) -> &str {
        I::NAME
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let request = InstallRequest::parse::<I>(params, Some(&ctx.version))?;

        let bin_dirs = ctx.dependency_bin_dirs(&[I::PROVIDER.to_string()]);
        let tool = resolve_tool(&bin_dirs, I::TOOL)?;
        debug!("Using {} at {}", I::TOOL, tool.display());

        let mut cmd = I::command(&tool, &request, ctx)?;
        cmd.current_dir(&ctx.work_dir).env("PATH", search_path(&bin_dirs)?);

        info!("Installing {} {} with {}", request.package, request.version, I::TOOL);
        process::run_command(cmd, &ctx.cancel)?;

        let bin = ctx.install_dir.join("bin");
        for exe in &request.executables {
            if !bin.join(exe).exists() {
                return Err(Error::NotFoundError(format!(
                    "{}: expected executable bin/{} was not installed",
                    I::NAME,
                    exe
                )));
            }
        }
        Ok(())
    }

    fn dependencies(&self) -> ActionDeps {
        I::dependencies()
    }

    fn requires_network(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        Some(preflight_from(InstallRequest::parse::<I>(params, None)))
    }
}

// =============================================================================
// Installers
// =============================================================================

struct Npm;

impl Installer for Npm {
    const NAME: &'static str = "npm_install";
    const PACKAGE_PARAM: &'static str = "package";
    const TOOL: &'static str = "npm";
    const PROVIDER: &'static str = "nodejs";

    fn is_valid_package(name: &str) -> bool {
        security::is_valid_npm_package(name)
    }

    fn is_valid_version(version: &str) -> bool {
        security::is_valid_npm_version(version)
    }

    fn dependencies() -> ActionDeps {
        ActionDeps::install_and_runtime("nodejs").with_eval_time("nodejs")
    }

    fn command(tool: &Path, request: &InstallRequest<'_>, ctx: &ExecutionContext) -> Result<Command> {
        let mut cmd = Command::new(tool);
        cmd.arg("install")
            .arg("--global")
            .arg("--no-fund")
            .arg("--no-audit")
            .arg("--prefix")
            .arg(&ctx.install_dir)
            .arg(format!("{}@{}", request.package, request.version));
        Ok(cmd)
    }
}

struct Gem;

impl Installer for Gem {
    const NAME: &'static str = "gem_install";
    const PACKAGE_PARAM: &'static str = "gem";
    const TOOL: &'static str = "gem";
    const PROVIDER: &'static str = "ruby";

    fn is_valid_package(name: &str) -> bool {
        security::is_valid_gem_name(name)
    }

    fn is_valid_version(version: &str) -> bool {
        security::is_valid_gem_version(version)
    }

    fn dependencies() -> ActionDeps {
        ActionDeps::install_and_runtime("ruby")
    }

    fn command(tool: &Path, request: &InstallRequest<'_>, ctx: &ExecutionContext) -> Result<Command> {
        let mut cmd = Command::new(tool);
        cmd.arg("install")
            .arg(request.package)
            .arg("--version")
            .arg(&request.version)
            .arg("--install-dir")
            .arg(&ctx.install_dir)
            .arg("--bindir")
            .arg(ctx.install_dir.join("bin"))
            .arg("--no-document")
            .env("GEM_HOME", &ctx.install_dir);
        Ok(cmd)
    }
}

struct Cargo;

impl Installer for Cargo {
    const NAME: &'static str = "cargo_install";
    const PACKAGE_PARAM: &'static str = "crate";
    const TOOL: &'static str = "cargo";
    const PROVIDER: &'static str = "rust";

    fn is_valid_package(name: &str) -> bool {
        security::is_valid_crate_name(name)
    }

    fn is_valid_version(version: &str) -> bool {
        security::is_valid_cargo_version(version)
    }

    fn dependencies() -> ActionDeps {
        ActionDeps {
            install_time: vec!["rust".to_string()],
            ..Default::default()
        }
        .with_eval_time("rust")
    }

    fn command(tool: &Path, request: &InstallRequest<'_>, ctx: &ExecutionContext) -> Result<Command> {
        let mut cmd = Command::new(tool);
        cmd.arg("install")
            .arg(request.package)
            .arg("--version")
            .arg(&request.version)
            .arg("--root")
            .arg(&ctx.install_dir)
            .arg("--locked")
            .env("CARGO_TARGET_DIR", ctx.work_dir.join("target"));
        Ok(cmd)
    }
}

struct Pipx;

impl Installer for Pipx {
    const NAME: &'static str = "pipx_install";
    const PACKAGE_PARAM: &'static str = "package";
    const TOOL: &'static str = "pipx";
    const PROVIDER: &'static str = "python-standalone";

    fn is_valid_package(name: &str) -> bool {
        security::is_valid_pypi_package(name)
    }

    fn is_valid_version(version: &str) -> bool {
        security::is_valid_pypi_version(version)
    }

    fn dependencies() -> ActionDeps {
        ActionDeps::install_and_runtime("python-standalone")
    }

    fn command(tool: &Path, request: &InstallRequest<'_>, ctx: &ExecutionContext) -> Result<Command> {
        let mut cmd = Command::new(tool);
        cmd.arg("install")
            .arg("--force")
            .arg(format!("{}=={}", request.package, request.version))
            .env("PIPX_HOME", ctx.install_dir.join("venvs"))
            .env("PIPX_BIN_DIR", ctx.install_dir.join("bin"));
        Ok(cmd)
    }
}

struct Go;

impl Go {
    fn build_flags(params: &Params) -> Result<Vec<String>> {
        let flags = params::get_string_slice(params, "build_flags").unwrap_or_default();
        if let Some(bad) = flags.iter().find(|f| !security::is_valid_configure_arg(f)) {
            return Err(Error::invalid_param(
                Self::NAME,
                "build_flags",
                format!("'{}' contains shell metacharacters", bad),
            ));
        }
        Ok(flags)
    }
}

impl Installer for Go {
    const NAME: &'static str = "go_install";
    const PACKAGE_PARAM: &'static str = "module";
    const TOOL: &'static str = "go";
    const PROVIDER: &'static str = "go";

    fn is_valid_package(name: &str) -> bool {
        security::is_valid_go_module(name)
    }

    fn is_valid_version(version: &str) -> bool {
        security::is_valid_go_version(version)
    }

    fn format_version(version: &str) -> String {
        if version.starts_with(|c: char| c.is_ascii_digit()) {
            format!("v{}", version)
        } else {
            version.to_string()
        }
    }

    fn dependencies() -> ActionDeps {
        ActionDeps {
            install_time: vec!["go".to_string()],
            ..Default::default()
        }
        .with_eval_time("go")
    }

    fn check_extra(params: &Params) -> Result<()> {
        Self::build_flags(params).map(|_| ())
    }

    fn command(tool: &Path, request: &InstallRequest<'_>, ctx: &ExecutionContext) -> Result<Command> {
        let target = if request.version.is_empty() {
            format!("{}@latest", request.package)
        } else {
            format!("{}@{}", request.package, request.version)
        };
        let cgo = if params::get_bool(request.params, "cgo_enabled").unwrap_or(false) {
            "1"
        } else {
            "0"
        };

        let mut cmd = Command::new(tool);
        cmd.arg("install")
            .args(Self::build_flags(request.params)?)
            .arg(target)
            .env("GOBIN", ctx.install_dir.join("bin"))
            .env("GOPATH", ctx.work_dir.join("gopath"))
            .env("GOMODCACHE", ctx.work_dir.join("gopath").join("pkg").join("mod"))
            .env("CGO_ENABLED", cgo)
            .env("GOFLAGS", "-mod=mod");
        Ok(cmd)
    }
}

/// Every ecosystem installer
pub fn builtins() -> Vec<Arc<dyn Action>> {
    vec![
        Arc::new(Ecosystem::<Npm>::new()),
        Arc::new(Ecosystem::<Gem>::new()),
        Arc::new(Ecosystem::<Cargo>::new()),
        Arc::new(Ecosystem::<Pipx>::new()),
        Arc::new(Ecosystem::<Go>::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::execution_context;
    use serde_json::{Value, json};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    fn action(name: &str) -> Arc<dyn Action> {
        builtins().into_iter().find(|a| a.name() == name).unwrap()
    }

    #[test]
    fn test_builtin_names_and_deps() {
        let names: Vec<String> = builtins().iter().map(|a| a.name().to_string()).collect();
        assert_eq!(
            names,
            ["npm_install", "gem_install", "cargo_install", "pipx_install", "go_install"]
        );

        let npm = action("npm_install").dependencies();
        assert_eq!(npm.install_time, vec!["nodejs"]);
        assert_eq!(npm.runtime, vec!["nodejs"]);
        assert_eq!(npm.eval_time, vec!["nodejs"]);

        let cargo = action("cargo_install").dependencies();
        assert!(cargo.runtime.is_empty());
        assert_eq!(cargo.eval_time, vec!["rust"]);

        assert!(builtins().iter().all(|a| a.requires_network() && !a.is_deterministic()));
    }

    #[test]
    fn test_preflight_validates_identifiers() {
        let cases = [
            ("npm_install", json!({"package": "@scope/tool", "executables": ["tool"]}), true),
            ("npm_install", json!({"package": "x", "version": "1.0;rm", "executables": ["x"]}), false),
            ("gem_install", json!({"gem": "rails", "version": "7.1.0", "executables": ["rails"]}), true),
            ("gem_install", json!({"gem": "gem;echo", "executables": ["x"]}), false),
            ("cargo_install", json!({"crate": "ripgrep", "executables": ["rg"]}), true),
            ("cargo_install", json!({"crate": "ripgrep", "version": "latest", "executables": ["rg"]}), false),
            ("pipx_install", json!({"package": "black", "version": "24.1.0", "executables": ["black"]}), true),
            ("pipx_install", json!({"package": "black", "version": "24.1.0-x", "executables": ["black"]}), false),
            ("go_install", json!({"module": "golang.org/x/tools/gopls", "executables": ["gopls"]}), true),
            ("go_install", json!({"module": "gopls", "executables": ["gopls"]}), false),
            ("go_install", json!({"module": "a.io/b", "build_flags": ["-ldflags=$(id)"], "executables": ["b"]}), false),
            ("npm_install", json!({"package": "x"}), false),
            ("npm_install", json!({"package": "x", "executables": ["../x"]}), false),
        ];
        for (name, p, ok) in cases {
            let result = action(name).preflight(&params(p.clone())).unwrap();
            assert_eq!(!result.has_errors(), ok, "{name} {p}: {:?}", result.errors);
        }
    }

    #[test]
    fn test_go_version_gets_v_prefix() {
        assert_eq!(Go::format_version("0.16.1"), "v0.16.1");
        assert_eq!(Go::format_version("v0.16.1"), "v0.16.1");
        assert_eq!(Go::format_version("latest"), "latest");
    }

    #[test]
    fn test_execute_rejects_invalid_before_running() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        let err = action("gem_install")
            .execute(&ctx, &params(json!({"gem": "x;rm -rf /", "executables": ["x"]})))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
    }

    #[test]
    fn test_managed_tool_preferred_over_path() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());

        // A fake npm under tools/nodejs-*/bin that "installs" the executable
        let bin = ctx.tools_dir().join("nodejs-20.0.0").join("bin");
        fs::create_dir_all(&bin).unwrap();
        let npm = bin.join("npm");
        fs::write(
            &npm,
            "#!/bin/sh\nfor a in \"$@\"; do last=\"$a\"; done\nprev=\"\"\nfor a in \"$@\"; do\n  if [ \"$prev\" = \"--prefix\" ]; then dir=\"$a\"; fi\n  prev=\"$a\"\ndone\nmkdir -p \"$dir/bin\"\necho \"$last\" > \"$dir/bin/prettier\"\n",
        )
        .unwrap();
        fs::set_permissions(&npm, fs::Permissions::from_mode(0o755)).unwrap();

        action("npm_install")
            .execute(&ctx, &params(json!({"package": "prettier", "version": "3.2.5", "executables": ["prettier"]})))
            .unwrap();
        let installed = fs::read_to_string(ctx.install_dir.join("bin/prettier")).unwrap();
        assert_eq!(installed.trim(), "prettier@3.2.5");

        let err = action("npm_install")
            .execute(&ctx, &params(json!({"package": "prettier", "executables": ["missing"]})))
            .unwrap_err();
        assert!(matches!(err, Error::NotFoundError(_)));
    }
}
