// src/actions/system.rs

//! Host system checks and distribution package managers
//!
//! `require_command` and `system_dependency` inspect the host and fail with
//! actionable errors. The package-manager actions are bound to one platform
//! through their implicit constraint and never escalate privileges: they
//! validate their input and report the command an administrator would run.

use super::{Action, ExecutionContext, PreflightResult, preflight_from};
use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use crate::params::{self, Params};
use crate::platform::Constraint;
use crate::process;
use crate::security;
use regex::Regex;
use semver::Version;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const REQUIRE_COMMAND: &str = "require_command";
pub const SYSTEM_DEPENDENCY: &str = "system_dependency";

const DEFAULT_VERSION_FLAG: &str = "--version";
const DEFAULT_VERSION_REGEX: &str = r"(\d+\.\d+(?:\.\d+)?)";

/// Parse `1`, `1.2` or `1.2.3[-pre]` as semver, padding missing components
fn lenient_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }
    let core: String = raw
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts: Vec<&str> = core.split('.').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&parts.join(".")).ok()
}

// =============================================================================
// require_command
// =============================================================================

struct RequireCommandParams<'a> {
    command: &'a str,
    min_version: Option<Version>,
    version_flag: &'a str,
    version_regex: Regex,
}

impl<'a> RequireCommandParams<'a> {
    fn parse(params: &'a Params) -> Result<Self> {
        let command = params::require_string(params, REQUIRE_COMMAND, "command")?;
        if !security::is_valid_command_name(command) {
            return Err(Error::invalid_param(
                REQUIRE_COMMAND,
                "command",
                format!("'{}' is not a valid command name", command),
            ));
        }

        let min_version = params::get_non_empty(params, "min_version")
            .map(|raw| {
                lenient_version(raw).ok_or_else(|| {
                    Error::invalid_param(REQUIRE_COMMAND, "min_version", format!("'{}' is not a version", raw))
                })
            })
            .transpose()?;

        let version_flag = params::get_non_empty(params, "version_flag").unwrap_or(DEFAULT_VERSION_FLAG);
        if !security::is_valid_configure_arg(version_flag) {
            return Err(Error::invalid_param(
                REQUIRE_COMMAND,
                "version_flag",
                format!("'{}' contains shell metacharacters", version_flag),
            ));
        }

        let pattern = params::get_non_empty(params, "version_regex").unwrap_or(DEFAULT_VERSION_REGEX);
        let version_regex = Regex::new(pattern)
            .map_err(|e| Error::invalid_param(REQUIRE_COMMAND, "version_regex", e.to_string()))?;
        if version_regex.captures_len() < 2 {
            return Err(Error::invalid_param(
                REQUIRE_COMMAND,
                "version_regex",
                "must contain a capture group for the version",
            ));
        }

        Ok(Self {
            command,
            min_version,
            version_flag,
            version_regex,
        })
    }

    /// Extract the version from `--version` style output
    fn installed_version(&self, output: &str) -> Result<Version> {
        let found = self
            .version_regex
            .captures(output)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| {
                Error::ParseError(format!(
                    "could not find a version in '{} {}' output",
                    self.command, self.version_flag
                ))
            })?;
        lenient_version(found).ok_or_else(|| Error::ParseError(format!("'{}' is not a version", found)))
    }
}

/// Fail unless a command is on PATH, optionally at a minimum version
pub struct RequireCommandAction;

impl Action for RequireCommandAction {
    fn name(&self) -> &str {
        REQUIRE_COMMAND
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let parsed = RequireCommandParams::parse(params)?;
        let path = which::which(parsed.command).map_err(|_| Error::ToolNotFound(parsed.command.to_string()))?;
        debug!("Found {} at {}", parsed.command, path.display());

        let Some(min_version) = &parsed.min_version else {
            return Ok(());
        };

        let mut cmd = Command::new(&path);
        cmd.arg(parsed.version_flag);
        let output = process::run_command(cmd, &ctx.cancel)?;
        let installed = parsed.installed_version(&output.output)?;

        if installed < *min_version {
            return Err(Error::ToolNotFound(format!(
                "{} {} is installed but {} or newer is required",
                parsed.command, installed, min_version
            )));
        }
        info!("{} {} satisfies >= {}", parsed.command, installed, min_version);
        Ok(())
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        Some(preflight_from(RequireCommandParams::parse(params)))
    }
}

// =============================================================================
// system_dependency
// =============================================================================

/// Install command prefix for a distribution family
fn install_command(family: &str) -> Option<&'static str> {
    match family {
        "debian" => Some("apt-get install -y"),
        "rhel" => Some("dnf install -y"),
        "arch" => Some("pacman -S --noconfirm"),
        "alpine" => Some("apk add"),
        "suse" => Some("zypper install -y"),
        "darwin" => Some("brew install"),
        _ => None,
    }
}

/// Privilege escalation prefix, or nothing when already root
fn root_prefix() -> &'static str {
    if nix::unistd::geteuid().is_root() {
        ""
    } else if which::which("sudo").is_err() && which::which("doas").is_ok() {
        "doas "
    } else {
        "sudo "
    }
}

struct SystemDependencyParams<'a> {
    name: &'a str,
    packages: std::collections::BTreeMap<String, String>,
}

impl<'a> SystemDependencyParams<'a> {
    fn parse(params: &'a Params) -> Result<Self> {
        let name = params::require_string(params, SYSTEM_DEPENDENCY, "name")?;
        if !security::is_valid_command_name(name) {
            return Err(Error::invalid_param(
                SYSTEM_DEPENDENCY,
                "name",
                format!("'{}' is not a valid command name", name),
            ));
        }
        let packages = params::get_string_map(params, "packages").unwrap_or_default();
        if let Some((family, package)) = packages.iter().find(|(_, p)| !security::is_valid_system_package(p)) {
            return Err(Error::invalid_param(
                SYSTEM_DEPENDENCY,
                "packages",
                format!("'{}' for {} is not a valid package name", package, family),
            ));
        }
        Ok(Self { name, packages })
    }

    fn missing(&self, family: &str) -> Error {
        let package = self.packages.get(family).map(String::as_str).unwrap_or(self.name);
        let command = match install_command(family) {
            Some(install) if family == "darwin" => format!("{} {}", install, package),
            Some(install) => format!("{}{} {}", root_prefix(), install, package),
            None => format!("install '{}' with your system package manager", package),
        };
        Error::DependencyMissing {
            library: self.name.to_string(),
            package: package.to_string(),
            command,
            family: family.to_string(),
        }
    }
}

/// Fail with an install hint unless a system-provided command is present
pub struct SystemDependencyAction;

impl Action for SystemDependencyAction {
    fn name(&self) -> &str {
        SYSTEM_DEPENDENCY
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let parsed = SystemDependencyParams::parse(params)?;
        if which::which(parsed.name).is_ok() {
            debug!("System dependency {} is present", parsed.name);
            return Ok(());
        }

        let family = if ctx.target.os == "linux" {
            ctx.target.linux_family.as_str()
        } else {
            ctx.target.os.as_str()
        };
        Err(parsed.missing(family))
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        Some(preflight_from(SystemDependencyParams::parse(params)))
    }
}

// =============================================================================
// Package managers
// =============================================================================

/// What a package-manager action manages
#[derive(Debug, Clone, Copy)]
enum PackageOp {
    /// `packages` list appended to an install command
    Install(&'static str),
    /// Repository `url` plus its signing key `key_url` and `key_sha256`
    Repository(&'static str),
    /// Launchpad PPA given as `ppa = "owner/name"`
    Ppa,
}

/// Distribution package manager action, bound to one platform
struct PackageManagerAction {
    name: &'static str,
    constraint: Constraint,
    op: PackageOp,
}

impl PackageManagerAction {
    fn install(name: &'static str, constraint: Constraint, command: &'static str) -> Self {
        Self {
            name,
            constraint,
            op: PackageOp::Install(command),
        }
    }

    fn repository(name: &'static str, constraint: Constraint, command: &'static str) -> Self {
        Self {
            name,
            constraint,
            op: PackageOp::Repository(command),
        }
    }

    /// Validate params and render the command an administrator would run
    fn render(&self, params: &Params) -> Result<String> {
        match self.op {
            PackageOp::Install(command) => {
                let packages = params::get_string_slice(params, "packages")
                    .ok_or_else(|| Error::missing_param(self.name, "packages"))?;
                if packages.is_empty() {
                    return Err(Error::invalid_param(self.name, "packages", "must not be empty"));
                }
                if let Some(bad) = packages.iter().find(|p| !security::is_valid_system_package(p)) {
                    return Err(Error::invalid_param(
                        self.name,
                        "packages",
                        format!("'{}' is not a valid package name", bad),
                    ));
                }
                Ok(format!("{} {}", command, packages.join(" ")))
            }
            PackageOp::Repository(command) => {
                let url = params::require_string(params, self.name, "url")?;
                let key_url = params::require_string(params, self.name, "key_url")?;
                let key_sha256 = params::require_string(params, self.name, "key_sha256")?;
                crate::download::require_https(url)?;
                crate::download::require_https(key_url)?;
                if !hash::is_valid_checksum(key_sha256, HashAlgorithm::Sha256) {
                    return Err(Error::invalid_param(
                        self.name,
                        "key_sha256",
                        format!("'{}' is not a sha256 digest", key_sha256),
                    ));
                }
                Ok(format!("{} {}", command, url))
            }
            PackageOp::Ppa => {
                let ppa = params::require_string(params, self.name, "ppa")?;
                let valid = ppa
                    .split_once('/')
                    .is_some_and(|(owner, name)| {
                        security::is_valid_system_package(owner) && security::is_valid_system_package(name)
                    });
                if !valid {
                    return Err(Error::invalid_param(
                        self.name,
                        "ppa",
                        format!("'{}' must be owner/name", ppa),
                    ));
                }
                Ok(format!("add-apt-repository ppa:{}", ppa))
            }
        }
    }
}

impl Action for PackageManagerAction {
    fn name(&self) -> &str {
        self.name
    }

    fn execute(&self, _ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let command = self.render(params)?;
        warn!("{} requires administrator action; run: {}", self.name, command);
        info!("Skipping privileged command for {}", self.name);
        Ok(())
    }

    fn requires_network(&self) -> bool {
        true
    }

    fn implicit_constraint(&self) -> Option<Constraint> {
        Some(self.constraint.clone())
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        Some(preflight_from(self.render(params)))
    }
}

/// Every distribution package-manager action
pub fn package_manager_actions() -> Vec<Arc<dyn Action>> {
    let debian = || Constraint::linux("debian");
    let rhel = || Constraint::linux("rhel");
    let darwin = || Constraint::os("darwin");
    vec![
        Arc::new(PackageManagerAction::install("apt_install", debian(), "apt-get install -y")),
        Arc::new(PackageManagerAction::repository("apt_repo", debian(), "add-apt-repository")),
        Arc::new(PackageManagerAction {
            name: "apt_ppa",
            constraint: debian(),
            op: PackageOp::Ppa,
        }),
        Arc::new(PackageManagerAction::install("dnf_install", rhel(), "dnf install -y")),
        Arc::new(PackageManagerAction::repository("dnf_repo", rhel(), "dnf config-manager --add-repo")),
        Arc::new(PackageManagerAction::install(
            "pacman_install",
            Constraint::linux("arch"),
            "pacman -S --noconfirm",
        )),
        Arc::new(PackageManagerAction::install("apk_install", Constraint::linux("alpine"), "apk add")),
        Arc::new(PackageManagerAction::install(
            "zypper_install",
            Constraint::linux("suse"),
            "zypper install -y",
        )),
        Arc::new(PackageManagerAction::install("brew_install", darwin(), "brew install")),
        Arc::new(PackageManagerAction::install("brew_cask", darwin(), "brew install --cask")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::execution_context;
    use crate::platform::Target;
    use serde_json::{Value, json};
    use tempfile::TempDir;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_lenient_version() {
        assert_eq!(lenient_version("2.39"), Some(Version::new(2, 39, 0)));
        assert_eq!(lenient_version("v1.22.3"), Some(Version::new(1, 22, 3)));
        assert_eq!(lenient_version("3"), Some(Version::new(3, 0, 0)));
        assert_eq!(lenient_version("1.2.3.4"), None);
        assert_eq!(lenient_version("abc"), None);
    }

    #[test]
    fn test_require_command_params() {
        assert!(RequireCommandParams::parse(&params(json!({"command": "sh"}))).is_ok());
        for bad in [
            json!({}),
            json!({"command": "sh;rm"}),
            json!({"command": "sh", "min_version": "new"}),
            json!({"command": "sh", "version_regex": "\\d+"}),
            json!({"command": "sh", "version_flag": "$(id)"}),
        ] {
            assert!(RequireCommandParams::parse(&params(bad.clone())).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_require_command_missing_tool() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        let err = RequireCommandAction
            .execute(&ctx, &params(json!({"command": "tsuku-definitely-missing"})))
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(_)));
    }

    #[test]
    fn test_installed_version_extraction() {
        let binding = params(json!({"command": "git", "min_version": "2.30"}));
        let parsed = RequireCommandParams::parse(&binding).unwrap();
        assert_eq!(parsed.min_version, Some(Version::new(2, 30, 0)));
        assert_eq!(
            parsed.installed_version("git version 2.39.2 (Apple Git-143)").unwrap(),
            Version::new(2, 39, 2)
        );
        assert!(parsed.installed_version("no digits here").is_err());

        let custom = params(json!({"command": "java", "version_regex": "version \"(\\d+)"}));
        let parsed = RequireCommandParams::parse(&custom).unwrap();
        assert_eq!(
            parsed.installed_version("openjdk version \"21\" 2023-09-19").unwrap(),
            Version::new(21, 0, 0)
        );
    }

    #[test]
    fn test_require_command_present() {
        if which::which("sh").is_err() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        RequireCommandAction.execute(&ctx, &params(json!({"command": "sh"}))).unwrap();
    }

    #[test]
    fn test_system_dependency_missing_hint() {
        let temp = TempDir::new().unwrap();
        let mut ctx = execution_context(temp.path());
        let p = params(json!({
            "name": "tsuku-missing-lib",
            "packages": {"debian": "libtsuku-dev", "rhel": "tsuku-devel"},
        }));

        let err = SystemDependencyAction.execute(&ctx, &p).unwrap_err();
        assert!(err.is_dependency_missing());
        match err {
            Error::DependencyMissing { package, command, family, .. } => {
                assert_eq!(package, "libtsuku-dev");
                assert_eq!(family, "debian");
                assert!(command.ends_with("apt-get install -y libtsuku-dev"));
            }
            other => panic!("unexpected error: {other}"),
        }

        ctx.target = Target::new("darwin", "arm64");
        match SystemDependencyAction.execute(&ctx, &p).unwrap_err() {
            Error::DependencyMissing { package, command, .. } => {
                assert_eq!(package, "tsuku-missing-lib");
                assert_eq!(command, "brew install tsuku-missing-lib");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_system_dependency_validates_packages() {
        let p = params(json!({"name": "gcc", "packages": {"debian": "gcc; rm -rf /"}}));
        assert!(SystemDependencyAction.preflight(&p).unwrap().has_errors());
    }

    #[test]
    fn test_package_manager_constraints() {
        let actions = package_manager_actions();
        let find = |name: &str| actions.iter().find(|a| a.name() == name).unwrap();

        let debian = Target::new("linux", "amd64").with_family("debian");
        let fedora = Target::new("linux", "amd64").with_family("rhel");
        let mac = Target::new("darwin", "arm64");

        let apt = find("apt_install").implicit_constraint().unwrap();
        assert!(apt.matches_target(&debian));
        assert!(!apt.matches_target(&fedora));
        assert!(find("dnf_repo").implicit_constraint().unwrap().matches_target(&fedora));
        assert!(find("brew_cask").implicit_constraint().unwrap().matches_target(&mac));
        assert!(actions.iter().all(|a| a.requires_network()));
        assert_eq!(actions.len(), 10);
    }

    #[test]
    fn test_package_manager_never_runs_commands() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        let actions = package_manager_actions();
        let find = |name: &str| actions.iter().find(|a| a.name() == name).unwrap();

        find("apt_install")
            .execute(&ctx, &params(json!({"packages": ["build-essential", "libssl-dev"]})))
            .unwrap();
        assert!(find("apt_install").execute(&ctx, &params(json!({"packages": ["a;b"]}))).is_err());
        assert!(find("apt_repo").execute(&ctx, &params(json!({"url": "http://x"}))).is_err());
        find("apt_ppa").execute(&ctx, &params(json!({"ppa": "deadsnakes/ppa"}))).unwrap();
        assert!(find("apt_ppa").execute(&ctx, &params(json!({"ppa": "nope"}))).is_err());
    }

    #[test]
    fn test_package_manager_preflight() {
        let actions = package_manager_actions();
        let find = |name: &str| actions.iter().find(|a| a.name() == name).unwrap();
        let check = |name: &str, value: Value| find(name).preflight(&params(value)).unwrap();

        assert!(actions.iter().all(|a| check(a.name(), json!({})).has_errors()));
        assert!(!check("apt_install", json!({"packages": ["curl"]})).has_errors());
        assert!(check("apt_install", json!({"packages": ["a;b"]})).has_errors());
        assert!(check("apt_install", json!({"packages": []})).has_errors());

        assert!(!check("apt_ppa", json!({"ppa": "deadsnakes/ppa"})).has_errors());
        assert!(check("apt_ppa", json!({"repo": "deadsnakes/ppa"})).has_errors());

        let repo = json!({
            "url": "https://download.docker.com/linux/ubuntu",
            "key_url": "https://download.docker.com/linux/ubuntu/gpg",
            "key_sha256": "a".repeat(64),
        });
        assert!(!check("apt_repo", repo.clone()).has_errors());
        assert!(!check("dnf_repo", repo.clone()).has_errors());

        let mut without_digest = repo.clone();
        without_digest.as_object_mut().unwrap().remove("key_sha256");
        let result = check("apt_repo", without_digest);
        assert!(result.errors[0].contains("key_sha256"));

        let mut plain_key = repo;
        plain_key["key_url"] = json!("http://download.docker.com/gpg");
        assert!(check("dnf_repo", plain_key).has_errors());
    }
}
