// src/platform.rs

//! Platform targets and applicability predicates
//!
//! A [`Target`] names the platform a plan is generated for. Two predicates
//! decide which recipe steps apply to it:
//!
//! - [`Constraint`]: fixed requirement built into an action type
//!   (e.g. `apt_install` only runs on debian-family Linux)
//! - [`WhenClause`]: per-step condition written in the recipe
//!
//! Both are pure; neither inspects the running system.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Linux distribution families with distinct package managers
pub const LINUX_FAMILIES: &[&str] = &["debian", "rhel", "arch", "alpine", "suse"];

/// Platform a plan targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub os: String,
    pub arch: String,
    /// Empty unless `os == "linux"`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub linux_family: String,
}

impl Target {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
            linux_family: String::new(),
        }
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        if self.os == "linux" {
            self.linux_family = family.into();
        }
        self
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn linux_family(&self) -> &str {
        &self.linux_family
    }

    /// The platform tsuku itself is running on
    pub fn host() -> Self {
        let target = Self::new(host_os(), host_arch());
        if target.os == "linux" {
            let family = detect_linux_family(Path::new("/etc/os-release")).unwrap_or_default();
            target.with_family(family)
        } else {
            target
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)?;
        if !self.linux_family.is_empty() {
            write!(f, " ({})", self.linux_family)?;
        }
        Ok(())
    }
}

/// Map the compiler's OS name to the recipe vocabulary
pub fn host_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

/// Map the compiler's arch name to the recipe vocabulary
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

/// Classify a Linux distribution from an os-release file
///
/// `ID` is checked first, then each entry of `ID_LIKE`.
pub fn detect_linux_family(os_release: &Path) -> Option<String> {
    let content = fs::read_to_string(os_release).ok()?;
    let family = family_from_os_release(&content);
    debug!("Detected linux family {:?} from {}", family, os_release.display());
    family
}

pub fn family_from_os_release(content: &str) -> Option<String> {
    let mut id = String::new();
    let mut id_like = String::new();

    for line in content.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').trim_matches('\'').to_lowercase();
            match key.trim() {
                "ID" => id = value,
                "ID_LIKE" => id_like = value,
                _ => {}
            }
        }
    }

    std::iter::once(id.as_str())
        .chain(id_like.split_whitespace())
        .find_map(family_for_id)
        .map(str::to_string)
}

fn family_for_id(id: &str) -> Option<&'static str> {
    match id {
        "debian" | "ubuntu" | "linuxmint" | "pop" | "elementary" | "raspbian" => Some("debian"),
        "rhel" | "fedora" | "centos" | "rocky" | "almalinux" | "amzn" | "ol" => Some("rhel"),
        "arch" | "manjaro" | "endeavouros" => Some("arch"),
        "alpine" => Some("alpine"),
        "suse" | "sles" | "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" => Some("suse"),
        _ => None,
    }
}

/// Fixed platform requirement of an action type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub os: String,
    /// Only meaningful when `os == "linux"`; empty means any family
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub linux_family: String,
}

impl Constraint {
    pub fn os(os: &str) -> Self {
        Self {
            os: os.to_string(),
            linux_family: String::new(),
        }
    }

    pub fn linux(family: &str) -> Self {
        Self {
            os: "linux".to_string(),
            linux_family: family.to_string(),
        }
    }

    pub fn matches_target(&self, target: &Target) -> bool {
        if self.os != target.os {
            return false;
        }
        self.linux_family.is_empty() || self.linux_family == target.linux_family
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.linux_family.is_empty() {
            write!(f, "{}", self.os)
        } else {
            write!(f, "{}/{}", self.os, self.linux_family)
        }
    }
}

/// Per-step platform condition from a recipe
///
/// `platform` tuples (`os/arch`) take precedence; otherwise `os`, `arch`
/// and `linux_family` must each match when present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhenClause {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platform: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux_family: Option<String>,
}

impl WhenClause {
    pub fn is_empty(&self) -> bool {
        self.platform.is_empty()
            && self.os.is_empty()
            && self.arch.is_none()
            && self.linux_family.is_none()
    }

    pub fn matches(&self, target: &Target) -> bool {
        if self.is_empty() {
            return true;
        }

        if !self.platform.is_empty() {
            let tuple = format!("{}/{}", target.os, target.arch);
            return self.platform.iter().any(|p| *p == tuple);
        }

        if !self.os.is_empty() && !self.os.iter().any(|o| *o == target.os) {
            return false;
        }
        if let Some(arch) = &self.arch
            && *arch != target.arch
        {
            return false;
        }
        if let Some(family) = &self.linux_family
            && *family != target.linux_family
        {
            return false;
        }
        true
    }
}
