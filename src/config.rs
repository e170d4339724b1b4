// src/config.rs

//! Installation home layout
//!
//! Everything tsuku writes lives under a single root, taken from
//! `$TSUKU_HOME` and defaulting to `~/.tsuku`:
//!
//! ```text
//! $TSUKU_HOME/
//!   tools/<name>-<version>/     installed tool trees
//!   libs/<name>-<version>/lib/  shared library trees
//!   bin/                        exposed executables
//!   cache/downloads/            checksum-addressed artifacts
//!   cache/keys/                 PGP keys by fingerprint
//! ```

use crate::error::{Error, Result};
use crate::security;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the installation root
pub const TSUKU_HOME_ENV: &str = "TSUKU_HOME";

/// Directory name used under the user's home when `TSUKU_HOME` is unset
const DEFAULT_DIR_NAME: &str = ".tsuku";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsukuHome {
    root: PathBuf,
}

impl TsukuHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the root from `$TSUKU_HOME`, falling back to `~/.tsuku`
    pub fn from_env() -> Result<Self> {
        if let Some(value) = std::env::var_os(TSUKU_HOME_ENV)
            && !value.is_empty()
        {
            return Ok(Self::new(PathBuf::from(value)));
        }

        let home = dirs::home_dir().ok_or_else(|| {
            Error::InitError(format!(
                "cannot determine home directory; set {}",
                TSUKU_HOME_ENV
            ))
        })?;
        Ok(Self::new(home.join(DEFAULT_DIR_NAME)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("tools")
    }

    pub fn libs_dir(&self) -> PathBuf {
        self.root.join("libs")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn download_cache_dir(&self) -> PathBuf {
        self.root.join("cache").join("downloads")
    }

    pub fn key_cache_dir(&self) -> PathBuf {
        self.root.join("cache").join("keys")
    }

    /// Install directory for one tool version
    ///
    /// Fails if either part could step out of `tools/`.
    pub fn tool_dir(&self, name: &str, version: &str) -> Result<PathBuf> {
        security::validate_install_id(name, version)?;
        Ok(self.tools_dir().join(format!("{}-{}", name, version)))
    }

    /// Library directory for one library version
    pub fn lib_dir(&self, name: &str, version: &str) -> Result<PathBuf> {
        security::validate_install_id(name, version)?;
        Ok(self.libs_dir().join(format!("{}-{}", name, version)))
    }

    /// Create the tools, libs and bin directories
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [self.tools_dir(), self.libs_dir(), self.bin_dir()] {
            fs::create_dir_all(&dir).map_err(|e| {
                Error::IoError(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Find the newest-looking installed directory for a tool (`<name>-*`)
    ///
    /// Entries are compared by name, so this is only a tiebreak when several
    /// versions are installed side by side.
    pub fn find_installed(&self, parent: &Path, name: &str) -> Option<PathBuf> {
        let prefix = format!("{}-", name);
        let entries = fs::read_dir(parent).ok()?;
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .map(|e| e.path())
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let home = TsukuHome::new("/opt/tsuku");
        assert_eq!(home.tools_dir(), PathBuf::from("/opt/tsuku/tools"));
        assert_eq!(home.libs_dir(), PathBuf::from("/opt/tsuku/libs"));
        assert_eq!(
            home.download_cache_dir(),
            PathBuf::from("/opt/tsuku/cache/downloads")
        );
        assert_eq!(home.key_cache_dir(), PathBuf::from("/opt/tsuku/cache/keys"));
        assert_eq!(
            home.tool_dir("ripgrep", "14.1.0").unwrap(),
            PathBuf::from("/opt/tsuku/tools/ripgrep-14.1.0")
        );
    }

    #[test]
    fn test_install_dirs_stay_under_home() {
        let home = TsukuHome::new("/opt/tsuku");
        assert!(matches!(home.tool_dir("../../victim", "1.0"), Err(Error::InvalidPath(_))));
        assert!(matches!(home.tool_dir("tool", "1.0/../../x"), Err(Error::InvalidPath(_))));
        assert!(home.lib_dir("zlib", "../1.3").is_err());
    }

    #[test]
    fn test_find_installed() {
        let temp = TempDir::new().unwrap();
        let home = TsukuHome::new(temp.path());
        home.ensure_layout().unwrap();

        assert!(home.find_installed(&home.tools_dir(), "nodejs").is_none());

        fs::create_dir_all(home.tools_dir().join("nodejs-20.1.0")).unwrap();
        fs::create_dir_all(home.tools_dir().join("nodejs-22.0.0")).unwrap();
        fs::create_dir_all(home.tools_dir().join("node-exporter-1.0")).unwrap();

        let found = home.find_installed(&home.tools_dir(), "nodejs").unwrap();
        assert!(found.ends_with("nodejs-22.0.0"));
    }
}
