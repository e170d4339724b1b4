// src/actions/fs_actions.rs

//! Filesystem primitives
//!
//! These run after downloads and extraction and move files from the work
//! directory into the install tree. Every path they touch comes from recipe
//! input and is validated as a relative path first; symlinks are only
//! created or copied once their targets are known to stay inside the tree.

use super::{Action, ExecutionContext, PreflightResult, preflight_from};
use crate::error::{Error, Result};
use crate::params::{self, Params};
use crate::security;
use regex::Regex;
use serde_json::{Value, json};
use std::fs;
use std::io::Write;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const CHMOD: &str = "chmod";
pub const INSTALL_BINARIES: &str = "install_binaries";
pub const INSTALL_LIBRARIES: &str = "install_libraries";
pub const LINK_DEPENDENCIES: &str = "link_dependencies";
pub const TEXT_REPLACE: &str = "text_replace";
pub const SET_ENV: &str = "set_env";

/// Name of the environment file written by `set_env`
pub const ENV_FILE: &str = "env.sh";

/// Permission bits that never survive a copy into the install tree
const SPECIAL_BITS: u32 = 0o7000;

fn io_context(action: &str, what: &str, path: &Path, e: std::io::Error) -> Error {
    Error::IoError(format!("{}: failed to {} {}: {}", action, what, path.display(), e))
}

fn create_parent(action: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_context(action, "create", parent, e))?;
    }
    Ok(())
}

/// Copy a regular file, dropping setuid, setgid and sticky bits
fn copy_file(action: &str, src: &Path, dest: &Path) -> Result<()> {
    create_parent(action, dest)?;
    if dest.is_symlink() {
        fs::remove_file(dest).map_err(|e| io_context(action, "replace", dest, e))?;
    }
    fs::copy(src, dest).map_err(|e| io_context(action, "copy", src, e))?;
    let mode = fs::metadata(src)
        .map_err(|e| io_context(action, "stat", src, e))?
        .permissions()
        .mode();
    fs::set_permissions(dest, fs::Permissions::from_mode(mode & 0o777 & !SPECIAL_BITS))
        .map_err(|e| io_context(action, "chmod", dest, e))?;
    Ok(())
}

/// Recreate the symlink `src` at `dest`, after checking it stays inside `root`
fn copy_symlink(action: &str, src: &Path, dest: &Path, root: &Path) -> Result<()> {
    let target = fs::read_link(src).map_err(|e| io_context(action, "read link", src, e))?;
    security::validate_symlink_target(&target, dest, root)?;
    create_parent(action, dest)?;
    if dest.symlink_metadata().is_ok() {
        fs::remove_file(dest).map_err(|e| io_context(action, "replace", dest, e))?;
    }
    symlink(&target, dest).map_err(|e| io_context(action, "create symlink", dest, e))?;
    Ok(())
}

/// Copy a directory tree, validating every symlink against `dest`
fn copy_tree(action: &str, src: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| Error::IoError(format!("{}: failed to walk {}: {}", action, src.display(), e)))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| Error::InvalidPath(entry.path().display().to_string()))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| io_context(action, "create", &target, e))?;
        } else if file_type.is_symlink() {
            copy_symlink(action, entry.path(), &target, dest)?;
            copied += 1;
        } else if file_type.is_file() {
            copy_file(action, entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

// =============================================================================
// chmod
// =============================================================================

/// Octal permission string; special bits are refused
fn parse_mode(action: &str, params: &Params) -> Result<u32> {
    let raw = match params.get("mode") {
        None => return Ok(0o755),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => return Err(Error::invalid_param(action, "mode", "must be an octal string")),
    };
    let mode = u32::from_str_radix(raw.trim_start_matches("0o"), 8)
        .map_err(|_| Error::invalid_param(action, "mode", format!("'{}' is not octal", raw)))?;
    if mode > 0o777 {
        return Err(Error::invalid_param(
            action,
            "mode",
            format!("{:o} sets special bits", mode),
        ));
    }
    Ok(mode)
}

fn relative_paths(action: &str, params: &Params, key: &str) -> Result<Vec<PathBuf>> {
    let items = params::get_string_slice(params, key).ok_or_else(|| Error::missing_param(action, key))?;
    if items.is_empty() {
        return Err(Error::invalid_param(action, key, "must not be empty"));
    }
    items
        .iter()
        .map(|item| security::validate_relative_path(item))
        .collect()
}

struct ChmodParams {
    files: Vec<PathBuf>,
    mode: u32,
}

impl ChmodParams {
    fn parse(params: &Params) -> Result<Self> {
        Ok(Self {
            files: relative_paths(CHMOD, params, "files")?,
            mode: parse_mode(CHMOD, params)?,
        })
    }
}

/// Set permissions on files in the work directory
pub struct ChmodAction;

impl Action for ChmodAction {
    fn name(&self) -> &str {
        CHMOD
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let parsed = ChmodParams::parse(params)?;
        for file in &parsed.files {
            let path = ctx.work_dir.join(file);
            if path.is_symlink() {
                return Err(Error::InvalidPath(format!(
                    "chmod: refusing to follow symlink {}",
                    file.display()
                )));
            }
            fs::set_permissions(&path, fs::Permissions::from_mode(parsed.mode))
                .map_err(|e| io_context(CHMOD, "chmod", &path, e))?;
            debug!("chmod {:o} {}", parsed.mode, file.display());
        }
        Ok(())
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        Some(preflight_from(ChmodParams::parse(params)))
    }
}

// =============================================================================
// install_binaries
// =============================================================================

/// How `install_binaries` lays out the install tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallMode {
    /// Copy only the listed files
    #[default]
    Binaries,
    /// Copy the whole work tree and symlink the listed files into place
    Directory,
    /// Copy the whole work tree and write wrapper scripts for the listed files
    DirectoryWrapped,
}

impl InstallMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Binaries => "binaries",
            Self::Directory => "directory",
            Self::DirectoryWrapped => "directory_wrapped",
        }
    }

    pub(crate) fn from_params(action: &str, params: &Params) -> Result<Self> {
        match params::get_non_empty(params, "install_mode").map(str::to_lowercase).as_deref() {
            None | Some("binaries") => Ok(Self::Binaries),
            Some("directory") => Ok(Self::Directory),
            Some("directory_wrapped") => Ok(Self::DirectoryWrapped),
            Some(other) => Err(Error::invalid_param(
                action,
                "install_mode",
                format!("'{}' must be binaries, directory or directory_wrapped", other),
            )),
        }
    }
}

/// One file to install: `src` in the work dir, `dest` in the install dir
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryEntry {
    pub src: String,
    pub dest: String,
}

impl BinaryEntry {
    pub fn to_value(&self) -> Value {
        json!({"src": self.src, "dest": self.dest})
    }

    /// Installed under `bin/` and therefore executable
    fn is_executable(&self) -> bool {
        Path::new(&self.dest).starts_with("bin")
    }
}

/// `binaries` entries: a bare path installs to `bin/<file name>`
pub(crate) fn binary_entries(action: &str, params: &Params) -> Result<Vec<BinaryEntry>> {
    let items = params
        .get("binaries")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::missing_param(action, "binaries"))?;
    if items.is_empty() {
        return Err(Error::invalid_param(action, "binaries", "must not be empty"));
    }

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let (src, dest) = match item {
                Value::String(src) => {
                    let name = security::validate_relative_path(src)?
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .ok_or_else(|| Error::invalid_param(action, "binaries", format!("entry {} has no file name", i)))?;
                    (src.clone(), format!("bin/{}", name))
                }
                Value::Object(map) => {
                    let src = map
                        .get("src")
                        .and_then(Value::as_str)
                        .ok_or_else(|| Error::invalid_param(action, "binaries", format!("entry {} needs a 'src' string", i)))?;
                    let dest = match map.get("dest") {
                        None => {
                            let name = Path::new(src)
                                .file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_default();
                            format!("bin/{}", name)
                        }
                        Some(Value::String(dest)) => dest.clone(),
                        Some(_) => {
                            return Err(Error::invalid_param(action, "binaries", format!("entry {}: 'dest' must be a string", i)));
                        }
                    };
                    (src.to_string(), dest)
                }
                _ => {
                    return Err(Error::invalid_param(action, "binaries", format!("entry {} must be a path or {{src, dest}}", i)));
                }
            };
            security::validate_relative_path(&src)?;
            security::validate_relative_path(&dest)?;
            Ok(BinaryEntry { src, dest })
        })
        .collect()
}

fn wrapper_script(relative_target: &Path) -> String {
    format!(
        "#!/bin/sh\nexec \"$(dirname \"$0\")/{}\" \"$@\"\n",
        relative_target.display()
    )
}

struct InstallBinariesParams {
    binaries: Vec<BinaryEntry>,
    mode: InstallMode,
}

impl InstallBinariesParams {
    fn parse(params: &Params) -> Result<Self> {
        Ok(Self {
            binaries: binary_entries(INSTALL_BINARIES, params)?,
            mode: InstallMode::from_params(INSTALL_BINARIES, params)?,
        })
    }
}

/// Copy built or extracted executables into the install tree
pub struct InstallBinariesAction;

impl InstallBinariesAction {
    fn install_listed(ctx: &ExecutionContext, binaries: &[BinaryEntry]) -> Result<()> {
        for entry in binaries {
            let src = ctx.work_path(&entry.src)?;
            let dest = ctx.install_path(&entry.dest)?;
            if !src.is_file() {
                return Err(Error::NotFoundError(format!(
                    "{}: {} not found in work directory",
                    INSTALL_BINARIES, entry.src
                )));
            }
            copy_file(INSTALL_BINARIES, &src, &dest)?;
            if entry.is_executable() {
                fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))
                    .map_err(|e| io_context(INSTALL_BINARIES, "chmod", &dest, e))?;
            }
            info!("Installed {} -> {}", entry.src, entry.dest);
        }
        Ok(())
    }

    fn install_tree(ctx: &ExecutionContext, binaries: &[BinaryEntry], wrapped: bool) -> Result<()> {
        let copied = copy_tree(INSTALL_BINARIES, &ctx.work_dir, &ctx.install_dir)?;
        info!("Copied {} files into {}", copied, ctx.install_dir.display());

        for entry in binaries {
            let src = ctx.install_path(&entry.src)?;
            if !src.is_file() {
                return Err(Error::NotFoundError(format!(
                    "{}: {} not found in installed tree",
                    INSTALL_BINARIES, entry.src
                )));
            }
            if entry.src == entry.dest {
                continue;
            }

            let dest = ctx.install_path(&entry.dest)?;
            let dest_dir = dest.parent().unwrap_or(&ctx.install_dir);
            let relative = security::relative_path(dest_dir, &src);
            create_parent(INSTALL_BINARIES, &dest)?;
            if dest.symlink_metadata().is_ok() {
                fs::remove_file(&dest).map_err(|e| io_context(INSTALL_BINARIES, "replace", &dest, e))?;
            }

            if wrapped {
                fs::write(&dest, wrapper_script(&relative))
                    .map_err(|e| io_context(INSTALL_BINARIES, "write", &dest, e))?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))
                    .map_err(|e| io_context(INSTALL_BINARIES, "chmod", &dest, e))?;
            } else {
                symlink(&relative, &dest)
                    .map_err(|e| io_context(INSTALL_BINARIES, "create symlink", &dest, e))?;
            }
            debug!("Exposed {} as {}", entry.src, entry.dest);
        }
        Ok(())
    }
}

impl Action for InstallBinariesAction {
    fn name(&self) -> &str {
        INSTALL_BINARIES
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let parsed = InstallBinariesParams::parse(params)?;
        match parsed.mode {
            InstallMode::Binaries => Self::install_listed(ctx, &parsed.binaries),
            InstallMode::Directory => Self::install_tree(ctx, &parsed.binaries, false),
            InstallMode::DirectoryWrapped => Self::install_tree(ctx, &parsed.binaries, true),
        }
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        Some(preflight_from(InstallBinariesParams::parse(params)))
    }
}

// =============================================================================
// install_libraries
// =============================================================================

fn parse_patterns(params: &Params) -> Result<Vec<String>> {
    let patterns = params::get_string_slice(params, "patterns")
        .ok_or_else(|| Error::missing_param(INSTALL_LIBRARIES, "patterns"))?;
    if patterns.is_empty() {
        return Err(Error::invalid_param(INSTALL_LIBRARIES, "patterns", "must not be empty"));
    }
    for pattern in &patterns {
        security::validate_relative_path(pattern)?;
        glob::Pattern::new(pattern).map_err(|e| {
            Error::invalid_param(INSTALL_LIBRARIES, "patterns", format!("'{}': {}", pattern, e))
        })?;
    }
    Ok(patterns)
}

/// Copy shared libraries matching glob patterns into the install tree
pub struct InstallLibrariesAction;

impl Action for InstallLibrariesAction {
    fn name(&self) -> &str {
        INSTALL_LIBRARIES
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let patterns = parse_patterns(params)?;

        let mut matches = Vec::new();
        for pattern in &patterns {
            let full = ctx.work_dir.join(pattern);
            let paths = glob::glob(&full.to_string_lossy()).map_err(|e| {
                Error::invalid_param(INSTALL_LIBRARIES, "patterns", format!("'{}': {}", pattern, e))
            })?;
            for path in paths {
                let path = path.map_err(|e| Error::IoError(format!("{}: {}", INSTALL_LIBRARIES, e)))?;
                if !matches.contains(&path) {
                    matches.push(path);
                }
            }
        }
        if matches.is_empty() {
            return Err(Error::NotFoundError(format!(
                "{}: no files matched {}",
                INSTALL_LIBRARIES,
                patterns.join(", ")
            )));
        }

        for src in &matches {
            let relative = src
                .strip_prefix(&ctx.work_dir)
                .map_err(|_| Error::PathTraversal(src.display().to_string()))?;
            let dest = ctx.install_dir.join(relative);
            let metadata = src
                .symlink_metadata()
                .map_err(|e| io_context(INSTALL_LIBRARIES, "stat", src, e))?;

            if metadata.file_type().is_symlink() {
                copy_symlink(INSTALL_LIBRARIES, src, &dest, &ctx.install_dir)?;
            } else if metadata.is_file() {
                copy_file(INSTALL_LIBRARIES, src, &dest)?;
            } else {
                continue;
            }
            debug!("Installed library {}", relative.display());
        }
        info!("Installed {} library file(s)", matches.len());
        Ok(())
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        Some(preflight_from(parse_patterns(params)))
    }
}

// =============================================================================
// link_dependencies
// =============================================================================

struct LinkParams<'a> {
    library: &'a str,
    version: Option<&'a str>,
}

impl<'a> LinkParams<'a> {
    fn parse(params: &'a Params) -> Result<Self> {
        let library = params::require_string(params, LINK_DEPENDENCIES, "library")?;
        if !security::is_valid_library_name(library) {
            return Err(Error::invalid_param(
                LINK_DEPENDENCIES,
                "library",
                format!("'{}' is not a valid library name", library),
            ));
        }
        let version = params::get_non_empty(params, "version");
        if let Some(version) = version
            && !security::is_valid_dependency_version(version)
        {
            return Err(Error::invalid_param(
                LINK_DEPENDENCIES,
                "version",
                format!("'{}' is not a valid version", version),
            ));
        }
        Ok(Self { library, version })
    }
}

/// Symlink an installed library's files into the tool's `lib/`
///
/// Links are relative, so the tools and libs trees can move together.
/// An entry already linked to the same target is left alone; anything
/// else in the way is an error.
pub struct LinkDependenciesAction;

impl Action for LinkDependenciesAction {
    fn name(&self) -> &str {
        LINK_DEPENDENCIES
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let parsed = LinkParams::parse(params)?;
        let libs_dir = ctx.libs_dir();
        let lib_root = match parsed.version {
            Some(version) => ctx.home.lib_dir(parsed.library, version)?,
            None => ctx.home.find_installed(&libs_dir, parsed.library).ok_or_else(|| {
                Error::NotFoundError(format!("library {} is not installed", parsed.library))
            })?,
        };
        let src_lib_dir = lib_root.join("lib");
        if !src_lib_dir.is_dir() {
            return Err(Error::NotFoundError(format!(
                "library directory does not exist: {}",
                src_lib_dir.display()
            )));
        }

        let dest_lib_dir = ctx.install_dir.join("lib");
        fs::create_dir_all(&dest_lib_dir)
            .map_err(|e| io_context(LINK_DEPENDENCIES, "create", &dest_lib_dir, e))?;
        let to_lib = security::relative_path(&dest_lib_dir, &src_lib_dir);

        let mut entries: Vec<_> = fs::read_dir(&src_lib_dir)
            .map_err(|e| io_context(LINK_DEPENDENCIES, "read", &src_lib_dir, e))?
            .collect::<std::io::Result<_>>()
            .map_err(|e| io_context(LINK_DEPENDENCIES, "read", &src_lib_dir, e))?;
        if entries.is_empty() {
            return Err(Error::NotFoundError(format!(
                "library directory is empty: {}",
                src_lib_dir.display()
            )));
        }
        entries.sort_by_key(|entry| entry.file_name());

        let mut linked = 0;
        for entry in entries {
            let name = entry.file_name();
            let src = entry.path();
            let dest = dest_lib_dir.join(&name);

            // Symlinks inside the library (libz.so -> libz.so.1) are recreated as is
            let target = if entry
                .file_type()
                .map_err(|e| io_context(LINK_DEPENDENCIES, "stat", &src, e))?
                .is_symlink()
            {
                let target = fs::read_link(&src).map_err(|e| io_context(LINK_DEPENDENCIES, "read link", &src, e))?;
                security::validate_symlink_target(&target, &dest, &dest_lib_dir)?;
                target
            } else {
                to_lib.join(&name)
            };

            if let Ok(metadata) = dest.symlink_metadata() {
                if metadata.file_type().is_symlink()
                    && fs::read_link(&dest).is_ok_and(|existing| existing == target)
                {
                    debug!("Already linked: {}", name.to_string_lossy());
                    continue;
                }
                return Err(Error::IoError(format!(
                    "collision: {} already exists and is not a symlink to {}",
                    dest.display(),
                    target.display()
                )));
            }

            symlink(&target, &dest).map_err(|e| io_context(LINK_DEPENDENCIES, "create symlink", &dest, e))?;
            linked += 1;
        }

        info!(
            "Linked {} file(s) from {} into {}",
            linked,
            lib_root.display(),
            dest_lib_dir.display()
        );
        Ok(())
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        Some(preflight_from(LinkParams::parse(params)))
    }
}

// =============================================================================
// text_replace
// =============================================================================

enum Matcher {
    Literal(String),
    Pattern(Regex),
}

struct TextReplaceParams<'a> {
    file: PathBuf,
    matcher: Matcher,
    replacement: &'a str,
}

impl<'a> TextReplaceParams<'a> {
    fn parse(params: &'a Params) -> Result<Self> {
        let file = security::validate_relative_path(params::require_string(params, TEXT_REPLACE, "file")?)?;
        let pattern = params::require_string(params, TEXT_REPLACE, "pattern")?;
        let replacement = params::get_string(params, "replacement")
            .ok_or_else(|| Error::missing_param(TEXT_REPLACE, "replacement"))?;
        let matcher = if params::get_bool(params, "regex").unwrap_or(false) {
            Matcher::Pattern(Regex::new(pattern).map_err(|e| {
                Error::invalid_param(TEXT_REPLACE, "pattern", e.to_string())
            })?)
        } else {
            Matcher::Literal(pattern.to_string())
        };
        Ok(Self {
            file,
            matcher,
            replacement,
        })
    }
}

/// Replace text in a work-directory file
pub struct TextReplaceAction;

impl Action for TextReplaceAction {
    fn name(&self) -> &str {
        TEXT_REPLACE
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let parsed = TextReplaceParams::parse(params)?;
        let path = ctx.work_dir.join(&parsed.file);
        let content = fs::read_to_string(&path).map_err(|e| io_context(TEXT_REPLACE, "read", &path, e))?;

        let (updated, count) = match &parsed.matcher {
            Matcher::Literal(needle) => (
                content.replace(needle.as_str(), parsed.replacement),
                content.matches(needle.as_str()).count(),
            ),
            Matcher::Pattern(regex) => (
                regex.replace_all(&content, parsed.replacement).into_owned(),
                regex.find_iter(&content).count(),
            ),
        };

        if count == 0 {
            debug!("{}: no matches in {}", TEXT_REPLACE, parsed.file.display());
            return Ok(());
        }
        fs::write(&path, updated).map_err(|e| io_context(TEXT_REPLACE, "write", &path, e))?;
        info!("Replaced {} occurrence(s) in {}", count, parsed.file.display());
        Ok(())
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        Some(preflight_from(TextReplaceParams::parse(params)))
    }
}

// =============================================================================
// set_env
// =============================================================================

fn is_valid_env_name(name: &str) -> bool {
    name.chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Double-quote a value for a POSIX shell with nothing left to expand
fn shell_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn parse_env_vars(params: &Params) -> Result<Vec<(String, String)>> {
    let items = params
        .get("vars")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::missing_param(SET_ENV, "vars"))?;
    if items.is_empty() {
        return Err(Error::invalid_param(SET_ENV, "vars", "must not be empty"));
    }
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let name = item.get("name").and_then(Value::as_str);
            let value = item.get("value").and_then(Value::as_str);
            match (name, value) {
                (Some(name), Some(value)) if is_valid_env_name(name) => {
                    Ok((name.to_string(), value.to_string()))
                }
                (Some(name), Some(_)) => Err(Error::invalid_param(
                    SET_ENV,
                    "vars",
                    format!("'{}' is not a valid variable name", name),
                )),
                _ => Err(Error::invalid_param(
                    SET_ENV,
                    "vars",
                    format!("entry {} needs string 'name' and 'value'", i),
                )),
            }
        })
        .collect()
}

/// Write environment exports to `<install_dir>/env.sh`
///
/// Values may use `{install_dir}` and the other template variables.
pub struct SetEnvAction;

impl Action for SetEnvAction {
    fn name(&self) -> &str {
        SET_ENV
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let vars = parse_env_vars(params)?;
        let template = ctx.vars();
        let path = ctx.install_dir.join(ENV_FILE);

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_context(SET_ENV, "open", &path, e))?;
        for (name, value) in &vars {
            let expanded = params::expand_vars(value, &template);
            writeln!(file, "export {}={}", name, shell_quote(&expanded))
                .map_err(|e| io_context(SET_ENV, "write", &path, e))?;
        }
        info!("Wrote {} variable(s) to {}", vars.len(), path.display());
        Ok(())
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        Some(preflight_from(parse_env_vars(params)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::execution_context;
    use tempfile::TempDir;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_binary_entries() {
        let p = params(json!({"binaries": ["dist/sam", {"src": "x/tool", "dest": "libexec/tool"}, {"src": "y"}]}));
        let entries = binary_entries(INSTALL_BINARIES, &p).unwrap();
        assert_eq!(entries[0], BinaryEntry { src: "dist/sam".into(), dest: "bin/sam".into() });
        assert_eq!(entries[1].dest, "libexec/tool");
        assert_eq!(entries[2].dest, "bin/y");

        for bad in [json!([]), json!(["../x"]), json!([{"dest": "bin/x"}]), json!([{"src": "x", "dest": "/bin/x"}]), json!([1])] {
            let p = params(json!({"binaries": bad}));
            assert!(binary_entries(INSTALL_BINARIES, &p).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_chmod_mode_parsing() {
        assert_eq!(parse_mode(CHMOD, &params(json!({}))).unwrap(), 0o755);
        assert_eq!(parse_mode(CHMOD, &params(json!({"mode": "644"}))).unwrap(), 0o644);
        assert_eq!(parse_mode(CHMOD, &params(json!({"mode": 700}))).unwrap(), 0o700);
        assert!(parse_mode(CHMOD, &params(json!({"mode": "4755"}))).is_err());
        assert!(parse_mode(CHMOD, &params(json!({"mode": "9"}))).is_err());
    }

    #[test]
    fn test_chmod_executes() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        write(&ctx.work_dir.join("bin/tool"), "#!/bin/sh\n");

        ChmodAction
            .execute(&ctx, &params(json!({"files": ["bin/tool"], "mode": "750"})))
            .unwrap();
        let mode = fs::metadata(ctx.work_dir.join("bin/tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn test_install_binaries_mode() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        write(&ctx.work_dir.join("dist/tool"), "#!/bin/sh\necho hi\n");

        InstallBinariesAction
            .execute(&ctx, &params(json!({"binaries": ["dist/tool"]})))
            .unwrap();
        let installed = ctx.install_dir.join("bin/tool");
        assert!(installed.is_file());
        assert_eq!(fs::metadata(&installed).unwrap().permissions().mode() & 0o777, 0o755);
        assert!(!ctx.install_dir.join("dist").exists());
    }

    #[test]
    fn test_install_directory_modes() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        write(&ctx.work_dir.join("jdk/bin/java"), "#!/bin/sh\n");
        write(&ctx.work_dir.join("jdk/lib/rt.jar"), "jar");

        let p = params(json!({
            "binaries": [{"src": "jdk/bin/java", "dest": "bin/java"}],
            "install_mode": "directory",
        }));
        InstallBinariesAction.execute(&ctx, &p).unwrap();
        assert!(ctx.install_dir.join("jdk/lib/rt.jar").is_file());
        assert_eq!(
            fs::read_link(ctx.install_dir.join("bin/java")).unwrap(),
            PathBuf::from("../jdk/bin/java")
        );

        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        write(&ctx.work_dir.join("jdk/bin/java"), "#!/bin/sh\n");
        let p = params(json!({
            "binaries": [{"src": "jdk/bin/java", "dest": "bin/java"}],
            "install_mode": "directory_wrapped",
        }));
        InstallBinariesAction.execute(&ctx, &p).unwrap();
        let wrapper = fs::read_to_string(ctx.install_dir.join("bin/java")).unwrap();
        assert!(wrapper.contains("exec \"$(dirname \"$0\")/../jdk/bin/java\""));
    }

    #[test]
    fn test_install_directory_rejects_escaping_symlink() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        write(&ctx.work_dir.join("app/bin/app"), "#!/bin/sh\n");
        symlink("../../../../etc/passwd", ctx.work_dir.join("app/bin/passwd")).unwrap();

        let p = params(json!({"binaries": ["app/bin/app"], "install_mode": "directory"}));
        let err = InstallBinariesAction.execute(&ctx, &p).unwrap_err();
        assert!(matches!(err, Error::PathTraversal(_)));
    }

    #[test]
    fn test_install_libraries_preserves_symlinks() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        write(&ctx.work_dir.join("lib/libz.so.1.3"), "elf");
        symlink("libz.so.1.3", ctx.work_dir.join("lib/libz.so.1")).unwrap();
        fs::set_permissions(ctx.work_dir.join("lib/libz.so.1.3"), fs::Permissions::from_mode(0o4755)).unwrap();

        InstallLibrariesAction
            .execute(&ctx, &params(json!({"patterns": ["lib/libz.so*"]})))
            .unwrap();
        assert_eq!(
            fs::read_link(ctx.install_dir.join("lib/libz.so.1")).unwrap(),
            PathBuf::from("libz.so.1.3")
        );
        let mode = fs::metadata(ctx.install_dir.join("lib/libz.so.1.3")).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o755);
    }

    #[test]
    fn test_install_libraries_rejects_absolute_symlink() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        fs::create_dir_all(ctx.work_dir.join("lib")).unwrap();
        symlink("/usr/lib/libc.so", ctx.work_dir.join("lib/libc.so")).unwrap();

        let err = InstallLibrariesAction
            .execute(&ctx, &params(json!({"patterns": ["lib/*.so"]})))
            .unwrap_err();
        assert!(matches!(err, Error::PathTraversal(_)));
    }

    #[test]
    fn test_install_libraries_no_match() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        let err = InstallLibrariesAction
            .execute(&ctx, &params(json!({"patterns": ["lib/*.so"]})))
            .unwrap_err();
        assert!(matches!(err, Error::NotFoundError(_)));
        assert!(InstallLibrariesAction.preflight(&params(json!({"patterns": ["../lib/*"]}))).unwrap().has_errors());
    }

    fn install_zlib(ctx: &ExecutionContext) -> PathBuf {
        let lib = ctx.home.lib_dir("zlib", "1.3.1").unwrap().join("lib");
        write(&lib.join("libz.so.1.3.1"), "elf");
        symlink("libz.so.1.3.1", lib.join("libz.so.1")).unwrap();
        lib
    }

    #[test]
    fn test_link_dependencies_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        install_zlib(&ctx);
        let p = params(json!({"library": "zlib", "version": "1.3.1"}));

        LinkDependenciesAction.execute(&ctx, &p).unwrap();
        let link = ctx.install_dir.join("lib/libz.so.1.3.1");
        let expected = security::relative_path(
            &ctx.install_dir.join("lib"),
            &ctx.home.lib_dir("zlib", "1.3.1").unwrap().join("lib/libz.so.1.3.1"),
        );
        assert_eq!(fs::read_link(&link).unwrap(), expected);
        assert_eq!(
            fs::read_link(ctx.install_dir.join("lib/libz.so.1")).unwrap(),
            PathBuf::from("libz.so.1.3.1")
        );
        let before = fs::symlink_metadata(&link).unwrap().modified().unwrap();

        LinkDependenciesAction.execute(&ctx, &p).unwrap();
        let after = fs::symlink_metadata(&link).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_link_dependencies_discovers_version() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        install_zlib(&ctx);
        LinkDependenciesAction
            .execute(&ctx, &params(json!({"library": "zlib"})))
            .unwrap();
        assert!(ctx.install_dir.join("lib/libz.so.1.3.1").is_symlink());
    }

    #[test]
    fn test_link_dependencies_collision_is_fatal() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        install_zlib(&ctx);
        write(&ctx.install_dir.join("lib/libz.so.1.3.1"), "not a link");

        let err = LinkDependenciesAction
            .execute(&ctx, &params(json!({"library": "zlib", "version": "1.3.1"})))
            .unwrap_err();
        assert!(err.to_string().contains("collision"));
    }

    #[test]
    fn test_link_dependencies_validates_names() {
        for bad in [json!({"library": "../zlib"}), json!({"library": "zlib", "version": "1;rm"}), json!({})] {
            assert!(LinkDependenciesAction.preflight(&params(bad)).unwrap().has_errors());
        }
    }

    #[test]
    fn test_text_replace_literal_and_regex() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        write(&ctx.work_dir.join("Makefile"), "PREFIX=/usr/local\nCC=gcc\n");

        TextReplaceAction
            .execute(&ctx, &params(json!({"file": "Makefile", "pattern": "/usr/local", "replacement": "/opt"})))
            .unwrap();
        TextReplaceAction
            .execute(&ctx, &params(json!({"file": "Makefile", "pattern": "CC=\\w+", "replacement": "CC=cc", "regex": true})))
            .unwrap();
        assert_eq!(
            fs::read_to_string(ctx.work_dir.join("Makefile")).unwrap(),
            "PREFIX=/opt\nCC=cc\n"
        );

        assert!(TextReplaceAction
            .preflight(&params(json!({"file": "../etc/hosts", "pattern": "a", "replacement": "b"})))
            .unwrap()
            .has_errors());
        assert!(TextReplaceAction
            .preflight(&params(json!({"file": "x", "pattern": "(", "replacement": "b", "regex": true})))
            .unwrap()
            .has_errors());
    }

    #[test]
    fn test_set_env_writes_quoted_exports() {
        let temp = TempDir::new().unwrap();
        let ctx = execution_context(temp.path());
        let p = params(json!({"vars": [
            {"name": "JAVA_HOME", "value": "{install_dir}/jdk"},
            {"name": "GREETING", "value": "say \"hi\" $USER"},
        ]}));
        SetEnvAction.execute(&ctx, &p).unwrap();

        let env = fs::read_to_string(ctx.install_dir.join(ENV_FILE)).unwrap();
        assert!(env.contains(&format!("export JAVA_HOME=\"{}/jdk\"", ctx.install_dir.display())));
        assert!(env.contains("export GREETING=\"say \\\"hi\\\" \\$USER\""));

        let bad = params(json!({"vars": [{"name": "1BAD", "value": "x"}]}));
        assert!(SetEnvAction.preflight(&bad).unwrap().has_errors());
    }
}
