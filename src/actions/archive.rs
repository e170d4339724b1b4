// src/actions/archive.rs

//! Release archive actions
//!
//! The three archive composites differ only in how they locate the archive:
//!
//! - `download_archive`: an explicit URL template
//! - `github_archive`: a GitHub release asset, `{repo}` + `asset_pattern`
//! - `fossil_archive`: a Fossil repository tarball for a version tag
//!
//! Each expands to the same four steps: `download`, `extract`, `chmod` and
//! `install_binaries`. Verification parameters given to the composite are
//! handed to the `download` step unchanged.
//!
//! `extract` is the primitive that unpacks tarballs. Entries that would land
//! outside the destination, and symlinks pointing outside it, abort the
//! extraction.

use super::download::{DOWNLOAD, check_url_template};
use super::fs_actions::{BinaryEntry, InstallMode, binary_entries};
use super::{
    Action, Decomposable, EvalContext, ExecutionContext, PreflightResult, Step, execute_composite,
    preflight_from,
};
use crate::cancel::CancelToken;
use crate::compression::ArchiveFormat;
use crate::download::url_file_name;
use crate::error::{Error, Result};
use crate::params::{self, Params};
use crate::security;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

pub const DOWNLOAD_ARCHIVE: &str = "download_archive";
pub const GITHUB_ARCHIVE: &str = "github_archive";
pub const FOSSIL_ARCHIVE: &str = "fossil_archive";
pub const EXTRACT: &str = "extract";

/// Parameters passed through to the generated `download` step
const VERIFICATION_KEYS: &[&str] = &[
    "checksum",
    "checksum_url",
    "checksum_algo",
    "signature_url",
    "signature_key_url",
    "signature_key_fingerprint",
    "skip_verification_reason",
];

const DEFAULT_TAG_PREFIX: &str = "version-";
const DEFAULT_VERSION_SEPARATOR: &str = ".";

// =============================================================================
// Shared composite expansion
// =============================================================================

/// Everything needed to emit the download/extract/chmod/install sequence
struct ArchivePlan {
    url: String,
    archive: String,
    format: ArchiveFormat,
    strip_dirs: u32,
    binaries: Vec<BinaryEntry>,
    install_mode: InstallMode,
}

impl ArchivePlan {
    fn into_steps(self, params: &Params) -> Vec<Step> {
        let mut download = Params::new();
        download.insert("url".to_string(), Value::from(self.url));
        download.insert("dest".to_string(), Value::from(self.archive.clone()));
        for key in VERIFICATION_KEYS {
            if let Some(value) = params.get(*key) {
                download.insert((*key).to_string(), value.clone());
            }
        }

        let extract = params::from_pairs([
            ("archive", Value::from(self.archive)),
            ("format", Value::from(self.format.name())),
            ("strip_dirs", Value::from(self.strip_dirs)),
        ]);

        let sources: Vec<Value> = self
            .binaries
            .iter()
            .map(|entry| Value::from(entry.src.clone()))
            .collect();
        let chmod = params::from_pairs([("files", Value::Array(sources))]);

        let outputs: Vec<Value> = self.binaries.iter().map(BinaryEntry::to_value).collect();
        let install = params::from_pairs([
            ("binaries", Value::Array(outputs)),
            ("install_mode", Value::from(self.install_mode.name())),
        ]);

        vec![
            Step::new(DOWNLOAD, download),
            Step::new(EXTRACT, extract),
            Step::new(super::fs_actions::CHMOD, chmod),
            Step::new(super::fs_actions::INSTALL_BINARIES, install),
        ]
    }
}

fn strip_dirs(action: &str, params: &Params, default: u32) -> Result<u32> {
    match params::get_int(params, "strip_dirs") {
        None => Ok(default),
        Some(n) if n < 0 => Err(Error::invalid_param(action, "strip_dirs", "must not be negative")),
        Some(n) => u32::try_from(n)
            .map_err(|_| Error::invalid_param(action, "strip_dirs", "out of range")),
    }
}

/// `archive_format` if given, otherwise inferred from the file name
fn archive_format(action: &str, params: &Params, file_name: &str) -> Result<ArchiveFormat> {
    match params::get_non_empty(params, "archive_format") {
        Some(name) => name
            .parse()
            .map_err(|_| Error::invalid_param(action, "archive_format", format!("unsupported format '{}'", name))),
        None => ArchiveFormat::from_file_name(file_name).ok_or_else(|| {
            Error::invalid_param(
                action,
                "archive_format",
                format!("cannot infer format from '{}'; set archive_format", file_name),
            )
        }),
    }
}

/// Template variables with the mapping tables applied
fn mapped_vars(ctx: &EvalContext, params: &Params) -> BTreeMap<String, String> {
    let mut vars = ctx.vars();
    let os = params::get_string_map(params, "os_mapping");
    let arch = params::get_string_map(params, "arch_mapping");
    vars.insert("os".to_string(), params::apply_mapping(&ctx.os, os.as_ref()));
    vars.insert("arch".to_string(), params::apply_mapping(&ctx.arch, arch.as_ref()));
    vars
}

// =============================================================================
// download_archive
// =============================================================================

struct DownloadArchiveParams<'a> {
    url: &'a str,
    strip_dirs: u32,
    binaries: Vec<BinaryEntry>,
    install_mode: InstallMode,
}

impl<'a> DownloadArchiveParams<'a> {
    fn parse(params: &'a Params) -> Result<Self> {
        let url = params::require_string(params, DOWNLOAD_ARCHIVE, "url")?;
        check_url_template(url)?;
        Ok(Self {
            url,
            strip_dirs: strip_dirs(DOWNLOAD_ARCHIVE, params, 0)?,
            binaries: binary_entries(DOWNLOAD_ARCHIVE, params)?,
            install_mode: InstallMode::from_params(DOWNLOAD_ARCHIVE, params)?,
        })
    }
}

/// Download, extract and install a release archive from a URL template
pub struct DownloadArchiveAction;

impl Action for DownloadArchiveAction {
    fn name(&self) -> &str {
        DOWNLOAD_ARCHIVE
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        execute_composite(DOWNLOAD_ARCHIVE, ctx, params)
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn requires_network(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        let mut result = preflight_from(DownloadArchiveParams::parse(params));
        if let Some(url) = params::get_non_empty(params, "url")
            && params::get_non_empty(params, "archive_format").is_none()
            && ArchiveFormat::from_file_name(url).is_none()
        {
            result.add_error(format!(
                "{}: cannot infer archive format from url; set archive_format",
                DOWNLOAD_ARCHIVE
            ));
        }
        Some(result)
    }

    fn as_decomposable(&self) -> Option<&dyn Decomposable> {
        Some(self)
    }
}

impl Decomposable for DownloadArchiveAction {
    fn decompose(&self, ctx: &EvalContext, params: &Params) -> Result<Vec<Step>> {
        let parsed = DownloadArchiveParams::parse(params)?;
        let url = params::expand_vars(parsed.url, &mapped_vars(ctx, params));
        let archive = url_file_name(&url);
        let format = archive_format(DOWNLOAD_ARCHIVE, params, &archive)?;

        Ok(ArchivePlan {
            url,
            archive,
            format,
            strip_dirs: parsed.strip_dirs,
            binaries: parsed.binaries,
            install_mode: parsed.install_mode,
        }
        .into_steps(params))
    }
}

// =============================================================================
// github_archive
// =============================================================================

/// `owner/name`, each part a plain identifier
fn is_valid_github_repo(repo: &str) -> bool {
    let Some((owner, name)) = repo.split_once('/') else {
        return false;
    };
    let part_ok = |s: &str| {
        !s.is_empty()
            && s.len() <= 100
            && s != "."
            && s != ".."
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    part_ok(owner) && part_ok(name)
}

struct GitHubArchiveParams<'a> {
    repo: &'a str,
    asset_pattern: &'a str,
    strip_dirs: u32,
    binaries: Vec<BinaryEntry>,
    install_mode: InstallMode,
}

impl<'a> GitHubArchiveParams<'a> {
    fn parse(params: &'a Params) -> Result<Self> {
        let repo = params::require_string(params, GITHUB_ARCHIVE, "repo")?;
        if !is_valid_github_repo(repo) {
            return Err(Error::invalid_param(GITHUB_ARCHIVE, "repo", format!("'{}' is not owner/name", repo)));
        }
        let asset_pattern = params::require_string(params, GITHUB_ARCHIVE, "asset_pattern")?;
        if asset_pattern.contains('/') || asset_pattern.contains("..") {
            return Err(Error::invalid_param(
                GITHUB_ARCHIVE,
                "asset_pattern",
                "must be a file name",
            ));
        }
        Ok(Self {
            repo,
            asset_pattern,
            strip_dirs: strip_dirs(GITHUB_ARCHIVE, params, 0)?,
            binaries: binary_entries(GITHUB_ARCHIVE, params)?,
            install_mode: InstallMode::from_params(GITHUB_ARCHIVE, params)?,
        })
    }
}

/// Install a GitHub release asset
pub struct GitHubArchiveAction;

impl Action for GitHubArchiveAction {
    fn name(&self) -> &str {
        GITHUB_ARCHIVE
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        execute_composite(GITHUB_ARCHIVE, ctx, params)
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn requires_network(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        Some(preflight_from(GitHubArchiveParams::parse(params)))
    }

    fn as_decomposable(&self) -> Option<&dyn Decomposable> {
        Some(self)
    }
}

impl Decomposable for GitHubArchiveAction {
    fn decompose(&self, ctx: &EvalContext, params: &Params) -> Result<Vec<Step>> {
        let parsed = GitHubArchiveParams::parse(params)?;
        let asset = params::expand_vars(parsed.asset_pattern, &mapped_vars(ctx, params));
        let format = archive_format(GITHUB_ARCHIVE, params, &asset)?;
        let url = format!(
            "https://github.com/{}/releases/download/{}/{}",
            parsed.repo, ctx.version_tag, asset
        );

        Ok(ArchivePlan {
            url,
            archive: asset,
            format,
            strip_dirs: parsed.strip_dirs,
            binaries: parsed.binaries,
            install_mode: parsed.install_mode,
        }
        .into_steps(params))
    }
}

// =============================================================================
// fossil_archive
// =============================================================================

/// Fossil check-in tag for a version
///
/// `version_separator` replaces the dots of the version, so `3.46.1` with
/// separator `-` and prefix `version-` becomes `version-3-46-1`.
pub fn fossil_tag(version: &str, tag_prefix: &str, separator: &str) -> String {
    let version = if separator == DEFAULT_VERSION_SEPARATOR {
        version.to_string()
    } else {
        version.replace('.', separator)
    };
    format!("{}{}", tag_prefix, version)
}

struct FossilArchiveParams<'a> {
    repo: &'a str,
    project_name: String,
    tag_prefix: &'a str,
    version_separator: &'a str,
    strip_dirs: u32,
    binaries: Vec<BinaryEntry>,
    install_mode: InstallMode,
}

impl<'a> FossilArchiveParams<'a> {
    fn parse(params: &'a Params) -> Result<Self> {
        let repo = params::require_string(params, FOSSIL_ARCHIVE, "repo")?;
        crate::download::require_https(repo)?;
        let repo = repo.trim_end_matches('/');

        let project_name = match params::get_non_empty(params, "project_name") {
            Some(name) => name.to_string(),
            None => url_file_name(repo),
        };
        if !security::is_valid_library_name(&project_name) {
            return Err(Error::invalid_param(
                FOSSIL_ARCHIVE,
                "project_name",
                format!("'{}' is not a valid project name", project_name),
            ));
        }

        // strip_dirs = 0 would leave the tarball's top-level directory in place
        let strip_dirs = match strip_dirs(FOSSIL_ARCHIVE, params, 1)? {
            0 => 1,
            n => n,
        };

        Ok(Self {
            repo,
            project_name,
            tag_prefix: params::get_string(params, "tag_prefix").unwrap_or(DEFAULT_TAG_PREFIX),
            version_separator: params::get_non_empty(params, "version_separator")
                .unwrap_or(DEFAULT_VERSION_SEPARATOR),
            strip_dirs,
            binaries: binary_entries(FOSSIL_ARCHIVE, params)?,
            install_mode: InstallMode::from_params(FOSSIL_ARCHIVE, params)?,
        })
    }
}

/// Install from a Fossil repository's release tarball
pub struct FossilArchiveAction;

impl Action for FossilArchiveAction {
    fn name(&self) -> &str {
        FOSSIL_ARCHIVE
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        execute_composite(FOSSIL_ARCHIVE, ctx, params)
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn requires_network(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        Some(preflight_from(FossilArchiveParams::parse(params)))
    }

    fn as_decomposable(&self) -> Option<&dyn Decomposable> {
        Some(self)
    }
}

impl Decomposable for FossilArchiveAction {
    fn decompose(&self, ctx: &EvalContext, params: &Params) -> Result<Vec<Step>> {
        let parsed = FossilArchiveParams::parse(params)?;
        let tag = fossil_tag(&ctx.version, parsed.tag_prefix, parsed.version_separator);
        let archive = format!("{}.tar.gz", parsed.project_name);
        let url = format!("{}/tarball/{}/{}", parsed.repo, tag, archive);
        debug!("Fossil tarball for {}: {}", ctx.version, url);

        Ok(ArchivePlan {
            url,
            archive,
            format: ArchiveFormat::TarGz,
            strip_dirs: parsed.strip_dirs,
            binaries: parsed.binaries,
            install_mode: parsed.install_mode,
        }
        .into_steps(params))
    }
}

// =============================================================================
// extract
// =============================================================================

/// What to take out of an archive and where to put it
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Leading path components dropped from every entry
    pub strip_dirs: u32,
    /// When non-empty, only these (post-strip) paths are extracted
    pub files: HashSet<PathBuf>,
}

/// Entry path after stripping, or `None` if nothing is left
fn strip_entry_path(raw: &Path, strip_dirs: u32) -> Result<Option<PathBuf>> {
    let mut parts = Vec::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal(format!(
                    "archive entry escapes destination: {}",
                    raw.display()
                )));
            }
        }
    }
    let strip = strip_dirs as usize;
    if parts.len() <= strip {
        return Ok(None);
    }
    Ok(Some(parts[strip..].iter().collect()))
}

/// Replace `link` with a symlink to `target` via rename
fn atomic_symlink(target: &Path, link: &Path) -> io::Result<()> {
    let name = link
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = link.with_file_name(format!(".{}.tsuku-link", name));
    let _ = fs::remove_file(&temp);
    std::os::unix::fs::symlink(target, &temp)?;
    fs::rename(&temp, link).inspect_err(|_| {
        let _ = fs::remove_file(&temp);
    })
}

/// Create `dir` and make sure it did not resolve through a symlink out of `root`
fn create_parent(dir: &Path, root: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .map_err(|e| Error::IoError(format!("Failed to create {}: {}", dir.display(), e)))?;
    let resolved = fs::canonicalize(dir)?;
    if !resolved.starts_with(root) {
        return Err(Error::PathTraversal(format!(
            "{} resolves outside the extraction directory",
            dir.display()
        )));
    }
    Ok(())
}

fn detect_format(archive: &Path) -> Result<ArchiveFormat> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some(format) = ArchiveFormat::from_file_name(&name) {
        return Ok(format);
    }
    let mut magic = [0u8; 6];
    let mut file = File::open(archive)?;
    let n = file.read(&mut magic)?;
    Ok(ArchiveFormat::from_magic_bytes(&magic[..n]))
}

/// Unpack `archive` into `dest`, returning the number of entries written
pub fn extract_archive(
    archive: &Path,
    dest: &Path,
    format: ArchiveFormat,
    options: &ExtractOptions,
    cancel: &CancelToken,
) -> Result<usize> {
    fs::create_dir_all(dest)?;
    let root = fs::canonicalize(dest)?;

    let file = File::open(archive)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {}", archive.display(), e)))?;
    let mut tar = tar::Archive::new(format.decoder(BufReader::new(file))?);
    let mut written = 0;
    let mut links = Vec::new();

    let entries = tar
        .entries()
        .map_err(|e| Error::ParseError(format!("Failed to read {}: {}", archive.display(), e)))?;
    for entry in entries {
        cancel.check()?;
        let mut entry =
            entry.map_err(|e| Error::ParseError(format!("Failed to read tar entry: {}", e)))?;
        let raw = entry
            .path()
            .map_err(|e| Error::ParseError(format!("Invalid tar entry path: {}", e)))?
            .into_owned();

        let Some(relative) = strip_entry_path(&raw, options.strip_dirs)? else {
            continue;
        };
        if !options.files.is_empty() && !options.files.contains(&relative) {
            continue;
        }

        let target = root.join(&relative);
        if !security::is_path_within(&target, &root) {
            return Err(Error::PathTraversal(format!(
                "archive entry escapes destination: {}",
                raw.display()
            )));
        }
        let parent = target.parent().unwrap_or(&root);

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            create_parent(&target, &root)?;
        } else if entry_type.is_file() {
            create_parent(parent, &root)?;
            if target.is_symlink() {
                fs::remove_file(&target)?;
            }
            let mut out = File::create(&target)
                .map_err(|e| Error::IoError(format!("Failed to create {}: {}", target.display(), e)))?;
            io::copy(&mut entry, &mut out)
                .map_err(|e| Error::IoError(format!("Failed to write {}: {}", target.display(), e)))?;
            // setuid, setgid and sticky bits are dropped
            let mode = entry.header().mode().unwrap_or(0o644) & 0o777;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        } else if entry_type.is_symlink() {
            let link_target = entry
                .link_name()
                .map_err(|e| Error::ParseError(format!("Invalid symlink in archive: {}", e)))?
                .ok_or_else(|| Error::ParseError(format!("symlink {} has no target", raw.display())))?
                .into_owned();
            security::validate_symlink_target(&link_target, &target, &root)?;
            create_parent(parent, &root)?;
            security::resolve_symlink_target(&link_target, &fs::canonicalize(parent)?, &root)?;
            atomic_symlink(&link_target, &target)?;
            links.push(target.clone());
        } else if entry_type.is_hard_link() {
            let link_name = entry
                .link_name()
                .map_err(|e| Error::ParseError(format!("Invalid hard link in archive: {}", e)))?
                .ok_or_else(|| Error::ParseError(format!("hard link {} has no target", raw.display())))?
                .into_owned();
            let Some(source) = strip_entry_path(&link_name, options.strip_dirs)? else {
                continue;
            };
            let source = fs::canonicalize(root.join(&source)).map_err(|e| {
                Error::IoError(format!("hard link {} has no source {}: {}", raw.display(), source.display(), e))
            })?;
            if !source.starts_with(&root) || !source.is_file() {
                return Err(Error::PathTraversal(format!(
                    "hard link {} resolves outside the extraction directory",
                    raw.display()
                )));
            }
            create_parent(parent, &root)?;
            if target.is_symlink() {
                fs::remove_file(&target)?;
            }
            fs::copy(&source, &target).map_err(|e| {
                Error::IoError(format!("Failed to link {}: {}", target.display(), e))
            })?;
        } else {
            debug!("Skipping {:?} entry {}", entry_type, raw.display());
            continue;
        }
        written += 1;
    }

    // A later entry can change what an earlier link resolves through
    for link in &links {
        if let Ok(real) = fs::canonicalize(link)
            && !real.starts_with(&root)
        {
            let _ = fs::remove_file(link);
            return Err(Error::PathTraversal(format!(
                "{} resolves outside the extraction directory",
                link.display()
            )));
        }
    }

    Ok(written)
}

struct ExtractParams {
    archive: PathBuf,
    format: Option<ArchiveFormat>,
    dest: PathBuf,
    options: ExtractOptions,
}

impl ExtractParams {
    fn parse(params: &Params) -> Result<Self> {
        let archive = security::validate_relative_path(params::require_string(params, EXTRACT, "archive")?)?;
        let format = match params::get_non_empty(params, "format") {
            None | Some("auto") => None,
            Some(name) => Some(
                name.parse()
                    .map_err(|_| Error::invalid_param(EXTRACT, "format", format!("unsupported format '{}'", name)))?,
            ),
        };
        let dest = match params::get_non_empty(params, "dest") {
            None | Some(".") => PathBuf::new(),
            Some(dest) => security::validate_relative_path(dest)?,
        };
        let files = match params::get_string_slice(params, "files") {
            Some(files) => files
                .iter()
                .map(|f| security::validate_relative_path(f))
                .collect::<Result<HashSet<_>>>()?,
            None if params::has(params, "files") => {
                return Err(Error::invalid_param(EXTRACT, "files", "must be a list of paths"));
            }
            None => HashSet::new(),
        };

        Ok(Self {
            archive,
            format,
            dest,
            options: ExtractOptions {
                strip_dirs: strip_dirs(EXTRACT, params, 0)?,
                files,
            },
        })
    }
}

/// Unpack a tarball inside the work directory
pub struct ExtractAction;

impl Action for ExtractAction {
    fn name(&self) -> &str {
        EXTRACT
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let parsed = ExtractParams::parse(params)?;
        let archive = ctx.work_dir.join(&parsed.archive);
        let dest = ctx.work_dir.join(&parsed.dest);
        let format = match parsed.format {
            Some(format) => format,
            None => detect_format(&archive)?,
        };

        let count = extract_archive(&archive, &dest, format, &parsed.options, &ctx.cancel)?;
        info!(
            "Extracted {} entries from {} ({})",
            count,
            parsed.archive.display(),
            format
        );
        Ok(())
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        Some(preflight_from(ExtractParams::parse(params)))
    }
}
