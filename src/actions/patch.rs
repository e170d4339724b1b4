// src/actions/patch.rs

//! Source patches
//!
//! `apply_patch` takes a patch either from a URL or inline. A remote patch
//! becomes a `download` step (so its checksum is pinned in the plan) followed
//! by `apply_patch_file`; an inline patch becomes `apply_patch_file` alone.

use super::download::DOWNLOAD;
use super::{
    Action, Decomposable, EvalContext, ExecutionContext, PreflightResult, Step, execute_composite,
    preflight_from,
};
use crate::download::{require_https, url_file_name};
use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use crate::params::{self, Params};
use crate::process;
use crate::security;
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use tempfile::NamedTempFile;
use tracing::{debug, info};

pub const APPLY_PATCH: &str = "apply_patch";
pub const APPLY_PATCH_FILE: &str = "apply_patch_file";

/// Directory under the work dir that downloaded patches land in
const PATCH_DIR: &str = "patches";

const DEFAULT_STRIP: i64 = 1;

/// Which of two mutually exclusive parameters was given
enum Choice<'a> {
    First(&'a str),
    Second(&'a str),
}

enum RemoteOrInline<'a> {
    Remote(&'a str),
    Inline(&'a str),
}

enum FileOrInline<'a> {
    File(PathBuf),
    Inline(&'a str),
}

/// `-p` level, default 1
fn strip_level(action: &str, params: &Params) -> Result<u32> {
    let strip = params::get_int(params, "strip").unwrap_or(DEFAULT_STRIP);
    u32::try_from(strip)
        .map_err(|_| Error::invalid_param(action, "strip", format!("invalid strip level {}", strip)))
}

/// Optional subdirectory of the work dir to run `patch` in
fn subdir(action: &str, params: &Params) -> Result<Option<PathBuf>> {
    match params::get_non_empty(params, "subdir") {
        None => Ok(None),
        Some(dir) => security::validate_relative_path(dir)
            .map(Some)
            .map_err(|e| Error::invalid_param(action, "subdir", e.to_string())),
    }
}

/// Exactly one of two keys; distinct errors for both and neither
fn exclusive<'a>(
    action: &str,
    params: &'a Params,
    first: &str,
    second: &str,
) -> Result<Choice<'a>> {
    let a = params::get_non_empty(params, first);
    let b = params::get_non_empty(params, second);
    match (a, b) {
        (Some(_), Some(_)) => Err(Error::conflict(
            action,
            format!("cannot specify both '{}' and '{}'", first, second),
        )),
        (Some(value), None) => Ok(Choice::First(value)),
        (None, Some(value)) => Ok(Choice::Second(value)),
        (None, None) => Err(Error::conflict(
            action,
            format!("either '{}' or '{}' parameter is required", first, second),
        )),
    }
}

struct ApplyPatchParams<'a> {
    source: RemoteOrInline<'a>,
    sha256: Option<String>,
    strip: u32,
    subdir: Option<PathBuf>,
}

impl<'a> ApplyPatchParams<'a> {
    fn parse(params: &'a Params) -> Result<Self> {
        let source = match exclusive(APPLY_PATCH, params, "url", "data")? {
            Choice::First(url) => {
                require_https(url)?;
                RemoteOrInline::Remote(url)
            }
            Choice::Second(data) => RemoteOrInline::Inline(data),
        };

        let sha256 = match params::get_non_empty(params, "sha256") {
            Some(raw) if hash::is_valid_checksum(raw, HashAlgorithm::Sha256) => {
                Some(hash::normalize_checksum(raw))
            }
            Some(_) => {
                return Err(Error::invalid_param(APPLY_PATCH, "sha256", "expected 64 hex digits"));
            }
            None => None,
        };

        Ok(Self {
            source,
            sha256,
            strip: strip_level(APPLY_PATCH, params)?,
            subdir: subdir(APPLY_PATCH, params)?,
        })
    }
}

fn apply_file_params(strip: u32, subdir: &Option<PathBuf>) -> Params {
    let mut out = params::from_pairs([("strip", Value::from(strip))]);
    if let Some(dir) = subdir {
        out.insert("subdir".to_string(), Value::from(dir.to_string_lossy().into_owned()));
    }
    out
}

/// Apply a patch from a URL or inline data (composite)
pub struct ApplyPatchAction;

impl Action for ApplyPatchAction {
    fn name(&self) -> &str {
        APPLY_PATCH
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        execute_composite(APPLY_PATCH, ctx, params)
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        let mut result = preflight_from(ApplyPatchParams::parse(params));
        if params::get_non_empty(params, "url").is_some()
            && params::get_non_empty(params, "sha256").is_none()
        {
            result.add_warning("remote patch has no sha256; it will be pinned at plan time");
        }
        Some(result)
    }

    fn as_decomposable(&self) -> Option<&dyn Decomposable> {
        Some(self)
    }
}

impl Decomposable for ApplyPatchAction {
    fn decompose(&self, _ctx: &EvalContext, params: &Params) -> Result<Vec<Step>> {
        let parsed = ApplyPatchParams::parse(params)?;
        let mut apply = apply_file_params(parsed.strip, &parsed.subdir);

        match parsed.source {
            RemoteOrInline::Remote(url) => {
                let file = format!("{}/{}", PATCH_DIR, url_file_name(url));
                let mut download = params::from_pairs([
                    ("url", Value::from(url)),
                    ("dest", Value::from(file.clone())),
                ]);
                if let Some(sha256) = parsed.sha256 {
                    download.insert("checksum".to_string(), Value::from(sha256));
                }
                apply.insert("file".to_string(), Value::from(file));
                Ok(vec![
                    Step::new(DOWNLOAD, download),
                    Step::new(APPLY_PATCH_FILE, apply),
                ])
            }
            RemoteOrInline::Inline(data) => {
                apply.insert("data".to_string(), Value::from(data));
                Ok(vec![Step::new(APPLY_PATCH_FILE, apply)])
            }
        }
    }
}

struct ApplyPatchFileParams<'a> {
    source: FileOrInline<'a>,
    strip: u32,
    subdir: Option<PathBuf>,
}

impl<'a> ApplyPatchFileParams<'a> {
    fn parse(params: &'a Params) -> Result<Self> {
        let source = match exclusive(APPLY_PATCH_FILE, params, "file", "data")? {
            Choice::First(file) => FileOrInline::File(security::validate_relative_path(file)?),
            Choice::Second(data) => FileOrInline::Inline(data),
        };
        Ok(Self {
            source,
            strip: strip_level(APPLY_PATCH_FILE, params)?,
            subdir: subdir(APPLY_PATCH_FILE, params)?,
        })
    }
}

/// Run `patch` against the work directory (primitive)
pub struct ApplyPatchFileAction;

impl Action for ApplyPatchFileAction {
    fn name(&self) -> &str {
        APPLY_PATCH_FILE
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let parsed = ApplyPatchFileParams::parse(params)?;
        let dir = match &parsed.subdir {
            Some(subdir) => ctx.work_dir.join(subdir),
            None => ctx.work_dir.clone(),
        };
        if !dir.is_dir() {
            return Err(Error::NotFoundError(format!(
                "patch directory {} does not exist",
                dir.display()
            )));
        }

        // Inline data goes through a temp file so the patch never meets a shell
        let mut inline = None;
        let patch_path = match &parsed.source {
            FileOrInline::File(file) => ctx.work_dir.join(file),
            FileOrInline::Inline(data) => {
                let mut temp = NamedTempFile::new_in(&ctx.work_dir)?;
                temp.write_all(data.as_bytes())?;
                temp.flush()?;
                let path = temp.path().to_path_buf();
                inline = Some(temp);
                path
            }
        };
        if !patch_path.is_file() {
            return Err(Error::NotFoundError(format!(
                "patch file {} does not exist",
                patch_path.display()
            )));
        }

        let patch = which::which("patch").map_err(|_| Error::ToolNotFound("patch".to_string()))?;
        let mut cmd = Command::new(patch);
        cmd.arg(format!("-p{}", parsed.strip))
            .arg("--batch")
            .arg("--forward")
            .arg("-i")
            .arg(&patch_path)
            .current_dir(&dir);

        let output = process::run_command(cmd, &ctx.cancel)?;
        drop(inline);
        info!("Applied patch in {}", dir.display());
        debug!("patch output: {}", output.output.trim());
        Ok(())
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        Some(preflight_from(ApplyPatchFileParams::parse(params)))
    }
}
