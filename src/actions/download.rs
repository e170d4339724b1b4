// src/actions/download.rs

//! `download` and `download_file`
//!
//! `download` is what recipes write: a URL template, optional platform
//! mappings, and some way to verify the artifact. It decomposes into a
//! single `download_file` whose checksum is pinned at plan time, so the plan
//! replays offline and byte-for-byte.
//!
//! Verification modes, in order of preference:
//!
//! - static `checksum` in the recipe
//! - `checksum_url` pointing at a published checksum file
//! - `signature_url` + `signature_key_url` + `signature_key_fingerprint`
//!   (all three, and never together with `checksum_url`)
//!
//! A download with none of these is allowed but warned about, unless the
//! recipe states a `skip_verification_reason`.

use super::{
    Action, Decomposable, EvalContext, ExecutionContext, PreflightResult, Step, execute_composite,
    preflight_from,
};
use crate::download::{MAX_SMALL_RESPONSE, require_https, url_file_name};
use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use crate::params::{self, Params};
use crate::security;
use crate::signature;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub const DOWNLOAD: &str = "download";
pub const DOWNLOAD_FILE: &str = "download_file";

const SIGNATURE_KEYS: [&str; 3] = [
    "signature_url",
    "signature_key_url",
    "signature_key_fingerprint",
];

/// Detached-signature verification parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SignatureParams {
    pub url: String,
    pub key_url: String,
    /// Normalized 40-digit fingerprint
    pub fingerprint: String,
}

impl SignatureParams {
    fn expand(&self, vars: &BTreeMap<String, String>) -> Self {
        Self {
            url: params::expand_vars(&self.url, vars),
            key_url: params::expand_vars(&self.key_url, vars),
            fingerprint: self.fingerprint.clone(),
        }
    }

    fn write_to(&self, out: &mut Params) {
        out.insert("signature_url".to_string(), Value::from(self.url.clone()));
        out.insert("signature_key_url".to_string(), Value::from(self.key_url.clone()));
        out.insert(
            "signature_key_fingerprint".to_string(),
            Value::from(self.fingerprint.clone()),
        );
    }
}

/// All three signature params or none
pub(crate) fn signature_params(action: &str, params: &Params) -> Result<Option<SignatureParams>> {
    let present: Vec<&str> = SIGNATURE_KEYS
        .iter()
        .copied()
        .filter(|key| params::get_non_empty(params, key).is_some())
        .collect();

    if present.is_empty() {
        return Ok(None);
    }
    if present.len() < SIGNATURE_KEYS.len() {
        let missing: Vec<&str> = SIGNATURE_KEYS
            .iter()
            .copied()
            .filter(|key| !present.contains(key))
            .collect();
        return Err(Error::conflict(
            action,
            format!(
                "signature verification requires all of signature_url, signature_key_url and signature_key_fingerprint (missing: {})",
                missing.join(", ")
            ),
        ));
    }

    let url = params::require_string(params, action, "signature_url")?;
    let key_url = params::require_string(params, action, "signature_key_url")?;
    let fingerprint = params::require_string(params, action, "signature_key_fingerprint")?;
    check_url_template(url)?;
    check_url_template(key_url)?;

    Ok(Some(SignatureParams {
        url: url.to_string(),
        key_url: key_url.to_string(),
        fingerprint: signature::parse_fingerprint(fingerprint)?,
    }))
}

/// `checksum_algo`, defaulting to sha256
pub(crate) fn checksum_algorithm(action: &str, params: &Params) -> Result<HashAlgorithm> {
    match params::get_non_empty(params, "checksum_algo") {
        None => Ok(HashAlgorithm::Sha256),
        Some(name) => name
            .parse()
            .map_err(|_| Error::invalid_param(action, "checksum_algo", format!("'{}' is not sha256 or sha512", name))),
    }
}

/// A URL template must already be https before placeholders are filled in
pub(crate) fn check_url_template(url: &str) -> Result<()> {
    if url.get(..8).is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://")) {
        Ok(())
    } else {
        Err(Error::InsecureUrl(url.to_string()))
    }
}

/// Static checksum, normalized and shape-checked against the algorithm
fn static_checksum(action: &str, params: &Params, algorithm: HashAlgorithm) -> Result<Option<String>> {
    let Some(raw) = params::get_non_empty(params, "checksum") else {
        return Ok(None);
    };
    let checksum = hash::normalize_checksum(raw);
    if hash::is_valid_checksum(&checksum, algorithm) {
        Ok(Some(checksum))
    } else {
        Err(Error::invalid_param(
            action,
            "checksum",
            format!("expected {} hex digits for {}", algorithm.hex_len(), algorithm),
        ))
    }
}

fn checksum_url(params: &Params) -> Result<Option<&str>> {
    match params::get_non_empty(params, "checksum_url") {
        Some(url) => {
            check_url_template(url)?;
            Ok(Some(url))
        }
        None => Ok(None),
    }
}

fn check_exclusive_modes(action: &str, params: &Params) -> Result<()> {
    if params::get_non_empty(params, "checksum_url").is_some()
        && params::get_non_empty(params, "signature_url").is_some()
    {
        return Err(Error::conflict(
            action,
            "signature_url and checksum_url are mutually exclusive",
        ));
    }
    Ok(())
}

/// Relative `dest`, if given
fn dest_template<'a>(params: &'a Params) -> Result<Option<&'a str>> {
    match params::get_non_empty(params, "dest") {
        Some(dest) => {
            security::validate_relative_path(dest)?;
            Ok(Some(dest))
        }
        None => Ok(None),
    }
}

/// Parameters of a `download` step
struct DownloadParams<'a> {
    url: &'a str,
    dest: Option<&'a str>,
    checksum: Option<String>,
    checksum_url: Option<&'a str>,
    algorithm: HashAlgorithm,
    signature: Option<SignatureParams>,
}

impl<'a> DownloadParams<'a> {
    fn parse(params: &'a Params) -> Result<Self> {
        let url = params::require_string(params, DOWNLOAD, "url")?;
        check_url_template(url)?;
        let algorithm = checksum_algorithm(DOWNLOAD, params)?;
        check_exclusive_modes(DOWNLOAD, params)?;
        Ok(Self {
            url,
            dest: dest_template(params)?,
            checksum: static_checksum(DOWNLOAD, params, algorithm)?,
            checksum_url: checksum_url(params)?,
            algorithm,
            signature: signature_params(DOWNLOAD, params)?,
        })
    }
}

/// Template variables with `os_mapping` / `arch_mapping` applied
fn template_vars(ctx: &EvalContext, params: &Params) -> BTreeMap<String, String> {
    let mut vars = ctx.vars();
    let os_mapping = params::get_string_map(params, "os_mapping");
    let arch_mapping = params::get_string_map(params, "arch_mapping");
    vars.insert("os".to_string(), params::apply_mapping(&ctx.os, os_mapping.as_ref()));
    vars.insert("arch".to_string(), params::apply_mapping(&ctx.arch, arch_mapping.as_ref()));
    vars
}

/// Fetch the artifact at plan time and compute the checksum to pin
///
/// With a published checksum file, the computed digest must agree with it.
/// Without a downloader nothing is pinned and `download_file` verifies
/// against `checksum_url` when it runs.
fn pin_checksum(
    ctx: &EvalContext,
    parsed: &DownloadParams<'_>,
    url: &str,
    checksum_url: Option<&str>,
) -> Result<Option<(String, Option<u64>)>> {
    if let Some(checksum) = &parsed.checksum {
        return Ok(Some((checksum.clone(), None)));
    }
    let Some(downloader) = &ctx.downloader else {
        debug!("No downloader available, leaving checksum of {} unpinned", url);
        return Ok(None);
    };

    let fetched = downloader.download(&ctx.cancel, url)?;
    let digest = match parsed.algorithm {
        HashAlgorithm::Sha256 => fetched.checksum.clone(),
        other => hash::hash_file(other, &fetched.path)?,
    };

    if let Some(checksum_url) = checksum_url {
        let published = downloader.download(&ctx.cancel, checksum_url)?;
        let content = std::fs::read_to_string(&published.path).map_err(|e| {
            Error::IoError(format!("Failed to read checksum file from {}: {}", checksum_url, e))
        })?;
        let expected = hash::normalize_checksum(&hash::parse_checksum_file(
            &content,
            Some(&url_file_name(url)),
        )?);
        if expected != digest {
            return Err(Error::ChecksumMismatch {
                expected,
                actual: digest,
            });
        }
        debug!("Published checksum for {} matches", url);
    }

    if let Some(cache) = &ctx.download_cache
        && let Err(e) = cache.put(parsed.algorithm, &digest, &fetched.path, url)
    {
        warn!("Failed to cache {}: {}", url, e);
    }

    Ok(Some((digest, Some(fetched.size))))
}

/// Fetch a URL template with verification (composite)
pub struct DownloadAction;

impl Action for DownloadAction {
    fn name(&self) -> &str {
        DOWNLOAD
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        execute_composite(DOWNLOAD, ctx, params)
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn requires_network(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        let mut result = PreflightResult::new();

        match params::require_string(params, DOWNLOAD, "url") {
            Err(e) => result.add_error(e.to_string()),
            Ok(url) => {
                if let Err(e) = check_url_template(url) {
                    result.add_error(e.to_string());
                }
                if !url.contains('{') {
                    result.add_warning(
                        "url contains no placeholders; consider download_file for a fixed URL",
                    );
                }
                for (key, placeholder) in [("os_mapping", "{os}"), ("arch_mapping", "{arch}")] {
                    if params::has(params, key) && !url.contains(placeholder) {
                        result.add_warning(format!(
                            "{} is set but url does not contain {}",
                            key, placeholder
                        ));
                    }
                }
            }
        }

        let algorithm = checksum_algorithm(DOWNLOAD, params);
        if let Err(e) = &algorithm {
            result.add_error(e.to_string());
        }
        if let Err(e) = static_checksum(DOWNLOAD, params, algorithm.unwrap_or_default()) {
            result.add_error(e.to_string());
        }
        if let Err(e) = checksum_url(params) {
            result.add_error(e.to_string());
        }
        if let Err(e) = check_exclusive_modes(DOWNLOAD, params) {
            result.add_error(e.to_string());
        }
        if let Err(e) = signature_params(DOWNLOAD, params) {
            result.add_error(e.to_string());
        }
        if let Err(e) = dest_template(params) {
            result.add_error(e.to_string());
        }

        let verified = ["checksum", "checksum_url", "signature_url"]
            .iter()
            .any(|key| params::get_non_empty(params, key).is_some());
        if !verified && params::get_non_empty(params, "skip_verification_reason").is_none() {
            result.add_warning(
                "no checksum_url or signature configured; the artifact is only pinned at plan time (set skip_verification_reason to acknowledge)",
            );
        }

        Some(result)
    }

    fn as_decomposable(&self) -> Option<&dyn Decomposable> {
        Some(self)
    }
}

impl Decomposable for DownloadAction {
    fn decompose(&self, ctx: &EvalContext, params: &Params) -> Result<Vec<Step>> {
        let parsed = DownloadParams::parse(params)?;
        let vars = template_vars(ctx, params);

        let url = params::expand_vars(parsed.url, &vars);
        require_https(&url)?;
        let dest = match parsed.dest {
            Some(dest) => params::expand_vars(dest, &vars),
            None => url_file_name(&url),
        };
        security::validate_relative_path(&dest)?;
        let checksum_url = parsed
            .checksum_url
            .map(|template| params::expand_vars(template, &vars));
        if let Some(checksum_url) = &checksum_url {
            require_https(checksum_url)?;
        }

        let pinned = pin_checksum(ctx, &parsed, &url, checksum_url.as_deref())?;

        let mut out = Params::new();
        out.insert("url".to_string(), Value::from(url.clone()));
        out.insert("dest".to_string(), Value::from(dest));
        out.insert(
            "checksum_algo".to_string(),
            Value::from(parsed.algorithm.name()),
        );
        match (&pinned, checksum_url) {
            (Some((checksum, _)), _) => {
                out.insert("checksum".to_string(), Value::from(checksum.clone()));
            }
            (None, Some(checksum_url)) => {
                out.insert("checksum_url".to_string(), Value::from(checksum_url));
            }
            (None, None) => {
                return Err(Error::DownloadError(format!(
                    "cannot pin a checksum for {} without a downloader, checksum or checksum_url",
                    url
                )));
            }
        }
        if let Some(signature) = &parsed.signature {
            let signature = signature.expand(&vars);
            require_https(&signature.url)?;
            require_https(&signature.key_url)?;
            signature.write_to(&mut out);
        }

        let step = Step::new(DOWNLOAD_FILE, out);
        Ok(vec![match pinned {
            Some((checksum, size)) => step.with_checksum(checksum, size),
            None => step,
        }])
    }
}

/// Parameters of a `download_file` step
struct DownloadFileParams {
    url: String,
    dest: PathBuf,
    checksum: Option<String>,
    checksum_url: Option<String>,
    algorithm: HashAlgorithm,
    size: Option<u64>,
    signature: Option<SignatureParams>,
}

impl DownloadFileParams {
    fn parse(params: &Params) -> Result<Self> {
        let url = params::require_string(params, DOWNLOAD_FILE, "url")?;
        require_https(url)?;
        let algorithm = checksum_algorithm(DOWNLOAD_FILE, params)?;
        check_exclusive_modes(DOWNLOAD_FILE, params)?;
        let checksum = static_checksum(DOWNLOAD_FILE, params, algorithm)?;
        let checksum_url = match params::get_non_empty(params, "checksum_url") {
            Some(checksum_url) => {
                require_https(checksum_url)?;
                Some(checksum_url.to_string())
            }
            None => None,
        };
        if checksum.is_none() && checksum_url.is_none() {
            return Err(Error::missing_param(DOWNLOAD_FILE, "checksum"));
        }

        let dest = match params::get_non_empty(params, "dest") {
            Some(dest) => security::validate_relative_path(dest)?,
            None => security::validate_relative_path(&url_file_name(url))?,
        };
        let size = match params::get_int(params, "size") {
            Some(n) if n < 0 => {
                return Err(Error::invalid_param(DOWNLOAD_FILE, "size", "must not be negative"));
            }
            Some(n) => Some(n as u64),
            None => None,
        };

        Ok(Self {
            url: url.to_string(),
            dest,
            checksum,
            checksum_url,
            algorithm,
            size,
            signature: signature_params(DOWNLOAD_FILE, params)?,
        })
    }
}

/// Fetch one URL and verify it against a known checksum (primitive)
pub struct DownloadFileAction;

impl Action for DownloadFileAction {
    fn name(&self) -> &str {
        DOWNLOAD_FILE
    }

    fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let parsed = DownloadFileParams::parse(params)?;
        let dest = ctx.work_dir.join(&parsed.dest);

        let expected = match (&parsed.checksum, &parsed.checksum_url) {
            (Some(checksum), _) => checksum.clone(),
            (None, Some(checksum_url)) => {
                let content =
                    ctx.downloader
                        .fetch_string(&ctx.cancel, checksum_url, MAX_SMALL_RESPONSE)?;
                hash::parse_checksum_file(&content, Some(&url_file_name(&parsed.url)))?
            }
            (None, None) => return Err(Error::missing_param(DOWNLOAD_FILE, "checksum")),
        };

        let written = ctx.downloader.download_verified(
            &ctx.cancel,
            &parsed.url,
            &dest,
            &expected,
            parsed.algorithm,
        )?;

        if let Some(size) = parsed.size
            && size != written
        {
            return Err(Error::DownloadError(format!(
                "size mismatch for {}: expected {} bytes, got {}",
                parsed.url, size, written
            )));
        }

        if let Some(signature) = &parsed.signature {
            ctx.key_cache.verify_file(
                &ctx.cancel,
                &dest,
                &signature.url,
                &signature.key_url,
                &signature.fingerprint,
            )?;
        }

        info!("Downloaded {} ({} bytes)", parsed.dest.display(), written);
        Ok(())
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn requires_network(&self) -> bool {
        true
    }

    fn preflight(&self, params: &Params) -> Option<PreflightResult> {
        Some(preflight_from(DownloadFileParams::parse(params)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{DownloadResult, Downloader};
    use crate::cancel::CancelToken;
    use crate::platform::Target;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FP: &str = "ABCD1234ABCD1234ABCD1234ABCD1234ABCD1234";

    /// Serves fixed bodies by URL from a temp dir
    struct FakeDownloader {
        bodies: HashMap<String, Vec<u8>>,
        calls: AtomicUsize,
    }

    impl FakeDownloader {
        fn new(pairs: &[(&str, &[u8])]) -> Arc<Self> {
            Arc::new(Self {
                bodies: pairs
                    .iter()
                    .map(|(url, body)| (url.to_string(), body.to_vec()))
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Downloader for FakeDownloader {
        fn download(&self, _cancel: &CancelToken, url: &str) -> Result<DownloadResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = self
                .bodies
                .get(url)
                .ok_or_else(|| Error::HttpStatus { status: 404, url: url.to_string() })?;
            let dir = tempfile::tempdir()?;
            let path = dir.path().join(url_file_name(url));
            std::fs::write(&path, body)?;
            Ok(DownloadResult::new(path, hash::sha256(body), body.len() as u64).with_guard(dir))
        }
    }

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    fn ctx() -> EvalContext {
        EvalContext::new("1.2.3", "v1.2.3", &Target::new("darwin", "arm64"))
    }

    #[test]
    fn test_decompose_pins_checksum_via_downloader() {
        let url = "https://example.com/tool-1.2.3-macos-aarch64.tar.gz";
        let fake = FakeDownloader::new(&[(url, b"artifact")]);
        let ctx = ctx().with_downloader(fake.clone());

        let p = params(json!({
            "url": "https://example.com/tool-{version}-{os}-{arch}.tar.gz",
            "os_mapping": {"darwin": "macos"},
            "arch_mapping": {"arm64": "aarch64"},
        }));
        let steps = DownloadAction.decompose(&ctx, &p).unwrap();

        assert_eq!(steps.len(), 1);
        let step = &steps[0];
        assert_eq!(step.action, DOWNLOAD_FILE);
        assert_eq!(params::get_string(&step.params, "url"), Some(url));
        assert_eq!(
            params::get_string(&step.params, "dest"),
            Some("tool-1.2.3-macos-aarch64.tar.gz")
        );
        assert_eq!(step.checksum.as_deref(), Some(hash::sha256(b"artifact").as_str()));
        assert_eq!(step.size, Some(8));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_decompose_is_deterministic() {
        let url = "https://example.com/tool-1.2.3.tgz";
        let fake = FakeDownloader::new(&[(url, b"same bytes")]);
        let ctx = ctx().with_downloader(fake);
        let p = params(json!({"url": "https://example.com/tool-{version}.tgz"}));

        let first = DownloadAction.decompose(&ctx, &p).unwrap();
        let second = DownloadAction.decompose(&ctx, &p).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_static_checksum_skips_download() {
        let fake = FakeDownloader::new(&[]);
        let ctx = ctx().with_downloader(fake.clone());
        let checksum = "a".repeat(64);
        let p = params(json!({
            "url": "https://example.com/tool-{version}.tgz",
            "checksum": checksum.to_uppercase(),
        }));

        let steps = DownloadAction.decompose(&ctx, &p).unwrap();
        assert_eq!(steps[0].checksum.as_deref(), Some(checksum.as_str()));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_checksum_url_must_agree_with_artifact() {
        let url = "https://example.com/tool-1.2.3.tgz";
        let sums = format!("{}  tool-1.2.3.tgz\n{}  other.tgz\n", hash::sha256(b"good"), "0".repeat(64));
        let p = params(json!({
            "url": "https://example.com/tool-{version}.tgz",
            "checksum_url": "https://example.com/SHA256SUMS",
        }));

        let fake = FakeDownloader::new(&[(url, b"good"), ("https://example.com/SHA256SUMS", sums.as_bytes())]);
        let steps = DownloadAction.decompose(&ctx().with_downloader(fake), &p).unwrap();
        assert_eq!(steps[0].checksum.as_deref(), Some(hash::sha256(b"good").as_str()));

        let tampered = FakeDownloader::new(&[(url, b"evil"), ("https://example.com/SHA256SUMS", sums.as_bytes())]);
        let err = DownloadAction
            .decompose(&ctx().with_downloader(tampered), &p)
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_checksum_url_carried_without_downloader() {
        let p = params(json!({
            "url": "https://example.com/tool-{version}.tgz",
            "checksum_url": "https://example.com/tool-{version}.tgz.sha256",
        }));
        let steps = DownloadAction.decompose(&ctx(), &p).unwrap();
        assert_eq!(
            params::get_string(&steps[0].params, "checksum_url"),
            Some("https://example.com/tool-1.2.3.tgz.sha256")
        );
        assert!(steps[0].checksum.is_none());
    }

    #[test]
    fn test_http_rejected_before_any_fetch() {
        let fake = FakeDownloader::new(&[]);
        let ctx = ctx().with_downloader(fake.clone());
        let p = params(json!({"url": "http://example.com/tool-{version}.tgz"}));

        let err = DownloadAction.decompose(&ctx, &p).unwrap_err();
        assert!(matches!(err, Error::InsecureUrl(_)));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_multibyte_url_is_a_validation_error() {
        // Byte 8 falls inside the last 'é'
        let url = "aéééé/x";
        assert!(matches!(check_url_template(url), Err(Error::InsecureUrl(_))));
        assert!(check_url_template("HTTPS://example.com/é").is_ok());

        let result = DownloadAction.preflight(&params(json!({"url": url}))).unwrap();
        assert!(result.has_errors());
    }

    #[test]
    fn test_dest_traversal_rejected() {
        let p = params(json!({
            "url": "https://example.com/tool.tgz",
            "dest": "../../etc/passwd",
            "checksum": "a".repeat(64),
        }));
        assert!(DownloadAction.decompose(&ctx(), &p).is_err());
    }

    #[test]
    fn test_signature_params_carried() {
        let p = params(json!({
            "url": "https://example.com/tool-{version}.tgz",
            "checksum": "b".repeat(64),
            "signature_url": "https://example.com/tool-{version}.tgz.asc",
            "signature_key_url": "https://example.com/key.asc",
            "signature_key_fingerprint": "abcd 1234 abcd 1234 abcd 1234 abcd 1234 abcd 1234",
        }));
        let steps = DownloadAction.decompose(&ctx(), &p).unwrap();
        let out = &steps[0].params;
        assert_eq!(
            params::get_string(out, "signature_url"),
            Some("https://example.com/tool-1.2.3.tgz.asc")
        );
        assert_eq!(params::get_string(out, "signature_key_fingerprint"), Some(FP));
    }

    #[test]
    fn test_preflight_partial_signature_names_missing() {
        let p = params(json!({
            "url": "https://example.com/tool-{version}.tgz",
            "signature_url": "https://example.com/tool.asc",
        }));
        let result = DownloadAction.preflight(&p).unwrap();
        assert!(result.has_errors());
        assert!(result.errors[0].contains("signature_key_url"));
        assert!(result.errors[0].contains("signature_key_fingerprint"));
    }

    #[test]
    fn test_preflight_collects_every_error() {
        let p = params(json!({
            "url": "http://example.com/tool",
            "checksum_algo": "md5",
            "checksum_url": "https://example.com/sums",
            "signature_url": "https://example.com/tool.asc",
            "signature_key_url": "https://example.com/key.asc",
            "signature_key_fingerprint": "nothex",
        }));
        let result = DownloadAction.preflight(&p).unwrap();
        // insecure url, bad algorithm, exclusive modes, bad fingerprint
        assert_eq!(result.errors.len(), 4, "{:?}", result.errors);
    }

    #[test]
    fn test_preflight_warnings() {
        let p = params(json!({
            "url": "https://example.com/tool.tgz",
            "os_mapping": {"darwin": "macos"},
        }));
        let result = DownloadAction.preflight(&p).unwrap();
        assert!(!result.has_errors());
        assert_eq!(result.warnings.len(), 3, "{:?}", result.warnings);

        let p = params(json!({
            "url": "https://example.com/tool-{version}.tgz",
            "skip_verification_reason": "upstream publishes no checksums",
        }));
        let result = DownloadAction.preflight(&p).unwrap();
        assert!(!result.has_errors());
        assert!(!result.has_warnings());
    }

    #[test]
    fn test_download_file_preflight() {
        let ok = params(json!({"url": "https://example.com/a.tgz", "checksum": "c".repeat(64)}));
        assert!(!DownloadFileAction.preflight(&ok).unwrap().has_errors());

        let missing = params(json!({"url": "https://example.com/a.tgz"}));
        let result = DownloadFileAction.preflight(&missing).unwrap();
        assert_eq!(result.errors, vec!["download_file action requires 'checksum' parameter"]);

        let short = params(json!({"url": "https://example.com/a.tgz", "checksum": "abc"}));
        assert!(DownloadFileAction.preflight(&short).unwrap().has_errors());

        let sha512 = params(json!({
            "url": "https://example.com/a.tgz",
            "checksum": "d".repeat(128),
            "checksum_algo": "sha512",
        }));
        assert!(!DownloadFileAction.preflight(&sha512).unwrap().has_errors());
    }
}
