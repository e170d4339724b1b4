// src/signature.rs

//! PGP signature verification pinned to key fingerprints
//!
//! Trust is anchored on a 40-hex-digit fingerprint written in the recipe.
//! Keys are fetched from a URL, but a key is only used (or cached) once its
//! own computed fingerprint equals the pinned one. Cached keys are
//! re-checked on every load and deleted on mismatch.
//!
//! Uses sequoia-openpgp (pure Rust implementation).

use crate::cancel::CancelToken;
use crate::download::SecureDownloader;
use crate::error::{Error, Result};
use sequoia_openpgp as openpgp;
use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use openpgp::{Cert, Packet, PacketPile};
use std::fs::{self, DirBuilder};
use std::io::{self, Read};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Maximum accepted public key size (100 KiB)
pub const MAX_KEY_SIZE: u64 = 100 * 1024;

/// Maximum accepted detached signature size (10 KiB)
pub const MAX_SIGNATURE_SIZE: u64 = 10 * 1024;

const FINGERPRINT_HEX_LEN: usize = 40;

/// Strip all whitespace and uppercase
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// Normalize and require exactly 20 bytes of hex
pub fn parse_fingerprint(fingerprint: &str) -> Result<String> {
    let normalized = normalize_fingerprint(fingerprint);
    let valid = normalized.len() == FINGERPRINT_HEX_LEN
        && hex::decode(&normalized).is_ok_and(|bytes| bytes.len() == FINGERPRINT_HEX_LEN / 2);
    if valid {
        Ok(normalized)
    } else {
        Err(Error::InvalidFingerprint(fingerprint.to_string()))
    }
}

/// Display form: ten space-separated blocks of four
///
/// Input that is not a 40-digit fingerprint is returned normalized only.
pub fn format_fingerprint(fingerprint: &str) -> String {
    let normalized = normalize_fingerprint(fingerprint);
    if normalized.len() != FINGERPRINT_HEX_LEN || !normalized.is_ascii() {
        return normalized;
    }
    normalized
        .as_bytes()
        .chunks(4)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Uppercase hex fingerprint of a certificate's primary key
pub fn cert_fingerprint(cert: &Cert) -> String {
    cert.fingerprint().to_hex()
}

fn parse_cert(data: &[u8]) -> Result<Cert> {
    Cert::from_bytes(data).map_err(|e| Error::ParseError(format!("Failed to parse PGP key: {}", e)))
}

/// Verify a detached signature (armored or binary) over `data`
pub fn verify_detached(data: &[u8], signature: &[u8], cert: &Cert) -> Result<()> {
    let policy = StandardPolicy::new();

    // PacketPile dearmors transparently
    let pile = PacketPile::from_bytes(signature).map_err(|e| {
        Error::SignatureVerificationFailed(format!("malformed signature: {}", e))
    })?;

    let mut saw_signature = false;
    for packet in pile.descendants() {
        if let Packet::Signature(sig) = packet {
            saw_signature = true;
            // Verification records the computed digest on the signature
            let mut sig = sig.clone();
            for key in cert.keys().with_policy(&policy, None) {
                if key.for_signing() && sig.verify_message(key.key(), data).is_ok() {
                    debug!("Signature verified with key {}", key.key().fingerprint());
                    return Ok(());
                }
            }
        }
    }

    if saw_signature {
        Err(Error::SignatureVerificationFailed(format!(
            "no valid signature from key {}",
            format_fingerprint(&cert_fingerprint(cert))
        )))
    } else {
        Err(Error::SignatureVerificationFailed(
            "no signature packets found".to_string(),
        ))
    }
}

/// Verify a detached signature over a file's contents
pub fn verify_detached_file(path: &Path, signature: &[u8], cert: &Cert) -> Result<()> {
    let mut data = Vec::new();
    fs::File::open(path)
        .and_then(|mut f| f.read_to_end(&mut data))
        .map_err(|e| {
            Error::IoError(format!(
                "Failed to read {} for signature verification: {}",
                path.display(),
                e
            ))
        })?;
    verify_detached(&data, signature, cert)
}

/// On-disk cache of fingerprint-pinned public keys
///
/// One armored key per file, named `<FINGERPRINT>.asc`.
pub struct PgpKeyCache {
    dir: PathBuf,
    downloader: Arc<SecureDownloader>,
}

impl PgpKeyCache {
    pub fn new(dir: impl Into<PathBuf>, downloader: Arc<SecureDownloader>) -> Self {
        Self {
            dir: dir.into(),
            downloader,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{}.asc", fingerprint))
    }

    /// Key for `fingerprint`, from cache or fetched from `key_url`
    pub fn get(&self, cancel: &CancelToken, fingerprint: &str, key_url: &str) -> Result<Cert> {
        let fingerprint = parse_fingerprint(fingerprint)?;

        if let Some(cert) = self.load_cached(&fingerprint) {
            debug!("Using cached key {}", format_fingerprint(&fingerprint));
            return Ok(cert);
        }

        info!("Fetching key {} from {}", format_fingerprint(&fingerprint), key_url);
        let data = self.downloader.fetch_bytes(cancel, key_url, MAX_KEY_SIZE)?;
        let cert = parse_cert(&data)?;

        let actual = cert_fingerprint(&cert);
        if actual != fingerprint {
            return Err(Error::FingerprintMismatch {
                expected: fingerprint,
                actual,
            });
        }

        if let Err(e) = self.store(&fingerprint, &data) {
            warn!("Failed to cache key {}: {}", fingerprint, e);
        }
        Ok(cert)
    }

    /// Load a cached key, deleting it if it is unreadable or mismatched
    fn load_cached(&self, fingerprint: &str) -> Option<Cert> {
        let path = self.key_path(fingerprint);
        let data = fs::read(&path).ok()?;

        let cert = match parse_cert(&data) {
            Ok(cert) => cert,
            Err(e) => {
                warn!("Cached key {} is invalid ({}), removing", path.display(), e);
                let _ = fs::remove_file(&path);
                return None;
            }
        };

        let actual = cert_fingerprint(&cert);
        if actual != fingerprint {
            warn!(
                "Cached key {} has fingerprint {}, removing",
                path.display(),
                actual
            );
            let _ = fs::remove_file(&path);
            return None;
        }

        Some(cert)
    }

    fn store(&self, fingerprint: &str, data: &[u8]) -> io::Result<()> {
        DirBuilder::new().recursive(true).mode(0o700).create(&self.dir)?;
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        io::Write::write_all(&mut temp, data)?;
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
        temp.persist(self.key_path(fingerprint))
            .map_err(|e| e.error)?;
        Ok(())
    }

    /// Fetch a detached signature and verify `path` against the pinned key
    pub fn verify_file(
        &self,
        cancel: &CancelToken,
        path: &Path,
        signature_url: &str,
        key_url: &str,
        fingerprint: &str,
    ) -> Result<()> {
        let cert = self.get(cancel, fingerprint, key_url)?;
        let signature = self
            .downloader
            .fetch_bytes(cancel, signature_url, MAX_SIGNATURE_SIZE)?;
        verify_detached_file(path, &signature, &cert)?;
        info!("PGP signature verified for {}", path.display());
        Ok(())
    }
}
