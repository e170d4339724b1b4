// src/download/cache.rs

//! Content-addressed download cache
//!
//! Entries are keyed by the checksum the artifact was verified against,
//! never by URL, so a hit is authoritative: the bytes were verified when
//! they were written and entries are never modified afterwards.
//!
//! Layout under the cache directory:
//!
//! ```text
//! sha256-<hex>        artifact bytes (0600)
//! sha256-<hex>.json   sidecar {url, size, created_at}
//! ```
//!
//! Writes go through a temp file in the same directory followed by a
//! rename, so concurrent writers of one key cannot leave a torn entry.

use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, DirBuilder, File};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const SIDECAR_EXTENSION: &str = "json";

/// Sidecar metadata stored next to each entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub url: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// One cached artifact
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub path: PathBuf,
    pub size: u64,
    pub meta: Option<CacheEntryMeta>,
}

pub struct DownloadCache {
    dir: PathBuf,
}

impl DownloadCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Entry name for a checksum; rejects anything that is not plain hex
    pub fn key(algorithm: HashAlgorithm, checksum: &str) -> Result<String> {
        let checksum = hash::normalize_checksum(checksum);
        if !hash::is_valid_checksum(&checksum, algorithm) {
            return Err(Error::ParseError(format!(
                "invalid {} checksum '{}'",
                algorithm, checksum
            )));
        }
        Ok(format!("{}-{}", algorithm, checksum))
    }

    fn entry_path(&self, algorithm: HashAlgorithm, checksum: &str) -> Result<PathBuf> {
        Ok(self.dir.join(Self::key(algorithm, checksum)?))
    }

    fn sidecar_path(entry: &Path) -> PathBuf {
        entry.with_extension(SIDECAR_EXTENSION)
    }

    fn ensure_dir(&self) -> Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)
            .map_err(|e| {
                Error::IoError(format!(
                    "Failed to create cache directory {}: {}",
                    self.dir.display(),
                    e
                ))
            })
    }

    pub fn contains(&self, algorithm: HashAlgorithm, checksum: &str) -> bool {
        self.entry_path(algorithm, checksum)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    fn read_meta(entry: &Path) -> Option<CacheEntryMeta> {
        let data = fs::read(Self::sidecar_path(entry)).ok()?;
        serde_json::from_slice(&data).ok()
    }

    /// Copy a cached artifact to `dest`
    ///
    /// Returns `Ok(false)` on a miss. An entry whose size disagrees with its
    /// sidecar is evicted and reported as a miss.
    pub fn get(&self, algorithm: HashAlgorithm, checksum: &str, dest: &Path) -> Result<bool> {
        let entry = self.entry_path(algorithm, checksum)?;
        let actual_size = match fs::metadata(&entry) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        match Self::read_meta(&entry) {
            Some(meta) if meta.size != actual_size => {
                warn!(
                    "Cache entry {} is {} bytes but sidecar says {}, evicting",
                    entry.display(),
                    actual_size,
                    meta.size
                );
                self.remove(algorithm, checksum)?;
                return Ok(false);
            }
            Some(_) => {}
            None => {
                // No sidecar to cross-check against, so re-hash
                if hash::verify_file(&entry, checksum, algorithm).is_err() {
                    warn!("Cache entry {} failed verification, evicting", entry.display());
                    self.remove(algorithm, checksum)?;
                    return Ok(false);
                }
            }
        }

        copy_atomic(&entry, dest)?;
        debug!("Cache hit {} -> {}", entry.display(), dest.display());
        Ok(true)
    }

    /// Store `source` under `checksum`
    ///
    /// The source is hashed first and must match; the cache never holds
    /// bytes under a key they do not hash to. Existing entries are kept.
    pub fn put(
        &self,
        algorithm: HashAlgorithm,
        checksum: &str,
        source: &Path,
        url: &str,
    ) -> Result<()> {
        let entry = self.entry_path(algorithm, checksum)?;
        if entry.is_file() {
            return Ok(());
        }

        hash::verify_file(source, checksum, algorithm)?;
        self.ensure_dir()?;

        let size = copy_atomic(source, &entry)?;
        fs::set_permissions(&entry, fs::Permissions::from_mode(0o600))?;

        let meta = CacheEntryMeta {
            url: url.to_string(),
            size,
            created_at: Utc::now(),
        };
        let mut sidecar = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(sidecar.as_file_mut(), &meta)?;
        sidecar
            .persist(Self::sidecar_path(&entry))
            .map_err(|e| Error::IoError(format!("Failed to write cache sidecar: {}", e)))?;

        debug!("Cached {} ({} bytes) as {}", url, size, entry.display());
        Ok(())
    }

    /// Remove one entry and its sidecar; `Ok(false)` if absent
    pub fn remove(&self, algorithm: HashAlgorithm, checksum: &str) -> Result<bool> {
        let entry = self.entry_path(algorithm, checksum)?;
        let _ = fs::remove_file(Self::sidecar_path(&entry));
        match fs::remove_file(&entry) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// List all entries, sorted by key
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::IoError(format!(
                    "Failed to read cache directory {}: {}",
                    self.dir.display(),
                    e
                )));
            }
        };

        let mut entries = Vec::new();
        for item in read_dir {
            let item = item?;
            let path = item.path();
            let name = item.file_name().to_string_lossy().into_owned();
            if !item.file_type()?.is_file() || is_auxiliary(&name) {
                continue;
            }
            let size = item.metadata()?.len();
            let meta = Self::read_meta(&path);
            entries.push(CacheEntry {
                key: name,
                path,
                size,
                meta,
            });
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    pub fn total_size(&self) -> Result<u64> {
        Ok(self.entries()?.iter().map(|e| e.size).sum())
    }

    /// Remove every entry; returns how many were removed
    pub fn clear(&self) -> Result<usize> {
        let entries = self.entries()?;
        let count = entries.len();
        for entry in entries {
            let _ = fs::remove_file(Self::sidecar_path(&entry.path));
            fs::remove_file(&entry.path)?;
        }
        debug!("Cleared {} cache entries from {}", count, self.dir.display());
        Ok(count)
    }
}

/// Sidecars and in-flight temp files are not entries
fn is_auxiliary(name: &str) -> bool {
    name.ends_with(".json") || name.starts_with(".tmp")
}

/// Copy `source` over `dest` via a temp file in `dest`'s directory
fn copy_atomic(source: &Path, dest: &Path) -> Result<u64> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(parent)?;
    let mut input = File::open(source)?;
    let size = io::copy(&mut input, temp.as_file_mut())?;
    temp.as_file().sync_all()?;
    temp.persist(dest)
        .map_err(|e| Error::IoError(format!("Failed to write {}: {}", dest.display(), e)))?;
    Ok(size)
}
