// src/download/predownload.rs

//! Plan-time downloads for checksum pinning

use super::secure::SecureDownloader;
use crate::actions::{DownloadResult, Downloader};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Downloads an artifact into a private temp directory to learn its checksum
///
/// The directory lives as long as the returned [`DownloadResult`].
pub struct PreDownloader {
    downloader: Arc<SecureDownloader>,
    temp_root: Option<PathBuf>,
}

impl PreDownloader {
    pub fn new(downloader: Arc<SecureDownloader>) -> Self {
        Self {
            downloader,
            temp_root: None,
        }
    }

    /// Create per-download directories under `dir` instead of the system temp dir
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(dir.into());
        self
    }
}

/// File name for a downloaded URL: the last path segment without its query
pub fn url_file_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    let name = without_query.rsplit('/').next().unwrap_or_default();
    match name {
        "" | "." | ".." => "download".to_string(),
        other => other.to_string(),
    }
}

impl Downloader for PreDownloader {
    fn download(&self, cancel: &CancelToken, url: &str) -> Result<DownloadResult> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("tsuku-eval-");
        let dir = match &self.temp_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| Error::IoError(format!("Failed to create temp directory: {}", e)))?;

        let dest = dir.path().join(url_file_name(url));
        info!("Downloading {} to compute checksum", url);
        let (checksum, size) = self.downloader.download_unverified(cancel, url, &dest)?;

        Ok(DownloadResult::new(dest, checksum, size).with_guard(dir))
    }
}
