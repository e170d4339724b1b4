// src/download/secure.rs

//! Verified artifact downloads
//!
//! [`SecureDownloader::download_verified`] is the only way an artifact gets
//! into a work directory:
//!
//! 1. the URL must be https; anything else is rejected before a request
//! 2. the content-addressed cache is consulted by the expected checksum,
//!    and a hit restores the file with no network access
//! 3. the request asks for `identity` encoding and a response claiming any
//!    other encoding is rejected
//! 4. the body is streamed in fixed chunks to a temp file beside the
//!    destination, hashed on the way, with cancellation checked per chunk
//! 5. only a matching digest is renamed into place and written to the cache
//!
//! A cache that cannot be read or written degrades to a plain download with
//! a warning.

use super::cache::DownloadCache;
use super::transport::{HttpResponse, HttpTransport};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm, Hasher};
use serde::Deserialize;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Buffer size for streaming downloads (8 KB)
const STREAM_BUFFER_SIZE: usize = 8192;

/// Upper bound on checksum files and token responses
pub const MAX_SMALL_RESPONSE: u64 = 1024 * 1024;

const GHCR_HOMEBREW_PREFIX: &str = "/v2/homebrew/core/";

/// Reject anything but an absolute https URL
pub fn require_https(url: &str) -> Result<()> {
    match url::Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "https" && parsed.host_str().is_some() => Ok(()),
        _ => Err(Error::InsecureUrl(url.to_string())),
    }
}

/// Downloads into place only after checksum verification
pub struct SecureDownloader {
    transport: Arc<dyn HttpTransport>,
    cache: Option<Arc<DownloadCache>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

impl SecureDownloader {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<DownloadCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&Arc<DownloadCache>> {
        self.cache.as_ref()
    }

    /// Fetch `url` to `dest`, succeeding only if it hashes to `expected`
    ///
    /// Returns the file size.
    pub fn download_verified(
        &self,
        cancel: &CancelToken,
        url: &str,
        dest: &Path,
        expected: &str,
        algorithm: HashAlgorithm,
    ) -> Result<u64> {
        require_https(url)?;
        let expected = hash::normalize_checksum(expected);
        if !hash::is_valid_checksum(&expected, algorithm) {
            return Err(Error::ParseError(format!(
                "invalid {} checksum '{}'",
                algorithm, expected
            )));
        }

        if let Some(cache) = &self.cache {
            match cache.get(algorithm, &expected, dest) {
                Ok(true) => {
                    info!("Restored {} from cache", dest.display());
                    return Ok(std::fs::metadata(dest)?.len());
                }
                Ok(false) => debug!("Cache miss for {}-{}", algorithm, expected),
                Err(e) => warn!("Download cache unavailable: {}", e),
            }
        }

        info!("Downloading {}", url);
        let response = self.open(url)?;
        let (temp, actual, size) = stream_to_temp(cancel, response, dest, algorithm)?;

        if actual != expected {
            // Dropping the temp file deletes the partial download
            drop(temp);
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        temp.persist(dest)
            .map_err(|e| Error::IoError(format!("Failed to write {}: {}", dest.display(), e)))?;
        debug!("Verified {} checksum for {}", algorithm, dest.display());

        if let Some(cache) = &self.cache
            && let Err(e) = cache.put(algorithm, &expected, dest, url)
        {
            warn!("Failed to cache {}: {}", url, e);
        }

        Ok(size)
    }

    /// Fetch `url` to `dest` without an expected checksum
    ///
    /// Used at plan time to learn a checksum. Returns the sha256 and size.
    pub fn download_unverified(
        &self,
        cancel: &CancelToken,
        url: &str,
        dest: &Path,
    ) -> Result<(String, u64)> {
        require_https(url)?;
        let response = self.open(url)?;
        let (temp, checksum, size) = stream_to_temp(cancel, response, dest, HashAlgorithm::Sha256)?;
        temp.persist(dest)
            .map_err(|e| Error::IoError(format!("Failed to write {}: {}", dest.display(), e)))?;
        Ok((checksum, size))
    }

    /// Fetch a small document (checksum file, key, signature) into memory
    pub fn fetch_bytes(&self, cancel: &CancelToken, url: &str, limit: u64) -> Result<Vec<u8>> {
        require_https(url)?;
        cancel.check()?;
        let response = self.open(url)?;
        read_limited(response.body, url, limit)
    }

    pub fn fetch_string(&self, cancel: &CancelToken, url: &str, limit: u64) -> Result<String> {
        let bytes = self.fetch_bytes(cancel, url, limit)?;
        String::from_utf8(bytes)
            .map_err(|e| Error::ParseError(format!("Invalid UTF-8 in response from {}: {}", url, e)))
    }

    /// Issue the GET with identity encoding and validate the response head
    fn open(&self, url: &str) -> Result<HttpResponse> {
        let mut headers = vec![("Accept-Encoding", "identity".to_string())];
        if let Some(token) = self.registry_token(url) {
            headers.push(("Authorization", format!("Bearer {}", token)));
        }

        let response = self.transport.get(url, &headers)?;
        if !response.is_success() {
            return Err(Error::HttpStatus {
                status: response.status,
                url: url.to_string(),
            });
        }
        if let Some(encoding) = &response.content_encoding
            && !encoding.is_empty()
            && !encoding.eq_ignore_ascii_case("identity")
        {
            return Err(Error::UnexpectedContentEncoding(encoding.clone()));
        }
        Ok(response)
    }

    /// Anonymous pull token for Homebrew bottles on ghcr.io
    ///
    /// Failure is not fatal; the request proceeds unauthenticated.
    fn registry_token(&self, url: &str) -> Option<String> {
        let formula = ghcr_formula(url)?;
        let token_url = format!(
            "https://ghcr.io/token?service=ghcr.io&scope=repository:homebrew/core/{}:pull",
            formula
        );

        let fetched = self
            .transport
            .get(&token_url, &[])
            .and_then(|response| {
                if !response.is_success() {
                    return Err(Error::HttpStatus {
                        status: response.status,
                        url: token_url.clone(),
                    });
                }
                read_limited(response.body, &token_url, MAX_SMALL_RESPONSE)
            })
            .and_then(|body| Ok(serde_json::from_slice::<TokenResponse>(&body)?));

        match fetched {
            Ok(parsed) if !parsed.token.is_empty() => Some(parsed.token),
            Ok(_) => None,
            Err(e) => {
                warn!("Failed to obtain registry token for {}: {}", formula, e);
                None
            }
        }
    }
}

/// Formula path of a `ghcr.io/v2/homebrew/core/<formula>/blobs/...` URL
///
/// Versioned formulas keep their slash (`openssl/3`).
fn ghcr_formula(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    if parsed.scheme() != "https" || parsed.host_str() != Some("ghcr.io") {
        return None;
    }
    let rest = parsed.path().strip_prefix(GHCR_HOMEBREW_PREFIX)?;
    let (formula, _) = rest.split_once("/blobs/")?;
    (!formula.is_empty()).then(|| formula.to_string())
}

fn read_limited(body: Box<dyn Read + Send>, url: &str, limit: u64) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    body.take(limit + 1)
        .read_to_end(&mut data)
        .map_err(|e| Error::DownloadError(format!("Failed to read response from {}: {}", url, e)))?;
    if data.len() as u64 > limit {
        return Err(Error::ResponseTooLarge {
            url: url.to_string(),
            limit,
        });
    }
    Ok(data)
}

/// Stream a response body into a temp file next to `dest`, hashing as it goes
fn stream_to_temp(
    cancel: &CancelToken,
    mut response: HttpResponse,
    dest: &Path,
    algorithm: HashAlgorithm,
) -> Result<(NamedTempFile, String, u64)> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| {
        Error::IoError(format!("Failed to create directory {}: {e}", parent.display()))
    })?;

    let mut temp = NamedTempFile::new_in(parent)?;
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; STREAM_BUFFER_SIZE];
    let mut written: u64 = 0;

    loop {
        cancel.check()?;
        let n = response
            .body
            .read(&mut buffer)
            .map_err(|e| Error::DownloadError(format!("Failed to read response: {e}")))?;
        if n == 0 {
            break;
        }
        temp.write_all(&buffer[..n])
            .map_err(|e| Error::IoError(format!("Failed to write data: {e}")))?;
        hasher.update(&buffer[..n]);
        written += n as u64;
    }
    temp.as_file().sync_all()?;

    if let Some(expected_len) = response.content_length
        && expected_len != written
    {
        return Err(Error::DownloadError(format!(
            "truncated response: expected {} bytes, got {}",
            expected_len, written
        )));
    }

    Ok((temp, hasher.finalize(), written))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_https() {
        assert!(require_https("https://example.com/a.tgz").is_ok());
        for bad in ["http://example.com/a", "ftp://example.com/a", "example.com/a", "https://", "file:///etc/passwd"] {
            assert!(matches!(require_https(bad), Err(Error::InsecureUrl(_))), "{bad}");
        }
    }

    #[test]
    fn test_ghcr_formula() {
        assert_eq!(
            ghcr_formula("https://ghcr.io/v2/homebrew/core/jq/blobs/sha256:abc").as_deref(),
            Some("jq")
        );
        assert_eq!(
            ghcr_formula("https://ghcr.io/v2/homebrew/core/openssl/3/blobs/sha256:abc").as_deref(),
            Some("openssl/3")
        );
        assert!(ghcr_formula("https://ghcr.io/v2/other/jq/blobs/sha256:abc").is_none());
        assert!(ghcr_formula("https://example.com/v2/homebrew/core/jq/blobs/x").is_none());
    }

    #[test]
    fn test_read_limited() {
        let body: Box<dyn Read + Send> = Box::new(std::io::Cursor::new(vec![0u8; 11]));
        let err = read_limited(body, "https://x", 10).unwrap_err();
        assert!(matches!(err, Error::ResponseTooLarge { limit: 10, .. }));

        let body: Box<dyn Read + Send> = Box::new(std::io::Cursor::new(vec![0u8; 10]));
        assert_eq!(read_limited(body, "https://x", 10).unwrap().len(), 10);
    }
}
