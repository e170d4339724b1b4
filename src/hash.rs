// src/hash.rs

//! Checksum computation and verification for downloaded artifacts
//!
//! Two algorithms are supported, matching what upstream projects publish:
//! - **SHA-256**: the default, used for cache keys and plan pinning
//! - **SHA-512**: accepted when a recipe's checksum source only offers it
//!
//! Expected values may carry an `algo:` prefix (`sha256:abc...`); the prefix
//! is stripped before comparison and comparison is case-insensitive.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

/// Buffer size for streaming hashes (8 KB)
const HASH_BUFFER_SIZE: usize = 8192;

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Get the hash output length in bytes
    #[inline]
    pub const fn output_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    /// Get the hash output length as a hex string
    #[inline]
    pub const fn hex_len(&self) -> usize {
        self.output_len() * 2
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            _ => Err(Error::ParseError(format!("unsupported hash algorithm: {}", s))),
        }
    }
}

/// Incremental hasher over either algorithm
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => HasherState::Sha512(Sha512::new()),
        };
        Self { algorithm, state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Sha512(hasher) => hasher.update(data),
        }
    }

    /// Finalize and return the lowercase hex digest
    pub fn finalize(self) -> String {
        match self.state {
            HasherState::Sha256(hasher) => hex::encode(hasher.finalize()),
            HasherState::Sha512(hasher) => hex::encode(hasher.finalize()),
        }
    }

    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compute a digest from a reader without buffering the whole input
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, reader: &mut R) -> io::Result<String> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;
    hash_reader(algorithm, &mut file)
        .map_err(|e| Error::IoError(format!("Failed to hash {}: {}", path.display(), e)))
}

#[inline]
pub fn sha256(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Sha256, data)
}

/// Normalize an expected checksum: trim, lowercase, drop any `algo:` prefix
pub fn normalize_checksum(expected: &str) -> String {
    let trimmed = expected.trim().to_lowercase();
    match trimmed.split_once(':') {
        Some((_, value)) => value.to_string(),
        None => trimmed,
    }
}

/// Check that a checksum string has the right shape for its algorithm
pub fn is_valid_checksum(value: &str, algorithm: HashAlgorithm) -> bool {
    let value = normalize_checksum(value);
    value.len() == algorithm.hex_len() && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Verify a file matches an expected checksum
///
/// Streams the file content to avoid loading it entirely into memory.
pub fn verify_file(path: &Path, expected: &str, algorithm: HashAlgorithm) -> Result<()> {
    let actual = hash_file(algorithm, path)?;
    let expected = normalize_checksum(expected);
    if actual == expected {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch { expected, actual })
    }
}

/// Extract a checksum from the contents of a published checksum file
///
/// Accepts a bare digest, `digest  filename`, or a multi-line SHA256SUMS
/// style listing. With several lines, `target` selects the matching entry.
pub fn parse_checksum_file(content: &str, target: Option<&str>) -> Result<String> {
    let content = content.trim();
    let lines: Vec<&str> = content.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    if let Some(target) = target.filter(|t| !t.is_empty())
        && lines.len() > 1
    {
        for line in &lines {
            let mut fields = line.split_whitespace();
            let Some(digest) = fields.next() else {
                continue;
            };
            // `sha256sum -b` prefixes the name with '*'
            if fields.any(|name| name.trim_start_matches('*') == target) {
                return Ok(digest.to_lowercase());
            }
        }
        return Err(Error::NotFoundError(format!(
            "checksum for '{}' not present in checksum file",
            target
        )));
    }

    lines
        .first()
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_lowercase)
        .ok_or_else(|| Error::ParseError("checksum file is empty".to_string()))
}
