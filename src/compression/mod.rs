// src/compression/mod.rs
//! Archive format detection and decompressing readers
//!
//! Release tarballs arrive as plain tar or tar wrapped in gzip, xz or zstd.
//! The format comes from the recipe, from the file name, or failing both
//! from the leading magic bytes.

use crate::error::{Error, Result};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarXz,
    TarZst,
}

impl ArchiveFormat {
    /// Detect format from a file name
    ///
    /// # Examples
    /// ```
    /// use tsuku::compression::ArchiveFormat;
    ///
    /// assert_eq!(ArchiveFormat::from_file_name("tool.tar.gz"), Some(ArchiveFormat::TarGz));
    /// assert_eq!(ArchiveFormat::from_file_name("tool.txz"), Some(ArchiveFormat::TarXz));
    /// assert_eq!(ArchiveFormat::from_file_name("tool.zip"), None);
    /// ```
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
            Some(Self::TarXz)
        } else if lower.ends_with(".tar.zst") || lower.ends_with(".tzst") {
            Some(Self::TarZst)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }

    /// Detect the compression wrapper from magic bytes
    ///
    /// - Gzip: `1f 8b`
    /// - XZ: `fd 37 7a 58 5a 00`
    /// - Zstd: `28 b5 2f fd`
    ///
    /// Anything else is assumed to be plain tar.
    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.starts_with(&[0x1f, 0x8b]) {
            Self::TarGz
        } else if data.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
            Self::TarXz
        } else if data.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Self::TarZst
        } else {
            Self::Tar
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::TarXz => "tar.xz",
            Self::TarZst => "tar.zst",
        }
    }

    /// Wrap `reader` so it yields the uncompressed tar stream
    pub fn decoder<'a, R: Read + 'a>(&self, reader: R) -> Result<Box<dyn Read + 'a>> {
        match self {
            Self::Tar => Ok(Box::new(reader)),
            Self::TarGz => Ok(Box::new(flate2::read::GzDecoder::new(reader))),
            Self::TarXz => Ok(Box::new(xz2::read::XzDecoder::new(reader))),
            Self::TarZst => {
                let decoder = zstd::Decoder::new(reader).map_err(|e| {
                    Error::IoError(format!("Failed to create zstd decoder: {}", e))
                })?;
                Ok(Box::new(decoder))
            }
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ArchiveFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tar" => Ok(Self::Tar),
            "tar.gz" | "tgz" => Ok(Self::TarGz),
            "tar.xz" | "txz" => Ok(Self::TarXz),
            "tar.zst" | "tzst" => Ok(Self::TarZst),
            other => Err(Error::ParseError(format!("unsupported archive format: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_file_name() {
        assert_eq!(ArchiveFormat::from_file_name("a.TAR.GZ"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_file_name("a.tgz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_file_name("a.tar.zst"), Some(ArchiveFormat::TarZst));
        assert_eq!(ArchiveFormat::from_file_name("a.tar"), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::from_file_name("a.gz"), None);
    }

    #[test]
    fn test_format_from_magic_bytes() {
        assert_eq!(ArchiveFormat::from_magic_bytes(&[0x1f, 0x8b, 0x08]), ArchiveFormat::TarGz);
        assert_eq!(
            ArchiveFormat::from_magic_bytes(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]),
            ArchiveFormat::TarXz
        );
        assert_eq!(ArchiveFormat::from_magic_bytes(&[0x28, 0xb5, 0x2f, 0xfd]), ArchiveFormat::TarZst);
        assert_eq!(ArchiveFormat::from_magic_bytes(b"ustar"), ArchiveFormat::Tar);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("tgz".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarGz);
        assert_eq!("TAR.XZ".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarXz);
        assert!("zip".parse::<ArchiveFormat>().is_err());
    }

    #[test]
    fn test_gzip_decoder_roundtrip() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"payload").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut out = String::new();
        ArchiveFormat::TarGz
            .decoder(compressed.as_slice())
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "payload");
    }
}
