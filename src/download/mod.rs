// src/download/mod.rs

//! Secure download pipeline
//!
//! - [`transport`]: the HTTP seam and its reqwest implementation
//! - [`secure`]: https-only, identity-encoded, checksum-verified downloads
//! - [`cache`]: content-addressed artifact cache keyed by checksum
//! - [`predownload`]: plan-time fetches that compute checksums for pinning

pub mod cache;
pub mod predownload;
pub mod secure;
pub mod transport;

pub use cache::{CacheEntry, CacheEntryMeta, DownloadCache};
pub use predownload::{PreDownloader, url_file_name};
pub use secure::{MAX_SMALL_RESPONSE, SecureDownloader, require_https};
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport};
