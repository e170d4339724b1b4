// src/download/transport.rs

//! HTTP transport seam
//!
//! Everything that fetches over the network goes through [`HttpTransport`],
//! so the trust pipeline can be tested with an in-memory transport. The
//! production [`ReqwestTransport`] wraps a blocking reqwest client that:
//!
//! - never negotiates compression (reqwest is built without decoders, so
//!   `Content-Encoding` reaches the caller untouched)
//! - only follows redirects to https URLs, up to a fixed depth
//! - refuses redirects to loopback, private, link-local and unspecified
//!   addresses

use crate::error::{Error, Result};
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_ENCODING, HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use std::io::Read;
use std::net::{IpAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

/// Timeout for small requests (checksum files, keys, tokens)
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for artifact downloads, covering the whole body transfer
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Maximum redirect chain length
const MAX_REDIRECTS: usize = 10;

const USER_AGENT: &str = concat!("tsuku/", env!("CARGO_PKG_VERSION"));

/// Response head plus a streaming body
pub struct HttpResponse {
    pub status: u16,
    pub content_encoding: Option<String>,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues GET requests
pub trait HttpTransport: Send + Sync {
    fn get(&self, url: &str, headers: &[(&str, String)]) -> Result<HttpResponse>;
}

/// Blocking reqwest client with hardened redirect handling
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DOWNLOAD_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .redirect(redirect_policy())
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.url().scheme() != "https" {
            let message = format!("redirect to non-HTTPS URL is not allowed: {}", attempt.url());
            return attempt.error(message);
        }
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let host = attempt.url().host_str().unwrap_or_default().to_string();
        if let Some(reason) = blocked_host(&host) {
            return attempt.error(reason);
        }
        attempt.follow()
    })
}

/// Reason a redirect host must be refused, if any
///
/// Hostnames are resolved and every address is checked.
fn blocked_host(host: &str) -> Option<String> {
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<IpAddr> = match trimmed.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => match (trimmed, 443).to_socket_addrs() {
            Ok(resolved) => resolved.map(|a| a.ip()).collect(),
            Err(e) => return Some(format!("failed to resolve redirect host {host}: {e}")),
        },
    };

    addrs
        .into_iter()
        .find(is_blocked_ip)
        .map(|ip| format!("refusing redirect: {host} resolves to blocked address {ip}"))
}

pub(crate) fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_multicast()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || v6.is_unicast_link_local()
                || v6.is_unique_local()
                || v6.to_ipv4_mapped().is_some_and(|v4| is_blocked_ip(&IpAddr::V4(v4)))
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(&self, url: &str, headers: &[(&str, String)]) -> Result<HttpResponse> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::DownloadError(format!("Invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::DownloadError(format!("Invalid header value: {e}")))?;
            header_map.insert(name, value);
        }

        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .headers(header_map)
            .send()
            .map_err(|e| Error::DownloadError(format!("Failed to fetch {}: {}", url, e)))?;

        let content_encoding = response
            .headers()
            .get(CONTENT_ENCODING)
            .map(|v| v.to_str().unwrap_or("invalid").to_string());

        Ok(HttpResponse {
            status: response.status().as_u16(),
            content_encoding,
            content_length: response.content_length(),
            body: Box::new(response),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_addresses() {
        for addr in ["127.0.0.1", "10.1.2.3", "192.168.0.1", "169.254.169.254", "0.0.0.0", "::1", "fd00::1"] {
            let ip: IpAddr = addr.parse().unwrap();
            assert!(is_blocked_ip(&ip), "{addr} should be blocked");
        }
        for addr in ["140.82.112.3", "2606:4700::1111"] {
            let ip: IpAddr = addr.parse().unwrap();
            assert!(!is_blocked_ip(&ip), "{addr} should be allowed");
        }
    }

    #[test]
    fn test_blocked_literal_host() {
        assert!(blocked_host("127.0.0.1").is_some());
        assert!(blocked_host("[::1]").is_some());
    }

    #[test]
    fn test_client_builds() {
        assert!(ReqwestTransport::new().is_ok());
    }
}
