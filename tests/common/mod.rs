// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use sequoia_openpgp as openpgp;
use openpgp::cert::CertBuilder;
use openpgp::crypto::KeyPair;
use openpgp::policy::StandardPolicy;
use openpgp::serialize::SerializeInto;
use openpgp::serialize::stream::{Armorer, Message, Signer};
use openpgp::Cert;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use tsuku::download::{DownloadCache, HttpResponse, HttpTransport, SecureDownloader};
use tsuku::{Error, Result};

/// One canned response
#[derive(Clone)]
pub struct Canned {
    pub status: u16,
    pub content_encoding: Option<String>,
    pub body: Vec<u8>,
}

/// In-memory transport: URL -> response, counting every request
#[derive(Default)]
pub struct FakeTransport {
    responses: Mutex<HashMap<String, Canned>>,
    requests: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.serve_canned(
            url,
            Canned {
                status: 200,
                content_encoding: None,
                body: body.into(),
            },
        );
    }

    pub fn serve_canned(&self, url: &str, canned: Canned) {
        self.responses.lock().unwrap().insert(url.to_string(), canned);
    }

    /// Requests made for `url`
    pub fn count(&self, url: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    pub fn total(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl HttpTransport for FakeTransport {
    fn get(&self, url: &str, _headers: &[(&str, String)]) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(url.to_string());
        let canned = self.responses.lock().unwrap().get(url).cloned();
        match canned {
            Some(canned) => Ok(HttpResponse {
                status: canned.status,
                content_encoding: canned.content_encoding,
                content_length: Some(canned.body.len() as u64),
                body: Box::new(Cursor::new(canned.body)),
            }),
            None => Ok(HttpResponse {
                status: 404,
                content_encoding: None,
                content_length: None,
                body: Box::new(Cursor::new(Vec::new())),
            }),
        }
    }
}

/// Transport that fails every request; proves a code path stays offline
pub struct NoNetwork;

impl HttpTransport for NoNetwork {
    fn get(&self, url: &str, _headers: &[(&str, String)]) -> Result<HttpResponse> {
        Err(Error::DownloadError(format!("network disabled: {}", url)))
    }
}

/// Downloader over `transport` with a cache in `cache_dir`
pub fn downloader(transport: Arc<dyn HttpTransport>, cache_dir: &std::path::Path) -> Arc<SecureDownloader> {
    let cache = Arc::new(DownloadCache::new(cache_dir));
    Arc::new(SecureDownloader::new(transport).with_cache(cache))
}

/// Throwaway signing certificate and its signing keypair
pub fn signing_cert() -> (Cert, KeyPair) {
    let (cert, _revocation) = CertBuilder::general_purpose(None, Some("test@example.com"))
        .generate()
        .unwrap();
    let policy = StandardPolicy::new();
    let keypair = cert
        .keys()
        .unencrypted_secret()
        .with_policy(&policy, None)
        .supported()
        .alive()
        .revoked(false)
        .for_signing()
        .next()
        .unwrap()
        .key()
        .clone()
        .into_keypair()
        .unwrap();
    (cert, keypair)
}

/// ASCII-armored public key
pub fn armored_public_key(cert: &Cert) -> Vec<u8> {
    cert.armored().to_vec().unwrap()
}

/// ASCII-armored detached signature over `data`
pub fn sign_detached(keypair: KeyPair, data: &[u8]) -> Vec<u8> {
    let mut sink = Vec::new();
    {
        let message = Message::new(&mut sink);
        let message = Armorer::new(message)
            .kind(openpgp::armor::Kind::Signature)
            .build()
            .unwrap();
        let mut signer = Signer::new(message, keypair).detached().build().unwrap();
        signer.write_all(data).unwrap();
        signer.finalize().unwrap();
    }
    sink
}

/// Binary (unarmored) detached signature over `data`
pub fn sign_detached_binary(keypair: KeyPair, data: &[u8]) -> Vec<u8> {
    let mut sink = Vec::new();
    {
        let message = Message::new(&mut sink);
        let mut signer = Signer::new(message, keypair).detached().build().unwrap();
        signer.write_all(data).unwrap();
        signer.finalize().unwrap();
    }
    sink
}

/// gzip-compressed tarball of `(path, contents, mode)` entries
pub fn tar_gz(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents, mode) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(*mode);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append_data(&mut header, path, *contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Lowercase hex sha256
pub fn sha256_hex(data: &[u8]) -> String {
    tsuku::hash::sha256(data)
}
