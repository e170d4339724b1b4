// tests/signature.rs

//! Fingerprint-pinned key cache and detached signature tests.

mod common;

use common::{
    FakeTransport, NoNetwork, armored_public_key, downloader, sign_detached, sign_detached_binary,
    signing_cert,
};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use tsuku::signature::{PgpKeyCache, cert_fingerprint, format_fingerprint, verify_detached};
use tsuku::{CancelToken, Error};

const KEY_URL: &str = "https://keys.example.com/release.asc";
const SIG_URL: &str = "https://releases.example.com/tool.tar.gz.asc";

#[test]
fn test_key_is_fetched_once_then_cached() {
    let temp = TempDir::new().unwrap();
    let (cert, _keypair) = signing_cert();
    let fingerprint = cert_fingerprint(&cert);

    let transport = FakeTransport::new();
    transport.serve(KEY_URL, armored_public_key(&cert));
    let keys = PgpKeyCache::new(
        temp.path().join("keys"),
        downloader(transport.clone(), &temp.path().join("cache")),
    );

    // Spaced lowercase form pins the same key
    let pinned = format_fingerprint(&fingerprint).to_lowercase();
    let fetched = keys.get(&CancelToken::new(), &pinned, KEY_URL).unwrap();
    assert_eq!(cert_fingerprint(&fetched), fingerprint);
    assert!(temp.path().join("keys").join(format!("{}.asc", fingerprint)).is_file());

    let offline = PgpKeyCache::new(
        temp.path().join("keys"),
        downloader(Arc::new(NoNetwork), &temp.path().join("cache")),
    );
    offline.get(&CancelToken::new(), &fingerprint, KEY_URL).unwrap();
    assert_eq!(transport.count(KEY_URL), 1);
}

#[test]
fn test_wrong_key_is_rejected_and_not_cached() {
    let temp = TempDir::new().unwrap();
    let (cert, _) = signing_cert();
    let (other, _) = signing_cert();

    let transport = FakeTransport::new();
    transport.serve(KEY_URL, armored_public_key(&other));
    let keys = PgpKeyCache::new(
        temp.path().join("keys"),
        downloader(transport, &temp.path().join("cache")),
    );

    let err = keys
        .get(&CancelToken::new(), &cert_fingerprint(&cert), KEY_URL)
        .unwrap_err();
    assert!(matches!(err, Error::FingerprintMismatch { .. }));
    assert!(err.is_trust_failure());
    assert!(!temp.path().join("keys").join(format!("{}.asc", cert_fingerprint(&cert))).exists());
}

#[test]
fn test_tampered_cache_entry_is_replaced() {
    let temp = TempDir::new().unwrap();
    let (cert, _) = signing_cert();
    let (other, _) = signing_cert();
    let fingerprint = cert_fingerprint(&cert);

    let keys_dir = temp.path().join("keys");
    fs::create_dir_all(&keys_dir).unwrap();
    fs::write(keys_dir.join(format!("{}.asc", fingerprint)), armored_public_key(&other)).unwrap();

    let transport = FakeTransport::new();
    transport.serve(KEY_URL, armored_public_key(&cert));
    let keys = PgpKeyCache::new(&keys_dir, downloader(transport.clone(), &temp.path().join("cache")));

    let fetched = keys.get(&CancelToken::new(), &fingerprint, KEY_URL).unwrap();
    assert_eq!(cert_fingerprint(&fetched), fingerprint);
    assert_eq!(transport.count(KEY_URL), 1);
}

#[test]
fn test_invalid_fingerprint_makes_no_request() {
    let temp = TempDir::new().unwrap();
    let transport = FakeTransport::new();
    let keys = PgpKeyCache::new(
        temp.path().join("keys"),
        downloader(transport.clone(), &temp.path().join("cache")),
    );

    let err = keys.get(&CancelToken::new(), "ABCD1234", KEY_URL).unwrap_err();
    assert!(matches!(err, Error::InvalidFingerprint(_)));
    assert_eq!(transport.total(), 0);
}

#[test]
fn test_verify_file_with_detached_signature() {
    let temp = TempDir::new().unwrap();
    let (cert, keypair) = signing_cert();
    let artifact = temp.path().join("tool.tar.gz");
    fs::write(&artifact, b"release contents").unwrap();

    let transport = FakeTransport::new();
    transport.serve(KEY_URL, armored_public_key(&cert));
    transport.serve(SIG_URL, sign_detached(keypair, b"release contents"));
    let keys = PgpKeyCache::new(
        temp.path().join("keys"),
        downloader(transport, &temp.path().join("cache")),
    );

    keys.verify_file(&CancelToken::new(), &artifact, SIG_URL, KEY_URL, &cert_fingerprint(&cert))
        .unwrap();

    fs::write(&artifact, b"release contents, modified").unwrap();
    let err = keys
        .verify_file(&CancelToken::new(), &artifact, SIG_URL, KEY_URL, &cert_fingerprint(&cert))
        .unwrap_err();
    assert!(matches!(err, Error::SignatureVerificationFailed(_)));
}

#[test]
fn test_signature_from_another_key_fails() {
    let (cert, _) = signing_cert();
    let (_, other_keypair) = signing_cert();
    let signature = sign_detached(other_keypair, b"data");

    let err = verify_detached(b"data", &signature, &cert).unwrap_err();
    assert!(err.is_trust_failure());
}

#[test]
fn test_garbage_signature_fails() {
    let (cert, _) = signing_cert();
    let err = verify_detached(b"data", b"not a signature", &cert).unwrap_err();
    assert!(matches!(err, Error::SignatureVerificationFailed(_)));
}

#[test]
fn test_binary_detached_signature() {
    let (cert, keypair) = signing_cert();
    let signature = sign_detached_binary(keypair, b"release contents");
    assert!(!signature.starts_with(b"-----BEGIN"));

    verify_detached(b"release contents", &signature, &cert).unwrap();
    let err = verify_detached(b"release contents, modified", &signature, &cert).unwrap_err();
    assert!(matches!(err, Error::SignatureVerificationFailed(_)));
}

#[test]
fn test_verify_file_with_binary_signature() {
    let temp = TempDir::new().unwrap();
    let (cert, keypair) = signing_cert();
    let artifact = temp.path().join("tool.tar.gz");
    fs::write(&artifact, b"release contents").unwrap();

    let sig_url = "https://releases.example.com/tool.tar.gz.sig";
    let transport = FakeTransport::new();
    transport.serve(KEY_URL, armored_public_key(&cert));
    transport.serve(sig_url, sign_detached_binary(keypair, b"release contents"));
    let keys = PgpKeyCache::new(
        temp.path().join("keys"),
        downloader(transport, &temp.path().join("cache")),
    );

    keys.verify_file(&CancelToken::new(), &artifact, sig_url, KEY_URL, &cert_fingerprint(&cert))
        .unwrap();
}
