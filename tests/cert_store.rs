//! Directory-backed certificate store lookups.

use tls_acceptor::cert::{CertificateProvider, DirectoryStore, MatchPolicy};
use tls_acceptor::{CertificateError, CertificateQuery};

mod common;

#[test]
fn single_match_resolves_with_key() {
    let dir = tempfile::tempdir().unwrap();
    let cert = common::self_signed("api.example.test");
    common::write_entry(dir.path(), "api", &cert, true);

    let identity = DirectoryStore::new(dir.path())
        .resolve(&CertificateQuery::new("api.example.test"))
        .unwrap();
    assert_eq!(identity.subject(), "CN=api.example.test");
    assert_eq!(identity.chain().len(), 1);
    assert_eq!(identity.chain()[0], cert.der);
}

#[test]
fn key_may_live_in_sibling_file() {
    let dir = tempfile::tempdir().unwrap();
    let cert = common::self_signed("split.example.test");
    common::write_entry(dir.path(), "split", &cert, false);

    let identity = DirectoryStore::new(dir.path())
        .resolve(&CertificateQuery::new("split.example.test"))
        .unwrap();
    assert_eq!(identity.subject(), "CN=split.example.test");
}

#[test]
fn subject_match_ignores_case() {
    let dir = tempfile::tempdir().unwrap();
    let cert = common::self_signed("mixed.example.test");
    common::write_entry(dir.path(), "mixed", &cert, true);

    assert!(DirectoryStore::new(dir.path())
        .resolve(&CertificateQuery::new("MIXED.Example.TEST"))
        .is_ok());
}

#[test]
fn first_match_in_file_order_wins() {
    let dir = tempfile::tempdir().unwrap();
    let older = common::self_signed("dup.example.test");
    let newer = common::self_signed("dup.example.test");
    common::write_entry(dir.path(), "b-newer", &newer, true);
    common::write_entry(dir.path(), "a-older", &older, true);

    let store = DirectoryStore::new(dir.path());
    let identity = store
        .resolve(&CertificateQuery::new("dup.example.test"))
        .unwrap();
    assert_eq!(identity.chain()[0], older.der);

    let err = store
        .resolve(&CertificateQuery::new("dup.example.test").match_policy(MatchPolicy::Unique))
        .unwrap_err();
    assert!(matches!(err, CertificateError::Ambiguous { count: 2, .. }));
}

#[test]
fn no_match_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    common::write_entry(dir.path(), "other", &common::self_signed("other.example.test"), true);

    let err = DirectoryStore::new(dir.path())
        .resolve(&CertificateQuery::new("wanted.example.test"))
        .unwrap_err();
    assert!(matches!(err, CertificateError::NotFound { .. }));
}

#[test]
fn validity_filter_skips_expired_certificates() {
    let dir = tempfile::tempdir().unwrap();
    common::write_entry(dir.path(), "old", &common::expired("old.example.test"), true);
    let store = DirectoryStore::new(dir.path());

    assert!(store
        .resolve(&CertificateQuery::new("old.example.test"))
        .is_ok());
    let err = store
        .resolve(&CertificateQuery::new("old.example.test").valid_only(true))
        .unwrap_err();
    assert!(matches!(err, CertificateError::NotFound { .. }));
}

#[test]
fn certificate_without_key_is_unusable() {
    let dir = tempfile::tempdir().unwrap();
    let cert = common::self_signed("nokey.example.test");
    let store_dir = common::personal_store(dir.path());
    std::fs::write(store_dir.join("nokey.pem"), &cert.cert_pem).unwrap();

    let err = DirectoryStore::new(dir.path())
        .resolve(&CertificateQuery::new("nokey.example.test"))
        .unwrap_err();
    assert!(matches!(err, CertificateError::MissingPrivateKey { .. }));
}

#[test]
fn empty_subject_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let err = DirectoryStore::new(dir.path())
        .resolve(&CertificateQuery::new(""))
        .unwrap_err();
    assert!(matches!(err, CertificateError::EmptySubject));
}
