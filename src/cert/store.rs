//! Certificate lookup contract shared by every store implementation.

use std::fmt;
use std::path::Path;

use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls_pemfile::Item;
use serde::{Deserialize, Serialize};

use crate::error::CertificateError;

/// Resolves a server identity by subject name.
///
/// Lookups are blocking; async callers should run them on a blocking worker.
pub trait CertificateProvider: Send + Sync {
    fn resolve(&self, query: &CertificateQuery) -> Result<ServerIdentity, CertificateError>;
}

/// Which logical store inside a location to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreName {
    /// Personal certificates (the ones that carry private keys).
    #[default]
    My,
    Root,
    #[serde(rename = "ca")]
    CertificateAuthority,
    TrustedPeople,
    TrustedPublisher,
    AddressBook,
    AuthRoot,
    Disallowed,
}

impl StoreName {
    /// Directory name used by file-backed stores.
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::My => "my",
            StoreName::Root => "root",
            StoreName::CertificateAuthority => "ca",
            StoreName::TrustedPeople => "trusted-people",
            StoreName::TrustedPublisher => "trusted-publisher",
            StoreName::AddressBook => "address-book",
            StoreName::AuthRoot => "auth-root",
            StoreName::Disallowed => "disallowed",
        }
    }
}

/// Whose stores to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreLocation {
    #[default]
    CurrentUser,
    LocalMachine,
}

impl StoreLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreLocation::CurrentUser => "current-user",
            StoreLocation::LocalMachine => "local-machine",
        }
    }
}

/// How the store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    #[default]
    ReadOnly,
    /// Allows the store to be created if it does not exist yet.
    ReadWrite,
}

/// Tie-break applied when several certificates match the subject name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchPolicy {
    /// Take the first match in store enumeration order.
    #[default]
    First,
    /// Fail with [`CertificateError::Ambiguous`] unless exactly one matches.
    Unique,
}

/// Parameters of a lookup.
///
/// Defaults: personal store of the current user, read-only, validity
/// filtering off, first match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateQuery {
    pub subject: String,
    pub store_name: StoreName,
    pub store_location: StoreLocation,
    pub access: AccessMode,
    /// Fail instead of treating a missing store as empty.
    pub open_existing_only: bool,
    /// Only consider certificates inside their validity window.
    pub valid_only: bool,
    pub match_policy: MatchPolicy,
}

impl CertificateQuery {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            store_name: StoreName::default(),
            store_location: StoreLocation::default(),
            access: AccessMode::default(),
            open_existing_only: false,
            valid_only: false,
            match_policy: MatchPolicy::default(),
        }
    }

    pub fn store(mut self, name: StoreName, location: StoreLocation) -> Self {
        self.store_name = name;
        self.store_location = location;
        self
    }

    pub fn access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    pub fn open_existing_only(mut self, yes: bool) -> Self {
        self.open_existing_only = yes;
        self
    }

    pub fn valid_only(mut self, yes: bool) -> Self {
        self.valid_only = yes;
        self
    }

    pub fn match_policy(mut self, policy: MatchPolicy) -> Self {
        self.match_policy = policy;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), CertificateError> {
        if self.subject.trim().is_empty() {
            return Err(CertificateError::EmptySubject);
        }
        Ok(())
    }
}

/// A resolved certificate chain together with its private key.
pub struct ServerIdentity {
    subject: String,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ServerIdentity {
    pub fn new(
        subject: impl Into<String>,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            subject: subject.into(),
            chain,
            key,
        }
    }

    /// Subject distinguished name of the leaf certificate.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }
}

impl Clone for ServerIdentity {
    fn clone(&self) -> Self {
        Self {
            subject: self.subject.clone(),
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("subject", &self.subject)
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// One certificate as enumerated from a store.
pub(crate) struct StoreEntry {
    pub(crate) origin: String,
    subject: String,
    currently_valid: bool,
    chain: Vec<CertificateDer<'static>>,
    key: Option<PrivateKeyDer<'static>>,
}

impl StoreEntry {
    /// Parse PEM material. The first certificate is treated as the leaf.
    pub(crate) fn from_pem(
        origin: &Path,
        cert_pem: &[u8],
        key_pem: Option<&[u8]>,
    ) -> Result<Self, CertificateError> {
        let (chain, mut key) = read_pem(origin, cert_pem)?;
        if key.is_none() {
            if let Some(key_pem) = key_pem {
                key = read_pem(origin, key_pem)?.1;
            }
        }

        let leaf = chain.first().ok_or_else(|| CertificateError::Malformed {
            path: origin.to_path_buf(),
            reason: "no certificate block found".into(),
        })?;
        let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref()).map_err(|e| {
            CertificateError::Malformed {
                path: origin.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            origin: origin.display().to_string(),
            subject: parsed.subject().to_string(),
            currently_valid: parsed.validity().is_valid(),
            chain,
            key,
        })
    }

    fn matches(&self, needle: &str, valid_only: bool) -> bool {
        if valid_only && !self.currently_valid {
            return false;
        }
        self.subject.to_lowercase().contains(needle)
    }

    pub(crate) fn duplicate(&self) -> Self {
        Self {
            origin: self.origin.clone(),
            subject: self.subject.clone(),
            currently_valid: self.currently_valid,
            chain: self.chain.clone(),
            key: self.key.as_ref().map(|k| k.clone_key()),
        }
    }
}

fn read_pem(
    origin: &Path,
    mut pem: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, Option<PrivateKeyDer<'static>>), CertificateError> {
    let mut certs = Vec::new();
    let mut key: Option<PrivateKeyDer<'static>> = None;

    for item in rustls_pemfile::read_all(&mut pem) {
        let item = item.map_err(|e| CertificateError::Malformed {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        match item {
            Item::X509Certificate(cert) => certs.push(cert),
            Item::Pkcs8Key(k) if key.is_none() => key = Some(k.into()),
            Item::Pkcs1Key(k) if key.is_none() => key = Some(k.into()),
            Item::Sec1Key(k) if key.is_none() => key = Some(k.into()),
            _ => {}
        }
    }

    Ok((certs, key))
}

/// Trust anchors and revocation lists for verifying client certificates.
#[derive(Debug, Clone, Default)]
pub struct ClientTrust {
    pub roots: Vec<CertificateDer<'static>>,
    pub crls: Vec<CertificateRevocationListDer<'static>>,
}

impl ClientTrust {
    /// Read CA certificates and any CRLs from one PEM file.
    pub fn load(path: &Path) -> Result<Self, CertificateError> {
        let pem = std::fs::read(path).map_err(|source| CertificateError::StoreUnavailable {
            path: path.to_path_buf(),
            source,
        })?;

        let mut trust = ClientTrust::default();
        for item in rustls_pemfile::read_all(&mut pem.as_slice()) {
            match item.map_err(|e| CertificateError::Malformed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })? {
                Item::X509Certificate(cert) => trust.roots.push(cert),
                Item::Crl(crl) => trust.crls.push(crl),
                _ => {}
            }
        }

        if trust.roots.is_empty() {
            return Err(CertificateError::Malformed {
                path: path.to_path_buf(),
                reason: "no CA certificates".into(),
            });
        }
        Ok(trust)
    }
}

/// Pick the identity for `query` out of `entries`, which must be in store
/// enumeration order.
pub(crate) fn select_identity<I>(
    query: &CertificateQuery,
    entries: I,
) -> Result<ServerIdentity, CertificateError>
where
    I: IntoIterator<Item = StoreEntry>,
{
    let needle = query.subject.trim().to_lowercase();
    let mut matches: Vec<StoreEntry> = entries
        .into_iter()
        .filter(|entry| entry.matches(&needle, query.valid_only))
        .collect();

    let count = matches.len();
    if count > 1 {
        match query.match_policy {
            MatchPolicy::Unique => {
                return Err(CertificateError::Ambiguous {
                    subject: query.subject.clone(),
                    count,
                })
            }
            MatchPolicy::First => tracing::warn!(
                subject = %query.subject,
                matches = count,
                selected = %matches[0].origin,
                "Several certificates match subject, using the first"
            ),
        }
    }

    if matches.is_empty() {
        return Err(CertificateError::NotFound {
            subject: query.subject.clone(),
        });
    }
    let entry = matches.swap_remove(0);

    let key = entry.key.ok_or_else(|| CertificateError::MissingPrivateKey {
        subject: entry.subject.clone(),
    })?;

    tracing::debug!(subject = %entry.subject, origin = %entry.origin, "Certificate resolved");
    Ok(ServerIdentity::new(entry.subject, entry.chain, key))
}
