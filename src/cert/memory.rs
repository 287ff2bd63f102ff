//! In-memory certificate store.

use std::path::Path;

use crate::cert::store::{
    select_identity, CertificateProvider, CertificateQuery, ServerIdentity, StoreEntry,
    StoreLocation, StoreName,
};
use crate::error::CertificateError;

/// Certificate store held entirely in memory, with the same matching rules
/// as [`DirectoryStore`](crate::cert::DirectoryStore). Insertion order is
/// enumeration order.
#[derive(Default)]
pub struct MemoryStore {
    entries: Vec<(StoreLocation, StoreName, StoreEntry)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a PEM certificate chain, optionally with a separate PEM key.
    pub fn insert_pem(
        &mut self,
        location: StoreLocation,
        name: StoreName,
        label: &str,
        cert_pem: &[u8],
        key_pem: Option<&[u8]>,
    ) -> Result<(), CertificateError> {
        let entry = StoreEntry::from_pem(Path::new(label), cert_pem, key_pem)?;
        self.entries.push((location, name, entry));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CertificateProvider for MemoryStore {
    fn resolve(&self, query: &CertificateQuery) -> Result<ServerIdentity, CertificateError> {
        query.validate()?;
        let candidates = self
            .entries
            .iter()
            .filter(|(location, name, _)| {
                *location == query.store_location && *name == query.store_name
            })
            .map(|(_, _, entry)| entry.duplicate());
        select_identity(query, candidates)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}
