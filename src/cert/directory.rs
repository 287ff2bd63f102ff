//! File-backed certificate store.
//!
//! Layout: `<root>/<location>/<store-name>/`, one certificate per file.
//! A file may embed its private key, or the key may live next to it with
//! the same stem and a `.key` extension. Entries are enumerated in
//! file-name order so "first match" is stable across runs.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::cert::store::{
    select_identity, AccessMode, CertificateProvider, CertificateQuery, ServerIdentity, StoreEntry,
};
use crate::error::CertificateError;

const CERT_EXTENSIONS: &[&str] = &["pem", "crt", "cer"];

/// A certificate store rooted at a directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory backing the store selected by `query`.
    pub fn store_path(&self, query: &CertificateQuery) -> PathBuf {
        self.root
            .join(query.store_location.as_str())
            .join(query.store_name.as_str())
    }

    fn open(&self, query: &CertificateQuery) -> Result<OpenStore, CertificateError> {
        let path = self.store_path(query);

        match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(CertificateError::StoreUnavailable {
                    path,
                    source: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if query.open_existing_only {
                    return Err(CertificateError::StoreUnavailable { path, source: e });
                }
                match query.access {
                    AccessMode::ReadWrite => {
                        fs::create_dir_all(&path).map_err(|source| {
                            CertificateError::StoreUnavailable {
                                path: path.clone(),
                                source,
                            }
                        })?;
                        tracing::info!(store = %path.display(), "Created certificate store");
                    }
                    AccessMode::ReadOnly => {
                        tracing::debug!(
                            store = %path.display(),
                            "Certificate store missing, treating as empty"
                        );
                        return Ok(OpenStore::empty(path));
                    }
                }
            }
            Err(source) => return Err(CertificateError::StoreUnavailable { path, source }),
        }

        let mut files = Vec::new();
        let entries = fs::read_dir(&path).map_err(|source| CertificateError::StoreUnavailable {
            path: path.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();

        tracing::trace!(store = %path.display(), files = files.len(), "Certificate store opened");
        Ok(OpenStore { path, files })
    }
}

impl CertificateProvider for DirectoryStore {
    fn resolve(&self, query: &CertificateQuery) -> Result<ServerIdentity, CertificateError> {
        query.validate()?;
        let store = self.open(query)?;
        select_identity(query, store.entries())
    }
}

/// Handle on an opened store. Released when dropped, on every exit path.
struct OpenStore {
    path: PathBuf,
    files: Vec<PathBuf>,
}

impl OpenStore {
    fn empty(path: PathBuf) -> Self {
        Self {
            path,
            files: Vec::new(),
        }
    }

    /// Certificate entries in enumeration order. Unreadable entries are
    /// skipped with a warning rather than failing the whole lookup.
    fn entries(&self) -> Vec<StoreEntry> {
        self.files
            .iter()
            .filter(|path| is_certificate_file(path))
            .filter_map(|path| match load_entry(path) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Skipping store entry");
                    None
                }
            })
            .collect()
    }
}

impl Drop for OpenStore {
    fn drop(&mut self) {
        tracing::trace!(store = %self.path.display(), "Certificate store closed");
    }
}

fn is_certificate_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| CERT_EXTENSIONS.iter().any(|c| ext.eq_ignore_ascii_case(c)))
        .unwrap_or(false)
}

fn load_entry(path: &Path) -> Result<StoreEntry, CertificateError> {
    let cert_pem = fs::read(path)?;
    let key_path = path.with_extension("key");
    let key_pem = match fs::read(&key_path) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    StoreEntry::from_pem(path, &cert_pem, key_pem.as_deref())
}
