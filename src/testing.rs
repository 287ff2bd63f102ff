//! Helpers shared by unit tests.

#[path = "../tests/common/certs.rs"]
mod certs;

pub(crate) use certs::{connector, self_signed, server_name, TestCert};

use crate::cert::{
    CertificateProvider, CertificateQuery, MemoryStore, ServerIdentity, StoreLocation, StoreName,
};

pub(crate) fn identity(cert: &TestCert, subject: &str) -> ServerIdentity {
    let mut store = MemoryStore::new();
    store
        .insert_pem(
            StoreLocation::CurrentUser,
            StoreName::My,
            subject,
            cert.cert_pem.as_bytes(),
            Some(cert.key_pem.as_bytes()),
        )
        .unwrap();
    store.resolve(&CertificateQuery::new(subject)).unwrap()
}
