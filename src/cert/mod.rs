//! Certificate provider subsystem.
//!
//! # Data Flow
//! ```text
//! CertificateQuery (subject + store selection)
//!     → CertificateProvider::resolve (blocking, run off the reactor)
//!         → directory.rs (PEM files on disk) | memory.rs (tests, embedding)
//!     → ServerIdentity (chain + private key)
//!     → net::tls builds the rustls server config from it
//! ```
//!
//! # Design Decisions
//! - Providers are blocking; the server wraps them in `spawn_blocking`
//! - Subject match is a case-insensitive substring of the subject DN
//! - Ties resolve to the first entry in enumeration order unless
//!   `MatchPolicy::Unique` is requested

pub mod directory;
pub mod memory;
pub mod store;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;
pub use store::{
    AccessMode, CertificateProvider, CertificateQuery, ClientTrust, MatchPolicy, ServerIdentity,
    StoreLocation, StoreName,
};
