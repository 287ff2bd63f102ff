//! TLS-capable TCP acceptor.
//!
//! Listens on an address, accepts connections and, when a server
//! certificate has been resolved from a certificate store, negotiates TLS
//! on each of them before handing the stream to the application.

pub mod cert;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod server;

#[cfg(test)]
mod testing;

pub use cert::{CertificateProvider, CertificateQuery, ServerIdentity};
pub use config::ServerConfig;
pub use error::{CertificateError, ServerError};
pub use lifecycle::Shutdown;
pub use server::{AcceptedSession, Server, ServerState, SessionHandler};
