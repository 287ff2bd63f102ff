//! Error types shared across the acceptor.
//!
//! Certificate lookup failures are kept apart from per-connection failures:
//! the former surface to whoever calls `initialize_tls`, the latter never
//! leave the task that owns the connection.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while resolving a server identity from a certificate store.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// No certificate in the store matched the subject name.
    #[error("no certificate matching subject {subject:?} was found in the store")]
    NotFound { subject: String },

    /// More than one certificate matched and the query demanded a unique match.
    #[error("{count} certificates match subject {subject:?}, expected exactly one")]
    Ambiguous { subject: String, count: usize },

    /// The subject name was empty.
    #[error("certificate subject name must not be empty")]
    EmptySubject,

    /// The store could not be opened.
    #[error("certificate store {path:?} is unavailable: {source}")]
    StoreUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A matching certificate was found but it carries no usable private key.
    #[error("certificate for subject {subject:?} has no accessible private key")]
    MissingPrivateKey { subject: String },

    /// A store entry could not be parsed.
    #[error("malformed store entry {path:?}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("certificate store I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors produced by the server, the handshake orchestrator and sessions.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// A caller passed an argument the operation cannot work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The operation was attempted before the server was ready for it.
    #[error("precondition failed: {0}")]
    PreconditionFailed(&'static str),

    /// TLS negotiation with the peer failed.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(#[source] io::Error),

    /// The work was abandoned because the server is stopping.
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// Accept or socket-level I/O failure.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The resolved identity was rejected by the TLS library.
    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),

    /// The client certificate policy could not be turned into a verifier.
    #[error("client certificate verifier rejected: {0}")]
    ClientVerifier(#[from] rustls::server::VerifierBuilderError),

    /// The lifecycle does not allow the requested transition.
    #[error("invalid server state: {0}")]
    InvalidState(&'static str),

    /// A background worker died before producing a result.
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T, E = ServerError> = std::result::Result<T, E>;

impl ServerError {
    /// Short label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::Certificate(_) => "certificate",
            ServerError::InvalidArgument(_) => "invalid_argument",
            ServerError::PreconditionFailed(_) => "precondition_failed",
            ServerError::HandshakeFailed(_) => "handshake_failed",
            ServerError::Cancelled => "cancelled",
            ServerError::Transport(_) => "transport",
            ServerError::Bind { .. } => "bind",
            ServerError::Tls(_) => "tls",
            ServerError::ClientVerifier(_) => "client_verifier",
            ServerError::InvalidState(_) => "invalid_state",
            ServerError::TaskFailed(_) => "task_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_errors_convert_into_server_errors() {
        let err: ServerError = CertificateError::NotFound {
            subject: "example.test".into(),
        }
        .into();
        assert_eq!(err.kind(), "certificate");
        assert!(err.to_string().contains("example.test"));
    }

    #[test]
    fn handshake_failure_keeps_source() {
        let err =
            ServerError::HandshakeFailed(io::Error::new(io::ErrorKind::InvalidData, "bad hello"));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.kind(), "handshake_failed");
    }
}
