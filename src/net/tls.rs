//! Server-side TLS negotiation.
//!
//! Negotiation uses the rustls defaults for protocol versions and cipher
//! suites. Client certificates are not requested unless the policy asks
//! for them; revocation is then checked against the configured CRLs.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, CertificateRevocationListDer};
use rustls::server::WebPkiClientVerifier;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::cert::ServerIdentity;
use crate::error::{Result, ServerError};
use crate::net::session::SessionStream;

/// Read and write idle timeout applied to every established session.
pub const SESSION_IO_TIMEOUT: Duration = Duration::from_millis(5000);

/// Upper bound on a single handshake unless configured otherwise.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Authentication and timing policy for negotiation and the resulting stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePolicy {
    /// Demand a client certificate signed by one of `client_roots`.
    pub require_client_certificate: bool,
    /// Reject client certificates listed in `client_crls`.
    pub check_revocation: bool,
    pub client_roots: Vec<CertificateDer<'static>>,
    pub client_crls: Vec<CertificateRevocationListDer<'static>>,
    /// `None` lets a handshake run for as long as the peer keeps it alive.
    pub handshake_timeout: Option<Duration>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for HandshakePolicy {
    fn default() -> Self {
        Self {
            require_client_certificate: false,
            check_revocation: true,
            client_roots: Vec::new(),
            client_crls: Vec::new(),
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            read_timeout: SESSION_IO_TIMEOUT,
            write_timeout: SESSION_IO_TIMEOUT,
        }
    }
}

/// Crypto backend used for every TLS configuration built by this crate.
pub fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Build the rustls server configuration for an identity.
pub fn build_server_config(
    identity: &ServerIdentity,
    policy: &HandshakePolicy,
) -> Result<Arc<rustls::ServerConfig>> {
    let provider = crypto_provider();
    let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let builder = if policy.require_client_certificate {
        let mut roots = rustls::RootCertStore::empty();
        for root in &policy.client_roots {
            roots.add(root.clone())?;
        }
        let mut verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
        if policy.check_revocation {
            if policy.client_crls.is_empty() {
                tracing::warn!("Revocation checking enabled but no CRLs are configured");
            }
            verifier = verifier.with_crls(policy.client_crls.iter().cloned());
        }
        builder.with_client_cert_verifier(verifier.build()?)
    } else {
        if policy.check_revocation {
            tracing::debug!("No client certificate requested, revocation has nothing to check");
        }
        builder.with_no_client_auth()
    };

    let config =
        builder.with_single_cert(identity.chain().to_vec(), identity.key().clone_key())?;
    Ok(Arc::new(config))
}

/// Drives the server side of the TLS handshake on session streams.
#[derive(Clone)]
pub struct TlsHandshaker {
    acceptor: Option<TlsAcceptor>,
    subject: Option<String>,
    policy: HandshakePolicy,
}

impl TlsHandshaker {
    /// A handshaker with no certificate. Every negotiation fails its
    /// precondition check.
    pub fn unconfigured(policy: HandshakePolicy) -> Self {
        Self {
            acceptor: None,
            subject: None,
            policy,
        }
    }

    pub fn from_identity(identity: &ServerIdentity, policy: HandshakePolicy) -> Result<Self> {
        let config = build_server_config(identity, &policy)?;
        Ok(Self {
            acceptor: Some(TlsAcceptor::from(config)),
            subject: Some(identity.subject().to_string()),
            policy,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Subject of the certificate presented to clients.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn policy(&self) -> &HandshakePolicy {
        &self.policy
    }

    /// Negotiate TLS on `stream`.
    ///
    /// `stream` must be the secured variant of a session that has not been
    /// negotiated yet. On failure the underlying transport is closed. On
    /// success the stream's read and write timeouts come from the policy.
    pub async fn negotiate<S>(&self, stream: Option<SessionStream<'_, S>>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = stream.ok_or(ServerError::InvalidArgument("stream is null"))?;
        let SessionStream::Secured(secured) = stream else {
            return Err(ServerError::InvalidArgument("stream is not a secured stream"));
        };
        let acceptor = self
            .acceptor
            .as_ref()
            .ok_or(ServerError::PreconditionFailed("no server certificate configured"))?;

        let transport = secured.begin_negotiation()?;
        let handshake = acceptor.accept(transport);
        let outcome = match self.policy.handshake_timeout {
            Some(limit) => match tokio::time::timeout(limit, handshake).await {
                Ok(res) => res,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("handshake did not complete within {} ms", limit.as_millis()),
                )),
            },
            None => handshake.await,
        };

        match outcome {
            Ok(tls) => {
                secured.establish(tls, self.policy.read_timeout, self.policy.write_timeout);
                tracing::debug!(
                    protocol = ?secured.protocol_version(),
                    sni = ?secured.server_name(),
                    "TLS handshake complete"
                );
                Ok(())
            }
            Err(e) => {
                secured.close();
                Err(ServerError::HandshakeFailed(e))
            }
        }
    }
}

impl std::fmt::Debug for TlsHandshaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsHandshaker")
            .field("subject", &self.subject)
            .field("policy", &self.policy)
            .finish()
    }
}
