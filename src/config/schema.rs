//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cert::{
    AccessMode, CertificateQuery, ClientTrust, MatchPolicy, StoreLocation, StoreName,
};
use crate::error::CertificateError;
use crate::net::tls::{HandshakePolicy, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::observability::logging::LogFormat;

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, port, limits).
    pub listener: ListenerConfig,

    /// TLS configuration. Absent means a plain TCP server.
    pub tls: Option<TlsConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind IP address.
    pub address: String,

    /// Bind port; 0 picks an ephemeral port.
    pub port: u16,

    /// Maximum concurrent sessions (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED.to_string(),
            port: 7443,
            max_connections: 10_000,
        }
    }
}

impl ListenerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let ip: IpAddr = self.address.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// TLS configuration: where to find the server certificate.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Subject name to look up.
    pub subject: String,

    /// Root directory of the file-backed certificate store.
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,

    #[serde(default)]
    pub store_name: StoreName,

    #[serde(default)]
    pub store_location: StoreLocation,

    #[serde(default)]
    pub access: AccessMode,

    /// Fail when the store directory does not exist.
    #[serde(default)]
    pub open_existing_only: bool,

    /// Only accept certificates inside their validity window.
    #[serde(default)]
    pub valid_only: bool,

    #[serde(default)]
    pub match_policy: MatchPolicy,

    /// Handshake deadline in milliseconds.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Demand a client certificate during the handshake.
    #[serde(default)]
    pub require_client_certificate: bool,

    /// Check client certificates against the CRLs in `client_trust_file`.
    #[serde(default = "default_true")]
    pub check_revocation: bool,

    /// PEM file with the CAs (and optional CRLs) for client certificates.
    #[serde(default)]
    pub client_trust_file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_store_root() -> PathBuf {
    PathBuf::from("certs")
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64
}

impl TlsConfig {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            store_root: default_store_root(),
            store_name: StoreName::default(),
            store_location: StoreLocation::default(),
            access: AccessMode::default(),
            open_existing_only: false,
            valid_only: false,
            match_policy: MatchPolicy::default(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            require_client_certificate: false,
            check_revocation: true,
            client_trust_file: None,
        }
    }

    pub fn query(&self) -> CertificateQuery {
        CertificateQuery::new(self.subject.clone())
            .store(self.store_name, self.store_location)
            .access(self.access)
            .open_existing_only(self.open_existing_only)
            .valid_only(self.valid_only)
            .match_policy(self.match_policy)
    }

    /// Handshake policy, reading `client_trust_file` when client
    /// certificates are required.
    pub fn handshake_policy(&self) -> Result<HandshakePolicy, CertificateError> {
        let trust = match (&self.client_trust_file, self.require_client_certificate) {
            (Some(path), true) => ClientTrust::load(path)?,
            _ => ClientTrust::default(),
        };
        Ok(HandshakePolicy {
            require_client_certificate: self.require_client_certificate,
            check_revocation: self.check_revocation,
            client_roots: trust.roots,
            client_crls: trust.crls,
            handshake_timeout: Some(Duration::from_millis(self.handshake_timeout_ms)),
            ..HandshakePolicy::default()
        })
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
