//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function: &ServerConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ServerConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.address {0:?} is not an IP address")]
    InvalidAddress(String),

    #[error("listener.max_connections must be greater than zero")]
    ZeroMaxConnections,

    #[error("tls.subject must not be empty")]
    EmptySubject,

    #[error("tls.handshake_timeout_ms must be greater than zero")]
    ZeroHandshakeTimeout,

    #[error("tls.require_client_certificate needs tls.client_trust_file")]
    MissingClientTrust,

    #[error("observability.metrics_address {0:?} is not a socket address")]
    InvalidMetricsAddress(String),
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.socket_addr().is_err() {
        errors.push(ValidationError::InvalidAddress(config.listener.address.clone()));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }

    if let Some(tls) = &config.tls {
        if tls.subject.trim().is_empty() {
            errors.push(ValidationError::EmptySubject);
        }
        if tls.handshake_timeout_ms == 0 {
            errors.push(ValidationError::ZeroHandshakeTimeout);
        }
        if tls.require_client_certificate && tls.client_trust_file.is_none() {
            errors.push(ValidationError::MissingClientTrust);
        }
    }

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
