//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Listener, handshaker and sessions produce:
//!     → logging.rs (structured log events, connection_id / peer_addr fields)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Prometheus scrape endpoint (optional)
//! ```

pub mod logging;
pub mod metrics;
