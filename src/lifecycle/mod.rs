//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Server states:
//!     Created → Listening → Stopped   (no way back to Listening)
//!
//! Shutdown (shutdown.rs):
//!     stop() → trigger token → accept loop exits → listener dropped
//!            → in-flight handshakes abandoned
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → stop()
//! ```
//!
//! # Design Decisions
//! - One token per server instance, never global
//! - The token is sticky: a stopped server cannot be restarted

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
