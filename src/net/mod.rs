//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, connection limits)
//!     → session.rs (ClientSession, plain or secured stream)
//!     → tls.rs (optional TLS handshake)
//!     → timeout.rs (read/write idle timeouts on the established stream)
//!     → connection.rs (lifecycle tracking)
//!     → Hand off to the application's SessionHandler
//!
//! Secured session states:
//!     Pending → Negotiating → Established | Closed
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each session is tracked so stop can report and drain
//! - The TLS wrapper is created lazily and at most once per session

pub mod connection;
pub mod listener;
pub mod session;
pub mod timeout;
pub mod tls;

pub use session::{ClientSession, SecuredStream, SessionStream};
pub use tls::{HandshakePolicy, TlsHandshaker, SESSION_IO_TIMEOUT};
