//! Per-connection session and its stream.
//!
//! # Responsibilities
//! - Own the raw transport of one accepted connection
//! - Expose it either directly (plain) or behind a TLS wrapper (secured)
//! - Create the TLS wrapper at most once per session
//!
//! # Connection States (secured)
//! ```text
//! Pending ──negotiate──▶ Negotiating ──ok──▶ Established
//!                                 └──err──▶ Closed
//! ```

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;

use crate::error::ServerError;
use crate::net::timeout::TimeoutStream;

enum SecuredState<S> {
    /// Wrapped but not yet negotiated.
    Pending(S),
    /// Transport is owned by an in-flight handshake.
    Negotiating,
    Established(Box<TimeoutStream<TlsStream<S>>>),
    Closed,
}

/// TLS wrapper around a transport.
///
/// Owns the transport: dropping or closing the wrapper closes the
/// underlying connection. Reads and writes fail with `NotConnected` until
/// the handshake has completed.
pub struct SecuredStream<S> {
    state: SecuredState<S>,
}

impl<S> SecuredStream<S> {
    pub fn new(transport: S) -> Self {
        Self::adopt(Some(transport))
    }

    fn adopt(transport: Option<S>) -> Self {
        let state = match transport {
            Some(t) => SecuredState::Pending(t),
            None => SecuredState::Closed,
        };
        Self { state }
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, SecuredState::Established(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SecuredState::Closed)
    }

    /// A handshake currently owns the transport.
    pub fn is_negotiating(&self) -> bool {
        matches!(self.state, SecuredState::Negotiating)
    }

    /// Read idle timeout, set once the handshake succeeds.
    pub fn read_timeout(&self) -> Option<Duration> {
        match &self.state {
            SecuredState::Established(s) => s.read_timeout(),
            _ => None,
        }
    }

    /// Write idle timeout, set once the handshake succeeds.
    pub fn write_timeout(&self) -> Option<Duration> {
        match &self.state {
            SecuredState::Established(s) => s.write_timeout(),
            _ => None,
        }
    }

    /// Negotiated protocol version, if established.
    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        match &self.state {
            SecuredState::Established(s) => s.get_ref().get_ref().1.protocol_version(),
            _ => None,
        }
    }

    /// SNI name sent by the client, if any.
    pub fn server_name(&self) -> Option<&str> {
        match &self.state {
            SecuredState::Established(s) => s.get_ref().get_ref().1.server_name(),
            _ => None,
        }
    }

    /// Hand the raw transport to a handshake.
    pub(crate) fn begin_negotiation(&mut self) -> Result<S, ServerError> {
        match std::mem::replace(&mut self.state, SecuredState::Negotiating) {
            SecuredState::Pending(transport) => Ok(transport),
            other => {
                let err = match &other {
                    SecuredState::Established(_) => "stream is already negotiated",
                    SecuredState::Negotiating => "stream is being negotiated",
                    _ => "stream is closed",
                };
                self.state = other;
                Err(ServerError::PreconditionFailed(err))
            }
        }
    }

    pub(crate) fn establish(
        &mut self,
        tls: TlsStream<S>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) {
        let mut stream = TimeoutStream::new(tls);
        stream.set_read_timeout(Some(read_timeout));
        stream.set_write_timeout(Some(write_timeout));
        self.state = SecuredState::Established(Box::new(stream));
    }

    /// Drop whatever the wrapper holds, closing the transport.
    pub fn close(&mut self) {
        self.state = SecuredState::Closed;
    }
}

impl<S> std::fmt::Debug for SecuredStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            SecuredState::Pending(_) => "pending",
            SecuredState::Negotiating => "negotiating",
            SecuredState::Established(_) => "established",
            SecuredState::Closed => "closed",
        };
        f.debug_struct("SecuredStream").field("state", &state).finish()
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "TLS session is not established")
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SecuredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            SecuredState::Established(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            _ => Poll::Ready(Err(not_connected())),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SecuredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().state {
            SecuredState::Established(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            _ => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            SecuredState::Established(s) => Pin::new(s.as_mut()).poll_flush(cx),
            _ => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            SecuredState::Established(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            SecuredState::Pending(t) => Pin::new(t).poll_shutdown(cx),
            _ => Poll::Ready(Ok(())),
        }
    }
}

/// Borrowed view of a session's stream.
pub enum SessionStream<'a, S> {
    Plain(&'a mut S),
    Secured(&'a mut SecuredStream<S>),
}

impl<S> SessionStream<'_, S> {
    pub fn is_secured(&self) -> bool {
        matches!(self, SessionStream::Secured(_))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SessionStream<'_, S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(&mut **s).poll_read(cx, buf),
            SessionStream::Secured(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SessionStream<'_, S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(&mut **s).poll_write(cx, buf),
            SessionStream::Secured(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(&mut **s).poll_flush(cx),
            SessionStream::Secured(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(&mut **s).poll_shutdown(cx),
            SessionStream::Secured(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}

enum SessionKind<S> {
    Plain(S),
    Secured {
        transport: Option<S>,
        wrapper: Option<SecuredStream<S>>,
    },
}

/// One accepted connection.
pub struct ClientSession<S> {
    kind: SessionKind<S>,
}

impl<S> ClientSession<S> {
    /// Create a session; `tls_enabled` selects the secured variant.
    pub fn new(transport: S, tls_enabled: bool) -> Self {
        let kind = if tls_enabled {
            SessionKind::Secured {
                transport: Some(transport),
                wrapper: None,
            }
        } else {
            SessionKind::Plain(transport)
        };
        Self { kind }
    }

    pub fn tls_enabled(&self) -> bool {
        matches!(self.kind, SessionKind::Secured { .. })
    }

    /// Whether the TLS wrapper has been created yet.
    pub fn is_wrapped(&self) -> bool {
        matches!(self.kind, SessionKind::Secured { wrapper: Some(_), .. })
    }

    /// The session's stream. For secured sessions the wrapper is created on
    /// the first call and the same wrapper is returned afterwards.
    pub fn stream(&mut self) -> SessionStream<'_, S> {
        match &mut self.kind {
            SessionKind::Plain(transport) => SessionStream::Plain(transport),
            SessionKind::Secured { transport, wrapper } => {
                let wrapper = wrapper.get_or_insert_with(|| SecuredStream::adopt(transport.take()));
                SessionStream::Secured(wrapper)
            }
        }
    }
}

impl<S> std::fmt::Debug for ClientSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("tls_enabled", &self.tls_enabled())
            .field("wrapped", &self.is_wrapped())
            .finish()
    }
}
