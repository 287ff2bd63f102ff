//! Accept loop and server lifecycle.
//!
//! # Responsibilities
//! - Own the listening socket from `start` until stop is observed
//! - Dispatch every accepted connection to its own task
//! - Negotiate TLS on that task when a certificate is configured
//! - Resolve the server certificate on a blocking worker
//!
//! # Design Decisions
//! - The accept loop never awaits a session; dispatch is fire-and-forget
//! - Per-connection failures are logged, counted and the connection dropped
//! - Stop preempts a pending accept and any handshake still in flight
//! - Transient accept errors are retried, anything else ends the loop

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::Instrument;

use crate::cert::{CertificateProvider, CertificateQuery, DirectoryStore};
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::lifecycle::Shutdown;
use crate::net::connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
use crate::net::listener::{is_transient_accept_error, Accept, ConnectionPermit, Listener};
use crate::net::session::{ClientSession, SessionStream};
use crate::net::tls::{HandshakePolicy, TlsHandshaker};
use crate::observability::metrics;

/// Pause after a transient accept error before accepting again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Lifecycle of a [`Server`]. There is no way back from `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening(SocketAddr),
    Stopped,
}

/// A connection that is ready for application traffic.
///
/// Holds the connection slot and the tracking guard; both are released
/// when this value is dropped, which also closes the connection.
pub struct AcceptedSession {
    peer_addr: SocketAddr,
    session: ClientSession<TcpStream>,
    _permit: ConnectionPermit,
    guard: ConnectionGuard,
}

impl AcceptedSession {
    pub fn id(&self) -> ConnectionId {
        self.guard.id()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn tls_enabled(&self) -> bool {
        self.session.tls_enabled()
    }

    /// Bidirectional byte stream. Secured streams carry the read and write
    /// idle timeouts set by the handshake.
    pub fn stream(&mut self) -> SessionStream<'_, TcpStream> {
        self.session.stream()
    }
}

impl std::fmt::Debug for AcceptedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptedSession")
            .field("id", &self.id())
            .field("peer_addr", &self.peer_addr)
            .field("session", &self.session)
            .finish()
    }
}

/// Application-side consumer of established sessions.
///
/// Implemented for any `Fn(AcceptedSession) -> impl Future<Output = ()>`.
pub trait SessionHandler: Send + Sync + 'static {
    fn handle(&self, session: AcceptedSession) -> BoxFuture<'static, ()>;
}

impl<F, Fut> SessionHandler for F
where
    F: Fn(AcceptedSession) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, session: AcceptedSession) -> BoxFuture<'static, ()> {
        self(session).boxed()
    }
}

/// Default handler: the application layer is absent, close right away.
async fn close_session(session: AcceptedSession) {
    tracing::debug!(connection_id = %session.id(), "No session handler installed, closing");
}

/// TCP server that optionally secures each connection with TLS.
pub struct Server {
    address: SocketAddr,
    max_connections: usize,
    policy: HandshakePolicy,
    provider: Arc<dyn CertificateProvider>,
    handler: Arc<dyn SessionHandler>,
    tls: ArcSwapOption<TlsHandshaker>,
    shutdown: Shutdown,
    state: watch::Sender<ServerState>,
    tracker: ConnectionTracker,
}

impl Server {
    /// Create a server for `address`. Port 0 binds an ephemeral port.
    pub fn new(address: SocketAddr) -> Self {
        let (state, _) = watch::channel(ServerState::Created);
        Self {
            address,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            policy: HandshakePolicy::default(),
            provider: Arc::new(DirectoryStore::new("certs")),
            handler: Arc::new(close_session),
            tls: ArcSwapOption::empty(),
            shutdown: Shutdown::new(),
            state,
            tracker: ConnectionTracker::new(),
        }
    }

    /// Build a server from validated configuration. TLS is not initialized
    /// here; call [`Server::initialize_tls`] with [`TlsConfig::query`].
    ///
    /// [`TlsConfig::query`]: crate::config::TlsConfig::query
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let address = config
            .listener
            .socket_addr()
            .map_err(|_| ServerError::InvalidArgument("listener address is not an IP address"))?;
        let mut server =
            Server::new(address).with_max_connections(config.listener.max_connections);
        if let Some(tls) = &config.tls {
            server = server
                .with_certificate_provider(DirectoryStore::new(&tls.store_root))
                .with_handshake_policy(tls.handshake_policy()?);
        }
        Ok(server)
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_handshake_policy(mut self, policy: HandshakePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_certificate_provider<P>(mut self, provider: P) -> Self
    where
        P: CertificateProvider + 'static,
    {
        self.provider = Arc::new(provider);
        self
    }

    pub fn with_handler<H: SessionHandler>(mut self, handler: H) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.state() {
            ServerState::Listening(addr) => Some(addr),
            _ => None,
        }
    }

    /// Wait until the server leaves `Created`. Returns the bound address,
    /// or `None` if it was stopped without ever listening.
    pub async fn wait_until_listening(&self) -> Option<SocketAddr> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| !matches!(s, ServerState::Created))
            .await
            .ok()?;
        match state {
            ServerState::Listening(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.load().is_some()
    }

    /// Subject of the certificate currently presented to clients.
    pub fn tls_subject(&self) -> Option<String> {
        self.tls
            .load_full()
            .and_then(|h| h.subject().map(str::to_owned))
    }

    /// Sessions accepted and not yet closed, including those still handshaking.
    pub fn active_sessions(&self) -> u64 {
        self.tracker.active_count()
    }

    pub fn connection_tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Resolve the server certificate and enable TLS for connections
    /// accepted from now on.
    ///
    /// On failure TLS stays as it was. Calling again replaces the
    /// certificate; sessions already negotiating keep the old one.
    pub async fn initialize_tls(&self, query: CertificateQuery) -> Result<()> {
        let provider = Arc::clone(&self.provider);
        let subject = query.subject.clone();

        let identity = tokio::task::spawn_blocking(move || provider.resolve(&query))
            .await
            .map_err(|e| ServerError::TaskFailed(e.to_string()))?
            .inspect_err(|e| {
                tracing::error!(subject = %subject, error = %e, "Certificate lookup failed")
            })?;

        let handshaker = TlsHandshaker::from_identity(&identity, self.policy.clone())?;
        let replaced = self.tls.swap(Some(Arc::new(handshaker))).is_some();

        tracing::info!(
            subject = %identity.subject(),
            chain_len = identity.chain().len(),
            replaced,
            "TLS initialized"
        );
        Ok(())
    }

    /// Bind and run the accept loop until stopped.
    ///
    /// Fails with `InvalidState` unless the server is freshly created.
    pub async fn start(&self) -> Result<()> {
        if self.state() != ServerState::Created {
            return Err(ServerError::InvalidState("server can only be started once"));
        }

        // Declared before the listener so the socket closes first.
        let mut lifecycle = StopOnExit {
            shutdown: &self.shutdown,
            state: &self.state,
            armed: false,
        };

        let bound = Listener::bind(self.address, self.max_connections)
            .await
            .and_then(|l| {
                let addr = l.local_addr().map_err(ServerError::Transport)?;
                Ok((l, addr))
            });
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                let stopped = self.state.send_if_modified(|state| {
                    if *state == ServerState::Created {
                        *state = ServerState::Stopped;
                        true
                    } else {
                        false
                    }
                });
                if stopped {
                    self.shutdown.trigger();
                }
                tracing::error!(address = %self.address, error = %e, "Failed to bind listener");
                return Err(e);
            }
        };

        let published = self.state.send_if_modified(|state| {
            if *state == ServerState::Created {
                *state = ServerState::Listening(local_addr);
                true
            } else {
                false
            }
        });
        if !published {
            return Err(ServerError::InvalidState(
                "server was stopped before it started listening",
            ));
        }
        lifecycle.armed = true;

        tracing::info!(address = %local_addr, tls = self.tls_enabled(), "Server listening");

        let result = self.accept_loop(&listener).await;
        drop(listener);

        match &result {
            Ok(()) => tracing::info!(address = %local_addr, "Server stopped"),
            Err(e) => tracing::error!(address = %local_addr, error = %e, "Server stopped on error"),
        }
        result
    }

    /// Request stop and wait until the listening socket is closed.
    ///
    /// Safe to call repeatedly and before `start`. Sessions already handed
    /// to the application are left running.
    pub async fn stop(&self) {
        if self.shutdown.trigger() {
            tracing::info!("Stop requested");
        }

        self.state.send_if_modified(|state| {
            if *state == ServerState::Created {
                *state = ServerState::Stopped;
                true
            } else {
                false
            }
        });

        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ServerState::Stopped).await;
    }

    async fn accept_loop<A: Accept>(&self, listener: &A) -> Result<()> {
        loop {
            if self.shutdown.is_triggered() {
                return Ok(());
            }

            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => return Ok(()),
                res = listener.accept() => res,
            };

            match accepted {
                Ok((stream, peer_addr, permit)) => self.dispatch(stream, peer_addr, permit),
                Err(e) if is_transient_accept_error(&e) => {
                    metrics::record_accept_error("transient");
                    tracing::warn!(error = %e, "Transient accept error, retrying");
                    tokio::select! {
                        _ = self.shutdown.triggered() => return Ok(()),
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
                Err(e) => {
                    metrics::record_accept_error("fatal");
                    return Err(ServerError::Transport(e));
                }
            }
        }
    }

    fn dispatch(&self, stream: TcpStream, peer_addr: SocketAddr, permit: ConnectionPermit) {
        metrics::record_accepted();

        let handshaker = self.tls.load_full();
        let guard = self.tracker.track();
        let handler = Arc::clone(&self.handler);
        let shutdown = self.shutdown.clone();
        let span = tracing::info_span!(
            "session",
            connection_id = %guard.id(),
            peer_addr = %peer_addr
        );

        tokio::spawn(
            async move {
                let mut session = ClientSession::new(stream, handshaker.is_some());

                if let Some(handshaker) = handshaker {
                    let outcome = tokio::select! {
                        res = handshaker.negotiate(Some(session.stream())) => res,
                        _ = shutdown.triggered() => Err(ServerError::Cancelled),
                    };
                    match outcome {
                        Ok(()) => metrics::record_handshake("ok"),
                        Err(e) => {
                            metrics::record_handshake(e.kind());
                            tracing::warn!(error = %e, "Handshake failed, dropping connection");
                            return;
                        }
                    }
                }

                handler
                    .handle(AcceptedSession {
                        peer_addr,
                        session,
                        _permit: permit,
                        guard,
                    })
                    .await;
            }
            .instrument(span),
        );
    }
}

/// Moves a listening server to `Stopped` however `start` exits, including
/// when its future is dropped.
struct StopOnExit<'a> {
    shutdown: &'a Shutdown,
    state: &'a watch::Sender<ServerState>,
    armed: bool,
}

impl Drop for StopOnExit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shutdown.trigger();
            self.state.send_replace(ServerState::Stopped);
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("tls_enabled", &self.tls_enabled())
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{MemoryStore, StoreLocation, StoreName};
    use crate::error::CertificateError;
    use crate::testing;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fails with the queued errors, then waits forever.
    struct FailingAccept {
        errors: Mutex<VecDeque<io::Error>>,
        calls: AtomicUsize,
    }

    impl FailingAccept {
        fn new(kinds: &[io::ErrorKind]) -> Self {
            Self {
                errors: Mutex::new(kinds.iter().map(|&k| io::Error::from(k)).collect()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Accept for FailingAccept {
        fn accept(
            &self,
        ) -> impl Future<Output = io::Result<(TcpStream, SocketAddr, ConnectionPermit)>> + Send
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.errors.lock().unwrap().pop_front();
            async move {
                match next {
                    Some(err) => Err(err),
                    None => std::future::pending().await,
                }
            }
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn stop_before_start_prevents_listening() {
        let server = Server::new(loopback());
        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(matches!(
            server.start().await,
            Err(ServerError::InvalidState(_))
        ));
        assert_eq!(server.wait_until_listening().await, None);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let server = Arc::new(Server::new(loopback()));
        let runner = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.start().await })
        };
        server.wait_until_listening().await.unwrap();

        server.stop().await;
        server.stop().await;
        runner.await.unwrap().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn dropping_start_future_stops_server() {
        let server = Arc::new(Server::new(loopback()));
        let runner = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.start().await })
        };
        let addr = server.wait_until_listening().await.unwrap();

        runner.abort();
        assert!(runner.await.unwrap_err().is_cancelled());

        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.local_addr(), None);
        tokio::time::timeout(Duration::from_secs(3), server.stop())
            .await
            .expect("stop after an aborted start must return");
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_accept_errors_are_retried() {
        let server = Server::new(loopback());
        let source = FailingAccept::new(&[
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
        ]);

        let stopper = async {
            while source.calls() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            server.shutdown.trigger();
        };
        let (result, ()) = tokio::join!(server.accept_loop(&source), stopper);

        assert!(result.is_ok());
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_accept_error_ends_loop() {
        let server = Server::new(loopback());
        let source = FailingAccept::new(&[io::ErrorKind::PermissionDenied]);

        match server.accept_loop(&source).await {
            Err(ServerError::Transport(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn missing_certificate_leaves_tls_disabled() {
        let server = Server::new(loopback()).with_certificate_provider(MemoryStore::new());
        let err = server
            .initialize_tls(CertificateQuery::new("absent.example.test"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Certificate(CertificateError::NotFound { .. })
        ));
        assert!(!server.tls_enabled());
    }

    #[tokio::test]
    async fn reinitializing_replaces_certificate() {
        let mut store = MemoryStore::new();
        for subject in ["one.example.test", "two.example.test"] {
            let cert = testing::self_signed(subject);
            store
                .insert_pem(
                    StoreLocation::CurrentUser,
                    StoreName::My,
                    subject,
                    cert.cert_pem.as_bytes(),
                    Some(cert.key_pem.as_bytes()),
                )
                .unwrap();
        }
        let server = Server::new(loopback()).with_certificate_provider(store);

        server
            .initialize_tls(CertificateQuery::new("one.example.test"))
            .await
            .unwrap();
        assert_eq!(server.tls_subject().as_deref(), Some("CN=one.example.test"));

        server
            .initialize_tls(CertificateQuery::new("two.example.test"))
            .await
            .unwrap();
        assert_eq!(server.tls_subject().as_deref(), Some("CN=two.example.test"));

        // a failed lookup keeps the current identity
        assert!(server
            .initialize_tls(CertificateQuery::new("three.example.test"))
            .await
            .is_err());
        assert_eq!(server.tls_subject().as_deref(), Some("CN=two.example.test"));
    }

    #[tokio::test]
    async fn bind_failure_moves_to_stopped() {
        let occupied = std::net::TcpListener::bind(loopback()).unwrap();
        let server = Server::new(occupied.local_addr().unwrap());
        assert!(matches!(server.start().await, Err(ServerError::Bind { .. })));
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.wait_until_listening().await, None);
    }

    #[tokio::test]
    async fn from_config_rejects_bad_address() {
        let mut config = ServerConfig::default();
        config.listener.address = "localhost".into();
        assert!(matches!(
            Server::from_config(&config),
            Err(ServerError::InvalidArgument(_))
        ));
    }
}
