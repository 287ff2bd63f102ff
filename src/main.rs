//! TLS acceptor daemon.
//!
//! ```text
//!   client ──TCP──▶ listener ──▶ session task ──TLS handshake──▶ echo handler
//!                      ▲                            ▲
//!                      │                            │
//!                 stop (signal)          certificate store lookup
//!                                         (once, at startup)
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tls_acceptor::config::{load_config, ServerConfig, TlsConfig};
use tls_acceptor::lifecycle::signals;
use tls_acceptor::observability::{logging, metrics};
use tls_acceptor::{AcceptedSession, Server};

/// How long to let established sessions finish after stop.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "tls-acceptor")]
#[command(about = "TCP server that secures connections with a certificate from a store", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind IP address.
    #[arg(long)]
    address: Option<String>,

    /// Override the bind port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Certificate subject; enables TLS.
    #[arg(short, long)]
    subject: Option<String>,

    /// Root directory of the certificate store.
    #[arg(long)]
    store_root: Option<PathBuf>,
}

impl Cli {
    fn apply(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(address) = self.address {
            config.listener.address = address;
        }
        if let Some(port) = self.port {
            config.listener.port = port;
        }
        if let Some(subject) = self.subject {
            let tls = config.tls.get_or_insert_with(|| TlsConfig::new(subject.clone()));
            tls.subject = subject;
        }
        if let (Some(root), Some(tls)) = (self.store_root, config.tls.as_mut()) {
            tls.store_root = root;
        }
        config
    }
}

/// Echo bytes back until the peer closes or goes idle.
async fn echo(mut session: AcceptedSession) {
    let id = session.id();
    let mut stream = session.stream();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(connection_id = %id, error = %e, "Session read ended");
                break;
            }
        };
        if let Err(e) = stream.write_all(&buf[..n]).await {
            tracing::debug!(connection_id = %id, error = %e, "Session write ended");
            break;
        }
    }
    let _ = stream.shutdown().await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    let config = cli.apply(config);
    // overrides may have broken an otherwise valid file
    if let Err(errors) = tls_acceptor::config::validation::validate_config(&config) {
        return Err(tls_acceptor::config::ConfigError::Validation(errors).into());
    }

    logging::init(
        &config.observability.log_level,
        config.observability.log_format,
    )?;

    tracing::info!("tls-acceptor v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        address = %config.listener.address,
        port = config.listener.port,
        max_connections = config.listener.max_connections,
        tls = config.tls.is_some(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let server = Arc::new(Server::from_config(&config)?.with_handler(echo));

    if let Some(tls) = &config.tls {
        server.initialize_tls(tls.query()).await?;
    }

    let mut runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };

    tokio::select! {
        res = &mut runner => {
            // the accept loop ended on its own, which only happens on error
            res??;
            return Ok(());
        }
        _ = signals::termination() => {
            server.stop().await;
            runner.await??;
        }
    }

    if !server.connection_tracker().wait_for_drain(DRAIN_TIMEOUT).await {
        tracing::warn!(
            active_sessions = server.active_sessions(),
            "Sessions still open after drain timeout"
        );
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
