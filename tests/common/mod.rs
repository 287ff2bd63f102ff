//! Shared utilities for integration tests.

#![allow(dead_code, unused_imports)]

mod certs;

pub use certs::{connector, expired, self_signed, server_name, TestCert};

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;

use tls_acceptor::{Server, ServerError};

/// Personal store of the current user under `root`.
pub fn personal_store(root: &Path) -> PathBuf {
    let dir = root.join("current-user").join("my");
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Write `cert` as `<name>.pem`, embedding the key or writing `<name>.key`.
pub fn write_entry(root: &Path, name: &str, cert: &TestCert, embed_key: bool) {
    let dir = personal_store(root);
    if embed_key {
        let bundle = format!("{}{}", cert.cert_pem, cert.key_pem);
        fs::write(dir.join(format!("{name}.pem")), bundle).unwrap();
    } else {
        fs::write(dir.join(format!("{name}.pem")), &cert.cert_pem).unwrap();
        fs::write(dir.join(format!("{name}.key")), &cert.key_pem).unwrap();
    }
}

pub async fn tls_connect(
    addr: SocketAddr,
    cert: &TestCert,
    name: &str,
) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    connector(cert).connect(server_name(name), tcp).await
}

/// Run `server` in the background and wait until it listens.
pub async fn spawn_server(
    server: Arc<Server>,
) -> (SocketAddr, JoinHandle<Result<(), ServerError>>) {
    let runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };
    let addr = tokio::time::timeout(Duration::from_secs(5), server.wait_until_listening())
        .await
        .expect("server did not start in time")
        .expect("server stopped before listening");
    (addr, runner)
}

/// Poll until `server` reports `count` live sessions.
pub async fn wait_for_sessions(server: &Server, count: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.active_sessions() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session count never reached");
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}
