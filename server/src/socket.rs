//! Listening sockets for Wyoming endpoints.

use anyhow::{Context, Result};
use casabot_proto::{Transport, WyomingUri};
use std::io;
use std::path::{Path, PathBuf};
use tokio::net::{TcpListener, UnixListener};
use tracing::debug;

/// A bound TCP or Unix listener.
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Bind the endpoint, removing a stale Unix socket if present.
    pub async fn bind(uri: &WyomingUri) -> Result<Self> {
        match uri {
            WyomingUri::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .with_context(|| format!("Failed to bind {uri}"))?;
                Ok(Listener::Tcp(listener))
            }
            WyomingUri::Unix(path) => {
                let listener = create_unix_listener(path)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// Wait for the next client.
    pub async fn accept(&self) -> io::Result<Box<dyn Transport>> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                debug!(peer = %peer, "Accepted TCP connection");
                Ok(Box::new(stream))
            }
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }

    /// The address actually bound, with the real port for `tcp://host:0`.
    pub fn local_uri(&self) -> io::Result<WyomingUri> {
        match self {
            Listener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(WyomingUri::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
            }
            Listener::Unix { path, .. } => Ok(WyomingUri::Unix(path.clone())),
        }
    }

    /// Remove the socket file of a Unix listener.
    pub fn cleanup(&self) {
        if let Listener::Unix { path, .. } = self {
            cleanup_socket(path);
        }
    }
}

fn create_unix_listener(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path).context("Failed to remove existing socket")?;
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }
    UnixListener::bind(path).context("Failed to bind Unix socket")
}

fn cleanup_socket(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
#[path = "socket_test.rs"]
mod tests;
