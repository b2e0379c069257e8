//! Server connection - establishes a TCP connection to a `modsync serve` instance
//!
//! Provides raw read/write halves. Protocol handling is done by `Connection`.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// An open connection to a sync server
pub struct ServerConnection {
    stream: TcpStream,
}

impl ServerConnection {
    /// Connect to a server, giving up after `timeout`
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("Timed out connecting to {}", addr))?
            .with_context(|| format!("Failed to connect to {}", addr))?;
        stream.set_nodelay(true)?;
        tracing::debug!("Connected to {}", addr);
        Ok(Self { stream })
    }

    /// Split into read/write halves for protocol handling
    pub fn split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}
