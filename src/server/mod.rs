//! Server mode - runs when invoked as `modsync serve`
//!
//! Accepts TCP connections and answers each one with a [`ServerSession`]:
//! greet the client with the offered manifest, then send requested files.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::config::{Config, TransferConfig};
use crate::exchange::{
    pipeline::{Connection, ConnectionStats, SessionHandler},
    protocol::{negotiate_version, HelloClient, Message, VersionNegotiationResult},
    DescriptorRegistry, Manifest, Sender, Side,
};

/// State shared by every connection the server accepts.
#[derive(Clone)]
pub struct ServerContext {
    pub registry: Arc<DescriptorRegistry>,
    pub manifest: Arc<Manifest>,
    pub transfer: TransferConfig,
    pub mod_version: String,
}

impl ServerContext {
    pub fn from_config(config: &Config) -> Result<Self> {
        let manifest = Manifest::from_config(&config.server.files)?;
        Ok(Self {
            registry: Arc::new(DescriptorRegistry::with_defaults()),
            manifest: Arc::new(manifest),
            transfer: config.transfer.clone(),
            mod_version: config.mod_version.clone(),
        })
    }
}

/// Server end of one connection.
pub struct ServerSession {
    manifest: Arc<Manifest>,
    sender: Sender,
    mod_version: String,
    handshake_ok: bool,
}

impl ServerSession {
    pub fn new(manifest: Arc<Manifest>, mod_version: impl Into<String>) -> Self {
        Self {
            sender: Sender::new(Arc::clone(&manifest)),
            manifest,
            mod_version: mod_version.into(),
            handshake_ok: false,
        }
    }
}

#[async_trait]
impl SessionHandler for ServerSession {
    fn side(&self) -> Side {
        Side::Server
    }

    async fn handle(&mut self, message: Message) -> Result<Vec<Message>> {
        match message {
            Message::HelloServer(hello) => {
                if hello.mod_version != self.mod_version {
                    tracing::info!(
                        "Client runs mod version {}, server {}",
                        hello.mod_version,
                        self.mod_version
                    );
                }

                let offered = match negotiate_version(hello.protocol_version) {
                    VersionNegotiationResult::Supported(_) => {
                        self.handshake_ok = true;
                        self.manifest.offered().await
                    }
                    result => {
                        // Still answer so the client can report the mismatch
                        tracing::warn!("Incompatible client: {:?}, file sync disabled", result);
                        self.handshake_ok = false;
                        Vec::new()
                    }
                };
                tracing::info!("Offering {} files to client", offered.len());
                Ok(vec![Message::HelloClient(HelloClient::new(
                    self.mod_version.clone(),
                    offered,
                ))])
            }
            Message::RequestFiles(request) => {
                if !self.handshake_ok {
                    tracing::warn!("Ignoring file request before a successful handshake");
                    return Ok(Vec::new());
                }
                tracing::info!("Client requested {} files", request.identifiers.len());
                let response = self.sender.respond(&request).await;
                Ok(vec![Message::SendFiles(response)])
            }
            other => {
                tracing::debug!("Server ignoring {}", other.identifier());
                Ok(Vec::new())
            }
        }
    }
}

/// Serve one connection until the client hangs up.
pub async fn serve_connection<R, W>(
    reader: &mut R,
    writer: &mut W,
    ctx: &ServerContext,
) -> Result<ConnectionStats>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut session = ServerSession::new(Arc::clone(&ctx.manifest), ctx.mod_version.clone());
    let mut connection = Connection::new(Arc::clone(&ctx.registry), &ctx.transfer);
    connection.run(reader, writer, &mut session).await
}

/// Accept connections on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, ctx: ServerContext, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                tracing::info!("Client connected from {}", peer);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.into_split();
                    match serve_connection(&mut reader, &mut writer, &ctx).await {
                        Ok(stats) => tracing::info!(
                            "Client {} disconnected ({} frames in, {} out)",
                            peer,
                            stats.frames_received,
                            stats.frames_sent
                        ),
                        Err(e) => tracing::warn!("Connection from {} failed: {:#}", peer, e),
                    }
                });
            }
            _ = &mut shutdown => {
                tracing::info!("Shutting down");
                return Ok(());
            }
        }
    }
}

/// Main server entry point
pub async fn run_server(config: &Config) -> Result<()> {
    let ctx = ServerContext::from_config(config)?;
    for entry in ctx.manifest.iter() {
        if !entry.exists().await {
            tracing::warn!("Configured file {} does not exist yet", entry);
        }
    }

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(
        "Serving {} files on {}",
        ctx.manifest.len(),
        listener.local_addr()?
    );

    serve(listener, ctx, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await
}
