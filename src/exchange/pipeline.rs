//! Connection loop.
//!
//! Reads frames, resolves them through the descriptor registry, reassembles
//! chunked transfers and hands decoded messages to a [`SessionHandler`].
//! Replies are written back, split into chunks when they exceed the message
//! size limit.

use crate::config::TransferConfig;
use crate::exchange::chunker::{Chunker, Reassembler, MAX_TRANSFER_SIZE};
use crate::exchange::protocol::{frame, read_payload, split_inner, write_frame, Message};
use crate::exchange::registry::{DescriptorFlags, DescriptorRegistry, Side};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// One end of the exchange.
#[async_trait]
pub trait SessionHandler: Send {
    fn side(&self) -> Side;

    /// Messages to send as soon as the connection is up.
    async fn on_connect(&mut self) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }

    /// Handle one message, returning any replies.
    async fn handle(&mut self, message: Message) -> Result<Vec<Message>>;

    /// Stop reading once the session has nothing left to do.
    fn is_finished(&self) -> bool {
        false
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ConnectionStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub messages_dropped: u64,
    pub transfers_reassembled: u64,
}

pub struct Connection {
    registry: Arc<DescriptorRegistry>,
    max_message_size: usize,
    chunker: Chunker,
    reassembler: Reassembler,
    stats: ConnectionStats,
}

impl Connection {
    pub fn new(registry: Arc<DescriptorRegistry>, transfer: &TransferConfig) -> Self {
        Self {
            registry,
            max_message_size: transfer.max_message_size,
            chunker: Chunker::new(transfer.fragment_size),
            reassembler: Reassembler::new(
                transfer.fragment_timeout(),
                transfer.max_pending_transfers,
            ),
            stats: ConnectionStats::default(),
        }
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Drive the connection until the peer hangs up or the handler finishes.
    ///
    /// Malformed or unexpected messages are logged and dropped; only I/O
    /// failures and oversized frames end the connection with an error.
    pub async fn run<R, W, H>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        handler: &mut H,
    ) -> Result<ConnectionStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        H: SessionHandler,
    {
        let side = handler.side();

        match handler.on_connect().await {
            Ok(messages) => self.send_all(writer, &messages).await?,
            Err(e) => tracing::error!("Session setup failed: {:#}", e),
        }

        while !handler.is_finished() {
            let Some(payload) = read_payload(reader).await? else {
                tracing::debug!("Peer closed the connection");
                break;
            };
            self.stats.frames_received += 1;

            let (identifier, body) = match split_inner(payload) {
                Ok(split) => split,
                Err(e) => {
                    tracing::warn!("Dropping frame with bad identifier: {:#}", e);
                    self.stats.messages_dropped += 1;
                    continue;
                }
            };

            let Some((message, flags)) = self.accept_frame(identifier, body, side, false) else {
                continue;
            };
            let identifier = message.identifier();

            let replies = match handler.handle(message).await {
                Ok(replies) => replies,
                Err(e) => {
                    tracing::error!("Handling {} failed: {:#}", identifier, e);
                    continue;
                }
            };

            if flags.contains(DescriptorFlags::FIRE_AND_FORGET) && !replies.is_empty() {
                tracing::warn!(
                    "Dropping {} replies to fire-and-forget message {}",
                    replies.len(),
                    identifier
                );
                continue;
            }
            if flags.contains(DescriptorFlags::REQUIRES_RESPONSE) && replies.is_empty() {
                tracing::debug!("No response to {}", identifier);
            }
            self.send_all(writer, &replies).await?;
        }

        Ok(self.stats.clone())
    }

    /// Resolve and decode one frame. Chunks are fed to the reassembler and
    /// the completed message is resolved in turn.
    fn accept_frame(
        &mut self,
        identifier: String,
        body: Bytes,
        side: Side,
        nested: bool,
    ) -> Option<(Message, DescriptorFlags)> {
        let registry = Arc::clone(&self.registry);
        let descriptor = match registry.lookup(&identifier) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::warn!("Dropping message: {}", e);
                self.stats.messages_dropped += 1;
                return None;
            }
        };

        if !descriptor.handled_on().accepts(side) {
            tracing::warn!("Dropping {}: not handled on the {:?} side", identifier, side);
            self.stats.messages_dropped += 1;
            return None;
        }

        let message = match descriptor.build(body) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping malformed {}: {:#}", identifier, e);
                self.stats.messages_dropped += 1;
                return None;
            }
        };

        let chunk = match message {
            Message::Chunk(chunk) => chunk,
            message => return Some((message, descriptor.flags())),
        };
        if nested {
            tracing::warn!("Dropping chunk nested inside a chunked transfer");
            self.stats.messages_dropped += 1;
            return None;
        }

        let payload = self.reassembler.insert(chunk)?;
        self.stats.transfers_reassembled += 1;
        match split_inner(payload) {
            Ok((identifier, body)) => self.accept_frame(identifier, body, side, true),
            Err(e) => {
                tracing::warn!("Dropping reassembled transfer: {:#}", e);
                self.stats.messages_dropped += 1;
                None
            }
        }
    }

    async fn send_all<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        messages: &[Message],
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        for message in messages {
            self.send(writer, message).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    async fn send<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        message: &Message,
    ) -> Result<()> {
        let inner = match message.encode_inner() {
            Ok(inner) => inner,
            Err(e) => {
                tracing::warn!("Cannot encode {}: {:#}", message.identifier(), e);
                return Ok(());
            }
        };

        if inner.len() <= self.max_message_size {
            write_frame(writer, &frame(&inner)?).await?;
            self.stats.frames_sent += 1;
            return Ok(());
        }

        if inner.len() as u64 > MAX_TRANSFER_SIZE {
            tracing::warn!(
                "Not sending {}: {} bytes exceeds transfer limit {}",
                message.identifier(),
                inner.len(),
                MAX_TRANSFER_SIZE
            );
            return Ok(());
        }

        let chunks = self.chunker.split(inner);
        tracing::debug!(
            "Sending {} in {} fragments of up to {} bytes",
            message.identifier(),
            chunks.len(),
            self.chunker.fragment_size()
        );
        for chunk in chunks {
            let encoded = Message::Chunk(chunk).encode_inner()?;
            write_frame(writer, &frame(&encoded)?).await?;
            self.stats.frames_sent += 1;
        }
        Ok(())
    }
}
