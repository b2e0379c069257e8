//! Wire format for the file exchange protocol.
//!
//! Every message travels in one frame: `len:u32 | id_len:u16 | identifier | body`.
//! The identifier is resolved through the descriptor registry and the body
//! layout belongs to the message. All multi-byte integers are big-endian,
//! strings are length-prefixed (u16 len + UTF-8).

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum supported protocol version
pub const PROTOCOL_VERSION_MIN: u16 = 1;

/// Maximum supported protocol version
pub const PROTOCOL_VERSION_MAX: u16 = 1;

/// Largest message (identifier + body) the transport carries in one frame (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Longest identifier accepted on the wire
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// Maximum frame size - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = MAX_MESSAGE_SIZE as u32;

/// Length of a blake3 content hash
pub const HASH_LEN: usize = 32;

/// Fixed part of a chunk body: transfer id, index, count, total length, data length
pub const CHUNK_HEADER_LEN: usize = 8 + 4 + 4 + 8 + 4;

// =============================================================================
// Field helpers
// =============================================================================

pub fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    let len = u16::try_from(bytes.len())
        .with_context(|| format!("String too long for wire: {} bytes", bytes.len()))?;
    buf.put_u16(len);
    buf.put_slice(bytes);
    Ok(())
}

/// Read a length-prefixed string without validating its encoding.
pub fn get_string_bytes(buf: &mut Bytes, field: &str) -> Result<Bytes> {
    if buf.remaining() < 2 {
        anyhow::bail!("{} length truncated", field);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        anyhow::bail!(
            "{} truncated: expected {} bytes, got {}",
            field,
            len,
            buf.remaining()
        );
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn get_string(buf: &mut Bytes, field: &str) -> Result<String> {
    let raw = get_string_bytes(buf, field)?;
    String::from_utf8(raw.to_vec()).with_context(|| format!("Invalid UTF-8 in {}", field))
}

fn get_count(buf: &mut Bytes, field: &str) -> Result<usize> {
    if buf.remaining() < 4 {
        anyhow::bail!("{} count truncated", field);
    }
    let count = buf.get_i32();
    usize::try_from(count).with_context(|| format!("Negative {} count: {}", field, count))
}

// =============================================================================
// Frames
// =============================================================================

/// Encode `id_len | identifier | body`, the part of a frame after its length.
///
/// This is also the payload carried by a chunked transfer.
pub fn encode_inner(identifier: &str, body: &[u8]) -> Result<Bytes> {
    if identifier.len() > MAX_IDENTIFIER_LEN {
        anyhow::bail!("Identifier too long: {} bytes", identifier.len());
    }
    let mut buf = BytesMut::with_capacity(2 + identifier.len() + body.len());
    put_string(&mut buf, identifier)?;
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Prefix an encoded message with its frame length.
pub fn frame(inner: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(inner.len()).context("Frame too large")?;
    let mut buf = BytesMut::with_capacity(4 + inner.len());
    buf.put_u32(len);
    buf.put_slice(inner);
    Ok(buf.freeze())
}

/// Split an encoded message into its identifier and body.
pub fn split_inner(mut payload: Bytes) -> Result<(String, Bytes)> {
    let identifier = get_string(&mut payload, "message identifier")?;
    if identifier.len() > MAX_IDENTIFIER_LEN {
        anyhow::bail!("Identifier too long: {} bytes", identifier.len());
    }
    Ok((identifier, payload))
}

/// Read the raw payload of a single frame.
///
/// Returns `None` when the peer closed the stream at a frame boundary. The
/// payload is not inspected, so a bad identifier leaves the framing intact.
pub async fn read_payload<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Bytes>> {
    let len = match r.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read frame length"),
    };

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            len,
            MAX_FRAME_SIZE
        );
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;
    Ok(Some(Bytes::from(payload)))
}

/// Read a single frame and split it into (identifier, body).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<(String, Bytes)>> {
    match read_payload(r).await? {
        Some(payload) => split_inner(payload).map(Some),
        None => Ok(None),
    }
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.context("Failed to write frame")?;
    Ok(())
}

// =============================================================================
// HELLO_SERVER: client -> server greeting
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloServer {
    pub protocol_version: u16,
    pub mod_version: String,
}

impl HelloServer {
    pub const IDENTIFIER: &'static str = "modsync:hello_server";

    pub fn new(mod_version: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            mod_version: mod_version.into(),
        }
    }

    pub fn encode_body(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(4 + self.mod_version.len());
        buf.put_u16(self.protocol_version);
        put_string(&mut buf, &self.mod_version)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            anyhow::bail!("HelloServer payload too short");
        }
        let protocol_version = payload.get_u16();
        let mod_version = get_string(&mut payload, "HelloServer mod version")?;
        Ok(Self {
            protocol_version,
            mod_version,
        })
    }
}

// =============================================================================
// HELLO_CLIENT: server -> client greeting with the offered manifest
// =============================================================================

/// A file the server is willing to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedFile {
    pub identifier: String,
    pub size: u64,
    pub hash: [u8; HASH_LEN],
}

impl OfferedFile {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloClient {
    pub protocol_version: u16,
    pub mod_version: String,
    pub offered: Vec<OfferedFile>,
}

impl HelloClient {
    pub const IDENTIFIER: &'static str = "modsync:hello_client";

    pub fn new(mod_version: impl Into<String>, offered: Vec<OfferedFile>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            mod_version: mod_version.into(),
            offered,
        }
    }

    pub fn encode_body(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(8 + self.mod_version.len() + self.offered.len() * 64);
        buf.put_u16(self.protocol_version);
        put_string(&mut buf, &self.mod_version)?;
        buf.put_i32(i32::try_from(self.offered.len()).context("Too many offered files")?);
        for file in &self.offered {
            put_string(&mut buf, &file.identifier)?;
            buf.put_u64(file.size);
            buf.put_slice(&file.hash);
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            anyhow::bail!("HelloClient payload too short");
        }
        let protocol_version = payload.get_u16();
        let mod_version = get_string(&mut payload, "HelloClient mod version")?;
        let count = get_count(&mut payload, "offered file")?;

        let mut offered = Vec::with_capacity(count.min(1024));
        for i in 0..count {
            let identifier = get_string(&mut payload, "offered file identifier")?;
            if payload.remaining() < 8 + HASH_LEN {
                anyhow::bail!(
                    "Offered file {} truncated: expected {} bytes, got {}",
                    i,
                    8 + HASH_LEN,
                    payload.remaining()
                );
            }
            let size = payload.get_u64();
            let mut hash = [0u8; HASH_LEN];
            payload.copy_to_slice(&mut hash);
            offered.push(OfferedFile {
                identifier,
                size,
                hash,
            });
        }

        Ok(Self {
            protocol_version,
            mod_version,
            offered,
        })
    }
}

// =============================================================================
// REQUEST_FILES: client -> server
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFiles {
    pub token: String,
    pub identifiers: Vec<String>,
}

impl RequestFiles {
    pub const IDENTIFIER: &'static str = "modsync:request_files";

    pub fn encode_body(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(
            6 + self.token.len() + self.identifiers.iter().map(|i| 2 + i.len()).sum::<usize>(),
        );
        put_string(&mut buf, &self.token)?;
        buf.put_i32(i32::try_from(self.identifiers.len()).context("Too many requested files")?);
        for identifier in &self.identifiers {
            put_string(&mut buf, identifier)?;
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let token = get_string(&mut payload, "RequestFiles token")?;
        let count = get_count(&mut payload, "requested file")?;
        let mut identifiers = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            identifiers.push(get_string(&mut payload, "requested file identifier")?);
        }
        Ok(Self { token, identifiers })
    }
}

// =============================================================================
// SEND_FILES: server -> client
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    pub identifier: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendFiles {
    pub token: String,
    pub files: Vec<FilePayload>,
    /// Entries that could not be decoded, with the reason. Never encoded.
    pub failed: Vec<String>,
}

impl SendFiles {
    pub const IDENTIFIER: &'static str = "modsync:send_files";

    pub fn new(token: impl Into<String>, files: Vec<FilePayload>) -> Self {
        Self {
            token: token.into(),
            files,
            failed: Vec::new(),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.data.len() as u64).sum()
    }

    pub fn encode_body(&self) -> Result<Bytes> {
        let payload_len = 6
            + self.token.len()
            + self
                .files
                .iter()
                .map(|f| 6 + f.identifier.len() + f.data.len())
                .sum::<usize>();

        let mut buf = BytesMut::with_capacity(payload_len);
        put_string(&mut buf, &self.token)?;
        buf.put_i32(i32::try_from(self.files.len()).context("Too many files")?);
        for file in &self.files {
            put_string(&mut buf, &file.identifier)?;
            buf.put_u32(u32::try_from(file.data.len()).context("File too large for wire")?);
            buf.put_slice(&file.data);
        }
        Ok(buf.freeze())
    }

    /// Decode a response. An entry with an undecodable identifier is recorded
    /// in `failed` and skipped; a truncated entry ends the batch.
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let token = get_string(&mut payload, "SendFiles token")?;
        let count = get_count(&mut payload, "sent file")?;

        let mut files = Vec::with_capacity(count.min(1024));
        let mut failed = Vec::new();
        for i in 0..count {
            let raw_identifier = match get_string_bytes(&mut payload, "file identifier") {
                Ok(raw) => raw,
                Err(e) => {
                    failed.push(format!("entry {}: {:#}", i, e));
                    break;
                }
            };
            if payload.remaining() < 4 {
                failed.push(format!("entry {}: content length truncated", i));
                break;
            }
            let data_len = payload.get_u32() as usize;
            if payload.remaining() < data_len {
                failed.push(format!(
                    "entry {}: content truncated: expected {} bytes, got {}",
                    i,
                    data_len,
                    payload.remaining()
                ));
                break;
            }
            let data = payload.copy_to_bytes(data_len);

            match String::from_utf8(raw_identifier.to_vec()) {
                Ok(identifier) => files.push(FilePayload { identifier, data }),
                Err(_) => failed.push(format!("entry {}: invalid UTF-8 in identifier", i)),
            }
        }

        Ok(Self {
            token,
            files,
            failed,
        })
    }
}

// =============================================================================
// CHUNK: one fragment of an oversized message, either direction
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub transfer_id: u64,
    pub index: u32,
    pub count: u32,
    pub total_len: u64,
    pub data: Bytes,
}

impl Chunk {
    pub const IDENTIFIER: &'static str = "modsync:chunk";

    pub fn encode_body(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + self.data.len());
        buf.put_u64(self.transfer_id);
        buf.put_u32(self.index);
        buf.put_u32(self.count);
        buf.put_u64(self.total_len);
        buf.put_u32(u32::try_from(self.data.len()).context("Chunk too large")?);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < CHUNK_HEADER_LEN {
            anyhow::bail!("Chunk payload too short");
        }
        let transfer_id = payload.get_u64();
        let index = payload.get_u32();
        let count = payload.get_u32();
        let total_len = payload.get_u64();
        let data_len = payload.get_u32() as usize;
        if payload.remaining() < data_len {
            anyhow::bail!(
                "Chunk data truncated: expected {} bytes, got {}",
                data_len,
                payload.remaining()
            );
        }
        let data = payload.copy_to_bytes(data_len);

        Ok(Self {
            transfer_id,
            index,
            count,
            total_len,
            data,
        })
    }
}

// =============================================================================
// Message
// =============================================================================

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    HelloServer(HelloServer),
    HelloClient(HelloClient),
    RequestFiles(RequestFiles),
    SendFiles(SendFiles),
    Chunk(Chunk),
}

impl Message {
    pub fn identifier(&self) -> &'static str {
        match self {
            Message::HelloServer(_) => HelloServer::IDENTIFIER,
            Message::HelloClient(_) => HelloClient::IDENTIFIER,
            Message::RequestFiles(_) => RequestFiles::IDENTIFIER,
            Message::SendFiles(_) => SendFiles::IDENTIFIER,
            Message::Chunk(_) => Chunk::IDENTIFIER,
        }
    }

    pub fn encode_body(&self) -> Result<Bytes> {
        match self {
            Message::HelloServer(m) => m.encode_body(),
            Message::HelloClient(m) => m.encode_body(),
            Message::RequestFiles(m) => m.encode_body(),
            Message::SendFiles(m) => m.encode_body(),
            Message::Chunk(m) => m.encode_body(),
        }
    }

    /// Encode identifier and body, without the frame length.
    pub fn encode_inner(&self) -> Result<Bytes> {
        encode_inner(self.identifier(), &self.encode_body()?)
    }
}

// =============================================================================
// Version Negotiation
// =============================================================================

/// Result of version negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    /// Version is supported
    Supported(u16),
    /// Peer is older than anything we speak
    TooOld { peer: u16, min_supported: u16 },
    /// Peer is newer than anything we speak
    TooNew { peer: u16, max_supported: u16 },
}

impl VersionNegotiationResult {
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Supported(_))
    }
}

/// Check if a peer protocol version is supported.
pub fn negotiate_version(peer_version: u16) -> VersionNegotiationResult {
    if peer_version < PROTOCOL_VERSION_MIN {
        VersionNegotiationResult::TooOld {
            peer: peer_version,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    } else if peer_version > PROTOCOL_VERSION_MAX {
        VersionNegotiationResult::TooNew {
            peer: peer_version,
            max_supported: PROTOCOL_VERSION_MAX,
        }
    } else {
        VersionNegotiationResult::Supported(peer_version)
    }
}

// =============================================================================
// Tests
// =============================================================================
