//! Message descriptor registry.
//!
//! Maps wire identifiers to the factory that builds a message from its body,
//! plus the flags and handling side used by the connection loop. Built once
//! in the composition root and shared read-only.

use crate::error::{Result, SyncError};
use crate::exchange::protocol::{
    Chunk, HelloClient, HelloServer, Message, RequestFiles, SendFiles, MAX_IDENTIFIER_LEN,
};
use bytes::Bytes;
use std::collections::HashMap;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescriptorFlags: u8 {
        /// The receiver is expected to answer
        const REQUIRES_RESPONSE = 1 << 0;
        /// Sent without any correlation or acknowledgement
        const FIRE_AND_FORGET = 1 << 1;
    }
}

/// Which end of a connection a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Which side is allowed to handle a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandledOn {
    Client,
    Server,
    Both,
}

impl HandledOn {
    pub fn accepts(self, side: Side) -> bool {
        matches!(
            (self, side),
            (HandledOn::Both, _)
                | (HandledOn::Client, Side::Client)
                | (HandledOn::Server, Side::Server)
        )
    }
}

/// Builds a message from its decoded body.
pub type MessageFactory = fn(Bytes) -> anyhow::Result<Message>;

#[derive(Debug, Clone)]
pub struct MessageDescriptor {
    identifier: String,
    handled_on: HandledOn,
    flags: DescriptorFlags,
    factory: MessageFactory,
}

impl MessageDescriptor {
    pub fn new(
        identifier: impl Into<String>,
        handled_on: HandledOn,
        flags: DescriptorFlags,
        factory: MessageFactory,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            handled_on,
            flags,
            factory,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn handled_on(&self) -> HandledOn {
        self.handled_on
    }

    pub fn flags(&self) -> DescriptorFlags {
        self.flags
    }

    pub fn requires_response(&self) -> bool {
        self.flags.contains(DescriptorFlags::REQUIRES_RESPONSE)
    }

    pub fn is_fire_and_forget(&self) -> bool {
        self.flags.contains(DescriptorFlags::FIRE_AND_FORGET)
    }

    pub fn build(&self, body: Bytes) -> anyhow::Result<Message> {
        (self.factory)(body)
    }
}

/// Validate a namespaced identifier (`namespace:path`).
///
/// The namespace allows `[a-z0-9_.-]`, the path additionally allows `/`.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    let invalid = |reason: &str| SyncError::InvalidIdentifier {
        identifier: identifier.to_string(),
        reason: reason.to_string(),
    };

    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(invalid("too long"));
    }
    let (namespace, path) = identifier
        .split_once(':')
        .ok_or_else(|| invalid("missing ':' separator"))?;
    if namespace.is_empty() {
        return Err(invalid("empty namespace"));
    }
    if path.is_empty() {
        return Err(invalid("empty path"));
    }

    let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || "_.-".contains(c);
    if !namespace.chars().all(allowed) {
        return Err(invalid("namespace contains invalid characters"));
    }
    if !path.chars().all(|c| allowed(c) || c == '/') {
        return Err(invalid("path contains invalid characters"));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    descriptors: HashMap<String, MessageDescriptor>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in exchange messages.
    pub fn with_defaults() -> Self {
        let descriptors = default_descriptors()
            .into_iter()
            .map(|d| (d.identifier().to_string(), d))
            .collect();
        Self { descriptors }
    }

    /// Register a descriptor. Registering an identifier twice is an error and
    /// leaves the first registration in place.
    pub fn register(&mut self, descriptor: MessageDescriptor) -> Result<()> {
        validate_identifier(descriptor.identifier())?;
        if self.contains(descriptor.identifier()) {
            return Err(SyncError::DuplicateDescriptor(
                descriptor.identifier().to_string(),
            ));
        }
        tracing::debug!("Registered message descriptor {}", descriptor.identifier());
        self.descriptors
            .insert(descriptor.identifier().to_string(), descriptor);
        Ok(())
    }

    pub fn lookup(&self, identifier: &str) -> Result<&MessageDescriptor> {
        self.descriptors
            .get(identifier)
            .ok_or_else(|| SyncError::UnknownMessage(identifier.to_string()))
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.descriptors.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

fn default_descriptors() -> Vec<MessageDescriptor> {
    vec![
        MessageDescriptor::new(
            HelloServer::IDENTIFIER,
            HandledOn::Server,
            DescriptorFlags::REQUIRES_RESPONSE,
            |body| Ok(Message::HelloServer(HelloServer::decode(body)?)),
        ),
        MessageDescriptor::new(
            HelloClient::IDENTIFIER,
            HandledOn::Client,
            DescriptorFlags::empty(),
            |body| Ok(Message::HelloClient(HelloClient::decode(body)?)),
        ),
        MessageDescriptor::new(
            RequestFiles::IDENTIFIER,
            HandledOn::Server,
            DescriptorFlags::REQUIRES_RESPONSE,
            |body| Ok(Message::RequestFiles(RequestFiles::decode(body)?)),
        ),
        MessageDescriptor::new(
            SendFiles::IDENTIFIER,
            HandledOn::Client,
            DescriptorFlags::empty(),
            |body| Ok(Message::SendFiles(SendFiles::decode(body)?)),
        ),
        MessageDescriptor::new(
            Chunk::IDENTIFIER,
            HandledOn::Both,
            DescriptorFlags::FIRE_AND_FORGET,
            |body| Ok(Message::Chunk(Chunk::decode(body)?)),
        ),
    ]
}
