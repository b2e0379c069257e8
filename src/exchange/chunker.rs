//! Splitting and reassembly of messages larger than the transport limit.
//!
//! An oversized message (identifier + body) is cut into fixed-size fragments,
//! each sent as a `chunk` message. The receiver indexes fragments into a
//! pre-sized buffer, so arrival order does not matter.

use crate::exchange::protocol::{Chunk, CHUNK_HEADER_LEN, MAX_MESSAGE_SIZE};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default fragment size, leaving 64KB of headroom under the transport limit
pub const FRAGMENT_SIZE: usize = MAX_MESSAGE_SIZE - 64 * 1024;

/// Largest payload accepted for reassembly (256MB)
pub const MAX_TRANSFER_SIZE: u64 = 256 * 1024 * 1024;

/// Most fragments a single transfer may declare
pub const MAX_FRAGMENTS: u32 = 1 << 16;

/// Default lifetime of an incomplete transfer
pub const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of incomplete transfers kept per connection
pub const MAX_PENDING_TRANSFERS: usize = 16;

/// Number of fragments needed for `len` bytes. An empty payload still
/// travels as one empty fragment.
pub fn fragment_count(len: usize, capacity: usize) -> usize {
    len.div_ceil(capacity).max(1)
}

#[derive(Debug)]
pub struct Chunker {
    fragment_size: usize,
    next_transfer_id: u64,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(FRAGMENT_SIZE)
    }
}

impl Chunker {
    pub fn new(fragment_size: usize) -> Self {
        Self {
            fragment_size: fragment_size.max(1),
            next_transfer_id: 0,
        }
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// Encoded size of a chunk message carrying a full fragment, excluding
    /// the chunk identifier.
    pub fn max_chunk_body(&self) -> usize {
        CHUNK_HEADER_LEN + self.fragment_size
    }

    /// Split `payload` into ordered fragments under a new transfer id.
    pub fn split(&mut self, payload: Bytes) -> Vec<Chunk> {
        let transfer_id = self.next_transfer_id;
        self.next_transfer_id = self.next_transfer_id.wrapping_add(1);

        let total_len = payload.len() as u64;
        let count = fragment_count(payload.len(), self.fragment_size);
        (0..count)
            .map(|index| {
                let start = index * self.fragment_size;
                let end = (start + self.fragment_size).min(payload.len());
                Chunk {
                    transfer_id,
                    index: index as u32,
                    count: count as u32,
                    total_len,
                    data: payload.slice(start..end),
                }
            })
            .collect()
    }
}

/// Reassembly buffer for one transfer.
#[derive(Debug)]
struct PendingFragmentSet {
    fragments: Vec<Option<Bytes>>,
    received: usize,
    received_len: u64,
    total_len: u64,
    started: Instant,
}

impl PendingFragmentSet {
    fn new(count: u32, total_len: u64, now: Instant) -> Self {
        Self {
            fragments: vec![None; count as usize],
            received: 0,
            received_len: 0,
            total_len,
            started: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.fragments.len()
    }

    fn assemble(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.total_len as usize);
        for fragment in self.fragments.into_iter().flatten() {
            buf.extend_from_slice(&fragment);
        }
        buf.freeze()
    }
}

#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<u64, PendingFragmentSet>,
    timeout: Duration,
    max_pending: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(FRAGMENT_TIMEOUT, MAX_PENDING_TRANSFERS)
    }
}

impl Reassembler {
    pub fn new(timeout: Duration, max_pending: usize) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
            max_pending: max_pending.max(1),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn insert(&mut self, chunk: Chunk) -> Option<Bytes> {
        self.insert_at(chunk, Instant::now())
    }

    /// Add a fragment. Returns the reassembled payload once every index of
    /// its transfer has arrived and the length matches.
    pub fn insert_at(&mut self, chunk: Chunk, now: Instant) -> Option<Bytes> {
        self.evict_stale(now);

        if chunk.count == 0 || chunk.index >= chunk.count {
            tracing::warn!(
                "Dropping fragment {}/{} of transfer {}: index out of range",
                chunk.index,
                chunk.count,
                chunk.transfer_id
            );
            return None;
        }
        if chunk.total_len > MAX_TRANSFER_SIZE {
            tracing::warn!(
                "Dropping transfer {}: {} bytes exceeds limit {}",
                chunk.transfer_id,
                chunk.total_len,
                MAX_TRANSFER_SIZE
            );
            return None;
        }
        // Every fragment carries at least one byte unless the payload is empty
        if chunk.count > MAX_FRAGMENTS || chunk.count as u64 > chunk.total_len.max(1) {
            tracing::warn!(
                "Dropping transfer {}: {} fragments for {} bytes",
                chunk.transfer_id,
                chunk.count,
                chunk.total_len
            );
            return None;
        }

        if !self.pending.contains_key(&chunk.transfer_id) && self.pending.len() >= self.max_pending
        {
            self.evict_oldest();
        }

        let set = self
            .pending
            .entry(chunk.transfer_id)
            .or_insert_with(|| PendingFragmentSet::new(chunk.count, chunk.total_len, now));

        if set.fragments.len() != chunk.count as usize || set.total_len != chunk.total_len {
            tracing::warn!(
                "Dropping fragment {} of transfer {}: inconsistent with earlier fragments",
                chunk.index,
                chunk.transfer_id
            );
            return None;
        }

        let slot = &mut set.fragments[chunk.index as usize];
        if slot.is_some() {
            tracing::debug!(
                "Duplicate fragment {} of transfer {}",
                chunk.index,
                chunk.transfer_id
            );
            return None;
        }
        set.received_len += chunk.data.len() as u64;
        *slot = Some(chunk.data);
        set.received += 1;

        if set.received_len > set.total_len {
            tracing::warn!(
                "Dropping transfer {}: received {} bytes, declared {}",
                chunk.transfer_id,
                set.received_len,
                set.total_len
            );
            self.pending.remove(&chunk.transfer_id);
            return None;
        }

        if !set.is_complete() {
            return None;
        }

        let set = self.pending.remove(&chunk.transfer_id)?;
        if set.received_len != set.total_len {
            tracing::warn!(
                "Dropping transfer {}: received {} bytes, declared {}",
                chunk.transfer_id,
                set.received_len,
                set.total_len
            );
            return None;
        }
        tracing::debug!(
            "Reassembled transfer {} ({} fragments, {} bytes)",
            chunk.transfer_id,
            set.fragments.len(),
            set.total_len
        );
        Some(set.assemble())
    }

    /// Drop transfers that have not completed within the timeout.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.pending.len();
        self.pending.retain(|id, set| {
            let alive = now.saturating_duration_since(set.started) < timeout;
            if !alive {
                tracing::warn!(
                    "Abandoning transfer {}: {}/{} fragments after {:?}",
                    id,
                    set.received,
                    set.fragments.len(),
                    timeout
                );
            }
            alive
        });
        before - self.pending.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, set)| set.started)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            tracing::warn!("Too many pending transfers, abandoning transfer {}", id);
            self.pending.remove(&id);
        }
    }
}
