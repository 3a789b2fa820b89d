//! File transfer: split outbound files into fixed-size chunk packets, reassemble inbound ones.
//!
//! Reassembly is order-independent. A transfer is finalized exactly once, when every
//! declared index is filled or when the completion signal arrives, whichever is first.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::identity::{random_suffix, NodeId};
use crate::protocol::{FileChunk, Packet};

/// Fixed chunk size in bytes.
pub const FILE_CHUNK_SIZE: usize = 64 * 1024; // 64 KiB

/// Number of chunks for a payload of `len` bytes.
pub fn total_chunks(len: usize) -> u32 {
    len.div_ceil(FILE_CHUNK_SIZE) as u32
}

/// Transfer ID: unique per send operation, shared by every recipient.
pub fn new_transfer_id(local: &NodeId, now_ms: i64) -> String {
    format!("{}-{}-{}", local, now_ms, random_suffix())
}

/// A file the local node is about to broadcast.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Ordered packets for one recipient: every chunk, then the completion signal.
pub fn file_packets(file: &OutgoingFile, file_id: &str) -> Vec<Packet> {
    let total = total_chunks(file.data.len());
    let mut out: Vec<Packet> = file
        .data
        .chunks(FILE_CHUNK_SIZE)
        .enumerate()
        .map(|(index, slice)| {
            Packet::FileChunk(FileChunk {
                file_id: file_id.to_string(),
                name: file.name.clone(),
                mime_type: file.mime_type.clone(),
                size: file.size(),
                index: index as u32,
                total_chunks: total,
                data: slice.to_vec(),
            })
        })
        .collect();
    out.push(Packet::FileComplete {
        file_id: file_id.to_string(),
    });
    out
}

/// Reassembled file. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedFile {
    pub id: String,
    pub from_peer_id: NodeId,
    pub name: String,
    pub mime_type: String,
    /// Declared size from the sender.
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    #[serde(skip)]
    pub data: Vec<u8>,
    /// Addressable reference for the UI layer.
    pub url: String,
}

/// Chunks received so far for one transfer.
#[derive(Debug)]
struct IncomingFileBuffer {
    from_peer_id: NodeId,
    name: String,
    mime_type: String,
    size: u64,
    total_chunks: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
}

impl IncomingFileBuffer {
    fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    fn is_complete(&self) -> bool {
        self.received() == self.total_chunks
    }

    fn into_file(self, id: String, now_ms: i64) -> CompletedFile {
        // sized from what arrived; the declared size is sender-controlled
        let len = self.chunks.values().map(Vec::len).sum();
        let mut data = Vec::with_capacity(len);
        for payload in self.chunks.values() {
            data.extend_from_slice(payload);
        }
        CompletedFile {
            url: format!("blob:shadow/{}", id),
            id,
            from_peer_id: self.from_peer_id,
            name: self.name,
            mime_type: self.mime_type,
            size: self.size,
            created_at: now_ms,
            data,
        }
    }
}

/// In-progress transfer, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingTransfer {
    pub id: String,
    pub from_peer_id: NodeId,
    pub name: String,
    pub received: u32,
    pub expected: u32,
}

/// Result of storing a chunk.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Stored; transfer not yet complete.
    Stored { received: u32, expected: u32 },
    /// Index already filled; first write wins.
    Duplicate,
    /// Index outside the declared chunk count; dropped.
    OutOfRange { index: u32, expected: u32 },
    /// Transfer already finalized; dropped.
    AlreadyFinalized,
    /// Last missing index filled; transfer finalized.
    Complete(CompletedFile),
}

/// Result of a completion signal.
#[derive(Debug)]
pub enum CompleteOutcome {
    /// Finalized with whatever was buffered. `missing` is the number of unfilled indices.
    Finalized { file: CompletedFile, missing: u32 },
    /// No buffer for this ID (unknown or already finalized).
    Ignored,
}

/// Incoming buffers keyed by transfer ID.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffers: HashMap<String, IncomingFileBuffer>,
    /// IDs of finalized transfers, kept for the life of the node so late chunks and repeated
    /// completion signals stay no-ops. One short string per received file.
    finalized: HashSet<String>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a chunk from `from`. The first chunk of a transfer supplies its metadata.
    pub fn on_chunk(&mut self, from: &NodeId, chunk: FileChunk, now_ms: i64) -> ChunkOutcome {
        if self.finalized.contains(&chunk.file_id) {
            return ChunkOutcome::AlreadyFinalized;
        }
        let expected = self
            .buffers
            .get(&chunk.file_id)
            .map_or(chunk.total_chunks, |b| b.total_chunks);
        // checked before the buffer exists, so a bad first chunk cannot fix the metadata
        if chunk.index >= expected {
            return ChunkOutcome::OutOfRange {
                index: chunk.index,
                expected,
            };
        }
        let buffer = self
            .buffers
            .entry(chunk.file_id.clone())
            .or_insert_with(|| IncomingFileBuffer {
                from_peer_id: from.clone(),
                name: chunk.name,
                mime_type: chunk.mime_type,
                size: chunk.size,
                total_chunks: chunk.total_chunks,
                chunks: BTreeMap::new(),
            });
        if buffer.chunks.contains_key(&chunk.index) {
            return ChunkOutcome::Duplicate;
        }
        buffer.chunks.insert(chunk.index, chunk.data);
        if !buffer.is_complete() {
            return ChunkOutcome::Stored {
                received: buffer.received(),
                expected: buffer.total_chunks,
            };
        }
        match self.finalize(&chunk.file_id, now_ms) {
            Some((file, _)) => ChunkOutcome::Complete(file),
            None => ChunkOutcome::AlreadyFinalized,
        }
    }

    /// Completion signal: finalize whatever is buffered.
    pub fn on_complete(&mut self, file_id: &str, now_ms: i64) -> CompleteOutcome {
        match self.finalize(file_id, now_ms) {
            Some((file, missing)) => CompleteOutcome::Finalized { file, missing },
            None => CompleteOutcome::Ignored,
        }
    }

    fn finalize(&mut self, file_id: &str, now_ms: i64) -> Option<(CompletedFile, u32)> {
        let buffer = self.buffers.remove(file_id)?;
        let missing = buffer.total_chunks.saturating_sub(buffer.received());
        self.finalized.insert(file_id.to_string());
        Some((buffer.into_file(file_id.to_string(), now_ms), missing))
    }

    /// In-progress transfers, sorted by ID.
    pub fn pending(&self) -> Vec<PendingTransfer> {
        let mut out: Vec<PendingTransfer> = self
            .buffers
            .iter()
            .map(|(id, b)| PendingTransfer {
                id: id.clone(),
                from_peer_id: b.from_peer_id.clone(),
                name: b.name.clone(),
                received: b.received(),
                expected: b.total_chunks,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}
