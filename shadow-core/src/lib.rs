//! Shadow node session core.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod chat;
pub mod core;
pub mod identity;
pub mod log;
pub mod protocol;
pub mod registry;
pub mod transfer;
pub mod wire;

pub use crate::core::{Action, ConnectionEvent, ShadowCore, SignalingEvent};
pub use chat::ChatMessage;
pub use identity::{ensure_identity, Identity, IdentityOrigin, IdentityStore, NodeId, StoreError};
pub use log::{EventLog, LogEntry, Severity, MAX_LOG_ENTRIES};
pub use protocol::{FileChunk, Hello, Packet};
pub use registry::{ConnectionHandle, ConnectionState};
pub use transfer::{CompletedFile, OutgoingFile, FILE_CHUNK_SIZE};
pub use wire::{decode_frame, decode_packet, encode_frame, FrameDecodeError, FrameEncodeError};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
