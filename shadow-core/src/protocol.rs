//! Shadow wire protocol: packet types exchanged over a peer connection.

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Packet tags, as they appear in the `type` field.
pub const KNOWN_TYPES: [&str; 4] = ["file-chunk", "file-complete", "text", "chat"];

/// All packet types. Encoding is JSON with a `type` discriminator; framing is
/// length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Packet {
    /// One slice of a file.
    FileChunk(FileChunk),
    /// Sender has dispatched every chunk for the transfer.
    #[serde(rename_all = "camelCase")]
    FileComplete { file_id: String },
    /// Informational text, log-only on the receiver.
    Text { text: String },
    /// Chat line. Sender and timestamp are carried in the packet, not taken from the transport.
    #[serde(rename_all = "camelCase")]
    Chat {
        text: String,
        from_peer_id: NodeId,
        created_at: i64,
    },
}

impl Packet {
    /// Tag name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::FileChunk(_) => "file-chunk",
            Packet::FileComplete { .. } => "file-complete",
            Packet::Text { .. } => "text",
            Packet::Chat { .. } => "chat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    /// Transfer ID, shared by every chunk and the completion signal of one send.
    pub file_id: String,
    pub name: String,
    pub mime_type: String,
    /// Declared total file size in bytes.
    pub size: u64,
    /// Zero-based chunk position.
    pub index: u32,
    pub total_chunks: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Handshake frame exchanged once, before any packet, on a fresh transport session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub hello: NodeId,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
