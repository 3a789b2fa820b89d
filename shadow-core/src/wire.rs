//! Framing: length-prefix (4 bytes LE) + JSON payload.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{Packet, KNOWN_TYPES};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a value into a single frame: 4 bytes LE length + JSON payload.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = serde_json::to_vec(msg)?;
    let len = payload.len();
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + len);
    out.extend_from_slice(&(len as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a value into a frame (serialization or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Read the length prefix. Returns the payload length once it is known and within limits.
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Split one frame from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// Call with partial buffer; returns NeedMore if the frame is not complete yet.
pub fn split_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Decode one typed frame from the front of `bytes`.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    let (payload, consumed) = split_frame(bytes)?;
    let msg = serde_json::from_slice(payload)?;
    Ok((msg, consumed))
}

/// Error decoding a frame (need more bytes, too large, or JSON failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Decode a frame payload into a packet, classifying what was wrong with it if anything.
pub fn decode_packet(payload: &[u8]) -> Result<Packet, PacketError> {
    let value: serde_json::Value = serde_json::from_slice(payload).map_err(PacketError::Json)?;
    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(PacketError::MissingType)?;
    if !KNOWN_TYPES.contains(&tag) {
        return Err(PacketError::UnknownType(tag.to_string()));
    }
    serde_json::from_value(value).map_err(PacketError::Shape)
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("payload is not JSON: {0}")]
    Json(serde_json::Error),
    #[error("payload has no string `type` field")]
    MissingType,
    #[error("unknown packet type `{0}`")]
    UnknownType(String),
    #[error("malformed packet: {0}")]
    Shape(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;
    use crate::protocol::Hello;

    fn chat() -> Packet {
        Packet::Chat {
            text: "hello".into(),
            from_peer_id: NodeId::from("shadow-aaa"),
            created_at: 1,
        }
    }

    #[test]
    fn packet_frame_decodes() {
        let frame = encode_frame(&chat()).unwrap();
        let (payload, n) = split_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decode_packet(payload).unwrap(), chat());
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&chat()).unwrap();
        assert!(matches!(
            split_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            split_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_frames() {
        let hello = Hello {
            hello: NodeId::from("shadow-bbb"),
        };
        let mut buf = encode_frame(&hello).unwrap();
        let second = encode_frame(&chat()).unwrap();
        buf.extend_from_slice(&second);
        let (h, n1): (Hello, usize) = decode_frame(&buf).unwrap();
        assert_eq!(h, hello);
        let (p, n2) = split_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, second.len());
        assert_eq!(decode_packet(p).unwrap(), chat());
    }

    #[test]
    fn oversized_header_rejected() {
        let header = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(frame_len(header), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn malformed_payloads_classified() {
        assert!(matches!(decode_packet(b"not json"), Err(PacketError::Json(_))));
        assert!(matches!(
            decode_packet(br#"{"text":"no tag"}"#),
            Err(PacketError::MissingType)
        ));
        assert!(matches!(
            decode_packet(br#"{"type":7}"#),
            Err(PacketError::MissingType)
        ));
        assert!(matches!(
            decode_packet(br#"{"type":"ping"}"#),
            Err(PacketError::UnknownType(t)) if t == "ping"
        ));
        assert!(matches!(
            decode_packet(br#"{"type":"file-chunk","fileId":"x"}"#),
            Err(PacketError::Shape(_))
        ));
    }
}
