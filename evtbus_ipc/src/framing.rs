//! Binary message framing.
//!
//! Wire layout, identical in the ring buffer and on sockets:
//!
//! ```text
//! ┌──────────────────┬──────────────┬──────────────────────────┐
//! │ length_prefix u32│ type_tag u32 │ payload[length_prefix-4] │
//! └──────────────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! Integers are little-endian for every process of a run, so hosts with a
//! different native order swap on both the read and the write path.

use crate::error::{IpcError, IpcResult};
use evtbus::consts::{FRAME_HEADER_BYTES, MAX_FRAME_BYTES};
use serde::{Deserialize, Serialize};

/// Payload kind carried in `type_tag`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageType {
    /// One serialized event record
    Event = 1,
    /// Start of a run
    BeginRun = 2,
    /// End of a run
    EndRun = 3,
    /// Type descriptor, sent once per run before the first event
    StreamerInfo = 4,
    /// Serialized histogram snapshot
    HistogramSnapshot = 5,
    /// Control: no more input will follow
    EndOfInput = 6,
    /// Control: stop immediately
    Terminate = 7,
    /// Socket flow control: previous event fully processed
    Ack = 8,
}

impl MessageType {
    /// Convert from the raw tag. Returns `None` for unknown values.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Event),
            2 => Some(Self::BeginRun),
            3 => Some(Self::EndRun),
            4 => Some(Self::StreamerInfo),
            5 => Some(Self::HistogramSnapshot),
            6 => Some(Self::EndOfInput),
            7 => Some(Self::Terminate),
            8 => Some(Self::Ack),
            _ => None,
        }
    }

    /// Out-of-band signals that every worker must see.
    pub const fn is_control(&self) -> bool {
        matches!(self, Self::EndOfInput | Self::Terminate)
    }
}

/// Host byte order, reported in streamer descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

impl ByteOrder {
    /// Byte order of the running host
    pub const fn native() -> Self {
        if cfg!(target_endian = "little") {
            Self::Little
        } else {
            Self::Big
        }
    }
}

/// A decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Payload kind
    pub tag: MessageType,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
}

/// Produce `length_prefix || type_tag || payload`.
pub fn frame(tag: MessageType, payload: &[u8]) -> IpcResult<Vec<u8>> {
    if payload.len() > MAX_FRAME_BYTES - FRAME_HEADER_BYTES {
        return Err(IpcError::invalid(format!(
            "payload of {} bytes exceeds the frame limit of {MAX_FRAME_BYTES}",
            payload.len()
        )));
    }
    let length_prefix = (payload.len() + 4) as u32;
    let mut out = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    out.extend_from_slice(&length_prefix.to_le_bytes());
    out.extend_from_slice(&(tag as u32).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Read the length prefix of a frame without decoding it.
pub fn peek_length(bytes: &[u8]) -> Option<u32> {
    let prefix: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(prefix))
}

/// Total encoded size of a frame whose prefix is `length_prefix`.
pub fn encoded_len(length_prefix: u32) -> usize {
    length_prefix as usize + 4
}

/// Inverse of [`frame`].
pub fn unframe(bytes: &[u8]) -> IpcResult<Frame> {
    if bytes.len() < FRAME_HEADER_BYTES {
        return Err(IpcError::corrupt(format!(
            "{} bytes is shorter than a frame header",
            bytes.len()
        )));
    }
    let length_prefix = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if encoded_len(length_prefix) != bytes.len() {
        return Err(IpcError::corrupt(format!(
            "length prefix {length_prefix} does not match {} supplied bytes",
            bytes.len()
        )));
    }
    let raw_tag = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let tag = MessageType::from_u32(raw_tag)
        .ok_or_else(|| IpcError::corrupt(format!("unknown type tag {raw_tag}")))?;
    Ok(Frame {
        tag,
        payload: bytes[FRAME_HEADER_BYTES..].to_vec(),
    })
}

/// Incremental decoder that cuts complete frames out of a byte stream
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as frames
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete encoded frame, if one is buffered.
    ///
    /// A declared length that can never be valid is a `CorruptFrame`; the
    /// stream cannot be resynchronized after that.
    pub fn next_raw(&mut self) -> IpcResult<Option<Vec<u8>>> {
        let Some(length_prefix) = peek_length(&self.buffer) else {
            return Ok(None);
        };
        let total = encoded_len(length_prefix);
        if total < FRAME_HEADER_BYTES || total > MAX_FRAME_BYTES {
            return Err(IpcError::corrupt(format!(
                "stream declares impossible frame length {length_prefix}"
            )));
        }
        if self.buffer.len() < total {
            return Ok(None);
        }
        let rest = self.buffer.split_off(total);
        Ok(Some(std::mem::replace(&mut self.buffer, rest)))
    }

    /// Next complete decoded frame, if one is buffered.
    pub fn next_frame(&mut self) -> IpcResult<Option<Frame>> {
        match self.next_raw()? {
            Some(raw) => unframe(&raw).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let bytes = frame(MessageType::Event, b"abc").unwrap();
        assert_eq!(bytes.len(), 11);
        assert_eq!(&bytes[..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[8..], b"abc");
        assert_eq!(peek_length(&bytes), Some(7));
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let bytes = frame(MessageType::Ack, &[]).unwrap();
        assert_eq!(bytes.len(), FRAME_HEADER_BYTES);
        let decoded = unframe(&bytes).unwrap();
        assert_eq!(decoded.tag, MessageType::Ack);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_length_mismatch_is_corrupt() {
        let mut bytes = frame(MessageType::Event, b"payload").unwrap();
        bytes.pop();
        assert!(matches!(unframe(&bytes), Err(IpcError::CorruptFrame { .. })));
        assert!(matches!(unframe(&[1, 2, 3]), Err(IpcError::CorruptFrame { .. })));
    }

    #[test]
    fn test_unknown_tag_is_corrupt() {
        let mut bytes = frame(MessageType::Event, b"x").unwrap();
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(unframe(&bytes), Err(IpcError::CorruptFrame { .. })));
    }

    #[test]
    fn test_tag_roundtrip_and_control_flags() {
        for raw in 1..=8 {
            let tag = MessageType::from_u32(raw).unwrap();
            assert_eq!(tag as u32, raw);
        }
        assert!(MessageType::from_u32(0).is_none());
        assert!(MessageType::Terminate.is_control());
        assert!(MessageType::EndOfInput.is_control());
        assert!(!MessageType::Event.is_control());
    }

    #[test]
    fn test_decoder_handles_split_and_coalesced_frames() {
        let a = frame(MessageType::Event, b"first").unwrap();
        let b = frame(MessageType::EndOfInput, &[]).unwrap();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream[..3]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&stream[3..]);

        let first = decoder.next_frame().unwrap().unwrap();
        assert_eq!(first.payload, b"first");
        let second = decoder.next_frame().unwrap().unwrap();
        assert_eq!(second.tag, MessageType::EndOfInput);
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_rejects_impossible_length() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&2u32.to_le_bytes());
        assert!(matches!(
            decoder.next_raw(),
            Err(IpcError::CorruptFrame { .. })
        ));
    }
}
