//! Length-prefixed, tagged frame codec for the unix-socket protocol.
//!
//! Each frame is:
//!
//! ```text
//! +-----------+----------------------+------------------+
//! | Tag (1 B) | Length (4 B, BE u32) | Payload          |
//! +-----------+----------------------+------------------+
//! ```
//!
//! The codec enforces bounded reads: the length is validated against
//! [`MAX_FRAME_SIZE`] before any allocation, and unknown tags fail the
//! stream instead of desynchronizing it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::FrameTag;

/// Maximum frame payload size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length of the frame header: tag byte plus u32 length prefix.
const HEADER_LEN: usize = 5;

/// Protocol-level failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A length prefix larger than the cap.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared payload size.
        size: usize,
        /// The enforced cap.
        max: usize,
    },

    /// A tag byte outside the protocol's tag set.
    #[error("unknown frame tag: 0x{0:02x}")]
    UnknownTag(u8),

    /// A frame arrived where a different one was required.
    #[error("unexpected frame 0x{got:02x} (expected 0x{expected:02x})")]
    UnexpectedFrame {
        /// Tag received.
        got: u8,
        /// Tag required.
        expected: u8,
    },

    /// A JSON payload failed to encode or decode.
    #[error("frame payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// Transport failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The peer closed the stream mid-conversation.
    #[error("connection closed")]
    Closed,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// The frame type.
    pub tag: FrameTag,
    /// The raw payload.
    pub payload: Bytes,
}

impl Frame {
    /// Builds a frame from raw bytes.
    #[must_use]
    pub fn new(tag: FrameTag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Builds a frame carrying a JSON-encoded payload.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Payload`] if serialization fails.
    pub fn json<T: Serialize>(tag: FrameTag, value: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            tag,
            payload: Bytes::from(serde_json::to_vec(value)?),
        })
    }

    /// Decodes the payload as JSON.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Payload`] if deserialization fails.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Codec for use with `tokio_util::codec::{FramedRead, FramedWrite}`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Creates a codec with the protocol's default frame cap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag_byte = src[0];
        let Some(tag) = FrameTag::from_u8(tag_byte) else {
            return Err(ProtocolError::UnknownTag(tag_byte));
        };

        // Validate the length before allocating anything.
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();
        Ok(Some(Frame { tag, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if frame.payload.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.payload.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u8(frame.tag.as_u8());
        #[allow(clippy::cast_possible_truncation)] // validated above
        dst.put_u32(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(FrameTag::StdoutData, Bytes::from_static(b"hello world"));

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + 11);
        assert_eq!(buf[0], 0x10);
        assert_eq!(&buf[1..5], &[0, 0, 0, 11]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_round_trip_every_tag_and_size() {
        let mut codec = FrameCodec::new();
        let tags = [
            FrameTag::Request,
            FrameTag::StdinData,
            FrameTag::StdinEof,
            FrameTag::Signal,
            FrameTag::StdoutData,
            FrameTag::StderrData,
            FrameTag::Exit,
        ];
        for tag in tags {
            for size in [0usize, 1, 255, 4096, 1024 * 1024] {
                let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
                let frame = Frame::new(tag, payload.clone());
                let mut buf = BytesMut::new();
                codec.encode(frame, &mut buf).unwrap();
                let decoded = codec.decode(&mut buf).unwrap().unwrap();
                assert_eq!(decoded.tag, tag);
                assert_eq!(&decoded.payload[..], &payload[..]);
            }
        }
    }

    #[test]
    fn test_partial_frames_need_more_data() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x10u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);

        let mut buf = BytesMut::from(&[0x10u8, 0, 0, 0, 10, 1, 2, 3][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_oversized_frame_rejected_before_allocation() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u8(0x02);
        buf.put_u32(20 * 1024 * 1024);
        buf.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { max: MAX_FRAME_SIZE, .. })
        ));
    }

    #[test]
    fn test_unknown_tag_fails_stream() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x7fu8, 0, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::UnknownTag(0x7f))
        ));
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let first = Frame::new(FrameTag::StdinData, Bytes::from_static(b"first"));
        let second = Frame::new(FrameTag::StdinEof, Bytes::new());

        let mut buf = BytesMut::new();
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_json_frame_round_trip() {
        let exit = super::super::ExitResult {
            code: 1,
            error: "doit: policy: nope".to_string(),
            policy_deny: "deny-rm-catastrophic".to_string(),
            policy_escalate: String::new(),
        };
        let frame = Frame::json(FrameTag::Exit, &exit).unwrap();
        let back: super::super::ExitResult = frame.parse_json().unwrap();
        assert_eq!(back, exit);
    }
}
