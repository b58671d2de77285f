//! Message type and reference wire codec.
//!
//! A [`Message`] is immutable after creation: payload bytes plus routing
//! metadata (topic, publisher identity, per-publisher sequence number,
//! timestamp). The wire format is deliberately simple and fixed to
//! little-endian so independent implementations can interoperate:
//!
//! ```text
//! u32  frame length (everything after this field)
//! u16  topic length        + topic bytes (utf-8)
//! u16  publisher length    + publisher bytes (utf-8)
//! u64  sequence number
//! i64  timestamp (milliseconds since epoch)
//! u32  payload length      + payload bytes
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Default upper bound on a single encoded frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the configured maximum")]
    FrameTooLarge(usize),

    #[error("frame truncated: {0}")]
    Truncated(&'static str),

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
}

/// An immutable published message.
///
/// Created once at publish time and shared read-only with every delivered
/// subscription. Cloning is cheap: the payload is a reference-counted
/// [`Bytes`] buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was published on.
    pub topic: String,
    /// Identity of the publishing node.
    pub publisher: String,
    /// Per-publisher monotonically increasing sequence number.
    pub seq: u64,
    /// Publish time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Raw payload bytes. Decoding to text or structured data is the
    /// subscriber's responsibility, never the core's.
    pub payload: Bytes,
}

impl Message {
    /// Create a message stamped with the current wall-clock time.
    pub fn new(
        topic: impl Into<String>,
        publisher: impl Into<String>,
        seq: u64,
        payload: Bytes,
    ) -> Self {
        Self {
            topic: topic.into(),
            publisher: publisher.into(),
            seq,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            payload,
        }
    }

    /// Encoded size of the frame body (excluding the u32 length prefix).
    fn body_len(&self) -> usize {
        2 + self.topic.len() + 2 + self.publisher.len() + 8 + 8 + 4 + self.payload.len()
    }

    /// Append the full frame (length prefix included) to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let body = self.body_len();
        if body > u32::MAX as usize
            || self.topic.len() > u16::MAX as usize
            || self.publisher.len() > u16::MAX as usize
        {
            return Err(CodecError::FrameTooLarge(body));
        }
        buf.reserve(4 + body);
        buf.put_u32_le(body as u32);
        buf.put_u16_le(self.topic.len() as u16);
        buf.put_slice(self.topic.as_bytes());
        buf.put_u16_le(self.publisher.len() as u16);
        buf.put_slice(self.publisher.as_bytes());
        buf.put_u64_le(self.seq);
        buf.put_i64_le(self.timestamp_ms);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = BytesMut::with_capacity(4 + self.body_len());
        self.encode(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame;
    /// the caller keeps accumulating and retries. On success the consumed
    /// bytes are removed from `buf`, so decoding is restartable across
    /// calls.
    pub fn decode(buf: &mut BytesMut, max_frame: usize) -> Result<Option<Message>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let body = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if body > max_frame {
            return Err(CodecError::FrameTooLarge(body));
        }
        if buf.len() < 4 + body {
            return Ok(None);
        }
        buf.advance(4);
        let mut frame = buf.split_to(body);
        let message = Self::decode_body(&mut frame)?;
        Ok(Some(message))
    }

    fn decode_body(frame: &mut BytesMut) -> Result<Message, CodecError> {
        let topic = read_string(frame, "topic")?;
        let publisher = read_string(frame, "publisher")?;
        if frame.remaining() < 8 + 8 + 4 {
            return Err(CodecError::Truncated("header"));
        }
        let seq = frame.get_u64_le();
        let timestamp_ms = frame.get_i64_le();
        let payload_len = frame.get_u32_le() as usize;
        if frame.remaining() < payload_len {
            return Err(CodecError::Truncated("payload"));
        }
        let payload = frame.split_to(payload_len).freeze();
        Ok(Message {
            topic,
            publisher,
            seq,
            timestamp_ms,
            payload,
        })
    }
}

fn read_string(frame: &mut BytesMut, field: &'static str) -> Result<String, CodecError> {
    if frame.remaining() < 2 {
        return Err(CodecError::Truncated(field));
    }
    let len = frame.get_u16_le() as usize;
    if frame.remaining() < len {
        return Err(CodecError::Truncated(field));
    }
    let raw = frame.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))
}
