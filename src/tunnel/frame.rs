//! Frame encoding/decoding for direct multiplexing
//!
//! Frame format (inside the secure channel):
//! ```text
//! +--------+--------+--------+--------+
//! |  Type  |     Stream ID (4B) ...   |
//! +--------+--------+--------+--------+
//! |  ...   |   Length (2B)   |        |
//! +--------+--------+--------+        |
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 7;

/// Largest payload the 2-byte length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Stream data
    Data = 0x00,
    /// Stream open; payload is empty or an encoded destination address
    StreamOpen = 0x01,
    /// Sender will write no more data on the stream
    StreamClose = 0x02,
    /// Keepalive probe
    Ping = 0x03,
    /// Keepalive response, echoes the ping payload
    Pong = 0x04,
    /// Session is closing
    GoAway = 0x05,
    /// Receive credit for a stream; payload is a u32 increment
    WindowUpdate = 0x06,
    /// Outcome of a stream open; payload is one status byte, 0 = connected
    OpenResult = 0x07,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Data),
            0x01 => Ok(FrameType::StreamOpen),
            0x02 => Ok(FrameType::StreamClose),
            0x03 => Ok(FrameType::Ping),
            0x04 => Ok(FrameType::Pong),
            0x05 => Ok(FrameType::GoAway),
            0x06 => Ok(FrameType::WindowUpdate),
            0x07 => Ok(FrameType::OpenResult),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A multiplexing frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    /// Stream ID (0 for session-level frames)
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    /// Create a stream open frame
    pub fn stream_open(stream_id: u32, destination: &[u8]) -> Self {
        Self {
            frame_type: FrameType::StreamOpen,
            stream_id,
            payload: Bytes::copy_from_slice(destination),
        }
    }

    /// Create a stream close frame
    pub fn stream_close(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::StreamClose,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a window update frame
    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Self {
            frame_type: FrameType::WindowUpdate,
            stream_id,
            payload: payload.freeze(),
        }
    }

    /// Create an open result frame
    pub fn open_result(stream_id: u32, status: u8) -> Self {
        Self {
            frame_type: FrameType::OpenResult,
            stream_id,
            payload: Bytes::copy_from_slice(&[status]),
        }
    }

    /// Create a ping frame
    pub fn ping(nonce: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(nonce);
        Self {
            frame_type: FrameType::Ping,
            stream_id: 0,
            payload: payload.freeze(),
        }
    }

    /// Create a pong frame answering a ping
    pub fn pong(payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Pong,
            stream_id: 0,
            payload,
        }
    }

    /// Create a go-away frame
    pub fn go_away() -> Self {
        Self {
            frame_type: FrameType::GoAway,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A payload longer than
    /// `max_payload` is rejected before it is buffered.
    pub fn decode(buf: &mut BytesMut, max_payload: usize) -> Result<Option<Self>, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let frame_type = FrameType::try_from(buf[0])?;
        let stream_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let payload_len = u16::from_be_bytes([buf[5], buf[6]]) as usize;

        if payload_len > max_payload {
            return Err(TunnelError::FrameTooLarge(payload_len, max_payload));
        }

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            frame_type,
            stream_id,
            payload,
        }))
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}
