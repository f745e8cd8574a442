//! Length-prefixed bincode wire protocol for P2P communication.
//!
//! Frame format: [1-byte kind][4-byte length (u32 big-endian)][bincode payload]
//! Kind 0 is DATA, kind 1 is PEER. Maximum payload size: 4MB.

use crate::error::NetworkError;
use crate::network::message::Message;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame payload size (4MB)
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

pub const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Data = 0,
    Peer = 1,
}

impl FrameKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(FrameKind::Data),
            1 => Some(FrameKind::Peer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub message: Message,
}

impl Frame {
    pub fn data(message: Message) -> Self {
        Self {
            kind: FrameKind::Data,
            message,
        }
    }

    pub fn peer(message: Message) -> Self {
        Self {
            kind: FrameKind::Peer,
            message,
        }
    }

    /// DATA-kind DATA_PUSH: the handshake a dialer sends first.
    pub fn preamble() -> Self {
        Self::data(Message::data_push())
    }

    pub fn is_preamble(&self) -> bool {
        self.kind == FrameKind::Data && self.message.is_data_push()
    }
}

/// Serialize a frame into its wire bytes.
pub fn serialize_frame(frame: &Frame) -> Result<Vec<u8>, NetworkError> {
    let payload = bincode::serialize(&frame.message)
        .map_err(|e| NetworkError::Decode(format!("Failed to serialize message: {}", e)))?;

    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(NetworkError::FrameTooLarge(payload.len()));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(frame.kind as u8);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Write a frame and flush. Returns the number of bytes written.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<usize, NetworkError> {
    let bytes = serialize_frame(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(bytes.len())
}

/// Take one complete frame off the front of `buf`.
///
/// `Ok(None)` means more bytes are needed. A frame with an unknown kind or
/// an undecodable payload is consumed and reported as `Decode`, so the
/// caller can keep reading after it. An oversized length prefix cannot be
/// skipped safely; the whole buffer is discarded.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, NetworkError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let kind_byte = buf[0];
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len > MAX_FRAME_SIZE {
        buf.clear();
        return Err(NetworkError::FrameTooLarge(len as usize));
    }

    let total = HEADER_LEN + len as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(len as usize);

    let kind = FrameKind::from_byte(kind_byte)
        .ok_or_else(|| NetworkError::Decode(format!("unknown frame kind {}", kind_byte)))?;
    let message: Message = bincode::deserialize(&payload)
        .map_err(|e| NetworkError::Decode(format!("Failed to deserialize message: {}", e)))?;

    Ok(Some(Frame { kind, message }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_decode() {
        let frame = Frame::data(Message::get_blocks(Some([4u8; 32])));

        let mut out = Vec::new();
        let written = write_frame(&mut out, &frame).await.unwrap();
        assert_eq!(written, out.len());

        let mut buf = BytesMut::from(&out[..]);
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_coalesced_and_split_frames() {
        let a = serialize_frame(&Frame::preamble()).unwrap();
        let b = serialize_frame(&Frame::data(Message::ping())).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b[..3]);

        assert!(decode_frame(&mut buf).unwrap().unwrap().is_preamble());
        assert_eq!(decode_frame(&mut buf).unwrap(), None);

        buf.extend_from_slice(&b[3..]);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.message, Message::ping());
    }

    #[test]
    fn test_bad_frame_is_skipped() {
        let mut bad = serialize_frame(&Frame::data(Message::ping())).unwrap();
        bad[0] = 9;
        let good = serialize_frame(&Frame::peer(Message::pong())).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bad);
        buf.extend_from_slice(&good);

        assert!(matches!(decode_frame(&mut buf), Err(NetworkError::Decode(_))));
        let next = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(next.kind, FrameKind::Peer);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0u8]);
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        assert!(matches!(
            decode_frame(&mut buf),
            Err(NetworkError::FrameTooLarge(_))
        ));
        assert!(buf.is_empty());
    }
}
