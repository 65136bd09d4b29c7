use crate::config::MAX_FRAME_SIZE;
use crate::error::{ProxyError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Length prefix size in bytes
pub const LENGTH_PREFIX: usize = 4;
/// Packet id size in bytes
pub const ID_SIZE: usize = 4;

/// An undecoded packet: id plus body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// `id:u32 BE | payload`, the form stored in capture records.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ID_SIZE + self.payload.len());
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Inverse of [`Frame::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < ID_SIZE {
            return Err(ProxyError::InvalidHeader);
        }
        let id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        Ok(Self {
            id,
            payload: Bytes::copy_from_slice(&data[ID_SIZE..]),
        })
    }

    /// Bytes this frame occupies on a live connection.
    pub fn wire_len(&self) -> usize {
        LENGTH_PREFIX + ID_SIZE + self.payload.len()
    }
}

/// Length-delimited frame codec for live connections.
///
/// Wire layout: `length:u32 BE | id:u32 BE | payload`, where `length`
/// counts the id and the payload.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length < ID_SIZE {
            return Err(ProxyError::InvalidHeader);
        }
        let payload_len = length - ID_SIZE;
        if payload_len > self.max_frame_size {
            return Err(ProxyError::OversizedPacket(payload_len));
        }

        if src.len() < LENGTH_PREFIX + length {
            src.reserve(LENGTH_PREFIX + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let mut body = src.split_to(length);
        let id = body.get_u32();
        Ok(Some(Frame {
            id,
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProxyError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.max_frame_size {
            return Err(ProxyError::OversizedPacket(frame.payload.len()));
        }
        dst.reserve(frame.wire_len());
        dst.put_u32((ID_SIZE + frame.payload.len()) as u32);
        dst.put_u32(frame.id);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes_roundtrip() {
        let frame = Frame::new(0x3a, vec![1u8, 2, 3]);
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[..4], &[0, 0, 0, 0x3a]);
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_frame_from_short_bytes() {
        assert!(matches!(
            Frame::from_bytes(&[0, 1]),
            Err(ProxyError::InvalidHeader)
        ));
    }

    #[test]
    fn test_length_below_id_size_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 2, 9, 9][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProxyError::InvalidHeader)
        ));
    }

    #[test]
    fn test_encode_oversized_rejected() {
        let mut codec = FrameCodec::with_max_frame_size(8);
        let mut buf = BytesMut::new();
        let res = codec.encode(Frame::new(1, vec![0u8; 9]), &mut buf);
        assert!(matches!(res, Err(ProxyError::OversizedPacket(9))));
        assert!(buf.is_empty());
    }
}
