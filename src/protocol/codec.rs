//! Frame slicing and acknowledgement encoding.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Ack, Frame, FRAME_OVERHEAD, HEADER_SIZE, LENGTH_MASK, MAX_PAYLOAD_SIZE};
use crate::error::LinkError;

/// Tokio codec for device frames.
///
/// The codec's read buffer holds the connection's residual bytes between reads;
/// a frame is only yielded once all `N + 5` bytes are buffered.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload_size: usize,
}

impl FrameCodec {
    /// Create a codec accepting any length the protocol can express.
    pub fn new() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }

    /// Create a codec with a custom max payload size.
    pub fn with_max_payload(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = crate::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        // Need type byte and length word
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length_word = u16::from_le_bytes([src[1], src[2]]);
        let payload_len = usize::from(length_word & LENGTH_MASK);

        if payload_len > self.max_payload_size {
            return Err(LinkError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload_size,
            }
            .into());
        }

        let total_len = payload_len + FRAME_OVERHEAD;

        // Wait for the rest of the frame
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let data = src.split_to(total_len).freeze();
        Ok(Some(Frame::from_wire(data)?))
    }
}

impl Encoder<Ack> for FrameCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: Ack, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        dst.reserve(Ack::SIZE);
        dst.put_slice(&item.to_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::encode::build_frame;
    use crate::protocol::FrameKind;

    #[test]
    fn test_waits_for_complete_frame() {
        let wire = build_frame(0x01, &[0x10, 0x01, 0x00], false);
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&wire[..wire.len() - 1]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), wire.len() - 1, "residual must be kept");

        buf.put_u8(wire[wire.len() - 1]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Main);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_consumes_exactly_one_frame() {
        let first = build_frame(0x15, &[], false);
        let second = build_frame(0x01, &[0x10, 0x02, 0x00], false);
        let mut buf = BytesMut::new();
        buf.put_slice(&first);
        buf.put_slice(&second);

        let mut codec = FrameCodec::new();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Ignorable);
        assert_eq!(buf.len(), second.len());
    }

    #[test]
    fn test_rejects_oversized_length() {
        let mut codec = FrameCodec::with_max_payload(16);
        let mut buf = BytesMut::from(&[0x01, 0x20, 0x00][..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Link(LinkError::PayloadTooLarge { size: 32, max: 16 })
        ));
    }

    #[test]
    fn test_reserved_bit_does_not_affect_length() {
        let wire = build_frame(0x01, &[0x10, 0x05, 0x00], true);
        assert_eq!(wire[2] & 0x80, 0x80);

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&wire[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.archive_flag);
        assert_eq!(frame.payload.len(), 3);
    }

    #[test]
    fn test_encode_ack() {
        let mut codec = FrameCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(Ack { checksum: 0x1234 }, &mut dst).unwrap();
        assert_eq!(&dst[..], &[0x02, 0x34, 0x12]);
    }
}
