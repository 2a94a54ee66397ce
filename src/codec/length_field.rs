use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{check_charset, Codec, Message};
use crate::{AppError, AppResult};

/// `[4-byte big-endian length][payload]` framing.
///
/// A zero-length frame is a valid empty message. Frames whose declared
/// length exceeds `max_frame_size` are rejected as malformed; there is no
/// way to resynchronize inside a corrupt length-prefixed stream, so the
/// caller decides whether to drop the buffer or the connection.
#[derive(Debug)]
pub struct LengthFieldCodec {
    max_frame_size: usize,
}

const LENGTH_HEADER_SIZE: usize = 4;

impl LengthFieldCodec {
    pub fn new(charset: &str, max_frame_size: usize) -> AppResult<LengthFieldCodec> {
        check_charset(charset)?;
        Ok(LengthFieldCodec { max_frame_size })
    }

    /// Peeks at the buffer without consuming. `Incomplete` is the marker
    /// for "come back with more bytes".
    fn check(&self, buffer: &mut BytesMut) -> AppResult<()> {
        if buffer.remaining() < LENGTH_HEADER_SIZE {
            return Err(AppError::Incomplete);
        }
        let mut header = [0u8; LENGTH_HEADER_SIZE];
        header.copy_from_slice(&buffer[..LENGTH_HEADER_SIZE]);
        let body_size = u32::from_be_bytes(header) as usize;
        if body_size > self.max_frame_size {
            return Err(AppError::MalformedFrame(format!(
                "frame of length {} is too large",
                body_size
            )));
        }
        if buffer.remaining() < body_size + LENGTH_HEADER_SIZE {
            buffer.reserve(body_size + LENGTH_HEADER_SIZE - buffer.remaining());
            return Err(AppError::Incomplete);
        }
        Ok(())
    }
}

impl Codec for LengthFieldCodec {
    fn encode(&self, message: &Message) -> AppResult<Option<Bytes>> {
        let payload = message.payload();
        if payload.len() > self.max_frame_size {
            return Err(AppError::MalformedFrame(format!(
                "message of length {} exceeds the frame limit",
                payload.len()
            )));
        }
        let mut frame = BytesMut::with_capacity(LENGTH_HEADER_SIZE + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.extend_from_slice(payload);
        Ok(Some(frame.freeze()))
    }

    fn decode(&self, buffer: &mut BytesMut) -> AppResult<Option<Message>> {
        match self.check(buffer) {
            Ok(()) => {
                let body_size = buffer.get_u32() as usize;
                let payload = buffer.split_to(body_size).freeze();
                Ok(Some(Message::new(payload)))
            }
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn codec() -> LengthFieldCodec {
        LengthFieldCodec::new("UTF-8", 1024).unwrap()
    }

    #[test]
    fn encodes_the_reference_vector() {
        let frame = codec().encode(&Message::from_text("abc")).unwrap().unwrap();
        assert_eq!(&frame[..], &[0x00, 0x00, 0x00, 0x03, 0x61, 0x62, 0x63]);
    }

    #[rstest]
    #[case(b"" as &[u8])]
    #[case(b"abc")]
    #[case(b"\x00\xff\x7f binary \x01")]
    fn round_trips(#[case] payload: &[u8]) {
        let codec = codec();
        let message = Message::new(Bytes::copy_from_slice(payload));
        let frame = codec.encode(&message).unwrap().unwrap();
        let mut buffer = BytesMut::from(&frame[..]);
        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(buffer.is_empty());
    }

    #[test]
    fn short_header_leaves_buffer_untouched() {
        let codec = codec();
        let mut buffer = BytesMut::from(&[0x00, 0x00][..]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        assert_eq!(&buffer[..], &[0x00, 0x00]);
    }

    #[test]
    fn split_frame_decodes_exactly_once() {
        let codec = codec();
        let frame = codec.encode(&Message::from_text("hello")).unwrap().unwrap();
        let (head, tail) = frame.split_at(6);

        let mut buffer = BytesMut::from(head);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        // nothing consumed on the incomplete path
        assert_eq!(buffer.len(), head.len());

        buffer.extend_from_slice(tail);
        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded.text().unwrap(), "hello");
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn oversized_length_is_malformed() {
        let codec = LengthFieldCodec::new("UTF-8", 8).unwrap();
        let mut buffer = BytesMut::from(&[0x00, 0x00, 0x01, 0x00][..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(AppError::MalformedFrame(_))
        ));
    }

    #[test]
    fn rejects_unsupported_charset() {
        assert!(matches!(
            LengthFieldCodec::new("latin-1", 1024),
            Err(AppError::UnsupportedCharset(_))
        ));
    }
}
