use bytes::{Buf, Bytes, BytesMut};

use crate::codec::{check_charset, Codec, Message};
use crate::{AppError, AppResult};

/// Text line framing: payload terminated by CR, LF, or CRLF.
///
/// The decoder scans byte by byte, eliding CR, and yields a message on LF.
/// A terminator with no payload bytes in front of it produces no message;
/// stray terminators are skipped once real payload follows them.
#[derive(Debug)]
pub struct LineCodec;

impl LineCodec {
    pub fn new(charset: &str) -> AppResult<LineCodec> {
        check_charset(charset)?;
        Ok(LineCodec)
    }
}

impl Codec for LineCodec {
    fn encode(&self, message: &Message) -> AppResult<Option<Bytes>> {
        let text = message.text()?;
        if text.is_empty() {
            // empty lines have no wire representation, mirrors decode
            return Ok(None);
        }
        if text.bytes().any(|b| b == b'\n' || b == b'\r') {
            return Err(AppError::MalformedFrame(
                "line message may not contain a line terminator".to_string(),
            ));
        }
        let mut frame = BytesMut::with_capacity(text.len() + 2);
        frame.extend_from_slice(text.as_bytes());
        frame.extend_from_slice(b"\r\n");
        Ok(Some(frame.freeze()))
    }

    fn decode(&self, buffer: &mut BytesMut) -> AppResult<Option<Message>> {
        let mut line: Vec<u8> = Vec::new();
        for (index, &byte) in buffer.iter().enumerate() {
            match byte {
                b'\r' => {}
                b'\n' => {
                    if !line.is_empty() {
                        let text = String::from_utf8(line).map_err(|e| {
                            AppError::MalformedFrame(format!("line is not valid UTF-8: {}", e))
                        })?;
                        buffer.advance(index + 1);
                        return Ok(Some(Message::from_text(text)));
                    }
                    // bare terminator with nothing buffered before it
                }
                other => line.push(other),
            }
        }
        // no complete line yet, position untouched
        Ok(None)
    }
}
