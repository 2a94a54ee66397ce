//! Message framing.
//!
//! A codec turns opaque application messages into wire frames and back.
//! Decoding follows a strict check-then-consume discipline: a codec must
//! never advance the buffer's read position unless a whole frame is
//! present, so partial reads can simply be retried once more bytes arrive.

pub use length_field::LengthFieldCodec;
pub use line::LineCodec;
mod length_field;
mod line;

use bytes::{Bytes, BytesMut};

use crate::{AppError, AppResult};

/// Opaque application payload moved through the transport. The engine never
/// interprets its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
}

impl Message {
    pub fn new(payload: Bytes) -> Message {
        Message { payload }
    }

    pub fn from_text(text: impl Into<String>) -> Message {
        Message {
            payload: Bytes::from(text.into()),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// View of the payload as text in the configured character encoding.
    pub fn text(&self) -> AppResult<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| AppError::MalformedFrame(format!("payload is not valid UTF-8: {}", e)))
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Message {
        Message::from_text(text)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Message {
        Message::from_text(text)
    }
}

impl From<Bytes> for Message {
    fn from(payload: Bytes) -> Message {
        Message::new(payload)
    }
}

/// Bidirectional message/frame converter. Implementations are stateless per
/// call and carry only their encoding settings, so one instance is shared
/// by every connection of an engine.
pub trait Codec: Send + Sync + 'static {
    /// Frames a message for the wire. `Ok(None)` means the message has no
    /// wire representation (for example an empty line) and nothing is sent.
    fn encode(&self, message: &Message) -> AppResult<Option<Bytes>>;

    /// Tries to decode one message from the front of `buffer`. `Ok(None)`
    /// means more bytes are needed; the buffer's read position is left
    /// untouched in that case.
    fn decode(&self, buffer: &mut BytesMut) -> AppResult<Option<Message>>;
}

/// Only UTF-8 (and its ASCII subset) payloads are supported; the charset
/// key exists so profiles can state the encoding explicitly.
pub(crate) fn check_charset(name: &str) -> AppResult<()> {
    match name.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" | "ascii" | "us-ascii" => Ok(()),
        _ => Err(AppError::UnsupportedCharset(name.to_string())),
    }
}
