// src/legacy.rs
//! Pre-RFC (hixie-76) framing: text frames are `0x00 <utf-8> 0xFF`, and the
//! closing handshake is `0xFF 0x00`. Binary messages do not exist.

use crate::error::WsError;
use crate::message::{Event, Message};
use memchr::memchr;

pub const CLOSE_FRAME: [u8; 2] = [0xFF, 0x00];

pub fn encode(message: &Message) -> Result<Vec<u8>, WsError> {
    let Message::Text(text) = message else {
        return Err(WsError::LegacyFrame("binary messages are not supported"));
    };
    let mut out = Vec::with_capacity(text.len() + 2);
    out.push(0x00);
    out.extend_from_slice(text.as_bytes());
    out.push(0xFF);
    Ok(out)
}

#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
    closed: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next complete event, or `None` when more bytes are needed.
    ///
    /// Invalid UTF-8 inside a text frame is replaced, not rejected.
    pub fn next_event(&mut self) -> Result<Option<Event>, WsError> {
        if self.closed || self.buf.is_empty() {
            return Ok(None);
        }
        match self.buf[0] {
            0x00 => {
                let Some(end) = memchr(0xFF, &self.buf[1..]) else {
                    return Ok(None);
                };
                let frame: Vec<u8> = self.buf.drain(..end + 2).collect();
                let text = String::from_utf8_lossy(&frame[1..end + 1]).into_owned();
                Ok(Some(Event::Message(Message::Text(text))))
            }
            0xFF => match self.buf.get(1) {
                None => Ok(None),
                Some(0x00) => {
                    self.closed = true;
                    self.buf.drain(..2);
                    Ok(Some(Event::Close(None)))
                }
                Some(_) => Err(WsError::LegacyFrame("unexpected closing handshake")),
            },
            _ => Err(WsError::LegacyFrame("unknown frame type")),
        }
    }
}
