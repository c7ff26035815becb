// src/frame.rs
//! RFC 6455 framing.
//!
//! Server frames are always sent unmasked and unfragmented. The decoder
//! accepts masked or unmasked client frames, reassembles fragmented
//! messages and never consumes a partial frame.

use crate::error::WsError;
use crate::message::{Event, Message};

/// Default cap on a single frame's payload and on a reassembled message.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;
const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self, WsError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(WsError::InvalidOpcode(other)),
        }
    }

    pub const fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// XOR-cycles `key` over `payload` in place. Masking and unmasking are the
/// same operation.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encodes one final, unmasked frame.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 10);
    out.push(0x80 | opcode as u8);
    if len < 126 {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// Encodes `message` as a single text or binary frame.
pub fn encode(message: &Message) -> Vec<u8> {
    match message {
        Message::Text(s) => encode_frame(Opcode::Text, s.as_bytes()),
        Message::Binary(b) => encode_frame(Opcode::Binary, b),
    }
}

/// A close frame, with a status code when one is given.
pub fn encode_close(code: Option<u16>) -> Vec<u8> {
    match code {
        Some(code) => encode_frame(Opcode::Close, &code.to_be_bytes()),
        None => encode_frame(Opcode::Close, &[]),
    }
}

struct Header {
    fin: bool,
    opcode: Opcode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
    header_len: usize,
}

/// Incremental decoder over an accumulating byte buffer.
#[derive(Debug)]
pub struct Decoder {
    buf: Vec<u8>,
    /// Opcode and data of a fragmented message still waiting for `fin`.
    partial: Option<(Opcode, Vec<u8>)>,
    max_payload: usize,
    closed: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buf: Vec::new(),
            partial: None,
            max_payload,
            closed: false,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed as whole frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Whether a close frame was decoded. Nothing is parsed after one.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next complete event, or `None` when more bytes are needed.
    pub fn next_event(&mut self) -> Result<Option<Event>, WsError> {
        while !self.closed {
            let Some(header) = self.parse_header()? else {
                return Ok(None);
            };
            let total = header.header_len + header.payload_len;
            if self.buf.len() < total {
                return Ok(None);
            }
            let mut payload: Vec<u8> = self.buf.drain(..total).skip(header.header_len).collect();
            if let Some(key) = header.mask {
                apply_mask(&mut payload, key);
            }
            if let Some(event) = self.on_frame(header.fin, header.opcode, payload)? {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn parse_header(&self) -> Result<Option<Header>, WsError> {
        let buf = &self.buf;
        if buf.len() < 2 {
            return Ok(None);
        }
        let fin = buf[0] & 0x80 != 0;
        if buf[0] & 0x70 != 0 {
            return Err(WsError::Protocol("reserved bits set without extension"));
        }
        let opcode = Opcode::from_u8(buf[0] & 0x0F)?;
        let masked = buf[1] & 0x80 != 0;

        let (len, mut pos) = match buf[1] & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            n => (n as u64, 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(WsError::Protocol("fragmented control frame"));
            }
            if len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(WsError::Protocol("control frame payload over 125 bytes"));
            }
        }
        if len > self.max_payload as u64 {
            return Err(WsError::PayloadTooLarge {
                size: len,
                max: self.max_payload,
            });
        }

        let mask = if masked {
            if buf.len() < pos + 4 {
                return Ok(None);
            }
            let key = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
            pos += 4;
            Some(key)
        } else {
            None
        };

        Ok(Some(Header {
            fin,
            opcode,
            mask,
            payload_len: len as usize,
            header_len: pos,
        }))
    }

    fn on_frame(
        &mut self,
        fin: bool,
        opcode: Opcode,
        payload: Vec<u8>,
    ) -> Result<Option<Event>, WsError> {
        match opcode {
            Opcode::Close => {
                self.closed = true;
                let code = (payload.len() >= 2).then(|| u16::from_be_bytes([payload[0], payload[1]]));
                Ok(Some(Event::Close(code)))
            }
            Opcode::Ping => Ok(Some(Event::Ping(payload))),
            Opcode::Pong => Ok(Some(Event::Pong(payload))),
            Opcode::Text | Opcode::Binary => {
                if self.partial.is_some() {
                    return Err(WsError::Protocol("new message before previous one finished"));
                }
                if fin {
                    return finish(opcode, payload).map(Some);
                }
                self.partial = Some((opcode, payload));
                Ok(None)
            }
            Opcode::Continuation => {
                let Some((first, mut data)) = self.partial.take() else {
                    return Err(WsError::Protocol("continuation without a message in progress"));
                };
                if data.len() + payload.len() > self.max_payload {
                    return Err(WsError::PayloadTooLarge {
                        size: (data.len() + payload.len()) as u64,
                        max: self.max_payload,
                    });
                }
                data.extend_from_slice(&payload);
                if fin {
                    return finish(first, data).map(Some);
                }
                self.partial = Some((first, data));
                Ok(None)
            }
        }
    }
}

fn finish(opcode: Opcode, data: Vec<u8>) -> Result<Event, WsError> {
    let message = match opcode {
        Opcode::Text => Message::Text(String::from_utf8(data).map_err(|_| WsError::InvalidUtf8)?),
        _ => Message::Binary(data),
    };
    Ok(Event::Message(message))
}
