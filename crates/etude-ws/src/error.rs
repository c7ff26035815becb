// src/error.rs
use etude_core::{EtudeError, Response};
use std::io;
use thiserror::Error;

/// Why an upgrade request was refused.
///
/// Each variant maps onto a 4xx response through [`HandshakeError::into_response`],
/// so a failed handshake never escapes as a server error.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// `Connection: Upgrade` / `Upgrade: websocket` are absent or wrong.
    #[error("not a websocket upgrade request")]
    NotUpgrade,
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    /// `Sec-WebSocket-Key` is not 16 base64-encoded bytes.
    #[error("invalid Sec-WebSocket-Key")]
    InvalidKey,
    /// `Sec-WebSocket-Version` absent or not `13`.
    #[error("unsupported websocket version: {}", .0.as_deref().unwrap_or("none"))]
    UnsupportedVersion(Option<String>),
    /// Legacy `Sec-WebSocket-Key1`/`Key2`/body challenge is malformed.
    #[error("invalid legacy handshake key: {0}")]
    InvalidLegacyKey(&'static str),
    /// The connection was already taken over by someone else.
    #[error("connection already upgraded")]
    AlreadyUpgraded,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HandshakeError {
    pub fn status(&self) -> u16 {
        match self {
            HandshakeError::UnsupportedVersion(_) => 426,
            HandshakeError::Io(_) | HandshakeError::AlreadyUpgraded => 500,
            _ => 400,
        }
    }

    /// The HTTP response to send in place of `101 Switching Protocols`.
    pub fn into_response(self) -> Response {
        let response =
            Response::text(self.status(), self.to_string()).with_header("Connection", "close");
        match self {
            HandshakeError::UnsupportedVersion(_) => {
                response.with_header("Sec-WebSocket-Version", "13")
            }
            _ => response,
        }
    }
}

/// Errors raised by an established websocket session.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid opcode: 0x{0:X}")]
    InvalidOpcode(u8),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("invalid UTF-8 in text frame")]
    InvalidUtf8,
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: u64, max: usize },
    #[error("legacy framing error: {0}")]
    LegacyFrame(&'static str),
    /// Sending on a session after it was closed.
    #[error("websocket is closed")]
    Closed,
}

impl WsError {
    /// RFC 6455 close status reported to the peer when this error ends
    /// the session.
    pub fn close_code(&self) -> u16 {
        match self {
            WsError::InvalidUtf8 => 1007,
            WsError::PayloadTooLarge { .. } => 1009,
            WsError::Io(_) => 1011,
            WsError::Closed => 1000,
            WsError::InvalidOpcode(_) | WsError::Protocol(_) | WsError::LegacyFrame(_) => 1002,
        }
    }
}

impl From<WsError> for EtudeError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::Io(e) => EtudeError::Io(e),
            other => EtudeError::Io(io::Error::new(io::ErrorKind::InvalidData, other)),
        }
    }
}

impl From<HandshakeError> for EtudeError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Io(e) => EtudeError::Io(e),
            other => EtudeError::Io(io::Error::new(io::ErrorKind::InvalidInput, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_error_statuses() {
        assert_eq!(HandshakeError::NotUpgrade.status(), 400);
        assert_eq!(HandshakeError::MissingHeader("Sec-WebSocket-Key").status(), 400);
        assert_eq!(HandshakeError::UnsupportedVersion(Some("8".into())).status(), 426);
    }

    #[test]
    fn test_unsupported_version_advertises_13() {
        let res = HandshakeError::UnsupportedVersion(None).into_response();
        assert_eq!(res.status, 426);
        assert_eq!(res.header("sec-websocket-version"), Some("13"));
        assert_eq!(res.header("connection"), Some("close"));
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(WsError::InvalidOpcode(3).close_code(), 1002);
        assert_eq!(WsError::Protocol("fragmented control frame").close_code(), 1002);
        assert_eq!(WsError::InvalidUtf8.close_code(), 1007);
        assert_eq!(WsError::PayloadTooLarge { size: 10, max: 1 }.close_code(), 1009);
    }

    #[test]
    fn test_ws_error_converts_to_io() {
        let err: EtudeError = WsError::InvalidUtf8.into();
        match err {
            EtudeError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidData),
            other => panic!("unexpected {other:?}"),
        }
    }
}
