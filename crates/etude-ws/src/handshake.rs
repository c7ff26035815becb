// src/handshake.rs
//! HTTP Upgrade negotiation.
//!
//! RFC 6455 is the primary path. Clients sending `Sec-WebSocket-Key1` and
//! `Sec-WebSocket-Key2` instead of `Sec-WebSocket-Key` get the legacy
//! hixie-76 exchange: an MD5 challenge answered in the 101 body.

use crate::error::HandshakeError;
use crate::session::WebSocket;
use base64::Engine;
use etude_core::{Context, Request, Response};
use md5::Md5;
use sha1::{Digest, Sha1};
use tracing::debug;

/// RFC 6455 GUID appended to the client key.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const SUPPORTED_VERSION: &str = "13";

/// Wire protocol chosen at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsVersion {
    Rfc6455,
    /// draft-hixie-thewebsocketprotocol-76.
    Hixie76,
}

impl WsVersion {
    /// The number clients use for this version on the wire.
    pub fn number(self) -> u8 {
        match self {
            WsVersion::Rfc6455 => 13,
            WsVersion::Hixie76 => 76,
        }
    }
}

/// `base64(SHA1(key ++ GUID))`.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Digits of a legacy key divided by its space count.
fn legacy_key_number(key: &str) -> Result<u32, HandshakeError> {
    let mut digits: u64 = 0;
    let mut spaces: u64 = 0;
    for c in key.chars() {
        if let Some(d) = c.to_digit(10) {
            digits = digits
                .checked_mul(10)
                .and_then(|n| n.checked_add(d as u64))
                .ok_or(HandshakeError::InvalidLegacyKey("key number overflows"))?;
        } else if c == ' ' {
            spaces += 1;
        }
    }
    if spaces == 0 {
        return Err(HandshakeError::InvalidLegacyKey("key has no spaces"));
    }
    if digits % spaces != 0 {
        return Err(HandshakeError::InvalidLegacyKey("key is not a multiple of its spaces"));
    }
    u32::try_from(digits / spaces)
        .map_err(|_| HandshakeError::InvalidLegacyKey("key number exceeds 32 bits"))
}

/// hixie-76 challenge: `MD5(be32(key1) ++ be32(key2) ++ key3)`.
pub fn legacy_challenge(key1: &str, key2: &str, key3: &[u8]) -> Result<[u8; 16], HandshakeError> {
    if key3.len() != 8 {
        return Err(HandshakeError::InvalidLegacyKey("challenge body must be 8 bytes"));
    }
    let mut hasher = Md5::new();
    hasher.update(legacy_key_number(key1)?.to_be_bytes());
    hasher.update(legacy_key_number(key2)?.to_be_bytes());
    hasher.update(key3);
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

/// Outcome of inspecting an upgrade request.
#[derive(Debug)]
pub struct Negotiated {
    pub version: WsVersion,
    pub protocol: Option<String>,
    /// The `101` to write before switching protocols.
    pub response: Response,
}

fn is_upgrade(request: &Request) -> bool {
    request.has_token("connection", "upgrade")
        && request
            .header("upgrade")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
}

/// Picks the subprotocol to echo: the first one the client offered that
/// the server supports, or the client's first offer when the server lists
/// none.
fn select_protocol(request: &Request, supported: &[&str]) -> Option<String> {
    let mut offered = request.header_tokens("sec-websocket-protocol");
    if supported.is_empty() {
        return offered.next().map(str::to_string);
    }
    offered
        .find(|p| supported.iter().any(|s| s.eq_ignore_ascii_case(p)))
        .map(str::to_string)
}

/// Validates `request` and builds the switching-protocols response.
pub fn negotiate(request: &Request, subprotocols: &[&str]) -> Result<Negotiated, HandshakeError> {
    if !is_upgrade(request) {
        return Err(HandshakeError::NotUpgrade);
    }
    let protocol = select_protocol(request, subprotocols);

    if let Some(key1) = request.header("sec-websocket-key1") {
        let key2 = request
            .header("sec-websocket-key2")
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key2"))?;
        let challenge = legacy_challenge(key1, key2, &request.body)?;

        let mut location = format!(
            "ws://{}{}",
            request.header("host").unwrap_or_default(),
            request.path
        );
        if let Some(qs) = request.query.as_deref().filter(|q| !q.is_empty()) {
            location.push('?');
            location.push_str(qs);
        }
        let mut response = Response::new(101)
            .with_reason("WebSocket Protocol Handshake")
            .with_header("Upgrade", "WebSocket")
            .with_header("Connection", "Upgrade")
            .with_header("Sec-WebSocket-Origin", request.header("origin").unwrap_or("null"))
            .with_header("Sec-WebSocket-Location", location);
        if let Some(p) = &protocol {
            response = response.with_header("Sec-WebSocket-Protocol", p.clone());
        }
        return Ok(Negotiated {
            version: WsVersion::Hixie76,
            protocol,
            response: response.with_body(challenge.to_vec()),
        });
    }

    let key = request
        .header("sec-websocket-key")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?
        .trim();
    match request.header("sec-websocket-version").map(str::trim) {
        Some(SUPPORTED_VERSION) => {}
        other => return Err(HandshakeError::UnsupportedVersion(other.map(str::to_string))),
    }
    let nonce = base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|_| HandshakeError::InvalidKey)?;
    if nonce.len() != 16 {
        return Err(HandshakeError::InvalidKey);
    }

    let mut response = Response::new(101)
        .with_header("Upgrade", "websocket")
        .with_header("Connection", "Upgrade")
        .with_header("Sec-WebSocket-Accept", compute_accept_key(key));
    if let Some(p) = &protocol {
        response = response.with_header("Sec-WebSocket-Protocol", p.clone());
    }
    Ok(Negotiated {
        version: WsVersion::Rfc6455,
        protocol,
        response,
    })
}

/// Completes the upgrade on the request's connection and returns the
/// session.
///
/// On error nothing has been written; answer with
/// [`HandshakeError::into_response`].
pub fn handshake(ctx: &mut Context, subprotocols: &[&str]) -> Result<WebSocket, HandshakeError> {
    if ctx.is_upgraded() {
        return Err(HandshakeError::AlreadyUpgraded);
    }
    let negotiated = negotiate(&ctx.request, subprotocols)?;
    ctx.socket().send_all(&negotiated.response.to_bytes(false))?;
    let socket = ctx.upgrade().ok_or(HandshakeError::AlreadyUpgraded)?;
    debug!(
        version = negotiated.version.number(),
        path = %ctx.request.path,
        protocol = negotiated.protocol.as_deref().unwrap_or(""),
        "websocket upgraded"
    );
    Ok(WebSocket::new(
        socket,
        negotiated.version,
        &ctx.request,
        negotiated.protocol,
    ))
}
