// src/lib.rs
//! WebSocket support for Etude.
//!
//! [`handshake`] turns an upgrade request into a [`WebSocket`] whose
//! `wait`/`send` block only the calling coroutine. RFC 6455 is the primary
//! protocol; the legacy hixie-76 variant is negotiated when a client asks
//! for it.
mod error;
pub mod frame;
mod handler;
mod handshake;
pub mod legacy;
mod message;
mod session;

pub use error::{HandshakeError, WsError};
pub use handler::WebSocketHandler;
pub use handshake::{Negotiated, WsVersion, compute_accept_key, handshake, legacy_challenge, negotiate};
pub use message::{Event, Message};
pub use session::WebSocket;
