// src/session.rs
use crate::error::WsError;
use crate::frame;
use crate::handshake::WsVersion;
use crate::legacy;
use crate::message::{Event, Message};
use etude_core::{Request, Socket};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const RECV_CHUNK: usize = 8096;

/// Framing selected once, at handshake time.
enum Codec {
    Rfc6455(frame::Decoder),
    Hixie76(legacy::Decoder),
}

impl Codec {
    fn new(version: WsVersion) -> Self {
        match version {
            WsVersion::Rfc6455 => Codec::Rfc6455(frame::Decoder::new()),
            WsVersion::Hixie76 => Codec::Hixie76(legacy::Decoder::new()),
        }
    }

    fn extend(&mut self, bytes: &[u8]) {
        match self {
            Codec::Rfc6455(d) => d.extend(bytes),
            Codec::Hixie76(d) => d.extend(bytes),
        }
    }

    fn next_event(&mut self) -> Result<Option<Event>, WsError> {
        match self {
            Codec::Rfc6455(d) => d.next_event(),
            Codec::Hixie76(d) => d.next_event(),
        }
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, WsError> {
        match self {
            Codec::Rfc6455(_) => Ok(frame::encode(message)),
            Codec::Hixie76(_) => legacy::encode(message),
        }
    }

    fn close_frame(&self, code: u16) -> Vec<u8> {
        match self {
            Codec::Rfc6455(_) => frame::encode_close(Some(code)),
            Codec::Hixie76(_) => legacy::CLOSE_FRAME.to_vec(),
        }
    }
}

struct State {
    codec: Codec,
    messages: VecDeque<Message>,
    /// Frames queued while another coroutine is mid-send on this socket.
    outbox: VecDeque<Vec<u8>>,
    sending: bool,
    /// The peer sent a close frame or hung up.
    peer_closed: bool,
    /// [`WebSocket::close`] ran.
    closed: bool,
}

struct Inner {
    socket: Socket,
    version: WsVersion,
    path: String,
    origin: Option<String>,
    protocol: Option<String>,
    state: Mutex<State>,
}

/// An established websocket connection.
///
/// Clones share the connection, so a session can be stored in a room and
/// written to from other requests. Locks are never held across a blocking
/// receive or send.
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<Inner>,
}

impl WebSocket {
    pub(crate) fn new(
        socket: Socket,
        version: WsVersion,
        request: &Request,
        protocol: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                socket,
                version,
                path: request.path.clone(),
                origin: request.header("origin").map(str::to_string),
                protocol,
                state: Mutex::new(State {
                    codec: Codec::new(version),
                    messages: VecDeque::new(),
                    outbox: VecDeque::new(),
                    sending: false,
                    peer_closed: false,
                    closed: false,
                }),
            }),
        }
    }

    /// Sends one message.
    ///
    /// If another coroutine is part-way through a send on this connection
    /// the frame is queued behind it and written by that sender. Should
    /// that write fail, the queued frames are dropped and the session is
    /// closed, so the loss surfaces on the next `send` or `wait`.
    pub fn send(&self, message: impl Into<Message>) -> Result<(), WsError> {
        let message = message.into();
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(WsError::Closed);
            }
            let frame = state.codec.encode(&message)?;
            state.outbox.push_back(frame);
            if state.sending {
                return Ok(());
            }
            state.sending = true;
        }
        self.flush()
    }

    fn flush(&self) -> Result<(), WsError> {
        loop {
            let next = {
                let mut state = self.inner.state.lock();
                let next = state.outbox.pop_front();
                if next.is_none() {
                    state.sending = false;
                }
                next
            };
            let Some(frame) = next else {
                return Ok(());
            };
            if let Err(e) = self.inner.socket.send_all(&frame) {
                let dropped = {
                    let mut state = self.inner.state.lock();
                    let dropped = state.outbox.len();
                    state.outbox.clear();
                    state.sending = false;
                    state.closed = true;
                    dropped
                };
                debug!(path = %self.inner.path, dropped, "websocket send failed, closing: {e}");
                self.inner.socket.close();
                return Err(e.into());
            }
        }
    }

    /// The oldest message not yet returned, blocking this coroutine until
    /// one arrives. `None` once the connection is closed and nothing is
    /// left to read.
    pub fn wait(&self) -> Result<Option<Message>, WsError> {
        let mut chunk = vec![0u8; RECV_CHUNK];
        loop {
            {
                let mut state = self.inner.state.lock();
                if let Some(message) = state.messages.pop_front() {
                    return Ok(Some(message));
                }
                if state.closed || state.peer_closed {
                    return Ok(None);
                }
            }

            let n = self.inner.socket.recv(&mut chunk)?;
            let mut state = self.inner.state.lock();
            if n == 0 {
                state.peer_closed = true;
                continue;
            }
            state.codec.extend(&chunk[..n]);
            if let Err(e) = drain_events(&mut state) {
                debug!(path = %self.inner.path, "websocket protocol error: {e}");
                state.closed = true;
                // Never interleave with a frame another sender is writing.
                let frame = (!state.sending).then(|| state.codec.close_frame(e.close_code()));
                drop(state);
                if let Some(frame) = frame {
                    let _ = self.inner.socket.send_all(&frame);
                }
                self.inner.socket.close();
                return Err(e);
            }
        }
    }

    /// Sends a close frame, then closes the socket. Idempotent.
    pub fn close(&self) {
        let frame = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.codec.close_frame(1000)
        };
        if let Err(e) = self.inner.socket.send_all(&frame) {
            debug!(path = %self.inner.path, "close frame not delivered: {e}");
        }
        self.inner.socket.close();
    }

    pub fn is_closed(&self) -> bool {
        let state = self.inner.state.lock();
        state.closed || state.peer_closed
    }

    pub fn version(&self) -> WsVersion {
        self.inner.version
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn origin(&self) -> Option<&str> {
        self.inner.origin.as_deref()
    }

    /// The negotiated subprotocol, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.inner.protocol.as_deref()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.socket.peer_addr().ok()
    }

    /// Per-operation timeout for [`wait`](Self::wait) and
    /// [`send`](Self::send).
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.socket.set_timeout(timeout);
    }
}

/// Moves every complete event out of the codec. Stops at a close frame.
fn drain_events(state: &mut State) -> Result<(), WsError> {
    while let Some(event) = state.codec.next_event()? {
        match event {
            Event::Message(message) => state.messages.push_back(message),
            Event::Close(code) => {
                debug!(?code, "peer closed websocket");
                state.peer_closed = true;
                break;
            }
            // Pings are logged, never answered.
            Event::Ping(payload) => debug!(len = payload.len(), "ping received, not answered"),
            Event::Pong(payload) => debug!(len = payload.len(), "pong received"),
        }
    }
    Ok(())
}

impl PartialEq for WebSocket {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for WebSocket {}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("version", &self.inner.version)
            .field("path", &self.inner.path)
            .field("protocol", &self.inner.protocol)
            .field("closed", &self.is_closed())
            .finish()
    }
}
