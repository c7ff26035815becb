// src/conn.rs
use crate::coroutine::Coroutine;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ConnState {
    /// Waiting for (the rest of) a request; the scheduler owns the socket.
    #[default]
    Reading,
    /// A request is being served; the coroutine owns the socket.
    Handling,
}

/// One accepted connection.
pub(crate) struct Client {
    pub(crate) fd: RawFd,
    pub(crate) peer: SocketAddr,
    pub(crate) state: ConnState,
    pub(crate) read_buf: Vec<u8>,
    pub(crate) last_active: Instant,
    pub(crate) requests_served: u32,
    /// The peer shut down its write side; close once buffered requests are served.
    pub(crate) eof: bool,
    /// Created on the first complete request, reused across keep-alive.
    pub(crate) coroutine: Option<Coroutine>,
}

impl Client {
    pub(crate) fn new(fd: RawFd, peer: SocketAddr) -> Self {
        Self {
            fd,
            peer,
            state: ConnState::Reading,
            read_buf: Vec::new(),
            last_active: Instant::now(),
            requests_served: 0,
            eof: false,
            coroutine: None,
        }
    }
}

/// A detached coroutine created through `Handle::spawn`.
pub(crate) struct Task {
    pub(crate) coroutine: Option<Coroutine>,
}

/// Anything the scheduler can wake.
pub(crate) enum Unit {
    Client(Client),
    Task(Task),
}

impl Unit {
    pub(crate) fn coroutine_mut(&mut self) -> Option<&mut Coroutine> {
        match self {
            Unit::Client(c) => c.coroutine.as_mut(),
            Unit::Task(t) => t.coroutine.as_mut(),
        }
    }

    pub(crate) fn set_coroutine(&mut self, coroutine: Coroutine) {
        match self {
            Unit::Client(c) => c.coroutine = Some(coroutine),
            Unit::Task(t) => t.coroutine = Some(coroutine),
        }
    }

    pub(crate) fn take_coroutine(&mut self) -> Option<Coroutine> {
        match self {
            Unit::Client(c) => c.coroutine.take(),
            Unit::Task(t) => t.coroutine.take(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_starts_reading() {
        let client = Client::new(3, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(client.state, ConnState::Reading);
        assert!(client.read_buf.is_empty());
        assert!(client.coroutine.is_none());

        let mut unit = Unit::Client(client);
        assert!(unit.coroutine_mut().is_none());
        assert!(unit.take_coroutine().is_none());
    }
}
