// src/http.rs
use crate::continuation::Continuation;
use crate::error::EtudeResult;
use crate::runtime::Handle;
use crate::trampoline::Socket;
use std::net::SocketAddr;
use std::time::SystemTime;

pub const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"HTTP/1.0" => Some(Version::Http10),
            b"HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// An owned, fully-read HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Comma-separated tokens of a header, trimmed, across repeated headers.
    pub fn header_tokens<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.header_tokens(name).any(|t| t.eq_ignore_ascii_case(token))
    }

    /// Whether the client wants the connection kept open after this request.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.has_token("connection", "close"),
            Version::Http10 => self.has_token("connection", "keep-alive"),
        }
    }
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    reason: Option<&'static str>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            reason: None,
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::text(200, body)
    }

    pub fn text(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain")
            .with_body(body)
    }

    pub fn not_found() -> Self {
        Self::text(404, "Not Found")
    }

    pub fn bad_request() -> Self {
        Self::text(400, "Bad Request")
    }

    pub fn payload_too_large() -> Self {
        Self::text(413, "Payload Too Large")
    }

    pub fn internal_error() -> Self {
        Self::text(500, "Internal Server Error")
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Overrides the reason phrase of the status line.
    pub fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serializes the response. Informational (1xx) responses are written
    /// verbatim: no `Date`, `Content-Length` or `Connection` is added.
    pub fn write_to(&self, buf: &mut Vec<u8>, keep_alive: bool) {
        let reason = self.reason.unwrap_or_else(|| status_text(self.status));
        buf.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, reason).as_bytes());
        for (name, value) in &self.headers {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        if self.status >= 200 {
            if self.header("date").is_none() {
                let date = httpdate::fmt_http_date(SystemTime::now());
                buf.extend_from_slice(format!("Date: {date}\r\n").as_bytes());
            }
            buf.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
            if self.header("connection").is_none() {
                let conn = if keep_alive { "keep-alive" } else { "close" };
                buf.extend_from_slice(format!("Connection: {conn}\r\n").as_bytes());
            }
        }
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(&self.body);
    }

    pub fn to_bytes(&self, keep_alive: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + self.body.len());
        self.write_to(&mut buf, keep_alive);
        buf
    }
}

/// Everything a handler gets for one request.
pub struct Context {
    pub request: Request,
    /// Suspend/resume handle for the coroutine serving this request.
    pub continuation: Continuation,
    pub handle: Handle,
    socket: Socket,
    peer: SocketAddr,
    upgraded: bool,
}

impl Context {
    pub(crate) fn new(
        request: Request,
        continuation: Continuation,
        handle: Handle,
        socket: Socket,
        peer: SocketAddr,
    ) -> Self {
        Self {
            request,
            continuation,
            handle,
            socket,
            peer,
            upgraded: false,
        }
    }

    /// The connection's socket, borrowed: closing it shuts the connection
    /// down but leaves the descriptor to the server.
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Takes the connection over for another protocol.
    ///
    /// The returned socket owns the descriptor. Whatever the handler then
    /// returns is discarded and no HTTP response is written. Returns `None`
    /// if the connection was already taken.
    pub fn upgrade(&mut self) -> Option<Socket> {
        if self.upgraded {
            return None;
        }
        self.upgraded = true;
        Some(self.socket.to_owned_socket())
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }
}

/// Application entry point, called once per request inside the request's
/// coroutine.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: &mut Context) -> EtudeResult<Response>;
}

impl<F> Handler for F
where
    F: Fn(&mut Context) -> EtudeResult<Response> + Send + Sync + 'static,
{
    fn call(&self, ctx: &mut Context) -> EtudeResult<Response> {
        self(ctx)
    }
}
