// src/parser.rs
use crate::http::{MAX_HEADERS, Method, Request, Version};
use memchr::{memchr, memmem};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("request is incomplete")]
    Incomplete,
    #[error("malformed request")]
    InvalidFormat,
    #[error("request is too large")]
    TooLarge,
}

/// Legacy WebSocket handshakes carry an 8-byte challenge after the headers
/// without announcing it in `Content-Length`.
const LEGACY_CHALLENGE_LEN: usize = 8;

fn utf8(bytes: &[u8]) -> Result<&str, ParseError> {
    std::str::from_utf8(bytes).map_err(|_| ParseError::InvalidFormat)
}

/// Parses one HTTP/1.x request out of the front of `buf`.
///
/// Returns the request together with the number of bytes it occupied
/// (head plus body), so pipelined requests can be parsed from what is left.
pub fn parse_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let head_end = match memmem::find(buf, b"\r\n\r\n") {
        Some(idx) => idx,
        None => return Err(ParseError::Incomplete),
    };
    let head = &buf[..head_end];
    let mut lines = head.split(|&b| b == b'\n').map(|l| l.strip_suffix(b"\r").unwrap_or(l));

    // Request line: METHOD PATH HTTP/1.x
    let request_line = lines.next().ok_or(ParseError::InvalidFormat)?;
    let space1 = memchr(b' ', request_line).ok_or(ParseError::InvalidFormat)?;
    let rest = &request_line[space1 + 1..];
    let space2 = memchr(b' ', rest).ok_or(ParseError::InvalidFormat)?;

    let method = Method::from_bytes(&request_line[..space1]);
    let target = utf8(&rest[..space2])?;
    let version = Version::from_bytes(&rest[space2 + 1..]).ok_or(ParseError::InvalidFormat)?;
    if target.is_empty() {
        return Err(ParseError::InvalidFormat);
    }
    let (path, query) = match target.find('?') {
        Some(idx) => (&target[..idx], Some(&target[idx + 1..])),
        None => (target, None),
    };

    let mut headers = Vec::new();
    for line in lines {
        if headers.len() >= MAX_HEADERS {
            return Err(ParseError::TooLarge);
        }
        let colon = memchr(b':', line).ok_or(ParseError::InvalidFormat)?;
        let name = utf8(&line[..colon])?.trim();
        if name.is_empty() {
            return Err(ParseError::InvalidFormat);
        }
        let value = utf8(&line[colon + 1..])?.trim();
        headers.push((name.to_string(), value.to_string()));
    }

    let find = |wanted: &str| {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(wanted))
            .map(|(_, v)| v.as_str())
    };

    if find("transfer-encoding").is_some_and(|v| v.to_ascii_lowercase().contains("chunked")) {
        return Err(ParseError::InvalidFormat);
    }

    let body_len = match find("content-length") {
        Some(v) => v.parse::<usize>().map_err(|_| ParseError::InvalidFormat)?,
        None if find("sec-websocket-key1").is_some() && find("sec-websocket-key2").is_some() => {
            LEGACY_CHALLENGE_LEN
        }
        None => 0,
    };

    let body_start = head_end + 4;
    let total = body_start.checked_add(body_len).ok_or(ParseError::TooLarge)?;
    if buf.len() < total {
        return Err(ParseError::Incomplete);
    }

    Ok((
        Request {
            method,
            path: path.to_string(),
            query: query.map(str::to_string),
            version,
            headers,
            body: buf[body_start..total].to_vec(),
        },
        total,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    #[test]
    fn test_parse_basic_request() {
        let req = b"GET /some/path?foo=bar HTTP/1.1\r\nHost: localhost\r\nKeep-Alive: true\r\n\r\n";
        let (request, consumed) = parse_request(req).unwrap();

        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, "/some/path");
        assert_eq!(request.query.as_deref(), Some("foo=bar"));
        assert_eq!(request.version, Version::Http11);
        assert_eq!(request.headers.len(), 2);
        assert_eq!(request.header("host"), Some("localhost"));
        assert_eq!(request.header("Keep-Alive"), Some("true"));
        assert!(request.body.is_empty());
        assert_eq!(consumed, req.len());
    }

    #[test]
    fn test_parse_incomplete_request() {
        let req = b"GET /some/path?foo=bar HTT";
        assert_eq!(parse_request(req).unwrap_err(), ParseError::Incomplete);
    }

    #[test]
    fn test_body_and_pipelining() {
        let req = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET / HTTP/1.1\r\n\r\n";
        let (first, used) = parse_request(req).unwrap();
        assert_eq!(first.method, Method::Post);
        assert_eq!(first.body, b"hello");

        let (second, used2) = parse_request(&req[used..]).unwrap();
        assert_eq!(second.path, "/");
        assert_eq!(used + used2, req.len());
    }

    #[test]
    fn test_body_not_yet_arrived() {
        let req = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        assert_eq!(parse_request(req).unwrap_err(), ParseError::Incomplete);
    }

    #[test]
    fn test_legacy_websocket_challenge_is_body() {
        let req = b"GET /demo HTTP/1.1\r\nSec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\nSec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\n\r\n^n:ds[4U";
        let (request, used) = parse_request(req).unwrap();
        assert_eq!(request.body, b"^n:ds[4U");
        assert_eq!(used, req.len());
    }

    #[test]
    fn test_malformed_requests() {
        assert_eq!(
            parse_request(b"GARBAGE\r\n\r\n").unwrap_err(),
            ParseError::InvalidFormat
        );
        assert_eq!(
            parse_request(b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n").unwrap_err(),
            ParseError::InvalidFormat
        );
        assert_eq!(
            parse_request(b"GET / SPDY/3\r\n\r\n").unwrap_err(),
            ParseError::InvalidFormat
        );
        assert_eq!(
            parse_request(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap_err(),
            ParseError::InvalidFormat
        );
    }
}
