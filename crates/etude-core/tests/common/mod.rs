#![allow(dead_code)]

use etude_core::{Config, Context, EtudeResult, Handle, Handler, Response, Server};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const SERVER_THREAD: &str = "etude-test-server";

/// A server running on its own thread, stopped on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&mut Context) -> EtudeResult<Response> + Send + Sync + 'static,
    {
        Self::serve(Config::default(), handler)
    }

    pub fn start_with<F>(config: Config, handler: F) -> Self
    where
        F: Fn(&mut Context) -> EtudeResult<Response> + Send + Sync + 'static,
    {
        Self::serve(config, handler)
    }

    pub fn serve<H: Handler>(config: Config, handler: H) -> Self {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 0,
            ..config
        };
        let server = Server::from_config(&config).expect("bind test server");
        let addr = server.local_addr();
        let handle = server.handle();
        let thread = thread::Builder::new()
            .name(SERVER_THREAD.into())
            .spawn(move || server.run(handler).expect("server loop"))
            .unwrap();
        Self {
            addr,
            handle,
            thread: Some(thread),
        }
    }

    /// Shuts the server down and waits for its loop to exit.
    pub fn stop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// One-shot `GET` with `Connection: close`; returns the raw response.
pub fn get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    write!(
        stream,
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
    )
    .unwrap();
    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    res
}

pub fn status(res: &str) -> u16 {
    res.split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

pub fn body(res: &str) -> &str {
    res.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

/// Reads exactly one `Content-Length` framed response off a kept-alive stream.
pub fn read_response(reader: &mut BufReader<&TcpStream>) -> (u16, String) {
    let mut status_line = String::new();
    reader.read_line(&mut status_line).unwrap();
    let mut length = 0;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        if line == "\r\n" || line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                length = value.trim().parse().unwrap();
            }
        }
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).unwrap();
    (status(&status_line), String::from_utf8(body).unwrap())
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
