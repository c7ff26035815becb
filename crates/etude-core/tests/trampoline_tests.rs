mod common;

use common::{TestServer, body, get, status};
use etude_core::{Context, EtudeError, Response, Socket};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Upstream that echoes whatever it receives, one connection at a time.
fn echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Upstream that accepts and then says nothing, holding connections open.
fn silent_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming() {
            match stream {
                Ok(s) => held.push(s),
                Err(_) => break,
            }
        }
    });
    addr
}

fn recv_exact(socket: &Socket, len: usize) -> io::Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    let mut got = 0;
    while got < len {
        match socket.recv(&mut out[got..])? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => got += n,
        }
    }
    Ok(out)
}

#[test]
fn test_spawned_task_talks_to_upstream() {
    let upstream = echo_upstream();
    let server = TestServer::start(|_ctx: &mut Context| Ok(Response::ok("ok")));
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    server.handle.spawn(move || {
        let result = Socket::connect(upstream, Some(Duration::from_secs(2))).and_then(|s| {
            s.send_all(b"over the wire")?;
            recv_exact(&s, 13)
        });
        let _ = tx.lock().send(result.map_err(|e| e.kind()));
    });

    let echoed = rx.recv_timeout(Duration::from_secs(3)).unwrap().unwrap();
    assert_eq!(echoed, b"over the wire");
}

#[test]
fn test_handler_proxies_through_cooperative_socket() {
    let upstream = echo_upstream();
    let server = TestServer::start(move |ctx: &mut Context| {
        let socket = Socket::connect(upstream, Some(Duration::from_secs(2)))?;
        let payload = ctx.request.path.as_bytes().to_vec();
        socket.send_all(&payload)?;
        let echoed = recv_exact(&socket, payload.len())?;
        Ok(Response::ok(echoed))
    });

    let res = get(server.addr, "/proxied/path");
    assert_eq!(status(&res), 200);
    assert_eq!(body(&res), "/proxied/path");
}

#[test]
fn test_recv_timeout_inside_handler() {
    let upstream = silent_upstream();
    let server = TestServer::start(move |_ctx: &mut Context| {
        let socket = Socket::connect(upstream, Some(Duration::from_secs(2)))?;
        socket.set_timeout(Some(Duration::from_millis(200)));
        let started = Instant::now();
        let mut buf = [0u8; 16];
        match socket.recv(&mut buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                let waited = started.elapsed() >= Duration::from_millis(200);
                Ok(Response::ok(if waited { "timed out" } else { "too early" }))
            }
            Err(e) => Err(EtudeError::Io(e)),
            Ok(_) => Ok(Response::ok("unexpected data")),
        }
    });

    assert_eq!(body(&get(server.addr, "/")), "timed out");
}

#[test]
fn test_waiting_handler_does_not_block_others() {
    let upstream = silent_upstream();
    let server = TestServer::start(move |ctx: &mut Context| {
        if ctx.request.path == "/slow" {
            let socket = Socket::connect(upstream, None)?;
            socket.set_timeout(Some(Duration::from_millis(800)));
            let mut buf = [0u8; 1];
            let _ = socket.recv(&mut buf);
            return Ok(Response::ok("slow"));
        }
        Ok(Response::ok("fast"))
    });

    let addr = server.addr;
    let slow = thread::spawn(move || get(addr, "/slow"));
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    assert_eq!(body(&get(addr, "/fast")), "fast");
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(body(&slow.join().unwrap()), "slow");
}

#[test]
fn test_close_wakes_pending_recv() {
    let upstream = silent_upstream();
    let server = TestServer::start(move |ctx: &mut Context| {
        let socket = Arc::new(Socket::connect(upstream, Some(Duration::from_secs(2)))?);
        socket.set_timeout(Some(Duration::from_secs(5)));
        let closer = socket.clone();
        ctx.handle
            .call_later(Duration::from_millis(100), move || closer.close());

        let started = Instant::now();
        let mut buf = [0u8; 8];
        let n = socket.recv(&mut buf)?;
        let quick = started.elapsed() < Duration::from_secs(2);
        Ok(Response::ok(format!("{n} {quick} {}", socket.is_closed())))
    });

    assert_eq!(body(&get(server.addr, "/")), "0 true true");
}

#[test]
fn test_task_accepts_on_cooperative_listener() {
    let server = TestServer::start(|_ctx: &mut Context| Ok(Response::ok("ok")));
    let listener = Socket::listen("127.0.0.1:0".parse().unwrap(), 8).unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    server.handle.spawn(move || {
        listener.set_timeout(Some(Duration::from_secs(3)));
        let greeting = listener.accept().and_then(|(conn, _)| {
            conn.send_all(b"welcome")?;
            Ok(conn)
        });
        let _ = tx.lock().send(greeting.is_ok());
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    let mut buf = [0u8; 7];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"welcome");
    assert!(rx.recv_timeout(Duration::from_secs(3)).unwrap());
}
