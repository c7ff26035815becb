mod common;

use common::{TestServer, body, get, status, wait_until};
use etude_core::{Args, Config, Context, Continuation, EtudeError, Response, UsageError};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Makes dropping `stream` reset the connection instead of closing it.
fn abort_on_drop(stream: &TcpStream) {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let res = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(res, 0);
}

#[test]
fn test_suspend_timeout_fails_request() {
    let server = TestServer::start(|ctx: &mut Context| {
        ctx.continuation.suspend(Some(Duration::from_secs(1)))?;
        Ok(Response::ok("never"))
    });

    let start = Instant::now();
    let res = get(server.addr, "/");
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(status(&res), 500);
}

#[test]
fn test_resume_from_another_request() {
    let waiting: Arc<Mutex<Option<Continuation>>> = Arc::new(Mutex::new(None));
    let w = waiting.clone();
    let server = TestServer::start(move |ctx: &mut Context| {
        if ctx.request.path == "/1" {
            *w.lock() = Some(ctx.continuation.clone());
            ctx.continuation.suspend(Some(Duration::from_secs(3)))?;
            return Ok(Response::ok("RESUMED"));
        }
        if let Some(c) = w.lock().take() {
            c.resume(Args::new())?;
        }
        Ok(Response::ok("Hello world!"))
    });

    let addr = server.addr;
    let first = thread::spawn(move || get(addr, "/1"));
    assert!(wait_until(Duration::from_secs(2), || {
        waiting.lock().as_ref().is_some_and(|c| c.is_suspended())
    }));

    let start = Instant::now();
    let second = get(addr, "/2");
    let first = first.join().unwrap();

    assert_eq!(status(&first), 200);
    assert_eq!(body(&first), "RESUMED");
    assert_eq!(status(&second), 200);
    assert_eq!(body(&second), "Hello world!");
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_resume_values_reach_the_suspended_side() {
    let waiting: Arc<Mutex<Option<Continuation>>> = Arc::new(Mutex::new(None));
    let w = waiting.clone();
    let server = TestServer::start(move |ctx: &mut Context| match ctx.request.path.as_str() {
        "/wait" => {
            *w.lock() = Some(ctx.continuation.clone());
            let args = ctx.continuation.suspend(Some(Duration::from_secs(5)))?;
            let greeting = args.get(0).and_then(|v| v.as_str()).unwrap_or("?").to_string();
            let name = args.kw("name").and_then(|v| v.as_str()).unwrap_or("?").to_string();
            Ok(Response::ok(format!("{greeting} {name}")))
        }
        _ => {
            let c = w.lock().take().ok_or(EtudeError::Config("nobody waiting".into()))?;
            c.resume(Args::new().arg("hello").kwarg("name", "etude"))?;
            Ok(Response::ok("sent"))
        }
    });

    let addr = server.addr;
    let waiter = thread::spawn(move || get(addr, "/wait"));
    assert!(wait_until(Duration::from_secs(2), || {
        waiting.lock().as_ref().is_some_and(|c| c.is_suspended())
    }));
    assert_eq!(body(&get(addr, "/wake")), "sent");
    assert_eq!(body(&waiter.join().unwrap()), "hello etude");
}

#[test]
fn test_suspend_on_timed_out_continuation_fails_both() {
    let stored: Arc<Mutex<Option<Continuation>>> = Arc::new(Mutex::new(None));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let (s, e) = (stored.clone(), errors.clone());
    let server = TestServer::start(move |ctx: &mut Context| {
        let previous = s.lock().take();
        let target = match previous {
            Some(c) => c,
            None => {
                *s.lock() = Some(ctx.continuation.clone());
                ctx.continuation.clone()
            }
        };
        match target.suspend(Some(Duration::from_secs(1))) {
            Ok(_) => Ok(Response::ok("resumed")),
            Err(err) => {
                e.lock().push(err.to_string());
                Err(err)
            }
        }
    });

    let first = get(server.addr, "/");
    let second = get(server.addr, "/");
    assert_eq!(status(&first), 500);
    assert_eq!(status(&second), 500);

    let errors = errors.lock();
    assert_eq!(errors[0], EtudeError::Timeout.to_string());
    assert_eq!(errors[1], EtudeError::Usage(UsageError::Finished).to_string());
}

#[test]
fn test_double_suspend_from_another_coroutine_fails() {
    let waiting: Arc<Mutex<Option<Continuation>>> = Arc::new(Mutex::new(None));
    let w = waiting.clone();
    let server = TestServer::start(move |ctx: &mut Context| {
        if ctx.request.path == "/first" {
            *w.lock() = Some(ctx.continuation.clone());
            ctx.continuation.suspend(Some(Duration::from_secs(1)))?;
            return Ok(Response::ok("resumed"));
        }
        let other = w.lock().clone();
        match other.map(|c| c.suspend(None)) {
            Some(Err(EtudeError::Usage(UsageError::AlreadySuspended))) => {
                Ok(Response::ok("already suspended"))
            }
            _ => Ok(Response::ok("unexpected")),
        }
    });

    let addr = server.addr;
    let first = thread::spawn(move || get(addr, "/first"));
    assert!(wait_until(Duration::from_secs(2), || {
        waiting.lock().as_ref().is_some_and(|c| c.is_suspended())
    }));
    assert_eq!(body(&get(addr, "/second")), "already suspended");
    // The failed suspend left the first request parked until its timeout.
    assert_eq!(status(&first.join().unwrap()), 500);
}

#[test]
fn test_illegal_resume_fails_request() {
    let server = TestServer::start(|ctx: &mut Context| {
        ctx.continuation.resume(Args::new())?;
        Ok(Response::ok("unreachable"))
    });
    assert_eq!(status(&get(server.addr, "/")), 500);
}

#[test]
fn test_ten_suspended_requests_woken_once_each() {
    let waiting: Arc<Mutex<Vec<Continuation>>> = Arc::new(Mutex::new(Vec::new()));
    let w = waiting.clone();
    let server = TestServer::start(move |ctx: &mut Context| {
        if ctx.request.path == "/wakeup" {
            let all: Vec<_> = w.lock().drain(..).collect();
            for c in all {
                c.resume(Args::new())?;
            }
            return Ok(Response::ok("/wakeup"));
        }
        w.lock().push(ctx.continuation.clone());
        ctx.continuation.suspend(None)?;
        Ok(Response::ok(ctx.request.path.clone()))
    });

    let addr = server.addr;
    let clients: Vec<_> = (0..10)
        .map(|i| thread::spawn(move || get(addr, &format!("/{i}"))))
        .collect();
    assert!(wait_until(Duration::from_secs(5), || {
        let w = waiting.lock();
        w.len() == 10 && w.iter().all(|c| c.is_suspended())
    }));

    let mut bodies = BTreeSet::new();
    bodies.insert(body(&get(addr, "/wakeup")).to_string());
    for client in clients {
        let res = client.join().unwrap();
        assert_eq!(status(&res), 200);
        bodies.insert(body(&res).to_string());
    }

    let mut expected: BTreeSet<String> = (0..10).map(|i| format!("/{i}")).collect();
    expected.insert("/wakeup".into());
    assert_eq!(bodies, expected);
}

#[test]
fn test_resume_from_deferred_call() {
    let server = TestServer::start(|ctx: &mut Context| {
        let c = ctx.continuation.clone();
        ctx.handle.schedule_call(
            Duration::from_millis(100),
            move |args| {
                let _ = c.resume(args);
            },
            Args::new().arg("from timer"),
        );
        let args = ctx.continuation.suspend(Some(Duration::from_secs(5)))?;
        Ok(Response::ok(args.get(0).and_then(|v| v.as_str()).unwrap_or("").to_string()))
    });
    assert_eq!(body(&get(server.addr, "/")), "from timer");
}

#[test]
fn test_suspended_request_notices_peer_hangup() {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let config = Config {
        liveness_probe_secs: 1,
        ..Config::default()
    };
    let server = TestServer::start_with(config, move |ctx: &mut Context| {
        let result = ctx.continuation.suspend(None);
        let _ = tx.lock().send(matches!(result, Err(EtudeError::ConnectionLost)));
        result.map(|_| Response::ok("resumed"))
    });

    {
        use std::io::Write;
        let mut stream = TcpStream::connect(server.addr).unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        thread::sleep(Duration::from_millis(200));
        abort_on_drop(&stream);
    }

    let lost = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(lost);
}

#[test]
fn test_half_closed_client_stays_suspended_until_resumed() {
    let waiting: Arc<Mutex<Option<Continuation>>> = Arc::new(Mutex::new(None));
    let w = waiting.clone();
    let config = Config {
        liveness_probe_secs: 1,
        ..Config::default()
    };
    let server = TestServer::start_with(config, move |ctx: &mut Context| {
        if ctx.request.path == "/1" {
            *w.lock() = Some(ctx.continuation.clone());
            ctx.continuation.suspend(None)?;
            return Ok(Response::ok("RESUMED"));
        }
        if let Some(c) = w.lock().take() {
            c.resume(Args::new())?;
        }
        Ok(Response::ok("Hello world!"))
    });

    let addr = server.addr;
    let first = thread::spawn(move || {
        use std::io::{Read, Write};
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream
            .write_all(b"GET /1 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();
        let mut res = String::new();
        let _ = stream.read_to_string(&mut res);
        res
    });
    assert!(wait_until(Duration::from_secs(2), || {
        waiting.lock().as_ref().is_some_and(|c| c.is_suspended())
    }));

    // Several probe intervals pass with only a FIN from the client.
    thread::sleep(Duration::from_millis(2500));
    let second = get(addr, "/2");
    let first = first.join().unwrap();

    assert_eq!(status(&first), 200);
    assert_eq!(body(&first), "RESUMED");
    assert_eq!(status(&second), 200);
    assert_eq!(body(&second), "Hello world!");
}

#[test]
fn test_shutdown_wakes_suspended_handlers() {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let mut server = TestServer::start(move |ctx: &mut Context| {
        let result = ctx.continuation.suspend(None);
        let _ = tx.lock().send(matches!(result, Err(EtudeError::Shutdown)));
        result.map(|_| Response::ok("resumed"))
    });

    let addr = server.addr;
    let _client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        use std::io::{Read, Write};
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
    });
    thread::sleep(Duration::from_millis(200));
    server.stop();
    assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
}
