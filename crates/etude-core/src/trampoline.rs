// src/trampoline.rs
//! Cooperative blocking for non-blocking sockets.
//!
//! Inside a coroutine, an operation that would block parks the coroutine on
//! the descriptor's readiness and retries once woken. Outside of one (plain
//! threads, tests) the same calls fall back to `poll(2)`.

use crate::coroutine::{self, Outcome, Signal};
use crate::runtime::Handle;
use crate::syscalls::{self, Interest};
use parking_lot::Mutex;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "timed out")
}

fn bad_descriptor() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

/// Waits until `fd` is ready for `interest` or `timeout` elapses.
///
/// Fails with `TimedOut` on expiry and with `EBADF` when the descriptor is
/// closed by [`cancel_wait`] while waiting.
pub fn trampoline(fd: RawFd, interest: Interest, timeout: Option<Duration>) -> io::Result<()> {
    let (Some(key), Some(shared)) = (coroutine::current_key(), coroutine::current_shared()) else {
        return poll_blocking(fd, interest, timeout);
    };
    if shared.is_shutdown() {
        return Err(io::Error::other("server is shutting down"));
    }
    shared.begin_wait(key, fd, interest, timeout)?;
    match coroutine::park() {
        Signal::Wake(Outcome::Ready) => Ok(()),
        Signal::Wake(Outcome::TimedOut) => Err(timed_out()),
        Signal::Wake(Outcome::Cancelled) => Err(bad_descriptor()),
        Signal::Shutdown => Err(io::Error::other("server is shutting down")),
        _ => Err(io::Error::other("unexpected wake while waiting for readiness")),
    }
}

pub fn wait_read(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    trampoline(fd, Interest::READ, timeout)
}

pub fn wait_write(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    trampoline(fd, Interest::WRITE, timeout)
}

pub fn wait_readwrite(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    trampoline(fd, Interest::READ_WRITE, timeout)
}

/// Drops every pending readiness wait on `fd`. Waiters fail with `EBADF`.
///
/// Call before closing a descriptor other coroutines may be waiting on.
pub fn cancel_wait(fd: RawFd) -> usize {
    match Handle::current() {
        Some(handle) => handle.shared().cancel_wait(fd),
        None => 0,
    }
}

fn poll_blocking(fd: RawFd, interest: Interest, timeout: Option<Duration>) -> io::Result<()> {
    let mut events = 0;
    if interest.is_readable() {
        events |= libc::POLLIN;
    }
    if interest.is_writable() {
        events |= libc::POLLOUT;
    }
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let ms = match deadline {
            None => -1,
            Some(d) => d
                .saturating_duration_since(Instant::now())
                .as_millis()
                .min(libc::c_int::MAX as u128) as libc::c_int,
        };
        let mut pfd = libc::pollfd { fd, events, revents: 0 };
        let res = unsafe { libc::poll(&mut pfd, 1, ms) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if res == 0 {
            return Err(timed_out());
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(bad_descriptor());
        }
        return Ok(());
    }
}

/// A non-blocking TCP socket whose operations block only the calling
/// coroutine.
///
/// After [`close`](Self::close) every operation degrades quietly: reads
/// return `0`, writes return `0`.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
    owned: bool,
    closed: AtomicBool,
    timeout: Mutex<Option<Duration>>,
}

impl Socket {
    /// Takes ownership of a non-blocking descriptor.
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd,
            owned: true,
            closed: AtomicBool::new(false),
            timeout: Mutex::new(None),
        }
    }

    /// Wraps a descriptor owned by someone else. Dropping or closing it
    /// never closes the descriptor.
    pub(crate) fn borrowed(fd: RawFd) -> Self {
        Self {
            fd,
            owned: false,
            closed: AtomicBool::new(false),
            timeout: Mutex::new(None),
        }
    }

    pub(crate) fn to_owned_socket(&self) -> Socket {
        let socket = Socket::from_raw_fd(self.fd);
        *socket.timeout.lock() = *self.timeout.lock();
        socket
    }

    /// Connects to `addr`, waiting for completion up to the socket timeout.
    pub fn connect(addr: SocketAddr, timeout: Option<Duration>) -> io::Result<Socket> {
        let socket = Socket::from_raw_fd(syscalls::stream_socket(&addr)?);
        socket.set_timeout(timeout);
        match syscalls::connect(socket.fd, &addr) {
            Ok(()) => return Ok(socket),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }
        wait_write(socket.fd, timeout)?;
        match syscalls::take_socket_error(socket.fd)? {
            Some(err) => Err(err),
            None => Ok(socket),
        }
    }

    /// Binds a listening socket.
    pub fn listen(addr: SocketAddr, backlog: i32) -> io::Result<Socket> {
        Ok(Socket::from_raw_fd(syscalls::create_listen_socket(&addr, backlog)?))
    }

    /// Accepts one connection, waiting for it cooperatively.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let deadline = self.deadline();
        loop {
            self.check_open()?;
            match syscalls::accept_connection(self.fd)? {
                Some((fd, peer)) => return Ok((Socket::from_raw_fd(fd), peer)),
                None => self.wait(Interest::READ, deadline)?,
            }
        }
    }

    /// Receives into `buf`. `Ok(0)` means end of stream or a closed socket.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = self.deadline();
        loop {
            if self.is_closed() {
                return Ok(0);
            }
            match syscalls::recv(self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => return Ok(0),
                Err(e) => return Err(e),
            }
            match self.wait(Interest::READ, deadline) {
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => return Ok(0),
                other => other?,
            }
        }
    }

    /// Sends part of `buf`. `Ok(0)` on a closed socket.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let deadline = self.deadline();
        loop {
            if self.is_closed() {
                return Ok(0);
            }
            match syscalls::send(self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => return Ok(0),
                Err(e) => return Err(e),
            }
            match self.wait(Interest::WRITE, deadline) {
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => return Ok(0),
                other => other?,
            }
        }
    }

    /// Sends all of `buf`, failing with `WriteZero` if the socket closes
    /// part-way.
    pub fn send_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.send(buf)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket closed during send",
                    ));
                }
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    /// Shuts down one or both directions after dropping pending waits.
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        cancel_wait(self.fd);
        match syscalls::shutdown(self.fd, how) {
            Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
            other => other,
        }
    }

    /// Closes the socket. Coroutines waiting on it are woken and see a
    /// closed socket. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let waiters = cancel_wait(self.fd);
        if waiters > 0 {
            debug!(fd = self.fd, waiters, "closed socket with pending waits");
        }
        if self.owned {
            syscalls::close(self.fd);
        } else {
            let _ = syscalls::shutdown(self.fd, Shutdown::Both);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Per-operation timeout applied to every blocking call. `None` waits
    /// indefinitely.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        *self.timeout.lock() = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        *self.timeout.lock()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.check_open()?;
        syscalls::peer_addr(self.fd)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.check_open()?;
        syscalls::local_addr(self.fd)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    fn check_open(&self) -> io::Result<()> {
        if self.is_closed() {
            return Err(bad_descriptor());
        }
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout().map(|t| Instant::now() + t)
    }

    fn wait(&self, interest: Interest, deadline: Option<Instant>) -> io::Result<()> {
        let remaining = match deadline {
            None => None,
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(timed_out());
                }
                Some(left)
            }
        };
        trampoline(self.fd, interest, remaining)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.owned {
            self.close();
        }
    }
}
