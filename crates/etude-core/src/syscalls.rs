// src/syscalls.rs
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

#[cfg(target_os = "linux")]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: c_int = 0;

// ---- Address conversion ----

fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    // SAFETY: sockaddr_storage is plain old data and large enough for either family.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(a.ip().octets()),
            };
            #[cfg(target_os = "macos")]
            {
                sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: a.ip().octets(),
            };
            sin6.sin6_scope_id = a.scope_id();
            #[cfg(target_os = "macos")]
            {
                sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

fn from_sockaddr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unsupported address family",
        )),
    }
}

// ---- Socket Operations ----

fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_flag(fd: c_int, level: c_int, name: c_int) -> io::Result<()> {
    let one: c_int = 1;
    let res = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create a non-blocking TCP socket for the address family of `addr`.
pub fn stream_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    #[cfg(target_os = "linux")]
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0) };
    #[cfg(not(target_os = "linux"))]
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };

    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    #[cfg(not(target_os = "linux"))]
    {
        if let Err(e) = set_nonblocking(fd).and_then(|_| set_flag(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE)) {
            close(fd);
            return Err(e);
        }
    }
    Ok(fd)
}

/// Create a non-blocking listening socket bound to `addr`.
pub fn create_listen_socket(addr: &SocketAddr, backlog: i32) -> io::Result<RawFd> {
    let fd = stream_socket(addr)?;
    let setup = || -> io::Result<()> {
        set_flag(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR)?;
        let (storage, len) = to_sockaddr(addr);
        unsafe {
            if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::listen(fd, backlog) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    };
    if let Err(e) = setup() {
        close(fd);
        return Err(e);
    }
    Ok(fd)
}

/// Accept a non-blocking connection. `Ok(None)` when the backlog is empty.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    #[cfg(target_os = "linux")]
    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    #[cfg(not(target_os = "linux"))]
    let fd = unsafe { libc::accept(listen_fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };

    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => Ok(None),
            _ => Err(err),
        };
    }

    #[cfg(not(target_os = "linux"))]
    {
        // macOS lacks accept4 and MSG_NOSIGNAL
        if let Err(e) = set_nonblocking(fd).and_then(|_| set_flag(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE)) {
            close(fd);
            return Err(e);
        }
    }

    let _ = set_flag(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY);
    let _ = set_flag(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE);
    let peer = from_sockaddr(&storage).unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    Ok(Some((fd, peer)))
}

/// Start a connect. `EINPROGRESS` is reported as an error for the caller to wait on.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = to_sockaddr(addr);
    let res = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Pending error on the socket (`SO_ERROR`), cleared by reading it.
pub fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut err: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    let res = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut c_void,
            &mut len,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((err != 0).then(|| io::Error::from_raw_os_error(err)))
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    if unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    from_sockaddr(&storage)
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    if unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    from_sockaddr(&storage)
}

/// Raw `recv`. `WouldBlock` is passed through so callers can tell it from EOF.
pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

/// Raw `send` without SIGPIPE.
pub fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let res = unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), SEND_FLAGS) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

/// True when the connection has failed: a pending socket error, or a
/// zero-length send the kernel refuses. A peer that only half-closed its
/// write side is still reachable and is not reported.
pub fn peer_failed(fd: RawFd) -> bool {
    match take_socket_error(fd) {
        Ok(None) => {}
        Ok(Some(_)) | Err(_) => return true,
    }
    let res = unsafe { libc::send(fd, ptr::null(), 0, SEND_FLAGS) };
    if res < 0 {
        let err = io::Error::last_os_error();
        return !matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        );
    }
    false
}

pub fn shutdown(fd: RawFd, how: std::net::Shutdown) -> io::Result<()> {
    let how = match how {
        std::net::Shutdown::Read => libc::SHUT_RD,
        std::net::Shutdown::Write => libc::SHUT_WR,
        std::net::Shutdown::Both => libc::SHUT_RDWR,
    };
    if unsafe { libc::shutdown(fd, how) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Readiness polling ----

/// Readiness a waiter is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    read: bool,
    write: bool,
}

impl Interest {
    pub const READ: Interest = Interest { read: true, write: false };
    pub const WRITE: Interest = Interest { read: false, write: true };
    pub const READ_WRITE: Interest = Interest { read: true, write: true };

    pub fn is_readable(self) -> bool {
        self.read
    }

    pub fn is_writable(self) -> bool {
        self.write
    }

    pub fn union(self, other: Interest) -> Interest {
        Interest {
            read: self.read || other.read,
            write: self.write || other.write,
        }
    }

    /// Whether an event with the given readiness satisfies this interest.
    pub fn matches(self, readable: bool, writable: bool) -> bool {
        (self.read && readable) || (self.write && writable)
    }
}

/// One readiness notification. Errors and hang-ups report both directions
/// ready so the waiter retries its operation and observes the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
}

fn timeout_ms(timeout: Option<Duration>) -> c_int {
    match timeout {
        None => -1,
        // round up so a 0.4ms deadline does not spin
        Some(d) => d.as_nanos().div_ceil(1_000_000).min(c_int::MAX as u128) as c_int,
    }
}

// ---- Cross-thread wake-up ----

/// Self-pipe whose read end is registered with the [`Poller`], so a write
/// from any thread ends a blocked `wait`.
#[derive(Debug)]
pub struct Waker {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let waker = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        for fd in fds {
            set_nonblocking(fd)?;
            if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(waker)
    }

    /// The descriptor to register for read readiness.
    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn wake(&self) -> io::Result<()> {
        let byte = 1u8;
        let res = unsafe { libc::write(self.write_fd, &byte as *const u8 as *const c_void, 1) };
        if res < 0 {
            let err = io::Error::last_os_error();
            // A full pipe already has a wake-up pending.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Empties the pipe so the read end stops reporting ready.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let res = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if res > 0 {
                continue;
            }
            if res < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break;
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        close(self.read_fd);
        close(self.write_fd);
    }
}

const MAX_EVENTS: usize = 256;

#[cfg(target_os = "linux")]
pub use linux_poller::Poller;

#[cfg(target_os = "linux")]
mod linux_poller {
    use super::*;
    use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_event};

    /// Level-triggered epoll instance.
    #[derive(Debug)]
    pub struct Poller {
        fd: c_int,
    }

    fn mask(interest: Interest) -> u32 {
        let mut events = 0;
        if interest.is_readable() {
            events |= EPOLLIN | EPOLLRDHUP;
        }
        if interest.is_writable() {
            events |= EPOLLOUT;
        }
        events as u32
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }

        fn ctl(&self, op: c_int, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            let mut event = epoll_event {
                events: mask(interest),
                u64: token,
            };
            if unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Register `fd`, or update it if it is already registered.
        pub fn register(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            match self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest) {
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
                }
                other => other,
            }
        }

        pub fn reregister(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            match self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest) {
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                    self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
                }
                other => other,
            }
        }

        pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
            if unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) } < 0 {
                let err = io::Error::last_os_error();
                if !matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) {
                    return Err(err);
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
            let mut raw = [epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
            let res = unsafe {
                libc::epoll_wait(self.fd, raw.as_mut_ptr(), MAX_EVENTS as c_int, timeout_ms(timeout))
            };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(0);
                }
                return Err(err);
            }
            let n = res as usize;
            for ev in &raw[..n] {
                let bits = ev.events as c_int;
                let failed = bits & (EPOLLERR | EPOLLHUP) != 0;
                events.push(Event {
                    token: ev.u64,
                    readable: failed || bits & (EPOLLIN | EPOLLRDHUP) != 0,
                    writable: failed || bits & EPOLLOUT != 0,
                });
            }
            Ok(n)
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            close(self.fd);
        }
    }
}

// ---- Kqueue for macOS development ----
#[cfg(target_os = "macos")]
pub use macos_poller::Poller;

#[cfg(target_os = "macos")]
mod macos_poller {
    use super::*;
    use libc::{EV_ADD, EV_DELETE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_WRITE, kevent, timespec};

    /// Level-triggered kqueue instance (no EV_CLEAR).
    #[derive(Debug)]
    pub struct Poller {
        fd: c_int,
    }

    fn change(fd: RawFd, filter: i16, flags: u16, token: u64) -> kevent {
        kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: token as *mut c_void,
        }
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            let fd = unsafe { libc::kqueue() };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }

        fn apply(&self, changes: &[kevent]) -> io::Result<()> {
            let res = unsafe {
                libc::kevent(self.fd, changes.as_ptr(), changes.len() as c_int, ptr::null_mut(), 0, ptr::null())
            };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn register(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            self.reregister(fd, token, interest)
        }

        pub fn reregister(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            self.deregister(fd)?;
            let mut changes = Vec::with_capacity(2);
            if interest.is_readable() {
                changes.push(change(fd, EVFILT_READ, EV_ADD, token));
            }
            if interest.is_writable() {
                changes.push(change(fd, EVFILT_WRITE, EV_ADD, token));
            }
            self.apply(&changes)
        }

        pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
            // Deleting a filter that was never added fails with ENOENT; apply one at a time.
            for filter in [EVFILT_READ, EVFILT_WRITE] {
                let _ = self.apply(&[change(fd, filter, EV_DELETE, 0)]);
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
            let mut raw = [unsafe { mem::zeroed::<kevent>() }; MAX_EVENTS];
            let ts = timeout.map(|d| timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            });
            let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const timespec);
            let res = unsafe {
                libc::kevent(self.fd, ptr::null(), 0, raw.as_mut_ptr(), MAX_EVENTS as c_int, ts_ptr)
            };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(0);
                }
                return Err(err);
            }
            let n = res as usize;
            for ev in &raw[..n] {
                let failed = ev.flags & (EV_EOF | EV_ERROR) != 0;
                events.push(Event {
                    token: ev.udata as u64,
                    readable: failed || ev.filter == EVFILT_READ,
                    writable: failed || ev.filter == EVFILT_WRITE,
                });
            }
            Ok(n)
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;

    #[test]
    fn test_listen_accept_and_poll() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listen_fd = create_listen_socket(&addr, 16).unwrap();
        let bound = local_addr(listen_fd).unwrap();
        assert_ne!(bound.port(), 0);

        let poller = Poller::new().unwrap();
        poller.register(listen_fd, 7, Interest::READ).unwrap();

        let mut client = TcpStream::connect(bound).unwrap();
        let mut events = Vec::new();
        poller.wait(&mut events, Some(Duration::from_secs(2))).unwrap();
        assert!(events.iter().any(|e| e.token == 7 && e.readable));

        let (fd, peer) = accept_connection(listen_fd).unwrap().expect("pending connection");
        assert_eq!(peer, client.local_addr().unwrap());

        let mut buf = [0u8; 16];
        let err = recv(fd, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(!peer_failed(fd));

        client.write_all(b"ping").unwrap();
        poller.register(fd, 8, Interest::READ).unwrap();
        events.clear();
        poller.wait(&mut events, Some(Duration::from_secs(2))).unwrap();
        assert!(events.iter().any(|e| e.token == 8 && e.readable));
        assert_eq!(recv(fd, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");

        // A FIN alone leaves the connection writable.
        drop(client);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!peer_failed(fd));

        // Writing to the closed peer draws a reset.
        assert_eq!(send(fd, b"late").unwrap(), 4);
        std::thread::sleep(Duration::from_millis(20));
        assert!(peer_failed(fd));

        poller.deregister(fd).unwrap();
        close(fd);
        close(listen_fd);
    }

    #[test]
    fn test_empty_backlog_is_none() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listen_fd = create_listen_socket(&addr, 16).unwrap();
        assert!(accept_connection(listen_fd).unwrap().is_none());
        close(listen_fd);
    }

    #[test]
    fn test_waker_interrupts_wait() {
        let poller = Poller::new().unwrap();
        let waker = Waker::new().unwrap();
        poller.register(waker.fd(), 3, Interest::READ).unwrap();

        let mut events = Vec::new();
        poller.wait(&mut events, Some(Duration::from_millis(10))).unwrap();
        assert!(events.is_empty());

        let remote = std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(50));
                waker.wake().unwrap();
                waker.wake().unwrap();
            });
            let started = std::time::Instant::now();
            poller.wait(&mut events, Some(Duration::from_secs(5))).unwrap();
            started.elapsed()
        });
        assert!(remote < Duration::from_secs(2));
        assert!(events.iter().any(|e| e.token == 3 && e.readable));

        waker.drain();
        events.clear();
        poller.wait(&mut events, Some(Duration::from_millis(10))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_interest_matching() {
        assert!(Interest::READ.matches(true, false));
        assert!(!Interest::READ.matches(false, true));
        assert_eq!(Interest::READ.union(Interest::WRITE), Interest::READ_WRITE);
    }
}
