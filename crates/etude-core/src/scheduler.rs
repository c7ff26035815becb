// src/scheduler.rs
use crate::conn::{Client, ConnState, Task, Unit};
use crate::continuation::Continuation;
use crate::coroutine::{self, Coroutine, Done, Job, Signal, Yielded};
use crate::error::{EtudeError, EtudeResult};
use crate::http::{Context, Handler, Response};
use crate::parser::{self, ParseError};
use crate::runtime::{self, Handle, Ready, Shared, WAKE_TOKEN};
use crate::slab::{Key, Slab};
use crate::syscalls::{self, Event, Interest};
use crate::trampoline::Socket;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, debug_span, error, info, warn};

const LISTENER: u64 = u64::MAX;
const DEFAULT_IDLE: Duration = Duration::from_secs(30);
const PRUNE_EVERY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub(crate) struct Limits {
    pub(crate) read_buffer_size: usize,
    pub(crate) max_request_size: usize,
    pub(crate) keep_alive: Option<Duration>,
    pub(crate) poll_interval: Duration,
}

/// The single scheduler loop: reactor events, deferred calls and coroutine
/// wake-ups all run from here, one at a time.
pub(crate) struct Scheduler<H: Handler> {
    shared: Arc<Shared>,
    handler: Arc<H>,
    listen_fd: RawFd,
    units: Slab<Unit>,
    by_fd: HashMap<RawFd, Key>,
    pipelined: VecDeque<Key>,
    limits: Limits,
}

impl<H: Handler> Scheduler<H> {
    pub(crate) fn new(
        shared: Arc<Shared>,
        handler: Arc<H>,
        listen_fd: RawFd,
        max_units: usize,
        limits: Limits,
    ) -> Self {
        Self {
            shared,
            handler,
            listen_fd,
            units: Slab::new(max_units),
            by_fd: HashMap::new(),
            pipelined: VecDeque::new(),
            limits,
        }
    }

    pub(crate) fn run(mut self) -> EtudeResult<()> {
        self.shared
            .poller
            .register(self.listen_fd, LISTENER, Interest::READ)?;
        runtime::enter_hub(&self.shared);
        debug!(listen_fd = self.listen_fd, "scheduler entering main event loop");

        let result = self.event_loop();
        if let Err(e) = &result {
            error!("scheduler loop failed: {e}");
        }
        self.teardown();
        runtime::leave_hub();
        result
    }

    fn event_loop(&mut self) -> EtudeResult<()> {
        let mut events = Vec::with_capacity(256);
        let mut last_prune = Instant::now();

        while !self.shared.is_shutdown() {
            self.fire_timers();
            self.run_ready();
            if self.shared.is_shutdown() {
                break;
            }

            events.clear();
            let timeout = self.poll_timeout();
            self.shared.poller.wait(&mut events, Some(timeout))?;

            for event in &events {
                if self.shared.is_shutdown() {
                    break;
                }
                self.dispatch(*event);
                self.run_ready();
            }

            if last_prune.elapsed() >= PRUNE_EVERY {
                self.prune_idle();
                last_prune = Instant::now();
            }
        }
        Ok(())
    }

    fn poll_timeout(&mut self) -> Duration {
        let busy = !self.pipelined.is_empty()
            || !self.shared.ready.lock().is_empty()
            || !self.shared.spawns.lock().is_empty();
        if busy {
            return Duration::ZERO;
        }
        let cap = self.limits.poll_interval;
        match self.shared.timers.lock().next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(cap),
            None => cap,
        }
    }

    /// Runs the deferred calls that were due when the turn started.
    fn fire_timers(&mut self) {
        let due = self.shared.timers.lock().take_due(Instant::now());
        for call in due {
            if self.shared.is_shutdown() {
                break;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| call.fire())) {
                error!("deferred call panicked: {}", coroutine::panic_message(&payload));
            }
            self.run_ready();
        }
    }

    /// Drives every runnable coroutine until nothing is runnable.
    fn run_ready(&mut self) {
        loop {
            self.start_spawned();
            let next = self.shared.ready.lock().pop_front();
            if let Some(Ready { key, outcome }) = next {
                debug!(unit = key.index(), ?outcome, "wake");
                self.drive(key, Signal::Wake(outcome));
                continue;
            }
            match self.pipelined.pop_front() {
                Some(key) => self.try_dispatch(key),
                None => break,
            }
        }
    }

    fn start_spawned(&mut self) {
        let tasks = std::mem::take(&mut *self.shared.spawns.lock());
        for task in tasks {
            let Some(key) = self.units.insert(Unit::Task(Task { coroutine: None })) else {
                warn!("unit table full, dropping spawned task");
                continue;
            };
            let spawned = Coroutine::spawn(
                key,
                self.shared.clone(),
                self.shared.settings.stack_size,
                move |_| {
                    task();
                    Done::Close
                },
            );
            match spawned {
                Ok(co) => {
                    if let Some(unit) = self.units.get_mut(key) {
                        unit.set_coroutine(co);
                    }
                    debug!(unit = key.index(), "task spawned");
                    self.drive(key, Signal::Start);
                }
                Err(e) => {
                    error!("failed to start task coroutine: {e}");
                    self.units.remove(key);
                }
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        if event.token == LISTENER {
            self.accept_all();
            return;
        }
        if event.token == WAKE_TOKEN {
            self.shared.take_wakeup();
            return;
        }
        let fd = event.token as RawFd;
        if self.shared.wake_io(fd, event.readable, event.writable) {
            return;
        }
        match self.by_fd.get(&fd).copied() {
            Some(key) if self.is_reading(key) => self.on_readable(key),
            _ => {
                // Readiness nobody asked for (a stale registration); stop it
                // from firing again.
                let _ = self.shared.poller.deregister(fd);
            }
        }
    }

    fn is_reading(&self, key: Key) -> bool {
        matches!(self.units.get(key), Some(Unit::Client(c)) if c.state == ConnState::Reading)
    }

    fn accept_all(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => self.add_client(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, peer: SocketAddr) {
        let Some(key) = self.units.insert(Unit::Client(Client::new(fd, peer))) else {
            // Out of capacity - backpressure
            warn!(%peer, "connection table full, refusing connection");
            syscalls::close(fd);
            return;
        };
        if let Err(e) = self.shared.poller.register(fd, fd as u64, Interest::READ) {
            warn!("failed to register client socket: {e}");
            self.units.remove(key);
            syscalls::close(fd);
            return;
        }
        self.by_fd.insert(fd, key);
        debug!(unit = key.index(), fd, %peer, "accepted");
    }

    fn on_readable(&mut self, key: Key) {
        let chunk = self.limits.read_buffer_size.max(1);
        let max = self.limits.max_request_size;
        let Some(Unit::Client(client)) = self.units.get_mut(key) else {
            return;
        };

        loop {
            let start = client.read_buf.len();
            client.read_buf.resize(start + chunk, 0);
            match syscalls::recv(client.fd, &mut client.read_buf[start..]) {
                Ok(0) => {
                    client.read_buf.truncate(start);
                    client.eof = true;
                    break;
                }
                Ok(n) => {
                    client.read_buf.truncate(start + n);
                    if n < chunk || client.read_buf.len() > max {
                        break;
                    }
                }
                Err(e) => {
                    client.read_buf.truncate(start);
                    match e.kind() {
                        io::ErrorKind::WouldBlock => break,
                        io::ErrorKind::Interrupted => continue,
                        _ => {
                            debug!(unit = key.index(), "read failed: {e}");
                            client.eof = true;
                            client.read_buf.clear();
                            break;
                        }
                    }
                }
            }
        }
        client.last_active = Instant::now();
        if client.eof {
            // No more readiness wanted from a half-closed peer.
            let _ = self.shared.poller.deregister(client.fd);
        }
        self.try_dispatch(key);
    }

    /// Hands the next complete buffered request to the client's coroutine.
    fn try_dispatch(&mut self, key: Key) {
        let max = self.limits.max_request_size;
        let Some(Unit::Client(client)) = self.units.get_mut(key) else {
            return;
        };
        if client.state != ConnState::Reading {
            return;
        }

        let request = match parser::parse_request(&client.read_buf) {
            Ok((request, used)) => {
                client.read_buf.drain(..used);
                request
            }
            Err(ParseError::Incomplete) if client.read_buf.len() > max => {
                return self.reject(key, Response::payload_too_large());
            }
            Err(ParseError::Incomplete) => {
                if client.eof {
                    self.close_client(key);
                }
                return;
            }
            Err(ParseError::TooLarge) => return self.reject(key, Response::payload_too_large()),
            Err(ParseError::InvalidFormat) => return self.reject(key, Response::bad_request()),
        };

        client.state = ConnState::Handling;
        let (fd, peer, needs_coroutine) = (client.fd, client.peer, client.coroutine.is_none());
        let _ = self.shared.poller.deregister(fd);
        debug!(unit = key.index(), method = ?request.method, path = %request.path, "dispatch");

        if needs_coroutine {
            match self.spawn_connection(key, fd, peer) {
                Ok(co) => {
                    if let Some(unit) = self.units.get_mut(key) {
                        unit.set_coroutine(co);
                    }
                }
                Err(e) => {
                    error!("failed to start connection coroutine: {e}");
                    return self.close_client(key);
                }
            }
        }

        let continuation = Continuation::new(key, Some(fd), &self.shared);
        self.drive(key, Signal::Run(Job { request, continuation }));
    }

    fn spawn_connection(&self, key: Key, fd: RawFd, peer: SocketAddr) -> io::Result<Coroutine> {
        let handler = self.handler.clone();
        let handle = Handle::new(self.shared.clone());
        let keep_alive = self.limits.keep_alive.is_some();
        Coroutine::spawn(
            key,
            self.shared.clone(),
            self.shared.settings.stack_size,
            move |first| serve_connection(&*handler, first, fd, peer, handle, keep_alive),
        )
    }

    /// Switches into the unit's coroutine and handles whatever it yields.
    fn drive(&mut self, key: Key, signal: Signal) {
        let yielded = match self.units.get_mut(key).and_then(Unit::coroutine_mut) {
            Some(co) => co.switch(signal),
            None => return,
        };
        match yielded {
            Yielded::Parked => {}
            Yielded::Served => self.served(key),
            Yielded::Exited(done) => self.retire(key, done),
        }
    }

    fn served(&mut self, key: Key) {
        let Some(Unit::Client(client)) = self.units.get_mut(key) else {
            return;
        };
        client.state = ConnState::Reading;
        client.requests_served += 1;
        client.last_active = Instant::now();

        if !client.read_buf.is_empty() {
            self.pipelined.push_back(key);
        } else if client.eof {
            return self.close_client(key);
        }
        if !client.eof {
            let fd = client.fd;
            if let Err(e) = self.shared.poller.register(fd, fd as u64, Interest::READ) {
                warn!("failed to re-arm client socket: {e}");
                self.close_client(key);
            }
        }
    }

    /// Drops a unit whose coroutine has exited.
    fn retire(&mut self, key: Key, done: Done) {
        let Some(mut unit) = self.units.remove(key) else {
            return;
        };
        if let Some(co) = unit.take_coroutine() {
            co.join();
        }
        if let Unit::Client(client) = unit {
            self.forget_fd(client.fd, key);
            if done != Done::Detached {
                self.shared.cancel_wait(client.fd);
                let _ = self.shared.poller.deregister(client.fd);
                syscalls::close(client.fd);
            }
            debug!(unit = key.index(), ?done, served = client.requests_served, "connection finished");
        } else {
            debug!(unit = key.index(), "task finished");
        }
    }

    /// Closes a connection whose coroutine is idle or was never started.
    fn close_client(&mut self, key: Key) {
        let Some(mut unit) = self.units.remove(key) else {
            return;
        };
        if let Some(mut co) = unit.take_coroutine() {
            co.switch(Signal::Shutdown);
            co.join();
        }
        if let Unit::Client(client) = unit {
            self.forget_fd(client.fd, key);
            let _ = self.shared.poller.deregister(client.fd);
            syscalls::close(client.fd);
            debug!(unit = key.index(), "connection closed");
        }
    }

    fn forget_fd(&mut self, fd: RawFd, key: Key) {
        // An upgraded socket may have closed its descriptor already and a
        // new client may own that number now.
        if self.by_fd.get(&fd) == Some(&key) {
            self.by_fd.remove(&fd);
        }
    }

    /// Best-effort error response, then close.
    fn reject(&mut self, key: Key, response: Response) {
        if let Some(Unit::Client(client)) = self.units.get(key) {
            debug!(unit = key.index(), status = response.status, "rejecting request");
            let _ = syscalls::send(client.fd, &response.to_bytes(false));
        }
        self.close_client(key);
    }

    fn prune_idle(&mut self) {
        let idle = self.limits.keep_alive.unwrap_or(DEFAULT_IDLE);
        let stale: Vec<Key> = self
            .units
            .keys()
            .into_iter()
            .filter(|k| {
                matches!(self.units.get(*k), Some(Unit::Client(c))
                    if c.state == ConnState::Reading && c.last_active.elapsed() > idle)
            })
            .collect();
        for key in stale {
            debug!(unit = key.index(), "closing idle connection");
            self.close_client(key);
        }
    }

    fn teardown(&mut self) {
        let dropped = self.shared.timers.lock().clear();
        self.shared.spawns.lock().clear();
        self.shared.clear_waits();
        self.pipelined.clear();

        let live = self.units.len();
        for key in self.units.keys() {
            let mut done = Done::Close;
            if let Some(co) = self.units.get_mut(key).and_then(Unit::coroutine_mut) {
                // Parked coroutines see a shutdown error and unwind; nothing
                // parks again once the flag is set.
                for _ in 0..8 {
                    if let Yielded::Exited(d) = co.switch(Signal::Shutdown) {
                        done = d;
                        break;
                    }
                }
            }
            let Some(mut unit) = self.units.remove(key) else {
                continue;
            };
            if let Some(co) = unit.take_coroutine() {
                co.join();
            }
            if let Unit::Client(client) = unit {
                if done != Done::Detached {
                    let _ = self.shared.poller.deregister(client.fd);
                    syscalls::close(client.fd);
                }
            }
        }
        self.shared.ready.lock().clear();
        self.by_fd.clear();

        let _ = self.shared.poller.deregister(self.listen_fd);
        syscalls::close(self.listen_fd);
        info!(units = live, dropped_calls = dropped, "scheduler stopped");
    }
}

/// Body of a connection coroutine: serves requests until the connection
/// is done with.
fn serve_connection<H: Handler>(
    handler: &H,
    first: Signal,
    fd: RawFd,
    peer: SocketAddr,
    handle: Handle,
    keep_alive: bool,
) -> Done {
    let mut signal = first;
    loop {
        let Signal::Run(job) = signal else {
            return Done::Close;
        };
        match serve_request(handler, job, fd, peer, &handle, keep_alive) {
            Done::KeepAlive => signal = coroutine::yield_now(Yielded::Served),
            done => return done,
        }
    }
}

fn serve_request<H: Handler>(
    handler: &H,
    job: Job,
    fd: RawFd,
    peer: SocketAddr,
    handle: &Handle,
    keep_alive: bool,
) -> Done {
    let Job { request, continuation } = job;
    let span = debug_span!("request", method = ?request.method, path = %request.path);
    let _enter = span.enter();
    let keep_alive = keep_alive && request.keep_alive();

    let mut ctx = Context::new(
        request,
        continuation.clone(),
        handle.clone(),
        Socket::borrowed(fd),
        peer,
    );
    let result = call_handler(handler, &mut ctx);
    continuation.finish();

    if ctx.is_upgraded() {
        if let Err(e) = result {
            debug!("upgraded handler ended with error: {e}");
        }
        return Done::Detached;
    }

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            warn!("handler failed: {e}");
            Response::internal_error()
        }
    };
    let status = response.status;
    let keep_alive = keep_alive
        && !response
            .header("connection")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("close"));
    match ctx.socket().send_all(&response.to_bytes(keep_alive)) {
        Ok(()) => {
            debug!(status, "response sent");
            if keep_alive { Done::KeepAlive } else { Done::Close }
        }
        Err(e) => {
            debug!(status, "failed to write response: {e}");
            Done::Close
        }
    }
}

#[cfg(feature = "catch-panic")]
fn call_handler<H: Handler>(handler: &H, ctx: &mut Context) -> EtudeResult<Response> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.call(ctx))) {
        Ok(result) => result,
        Err(payload) => Err(EtudeError::HandlerPanic(coroutine::panic_message(&payload))),
    }
}

#[cfg(not(feature = "catch-panic"))]
fn call_handler<H: Handler>(handler: &H, ctx: &mut Context) -> EtudeResult<Response> {
    handler.call(ctx)
}
