// src/runtime.rs
use crate::args::Args;
use crate::coroutine::{self, Outcome};
use crate::slab::Key;
use crate::syscalls::{Interest, Poller, Waker};
use crate::timer::{Timer, TimerQueue};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Poller token of the wake-up pipe. Socket tokens are descriptors.
pub(crate) const WAKE_TOKEN: u64 = u64::MAX - 1;

/// A coroutine that may run again, and why.
#[derive(Debug)]
pub(crate) struct Ready {
    pub(crate) key: Key,
    pub(crate) outcome: Outcome,
}

struct IoWait {
    key: Key,
    serial: u64,
    interest: Interest,
    timer: Option<Timer>,
}

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) liveness_probe: Duration,
    pub(crate) stack_size: usize,
}

/// State reachable from the scheduler thread and from every coroutine.
pub(crate) struct Shared {
    pub(crate) timers: Mutex<TimerQueue>,
    pub(crate) ready: Mutex<VecDeque<Ready>>,
    waits: Mutex<HashMap<RawFd, Vec<IoWait>>>,
    pub(crate) spawns: Mutex<Vec<Task>>,
    pub(crate) poller: Poller,
    waker: Waker,
    /// A wake-up byte is in the pipe and not yet drained.
    notified: AtomicBool,
    pub(crate) settings: Settings,
    shutdown: AtomicBool,
    serial: AtomicU64,
}

impl Shared {
    pub(crate) fn new(settings: Settings) -> io::Result<Arc<Self>> {
        let poller = Poller::new()?;
        let waker = Waker::new()?;
        poller.register(waker.fd(), WAKE_TOKEN, Interest::READ)?;
        Ok(Arc::new(Self {
            timers: Mutex::new(TimerQueue::new()),
            ready: Mutex::new(VecDeque::new()),
            waits: Mutex::new(HashMap::new()),
            spawns: Mutex::new(Vec::new()),
            poller,
            waker,
            notified: AtomicBool::new(false),
            settings,
            shutdown: AtomicBool::new(false),
            serial: AtomicU64::new(1),
        }))
    }

    pub(crate) fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn push_ready(&self, key: Key, outcome: Outcome) {
        self.ready.lock().push_back(Ready { key, outcome });
        self.notify();
    }

    pub(crate) fn schedule(self: &Arc<Self>, delay: Duration, callback: crate::timer::Callback) -> Timer {
        let timer = self.timers.lock().push(Instant::now() + delay, callback);
        self.notify();
        timer
    }

    pub(crate) fn push_spawn(&self, task: Task) {
        self.spawns.lock().push(task);
        self.notify();
    }

    /// Makes the scheduler's next (or current) poll return. At most one
    /// wake-up byte is outstanding at a time.
    pub(crate) fn notify(&self) {
        if self.notified.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake scheduler: {e}");
        }
    }

    /// Consumes the pending wake-up. The scheduler re-checks its queues
    /// before polling again, so a notify racing with this is not lost.
    pub(crate) fn take_wakeup(&self) {
        self.waker.drain();
        self.notified.store(false, Ordering::Release);
    }

    fn sync_interest(&self, fd: RawFd, list: &[IoWait]) -> io::Result<()> {
        let interest = list
            .iter()
            .map(|w| w.interest)
            .reduce(Interest::union)
            .unwrap_or(Interest::READ);
        self.poller.register(fd, fd as u64, interest)
    }

    /// Parks `key` on readiness of `fd`. The caller yields right after.
    pub(crate) fn begin_wait(
        self: &Arc<Self>,
        key: Key,
        fd: RawFd,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let serial = self.next_serial();
        let timer = timeout.map(|delay| {
            let weak: Weak<Shared> = Arc::downgrade(self);
            self.schedule(
                delay,
                Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.expire_wait(fd, serial);
                    }
                }),
            )
        });

        let mut waits = self.waits.lock();
        let list = waits.entry(fd).or_default();
        list.push(IoWait {
            key,
            serial,
            interest,
            timer: timer.clone(),
        });
        if let Err(e) = self.sync_interest(fd, list) {
            list.retain(|w| w.serial != serial);
            if list.is_empty() {
                waits.remove(&fd);
            }
            if let Some(t) = timer {
                t.cancel();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Wakes every waiter on `fd` whose interest matches. Returns false
    /// when nobody was waiting on `fd`.
    pub(crate) fn wake_io(&self, fd: RawFd, readable: bool, writable: bool) -> bool {
        let mut waits = self.waits.lock();
        let Some(list) = waits.get_mut(&fd) else {
            return false;
        };
        let (woken, rest): (Vec<_>, Vec<_>) = list
            .drain(..)
            .partition(|w| w.interest.matches(readable, writable));
        *list = rest;

        let mut ready = self.ready.lock();
        for w in woken {
            if let Some(t) = &w.timer {
                t.cancel();
            }
            ready.push_back(Ready {
                key: w.key,
                outcome: Outcome::Ready,
            });
        }
        drop(ready);

        if list.is_empty() {
            waits.remove(&fd);
            let _ = self.poller.deregister(fd);
        } else {
            let _ = self.sync_interest(fd, list);
        }
        true
    }

    fn expire_wait(&self, fd: RawFd, serial: u64) {
        let mut waits = self.waits.lock();
        let Some(list) = waits.get_mut(&fd) else {
            return;
        };
        let Some(pos) = list.iter().position(|w| w.serial == serial) else {
            return;
        };
        let wait = list.remove(pos);
        if list.is_empty() {
            waits.remove(&fd);
            let _ = self.poller.deregister(fd);
        } else {
            let _ = self.sync_interest(fd, list);
        }
        self.ready.lock().push_back(Ready {
            key: wait.key,
            outcome: Outcome::TimedOut,
        });
    }

    /// Drops every readiness wait on `fd`, waking the waiters with
    /// `Cancelled`. Returns how many were waiting.
    pub(crate) fn cancel_wait(&self, fd: RawFd) -> usize {
        let Some(list) = self.waits.lock().remove(&fd) else {
            return 0;
        };
        let _ = self.poller.deregister(fd);
        let mut ready = self.ready.lock();
        for w in &list {
            if let Some(t) = &w.timer {
                t.cancel();
            }
            ready.push_back(Ready {
                key: w.key,
                outcome: Outcome::Cancelled,
            });
        }
        drop(ready);
        self.notify();
        list.len()
    }

    #[cfg(test)]
    pub(crate) fn has_waiters(&self, fd: RawFd) -> bool {
        self.waits.lock().contains_key(&fd)
    }

    /// Forgets all waits without waking anyone. Used at teardown.
    pub(crate) fn clear_waits(&self) -> Vec<RawFd> {
        let drained: Vec<_> = self.waits.lock().drain().map(|(fd, _)| fd).collect();
        for fd in &drained {
            let _ = self.poller.deregister(*fd);
        }
        drained
    }
}

thread_local! {
    static HUB: RefCell<Option<Arc<Shared>>> = const { RefCell::new(None) };
}

/// Marks the calling thread as the scheduler thread for `shared`.
pub(crate) fn enter_hub(shared: &Arc<Shared>) {
    HUB.with(|h| *h.borrow_mut() = Some(shared.clone()));
}

pub(crate) fn leave_hub() {
    HUB.with(|h| h.borrow_mut().take());
}

/// Cloneable handle to a server's scheduler.
///
/// Deferred calls and spawned tasks always run on the scheduler, one at a
/// time, no matter which thread scheduled them.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Handle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Handle of the server driving the calling code: works from handlers,
    /// spawned tasks and deferred calls.
    pub fn current() -> Option<Handle> {
        coroutine::current_shared()
            .or_else(|| HUB.with(|h| h.borrow().clone()))
            .map(Handle::new)
    }

    /// Runs `f(args)` once, at or after `now + delay`, on the scheduler.
    ///
    /// Calls with equal deadlines run in scheduling order. A call scheduled
    /// from inside another deferred call never runs in the same turn, even
    /// with a zero delay.
    pub fn schedule_call<F>(&self, delay: Duration, f: F, args: Args) -> Timer
    where
        F: FnOnce(Args) + Send + 'static,
    {
        self.shared.schedule(delay, Box::new(move || f(args)))
    }

    /// [`schedule_call`](Self::schedule_call) without arguments.
    pub fn call_later<F>(&self, delay: Duration, f: F) -> Timer
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.schedule(delay, Box::new(f))
    }

    /// Runs `f` in a new coroutine of its own. It may use sockets and
    /// continuations like a handler does.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push_spawn(Box::new(f));
    }

    /// Stops the scheduler loop. Pending deferred calls are dropped without
    /// running; parked coroutines are woken with a shutdown error.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            info!("shutdown requested");
        }
        self.shared.notify();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Deferred calls still waiting to fire.
    pub fn pending_calls(&self) -> usize {
        self.shared.timers.lock().len()
    }
}
