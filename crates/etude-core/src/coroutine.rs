// src/coroutine.rs
//! Thread-backed coroutines.
//!
//! Each coroutine runs on its own OS thread, but only while it holds the
//! baton: the scheduler sends a [`Signal`] and blocks until the coroutine
//! answers with a [`Yielded`]. At any instant exactly one of {scheduler,
//! one coroutine} is running.

use crate::args::Args;
use crate::continuation::Continuation;
use crate::http::Request;
use crate::runtime::Shared;
use crate::slab::Key;
use std::cell::RefCell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Why a parked coroutine is being woken.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// `Continuation::resume` with the supplied values.
    Resumed(Args),
    /// The suspend or readiness wait deadline passed.
    TimedOut,
    /// The awaited descriptor is ready.
    Ready,
    /// The awaited descriptor was closed underneath the waiter.
    Cancelled,
    /// The peer hung up while the continuation was suspended.
    Lost,
}

/// One request handed to a connection coroutine.
pub(crate) struct Job {
    pub(crate) request: Request,
    pub(crate) continuation: Continuation,
}

/// Scheduler to coroutine.
pub(crate) enum Signal {
    /// First entry into a detached task.
    Start,
    /// Serve a request (connection coroutines).
    Run(Job),
    Wake(Outcome),
    /// Unwind and exit.
    Shutdown,
}

/// How a unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Done {
    KeepAlive,
    Close,
    /// The connection was upgraded; the descriptor belongs to someone else.
    Detached,
}

/// Coroutine to scheduler.
#[derive(Debug)]
pub(crate) enum Yielded {
    /// Waiting on a continuation or on readiness.
    Parked,
    /// Finished a request and kept the connection; waiting for the next one.
    Served,
    Exited(Done),
}

struct Current {
    key: Key,
    shared: Arc<Shared>,
    wake_rx: Receiver<Signal>,
    yield_tx: Sender<Yielded>,
}

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
}

pub(crate) struct Coroutine {
    key: Key,
    wake_tx: Sender<Signal>,
    yield_rx: Receiver<Yielded>,
    thread: Option<JoinHandle<()>>,
}

impl Coroutine {
    pub(crate) fn spawn<F>(
        key: Key,
        shared: Arc<Shared>,
        stack_size: usize,
        body: F,
    ) -> io::Result<Coroutine>
    where
        F: FnOnce(Signal) -> Done + Send + 'static,
    {
        let (wake_tx, wake_rx) = mpsc::channel();
        let (yield_tx, yield_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name(format!("etude-co-{}", key.index()))
            .stack_size(stack_size)
            .spawn(move || {
                let first = match wake_rx.recv() {
                    Ok(signal) => signal,
                    Err(_) => return,
                };
                if matches!(first, Signal::Shutdown) {
                    let _ = yield_tx.send(Yielded::Exited(Done::Close));
                    return;
                }
                let exit_tx = yield_tx.clone();
                CURRENT.with(|c| {
                    *c.borrow_mut() = Some(Current {
                        key,
                        shared,
                        wake_rx,
                        yield_tx,
                    })
                });

                let done = match panic::catch_unwind(AssertUnwindSafe(|| body(first))) {
                    Ok(done) => done,
                    Err(payload) => {
                        error!(unit = key.index(), "coroutine panicked: {}", panic_message(&payload));
                        Done::Close
                    }
                };
                CURRENT.with(|c| c.borrow_mut().take());
                let _ = exit_tx.send(Yielded::Exited(done));
            })?;

        Ok(Coroutine {
            key,
            wake_tx,
            yield_rx,
            thread: Some(thread),
        })
    }

    /// Hands the baton to the coroutine and blocks until it yields back.
    pub(crate) fn switch(&mut self, signal: Signal) -> Yielded {
        if self.wake_tx.send(signal).is_err() {
            return Yielded::Exited(Done::Close);
        }
        match self.yield_rx.recv() {
            Ok(yielded) => yielded,
            Err(_) => {
                debug!(unit = self.key.index(), "coroutine thread went away");
                Yielded::Exited(Done::Close)
            }
        }
    }

    /// Waits for the thread after it reported `Exited`.
    pub(crate) fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Gives the baton back to the scheduler and blocks until woken.
///
/// Returns [`Signal::Shutdown`] without yielding once the server is
/// stopping, so nothing parks during teardown.
pub(crate) fn yield_now(yielded: Yielded) -> Signal {
    CURRENT.with(|c| {
        let c = c.borrow();
        let Some(cur) = c.as_ref() else {
            return Signal::Shutdown;
        };
        if cur.shared.is_shutdown() {
            return Signal::Shutdown;
        }
        if cur.yield_tx.send(yielded).is_err() {
            return Signal::Shutdown;
        }
        cur.wake_rx.recv().unwrap_or(Signal::Shutdown)
    })
}

pub(crate) fn park() -> Signal {
    yield_now(Yielded::Parked)
}

/// Key of the coroutine running on this thread, if any.
pub(crate) fn current_key() -> Option<Key> {
    CURRENT.with(|c| c.borrow().as_ref().map(|cur| cur.key))
}

pub(crate) fn current_shared() -> Option<Arc<Shared>> {
    CURRENT.with(|c| c.borrow().as_ref().map(|cur| cur.shared.clone()))
}

pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
