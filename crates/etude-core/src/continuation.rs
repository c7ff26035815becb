// src/continuation.rs
use crate::args::Args;
use crate::coroutine::{self, Outcome, Signal};
use crate::error::{EtudeError, EtudeResult, UsageError};
use crate::runtime::Shared;
use crate::slab::Key;
use crate::syscalls;
use crate::timer::Timer;
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Observable state of a [`Continuation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationState {
    /// Running, never suspended, or already resumed or timed out.
    Idle,
    /// Parked in `suspend`, waiting for `resume` or its deadline.
    Suspended,
    /// The request it was created for has completed.
    Finished,
}

enum Phase {
    Idle,
    Suspended { serial: u64, timer: Option<Timer> },
    Finished,
}

/// Lets a handler park its own request and lets anyone else wake it.
///
/// One continuation is created per request. Clones refer to the same
/// request, so a handler can store a clone where other handlers, deferred
/// calls or spawned tasks find it and call [`resume`](Self::resume).
#[derive(Clone)]
pub struct Continuation {
    key: Key,
    fd: Option<RawFd>,
    shared: Weak<Shared>,
    phase: Arc<Mutex<Phase>>,
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("unit", &self.key.index())
            .field("state", &self.state())
            .finish()
    }
}

impl Continuation {
    pub(crate) fn new(key: Key, fd: Option<RawFd>, shared: &Arc<Shared>) -> Self {
        Self {
            key,
            fd,
            shared: Arc::downgrade(shared),
            phase: Arc::new(Mutex::new(Phase::Idle)),
        }
    }

    pub fn state(&self) -> ContinuationState {
        match *self.phase.lock() {
            Phase::Idle => ContinuationState::Idle,
            Phase::Suspended { .. } => ContinuationState::Suspended,
            Phase::Finished => ContinuationState::Finished,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.state() == ContinuationState::Suspended
    }

    /// Parks the calling coroutine until [`resume`](Self::resume) is called,
    /// returning the values passed to it.
    ///
    /// With a non-zero `timeout` the call fails with
    /// [`EtudeError::Timeout`] once the deadline passes without a resume.
    /// Without one it waits indefinitely, but the peer is checked
    /// periodically and a hung-up client ends the wait with
    /// [`EtudeError::ConnectionLost`].
    ///
    /// Must be called from the coroutine serving this continuation's
    /// request.
    pub fn suspend(&self, timeout: Option<Duration>) -> EtudeResult<Args> {
        let shared = self.shared.upgrade().ok_or(EtudeError::Shutdown)?;
        {
            let mut phase = self.phase.lock();
            match *phase {
                Phase::Finished => return Err(UsageError::Finished.into()),
                Phase::Suspended { .. } => return Err(UsageError::AlreadySuspended.into()),
                Phase::Idle => {}
            }
            match coroutine::current_key() {
                None => return Err(EtudeError::NotInCoroutine),
                Some(key) if key != self.key => return Err(UsageError::NotOwner.into()),
                Some(_) => {}
            }

            let serial = shared.next_serial();
            let timer = match timeout {
                Some(delay) if !delay.is_zero() => Some(self.arm_timeout(&shared, serial, delay)),
                _ => self.fd.map(|fd| {
                    arm_probe(&shared, &self.phase, self.key, fd, serial, shared.settings.liveness_probe)
                }),
            };
            *phase = Phase::Suspended { serial, timer };
        }
        debug!(unit = self.key.index(), ?timeout, "suspend");

        let signal = coroutine::park();
        match signal {
            Signal::Wake(Outcome::Resumed(args)) => Ok(args),
            Signal::Wake(Outcome::TimedOut) => Err(EtudeError::Timeout),
            Signal::Wake(Outcome::Lost) => Err(EtudeError::ConnectionLost),
            _ => {
                self.settle();
                Err(EtudeError::Shutdown)
            }
        }
    }

    /// Wakes the suspended coroutine, handing it `args` as the result of
    /// its `suspend`. The woken coroutine runs once the caller yields.
    ///
    /// Fails with [`UsageError::NotSuspended`] unless the continuation is
    /// currently suspended; the target is left untouched in that case.
    pub fn resume(&self, args: Args) -> EtudeResult<()> {
        let shared = self.shared.upgrade().ok_or(EtudeError::Shutdown)?;
        let mut phase = self.phase.lock();
        match std::mem::replace(&mut *phase, Phase::Idle) {
            Phase::Suspended { timer, .. } => {
                if let Some(t) = timer {
                    t.cancel();
                }
                shared.push_ready(self.key, Outcome::Resumed(args));
                debug!(unit = self.key.index(), "resume");
                Ok(())
            }
            other => {
                *phase = other;
                Err(UsageError::NotSuspended.into())
            }
        }
    }

    /// Marks the request complete. Later suspends fail with
    /// [`UsageError::Finished`], later resumes with `NotSuspended`.
    pub(crate) fn finish(&self) {
        let mut phase = self.phase.lock();
        if let Phase::Suspended { timer: Some(t), .. } = &*phase {
            t.cancel();
        }
        *phase = Phase::Finished;
    }

    /// Leaves `Suspended` after an unexpected wake.
    fn settle(&self) {
        let mut phase = self.phase.lock();
        match std::mem::replace(&mut *phase, Phase::Idle) {
            Phase::Suspended { timer, .. } => {
                if let Some(t) = timer {
                    t.cancel();
                }
            }
            other => *phase = other,
        }
    }

    fn arm_timeout(&self, shared: &Arc<Shared>, serial: u64, delay: Duration) -> Timer {
        let weak = Arc::downgrade(shared);
        let phase = self.phase.clone();
        let key = self.key;
        shared.schedule(
            delay,
            Box::new(move || {
                let Some(shared) = weak.upgrade() else { return };
                let mut phase = phase.lock();
                if matches!(*phase, Phase::Suspended { serial: s, .. } if s == serial) {
                    *phase = Phase::Idle;
                    shared.push_ready(key, Outcome::TimedOut);
                    debug!(unit = key.index(), "suspend timed out");
                }
            }),
        )
    }
}

/// Periodic check that the connection of a suspended request has not
/// failed.
fn arm_probe(
    shared: &Arc<Shared>,
    phase: &Arc<Mutex<Phase>>,
    key: Key,
    fd: RawFd,
    serial: u64,
    interval: Duration,
) -> Timer {
    let weak = Arc::downgrade(shared);
    let phase = phase.clone();
    shared.schedule(
        interval,
        Box::new(move || {
            let Some(shared) = weak.upgrade() else { return };
            let mut guard = phase.lock();
            if !matches!(*guard, Phase::Suspended { serial: s, .. } if s == serial) {
                return;
            }
            if syscalls::peer_failed(fd) {
                *guard = Phase::Idle;
                shared.push_ready(key, Outcome::Lost);
                debug!(unit = key.index(), "peer lost while suspended");
            } else {
                let next = arm_probe(&shared, &phase, key, fd, serial, interval);
                if let Phase::Suspended { timer, .. } = &mut *guard {
                    *timer = Some(next);
                }
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Settings;
    use crate::slab::Slab;

    fn setup() -> (Arc<Shared>, Key) {
        let shared = Shared::new(Settings {
            liveness_probe: Duration::from_secs(30),
            stack_size: 256 * 1024,
        })
        .unwrap();
        let mut slab = Slab::new(1);
        (shared, slab.insert(()).unwrap())
    }

    #[test]
    fn test_resume_before_suspend_fails() {
        let (shared, key) = setup();
        let c = Continuation::new(key, None, &shared);
        let err = c.resume(Args::new()).unwrap_err();
        assert!(matches!(err, EtudeError::Usage(UsageError::NotSuspended)));
        assert_eq!(c.state(), ContinuationState::Idle);
        assert!(shared.ready.lock().is_empty());
    }

    #[test]
    fn test_suspend_outside_coroutine_fails() {
        let (shared, key) = setup();
        let c = Continuation::new(key, None, &shared);
        assert!(matches!(c.suspend(None), Err(EtudeError::NotInCoroutine)));
        assert_eq!(c.state(), ContinuationState::Idle);
    }

    #[test]
    fn test_finished_continuation_rejects_everything() {
        let (shared, key) = setup();
        let c = Continuation::new(key, None, &shared);
        c.finish();
        assert_eq!(c.state(), ContinuationState::Finished);
        assert!(matches!(
            c.suspend(Some(Duration::from_secs(1))),
            Err(EtudeError::Usage(UsageError::Finished))
        ));
        assert!(matches!(
            c.resume(Args::new()),
            Err(EtudeError::Usage(UsageError::NotSuspended))
        ));
    }

    #[test]
    fn test_resume_and_timeout_race_single_winner() {
        let (shared, key) = setup();
        let c = Continuation::new(key, None, &shared);
        // Put the continuation in the suspended phase by hand.
        let timer = c.arm_timeout(&shared, 7, Duration::ZERO);
        *c.phase.lock() = Phase::Suspended {
            serial: 7,
            timer: Some(timer.clone()),
        };

        c.resume(Args::new().arg("first")).unwrap();
        assert!(!timer.is_pending());
        assert!(c.resume(Args::new()).is_err());

        let due = shared
            .timers
            .lock()
            .take_due(std::time::Instant::now() + Duration::from_millis(1));
        for d in due {
            d.fire();
        }
        let ready: Vec<_> = shared.ready.lock().drain(..).collect();
        assert_eq!(ready.len(), 1);
        assert!(matches!(ready[0].outcome, Outcome::Resumed(_)));
    }
}
