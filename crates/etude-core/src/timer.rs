// Deferred-call queue: a min-heap of callbacks ordered by (deadline, sequence).
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
struct TimerState {
    deadline: Instant,
    /// Set by whichever of {fire, cancel} happens first.
    done: AtomicBool,
}

/// Handle to a scheduled deferred call.
///
/// Firing and cancellation are mutually exclusive: whichever happens first
/// wins and the other becomes a no-op.
#[derive(Debug, Clone)]
pub struct Timer {
    state: Arc<TimerState>,
}

impl Timer {
    /// Cancel the call. Returns `true` when this prevented it from running.
    pub fn cancel(&self) -> bool {
        !self.state.done.swap(true, Ordering::AcqRel)
    }

    /// `false` once the call has fired or been cancelled.
    pub fn is_pending(&self) -> bool {
        !self.state.done.load(Ordering::Acquire)
    }

    pub fn deadline(&self) -> Instant {
        self.state.deadline
    }
}

struct Entry {
    seq: u64,
    state: Arc<TimerState>,
    callback: Callback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap and we want the earliest deadline,
    // then the lowest sequence number, on top.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .state
            .deadline
            .cmp(&self.state.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A call taken out of the queue, ready to run outside the queue lock.
pub(crate) struct Due {
    state: Arc<TimerState>,
    callback: Callback,
}

impl Due {
    /// Runs the callback unless it was cancelled after being taken.
    pub(crate) fn fire(self) -> bool {
        if self.state.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        (self.callback)();
        true
    }
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, deadline: Instant, callback: Callback) -> Timer {
        let state = Arc::new(TimerState {
            deadline,
            done: AtomicBool::new(false),
        });
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            seq,
            state: state.clone(),
            callback,
        });
        Timer { state }
    }

    /// Earliest deadline among calls that can still fire.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if top.state.done.load(Ordering::Acquire) {
                self.heap.pop();
            } else {
                return Some(top.state.deadline);
            }
        }
        None
    }

    /// Pops every call due at `now`, in firing order.
    ///
    /// Calls scheduled while the returned batch runs land back in the heap
    /// and wait for the next turn, even with a zero delay.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<Due> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.state.deadline > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                if entry.state.done.load(Ordering::Acquire) {
                    continue;
                }
                due.push(Due {
                    state: entry.state,
                    callback: entry.callback,
                });
            }
        }
        due
    }

    /// Drops every pending call without running it. Returns how many were live.
    pub(crate) fn clear(&mut self) -> usize {
        let live = self
            .heap
            .iter()
            .filter(|e| !e.state.done.swap(true, Ordering::AcqRel))
            .count();
        self.heap.clear();
        live
    }

    pub(crate) fn len(&self) -> usize {
        self.heap
            .iter()
            .filter(|e| !e.state.done.load(Ordering::Acquire))
            .count()
    }
}
