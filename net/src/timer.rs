//! One-shot and periodic timers owned by an event loop.
//!
//! Timers are pooled: a non-repeating timer returns to the free list
//! after firing, a cancelled timer returns immediately. Reuse assigns a
//! fresh sequence number, so a stale [`TimerId`] can never cancel the
//! slot's next occupant.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::callbacks::TimerCallback;
use crate::event_loop::LoopHandle;

/// Process-wide sequence source; uniqueness is what makes `TimerId`
/// ABA-safe across timer reuse.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for cancelling a timer.
#[derive(Clone)]
pub struct TimerId {
    pub(crate) timer: Weak<Timer>,
    pub(crate) sequence: u64,
}

impl TimerId {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl std::fmt::Debug for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerId")
            .field("sequence", &self.sequence)
            .finish()
    }
}

pub(crate) struct Timer {
    state: Mutex<TimerState>,
}

struct TimerState {
    callback: Option<TimerCallback>,
    expiration: Instant,
    interval: Duration,
    repeat: bool,
    sequence: u64,
    armed: bool,
}

impl Timer {
    fn idle() -> Self {
        Timer {
            state: Mutex::new(TimerState {
                callback: None,
                expiration: Instant::now(),
                interval: Duration::ZERO,
                repeat: false,
                sequence: 0,
                armed: false,
            }),
        }
    }
}

struct HeapEntry {
    when: Instant,
    sequence: u64,
    timer: Arc<Timer>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.sequence == other.sequence
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Equal expirations break ties by ascending sequence, preserving
        // registration order.
        (self.when, self.sequence).cmp(&(other.when, other.sequence))
    }
}

/// Timer service for one event loop.
///
/// Add and cancel are safe from any thread; both marshal onto the loop.
pub(crate) struct TimerQueue {
    heap: Mutex<BinaryHeap<Reverse<HeapEntry>>>,
    free: Mutex<Vec<Arc<Timer>>>,
}

impl TimerQueue {
    pub(crate) fn new() -> TimerQueue {
        TimerQueue {
            heap: Mutex::new(BinaryHeap::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Allocate or reuse a timer, hand its activation to the loop thread,
    /// and return its identifier immediately.
    pub(crate) fn add(
        self: &Arc<Self>,
        loop_: &LoopHandle,
        callback: TimerCallback,
        when: Instant,
        interval: Duration,
    ) -> TimerId {
        let timer = {
            let mut free = self.free.lock();
            free.pop().unwrap_or_else(|| Arc::new(Timer::idle()))
        };

        let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = timer.state.lock();
            *state = TimerState {
                callback: Some(callback),
                expiration: when,
                interval,
                repeat: interval > Duration::ZERO,
                sequence,
                armed: true,
            };
        }

        let id = TimerId {
            timer: Arc::downgrade(&timer),
            sequence,
        };

        let queue = self.clone();
        loop_.run_in_loop(move || queue.arm(timer));
        id
    }

    /// Cancel from any thread. A timer that already fired (or was never
    /// alive) logs and is otherwise a no-op.
    pub(crate) fn cancel(self: &Arc<Self>, loop_: &LoopHandle, id: TimerId) {
        let queue = self.clone();
        loop_.run_in_loop(move || queue.cancel_in_loop(id));
    }

    fn arm(&self, timer: Arc<Timer>) {
        let (when, sequence, armed) = {
            let state = timer.state.lock();
            (state.expiration, state.sequence, state.armed)
        };
        if !armed {
            // Cancelled between add and activation.
            return;
        }
        let now = Instant::now();
        if when < now {
            warn!(
                "timer {} expiration is {:?} earlier than now",
                sequence,
                now - when
            );
        }
        self.heap.lock().push(Reverse(HeapEntry {
            when,
            sequence,
            timer,
        }));
    }

    fn cancel_in_loop(&self, id: TimerId) {
        match id.timer.upgrade() {
            Some(timer) => {
                let mut state = timer.state.lock();
                if state.armed && state.sequence == id.sequence {
                    state.armed = false;
                    state.callback = None;
                    drop(state);
                    self.free.lock().push(timer);
                } else {
                    debug!("timer {} already fired or reused before cancel", id.sequence);
                }
            }
            None => warn!("timer {} destroyed before cancel", id.sequence),
        }
    }

    /// Duration until the earliest live timer, if any. Stale heap entries
    /// (cancelled or reused timers) are discarded on the way.
    pub(crate) fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let mut heap = self.heap.lock();
        while let Some(Reverse(entry)) = heap.peek() {
            let live = {
                let state = entry.timer.state.lock();
                state.armed && state.sequence == entry.sequence
            };
            if live {
                return Some(entry.when.saturating_duration_since(now));
            }
            heap.pop();
        }
        None
    }

    /// Fire every timer due at `now`, in (expiration, sequence) order.
    /// Callbacks run with no queue locks held, so they may freely add or
    /// cancel timers.
    pub(crate) fn expire(&self, now: Instant) {
        let mut due: Vec<TimerCallback> = Vec::new();
        {
            let mut heap = self.heap.lock();
            while let Some(Reverse(head)) = heap.peek() {
                if head.when > now {
                    break;
                }
                let Some(Reverse(entry)) = heap.pop() else {
                    break;
                };
                let mut state = entry.timer.state.lock();
                if !state.armed || state.sequence != entry.sequence {
                    continue;
                }
                if state.repeat {
                    state.expiration = now + state.interval;
                    if let Some(cb) = state.callback.clone() {
                        due.push(cb);
                    }
                    let when = state.expiration;
                    let sequence = state.sequence;
                    drop(state);
                    heap.push(Reverse(HeapEntry {
                        when,
                        sequence,
                        timer: entry.timer,
                    }));
                } else {
                    state.armed = false;
                    let cb = state.callback.take();
                    drop(state);
                    if let Some(cb) = cb {
                        due.push(cb);
                    }
                    self.free.lock().push(entry.timer);
                }
            }
        }
        for cb in due {
            cb();
        }
    }
}
