//! The timer service: a monotonic clock abstraction and a set of pending
//! timers drained in deadline order. Nothing in the crate reads wall-clock
//! time directly, so tests can drive a manual clock and replay any timing.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Monotonic time source. Timestamps are durations since an arbitrary
/// origin fixed when the clock was created.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// Wall clock for deployed nodes.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock for deterministic tests and simulations.
pub struct ManualClock {
    now: Cell<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            now: Cell::new(Duration::from_secs(0)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Leader-liveness check, always running.
    LivenessPoll,
    /// Leader heartbeat, running only while this node leads.
    HeartbeatPulse,
    /// Retransmission of an outstanding accept request.
    AcceptRetry,
}

pub type TimerId = u64;

/// Pending timers keyed by deadline. Cancellation is idempotent and safe
/// from within any handler, including a handler fired by the timer itself.
pub struct Timers {
    next_id: TimerId,
    by_deadline: BTreeMap<(Duration, TimerId), TimerKind>,
    deadlines: HashMap<TimerId, Duration>,
}

impl Timers {
    pub fn new() -> Self {
        Timers {
            next_id: 0,
            by_deadline: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    pub fn schedule(&mut self, now: Duration, delay: Duration, kind: TimerKind) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        let deadline = now + delay;
        self.by_deadline.insert((deadline, id), kind);
        self.deadlines.insert(id, deadline);
        id
    }

    pub fn cancel(&mut self, id: TimerId) {
        if let Some(deadline) = self.deadlines.remove(&id) {
            self.by_deadline.remove(&(deadline, id));
        }
    }

    /// Removes and returns every timer due at `now`, soonest first.
    pub fn expired(&mut self, now: Duration) -> Vec<(TimerId, TimerKind)> {
        let due: Vec<(Duration, TimerId, TimerKind)> = self
            .by_deadline
            .iter()
            .take_while(|((deadline, _), _)| *deadline <= now)
            .map(|(&(deadline, id), &kind)| (deadline, id, kind))
            .collect();

        let mut fired = Vec::new();
        for (deadline, id, kind) in due {
            self.by_deadline.remove(&(deadline, id));
            self.deadlines.remove(&id);
            fired.push((id, kind));
        }
        fired
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.by_deadline.keys().next().map(|&(deadline, _)| deadline)
    }

    pub fn clear(&mut self) {
        self.by_deadline.clear();
        self.deadlines.clear();
    }
}
