//! Deferred work: removal checks, idle timeouts, and effect wake-ups.
//!
//! The registry never spawns threads or assumes an event loop. Everything it
//! defers goes through a [`Scheduler`], which the host drives. [`TaskQueue`]
//! is the default: a FIFO of ready tasks plus a timer wheel, run explicitly
//! with [`TaskQueue::run_until_idle`].

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Host hook for deferred work.
pub trait Scheduler: Send + Sync + 'static {
    /// Runs `task` soon. Running it before this call returns is allowed.
    fn schedule_task(&self, task: Task);

    /// Runs `task` once `delay` has elapsed on this scheduler's clock.
    fn schedule_timeout(&self, delay: Duration, task: Task);

    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

enum Clock {
    Monotonic(Instant),
    Manual(Mutex<Duration>),
}

impl Clock {
    fn now(&self) -> Duration {
        match self {
            Clock::Monotonic(origin) => origin.elapsed(),
            Clock::Manual(now) => *now.lock(),
        }
    }
}

/// Single-threaded cooperative scheduler.
///
/// Tasks run only when the host calls [`run_until_idle`](Self::run_until_idle).
/// With a [manual](Self::manual) clock, time moves only through
/// [`advance`](Self::advance), which makes idle-TTL behaviour deterministic.
pub struct TaskQueue {
    ready: Mutex<VecDeque<Task>>,
    timers: Mutex<BTreeMap<(Duration, u64), Task>>,
    sequence: AtomicU64,
    clock: Clock,
}

impl TaskQueue {
    /// A queue whose timers follow the monotonic wall clock.
    pub fn new() -> Self {
        Self::with_clock(Clock::Monotonic(Instant::now()))
    }

    /// A queue with a virtual clock starting at zero.
    pub fn manual() -> Self {
        Self::with_clock(Clock::Manual(Mutex::new(Duration::ZERO)))
    }

    fn with_clock(clock: Clock) -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
            timers: Mutex::new(BTreeMap::new()),
            sequence: AtomicU64::new(0),
            clock,
        }
    }

    /// Runs ready tasks and due timers until neither is left.
    ///
    /// Returns the number of tasks run. Tasks scheduled while running are
    /// picked up in the same call.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            // The lock is released before the task runs so tasks can schedule more.
            let next = self.ready.lock().pop_front();
            if let Some(task) = next {
                task();
                ran += 1;
                continue;
            }
            if !self.promote_due_timers() {
                return ran;
            }
        }
    }

    /// Moves the manual clock forward and runs everything that became due.
    ///
    /// Has no effect on the clock of a queue created with [`new`](Self::new).
    pub fn advance(&self, by: Duration) -> usize {
        if let Clock::Manual(now) = &self.clock {
            *now.lock() += by;
        }
        self.run_until_idle()
    }

    pub fn pending_tasks(&self) -> usize {
        self.ready.lock().len()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.lock().len()
    }

    /// Deadline of the earliest timer, on this queue's clock.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.lock().keys().next().map(|(deadline, _)| *deadline)
    }

    fn promote_due_timers(&self) -> bool {
        let now = self.clock.now();
        let mut timers = self.timers.lock();
        let mut promoted = false;
        while let Some(entry) = timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            self.ready.lock().push_back(entry.remove());
            promoted = true;
        }
        promoted
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("now", &self.clock.now())
            .field("pending_tasks", &self.pending_tasks())
            .field("pending_timers", &self.pending_timers())
            .finish()
    }
}

impl Scheduler for TaskQueue {
    fn schedule_task(&self, task: Task) {
        self.ready.lock().push_back(task);
    }

    fn schedule_timeout(&self, delay: Duration, task: Task) {
        let deadline = self.clock.now() + delay;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.timers.lock().insert((deadline, sequence), task);
    }

    fn now(&self) -> Duration {
        self.clock.now()
    }
}
