//! Timers used by [`CancelationSource::cancel_after`](crate::CancelationSource::cancel_after).
//!
//! The default factory runs every timer on one lazily spawned background
//! thread. Install a different one with
//! [`set_timer_factory`](crate::config::set_timer_factory).

use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

pub trait Timer: Send + Sync {
    /// Moves the deadline to `due` from now. Returns `false` if the callback
    /// has already started or the timer was canceled.
    fn change(&self, due: Duration) -> bool;

    /// Stops the timer. Returns `true` if the callback will never run.
    fn cancel(&self) -> bool;
}

pub trait TimerFactory: Send + Sync + 'static {
    fn create_timer(&self, due: Duration, callback: TimerCallback) -> Box<dyn Timer>;
}

struct Entry {
    deadline: Instant,
    callback: TimerCallback,
}

#[derive(Default)]
struct Queue {
    /// May hold outdated deadlines; entries are the source of truth.
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, Entry>,
    next_id: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

pub struct ThreadTimerFactory {
    shared: Arc<Shared>,
}

lazy_static! {
    static ref SHARED_FACTORY: Arc<ThreadTimerFactory> = Arc::new(ThreadTimerFactory::new());
}

impl ThreadTimerFactory {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
        });
        let worker = shared.clone();
        let spawned = thread::Builder::new()
            .name("promise-graph-timer".into())
            .spawn(move || run(&worker));
        if let Err(error) = spawned {
            tracing::error!(%error, "failed to spawn timer thread; timers will never fire");
        }
        Self { shared }
    }

    pub(crate) fn shared() -> Arc<dyn TimerFactory> {
        SHARED_FACTORY.clone()
    }
}

impl Default for ThreadTimerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadTimerFactory {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.wakeup.notify_one();
    }
}

impl TimerFactory for ThreadTimerFactory {
    fn create_timer(&self, due: Duration, callback: TimerCallback) -> Box<dyn Timer> {
        let deadline = Instant::now() + due;
        let id = {
            let mut queue = self.shared.queue.lock();
            let id = queue.next_id;
            queue.next_id += 1;
            queue.entries.insert(id, Entry { deadline, callback });
            queue.deadlines.push(Reverse((deadline, id)));
            id
        };
        self.shared.wakeup.notify_one();
        Box::new(ThreadTimer {
            shared: self.shared.clone(),
            id,
        })
    }
}

struct ThreadTimer {
    shared: Arc<Shared>,
    id: u64,
}

impl Timer for ThreadTimer {
    fn change(&self, due: Duration) -> bool {
        let deadline = Instant::now() + due;
        {
            let mut queue = self.shared.queue.lock();
            let Some(entry) = queue.entries.get_mut(&self.id) else {
                return false;
            };
            entry.deadline = deadline;
            queue.deadlines.push(Reverse((deadline, self.id)));
        }
        self.shared.wakeup.notify_one();
        true
    }

    fn cancel(&self) -> bool {
        let removed = self.shared.queue.lock().entries.remove(&self.id);
        removed.is_some()
    }
}

fn run(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return;
        }
        let next = queue.deadlines.peek().map(|Reverse(next)| *next);
        let Some((deadline, id)) = next else {
            shared.wakeup.wait(&mut queue);
            continue;
        };
        if queue.entries.get(&id).map(|entry| entry.deadline) != Some(deadline) {
            queue.deadlines.pop();
            continue;
        }
        if deadline > Instant::now() {
            shared.wakeup.wait_until(&mut queue, deadline);
            continue;
        }

        queue.deadlines.pop();
        if let Some(entry) = queue.entries.remove(&id) {
            MutexGuard::unlocked(&mut queue, || fire(id, entry.callback));
        }
    }
}

fn fire(id: u64, callback: TimerCallback) {
    tracing::trace!(id, "timer fired");
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        tracing::error!(id, "timer callback panicked");
    }
}
