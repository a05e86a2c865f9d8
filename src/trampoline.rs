//! Per-thread queue of ready-to-handle settlements.
//!
//! Settling a node whose waiter settles another node would otherwise recurse
//! once per link of a continuation chain. The first settlement on a thread
//! drains the queue in a loop; settlements that happen while it is draining
//! only enqueue.

use std::cell::RefCell;
use std::collections::VecDeque;

type Job = Box<dyn FnOnce()>;

#[derive(Default)]
struct HandleQueue {
    jobs: VecDeque<Job>,
    draining: bool,
}

thread_local! {
    static QUEUE: RefCell<HandleQueue> = RefCell::new(HandleQueue::default());
}

struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        QUEUE.with(|queue| queue.borrow_mut().draining = false);
    }
}

/// Runs `job` now if this thread is not already draining, otherwise queues it
/// behind the jobs that are already waiting.
pub(crate) fn schedule(job: impl FnOnce() + 'static) {
    let job: Job = Box::new(job);
    let first = QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        if queue.draining {
            queue.jobs.push_back(job);
            None
        } else {
            queue.draining = true;
            Some(job)
        }
    });

    let Some(first) = first else {
        return;
    };

    let _guard = DrainGuard;
    first();
    while let Some(next) = QUEUE.with(|queue| queue.borrow_mut().jobs.pop_front()) {
        next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn nested_jobs_run_after_the_current_one() {
        let log = Rc::new(RefCell::new(Vec::new()));

        let outer = log.clone();
        schedule(move || {
            outer.borrow_mut().push("outer start");
            let a = outer.clone();
            schedule(move || a.borrow_mut().push("first nested"));
            let b = outer.clone();
            schedule(move || b.borrow_mut().push("second nested"));
            outer.borrow_mut().push("outer end");
        });

        assert_eq!(
            *log.borrow(),
            ["outer start", "outer end", "first nested", "second nested"]
        );
    }

    #[test]
    fn deep_chains_do_not_recurse() {
        fn step(remaining: usize, count: Rc<RefCell<usize>>) {
            *count.borrow_mut() += 1;
            if remaining > 0 {
                schedule(move || step(remaining - 1, count));
            }
        }

        let count = Rc::new(RefCell::new(0));
        let counter = count.clone();
        schedule(move || step(200_000, counter));
        assert_eq!(*count.borrow(), 200_001);
    }
}
