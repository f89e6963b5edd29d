//! # Cooperative Task Queue
//!
//! The [`Scheduler`] is the explicit stand-in for a "next tick": any work a
//! stream wants to run *after* the current call stack has unwound is appended
//! here and executed later, strictly in FIFO order.
//!
//! ## Features
//!
//! * FIFO execution; tasks scheduled by a running task run after every task
//!   that was already queued
//! * Single consumer: a drain requested from inside a running task is a no-op,
//!   so a task can never overtake the one currently executing
//! * `Send` tasks behind a lock, so producers on other threads may enqueue work
//! * [`Scheduler::run_until`] drives the queue from an async context, waking
//!   whenever new work arrives
//!
//! ## Example
//!
//! ```rust
//! use runnel_io::Scheduler;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let scheduler = Scheduler::new();
//! let hits = Arc::new(AtomicUsize::new(0));
//! let counter = hits.clone();
//! scheduler.schedule(move || {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! assert_eq!(hits.load(Ordering::SeqCst), 0);
//! assert_eq!(scheduler.run_until_idle(), 1);
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//! ```

use crate::standard::locks::Mutex;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A cloneable handle to a FIFO of deferred tasks.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Default)]
struct SchedulerInner {
    queue: Mutex<VecDeque<Task>>,
    draining: AtomicBool,
    notify: Notify,
}

/// Clears the draining flag even if a task panics
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task to the back of the queue. The task runs on the next drain.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.inner.queue.lock().push_back(Box::new(task));
        self.inner.notify.notify_one();
    }

    /// Number of tasks waiting to run
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Runs at most one task. Returns false if nothing ran, either because the
    /// queue was empty or because a drain is already in progress up the stack.
    pub fn tick(&self) -> bool {
        let Some(_guard) = self.enter() else {
            return false;
        };

        let next = self.inner.queue.lock().pop_front();
        match next {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks until the queue is empty, including tasks scheduled along the
    /// way. Returns the number of tasks executed. Calling this from inside a
    /// running task returns 0 without running anything.
    pub fn run_until_idle(&self) -> usize {
        let Some(_guard) = self.enter() else {
            log::trace!(target: "runnel", "Nested drain request ignored");
            return 0;
        };

        let mut executed = 0;
        loop {
            // the lock must be released before the task runs, since tasks schedule more tasks
            let next = self.inner.queue.lock().pop_front();
            match next {
                Some(task) => {
                    task();
                    executed += 1;
                }
                None => return executed,
            }
        }
    }

    /// Drives the queue until `future` resolves. Between polls of `future` the
    /// queue is drained; when both are idle this waits for new work to be
    /// scheduled, possibly from another thread.
    pub async fn run_until<F: Future>(&self, future: F) -> F::Output {
        tokio::pin!(future);

        loop {
            let _ = self.run_until_idle();

            tokio::select! {
                biased;
                output = &mut future => return output,
                _ = self.inner.notify.notified() => {}
            }
        }
    }

    fn enter(&self) -> Option<DrainGuard<'_>> {
        if self.inner.draining.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(DrainGuard(&self.inner.draining))
        }
    }
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .field("draining", &self.inner.draining.load(Ordering::Acquire))
            .finish()
    }
}
