//! Deferral of promise continuations to a later turn.
//!
//! A [`TaskQueue`] runs nothing until it is ticked, which makes ordering
//! observable in tests. A [`ThreadScheduler`] runs jobs on a dedicated worker
//! thread fed by a channel.
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::warn;

use crate::value::panic_message;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs a job on a later turn, never inside the `schedule` call itself.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, job: Job);
}

/// A FIFO of jobs that only runs when ticked. Clones share the queue.
///
/// Queued jobs hold the promises they settle, and those promises hold the
/// queue. Jobs that never run are only freed by [`TaskQueue::clear`] or by
/// draining the queue.
///
/// # Examples
///
/// ```
/// use promise_aplus::{Function, Realm, TaskQueue, Value};
///
/// let queue = TaskQueue::new();
/// let realm = Realm::builder().scheduler(queue.clone()).build();
/// let doubled = realm
///     .resolve(Value::from(2))
///     .then(Function::unary(|v| Ok(Value::from(v.as_number().unwrap_or(0.0) * 2.0))), ());
/// assert_eq!(doubled.outcome(), None);
/// queue.run_until_idle();
/// assert_eq!(doubled.outcome(), Some(Ok(Value::from(4))));
/// ```
#[derive(Clone, Default)]
pub struct TaskQueue {
    jobs: Arc<Mutex<VecDeque<Job>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the oldest job. Returns `false` when the queue was empty.
    pub fn tick(&self) -> bool {
        let job = self.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Ticks until empty, including jobs queued along the way. Returns the
    /// number of jobs run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.tick() {
            ran += 1;
        }
        ran
    }

    /// Drops every queued job without running it. Returns how many were
    /// dropped.
    pub fn clear(&self) -> usize {
        let jobs = std::mem::take(&mut *self.lock());
        jobs.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for TaskQueue {
    fn schedule(&self, job: Job) {
        self.lock().push_back(job);
    }
}

/// Runs jobs in FIFO order on its own worker thread.
///
/// Dropping the scheduler closes the channel; the worker finishes the queued
/// jobs and exits.
pub struct ThreadScheduler {
    sender: Mutex<Option<Sender<Job>>>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        let (tx, rx) = channel::<Job>();
        let worker = thread::spawn(move || {
            for job in rx {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                    warn!(panic = %panic_message(panic.as_ref()), "scheduled job panicked");
                }
            }
        });
        Self {
            sender: Mutex::new(Some(tx)),
            worker: Some(worker),
        }
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, job: Job) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let delivered = sender.as_ref().is_some_and(|tx| tx.send(job).is_ok());
        if !delivered {
            warn!("scheduler worker is gone; dropping job");
        }
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = self.worker.take() {
            // The last handle may be released by a job on the worker itself.
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!("scheduler worker panicked");
            }
        }
    }
}
