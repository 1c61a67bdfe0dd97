//! Task submission contracts and executors.
//!
//! # Overview
//!
//! The parallel engine consumes exactly one capability: something that can
//! run a boxed task, or refuse it. [`Execute`] is that seam. Two concrete
//! executors ship with the library:
//!
//! | Executor | Strategy | Rejects when |
//! |----------|----------|--------------|
//! | [`SpawnExecutor`] | one OS thread per task | the OS refuses a thread |
//! | [`PoolExecutor`] | fixed workers over a bounded [`BlockingQueue`] | queue full or pool shut down |
//!
//! Rejection is a value, not a panic: `execute` hands the task back as
//! `Err(task)` so the caller can run it inline, retry, or drop it. The
//! engine converts rejection into a parallelism cap and keeps going.
//!
//! Synchronous execution inside `execute` is permitted by the contract and
//! exercised by the engine's tests; callers must not rely on asynchrony.
//!
//! [`BlockingQueue`]: crate::stdx::BlockingQueue

pub(crate) mod state;
pub mod thread_pool;

pub use thread_pool::{PoolConfig, PoolExecutor, PoolMetrics};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// A unit of work: no arguments, no result.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The one-method contract the parallel engine consumes.
pub trait Execute: Send + Sync {
    /// Run `task` eventually: on a fresh thread, a pooled thread, or
    /// synchronously on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns `Err(task)` when the submission is refused, handing the
    /// task back untouched.
    fn execute(&self, task: Task) -> Result<(), Task>;

    /// The executor's discoverable concurrency, if it has one.
    ///
    /// Pools report their worker count; thread-per-task executors report
    /// nothing. Consumers treat `None` as unlimited.
    fn parallelism_hint(&self) -> Option<usize> {
        None
    }
}

impl<E: Execute + ?Sized> Execute for Arc<E> {
    fn execute(&self, task: Task) -> Result<(), Task> {
        (**self).execute(task)
    }

    fn parallelism_hint(&self) -> Option<usize> {
        (**self).parallelism_hint()
    }
}

/// Produces named threads for executors that spawn them.
pub trait ThreadFactory: Send + Sync {
    /// Spawn a thread running `task`.
    ///
    /// # Errors
    ///
    /// Returns `Err(task)` when the OS refuses a thread, handing the task
    /// back untouched.
    fn spawn(&self, task: Task) -> Result<JoinHandle<()>, Task>;
}

/// Default thread factory: `thread::Builder` with `{prefix}-{seq}` names.
pub struct CoreThreadFactory {
    prefix: String,
    seq: AtomicUsize,
}

impl CoreThreadFactory {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            seq: AtomicUsize::new(0),
        }
    }
}

impl Default for CoreThreadFactory {
    fn default() -> Self {
        Self::new("parallel-worker")
    }
}

impl ThreadFactory for CoreThreadFactory {
    fn spawn(&self, task: Task) -> Result<JoinHandle<()>, Task> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", self.prefix, seq);

        // Builder::spawn consumes its closure even on failure, so the task
        // rides in a shared slot we can reclaim if the OS says no.
        let slot = Arc::new(Mutex::new(Some(task)));
        let theirs = Arc::clone(&slot);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            let task = theirs
                .lock()
                .expect("task slot poisoned")
                .take()
                .expect("task already taken");
            task();
        });

        match spawned {
            Ok(handle) => Ok(handle),
            Err(_) => {
                let task = slot
                    .lock()
                    .expect("task slot poisoned")
                    .take()
                    .expect("task lost on failed spawn");
                Err(task)
            }
        }
    }
}

/// Thread-per-task executor.
///
/// Every accepted task gets its own detached OS thread. No queueing, no
/// cap, no parallelism hint. Suitable for coarse tasks and tests; use
/// [`PoolExecutor`] when task admission should be bounded.
pub struct SpawnExecutor<F = CoreThreadFactory> {
    factory: F,
}

impl SpawnExecutor<CoreThreadFactory> {
    pub fn new() -> Self {
        Self {
            factory: CoreThreadFactory::default(),
        }
    }
}

impl Default for SpawnExecutor<CoreThreadFactory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ThreadFactory> SpawnExecutor<F> {
    /// Build over a custom thread factory.
    pub fn with_factory(factory: F) -> Self {
        Self { factory }
    }
}

impl<F: ThreadFactory> Execute for SpawnExecutor<F> {
    fn execute(&self, task: Task) -> Result<(), Task> {
        // The handle is dropped: spawn-executor threads are fire-and-forget,
        // callers that need completion tracking synchronize in the task.
        self.factory.spawn(task).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn spawn_executor_runs_task() {
        let ex = SpawnExecutor::new();
        let (tx, rx) = mpsc::channel();
        ex.execute(Box::new(move || {
            tx.send(42u32).unwrap();
        }))
        .ok()
        .expect("spawn executor refused a task");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn spawn_executor_has_no_hint() {
        let ex = SpawnExecutor::new();
        assert_eq!(ex.parallelism_hint(), None);
    }

    #[test]
    fn core_factory_names_threads() {
        let factory = CoreThreadFactory::new("test-pfx");
        let (tx, rx) = mpsc::channel();
        let handle = factory
            .spawn(Box::new(move || {
                let name = thread::current().name().map(String::from);
                tx.send(name).unwrap();
            }))
            .ok()
            .expect("factory refused a thread");
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("test-pfx-0"));
        handle.join().unwrap();
    }

    #[test]
    fn core_factory_sequences_names() {
        let factory = CoreThreadFactory::new("seq");
        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            let tx = tx.clone();
            factory
                .spawn(Box::new(move || {
                    tx.send(thread::current().name().map(String::from)).unwrap();
                }))
                .ok()
                .expect("factory refused a thread");
        }
        let mut names: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["seq-0", "seq-1", "seq-2"]);
    }

    #[test]
    fn arc_executor_delegates() {
        let ex: Arc<SpawnExecutor> = Arc::new(SpawnExecutor::new());
        let (tx, rx) = mpsc::channel();
        ex.execute(Box::new(move || tx.send(1u8).unwrap()))
            .ok()
            .expect("arc delegate refused a task");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    }
}
