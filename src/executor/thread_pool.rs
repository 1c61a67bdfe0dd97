//! Fixed-size thread pool fed by a bounded blocking queue.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────────────┐
//!                 │                 PoolExecutor                 │
//!                 │                                              │
//!   execute() ────┼──► gate CAS ──► BlockingQueue<Task> ──┬─────┤
//!   (any thread)  │    (admit)         (bounded)          │      │
//!                 │                                       ▼      │
//!                 │              ┌──────────┬──────────┬───────┐ │
//!                 │              │ Worker 0 │ Worker 1 │  ...  │ │
//!                 │              │ poll loop│ poll loop│       │ │
//!                 │              └──────────┴──────────┴───────┘ │
//!                 │                                              │
//!                 │   Shared: state word, done flag, first panic │
//!                 └──────────────────────────────────────────────┘
//! ```
//!
//! The work queue is the bounded FIFO from [`crate::stdx`]: admission
//! control *is* the queue's capacity. A full queue rejects the submission
//! (`Err(task)`), which upstream consumers treat as backpressure rather
//! than failure.
//!
//! # Correctness invariants
//!
//! - **Work-conserving**: every admitted task runs before `join` returns,
//!   unless a task panic aborts the pool.
//! - **No lost shutdown**: the combined state word makes gate-close and
//!   count changes atomic with respect to each other (see the `state`
//!   module).
//! - **Panic isolation**: the first task panic is captured and re-raised
//!   from `join`; subsequent panics are discarded.
//!
//! # Shutdown protocol
//!
//! `join` closes the gate; the worker that completes the last in-flight
//! task (or `join` itself, if the pool was idle) raises the `done` flag.
//! Workers observe `done` within one poll interval and exit.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::state::{self, ACCEPTING_BIT};
use super::{CoreThreadFactory, Execute, Task, ThreadFactory};
use crate::stdx::BlockingQueue;

/// Pool configuration.
///
/// All defaults are conservative. Profile with your workload before tuning.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub workers: usize,

    /// Capacity of the task queue. Admission beyond this rejects.
    pub queue_capacity: usize,

    /// How long an idle worker blocks in one poll before re-checking the
    /// shutdown flag. Bounds shutdown latency; shorter costs more wakeups.
    pub poll_interval: Duration,
}

impl PoolConfig {
    /// Validate configuration. Panics on invalid values.
    pub fn validate(&self) {
        assert!(self.workers > 0, "workers must be > 0");
        assert!(self.queue_capacity > 0, "queue_capacity must be > 0");
        assert!(
            self.poll_interval > Duration::ZERO,
            "poll_interval must be > 0"
        );
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 1024,
            poll_interval: Duration::from_micros(200),
        }
    }
}

/// Aggregated pool counters returned by [`PoolExecutor::join`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Tasks that ran to completion (or panicked) on a worker.
    pub tasks_executed: u64,
    /// Worker thread count the pool was built with.
    pub workers: usize,
}

struct PoolShared {
    queue: BlockingQueue<Task>,

    /// Combined `(in_flight << 1) | accepting` word. In-flight counts both
    /// queued and currently-running tasks.
    state: AtomicUsize,

    /// Monotonic stop flag; once raised, workers exit their loop.
    done: AtomicBool,

    executed: AtomicU64,

    /// First panic captured from any task; re-raised by `join`.
    panic: Mutex<Option<Box<dyn Any + Send + 'static>>>,
}

impl PoolShared {
    fn initiate_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    fn record_panic(&self, payload: Box<dyn Any + Send + 'static>) {
        let mut slot = self.panic.lock().expect("panic slot poisoned");
        if slot.is_none() {
            *slot = Some(payload);
        }
        drop(slot);
        self.initiate_done();
    }
}

/// Fixed worker pool over a bounded blocking work queue.
///
/// # Lifecycle
///
/// 1. Build with [`PoolExecutor::new`] (workers start immediately).
/// 2. Submit via [`Execute::execute`]; a full queue or closed gate rejects.
/// 3. Call [`PoolExecutor::join`] to wait for completion and collect
///    metrics. Dropping without joining aborts: queued tasks are dropped
///    unrun.
pub struct PoolExecutor {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
    workers: usize,
}

impl PoolExecutor {
    /// Create and start a pool with default worker naming.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_factory(config, &CoreThreadFactory::new("pool-worker"))
    }

    /// Create and start a pool whose worker threads come from `factory`.
    ///
    /// # Panics
    /// If the factory refuses a worker thread during construction.
    pub fn with_factory(config: PoolConfig, factory: &dyn ThreadFactory) -> Self {
        config.validate();

        let shared = Arc::new(PoolShared {
            queue: BlockingQueue::new(config.queue_capacity),
            state: AtomicUsize::new(ACCEPTING_BIT),
            done: AtomicBool::new(false),
            executed: AtomicU64::new(0),
            panic: Mutex::new(None),
        });

        let mut threads = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            let shared = Arc::clone(&shared);
            let poll_interval = config.poll_interval;
            let handle = factory
                .spawn(Box::new(move || worker_loop(&shared, poll_interval)))
                .ok()
                .expect("failed to spawn pool worker");
            threads.push(handle);
        }

        Self {
            shared,
            threads,
            workers: config.workers,
        }
    }

    /// Stop accepting submissions, wait for all admitted work to finish,
    /// and return aggregated metrics.
    ///
    /// # Panics
    ///
    /// Re-raises the first task panic, after all workers have exited.
    pub fn join(mut self) -> PoolMetrics {
        let prev = state::close_gate(&self.shared.state);
        if state::in_flight(prev) == 0 {
            self.shared.initiate_done();
        }

        for handle in self.threads.drain(..) {
            if let Err(payload) = handle.join() {
                self.shared.record_panic(payload);
            }
        }

        // A panic-initiated shutdown can strand queued tasks; release
        // their resources deterministically rather than at executor drop.
        let _ = self.shared.queue.drain(drop);

        let payload = self.shared.panic.lock().expect("panic slot poisoned").take();
        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }

        PoolMetrics {
            tasks_executed: self.shared.executed.load(Ordering::Relaxed),
            workers: self.workers,
        }
    }
}

impl Execute for PoolExecutor {
    fn execute(&self, task: Task) -> Result<(), Task> {
        if state::try_admit(&self.shared.state).is_err() {
            return Err(task);
        }
        match self.shared.queue.offer(task) {
            Ok(()) => Ok(()),
            Err(task) => {
                // Undo the admission; if the gate closed meanwhile and we
                // were the last count holder, finish the shutdown we would
                // otherwise stall.
                let prev = state::decrement_count(&self.shared.state);
                if state::in_flight(prev) == 1 && !state::is_accepting(prev) {
                    self.shared.initiate_done();
                }
                Err(task)
            }
        }
    }

    fn parallelism_hint(&self) -> Option<usize> {
        Some(self.workers)
    }
}

impl Drop for PoolExecutor {
    fn drop(&mut self) {
        if self.threads.is_empty() {
            // Already joined.
            return;
        }
        state::close_gate(&self.shared.state);
        self.shared.initiate_done();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &PoolShared, poll_interval: Duration) {
    loop {
        if shared.done.load(Ordering::Acquire) {
            break;
        }
        match shared.queue.poll_timeout(poll_interval) {
            Some(task) => {
                let result = panic::catch_unwind(AssertUnwindSafe(task));
                shared.executed.fetch_add(1, Ordering::Relaxed);
                if let Err(payload) = result {
                    shared.record_panic(payload);
                }
                let prev = state::decrement_count(&shared.state);
                if state::in_flight(prev) == 1 && !state::is_accepting(prev) {
                    shared.initiate_done();
                }
            }
            None => {
                let s = shared.state.load(Ordering::Acquire);
                if state::in_flight(s) == 0 && !state::is_accepting(s) {
                    shared.initiate_done();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    fn test_config(workers: usize) -> PoolConfig {
        PoolConfig {
            workers,
            queue_capacity: 64,
            poll_interval: Duration::from_micros(100),
        }
    }

    #[test]
    fn pool_runs_all_tasks() {
        let counter = Arc::new(AtomicU64::new(0));
        let pool = PoolExecutor::new(test_config(4));

        let n = 1_000u64;
        for _ in 0..n {
            let c = Arc::clone(&counter);
            let mut task: Task = Box::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
            // Full queue is backpressure, not failure: retry until admitted.
            loop {
                match pool.execute(task) {
                    Ok(()) => break,
                    Err(returned) => {
                        task = returned;
                        thread::yield_now();
                    }
                }
            }
        }

        let metrics = pool.join();
        assert_eq!(counter.load(Ordering::Relaxed), n);
        assert_eq!(metrics.tasks_executed, n);
        assert_eq!(metrics.workers, 4);
    }

    #[test]
    fn join_idle_pool_returns_immediately() {
        let pool = PoolExecutor::new(test_config(2));
        let metrics = pool.join();
        assert_eq!(metrics.tasks_executed, 0);
    }

    #[test]
    fn full_queue_rejects() {
        let mut cfg = test_config(1);
        cfg.queue_capacity = 1;
        let pool = PoolExecutor::new(cfg);

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        // Occupy the single worker.
        pool.execute(Box::new(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }))
        .ok()
        .expect("first task rejected");
        started_rx.recv().unwrap();

        // Fill the queue behind it.
        pool.execute(Box::new(|| {})).ok().expect("filler rejected");

        // Queue full: third submission must bounce back.
        assert!(pool.execute(Box::new(|| {})).is_err());

        release_tx.send(()).unwrap();
        let metrics = pool.join();
        assert_eq!(metrics.tasks_executed, 2);
    }

    #[test]
    fn hint_reports_worker_count() {
        let pool = PoolExecutor::new(test_config(3));
        assert_eq!(pool.parallelism_hint(), Some(3));
        pool.join();
    }

    #[test]
    fn task_panic_propagates_on_join() {
        let pool = PoolExecutor::new(test_config(2));
        pool.execute(Box::new(|| panic!("intentional test panic")))
            .ok()
            .expect("task rejected");

        let joined = panic::catch_unwind(AssertUnwindSafe(|| pool.join()));
        assert!(joined.is_err(), "join must re-raise the task panic");
    }

    #[test]
    fn drop_without_join_does_not_hang() {
        let pool = PoolExecutor::new(test_config(2));
        pool.execute(Box::new(|| {})).ok().expect("task rejected");
        drop(pool);
    }

    /// Stress: every admitted task runs exactly once, across many
    /// submitter/worker interleavings.
    #[test]
    fn stress_no_admitted_task_lost() {
        for iteration in 0..50 {
            let counter = Arc::new(AtomicU64::new(0));
            let pool = Arc::new(PoolExecutor::new(test_config(4)));

            let submitter_pool = Arc::clone(&pool);
            let submitter_counter = Arc::clone(&counter);
            let submitter = thread::spawn(move || {
                let mut admitted = 0u64;
                for _ in 0..500 {
                    let c = Arc::clone(&submitter_counter);
                    let task: Task = Box::new(move || {
                        c.fetch_add(1, Ordering::Relaxed);
                    });
                    if submitter_pool.execute(task).is_ok() {
                        admitted += 1;
                    } else {
                        break;
                    }
                }
                admitted
            });

            if iteration % 2 == 0 {
                thread::yield_now();
            }

            let admitted = submitter.join().unwrap();
            let pool = Arc::try_unwrap(pool).ok().expect("pool still shared");
            let metrics = pool.join();

            assert_eq!(
                counter.load(Ordering::Relaxed),
                admitted,
                "iteration {iteration}: admitted {admitted} but executed {}",
                metrics.tasks_executed
            );
        }
    }
}
