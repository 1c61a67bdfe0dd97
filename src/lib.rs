//! General-purpose parallel execution primitives.
//!
//! Two tightly-coupled components form the core:
//! - A parallel-for engine ([`ParallelLoop`]) that fans a loop body over a
//!   user-supplied source onto a pluggable executor, with bounded
//!   parallelism, cooperative cancellation (stop and break), per-worker
//!   locals, and first-panic aggregation.
//! - A bounded blocking FIFO ([`BlockingQueue`]) with two-lock put/take
//!   concurrency, used both as the pool executor's work queue and as a
//!   standalone building block.
//!
//! High-level flow (one `for_each` call):
//! 1) The caller's thread becomes worker 0 and claims (item, index) pairs
//!    from a shared cursor.
//! 2) Each successful claim may fund one additional worker, submitted to
//!    the executor, up to the parallelism ceiling; rejections cap the
//!    fan-out silently.
//! 3) Bodies observe a [`LoopState`] to signal stop/break and poll exit
//!    conditions.
//! 4) The driver joins all accepted workers, then returns a [`LoopResult`]
//!    or an [`AggregateError`] carrying the first body panic.
//!
//! Executors implement the one-method [`Execute`] contract; two ship with
//! the crate: [`SpawnExecutor`] (thread per task) and [`PoolExecutor`]
//! (fixed workers over a bounded queue).

pub mod executor;
pub mod parallel;
pub mod stdx;
#[cfg(test)]
pub mod test_utils;

pub use executor::{
    CoreThreadFactory, Execute, PoolConfig, PoolExecutor, PoolMetrics, SpawnExecutor, Task,
    ThreadFactory,
};
pub use parallel::{AggregateError, LoopResult, LoopState, ParallelLoop, ParallelOptions};
pub use stdx::{BlockingQueue, ConcurrentModification, QueueSnapshot};
