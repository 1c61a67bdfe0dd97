//! The parallel-for engine.
//!
//! # Execution protocol
//!
//! ```text
//!   caller ──► for_each ──► shared cursor (leaf mutex over the source)
//!                │                │ claim (item, index)
//!                │                ▼
//!                │         ┌─────────────────────────────────────────┐
//!                │         │ driver (worker 0, runs inline)          │
//!                │         │ worker 1..n (submitted to the executor) │
//!                │         └─────────────────────────────────────────┘
//!                │                │ each claim may submit one more
//!                │                │ worker, up to the parallelism cap
//!                ▼                ▼
//!            wait-group ◄── clones counted by accepted submissions
//! ```
//!
//! Worker submission is lazy and incremental: nothing is submitted until
//! the driver claims its first item, and each successful claim funds at
//! most one additional worker. An executor rejection silently caps the
//! worker count; the loop proceeds with whatever it got. This is what
//! lets the engine adapt to pool core sizes and custom rejection policies
//! without configuration.
//!
//! # Locking
//!
//! The cursor mutex is a leaf: held only for the O(1) claim (plus the
//! user iterator's `next`), never across body invocations or executor
//! submission. The only other cross-worker state is the atomic flag set
//! in [`super::loop_state`].
//!
//! # Ordering guarantees
//!
//! None, except: indices are assigned in source order; every claimed
//! iteration completes, panics, or is skipped before `for_each` returns;
//! and all `local_finally` calls happen-before `for_each` returns.

use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::sync::WaitGroup;

use super::loop_state::{AggregateError, LoopFlags, LoopResult, LoopState};
use crate::executor::{Execute, Task};

/// Knobs for one `for_each` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParallelOptions {
    /// Ceiling on concurrent workers, the calling thread included.
    ///
    /// - `0`: unlimited by the caller; capped by the executor's
    ///   [`parallelism_hint`](Execute::parallelism_hint). With a hint-less
    ///   executor this admits one worker per claimed element.
    /// - `1`: run serially on the calling thread with zero submissions.
    /// - `n > 1`: target `n` concurrent workers.
    pub max_parallelism: usize,
}

impl ParallelOptions {
    pub const fn new(max_parallelism: usize) -> Self {
        Self { max_parallelism }
    }
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Parallel-for engine over a pluggable [`Execute`] implementation.
///
/// The engine drives a finite source through a shared cursor, fanning the
/// body over executor workers with the calling thread participating as
/// worker 0. See the module docs for the protocol.
pub struct ParallelLoop<E: ?Sized> {
    /// Observed degree of parallelism of the most recent call: the minimum
    /// of the requested ceiling, accepted submissions + 1, and the
    /// executor's hint. Zero until the first call.
    actual_parallelism: AtomicUsize,
    executor: Arc<E>,
}

impl<E: Execute + ?Sized + 'static> ParallelLoop<E> {
    pub fn new(executor: Arc<E>) -> Self {
        Self {
            actual_parallelism: AtomicUsize::new(0),
            executor,
        }
    }

    /// Degree of parallelism the most recent [`ParallelLoop::for_each`]
    /// actually achieved.
    pub fn actual_parallelism(&self) -> usize {
        self.actual_parallelism.load(Ordering::Acquire)
    }

    /// Run `body` over every element of `source`, in parallel.
    ///
    /// Returns the loop outcome, or an [`AggregateError`] carrying the
    /// first body panic after all workers have drained.
    pub fn for_each<I, F>(
        &self,
        source: I,
        options: ParallelOptions,
        body: F,
    ) -> Result<LoopResult, AggregateError>
    where
        I: IntoIterator,
        I::IntoIter: Send + 'static,
        I::Item: Send + 'static,
        F: Fn(I::Item, &LoopState<'_>) + Send + Sync + 'static,
    {
        self.for_each_init(
            source,
            options,
            || (),
            move |item, state: &LoopState<'_>, _local: &mut ()| body(item, state),
            |_local| (),
        )
    }

    /// Run `body` over every element of `source` with a per-worker local.
    ///
    /// `local_init` runs once per worker at worker start; the local is
    /// threaded through every body invocation on that worker by `&mut`;
    /// `local_finally` consumes it at worker exit and runs on every exit
    /// path, including after a captured body panic.
    pub fn for_each_init<I, L, Init, Body, Fin>(
        &self,
        source: I,
        options: ParallelOptions,
        local_init: Init,
        body: Body,
        local_finally: Fin,
    ) -> Result<LoopResult, AggregateError>
    where
        I: IntoIterator,
        I::IntoIter: Send + 'static,
        I::Item: Send + 'static,
        L: Send + 'static,
        Init: Fn() -> L + Send + Sync + 'static,
        Body: Fn(I::Item, &LoopState<'_>, &mut L) + Send + Sync + 'static,
        Fin: Fn(L) + Send + Sync + 'static,
    {
        let requested = options.max_parallelism;
        let hint = self.executor.parallelism_hint();
        let additional = additional_worker_budget(requested, hint);

        let shared = Arc::new(LoopShared {
            cursor: Mutex::new(SourceCursor {
                iter: source.into_iter(),
                next_index: 0,
                exhausted: false,
            }),
            flags: LoopFlags::new(),
            budget: SpawnBudget {
                remaining: AtomicUsize::new(additional),
                accepted: AtomicUsize::new(0),
                rejected: AtomicBool::new(false),
            },
            executor: Arc::clone(&self.executor),
            local_init,
            body,
            local_finally,
            _local: PhantomData,
        });

        // The driver is worker 0: it runs the claim loop inline, funding
        // additional workers as it goes, then waits for the ones that were
        // accepted.
        let wg = WaitGroup::new();
        run_worker(&shared, &wg);
        wg.wait();

        let accepted = shared.budget.accepted.load(Ordering::Acquire);
        let mut actual = if requested == 0 { usize::MAX } else { requested };
        actual = actual.min(accepted + 1);
        if let Some(h) = hint {
            actual = actual.min(h.max(1));
        }
        self.actual_parallelism.store(actual, Ordering::Release);

        let exhausted = shared.cursor.lock().expect("cursor lock poisoned").exhausted;
        let stopped = shared.flags.is_stopped();
        let lowest_break = shared.flags.lowest_break();

        if let Some(payload) = shared.flags.take_panic() {
            return Err(AggregateError::new(payload));
        }

        Ok(LoopResult {
            is_completed: exhausted && !stopped && lowest_break.is_none(),
            lowest_break_iteration: lowest_break,
        })
    }
}

/// Workers the engine may submit beyond the driver.
fn additional_worker_budget(requested: usize, hint: Option<usize>) -> usize {
    let user = match requested {
        0 => usize::MAX,
        n => n,
    };
    let cap = match hint {
        Some(h) => user.min(h.max(1)),
        None => user,
    };
    cap - 1
}

struct SourceCursor<I> {
    iter: I,
    /// Next index to assign: monotonic, dense, starting at 0.
    next_index: u64,
    exhausted: bool,
}

struct SpawnBudget {
    /// Additional-worker slots left to fund.
    remaining: AtomicUsize,
    /// Submissions the executor accepted.
    accepted: AtomicUsize,
    /// Set on the first rejection; no further submissions are attempted.
    rejected: AtomicBool,
}

struct LoopShared<E: ?Sized, I, L, Init, Body, Fin> {
    cursor: Mutex<SourceCursor<I>>,
    flags: LoopFlags,
    budget: SpawnBudget,
    executor: Arc<E>,
    local_init: Init,
    body: Body,
    local_finally: Fin,
    _local: PhantomData<fn() -> L>,
}

impl<E, I, L, Init, Body, Fin> LoopShared<E, I, L, Init, Body, Fin>
where
    E: Execute + ?Sized + 'static,
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
    L: Send + 'static,
    Init: Fn() -> L + Send + Sync + 'static,
    Body: Fn(I::Item, &LoopState<'_>, &mut L) + Send + Sync + 'static,
    Fin: Fn(L) + Send + Sync + 'static,
{
    /// Claim the next (item, index) pair, or `None` when the loop is over
    /// (exhausted, stopped, exceptional, or broken at or below the next
    /// index). O(1) under the cursor lock, apart from the user iterator.
    fn claim(&self) -> Option<(I::Item, u64)> {
        let mut cursor = self.cursor.lock().expect("cursor lock poisoned");
        if cursor.exhausted || self.flags.should_exit_all(cursor.next_index) {
            return None;
        }
        // The iterator is user code: capture a panic from `next` like a
        // body panic, so the loop drains instead of poisoning the cursor.
        let next = panic::catch_unwind(AssertUnwindSafe(|| cursor.iter.next()));
        match next {
            Ok(Some(item)) => {
                let index = cursor.next_index;
                cursor.next_index += 1;
                Some((item, index))
            }
            Ok(None) => {
                cursor.exhausted = true;
                None
            }
            Err(payload) => {
                cursor.exhausted = true;
                drop(cursor);
                self.flags.record_panic(payload);
                None
            }
        }
    }
}

/// Fund one more worker if the budget allows and the executor has not
/// rejected. Called after each successful claim; never under the cursor
/// lock.
fn maybe_spawn_worker<E, I, L, Init, Body, Fin>(
    shared: &Arc<LoopShared<E, I, L, Init, Body, Fin>>,
    wg: &WaitGroup,
) where
    E: Execute + ?Sized + 'static,
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
    L: Send + 'static,
    Init: Fn() -> L + Send + Sync + 'static,
    Body: Fn(I::Item, &LoopState<'_>, &mut L) + Send + Sync + 'static,
    Fin: Fn(L) + Send + Sync + 'static,
{
    if shared.budget.rejected.load(Ordering::Acquire) {
        return;
    }
    let mut remaining = shared.budget.remaining.load(Ordering::Relaxed);
    loop {
        if remaining == 0 {
            return;
        }
        match shared.budget.remaining.compare_exchange_weak(
            remaining,
            remaining - 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(actual) => remaining = actual,
        }
    }

    let task_shared = Arc::clone(shared);
    let task_wg = wg.clone();
    let task: Task = Box::new(move || {
        run_worker(&task_shared, &task_wg);
    });
    match shared.executor.execute(task) {
        Ok(()) => {
            shared.budget.accepted.fetch_add(1, Ordering::AcqRel);
        }
        Err(returned) => {
            // Rejection is a cap, not a failure: stop funding and let the
            // existing workers finish the source.
            shared.budget.rejected.store(true, Ordering::Release);
            drop(returned);
        }
    }
}

/// One worker's lifetime: init the local, claim-and-run until the loop is
/// over, then hand the local to `local_finally` on every exit path.
fn run_worker<E, I, L, Init, Body, Fin>(
    shared: &Arc<LoopShared<E, I, L, Init, Body, Fin>>,
    wg: &WaitGroup,
) where
    E: Execute + ?Sized + 'static,
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
    L: Send + 'static,
    Init: Fn() -> L + Send + Sync + 'static,
    Body: Fn(I::Item, &LoopState<'_>, &mut L) + Send + Sync + 'static,
    Fin: Fn(L) + Send + Sync + 'static,
{
    let mut local = match panic::catch_unwind(AssertUnwindSafe(|| (shared.local_init)())) {
        Ok(local) => local,
        Err(payload) => {
            shared.flags.record_panic(payload);
            return;
        }
    };

    while let Some((item, index)) = shared.claim() {
        maybe_spawn_worker(shared, wg);

        let state = LoopState::new(&shared.flags, index);
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| (shared.body)(item, &state, &mut local)));
        if let Err(payload) = outcome {
            // First panic wins; the next claim on every worker observes
            // the exceptional flag and exits.
            shared.flags.record_panic(payload);
        }
    }

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (shared.local_finally)(local))) {
        shared.flags.record_panic(payload);
    }
}
