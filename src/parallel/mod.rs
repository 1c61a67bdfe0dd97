//! Parallel-for engine with cooperative cancellation.
//!
//! # Overview
//!
//! [`ParallelLoop`] fans a data-parallel loop body over a finite source
//! onto a pluggable executor:
//!
//! - bounded parallelism with lazy, incremental worker submission;
//! - cooperative cancellation via [`LoopState::stop`] and
//!   [`LoopState::break_iteration`];
//! - per-worker locals threaded through the body, with init/finally hooks
//!   at worker boundaries;
//! - first-panic capture, re-raised as an [`AggregateError`] after all
//!   workers have joined.
//!
//! Cancellation is cooperative: there is no preemption. A body that never
//! checks [`LoopState::should_exit_current_iteration`] runs to its natural
//! end; the engine only refuses to *claim* further iterations.
//!
//! # Module map
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`for_each`] | The engine: cursor, worker fan-out, join, result |
//! | [`loop_state`] | Shared flags, the per-iteration view, outcomes |

pub mod for_each;
pub mod loop_state;

pub use for_each::{ParallelLoop, ParallelOptions};
pub use loop_state::{AggregateError, LoopResult, LoopState};
