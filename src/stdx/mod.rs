//! Small, self-contained concurrency structures used across the library.
//!
//! # Scope
//! `stdx` hosts narrow building blocks that back the parallel engine. They
//! are tuned for predictable behavior under contention rather than
//! general-purpose ergonomics.
//!
//! # Design themes
//! - Fixed capacity chosen at construction; full/empty are reported as
//!   values, never as panics.
//! - Tight invariants enable `unsafe` fast paths (documented per type).
//! - Deterministic signaling so liveness never depends on broadcast.
//!
//! # Module map
//! - `blocking_queue`: optionally-bounded two-lock FIFO with blocking,
//!   timed, and non-blocking endpoints, bulk drain, and fail-fast snapshot
//!   iteration.
//!
//! # Safety
//! The queue uses `unsafe` internally and relies on invariants called out
//! in its module docs. Read those before extending the internals.

pub mod blocking_queue;

pub use blocking_queue::{BlockingQueue, ConcurrentModification, Iter, QueueSnapshot};
