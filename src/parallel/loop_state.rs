//! Shared loop coordination state and the per-iteration view of it.
//!
//! One [`LoopFlags`] exists per `for_each` call. Workers never see it
//! directly; each iteration gets a [`LoopState`] scoped to its claimed
//! index. The flags are monotonic: once raised they stay raised, so
//! workers may poll them with relaxed timing and still converge.

use std::any::Any;
use std::fmt;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Sentinel for "no break recorded". Break indices are claim indices, which
/// are dense from 0, so the maximum is unreachable in practice.
const NO_BREAK: u64 = u64::MAX;

/// Cross-worker loop flags.
///
/// # Invariants
///
/// - `stopped` and `exceptional` are monotonic (set-once).
/// - `lowest_break` only decreases (`fetch_min`), starting at the sentinel.
/// - The panic slot holds at most the first captured payload; later
///   payloads are discarded.
pub(crate) struct LoopFlags {
    stopped: AtomicBool,
    exceptional: AtomicBool,
    lowest_break: AtomicU64,
    first_panic: Mutex<Option<Box<dyn Any + Send + 'static>>>,
}

impl LoopFlags {
    pub(crate) fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            exceptional: AtomicBool::new(false),
            lowest_break: AtomicU64::new(NO_BREAK),
            first_panic: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_exceptional(&self) -> bool {
        self.exceptional.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn record_break(&self, index: u64) {
        assert!(index != NO_BREAK, "iteration index overflow");
        self.lowest_break.fetch_min(index, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn lowest_break(&self) -> Option<u64> {
        match self.lowest_break.load(Ordering::Acquire) {
            NO_BREAK => None,
            v => Some(v),
        }
    }

    /// Capture a body panic: raises `exceptional`, stores the payload only
    /// if the slot is still empty.
    pub(crate) fn record_panic(&self, payload: Box<dyn Any + Send + 'static>) {
        self.exceptional.store(true, Ordering::Release);
        let mut slot = self.first_panic.lock().expect("panic slot poisoned");
        if slot.is_none() {
            *slot = Some(payload);
        }
    }

    pub(crate) fn take_panic(&self) -> Option<Box<dyn Any + Send + 'static>> {
        self.first_panic.lock().expect("panic slot poisoned").take()
    }

    /// Loop-level exit check, evaluated against the *next* index to claim.
    /// True once no further iterations should start.
    #[inline]
    pub(crate) fn should_exit_all(&self, next_index: u64) -> bool {
        self.is_stopped()
            || self.is_exceptional()
            || self.lowest_break.load(Ordering::Acquire) <= next_index
    }
}

/// The coordination handle a loop body uses to signal early termination
/// and observe exit conditions. Scoped to one claimed iteration.
pub struct LoopState<'a> {
    flags: &'a LoopFlags,
    current_index: u64,
}

impl<'a> LoopState<'a> {
    pub(crate) fn new(flags: &'a LoopFlags, current_index: u64) -> Self {
        Self {
            flags,
            current_index,
        }
    }

    /// The iteration index this body invocation was claimed at. Indices
    /// are assigned in source order, dense from 0.
    #[inline]
    pub fn current_index(&self) -> u64 {
        self.current_index
    }

    /// Request that no further iterations start, regardless of index.
    /// Iterations already in flight may finish or exit early.
    pub fn stop(&self) {
        self.flags.stop();
    }

    /// Request that iterations at or beyond this one's index be skipped.
    /// Iterations below the final lowest break index still run.
    ///
    /// Named for the `Break` operation; `break` itself is a reserved word.
    pub fn break_iteration(&self) {
        self.flags.record_break(self.current_index);
    }

    /// Whether any body called [`LoopState::stop`].
    pub fn is_stopped(&self) -> bool {
        self.flags.is_stopped()
    }

    /// Whether any body invocation panicked.
    pub fn is_exceptional(&self) -> bool {
        self.flags.is_exceptional()
    }

    /// The minimum index across all [`LoopState::break_iteration`] calls
    /// observed so far, if any.
    pub fn lowest_break_iteration(&self) -> Option<u64> {
        self.flags.lowest_break()
    }

    /// Whether this iteration should cooperatively abandon its work:
    /// a stop was requested, a body panicked, or a break was recorded at
    /// or below this iteration's index.
    pub fn should_exit_current_iteration(&self) -> bool {
        self.flags.is_stopped()
            || self.flags.is_exceptional()
            || self
                .flags
                .lowest_break()
                .is_some_and(|b| b <= self.current_index)
    }
}

impl fmt::Debug for LoopState<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopState")
            .field("current_index", &self.current_index)
            .field("is_stopped", &self.is_stopped())
            .field("is_exceptional", &self.is_exceptional())
            .field("lowest_break_iteration", &self.lowest_break_iteration())
            .finish()
    }
}

/// Outcome of a completed (joined) parallel loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopResult {
    /// True only when the source was exhausted with no stop, no break, and
    /// no body panic.
    pub is_completed: bool,

    /// The final lowest break index, if any body broke.
    pub lowest_break_iteration: Option<u64>,
}

/// Wrapper raised from `for_each` when any body invocation panicked.
///
/// Carries exactly the first captured payload; the identity of the inner
/// value is preserved and observable via [`AggregateError::downcast_ref`]
/// or [`AggregateError::into_inner`].
pub struct AggregateError {
    inner: Box<dyn Any + Send + 'static>,
}

impl AggregateError {
    pub(crate) fn new(inner: Box<dyn Any + Send + 'static>) -> Self {
        Self { inner }
    }

    /// The captured panic payload.
    pub fn into_inner(self) -> Box<dyn Any + Send + 'static> {
        self.inner
    }

    /// Borrow the payload as a concrete type, if it is one.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Re-raise the captured panic on the calling thread.
    pub fn resume(self) -> ! {
        panic::resume_unwind(self.inner)
    }

    fn payload_str(&self) -> Option<&str> {
        if let Some(s) = self.inner.downcast_ref::<&'static str>() {
            Some(s)
        } else {
            self.inner.downcast_ref::<String>().map(String::as_str)
        }
    }
}

impl fmt::Debug for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateError")
            .field("inner", &self.payload_str().unwrap_or("<non-string payload>"))
            .finish()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload_str() {
            Some(msg) => write!(f, "parallel loop body panicked: {msg}"),
            None => f.write_str("parallel loop body panicked"),
        }
    }
}

impl std::error::Error for AggregateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_truth_table() {
        // (stopped, exceptional, break_at, index) -> expected
        let cases = [
            (false, false, None, 5, false),
            (true, false, None, 5, true),
            (false, true, None, 5, true),
            (false, false, Some(5), 5, true),
            (false, false, Some(5), 6, true),
            (false, false, Some(5), 4, false),
            (true, true, Some(0), 0, true),
        ];

        for (stopped, exceptional, break_at, index, expected) in cases {
            let flags = LoopFlags::new();
            if stopped {
                flags.stop();
            }
            if exceptional {
                flags.record_panic(Box::new("boom"));
            }
            if let Some(b) = break_at {
                flags.record_break(b);
            }
            let state = LoopState::new(&flags, index);
            assert_eq!(
                state.should_exit_current_iteration(),
                expected,
                "stopped={stopped} exceptional={exceptional} break={break_at:?} index={index}"
            );
        }
    }

    #[test]
    fn lowest_break_is_minimum() {
        let flags = LoopFlags::new();
        assert_eq!(flags.lowest_break(), None);
        flags.record_break(7);
        flags.record_break(5);
        flags.record_break(6);
        assert_eq!(flags.lowest_break(), Some(5));
    }

    #[test]
    fn loop_level_exit_respects_break_boundary() {
        let flags = LoopFlags::new();
        flags.record_break(3);
        assert!(!flags.should_exit_all(2), "indices below break still claim");
        assert!(flags.should_exit_all(3));
        assert!(flags.should_exit_all(4));
    }

    #[test]
    fn first_panic_wins() {
        let flags = LoopFlags::new();
        flags.record_panic(Box::new("first"));
        flags.record_panic(Box::new("second"));
        assert!(flags.is_exceptional());

        let payload = flags.take_panic().unwrap();
        assert_eq!(*payload.downcast_ref::<&str>().unwrap(), "first");
        assert!(flags.take_panic().is_none());
    }

    #[test]
    fn aggregate_preserves_payload_identity() {
        #[derive(Debug, PartialEq)]
        struct Token(u32);

        let err = AggregateError::new(Box::new(Token(42)));
        assert_eq!(err.downcast_ref::<Token>(), Some(&Token(42)));
        let inner = err.into_inner();
        assert_eq!(inner.downcast_ref::<Token>(), Some(&Token(42)));
    }

    #[test]
    fn aggregate_display_includes_string_payloads() {
        let err = AggregateError::new(Box::new(String::from("bad item")));
        assert_eq!(err.to_string(), "parallel loop body panicked: bad item");

        let opaque = AggregateError::new(Box::new(17u32));
        assert_eq!(opaque.to_string(), "parallel loop body panicked");
    }

    #[test]
    fn stop_and_break_may_coexist() {
        let flags = LoopFlags::new();
        flags.record_break(4);
        flags.stop();
        assert!(flags.is_stopped());
        assert_eq!(flags.lowest_break(), Some(4));
    }
}
