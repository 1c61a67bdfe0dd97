//! Pool lifecycle state helpers.
//!
//! The pool packs its admission gate and in-flight task count into one
//! atomic word so the shutdown handshake has no window between "check the
//! gate" and "bump the count":
//!
//! ```text
//! State = (in_flight_count << 1) | accepting_bit
//!
//!        63                              1   0
//!       ┌─────────────────────────────┬─────┐
//!       │      in_flight_count        │ A   │
//!       └─────────────────────────────┴─────┘
//!                                       │
//!                                       └── accepting bit (1=open, 0=closed)
//! ```
//!
//! A naive split into two atomics races: a submitter can pass the gate
//! check, lose the CPU, and bump the count after `join` already observed
//! zero. The CAS in [`try_admit`] closes that window.

use std::sync::atomic::{AtomicUsize, Ordering};

/// LSB in the combined state: 1 while the pool accepts submissions.
pub(crate) const ACCEPTING_BIT: usize = 1;
/// Count unit for the combined state (count stored in bits 1+).
pub(crate) const COUNT_UNIT: usize = 2;

/// Extract the in-flight count from the combined state word.
#[inline(always)]
pub(crate) fn in_flight(state: usize) -> usize {
    state >> 1
}

/// Whether the pool is accepting submissions.
#[inline(always)]
pub(crate) fn is_accepting(state: usize) -> bool {
    (state & ACCEPTING_BIT) != 0
}

/// Clear the accepting bit and return the previous state word.
#[inline(always)]
pub(crate) fn close_gate(state: &AtomicUsize) -> usize {
    state.fetch_and(!ACCEPTING_BIT, Ordering::AcqRel)
}

/// Atomically check the gate and bump the in-flight count.
///
/// `Err(())` means the gate was closed; the count is untouched.
#[inline]
pub(crate) fn try_admit(state: &AtomicUsize) -> Result<(), ()> {
    let mut s = state.load(Ordering::Acquire);
    loop {
        if !is_accepting(s) {
            return Err(());
        }
        match state.compare_exchange_weak(
            s,
            s.wrapping_add(COUNT_UNIT),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return Ok(()),
            Err(actual) => s = actual,
        }
    }
}

/// Decrement the in-flight count, returning the previous state word.
#[inline(always)]
pub(crate) fn decrement_count(state: &AtomicUsize) -> usize {
    state.fetch_sub(COUNT_UNIT, Ordering::AcqRel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_then_close() {
        let state = AtomicUsize::new(ACCEPTING_BIT);
        assert!(try_admit(&state).is_ok());
        assert!(try_admit(&state).is_ok());
        assert_eq!(in_flight(state.load(Ordering::Acquire)), 2);

        let prev = close_gate(&state);
        assert!(is_accepting(prev));
        assert_eq!(in_flight(prev), 2);
        assert!(try_admit(&state).is_err());
        assert_eq!(in_flight(state.load(Ordering::Acquire)), 2);
    }

    #[test]
    fn decrement_reports_previous() {
        let state = AtomicUsize::new(ACCEPTING_BIT);
        try_admit(&state).unwrap();
        let prev = decrement_count(&state);
        assert_eq!(in_flight(prev), 1);
        assert_eq!(in_flight(state.load(Ordering::Acquire)), 0);
    }
}
