//! Optionally-bounded blocking FIFO queue with two-lock concurrency.
//!
//! # Design
//!
//! A singly linked list of heap nodes with a permanent sentinel head. The
//! put side owns the tail pointer; the take side owns the sentinel. Each
//! side has its own mutex and condition variable, so producers and consumers
//! proceed fully concurrently:
//!
//! ```text
//!   producers ──► tail lock ──► last node          sentinel ◄── head lock ◄── consumers
//!                 not_full                              │       not_empty
//!                                                       ▼
//!                         sentinel ──► n1 ──► n2 ──► ... ──► last ──► null
//!                         (item = None; sentinel.next is the logical first element)
//! ```
//!
//! # Invariants
//!
//! - `0 <= count <= capacity` at all times.
//! - The queue is empty iff `sentinel.next` is null iff `tail == sentinel`.
//! - Under quiescence, `count` equals the number of nodes reachable from
//!   `sentinel.next`.
//! - Producers mutate only `tail` (and the old last node's `next`);
//!   consumers mutate only the sentinel. This isolation is what makes the
//!   two-lock discipline sound.
//! - Whole-structure operations (`remove`, `drain*`, `clear`, `contains`,
//!   `to_vec`, iteration, snapshot) acquire **both** locks, always put-then-
//!   take. The order is global and never inverted.
//!
//! # Signaling (cascading wakeup)
//!
//! A successful insert pulses `not_full` once when room remains, so each
//! producer wakes its successor instead of relying on broadcast; it pulses
//! `not_empty` only on the empty→non-empty transition, briefly acquiring the
//! take lock to do so. Extraction is symmetric. A timed waiter that gives up
//! re-pulses its own condition before returning, so a consumed signal is
//! never lost from the chain.
//!
//! # Ordering rationale
//!
//! `count` is an atomic updated without holding the peer's lock. An insert
//! links the node and then publishes with a `Release` increment; a consumer
//! observes `count > 0` with an `Acquire` load before dereferencing
//! `sentinel.next`. This establishes happens-before between the link write
//! and the first read of the node on the other side.
//!
//! # Safety
//!
//! Raw `NonNull` node pointers, with `unsafe` confined to operations that
//! hold the lock owning the touched end. Invariants are re-checked by
//! assertions on the mutation paths and by [`BlockingQueue::check_invariants`]
//! in debug builds.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Capacity sentinel for an effectively unbounded queue.
const UNBOUNDED: usize = usize::MAX;

/// Error yielded by a queue iterator that detected a structural mutation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ConcurrentModification;

impl fmt::Debug for ConcurrentModification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConcurrentModification")
    }
}

impl fmt::Display for ConcurrentModification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue structurally modified during iteration")
    }
}

impl std::error::Error for ConcurrentModification {}

/// Explicit persisted shape for queue snapshot/restore: the capacity plus
/// the items in FIFO order. Field order is part of the format.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QueueSnapshot<T> {
    pub capacity: usize,
    pub items: Vec<T>,
}

struct Node<T> {
    item: Option<T>,
    next: *mut Node<T>,
}

impl<T> Node<T> {
    fn boxed(item: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            item,
            next: ptr::null_mut(),
        }))
    }
}

/// Take side: the sentinel node. `sentinel.item` is always `None`;
/// `sentinel.next` is the logical first element.
struct HeadEnd<T> {
    sentinel: NonNull<Node<T>>,
}

/// Put side: the last node in the chain, or the sentinel when empty.
struct TailEnd<T> {
    last: NonNull<Node<T>>,
}

/// Optionally-bounded blocking FIFO queue.
///
/// Blocking (`put`/`take`), timed (`offer_timeout`/`poll_timeout`) and
/// non-blocking (`offer`/`poll`) variants share the same chain. All
/// operations are linearizable at the point their owning lock is held.
///
/// `Err(item)` from the offer family returns the rejected item to the
/// caller; full and timed-out are reported that way, never as panics.
pub struct BlockingQueue<T> {
    capacity: usize,

    /// Element count, updated without holding the peer's lock.
    count: CachePadded<AtomicUsize>,

    /// Structural version, bumped under either lock on every mutation.
    /// Iterators capture it at construction and fail fast on change.
    version: CachePadded<AtomicU64>,

    head: Mutex<HeadEnd<T>>,
    not_empty: Condvar,

    tail: Mutex<TailEnd<T>>,
    not_full: Condvar,
}

// SAFETY: the raw node pointers are only dereferenced while holding the
// mutex that owns the touched end (or both, for whole-structure ops), and
// items cross threads only as owned values. `T: Send` is therefore the only
// requirement for sharing the queue.
unsafe impl<T: Send> Send for BlockingQueue<T> {}
unsafe impl<T: Send> Sync for BlockingQueue<T> {}

impl<T> BlockingQueue<T> {
    /// Create a bounded queue.
    ///
    /// # Panics
    /// If `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");

        let sentinel = Node::<T>::boxed(None);
        // SAFETY: Box::into_raw never returns null.
        let sentinel = unsafe { NonNull::new_unchecked(sentinel) };

        Self {
            capacity,
            count: CachePadded::new(AtomicUsize::new(0)),
            version: CachePadded::new(AtomicU64::new(0)),
            head: Mutex::new(HeadEnd { sentinel }),
            not_empty: Condvar::new(),
            tail: Mutex::new(TailEnd { last: sentinel }),
            not_full: Condvar::new(),
        }
    }

    /// Create an effectively unbounded queue (capacity `usize::MAX`).
    pub fn unbounded() -> Self {
        Self::new(UNBOUNDED)
    }

    /// Number of elements currently in the queue.
    #[inline]
    pub fn len(&self) -> usize {
        let n = self.count.load(Ordering::Acquire);
        assert!(n <= self.capacity);
        n
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The fixed capacity supplied at construction.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many more elements fit right now. A snapshot; concurrent
    /// producers and consumers may change it immediately.
    #[inline]
    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.len()
    }

    // ------------------------------------------------------------------
    // Put side
    // ------------------------------------------------------------------

    /// Append `item`, blocking while the queue is full.
    pub fn put(&self, item: T) {
        // Allocate outside the lock; the critical section stays O(1).
        let node = Node::boxed(Some(item));

        let mut tail = self.tail.lock().expect("put lock poisoned");
        while self.count.load(Ordering::Acquire) == self.capacity {
            tail = self.not_full.wait(tail).expect("put lock poisoned");
        }
        let pre_insert = self.enqueue(&mut tail, node);
        if pre_insert + 1 < self.capacity {
            // Cascade: wake the next producer while room remains.
            self.not_full.notify_one();
        }
        drop(tail);

        if pre_insert == 0 {
            self.signal_not_empty();
        }
    }

    /// Append `item` if room is available, without blocking.
    ///
    /// Returns the item back as `Err` when the queue is full.
    pub fn offer(&self, item: T) -> Result<(), T> {
        if self.count.load(Ordering::Acquire) == self.capacity {
            return Err(item);
        }
        let node = Node::boxed(Some(item));

        let mut tail = self.tail.lock().expect("put lock poisoned");
        // Re-check under the lock: only consumers can change count in our
        // favor while we hold it, so a full reading here is authoritative.
        if self.count.load(Ordering::Acquire) == self.capacity {
            drop(tail);
            // SAFETY: the node was allocated above and never linked.
            let item = unsafe { Box::from_raw(node).item.take() };
            return Err(item.expect("unlinked node lost its item"));
        }
        let pre_insert = self.enqueue(&mut tail, node);
        if pre_insert + 1 < self.capacity {
            self.not_full.notify_one();
        }
        drop(tail);

        if pre_insert == 0 {
            self.signal_not_empty();
        }
        Ok(())
    }

    /// Append `item`, blocking up to `timeout` for room.
    ///
    /// The deadline is computed once on entry, so spurious wakeups do not
    /// extend the wait. Returns the item back as `Err` on timeout.
    pub fn offer_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let node = Node::boxed(Some(item));

        let mut tail = self.tail.lock().expect("put lock poisoned");
        while self.count.load(Ordering::Acquire) == self.capacity {
            let now = Instant::now();
            if now >= deadline {
                // Giving up may discard a pulse we consumed; pass it on so
                // the producer chain stays live.
                self.not_full.notify_one();
                drop(tail);
                // SAFETY: the node was allocated above and never linked.
                let item = unsafe { Box::from_raw(node).item.take() };
                return Err(item.expect("unlinked node lost its item"));
            }
            let (guard, _) = self
                .not_full
                .wait_timeout(tail, deadline - now)
                .expect("put lock poisoned");
            tail = guard;
        }
        let pre_insert = self.enqueue(&mut tail, node);
        if pre_insert + 1 < self.capacity {
            self.not_full.notify_one();
        }
        drop(tail);

        if pre_insert == 0 {
            self.signal_not_empty();
        }
        Ok(())
    }

    /// Link `node` after the current last node. Returns the pre-insert count.
    ///
    /// Caller holds the put lock and has verified `count < capacity`.
    fn enqueue(&self, tail: &mut TailEnd<T>, node: *mut Node<T>) -> usize {
        // SAFETY: we hold the put lock, which owns `last` and its `next`.
        unsafe {
            assert!(
                (*tail.last.as_ptr()).next.is_null(),
                "tail node has a successor"
            );
            (*tail.last.as_ptr()).next = node;
            tail.last = NonNull::new_unchecked(node);
        }
        self.version.fetch_add(1, Ordering::Release);
        let pre_insert = self.count.fetch_add(1, Ordering::AcqRel);
        assert!(pre_insert < self.capacity);
        pre_insert
    }

    // ------------------------------------------------------------------
    // Take side
    // ------------------------------------------------------------------

    /// Extract the head element, blocking while the queue is empty.
    pub fn take(&self) -> T {
        let mut head = self.head.lock().expect("take lock poisoned");
        while self.count.load(Ordering::Acquire) == 0 {
            head = self.not_empty.wait(head).expect("take lock poisoned");
        }
        let (item, pre_extract) = self.dequeue(&mut head);
        if pre_extract > 1 {
            // Cascade: more elements remain, wake the next consumer.
            self.not_empty.notify_one();
        }
        drop(head);

        if pre_extract == self.capacity {
            self.signal_not_full();
        }
        item
    }

    /// Extract the head element if one is present, without blocking.
    pub fn poll(&self) -> Option<T> {
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut head = self.head.lock().expect("take lock poisoned");
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let (item, pre_extract) = self.dequeue(&mut head);
        if pre_extract > 1 {
            self.not_empty.notify_one();
        }
        drop(head);

        if pre_extract == self.capacity {
            self.signal_not_full();
        }
        Some(item)
    }

    /// Extract the head element, blocking up to `timeout`.
    ///
    /// The deadline is computed once on entry. `None` on timeout.
    pub fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;

        let mut head = self.head.lock().expect("take lock poisoned");
        while self.count.load(Ordering::Acquire) == 0 {
            let now = Instant::now();
            if now >= deadline {
                // Same give-up discipline as the timed offer.
                self.not_empty.notify_one();
                return None;
            }
            let (guard, _) = self
                .not_empty
                .wait_timeout(head, deadline - now)
                .expect("take lock poisoned");
            head = guard;
        }
        let (item, pre_extract) = self.dequeue(&mut head);
        if pre_extract > 1 {
            self.not_empty.notify_one();
        }
        drop(head);

        if pre_extract == self.capacity {
            self.signal_not_full();
        }
        Some(item)
    }

    /// Clone the head element without removing it.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let head = self.head.lock().expect("take lock poisoned");
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        // SAFETY: take lock held; count > 0 observed with Acquire makes the
        // first node's link and item visible.
        unsafe {
            let first = (*head.sentinel.as_ptr()).next;
            assert!(!first.is_null(), "count > 0 but chain is empty");
            Some((*first).item.clone().expect("first node lost its item"))
        }
    }

    /// Unlink the first node. Returns the item and the pre-extract count.
    ///
    /// Caller holds the take lock and has verified `count > 0`.
    fn dequeue(&self, head: &mut HeadEnd<T>) -> (T, usize) {
        // SAFETY: we hold the take lock. `count > 0` was observed with
        // Acquire, so the producer's link write to `sentinel.next` is
        // visible. The old sentinel is unreachable afterwards and freed
        // here; the first node's item moves out and the node becomes the
        // new sentinel.
        let item = unsafe {
            let old_sentinel = head.sentinel.as_ptr();
            let first = (*old_sentinel).next;
            assert!(!first.is_null(), "count > 0 but chain is empty");
            let item = (*first).item.take().expect("first node lost its item");
            head.sentinel = NonNull::new_unchecked(first);
            drop(Box::from_raw(old_sentinel));
            item
        };
        self.version.fetch_add(1, Ordering::Release);
        let pre_extract = self.count.fetch_sub(1, Ordering::AcqRel);
        assert!(pre_extract > 0);
        (item, pre_extract)
    }

    // ------------------------------------------------------------------
    // Cross-lock signaling
    // ------------------------------------------------------------------

    /// Pulse `not_empty`. Never called while holding the put lock's peer;
    /// briefly acquires the take lock so the pulse cannot race a waiter
    /// between its count check and its wait.
    fn signal_not_empty(&self) {
        let _head = self.head.lock().expect("take lock poisoned");
        self.not_empty.notify_one();
    }

    /// Pulse `not_full`. Symmetric to [`Self::signal_not_empty`].
    fn signal_not_full(&self) {
        let _tail = self.tail.lock().expect("put lock poisoned");
        self.not_full.notify_one();
    }

    // ------------------------------------------------------------------
    // Whole-structure operations (both locks, put-then-take)
    // ------------------------------------------------------------------

    fn full_lock(&self) -> (MutexGuard<'_, TailEnd<T>>, MutexGuard<'_, HeadEnd<T>>) {
        let tail = self.tail.lock().expect("put lock poisoned");
        let head = self.head.lock().expect("take lock poisoned");
        (tail, head)
    }

    /// Remove the first element equal to `needle`. Returns whether one was
    /// removed.
    pub fn remove(&self, needle: &T) -> bool
    where
        T: PartialEq,
    {
        let (mut tail, head) = self.full_lock();

        // SAFETY: both locks held; the whole chain is ours.
        unsafe {
            let mut pred = head.sentinel.as_ptr();
            let mut cur = (*pred).next;
            while !cur.is_null() {
                if (*cur).item.as_ref() == Some(needle) {
                    self.unlink(&mut tail, pred, cur);
                    return true;
                }
                pred = cur;
                cur = (*cur).next;
            }
        }
        false
    }

    /// Unlink `node` (whose predecessor is `pred`) and free it.
    ///
    /// Caller holds both locks.
    unsafe fn unlink(&self, tail: &mut TailEnd<T>, pred: *mut Node<T>, node: *mut Node<T>) {
        (*pred).next = (*node).next;
        if tail.last.as_ptr() == node {
            tail.last = NonNull::new_unchecked(pred);
        }
        drop(Box::from_raw(node));

        self.version.fetch_add(1, Ordering::Release);
        let pre_remove = self.count.fetch_sub(1, Ordering::AcqRel);
        assert!(pre_remove > 0);
        if pre_remove == self.capacity {
            // Both locks are held, so signaling under the put lock is safe
            // and a blocked producer will see the new count on wake.
            self.not_full.notify_one();
        }
    }

    /// Whether any element equals `needle`.
    pub fn contains(&self, needle: &T) -> bool
    where
        T: PartialEq,
    {
        let (_tail, head) = self.full_lock();
        // SAFETY: both locks held.
        unsafe {
            let mut cur = (*head.sentinel.as_ptr()).next;
            while !cur.is_null() {
                if (*cur).item.as_ref() == Some(needle) {
                    return true;
                }
                cur = (*cur).next;
            }
        }
        false
    }

    /// Clone all elements into a `Vec` in FIFO order.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        let (_tail, head) = self.full_lock();
        let mut out = Vec::with_capacity(self.count.load(Ordering::Acquire));
        // SAFETY: both locks held.
        unsafe {
            let mut cur = (*head.sentinel.as_ptr()).next;
            while !cur.is_null() {
                out.push((*cur).item.clone().expect("linked node lost its item"));
                cur = (*cur).next;
            }
        }
        out
    }

    /// Drop every element.
    pub fn clear(&self) {
        let (mut tail, mut head) = self.full_lock();
        let chain = self.detach_chain(&mut tail, &mut head);
        // Nodes are freed while both locks are still held, keeping clear()
        // a single critical section.
        drop(chain);
    }

    /// Transfer every element to `sink`, returning how many were moved.
    ///
    /// The chain is detached in one critical section under both locks;
    /// `sink` then runs **outside all locks**, so it may freely touch the
    /// queue again (including re-offering).
    pub fn drain<F>(&self, mut sink: F) -> usize
    where
        F: FnMut(T),
    {
        let chain = {
            let (mut tail, mut head) = self.full_lock();
            self.detach_chain(&mut tail, &mut head)
        };
        let mut moved = 0;
        for item in chain {
            sink(item);
            moved += 1;
        }
        moved
    }

    /// Transfer up to `max` elements matching `pred` to `sink`, in FIFO
    /// order, returning how many were moved. Runs entirely under both
    /// locks; `sink` must not touch the queue.
    pub fn drain_with<P, F>(&self, max: usize, mut pred: P, mut sink: F) -> usize
    where
        P: FnMut(&T) -> bool,
        F: FnMut(T),
    {
        let (mut tail, head) = self.full_lock();
        let mut moved = 0;

        // SAFETY: both locks held for the whole walk.
        unsafe {
            let mut pred_node = head.sentinel.as_ptr();
            let mut cur = (*pred_node).next;
            while !cur.is_null() && moved < max {
                let next = (*cur).next;
                let matches = {
                    let item = (*cur).item.as_ref().expect("linked node lost its item");
                    pred(item)
                };
                if matches {
                    let item = (*cur).item.take().expect("linked node lost its item");
                    self.unlink(&mut tail, pred_node, cur);
                    sink(item);
                    moved += 1;
                    // pred_node is unchanged: its next now skips `cur`.
                    cur = next;
                } else {
                    pred_node = cur;
                    cur = next;
                }
            }
        }
        moved
    }

    /// Detach the whole chain, resetting the queue to empty. Caller holds
    /// both locks. The returned iterator owns the nodes and frees them as
    /// it goes (or on drop).
    fn detach_chain(
        &self,
        tail: &mut TailEnd<T>,
        head: &mut HeadEnd<T>,
    ) -> DetachedChain<T> {
        // SAFETY: both locks held; after this the chain is exclusively ours.
        let first = unsafe {
            let sentinel = head.sentinel.as_ptr();
            let first = (*sentinel).next;
            (*sentinel).next = ptr::null_mut();
            tail.last = head.sentinel;
            first
        };
        let detached = self.count.swap(0, Ordering::AcqRel);
        if detached > 0 {
            self.version.fetch_add(1, Ordering::Release);
            if detached == self.capacity {
                self.not_full.notify_one();
            }
        }
        DetachedChain { next: first }
    }

    // ------------------------------------------------------------------
    // Iteration and snapshots
    // ------------------------------------------------------------------

    /// Snapshot iterator over clones of the elements, head to tail.
    ///
    /// The iterator captures the structural version at construction. Every
    /// advance re-verifies it under both locks; if the queue was mutated,
    /// the iterator yields `Err(ConcurrentModification)` once and fuses.
    pub fn iter(&self) -> Iter<'_, T> {
        let (_tail, head) = self.full_lock();
        // SAFETY: both locks held while reading the first pointer.
        let first = unsafe { (*head.sentinel.as_ptr()).next };
        Iter {
            queue: self,
            expected_version: self.version.load(Ordering::Acquire),
            cursor: first,
            done: false,
        }
    }

    /// Capture the persisted shape: capacity plus items in FIFO order.
    pub fn snapshot(&self) -> QueueSnapshot<T>
    where
        T: Clone,
    {
        QueueSnapshot {
            capacity: self.capacity,
            items: self.to_vec(),
        }
    }

    /// Rebuild a queue from a snapshot.
    ///
    /// # Panics
    /// If the snapshot holds more items than its capacity, or capacity is 0.
    pub fn from_snapshot(snapshot: QueueSnapshot<T>) -> Self {
        assert!(
            snapshot.items.len() <= snapshot.capacity,
            "snapshot holds {} items but capacity is {}",
            snapshot.items.len(),
            snapshot.capacity
        );
        let queue = Self::new(snapshot.capacity);
        for item in snapshot.items {
            let mut tail = queue.tail.lock().expect("put lock poisoned");
            let node = Node::boxed(Some(item));
            queue.enqueue(&mut tail, node);
        }
        queue
    }

    /// Walk the chain and verify the structural invariants. Debug builds
    /// only; holds both locks for the duration.
    #[cfg(debug_assertions)]
    pub fn check_invariants(&self) {
        let (tail, head) = self.full_lock();
        let count = self.count.load(Ordering::Acquire);
        assert!(count <= self.capacity);

        // SAFETY: both locks held.
        unsafe {
            assert!(
                (*head.sentinel.as_ptr()).item.is_none(),
                "sentinel carries an item"
            );
            let mut reachable = 0usize;
            let mut last = head.sentinel.as_ptr();
            let mut cur = (*head.sentinel.as_ptr()).next;
            while !cur.is_null() {
                reachable += 1;
                assert!(reachable <= count, "more nodes than count");
                assert!((*cur).item.is_some(), "linked node lost its item");
                last = cur;
                cur = (*cur).next;
            }
            assert!(reachable == count, "count {count} but {reachable} reachable");
            assert!(tail.last.as_ptr() == last, "tail does not point at last node");
        }
    }
}

impl<T> Drop for BlockingQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: no locking needed.
        let sentinel = self
            .head
            .get_mut()
            .expect("take lock poisoned")
            .sentinel
            .as_ptr();
        let mut cur = sentinel;
        while !cur.is_null() {
            // SAFETY: every node in the chain (sentinel included) was
            // allocated by Node::boxed and is owned by the queue.
            let next = unsafe { (*cur).next };
            drop(unsafe { Box::from_raw(cur) });
            cur = next;
        }
    }
}

impl<T> fmt::Debug for BlockingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Owned, detached node chain. Frees nodes as it yields items; any
/// remainder is freed on drop, so a panicking sink cannot leak nodes.
struct DetachedChain<T> {
    next: *mut Node<T>,
}

// SAFETY: the chain is exclusively owned once detached.
unsafe impl<T: Send> Send for DetachedChain<T> {}

impl<T> Iterator for DetachedChain<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.next.is_null() {
            return None;
        }
        // SAFETY: we own every node in the detached chain.
        unsafe {
            let node = self.next;
            self.next = (*node).next;
            let item = (*node).item.take().expect("detached node lost its item");
            drop(Box::from_raw(node));
            Some(item)
        }
    }
}

impl<T> Drop for DetachedChain<T> {
    fn drop(&mut self) {
        for _ in self.by_ref() {}
    }
}

/// Fail-fast snapshot iterator. See [`BlockingQueue::iter`].
pub struct Iter<'a, T> {
    queue: &'a BlockingQueue<T>,
    expected_version: u64,
    /// Next node to visit. Never dereferenced before the version check
    /// confirms the structure (and therefore this pointer) is unchanged.
    cursor: *mut Node<T>,
    done: bool,
}

impl<T: Clone> Iterator for Iter<'_, T> {
    type Item = Result<T, ConcurrentModification>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cursor.is_null() {
            self.done = true;
            return None;
        }
        let (_tail, _head) = self.queue.full_lock();
        if self.queue.version.load(Ordering::Acquire) != self.expected_version {
            self.done = true;
            return Some(Err(ConcurrentModification));
        }
        // SAFETY: version unchanged under both locks means no structural
        // mutation happened since construction, so `cursor` still points at
        // a live node.
        unsafe {
            let item = (*self.cursor)
                .item
                .clone()
                .expect("linked node lost its item");
            self.cursor = (*self.cursor).next;
            Some(Ok(item))
        }
    }
}


#[cfg(all(test, feature = "stdx-proptest"))]
mod property_tests {
    use super::*;
    use crate::test_utils;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    const PROPTEST_CASES: u32 = 32;

    #[derive(Debug, Clone)]
    enum Op {
        Offer(u32),
        Poll,
        Remove(u32),
        Clear,
        Drain,
        DrainEven(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u32..16).prop_map(Op::Offer),
            4 => Just(Op::Poll),
            1 => (0u32..16).prop_map(Op::Remove),
            1 => Just(Op::Clear),
            1 => Just(Op::Drain),
            1 => (1usize..5).prop_map(Op::DrainEven),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(
            test_utils::proptest_cases(PROPTEST_CASES)
        ))]

        /// The queue matches a VecDeque shadow model under any op sequence.
        #[test]
        fn model(capacity in 1usize..9, ops in prop::collection::vec(op_strategy(), 1..200)) {
            let q = BlockingQueue::new(capacity);
            let mut shadow: VecDeque<u32> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Offer(v) => {
                        let accepted = q.offer(v).is_ok();
                        prop_assert_eq!(accepted, shadow.len() < capacity);
                        if accepted {
                            shadow.push_back(v);
                        }
                    }
                    Op::Poll => {
                        prop_assert_eq!(q.poll(), shadow.pop_front());
                    }
                    Op::Remove(v) => {
                        let removed = q.remove(&v);
                        let shadow_pos = shadow.iter().position(|&x| x == v);
                        prop_assert_eq!(removed, shadow_pos.is_some());
                        if let Some(pos) = shadow_pos {
                            shadow.remove(pos);
                        }
                    }
                    Op::Clear => {
                        q.clear();
                        shadow.clear();
                    }
                    Op::Drain => {
                        let mut out = Vec::new();
                        let moved = q.drain(|v| out.push(v));
                        prop_assert_eq!(moved, shadow.len());
                        prop_assert_eq!(out, shadow.iter().copied().collect::<Vec<_>>());
                        shadow.clear();
                    }
                    Op::DrainEven(max) => {
                        let mut out = Vec::new();
                        q.drain_with(max, |v| v % 2 == 0, |v| out.push(v));
                        let mut expect = Vec::new();
                        let mut kept = VecDeque::new();
                        for v in shadow.drain(..) {
                            if v % 2 == 0 && expect.len() < max {
                                expect.push(v);
                            } else {
                                kept.push_back(v);
                            }
                        }
                        shadow = kept;
                        prop_assert_eq!(out, expect);
                    }
                }

                prop_assert_eq!(q.len(), shadow.len());
                prop_assert_eq!(q.to_vec(), shadow.iter().copied().collect::<Vec<_>>());
                prop_assert!(q.len() <= q.capacity());
                #[cfg(debug_assertions)]
                q.check_invariants();
            }
        }

        /// FIFO order survives any interleaving of offers and polls.
        #[test]
        fn fifo(values in prop::collection::vec(any::<u32>(), 0..100)) {
            let q = BlockingQueue::unbounded();
            for &v in &values {
                q.offer(v).unwrap();
            }
            for &v in &values {
                prop_assert_eq!(q.poll(), Some(v));
            }
            prop_assert_eq!(q.poll(), None);
        }
    }
}
