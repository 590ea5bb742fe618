/*
 *   Copyright (c) 2025 R3BL LLC
 *   All rights reserved.
 *
 *   Licensed under the Apache License, Version 2.0 (the "License");
 *   you may not use this file except in compliance with the License.
 *   You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 *   Unless required by applicable law or agreed to in writing, software
 *   distributed under the License is distributed on an "AS IS" BASIS,
 *   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *   See the License for the specific language governing permissions and
 *   limitations under the License.
 */

//! Lock-free, bounded, array-backed ring-buffer queues.
//!
//! Grounded on `examples/original_source/src/rbq.h`: a reservation counter
//! per side plus a per-slot availability sequence, the same shape as
//! Dmitry Vyukov's bounded MPMC queue. Used for [`crate::runqueue`]'s
//! per-CPU global run queue and [`crate::chan::Channel`]'s backing
//! buffer. The timer heap (`crate::timer`) and the local run queue
//! (`crate::runqueue::LocalRunQueue`) are *not* built on this: both need
//! random-access removal (cancel-by-index, steal-half), which an
//! availability-sequence ring can't offer, so they use their own
//! array/intrusive-list representations instead.

pub mod ptr;

use std::{cell::UnsafeCell,
          collections::VecDeque,
          fmt,
          marker::PhantomData,
          mem::MaybeUninit,
          sync::atomic::{AtomicUsize, Ordering}};

pub use ptr::{Arity, Multi, Single};

struct Slot<T> {
    /// Sequence number gating this slot. A producer may write once
    /// `sequence == index`; a consumer may read once `sequence == index +
    /// 1`. Starts at the slot's own index, matching Vyukov's original
    /// design.
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded ring buffer queue, generic over producer/consumer arity.
///
/// Capacity is rounded up to a power of two so the index-to-slot mapping
/// is a mask instead of a modulo.
pub struct RingBuffer<T, P: Arity = Multi, C: Arity = Multi> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
    _producer: PhantomData<P>,
    _consumer: PhantomData<C>,
}

// SAFETY: `Slot<T>`'s `UnsafeCell` is only read/written while its
// `sequence` gate grants exclusive access to exactly one thread, which is
// the same contract `std::sync::mpsc` relies on; `T: Send` is sufficient,
// matching every other concurrent-queue crate in this ecosystem.
unsafe impl<T: Send, P: Arity, C: Arity> Send for RingBuffer<T, P, C> {}
unsafe impl<T: Send, P: Arity, C: Arity> Sync for RingBuffer<T, P, C> {}

impl<T, P: Arity, C: Arity> RingBuffer<T, P, C> {
    /// Builds a queue whose capacity is the next power of two `>=
    /// requested` (minimum 1, a true single-slot ring — `rendezvous`'s
    /// closest possible approximation of a zero-capacity handoff).
    #[must_use]
    pub fn with_capacity(requested: usize) -> Self {
        let capacity = requested.max(1).next_power_of_two();
        let slots = (0 .. capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
            _producer: PhantomData,
            _consumer: PhantomData,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize { self.mask + 1 }

    /// Attempts to push `value`. Returns `Err(value)` if the queue is
    /// full. Safe to call concurrently from any number of threads
    /// regardless of `P` — `P = Single` is a documentation-level
    /// contract enforced by the caller (e.g. "only the owning core ever
    /// pushes its own steal-back"), not a different code path.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            match diff.cmp(&0) {
                std::cmp::Ordering::Equal => {
                    match self.enqueue_pos.compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            // SAFETY: winning the CAS grants exclusive
                            // write access to this slot until `sequence`
                            // is published below.
                            unsafe { (*slot.value.get()).write(value) };
                            slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                            return Ok(());
                        }
                        Err(observed) => pos = observed,
                    }
                }
                std::cmp::Ordering::Less => return Err(value),
                std::cmp::Ordering::Greater => pos = self.enqueue_pos.load(Ordering::Relaxed),
            }
        }
    }

    /// Attempts to pop the oldest value. Returns `None` if the queue is
    /// empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos.wrapping_add(1)) as isize;
            match diff.cmp(&0) {
                std::cmp::Ordering::Equal => {
                    match self.dequeue_pos.compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            // SAFETY: winning the CAS grants exclusive
                            // read access to this slot; the slot's
                            // sequence is bumped to `pos + mask + 1`
                            // (i.e. ready for the next lap's producer)
                            // after the read.
                            let value = unsafe { (*slot.value.get()).assume_init_read() };
                            slot.sequence
                                .store(pos.wrapping_add(self.mask).wrapping_add(1), Ordering::Release);
                            return Some(value);
                        }
                        Err(observed) => pos = observed,
                    }
                }
                std::cmp::Ordering::Less => return None,
                std::cmp::Ordering::Greater => pos = self.dequeue_pos.load(Ordering::Relaxed),
            }
        }
    }

    /// Bulk push (`spec.md` §4.1's `pushm(n)`): moves as many of `values`'
    /// front items into the queue as fit, in order, stopping at the first
    /// full slot. Returns how many were moved; anything left over stays at
    /// the front of `values` for a later retry — mirroring [`RingBuffer::
    /// try_push`]'s "hand the rejected value back" contract rather than
    /// dropping it.
    pub fn try_pushm(&self, values: &mut VecDeque<T>) -> usize {
        let mut moved = 0;
        while let Some(value) = values.pop_front() {
            match self.try_push(value) {
                Ok(()) => moved += 1,
                Err(rejected) => {
                    values.push_front(rejected);
                    break;
                }
            }
        }
        moved
    }

    /// Bulk pop (`spec.md` §4.1's `popm(n)`): moves up to `n` items from
    /// the queue into `out`, in FIFO order. Returns how many were moved.
    pub fn try_popm(&self, n: usize, out: &mut VecDeque<T>) -> usize {
        let mut moved = 0;
        while moved < n {
            match self.try_pop() {
                Some(value) => {
                    out.push_back(value);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }

    /// Best-effort length; racy under concurrent access, useful only for
    /// metrics and `Debug`.
    pub fn len_hint(&self) -> usize {
        let head = self.dequeue_pos.load(Ordering::Relaxed);
        let tail = self.enqueue_pos.load(Ordering::Relaxed);
        tail.wrapping_sub(head).min(self.capacity())
    }

    pub fn is_empty_hint(&self) -> bool { self.len_hint() == 0 }
}

impl<T> RingBuffer<T, Multi, Multi> {
    /// Drains up to `n` items into `out`, returning how many were moved.
    /// Used by [`crate::sched`]'s load-shedding path, which needs to
    /// steal several items from a core's global queue at once rather than
    /// popping one at a time.
    pub fn drain_up_to(&self, n: usize, out: &mut Vec<T>) -> usize {
        let mut moved = 0;
        while moved < n {
            match self.try_pop() {
                Some(v) => {
                    out.push(v);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }
}

impl<T, P: Arity, C: Arity> fmt::Debug for RingBuffer<T, P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("producer", &P::NAME)
            .field("consumer", &C::NAME)
            .field("capacity", &self.capacity())
            .field("len_hint", &self.len_hint())
            .finish()
    }
}

impl<T, P: Arity, C: Arity> Drop for RingBuffer<T, P, C> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

/// The global run queue's backing store: any core may push a migrating
/// process, any core may steal from any other core's queue.
pub type MpMcQueue<T> = RingBuffer<T, Multi, Multi>;

/// A channel's backing store: any number of senders, any number of
/// receivers.
pub type ChannelQueue<T> = MpMcQueue<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_single_threaded() {
        let q: RingBuffer<u32> = RingBuffer::with_capacity(4);
        assert!(q.try_push(1).is_ok());
        assert!(q.try_push(2).is_ok());
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn rejects_push_when_full() {
        let q: RingBuffer<u32> = RingBuffer::with_capacity(2);
        assert!(q.try_push(1).is_ok());
        assert!(q.try_push(2).is_ok());
        assert_eq!(q.try_push(3), Err(3));
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let q: RingBuffer<u32> = RingBuffer::with_capacity(5);
        assert_eq!(q.capacity(), 8);
    }

    #[test]
    fn capacity_one_is_a_true_single_slot() {
        let q: RingBuffer<u32> = RingBuffer::with_capacity(1);
        assert_eq!(q.capacity(), 1);
        assert!(q.try_push(1).is_ok());
        assert_eq!(q.try_push(2), Err(2));
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), None);
        assert!(q.try_push(3).is_ok());
        assert_eq!(q.try_pop(), Some(3));
    }

    #[test]
    fn bulk_push_stops_at_first_full_slot_and_preserves_order() {
        let q: RingBuffer<u32> = RingBuffer::with_capacity(4);
        let mut values: VecDeque<u32> = (0 .. 6).collect();
        let moved = q.try_pushm(&mut values);
        assert_eq!(moved, 4);
        assert_eq!(values, VecDeque::from([4, 5]));
        assert_eq!(q.try_pop(), Some(0));
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn bulk_pop_stops_when_empty_and_preserves_order() {
        let q: RingBuffer<u32> = RingBuffer::with_capacity(8);
        for v in 0 .. 3 {
            q.try_push(v).unwrap();
        }
        let mut out = VecDeque::new();
        let moved = q.try_popm(10, &mut out);
        assert_eq!(moved, 3);
        assert_eq!(out, VecDeque::from([0, 1, 2]));
        assert_eq!(q.try_popm(10, &mut out), 0);
    }

    #[test]
    fn concurrent_producers_and_consumers_preserve_total_count() {
        use std::sync::Arc;
        let q: Arc<MpMcQueue<u64>> = Arc::new(RingBuffer::with_capacity(1024));
        let producers: Vec<_> = (0 .. 4)
            .map(|p| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0 .. 2000_u64 {
                        let v = p * 2000 + i;
                        while q.try_push(v).is_err() {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        let consumed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let consumers: Vec<_> = (0 .. 4)
            .map(|_| {
                let q = Arc::clone(&q);
                let consumed = Arc::clone(&consumed);
                std::thread::spawn(move || {
                    loop {
                        if q.try_pop().is_some() {
                            consumed.fetch_add(1, Ordering::Relaxed);
                        } else if consumed.load(Ordering::Relaxed) >= 8000 {
                            break;
                        } else {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        for c in consumers {
            c.join().unwrap();
        }
        assert_eq!(consumed.load(Ordering::Relaxed), 8000);
    }
}
