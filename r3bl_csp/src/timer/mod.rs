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

//! A per-CPU timer heap with token-based cancellation.
//!
//! Grounded on `examples/original_source/src/timer.h`: an array-backed
//! binary min-heap ordered by fire time, where every entry also tracks
//! its own current index inside the heap array (so cancellation doesn't
//! need a linear scan) and a monotonically increasing token (so
//! cancellation racing with the monitor thread popping the same timer is
//! resolved by a single compare-and-swap rather than a lock).
//!
//! One heap lives on each CPU (`crate::core_::Core`); a timer is always
//! armed and polled from the CPU that owns the waiting process, so the
//! heap itself needs no cross-CPU synchronization beyond the token in
//! [`crate::process::TimerSlot`], which [`crate::sched::timer_cancel`]
//! may touch from another core.

use std::sync::atomic::Ordering;

use crate::process::Process;

/// Sentinel stored in [`crate::process::TimerSlot::heap_index`] when a
/// process has no timer armed, or once one has fired/been cancelled.
pub const NOT_ARMED: i64 = -1;

/// Nanosecond duration constants, grounded on
/// `examples/original_source/src/timer.h`'s unit macros — used when
/// computing deadlines for [`crate::runtime::Runtime::timer_after`] and
/// [`crate::sched::hangup`] callers.
pub const NANOSECOND: u64 = 1;
pub const MICROSECOND: u64 = 1_000 * NANOSECOND;
pub const MILLISECOND: u64 = 1_000 * MICROSECOND;
pub const SECOND: u64 = 1_000 * MILLISECOND;
pub const MINUTE: u64 = 60 * SECOND;
pub const HOUR: u64 = 60 * MINUTE;

/// A handle to a timer armed via [`crate::runtime::Runtime::timer_at`]/
/// [`crate::runtime::Runtime::timer_after`], needed to cancel it with
/// [`crate::runtime::Runtime::timer_cancel`] before it fires.
#[derive(Debug, Clone, Copy)]
pub struct TimerHandle {
    pub(crate) proc: *mut Process,
    pub(crate) token: i64,
    pub(crate) cpu_id: usize,
}

// SAFETY: a `TimerHandle` only ever reaches back into its own CPU's
// `TimerHeap` through `Runtime::timer_cancel`, which locks that heap
// before touching `proc`.
unsafe impl Send for TimerHandle {}
unsafe impl Sync for TimerHandle {}

/// A single CPU's timer heap.
pub struct TimerHeap {
    entries: Vec<*mut Process>,
}

// SAFETY: a `TimerHeap` is only ever touched by the one core that owns
// it (the monitor thread reads `deadline_ns`/`token` through atomics on
// `Process` itself, not through this structure).
unsafe impl Send for TimerHeap {}

impl Default for TimerHeap {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for TimerHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHeap").field("len", &self.entries.len()).finish()
    }
}

impl TimerHeap {
    #[must_use]
    pub const fn new() -> Self { Self { entries: Vec::new() } }

    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// The earliest armed deadline, if any — used by the monitor thread
    /// to size its next `epoll_wait` timeout.
    #[must_use]
    pub fn next_deadline_ns(&self) -> Option<i64> {
        self.entries.first().map(|&p| unsafe { (*p).timer.deadline_ns.load(Ordering::Relaxed) })
    }

    /// Arms `proc` to fire at `deadline_ns`, returning the cancellation
    /// token the caller must present to [`TimerHeap::cancel`].
    ///
    /// # Safety
    /// `proc` must not already have a timer armed on this heap.
    pub unsafe fn arm(&mut self, proc: *mut Process, deadline_ns: i64) -> i64 {
        let token = unsafe { (*proc).timer.token.fetch_add(1, Ordering::AcqRel) } + 1;
        unsafe {
            (*proc).timer.deadline_ns.store(deadline_ns, Ordering::Relaxed);
            (*proc).timer.token.store(token, Ordering::Release);
        }
        let idx = self.entries.len();
        self.entries.push(proc);
        unsafe { (*proc).timer.heap_index.store(idx as i64, Ordering::Relaxed) };
        self.sift_up(idx);
        token
    }

    /// Cancels `proc`'s armed timer if `token` still matches the one
    /// handed back by [`TimerHeap::arm`]. Returns `false` if the token is
    /// stale — meaning the timer already fired (or was already cancelled)
    /// — in which case the caller must not assume the process is still
    /// parked on it.
    pub fn cancel(&mut self, proc: *mut Process, token: i64) -> bool {
        unsafe {
            if (*proc)
                .timer
                .token
                .compare_exchange(token, token.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            let idx = (*proc).timer.heap_index.load(Ordering::Acquire);
            if idx < 0 {
                return false;
            }
            self.remove_at(idx as usize);
            (*proc).timer.heap_index.store(NOT_ARMED, Ordering::Release);
            true
        }
    }

    /// Pops the earliest timer if its deadline is `<= now_ns`.
    pub fn pop_ready(&mut self, now_ns: i64) -> Option<*mut Process> {
        let ready = match self.entries.first() {
            Some(&p) => unsafe { (*p).timer.deadline_ns.load(Ordering::Relaxed) } <= now_ns,
            None => false,
        };
        if !ready {
            return None;
        }
        let proc = self.remove_at(0);
        unsafe { (*proc).timer.heap_index.store(NOT_ARMED, Ordering::Release) };
        Some(proc)
    }

    fn remove_at(&mut self, idx: usize) -> *mut Process {
        let last = self.entries.len() - 1;
        self.entries.swap(idx, last);
        let proc = self.entries.pop().expect("remove_at called on a non-empty heap");
        if idx < self.entries.len() {
            unsafe { (*self.entries[idx]).timer.heap_index.store(idx as i64, Ordering::Relaxed) };
            self.sift_down(idx);
            self.sift_up(idx);
        }
        proc
    }

    fn deadline_at(&self, idx: usize) -> i64 {
        unsafe { (*self.entries[idx]).timer.deadline_ns.load(Ordering::Relaxed) }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        unsafe {
            (*self.entries[a]).timer.heap_index.store(a as i64, Ordering::Relaxed);
            (*self.entries[b]).timer.heap_index.store(b as i64, Ordering::Relaxed);
        }
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.deadline_at(idx) < self.deadline_at(parent) {
                self.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut smallest = idx;
            if left < len && self.deadline_at(left) < self.deadline_at(smallest) {
                smallest = left;
            }
            if right < len && self.deadline_at(right) < self.deadline_at(smallest) {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }
}

/// Monotonic nanosecond clock, grounded on
/// `examples/original_source/src/timer.h`'s use of `CLOCK_MONOTONIC`.
#[must_use]
pub fn now_ns() -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `CLOCK_MONOTONIC` is always supported on Linux; `ts` is a
    // valid out-pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &raw mut ts) };
    ts.tv_sec * 1_000_000_000 + ts.tv_nsec
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU8, AtomicUsize};

    use super::*;
    use crate::process::{ProcStat, TimerSlot};

    fn fake_process() -> *mut Process {
        Box::into_raw(Box::new(Process {
            rsp: 0,
            rbp: 0,
            mxcsr: 0,
            x87cw: 0,
            is_new: 1,
            regs: [0; 6],
            timer: TimerSlot::default(),
            name: "test",
            pid: 0,
            cpu_id: 0,
            stat: AtomicU8::new(ProcStat::Waiting as u8),
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
            parent: std::ptr::null_mut(),
            nchild: AtomicUsize::new(0),
            alloc_base: std::ptr::null_mut(),
            alloc_len: 0,
        }))
    }

    unsafe fn free(p: *mut Process) {
        drop(unsafe { Box::from_raw(p) });
    }

    #[test]
    fn pops_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let procs: Vec<_> = (0 .. 5).map(|_| fake_process()).collect();
        let deadlines = [50, 10, 40, 20, 30];
        for (&p, &d) in procs.iter().zip(&deadlines) {
            unsafe { heap.arm(p, d) };
        }
        let mut popped = Vec::new();
        while let Some(p) = heap.pop_ready(1000) {
            popped.push(unsafe { (*p).timer.deadline_ns.load(Ordering::Relaxed) });
        }
        assert_eq!(popped, vec![10, 20, 30, 40, 50]);
        for p in procs {
            unsafe { free(p) };
        }
    }

    #[test]
    fn not_ready_before_deadline() {
        let mut heap = TimerHeap::new();
        let p = fake_process();
        unsafe { heap.arm(p, 1000) };
        assert!(heap.pop_ready(500).is_none());
        assert!(heap.pop_ready(1000).is_some());
        unsafe { free(p) };
    }

    #[test]
    fn cancel_with_stale_token_fails() {
        let mut heap = TimerHeap::new();
        let p = fake_process();
        let token = unsafe { heap.arm(p, 1000) };
        assert!(heap.cancel(p, token));
        assert!(!heap.cancel(p, token), "second cancel with the same token must not succeed");
        unsafe { free(p) };
    }

    #[test]
    fn cancel_then_arm_again_works() {
        let mut heap = TimerHeap::new();
        let p = fake_process();
        let token1 = unsafe { heap.arm(p, 1000) };
        assert!(heap.cancel(p, token1));
        let token2 = unsafe { heap.arm(p, 2000) };
        assert_ne!(token1, token2);
        assert!(heap.pop_ready(2000).is_some());
        unsafe { free(p) };
    }
}
