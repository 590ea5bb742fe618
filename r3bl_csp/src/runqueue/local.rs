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

//! A core's own run queue: an intrusive doubly-linked list, touched only
//! by the core that owns it except when another core steals from it.
//!
//! Grounded on `examples/original_source/src/runq.c`: push and the common
//! pop both run in `O(1)` with no allocation (the links live inside
//! [`Process`] itself), and — the one quirk worth calling out — every
//! 32nd pop is deliberately made to act as a miss even when the queue is
//! non-empty. `spec.md` §4.3 keeps this: a core that only ever pops its
//! own queue would starve its global queue and any core trying to steal
//! from it, so periodically forcing a "miss" sends the core to check the
//! global queue and the steal path instead.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::process::Process;

/// Only the owning core ever calls these; nothing here is safe to call
/// concurrently from two threads except [`LocalRunQueue::steal_half`],
/// which the owner must synchronize externally (`spec.md` §4.3's
/// "steal" is always core-to-idle-core, serialized by the scheduler).
pub struct LocalRunQueue {
    head: *mut Process,
    tail: *mut Process,
    len: usize,
    /// Counts pops since the queue was created; `pop()` consults this to
    /// apply the every-32nd-pop miss rule.
    pop_count: AtomicU32,
}

// SAFETY: the owning core is the only thread that calls any method here
// except under the explicit cross-core contract documented per method.
unsafe impl Send for LocalRunQueue {}

impl Default for LocalRunQueue {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for LocalRunQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRunQueue").field("len", &self.len).finish()
    }
}

impl LocalRunQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
            tail: std::ptr::null_mut(),
            len: 0,
            pop_count: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize { self.len }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// Pushes `proc` onto the tail. `proc` must not currently be linked
    /// into any run queue.
    ///
    /// # Safety
    /// `proc` must be a valid, exclusively-owned pointer whose `prev`/
    /// `next` fields this queue may freely overwrite.
    pub unsafe fn push_back(&mut self, proc: *mut Process) {
        unsafe {
            (*proc).prev = self.tail;
            (*proc).next = std::ptr::null_mut();
        }
        if self.tail.is_null() {
            self.head = proc;
        } else {
            unsafe { (*self.tail).next = proc };
        }
        self.tail = proc;
        self.len += 1;
    }

    /// Pops the head, subject to the every-32nd-pop miss rule: on every
    /// call whose running pop count is a multiple of 32 (after
    /// incrementing), this returns `None` even if the queue is
    /// non-empty, forcing the caller (`crate::sched`) to check elsewhere
    /// first. The skipped head stays at the front and will be the next
    /// real pop.
    pub fn pop_front(&mut self) -> Option<*mut Process> {
        let count = self.pop_count.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if count & 0x1f == 0 {
            return None;
        }
        self.pop_front_unconditional()
    }

    /// Pops the head with no miss simulation; used by
    /// [`LocalRunQueue::pop_front`] internally and by the scheduler's
    /// direct "run what I just unparked" path.
    pub fn pop_front_unconditional(&mut self) -> Option<*mut Process> {
        if self.head.is_null() {
            return None;
        }
        let proc = self.head;
        // SAFETY: `proc` is non-null and was linked in by `push_back`,
        // which only ever stores pointers handed to it under the same
        // safety contract.
        let next = unsafe { (*proc).next };
        self.head = next;
        if next.is_null() {
            self.tail = std::ptr::null_mut();
        } else {
            unsafe { (*next).prev = std::ptr::null_mut() };
        }
        self.len -= 1;
        Some(proc)
    }

    /// Removes roughly half of this queue (rounded down, at least one if
    /// non-empty) from the tail and appends them to `victim`, for the
    /// scheduler's load-shedding path when a starving core unparks
    /// (`spec.md` §4.3). Returns how many were moved.
    pub fn steal_half_into(&mut self, victim: &mut LocalRunQueue) -> usize {
        let to_move = self.len / 2;
        let mut moved = 0;
        while moved < to_move {
            let Some(proc) = self.pop_back() else { break };
            // SAFETY: `proc` was just unlinked from `self` and is not
            // referenced anywhere else.
            unsafe { victim.push_back(proc) };
            moved += 1;
        }
        moved
    }

    fn pop_back(&mut self) -> Option<*mut Process> {
        if self.tail.is_null() {
            return None;
        }
        let proc = self.tail;
        // SAFETY: see `pop_front_unconditional`.
        let prev = unsafe { (*proc).prev };
        self.tail = prev;
        if prev.is_null() {
            self.head = std::ptr::null_mut();
        } else {
            unsafe { (*prev).next = std::ptr::null_mut() };
        }
        self.len -= 1;
        Some(proc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcStat, TimerSlot};
    use std::sync::atomic::{AtomicU8, AtomicUsize};

    fn fake_process(pid: u64) -> *mut Process {
        Box::into_raw(Box::new(Process {
            rsp: 0,
            rbp: 0,
            mxcsr: 0,
            x87cw: 0,
            is_new: 1,
            regs: [0; 6],
            timer: TimerSlot::default(),
            name: "test",
            pid,
            cpu_id: 0,
            stat: AtomicU8::new(ProcStat::Runnable as u8),
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
            parent: std::ptr::null_mut(),
            nchild: AtomicUsize::new(0),
            alloc_base: std::ptr::null_mut(),
            alloc_len: 0,
        }))
    }

    unsafe fn free_process(p: *mut Process) {
        drop(unsafe { Box::from_raw(p) });
    }

    #[test]
    fn fifo_order_preserved() {
        let mut q = LocalRunQueue::new();
        let procs: Vec<_> = (0 .. 5).map(fake_process).collect();
        for &p in &procs {
            unsafe { q.push_back(p) };
        }
        for &expected in &procs {
            let popped = q.pop_front_unconditional().unwrap();
            assert_eq!(unsafe { (*popped).pid }, unsafe { (*expected).pid });
        }
        assert!(q.is_empty());
        for p in procs {
            unsafe { free_process(p) };
        }
    }

    #[test]
    fn every_32nd_pop_misses() {
        let mut q = LocalRunQueue::new();
        let procs: Vec<_> = (0 .. 40).map(fake_process).collect();
        for &p in &procs {
            unsafe { q.push_back(p) };
        }
        let mut misses = 0;
        for i in 1 ..= 32 {
            match q.pop_front() {
                None => {
                    misses += 1;
                    assert_eq!(i, 32, "the only miss in the first 32 calls must land on the 32nd");
                }
                Some(proc) => {
                    // A missed head stays at the front; push it to the
                    // back so the queue shrinks by exactly one per real
                    // pop, keeping the arithmetic above simple.
                    unsafe { q.push_back(proc) };
                }
            }
        }
        assert_eq!(misses, 1);
        for p in procs {
            unsafe { free_process(p) };
        }
    }

    #[test]
    fn steal_half_moves_roughly_half() {
        let mut a = LocalRunQueue::new();
        let mut b = LocalRunQueue::new();
        let procs: Vec<_> = (0 .. 10).map(fake_process).collect();
        for &p in &procs {
            unsafe { a.push_back(p) };
        }
        let moved = a.steal_half_into(&mut b);
        assert_eq!(moved, 5);
        assert_eq!(a.len(), 5);
        assert_eq!(b.len(), 5);
        for p in procs {
            unsafe { free_process(p) };
        }
    }
}
