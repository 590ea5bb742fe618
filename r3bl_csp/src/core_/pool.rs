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

//! The unified thread pool driving every CPU's scheduler loop.
//!
//! Grounded on `examples/original_source/src/corepool.c`/`.h`: a CPU's
//! scheduler loop runs on exactly one kernel thread at a time, but a
//! process that needs to make a genuinely blocking syscall (as opposed to
//! yielding or waiting on netpoll/timers/channels) would otherwise stall
//! every other process pinned to that CPU for the syscall's duration.
//! Instead, before making the call, the running thread hands its CPU's
//! scheduling duties to an idle spare thread from this pool (pinned to
//! the same CPU via `sched_setaffinity`), makes the blocking call on its
//! own thread, and on return rejoins the pool as a new spare.
//!
//! [`crate::runtime::Runtime::start`]'s per-CPU primary threads and the
//! spares [`crate::sched::block`] activates are both just threads in this
//! one pool: `new`'s `initially_assigned` parameter starts some slots
//! already driving a CPU instead of idle-waiting, so a CPU's thread
//! identity can keep changing across `block` hand-offs without ever
//! constructing two [`crate::core_::Core`] activations for the same CPU
//! that could be concurrently live — each activation gets its own `Core`,
//! built fresh by the closure passed to `new` every time a slot (re)starts
//! driving a CPU.

use std::sync::{atomic::{AtomicUsize, Ordering},
                 Arc, Condvar, Mutex};

/// One pooled thread's parking state: `None` while idle, `Some(cpu_id)`
/// once some other thread has handed it a CPU to take over scheduling
/// for.
struct Slot {
    assigned_cpu: Mutex<Option<usize>>,
    cv: Condvar,
}

/// A fixed-size pool of idle kernel threads, each blocked on a
/// [`std::sync::Condvar`] until assigned a CPU to run the scheduler loop
/// for.
pub struct CorePool {
    slots: Vec<Arc<Slot>>,
    round_robin: AtomicUsize,
}

impl std::fmt::Debug for CorePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorePool").field("size", &self.slots.len()).finish()
    }
}

impl CorePool {
    /// Spawns `total_threads` threads. The first `initially_assigned.len()`
    /// slots start already driving the CPU ids listed there (skipping the
    /// idle wait entirely — these are what used to be `Runtime::start`'s
    /// separate per-CPU primary threads); every remaining slot starts idle,
    /// waiting to be handed a CPU by [`CorePool::activate`].
    ///
    /// `run_core_loop(cpu_id)` is the scheduler loop entry point
    /// (`crate::sched::run_core_loop`, via a closure the caller builds a
    /// fresh `crate::core_::Core` inside of for every call); it is expected
    /// to run until that CPU's thread is itself later displaced by another
    /// spare taking over (in which case it should return so this thread
    /// can rejoin the pool as a new spare), matching
    /// `examples/original_source/src/sched.c`'s "a core's thread changes
    /// identity but a core never stops running" design.
    ///
    /// # Panics
    /// Panics if `initially_assigned.len() > total_threads`.
    #[must_use]
    pub fn new<F>(total_threads: usize, initially_assigned: &[usize], run_core_loop: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        assert!(
            initially_assigned.len() <= total_threads,
            "more initially-assigned CPUs ({}) than pool threads ({total_threads})",
            initially_assigned.len()
        );
        let run_core_loop = Arc::new(run_core_loop);
        let slots = (0 .. total_threads)
            .map(|i| {
                let slot = Arc::new(Slot {
                    assigned_cpu: Mutex::new(initially_assigned.get(i).copied()),
                    cv: Condvar::new(),
                });
                let thread_slot = Arc::clone(&slot);
                let run = Arc::clone(&run_core_loop);
                std::thread::Builder::new()
                    .name(format!("csp-pool-{i}"))
                    .spawn(move || spare_loop(&thread_slot, run.as_ref()))
                    .expect("failed to spawn csp pool thread");
                slot
            })
            .collect();
        Self {
            slots,
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Hands `cpu_id` to the next idle spare in round-robin order.
    /// Returns `false` if every spare is currently busy, in which case
    /// the caller (`crate::sched::block`) proceeds with the blocking call
    /// anyway — other processes on that CPU simply wait longer, which is
    /// the same degraded-but-correct behavior the original falls back to
    /// when `max_threads` is exhausted.
    pub fn activate(&self, cpu_id: usize) -> bool {
        let start = self.round_robin.fetch_add(1, Ordering::Relaxed) % self.slots.len().max(1);
        for offset in 0 .. self.slots.len() {
            let slot = &self.slots[(start + offset) % self.slots.len()];
            let mut guard = slot.assigned_cpu.lock().expect("spare pool mutex poisoned");
            if guard.is_none() {
                *guard = Some(cpu_id);
                slot.cv.notify_one();
                return true;
            }
        }
        false
    }

    #[must_use]
    pub fn size(&self) -> usize { self.slots.len() }
}

fn spare_loop(slot: &Slot, run_core_loop: &(dyn Fn(usize) + Send + Sync)) {
    loop {
        let mut guard = slot.assigned_cpu.lock().expect("spare pool mutex poisoned");
        while guard.is_none() {
            guard = slot.cv.wait(guard).expect("spare pool condvar poisoned");
        }
        let cpu_id = guard.take().expect("checked non-None above");
        drop(guard);
        run_core_loop(cpu_id);
    }
}
