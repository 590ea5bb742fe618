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

//! The process control block.
//!
//! Grounded on `examples/original_source/src/proc.h`: a single `repr(C)`
//! record living at a fixed offset from the top of its own stack
//! allocation so the hand-written restore/save assembly
//! (`crate::arch::x86_64`) can reach every field it needs through `proc`
//! alone, without a second pointer chase.

use std::sync::atomic::{AtomicI64, AtomicU8, AtomicUsize};

/// Where a process sits relative to the scheduler, mirroring
/// `examples/original_source/src/proc.h`'s `stat` field. `Running` isn't
/// a variant here because it is implicit: a process is "running" exactly
/// when it is the one whose context the core has restored, which is
/// core-local state, not process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcStat {
    /// On a run queue (local or global), eligible to be restored.
    Runnable = 0,
    /// Parked waiting on a channel operation, a timer, or blocked for a
    /// synchronous syscall; off every run queue.
    Waiting = 1,
    /// Parked in the netpoll waiter table, armed for a specific
    /// fd/interest.
    NetpollWaiting = 2,
    /// The netpoll monitor observed readiness and is in the process of
    /// re-queuing; see the readiness/timeout race in `crate::monitor`.
    NetpollAvail = 3,
    /// The netpoll monitor observed the deadline elapsing first.
    NetpollTimeout = 4,
    /// Returned from its entry closure; torn down on next core visit.
    Exited = 5,
}

impl From<u8> for ProcStat {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Runnable,
            1 => Self::Waiting,
            2 => Self::NetpollWaiting,
            3 => Self::NetpollAvail,
            4 => Self::NetpollTimeout,
            _ => Self::Exited,
        }
    }
}

/// Six general-purpose 64-bit slots, reinterpreted depending on
/// [`Process::is_new`]: the System V argument registers (`rdi`, `rsi`,
/// `rdx`, `rcx`, `r8`, `r9`) before first restore, or the callee-saved
/// registers (`rbx`, `r12`, `r13`, `r14`, `r15`, and one unused pad slot)
/// after the first save. Kept as a flat array rather than a `union` of
/// two named structs so `crate::arch::x86_64`'s asm can address every
/// slot by a single constant stride regardless of which interpretation is
/// live.
pub type RegSlots = [u64; 6];

/// This process's slot in its core's timer heap (`crate::timer`).
/// `heap_index` and `token` are only meaningful while `armed` is true;
/// `crate::timer::TimerHeap` owns the transitions.
#[derive(Debug)]
pub struct TimerSlot {
    pub deadline_ns: AtomicI64,
    pub heap_index: AtomicI64,
    pub token: AtomicI64,
}

impl Default for TimerSlot {
    fn default() -> Self {
        Self {
            deadline_ns: AtomicI64::new(-1),
            heap_index: AtomicI64::new(-1),
            token: AtomicI64::new(0),
        }
    }
}

/// A stackful coroutine's control block, addressed exclusively through
/// raw pointers once spawned: it lives inside the same `mmap` allocation
/// as its own stack (see `crate::process::trampoline`), so an owning
/// `Box` would have nowhere safe to drop to.
#[repr(C)]
pub struct Process {
    /// Stack pointer at the last save point. Read/written only by
    /// `crate::arch`.
    pub rsp: u64,
    /// Frame pointer at the last save point.
    pub rbp: u64,
    /// MXCSR (SSE control/status) at the last save point.
    pub mxcsr: u32,
    /// x87 control word at the last save point.
    pub x87cw: u16,
    /// Sentinel `1` until the first restore, then cleared; gates whether
    /// [`crate::arch::Arch::restore`] treats `regs` as entry arguments or
    /// as callee-saved registers.
    pub is_new: u8,
    pub regs: RegSlots,

    pub timer: TimerSlot,

    /// Entry point passed to the trampoline; retained for diagnostics
    /// (panic messages, `Debug`) since the stack itself doesn't carry a
    /// symbol name once running.
    pub name: &'static str,

    /// Process id, assigned from a per-runtime monotonic counter at
    /// spawn.
    pub pid: u64,
    pub cpu_id: usize,
    pub stat: AtomicU8,

    /// Intrusive doubly-linked list pointers used by
    /// `crate::runqueue::LocalRunQueue`. Null when not linked into any
    /// list.
    pub prev: *mut Process,
    pub next: *mut Process,

    /// Set once at spawn time by [`crate::runtime::Runtime::spawn_sync`],
    /// null for every process spawned via
    /// [`crate::runtime::Runtime::spawn`]. Read exactly once, by this
    /// process itself as it exits (`crate::sched::exit_current`); never
    /// mutated afterward, so it needs no atomicity of its own.
    pub parent: *mut Process,

    /// Live child count. For a `spawn_sync` parent, set to the task count
    /// before any child starts running and decremented by each child on
    /// exit (`examples/original_source/src/proc.h`'s `nchild`); the child
    /// that observes the transition to zero re-queues the parent.
    pub nchild: AtomicUsize,

    /// Base address and length of this process's whole allocation
    /// (guard-page-aligned stack plus this record), needed to hand the
    /// region back to `crate::alloc` on exit.
    pub alloc_base: *mut u8,
    pub alloc_len: usize,
}

// SAFETY: a `Process` is only ever mutated by the single core that
// currently owns it (running it, or about to restore it), or through the
// specific atomics declared above for cross-core signaling (`stat`,
// `timer`, `nchild`). That's the same contract `examples/original_
// source/src/proc.h` documents for its C struct.
unsafe impl Send for Process {}
unsafe impl Sync for Process {}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("cpu_id", &self.cpu_id)
            .field("stat", &ProcStat::from(self.stat.load(std::sync::atomic::Ordering::Relaxed)))
            .finish_non_exhaustive()
    }
}

impl Process {
    pub fn stat(&self) -> ProcStat { ProcStat::from(self.stat.load(std::sync::atomic::Ordering::Acquire)) }

    pub fn set_stat(&self, stat: ProcStat) { self.stat.store(stat as u8, std::sync::atomic::Ordering::Release); }
}
