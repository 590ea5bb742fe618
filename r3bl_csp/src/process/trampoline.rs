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

//! Builds a fresh [`Process`] record and its initial stack layout.
//!
//! Grounded on `examples/original_source/src/proc.h`'s `csp_proc_create`:
//! the stack allocation holds the
//! process's usable stack in its lower addresses and the [`Process`]
//! record itself pinned at the top, so one pointer (`proc`) is enough for
//! `crate::arch` to find both the saved registers and, on first restore,
//! the stack the entry closure will actually run on.

use std::sync::atomic::{AtomicU8, AtomicUsize};

use super::record::{Process, ProcStat, TimerSlot};
use crate::{alloc::StackAllocator, config::CspError};

/// Extra bytes reserved above the requested stack size for the
/// [`Process`] record itself, rounded up generously since the exact
/// layout is architecture-dependent.
const RECORD_RESERVE: usize = 512;

type BoxedEntry = Box<dyn FnOnce() + Send + 'static>;

/// Builds a new process: allocates `stack_len` (plus bookkeeping) bytes
/// from `alloc` on `cpu_id`, places the [`Process`] record at the top of
/// that allocation, and arms it to run `entry` the first time it is
/// restored. `parent` is null for an ordinary spawn, or the spawning
/// process for a `spawn_sync` child.
///
/// # Errors
/// Propagates [`CspError::Exhausted`] from the allocator.
pub fn spawn<F>(
    alloc: &dyn StackAllocator,
    cpu_id: usize,
    pid: u64,
    name: &'static str,
    stack_len: usize,
    parent: *mut Process,
    entry: F,
) -> Result<*mut Process, CspError>
where
    F: FnOnce() + Send + 'static,
{
    let total_len = stack_len + RECORD_RESERVE;
    let base = alloc.alloc(cpu_id, total_len)?;

    // The record sits at the highest addresses of the allocation; the
    // stack is everything below it, matching a downward-growing x86_64
    // stack starting just under the record.
    let record_addr = (base as usize + total_len - std::mem::size_of::<Process>()) & !0xf;
    let record_ptr = record_addr as *mut Process;

    let boxed: BoxedEntry = Box::new(entry);
    let arg = Box::into_raw(Box::new(boxed)).cast::<u8>();

    // Initial stack pointer, just below the record. The first `ret` in
    // `crate::arch::current::X86_64::restore` pops its target from
    // `[rsp]`, so the word at `initial_rsp` must hold `trampoline_entry`'s
    // address — the same role a real call's return address plays, except
    // here nothing ever returns through it. `initial_rsp` itself must be
    // 16-byte aligned so that after that `ret` pops the 8-byte address
    // word, the resulting `rsp` sits at `16n + 8`, exactly the alignment
    // the System V ABI guarantees on entry to a function that was reached
    // by a real `call` instruction (which itself pushes 8 misaligning
    // bytes onto a 16-aligned caller `rsp`).
    let stack_top = (record_addr - 16) & !0xf;
    let initial_rsp = stack_top as u64;

    // SAFETY: `record_ptr` is freshly carved, aligned, and large enough
    // (the allocator rounds up to a page and `RECORD_RESERVE` is
    // generous relative to `size_of::<Process>()`); nothing else
    // observes this memory until this write completes.
    unsafe {
        (initial_rsp as *mut u64).write(trampoline_entry as usize as u64);
    }

    // SAFETY: same as above.
    unsafe {
        record_ptr.write(Process {
            rsp: initial_rsp,
            rbp: 0,
            mxcsr: 0x1f80, // default MXCSR: all exceptions masked, round-to-nearest.
            x87cw: 0x037f, // default x87 control word.
            is_new: 1,
            regs: [arg as u64, 0, 0, 0, 0, 0],
            timer: TimerSlot::default(),
            name,
            pid,
            cpu_id,
            stat: AtomicU8::new(ProcStat::Runnable as u8),
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
            parent,
            nchild: AtomicUsize::new(0),
            alloc_base: base,
            alloc_len: total_len,
        });
    }

    Ok(record_ptr)
}

/// Reclaims `proc`'s stack allocation. Called once, after the scheduler
/// has observed `proc.stat() == ProcStat::Exited` and unlinked it from
/// every run queue.
///
/// # Safety
/// `proc` must not be referenced by anything else afterward; the caller
/// must have already read out anything it needs (`pid`, `name`) for
/// logging before calling this.
pub unsafe fn reclaim(alloc: &dyn StackAllocator, calling_cpu: usize, proc: *mut Process) {
    let (owner_cpu, base, len) = unsafe {
        let p = &*proc;
        (p.cpu_id, p.alloc_base, p.alloc_len)
    };
    unsafe { std::ptr::drop_in_place(proc) };
    unsafe { alloc.dealloc(calling_cpu, owner_cpu, base, len) };
}

/// The function every trampoline's initial `ret` lands on. Reconstructs
/// the boxed entry closure from `arg`, runs it, then transitions the
/// process to [`ProcStat::Exited`] and yields control back to the core —
/// it never returns to its caller in the conventional sense, since there
/// is no caller: this *is* the base of the process's call stack.
///
/// # Safety
/// Must only be reached by [`crate::arch::Arch::restore`] jumping to a
/// process's entry point with `arg` set to a pointer previously produced
/// by [`spawn`].
pub unsafe extern "C" fn trampoline_entry(arg: *mut u8) -> ! {
    // SAFETY: `arg` was produced by `Box::into_raw(Box::new(boxed))` in
    // `spawn` and is consumed exactly once, here.
    let boxed: BoxedEntry = *unsafe { Box::from_raw(arg.cast::<BoxedEntry>()) };
    boxed();
    crate::sched::exit_current()
}
