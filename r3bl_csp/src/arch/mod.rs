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

//! Architecture-specific context switch.
//!
//! Isolating the save/restore/anchor sequences behind a narrow interface
//! so that porting
//! to a new architecture means writing a new impl of [`Arch`], not touching
//! the scheduler. Only [`x86_64`] is implemented; it follows the System V
//! AMD64 ABI save/restore layout from `examples/original_source/src/proc.h`
//! and `core.h`.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64 as current;

use crate::process::Process;

/// The core's baseline register state, saved once per
/// [`crate::sched::run_core_loop`] activation and jumped back to whenever
/// a process yields, hangs up, or exits. `examples/original_source/src/
/// core.h` keeps this as the first field of its core record so the
/// hand-written assembly can find it at a fixed offset; this port's
/// assembly only ever takes offsets into [`Process`] and `Anchor` itself
/// (see `arch::x86_64`), never into [`Core`], so that constraint doesn't
/// carry over to this struct's field order.
///
/// [`Core`]: crate::core_::Core
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Anchor {
    pub rbp: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
}

/// Narrow interface the scheduler programs against; everything
/// architecture-specific funnels through these three operations.
pub trait Arch {
    /// Restores `proc`'s saved context and transfers control to it. Loads
    /// the six System V argument registers and clears `is_new` on first
    /// entry; loads the five callee-saved
    /// registers otherwise. Never returns: control leaves by a later call
    /// to [`Arch::save_and_jump_to_anchor`].
    ///
    /// # Safety
    /// `proc` must point to a live, fully-initialized [`Process`] whose
    /// stack region is still mapped.
    unsafe fn restore(proc: *mut Process) -> !;

    /// Saves the caller's callee-saved registers, `rsp`, `rbp`, MXCSR and
    /// the x87 control word into `proc`, then jumps to `anchor` (the core's
    /// scheduler-loop context). Used by `yield`, `hangup`, channel park,
    /// and netpoll park.
    ///
    /// Returns normally from the caller's point of view — but not by
    /// executing a `ret` from *this* call. The next time `proc` is
    /// restored (a later, unrelated call to [`Arch::restore`]), the saved
    /// `rsp` points just above the return address this call's `call`
    /// instruction pushed, so `restore`'s own `ret` resumes execution
    /// right here, as if this function had simply returned after some
    /// arbitrary delay. This is the same contract `ucontext.h`'s
    /// `swapcontext` makes.
    ///
    /// # Safety
    /// `proc` must be the process currently running on this core; `anchor`
    /// must be that core's own anchor, previously populated by
    /// [`Arch::enter_anchor`].
    unsafe fn save_and_jump_to_anchor(proc: *mut Process, anchor: *mut Anchor);

    /// Captures the calling context into `anchor` and returns normally.
    /// Called once per core, at the top of the scheduler loop
    /// (`examples/original_source/src/core.h`'s comment on `anchor`).
    ///
    /// # Safety
    /// `anchor` must outlive every process this core ever restores.
    unsafe fn enter_anchor(anchor: *mut Anchor);
}
