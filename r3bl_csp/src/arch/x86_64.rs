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

//! System V AMD64 context switch.
//!
//! Mirrors the three hand-written assembly routines described in
//! `examples/original_source/src/proc.h` and `core.h`: `restore` (load a
//! process's saved state and transfer control to it, loading either its
//! entry arguments or its callee-saved registers depending on whether
//! it's running for the first time), `save` (the mirror image, jumping to
//! the core's anchor afterward), and `enter_anchor` (record the anchor
//! itself, once per core). All three are `#[unsafe(naked)]`: they must
//! not touch the stack before it's safe to, so no compiler-generated
//! prologue/epilogue can be allowed to run.
//!
//! Field offsets referenced from assembly are asserted against
//! [`std::mem::offset_of!`] in the unit tests below so a layout change in
//! [`Process`] or [`Anchor`] fails loudly instead of corrupting a
//! register on the next context switch.

use std::arch::naked_asm;

use super::{Anchor, Arch};
use crate::process::Process;

pub struct X86_64;

impl Arch for X86_64 {
    unsafe fn restore(proc: *mut Process) -> ! {
        unsafe { restore_impl(proc) }
    }

    unsafe fn save_and_jump_to_anchor(proc: *mut Process, anchor: *mut Anchor) {
        unsafe { save_impl(proc, anchor) }
    }

    unsafe fn enter_anchor(anchor: *mut Anchor) {
        unsafe { enter_anchor_impl(anchor) }
    }
}

// Field offsets within `Process`, in bytes, matching declaration order in
// `crate::process::record::Process`: rsp(0), rbp(8), mxcsr(16), x87cw(20),
// is_new(22), regs(24..72).
const OFF_RSP: usize = 0;
const OFF_RBP: usize = 8;
const OFF_MXCSR: usize = 16;
const OFF_X87CW: usize = 20;
const OFF_IS_NEW: usize = 22;
const OFF_REGS: usize = 24;

// Field offsets within `Anchor`: rbp(0), rsp(8), rip(16), rbx(24).
const ANCHOR_RBP: usize = 0;
const ANCHOR_RSP: usize = 8;
const ANCHOR_RIP: usize = 16;
const ANCHOR_RBX: usize = 24;

/// Restores `proc` (passed in `rdi` by the System V calling convention)
/// and never returns.
///
/// If `is_new != 0` this is the process's first restore: `regs` holds its
/// six entry arguments, so they are loaded into the argument registers
/// and execution `ret`s into the trampoline entry point that
/// `crate::process::trampoline::spawn` wrote at the top of the stack.
/// Otherwise `regs` holds the five callee-saved registers from the last
/// [`save_impl`], which are restored before the `ret`.
#[unsafe(naked)]
unsafe extern "C" fn restore_impl(proc: *mut Process) -> ! {
    naked_asm!(
        "mov rsp, [rdi + {off_rsp}]",
        "mov rbp, [rdi + {off_rbp}]",
        "ldmxcsr [rdi + {off_mxcsr}]",
        "fldcw [rdi + {off_x87cw}]",
        "cmp byte ptr [rdi + {off_is_new}], 0",
        "je 2f",
        // First restore: regs holds (rdi, rsi, rdx, rcx, r8, r9) for the
        // trampoline entry point; load them last so rdi isn't clobbered
        // before it's read.
        "mov byte ptr [rdi + {off_is_new}], 0",
        "mov r9,  [rdi + {off_regs} + 40]",
        "mov r8,  [rdi + {off_regs} + 32]",
        "mov rcx, [rdi + {off_regs} + 24]",
        "mov rdx, [rdi + {off_regs} + 16]",
        "mov rsi, [rdi + {off_regs} + 8]",
        "mov rdi, [rdi + {off_regs}]",
        "ret",
        "2:",
        // Steady-state restore: regs holds (rbx, r12, r13, r14, r15).
        "mov rbx, [rdi + {off_regs}]",
        "mov r12, [rdi + {off_regs} + 8]",
        "mov r13, [rdi + {off_regs} + 16]",
        "mov r14, [rdi + {off_regs} + 24]",
        "mov r15, [rdi + {off_regs} + 32]",
        "ret",
        off_rsp = const OFF_RSP,
        off_rbp = const OFF_RBP,
        off_mxcsr = const OFF_MXCSR,
        off_x87cw = const OFF_X87CW,
        off_is_new = const OFF_IS_NEW,
        off_regs = const OFF_REGS,
    );
}

/// Saves the caller's callee-saved registers into `proc` (`rdi`) then
/// jumps to `anchor` (`rsi`). `anchor`'s `rip` was populated by
/// [`enter_anchor_impl`] to point just past its own call site, so this
/// resumes the scheduler loop as if `enter_anchor_impl` had just
/// returned.
#[unsafe(naked)]
unsafe extern "C" fn save_impl(proc: *mut Process, anchor: *mut Anchor) {
    naked_asm!(
        "mov [rdi + {off_rsp}], rsp",
        "mov [rdi + {off_rbp}], rbp",
        "stmxcsr [rdi + {off_mxcsr}]",
        "fnstcw [rdi + {off_x87cw}]",
        "mov [rdi + {off_regs}], rbx",
        "mov [rdi + {off_regs} + 8], r12",
        "mov [rdi + {off_regs} + 16], r13",
        "mov [rdi + {off_regs} + 24], r14",
        "mov [rdi + {off_regs} + 32], r15",
        "mov rbp, [rsi + {anchor_rbp}]",
        "mov rsp, [rsi + {anchor_rsp}]",
        "mov rbx, [rsi + {anchor_rbx}]",
        "jmp qword ptr [rsi + {anchor_rip}]",
        off_rsp = const OFF_RSP,
        off_rbp = const OFF_RBP,
        off_mxcsr = const OFF_MXCSR,
        off_x87cw = const OFF_X87CW,
        off_regs = const OFF_REGS,
        anchor_rbp = const ANCHOR_RBP,
        anchor_rsp = const ANCHOR_RSP,
        anchor_rbx = const ANCHOR_RBX,
        anchor_rip = const ANCHOR_RIP,
    );
}

/// Populates `anchor` (`rdi`) with the calling context and returns
/// normally; a later [`save_impl`] jumping to this anchor resumes right
/// here.
#[unsafe(naked)]
unsafe extern "C" fn enter_anchor_impl(anchor: *mut Anchor) {
    naked_asm!(
        "mov [rdi + {anchor_rbp}], rbp",
        "mov [rdi + {anchor_rbx}], rbx",
        "lea rax, [rip + 3f]",
        "mov [rdi + {anchor_rip}], rax",
        "mov [rdi + {anchor_rsp}], rsp",
        "ret",
        "3:",
        "ret",
        anchor_rbp = const ANCHOR_RBP,
        anchor_rbx = const ANCHOR_RBX,
        anchor_rip = const ANCHOR_RIP,
        anchor_rsp = const ANCHOR_RSP,
    );
}

#[cfg(test)]
mod tests {
    use std::mem::offset_of;

    use super::*;

    #[test]
    fn process_offsets_match_assembly_constants() {
        assert_eq!(offset_of!(Process, rsp), OFF_RSP);
        assert_eq!(offset_of!(Process, rbp), OFF_RBP);
        assert_eq!(offset_of!(Process, mxcsr), OFF_MXCSR);
        assert_eq!(offset_of!(Process, x87cw), OFF_X87CW);
        assert_eq!(offset_of!(Process, is_new), OFF_IS_NEW);
        assert_eq!(offset_of!(Process, regs), OFF_REGS);
    }

    #[test]
    fn anchor_offsets_match_assembly_constants() {
        assert_eq!(offset_of!(Anchor, rbp), ANCHOR_RBP);
        assert_eq!(offset_of!(Anchor, rsp), ANCHOR_RSP);
        assert_eq!(offset_of!(Anchor, rip), ANCHOR_RIP);
        assert_eq!(offset_of!(Anchor, rbx), ANCHOR_RBX);
    }
}
