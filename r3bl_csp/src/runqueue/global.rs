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

//! Per-CPU global run queue: any core may push a migrating process onto
//! any other CPU's queue, and any core may steal from it.
//!
//! A thin, pointer-typed wrapper over [`crate::rbq::MpMcQueue`]; grounded
//! on `examples/original_source/src/runq.c`'s "global" half (as opposed
//! to the per-core intrusive list in [`super::local`]).

use crate::{process::Process, rbq::MpMcQueue};

#[derive(Debug)]
pub struct GlobalRunQueue {
    queue: MpMcQueue<*mut Process>,
}

// SAFETY: the only payload is `*mut Process`, and ownership of the
// pointee transfers atomically through the underlying ring buffer exactly
// like any other `Send` payload would.
unsafe impl Send for GlobalRunQueue {}
unsafe impl Sync for GlobalRunQueue {}

impl GlobalRunQueue {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: MpMcQueue::with_capacity(capacity),
        }
    }

    /// # Safety
    /// `proc` must not be queued anywhere else; ownership (in the sense
    /// of "which structure may next mutate it") transfers to whichever
    /// core eventually pops it.
    pub unsafe fn push(&self, proc: *mut Process) -> Result<(), *mut Process> { self.queue.try_push(proc) }

    pub fn pop(&self) -> Option<*mut Process> { self.queue.try_pop() }

    #[must_use]
    pub fn len_hint(&self) -> usize { self.queue.len_hint() }

    #[must_use]
    pub fn is_empty_hint(&self) -> bool { self.queue.is_empty_hint() }
}
