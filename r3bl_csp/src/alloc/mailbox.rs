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

//! Cross-CPU free mailbox.
//!
//! A process's stack can be deallocated by any core (whichever core last
//! runs it to exit, which migration makes different from the core that
//! allocated it). `examples/original_source/src/mem.c` handles this by
//! routing frees from a foreign CPU through a lock-free queue the owning
//! CPU drains on its own next allocation, rather than taking a lock on
//! another CPU's free-span tree. [`Mailbox`] is that queue.

use crate::rbq::{Multi, RingBuffer, Single};

#[derive(Debug, Clone, Copy)]
pub struct FreedSpan {
    pub addr: usize,
    pub len: usize,
}

/// Many foreign CPUs may deposit a freed span; only the owning CPU ever
/// drains it.
pub type Mailbox = RingBuffer<FreedSpan, Multi, Single>;

pub fn new_mailbox(capacity: usize) -> Mailbox { RingBuffer::with_capacity(capacity) }
