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

//! Stackful coroutines ("processes").
//!
//! See [`record`] for the control block layout and [`trampoline`] for how
//! a fresh one is built. Grounded throughout on
//! `examples/original_source/src/proc.h`.

pub mod record;
pub mod trampoline;

pub use record::{Process, ProcStat, RegSlots, TimerSlot};
pub use trampoline::{reclaim, spawn, trampoline_entry};
