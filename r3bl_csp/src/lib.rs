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

//! A user-space M:N concurrency runtime implementing Communicating
//! Sequential Processes on commodity multi-core POSIX hosts.
//!
//! The runtime multiplexes a large population of lightweight stackful
//! coroutines ("processes") onto a small pool of kernel threads ("cores")
//! pinned to CPUs. Typed bounded channels, timers, and non-blocking network
//! I/O are the coordination primitives; suspension happens only at explicit
//! yield points ([`sched::yield_now`], [`sched::hangup`], channel
//! operations, [`netpoll`] waits, and [`sched::block`]) — there is no
//! preemption.
//!
//! See `SPEC_FULL.md` and `DESIGN.md` at the workspace root for the full
//! design rationale.

pub mod alloc;
pub mod arch;
pub mod chan;
pub mod config;
pub mod core_;
pub mod monitor;
pub mod mutex;
pub mod netpoll;
pub mod process;
pub mod rbq;
pub mod runqueue;
pub mod runtime;
pub mod sched;
pub mod timer;

pub use chan::Channel;
pub use config::{CspError, RuntimeConfig, RuntimeConfigBuilder};
pub use mutex::SpinMutex;
pub use runtime::Runtime;
