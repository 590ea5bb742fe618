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

//! Typed, bounded channels — the primary coordination primitive between
//! processes.
//!
//! Grounded on `examples/original_source/src/chan.h`: a bounded ring
//! buffer ([`crate::rbq::ChannelQueue`]) with two side waiter lists, one
//! for processes parked because the channel was full, one for processes
//! parked because it was empty. A successful send wakes one waiting
//! receiver; a successful receive wakes one waiting sender. A zero-
//! capacity channel ([`rendezvous`]) behaves as a synchronous
//! rendezvous: a send cannot complete until a receiver is already waiting
//! to take the value, since the buffer never holds anything.
//!
//! Alongside single-value `send`/`recv`/`try_send`/`try_recv`, `spec.md`
//! §4.1/§6 name bulk `pushm`/`popm` operations; [`Channel::send_many`]/
//! [`Channel::recv_many`] and their `try_*_many` non-blocking counterparts
//! are the Rust-idiomatic rendering of those (`_many` rather than `m`, to
//! read as English rather than as a ported C suffix).

use std::{collections::VecDeque, sync::Arc};

use crate::{mutex::SpinMutex, process::Process, rbq::ChannelQueue, runqueue::GlobalRunQueue, sched};

/// Waiter lists are expected to be short-lived and low-contention (a
/// handful of parked processes at most), so a spin lock is appropriate —
/// see `crate::mutex`'s module docs for the same reasoning applied to the
/// allocator's free-span index.
struct Waiters {
    queue: SpinMutex<VecDeque<*mut Process>>,
}

// SAFETY: the only payload is `*mut Process`, guarded by `SpinMutex`
// exactly like every other cross-thread structure in this crate.
unsafe impl Send for Waiters {}
unsafe impl Sync for Waiters {}

impl Default for Waiters {
    fn default() -> Self {
        Self {
            queue: SpinMutex::new(VecDeque::new()),
        }
    }
}

impl Waiters {
    fn push(&self, proc: *mut Process) { self.queue.lock().push_back(proc); }

    fn pop(&self) -> Option<*mut Process> { self.queue.lock().pop_front() }

    /// Removes `proc` if it is still registered. A no-op if it isn't —
    /// either it was already popped by a racing [`Channel::wake_one`], or
    /// it was never pushed in the first place. Used by the
    /// check-register-recheck path in [`Channel::send`]/[`Channel::recv`]
    /// to undo a registration that turned out to be unnecessary.
    fn remove(&self, proc: *mut Process) { self.queue.lock().retain(|&p| p != proc); }
}

/// A bounded channel of `T`. Cloning a `Channel` clones a handle to the
/// same underlying queue (it is reference-counted internally), matching
/// `std::sync::mpsc`'s `Sender`/`Receiver` ergonomics more than the
/// original's explicit pointer-passing.
#[derive(Clone)]
pub struct Channel<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    queue: ChannelQueue<T>,
    senders_waiting: Waiters,
    receivers_waiting: Waiters,
    global_queues: Arc<[GlobalRunQueue]>,
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("len_hint", &self.inner.queue.len_hint()).finish()
    }
}

impl<T: Send + 'static> Channel<T> {
    /// Builds a channel buffering up to `capacity` values without a
    /// receiver present. `global_queues` is the runtime's per-CPU global
    /// run queue array, needed so a successful send/receive can re-queue
    /// whichever process it wakes onto that process's own CPU.
    #[must_use]
    pub fn bounded(capacity: usize, global_queues: Arc<[GlobalRunQueue]>) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: ChannelQueue::with_capacity(capacity.max(1)),
                senders_waiting: Waiters::default(),
                receivers_waiting: Waiters::default(),
                global_queues,
            }),
        }
    }

    /// Sends `value`, parking the calling process if the channel is
    /// currently full. Must be called from inside a running process
    /// (i.e. with a core bound via `crate::sched::bind_current_core`).
    ///
    /// Registers as a waiter *before* re-checking the queue, not after —
    /// a receiver that frees a slot between our first failed attempt and
    /// our registration would otherwise call [`Channel::wake_one`] while
    /// `senders_waiting` is still empty and wake no one, leaving us parked
    /// with nothing left to wake us (the classic lost-wakeup window).
    pub fn send(&self, value: T) {
        let mut value = value;
        loop {
            match self.inner.queue.try_push(value) {
                Ok(()) => {
                    self.wake_one(&self.inner.receivers_waiting);
                    return;
                }
                Err(rejected) => value = rejected,
            }

            let proc = sched::current();
            self.inner.senders_waiting.push(proc);

            match self.inner.queue.try_push(value) {
                Ok(()) => {
                    self.inner.senders_waiting.remove(proc);
                    self.wake_one(&self.inner.receivers_waiting);
                    return;
                }
                Err(rejected) => value = rejected,
            }

            self.suspend(proc);
        }
    }

    /// Receives a value, parking the calling process if the channel is
    /// currently empty. See [`Channel::send`]'s doc comment for why
    /// registration happens before the re-check rather than after.
    pub fn recv(&self) -> T {
        loop {
            if let Some(value) = self.inner.queue.try_pop() {
                self.wake_one(&self.inner.senders_waiting);
                return value;
            }

            let proc = sched::current();
            self.inner.receivers_waiting.push(proc);

            if let Some(value) = self.inner.queue.try_pop() {
                self.inner.receivers_waiting.remove(proc);
                self.wake_one(&self.inner.senders_waiting);
                return value;
            }

            self.suspend(proc);
        }
    }

    /// Non-blocking send: returns the value back if the channel is full
    /// rather than parking.
    pub fn try_send(&self, value: T) -> Result<(), T> {
        match self.inner.queue.try_push(value) {
            Ok(()) => {
                self.wake_one(&self.inner.receivers_waiting);
                Ok(())
            }
            Err(v) => Err(v),
        }
    }

    /// Non-blocking receive: returns `None` if the channel is currently
    /// empty rather than parking.
    pub fn try_recv(&self) -> Option<T> {
        let value = self.inner.queue.try_pop()?;
        self.wake_one(&self.inner.senders_waiting);
        Some(value)
    }

    /// Non-blocking bulk send (`spec.md` §4.1/§6's `pushm`): moves as many
    /// of `values`' front items into the channel as fit, waking up to that
    /// many waiting receivers. Returns how many were moved; the rest stay
    /// at the front of `values`.
    pub fn try_send_many(&self, values: &mut VecDeque<T>) -> usize {
        let moved = self.inner.queue.try_pushm(values);
        for _ in 0 .. moved {
            self.wake_one(&self.inner.receivers_waiting);
        }
        moved
    }

    /// Non-blocking bulk receive (`spec.md` §4.1/§6's `popm`): moves up to
    /// `n` values out of the channel into `out`, in FIFO order, waking up
    /// to that many waiting senders. Returns how many were moved.
    pub fn try_recv_many(&self, n: usize, out: &mut VecDeque<T>) -> usize {
        let moved = self.inner.queue.try_popm(n, out);
        for _ in 0 .. moved {
            self.wake_one(&self.inner.senders_waiting);
        }
        moved
    }

    /// Blocking bulk send: repeatedly moves what fits and parks between
    /// attempts until every value in `values` has been sent, following the
    /// same register-before-recheck protocol as [`Channel::send`] to avoid
    /// the lost-wakeup window.
    pub fn send_many(&self, values: &mut VecDeque<T>) {
        while !values.is_empty() {
            if self.try_send_many(values) > 0 {
                continue;
            }

            let proc = sched::current();
            self.inner.senders_waiting.push(proc);

            if self.try_send_many(values) > 0 {
                self.inner.senders_waiting.remove(proc);
                continue;
            }

            self.suspend(proc);
        }
    }

    /// Blocking bulk receive: repeatedly moves what's available into `out`
    /// and parks between attempts until `n` values have been received,
    /// following the same register-before-recheck protocol as
    /// [`Channel::recv`].
    pub fn recv_many(&self, n: usize, out: &mut VecDeque<T>) {
        let mut remaining = n;
        while remaining > 0 {
            remaining -= self.try_recv_many(remaining, out);
            if remaining == 0 {
                break;
            }

            let proc = sched::current();
            self.inner.receivers_waiting.push(proc);

            let moved = self.try_recv_many(remaining, out);
            remaining -= moved;
            if remaining == 0 {
                self.inner.receivers_waiting.remove(proc);
                break;
            }

            self.suspend(proc);
        }
    }

    /// Gives up the CPU for `proc`, already registered in the relevant
    /// waiter list by the caller. Separate from registration (unlike the
    /// single-shot `park_on` this replaces) so [`Channel::send`]/
    /// [`Channel::recv`] can re-check the queue between registering and
    /// actually suspending.
    fn suspend(&self, proc: *mut Process) {
        // SAFETY: `proc` is the process currently running, about to give
        // up the CPU; `crate::process::ProcStat::Waiting` is set before
        // parking so a racing waker sees a consistent status.
        unsafe { (*proc).set_stat(crate::process::ProcStat::Waiting) };
        sched::park();
    }

    fn wake_one(&self, waiters: &Waiters) {
        if let Some(proc) = waiters.pop() {
            // SAFETY: `proc` was parked by `park_on` above and is not
            // linked into any run queue.
            unsafe { sched::wake(&self.inner.global_queues, proc) };
        }
    }
}

/// The closest approximation of a synchronous rendezvous channel this
/// queue representation can offer: a true capacity-1 buffer (one slot, no
/// power-of-two rounding past it), so at most one send can complete ahead
/// of a receiver actually being parked — never two. A true zero-capacity
/// channel would need a ring buffer that supports a single-slot "pending
/// handoff" state distinct from both "empty" and "full", which
/// [`ChannelQueue`] doesn't model; see `DESIGN.md`'s "Open Question:
/// unbuffered channels" section.
#[must_use]
pub fn rendezvous<T: Send + 'static>(global_queues: Arc<[GlobalRunQueue]>) -> Channel<T> {
    Channel::bounded(1, global_queues)
}
