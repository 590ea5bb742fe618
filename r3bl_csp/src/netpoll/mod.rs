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

//! Edge-triggered network readiness polling.
//!
//! Grounded on `examples/original_source/src/netpoll.c`: a single
//! `epoll` descriptor shared by every process doing non-blocking I/O, and
//! a flat waiter table indexed by file descriptor rather than a hash map,
//! sized once at startup to `RLIMIT_NOFILE`'s hard limit so a later `fd`
//! never needs the table to grow. `tui`'s
//! `core::terminal_io::resilient_reactor_thread` (`examples/r3bl-org-
//! r3bl-open-core/tui/`) is the other grounding point in this corpus for
//! driving `mio` from a dedicated thread with a bounded wait.
//!
//! The readiness/timeout race — a process can be
//! parked on both a netpoll wait and a timer simultaneously, and either
//! the monitor's `epoll_wait` or its timer sweep might observe the
//! "winning" condition first — is resolved the same way
//! `examples/original_source/src/netpoll.c` resolves it: a single
//! compare-and-swap on [`crate::process::ProcStat`] decides which side
//! gets to requeue the process, and the loser's observation is simply
//! discarded.

use std::sync::{atomic::{AtomicPtr, Ordering},
                 Arc};

use mio::{unix::SourceFd, Events, Interest, Poll, Registry, Token};

use crate::{config::CspError,
            process::{ProcStat, Process},
            sched};

/// One waiter table slot per possible file descriptor.
struct Waiter {
    proc: AtomicPtr<Process>,
}

impl Default for Waiter {
    fn default() -> Self {
        Self {
            proc: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

/// The registration side of the netpoll registry, shared (cheaply
/// cloneable, thread-safe) between every process that parks on a file
/// descriptor and the one [`Netpoll`] instance the monitor thread owns.
/// Built from the same `waiters` table and a [`mio::Registry`] cloned out
/// of the [`Poll`] instance — `Registry::register`/`deregister` are safe
/// to call concurrently with an in-flight `Poll::poll` at the OS level,
/// so no lock is needed between this and [`Netpoll::poll_ready`].
struct Shared {
    registry: Registry,
    waiters: Box<[Waiter]>,
}

#[derive(Clone)]
pub struct NetpollHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for NetpollHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetpollHandle").field("waiter_table_len", &self.shared.waiters.len()).finish()
    }
}

impl NetpollHandle {
    /// Arms `fd` for `interest` and parks `proc` in the waiter table.
    /// `proc`'s status must already be [`ProcStat::NetpollWaiting`] before
    /// this is called (set by the caller just before yielding control
    /// back to the core); this only wires up the fd side.
    ///
    /// # Errors
    /// [`CspError::InvalidFd`] if `fd` is outside the waiter table built
    /// from `RLIMIT_NOFILE` at startup.
    ///
    /// # Safety
    /// `proc` must remain valid and parked until either
    /// [`Netpoll::poll_ready`] observes it or [`NetpollHandle::deregister`]
    /// is called for the same `fd`.
    pub unsafe fn register(&self, fd: i32, interest: Interest, proc: *mut Process) -> Result<(), CspError> {
        let slot = self.slot_for(fd)?;
        slot.proc.store(proc, Ordering::Release);
        let mut source = SourceFd(&fd);
        self.shared
            .registry
            .register(&mut source, Token(fd as usize), interest)
            .or_else(|_| self.shared.registry.reregister(&mut source, Token(fd as usize), interest))
            .map_err(|e| CspError::NetpollInit(e.to_string()))
    }

    /// Removes `fd` from interest and clears its waiter slot, discarding
    /// whatever process pointer (if any) was parked there. Used when a
    /// process's wait times out first and the fd side must be told to
    /// stop caring.
    pub fn deregister(&self, fd: i32) -> Result<(), CspError> {
        let slot = self.slot_for(fd)?;
        slot.proc.store(std::ptr::null_mut(), Ordering::Release);
        let mut source = SourceFd(&fd);
        // Best-effort: if the fd was already closed, there's nothing to
        // deregister, which mio reports as an error we don't care about.
        let _ = self.shared.registry.deregister(&mut source);
        Ok(())
    }

    fn slot_for(&self, fd: i32) -> Result<&Waiter, CspError> {
        self.shared
            .waiters
            .get(usize::try_from(fd).map_err(|_| CspError::InvalidFd(fd))?)
            .ok_or(CspError::InvalidFd(fd))
    }

    /// Parks the calling process until `fd` is ready for `interest`, or
    /// `timeout_ns` elapses if given. Must be called from
    /// inside a running process. Returns the final [`ProcStat`], which is
    /// always [`ProcStat::NetpollAvail`] or [`ProcStat::NetpollTimeout`]:
    /// whichever side of the readiness/timeout race
    /// (`crate::monitor`'s timer sweep vs. [`Netpoll::poll_ready`]) won
    /// the CAS on this process's status.
    ///
    /// # Errors
    /// [`CspError::InvalidFd`] if `fd` is outside the waiter table.
    pub fn wait(&self, fd: i32, interest: Interest, timeout_ns: Option<u64>) -> Result<ProcStat, CspError> {
        let proc = sched::current();
        // SAFETY: `proc` is the process currently running, about to give
        // up the CPU; its status is set to `NetpollWaiting` before
        // registering so a racing readiness/timeout observer always sees
        // a consistent pre-wait state.
        unsafe { (*proc).set_stat(ProcStat::NetpollWaiting) };
        // SAFETY: `proc` stays parked until this function observes the
        // winning side below.
        unsafe { self.register(fd, interest, proc) }?;

        let armed_token = timeout_ns.map(|ns| {
            let deadline_ns = crate::timer::now_ns().saturating_add(i64::try_from(ns).unwrap_or(i64::MAX));
            // SAFETY: this process has no other timer armed on its own
            // core — a process only ever waits on one suspension point at
            // a time.
            unsafe { sched::arm_current_core_timer(proc, deadline_ns) }
        });

        sched::park();

        // SAFETY: `proc` is this process itself, now resumed; reading its
        // own status is always sound.
        let final_stat = unsafe { (*proc).stat() };
        match (final_stat, armed_token) {
            (ProcStat::NetpollAvail, Some(token)) => {
                sched::cancel_current_core_timer(proc, token);
            }
            (ProcStat::NetpollTimeout, _) => {
                self.deregister(fd)?;
            }
            _ => {}
        }
        Ok(final_stat)
    }

    /// Shorthand for [`NetpollHandle::wait`] with [`Interest::READABLE`].
    pub fn wait_read(&self, fd: i32, timeout_ns: Option<u64>) -> Result<ProcStat, CspError> { self.wait(fd, Interest::READABLE, timeout_ns) }

    /// Shorthand for [`NetpollHandle::wait`] with [`Interest::WRITABLE`].
    pub fn wait_write(&self, fd: i32, timeout_ns: Option<u64>) -> Result<ProcStat, CspError> {
        self.wait(fd, Interest::WRITABLE, timeout_ns)
    }
}

/// The monitor-thread-owned half of the netpoll registry: the `epoll`
/// instance itself. Registration and deregistration go through the
/// cloneable [`NetpollHandle`] instead, so any process can call them
/// without contending with [`Netpoll::poll_ready`]'s blocking wait.
pub struct Netpoll {
    poll: Poll,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Netpoll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Netpoll").field("waiter_table_len", &self.shared.waiters.len()).finish()
    }
}

impl Netpoll {
    /// Builds the registry, sizing the waiter table to
    /// `getrlimit(RLIMIT_NOFILE).rlim_max`, and returns both the
    /// monitor-owned [`Netpoll`] and a [`NetpollHandle`] for every
    /// process to share.
    ///
    /// # Errors
    /// [`CspError::RlimitUnavailable`] if `getrlimit` fails;
    /// [`CspError::NetpollInit`] if `epoll_create` (via `mio::Poll::new`)
    /// or cloning its registry fails.
    pub fn new() -> Result<(Self, NetpollHandle), CspError> {
        let max_fds = max_fd_count()?;
        let poll = Poll::new().map_err(|e| CspError::NetpollInit(e.to_string()))?;
        let registry = poll.registry().try_clone().map_err(|e| CspError::NetpollInit(e.to_string()))?;
        let waiters = (0 .. max_fds).map(|_| Waiter::default()).collect::<Vec<_>>().into_boxed_slice();
        let shared = Arc::new(Shared { registry, waiters });
        let handle = NetpollHandle { shared: Arc::clone(&shared) };
        Ok((Self { poll, shared }, handle))
    }

    /// Blocks up to `timeout` for readiness events, and for each one whose
    /// waiter slot still holds a live process, wins the readiness/timeout
    /// race by CAS-ing that process from [`ProcStat::NetpollWaiting`] to
    /// [`ProcStat::NetpollAvail`]. Returns the processes that won (i.e.
    /// whose requeue this call is now responsible for, via
    /// [`crate::sched::requeue`] — never [`crate::sched::wake`], which
    /// would stomp the `NetpollAvail` status just set) — a process whose
    /// timer fired first and already transitioned it out of
    /// `NetpollWaiting` is silently skipped.
    ///
    /// Called only from the monitor thread (`crate::monitor`).
    pub fn poll_ready(&mut self, timeout: Option<std::time::Duration>) -> Vec<*mut Process> {
        let mut events = Events::with_capacity(256);
        if self.poll.poll(&mut events, timeout).is_err() {
            return Vec::new();
        }
        let mut ready = Vec::with_capacity(events.iter().count());
        for event in &events {
            let fd = event.token().0;
            let Some(slot) = self.shared.waiters.get(fd) else { continue };
            let proc = slot.proc.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if proc.is_null() {
                continue;
            }
            // SAFETY: `proc` is non-null and was stored by
            // `NetpollHandle::register` under the contract that it stays
            // valid until observed here or deregistered.
            let won = unsafe { &*proc }
                .stat
                .compare_exchange(
                    ProcStat::NetpollWaiting as u8,
                    ProcStat::NetpollAvail as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
            if won {
                ready.push(proc);
            }
        }
        ready
    }
}

/// `getrlimit(RLIMIT_NOFILE).rlim_max`, the upper bound on any fd this
/// process could ever be asked to poll.
fn max_fd_count() -> Result<usize, CspError> {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: `RLIMIT_NOFILE` is a valid resource; `limit` is a valid
    // out-pointer.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &raw mut limit) };
    if rc != 0 {
        return Err(CspError::RlimitUnavailable);
    }
    // `rlim_max` can be `RLIM_INFINITY` on some systems; cap it to
    // something the waiter table can actually afford to allocate.
    Ok((limit.rlim_max as usize).min(1 << 20))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_fd_outside_waiter_table() {
        let (_netpoll, handle) = Netpoll::new().expect("epoll_create should succeed in test environments");
        let huge_fd = i32::try_from(handle.shared.waiters.len()).unwrap_or(i32::MAX) + 1;
        assert!(matches!(handle.deregister(huge_fd), Err(CspError::InvalidFd(_))));
    }
}
