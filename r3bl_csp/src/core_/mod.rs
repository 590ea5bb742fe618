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

//! A CPU-pinned scheduling context.
//!
//! Grounded on `examples/original_source/src/core.h`: one scheduling
//! context per CPU the runtime uses, each owning a private run queue, a
//! timer heap, and the anchor context the running process's `save` jumps
//! back to. Exactly one kernel thread drives a given CPU's scheduler loop
//! at a time, though *which* thread that is can change across a
//! [`crate::sched::block`] hand-off to the [`pool::CorePool`] — this is
//! why the per-CPU state is split into two types: [`CpuShared`] (the part
//! that must survive a hand-off) and [`Core`] (the part that is private
//! to whichever single OS thread is driving the CPU right now).

pub mod pool;

use std::{cell::{Cell, UnsafeCell},
          collections::VecDeque,
          sync::{atomic::{AtomicU8, Ordering},
                  Arc, Condvar, Mutex}};

pub use pool::CorePool;

use crate::{arch::Anchor, mutex::SpinMutex, process::Process, runqueue::LocalRunQueue, timer::TimerHeap};

/// The state a CPU keeps across a [`crate::sched::block`] hand-off: the
/// run queue and timer heap a process parked on this CPU expects to find
/// again regardless of which kernel thread resumes it. One [`CpuShared`]
/// is created per CPU at [`crate::runtime::Runtime::start`] and lives for
/// the lifetime of the runtime; every [`Core`] activation for that CPU
/// holds an `Arc` clone of the same instance.
pub struct CpuShared {
    pub id: usize,

    /// Touched only by whichever single thread is currently driving this
    /// CPU's scheduler loop — the scheduler never shares it concurrently,
    /// and a [`pool::CorePool`] hand-off only happens at a `save`/`restore`
    /// boundary where the old thread has stopped touching it, or (for the
    /// load-shedding path in [`crate::sched::run_core_loop`] and
    /// [`crate::monitor::Monitor`]) while this CPU is registered in
    /// [`StarvingRegistry`]'s `procs` queue and therefore provably not
    /// touching its own queue until it observes the hand-off.
    local: UnsafeCell<LocalRunQueue>,
    pub timer: SpinMutex<TimerHeap>,

    /// Wakes whichever thread is currently parked idling this CPU, whether
    /// it is still spinning (`ParkState::take_signal`) or has descended to
    /// a real OS block (`ParkState::block_deep`). See `spec.md` §4.5's
    /// `pcond`.
    park: ParkState,
}

impl CpuShared {
    #[must_use]
    pub fn new(id: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            local: UnsafeCell::new(LocalRunQueue::new()),
            timer: SpinMutex::new(TimerHeap::new()),
            park: ParkState::new(),
        })
    }

    /// # Safety
    /// Must only be called by the single thread currently driving this
    /// CPU's scheduler loop (`crate::sched::run_core_loop`), *or* by
    /// another thread performing a load-shedding hand-off while this CPU
    /// is registered in [`StarvingRegistry`]'s `procs` queue (in which
    /// case the registered thread is guaranteed, by the registration
    /// contract, not to touch its own queue until it observes
    /// [`ParkState::signal_proc_avail`]).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn local_mut(&self) -> &mut LocalRunQueue { unsafe { &mut *self.local.get() } }

    /// Best-effort emptiness check for diagnostics and the monitor's
    /// debug `Display` impl; racing with the owning thread can only
    /// produce a stale read, never a torn one.
    #[must_use]
    pub fn local_is_empty_hint(&self) -> bool {
        // SAFETY: reading `len` through a shared reference races only
        // with plain-integer updates on the owning thread.
        unsafe { (*self.local.get()).is_empty() }
    }

    /// Wakes this CPU's idling thread directly, whether it is still
    /// spinning or has descended into [`block_deep`]. See [`Core::
    /// signal_proc_avail`].
    pub fn signal_proc_avail(&self) { self.park.signal_proc_avail(); }
}

/// A CPU's parking/wake signal, shared between whichever thread is
/// currently idling that CPU and anyone trying to hand it work directly
/// (`crate::sched::run_core_loop`'s load-shedding path,
/// `crate::monitor::Monitor`'s starvation hand-off and
/// wake-one-starving-thread step). Backs both the cheap spin-check a
/// newly-idle core does (`take_signal`) and the real OS-level block a
/// core descends to once it has been idle for a while (`block_deep`),
/// matching `spec.md` §4.5's `pcond`: start spinning, then block once
/// truly starved.
struct ParkState {
    signal: AtomicU8,
    woken: Mutex<bool>,
    cv: Condvar,
}

const SIGNAL_NONE: u8 = 0;
const SIGNAL_PROC_AVAIL: u8 = 1;

impl ParkState {
    fn new() -> Self {
        Self {
            signal: AtomicU8::new(SIGNAL_NONE),
            woken: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Non-blocking poll used while still spin-waiting. Clears the signal
    /// if one arrived since the last check.
    fn take_signal(&self) -> bool { self.signal.swap(SIGNAL_NONE, Ordering::Acquire) != SIGNAL_NONE }

    /// Hands this CPU's idling thread a direct work assignment, waking it
    /// whether it is still spinning or has descended into
    /// [`ParkState::block_deep`].
    fn signal_proc_avail(&self) {
        self.signal.store(SIGNAL_PROC_AVAIL, Ordering::Release);
        *self.woken.lock().expect("core park mutex poisoned") = true;
        self.cv.notify_one();
    }

    /// Blocks the calling thread until [`ParkState::signal_proc_avail`]
    /// wakes it, descending all the way to the OS scheduler rather than
    /// spinning. Re-checks `shutdown` at least every 20ms so a runtime
    /// shutdown racing a deep-sleeping core doesn't leave it blocked
    /// indefinitely.
    fn block_deep(&self, shutdown: &std::sync::atomic::AtomicBool) {
        let mut woken = self.woken.lock().expect("core park mutex poisoned");
        loop {
            if *woken {
                break;
            }
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            let (guard, _timeout) = self
                .cv
                .wait_timeout(woken, std::time::Duration::from_millis(20))
                .expect("core park condvar poisoned");
            woken = guard;
        }
        *woken = false;
        self.signal.store(SIGNAL_NONE, Ordering::Relaxed);
    }
}

/// The two queues `spec.md` §4.5's "Park" step and §4.6's monitor loop
/// read and write: CPUs that have started spinning with nothing to run
/// (`procs`, consulted for the load-shedding handoff and the monitor's
/// first-batch direct transfer) and CPUs that have spun for a full second
/// and descended to a real OS block (`threads`, consulted by the monitor's
/// wake-one-starving-thread step). Membership is by CPU id (a plain,
/// `Copy`, globally meaningful key) rather than by core pointer, since a
/// [`Core`] is only valid for the lifetime of one activation and does not
/// outlive a [`crate::sched::block`] hand-off the way the CPU it
/// represents does.
#[derive(Default)]
pub struct StarvingRegistry {
    procs: SpinMutex<VecDeque<usize>>,
    threads: SpinMutex<VecDeque<usize>>,
}

impl StarvingRegistry {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    pub fn register_proc(&self, cpu_id: usize) { self.procs.lock().push_back(cpu_id); }

    /// Best-effort removal: a no-op if `cpu_id` isn't (or is no longer)
    /// registered, which happens whenever a peer core or the monitor
    /// already popped it for a direct hand-off.
    pub fn unregister_proc(&self, cpu_id: usize) { self.procs.lock().retain(|&id| id != cpu_id); }

    pub fn pop_proc(&self) -> Option<usize> { self.procs.lock().pop_front() }

    pub fn register_thread(&self, cpu_id: usize) { self.threads.lock().push_back(cpu_id); }

    pub fn pop_thread(&self) -> Option<usize> { self.threads.lock().pop_front() }
}

/// One activation's worth of per-CPU scheduling state: private to
/// whichever single OS thread is currently driving [`CpuShared`]'s CPU, so
/// (unlike the old unified design this replaces) it needs no `Sync` impl
/// at all — sharing one `Core` between two concurrently-live threads was
/// exactly the soundness hazard this split exists to remove, since
/// `anchor` is a saved-register context tied to whichever native stack
/// frame last called `enter_anchor`.
pub struct Core {
    pub shared: Arc<CpuShared>,

    /// The context [`crate::arch::Arch::save_and_jump_to_anchor`] jumps
    /// back to. Exclusive to this activation's thread, reached through
    /// [`Core::anchor_mut`].
    anchor: UnsafeCell<Anchor>,

    /// The process currently restored on this core, if any. A plain
    /// `Cell` rather than an atomic: only this activation's own thread
    /// ever reads or writes it.
    current: Cell<*mut Process>,

    /// Set by [`crate::sched::block`]'s epilogue once the blocking call
    /// returns: tells [`crate::sched::run_core_loop`] to stop after
    /// requeuing the calling process, so the activating thread can rejoin
    /// [`pool::CorePool`] rather than keep driving a CPU another thread
    /// has since taken over scheduling for.
    retiring: Cell<bool>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("id", &self.shared.id)
            .field("local_len", &self.shared.local_is_empty_hint())
            .field("retiring", &self.retiring.get())
            .finish()
    }
}

impl Core {
    #[must_use]
    pub fn new(shared: Arc<CpuShared>) -> Self {
        Self {
            shared,
            anchor: UnsafeCell::new(Anchor::default()),
            current: Cell::new(std::ptr::null_mut()),
            retiring: Cell::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> usize { self.shared.id }

    #[must_use]
    pub fn current(&self) -> *mut Process { self.current.get() }

    pub fn set_current(&self, proc: *mut Process) { self.current.set(proc); }

    pub fn mark_retiring(&self) { self.retiring.set(true); }

    #[must_use]
    pub fn is_retiring(&self) -> bool { self.retiring.get() }

    /// # Safety
    /// Must only be called by the single thread currently running this
    /// core's scheduler loop (`crate::sched::run_core_loop`), and never
    /// re-entrantly.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn local_mut(&self) -> &mut LocalRunQueue { unsafe { self.shared.local_mut() } }

    /// # Safety
    /// Same contract as [`Core::local_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn anchor_mut(&self) -> &mut Anchor { unsafe { &mut *self.anchor.get() } }

    /// Wakes this CPU's idling thread directly — used by
    /// [`crate::monitor::Monitor`] and by a peer core's load-shedding
    /// handoff, both of which only ever call this after confirming (via
    /// [`StarvingRegistry`]) that this CPU is actually parked waiting.
    pub fn signal_proc_avail(&self) { self.shared.signal_proc_avail(); }
}

/// Pins the calling kernel thread to a single CPU, mirroring
/// `examples/original_source/src/sched.c`'s startup-time
/// `sched_setaffinity` call. Best-effort: some sandboxed/containerized
/// environments deny `sched_setaffinity` outright, in which case the
/// runtime still functions, just without the placement guarantee that
/// lets [`crate::process::TimerSlot`] and the local run queue skip
/// cross-CPU synchronization.
pub fn pin_current_thread_to_cpu(cpu_id: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu_id, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &raw const set);
        if rc != 0 {
            tracing::warn!(cpu_id, "sched_setaffinity failed; continuing without CPU pinning");
        }
    }
}

/// Blocks the calling thread (this CPU's idling thread) until
/// [`Core::signal_proc_avail`] wakes it from elsewhere. Used by
/// [`crate::sched::run_core_loop`] once a CPU has spun idle for a full
/// second and registered itself in [`StarvingRegistry::register_thread`].
pub(crate) fn block_deep(shared: &CpuShared, shutdown: &std::sync::atomic::AtomicBool) {
    shared.park.block_deep(shutdown);
}

/// Non-blocking check used while still within the first second of idling.
pub(crate) fn take_signal(shared: &CpuShared) -> bool { shared.park.take_signal() }
