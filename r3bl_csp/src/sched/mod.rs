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

//! The process-facing half of the scheduler: the functions a running
//! process calls on itself to give up the CPU, block, or exit.
//!
//! Grounded on `examples/original_source/src/sched.c`'s `csp_yield`,
//! `csp_hangup`, and `csp_exit`, and on kingxsp-coio-rs's `Processor::
//! yield_with` for the shape of routing every suspension point through a
//! single current-core lookup. Every function here must only be called
//! from inside a running process's own stack (i.e. from code that is
//! itself running as the body of a [`crate::process::trampoline::spawn`]
//! closure) — there is no preemption, so these are the *only* points
//! where control can move to another process.

use std::cell::Cell;

use crate::{arch::{current::X86_64, Arch},
            core_::{Core, StarvingRegistry},
            process::{ProcStat, Process}};

thread_local! {
    /// The `Core` the calling OS thread is currently running the
    /// scheduler loop for. Set once by [`run_core_loop`] (or by a pool
    /// thread taking over mid-run) and left in place for the lifetime of
    /// that loop.
    static CURRENT_CORE: Cell<*mut Core> = const { Cell::new(std::ptr::null_mut()) };

    /// This CPU's full set of global run queues, needed by
    /// [`exit_current`] to re-queue a `spawn_sync` parent from inside the
    /// exiting child's own context, where nothing else hands the queues
    /// in. Bound alongside `CURRENT_CORE`.
    static CURRENT_GLOBAL_QUEUES: Cell<*const [crate::runqueue::GlobalRunQueue]> =
        const { Cell::new(std::ptr::null()) };

    /// The runtime's shared starvation registry, needed by
    /// [`run_core_loop`]'s load-shedding path to find another core's
    /// [`CpuShared`](crate::core_::CpuShared) to hand work to. Bound
    /// alongside `CURRENT_CORE`.
    static CURRENT_STARVING: Cell<*const StarvingRegistry> = const { Cell::new(std::ptr::null()) };
}

/// Binds the calling OS thread to `core`, `global_queues`, and `starving`
/// for the duration of its scheduler loop. Called once by
/// [`run_core_loop`] before the first [`crate::arch::Arch::enter_anchor`].
pub fn bind_current_core(
    core: *mut Core,
    global_queues: *const [crate::runqueue::GlobalRunQueue],
    starving: *const StarvingRegistry,
) {
    CURRENT_CORE.with(|c| c.set(core));
    CURRENT_GLOBAL_QUEUES.with(|q| q.set(global_queues));
    CURRENT_STARVING.with(|s| s.set(starving));
}

fn with_global_queues<R>(f: impl FnOnce(&[crate::runqueue::GlobalRunQueue]) -> R) -> R {
    CURRENT_GLOBAL_QUEUES.with(|q| {
        let ptr = q.get();
        assert!(!ptr.is_null(), "exit_current called from a thread with no bound global run queues");
        // SAFETY: `ptr` was bound by `bind_current_core` with the same
        // `Arc<[GlobalRunQueue]>` the runtime keeps alive for as long as
        // any core thread runs.
        unsafe { f(&*ptr) }
    })
}

fn with_starving<R>(f: impl FnOnce(&StarvingRegistry) -> R) -> R {
    CURRENT_STARVING.with(|s| {
        let ptr = s.get();
        assert!(!ptr.is_null(), "sched operation called from a thread with no bound starvation registry");
        // SAFETY: `ptr` was bound by `bind_current_core` with the same
        // `Arc<StarvingRegistry>` the runtime keeps alive for as long as
        // any core thread runs.
        unsafe { f(&*ptr) }
    })
}

fn with_core<R>(f: impl FnOnce(&mut Core) -> R) -> R {
    CURRENT_CORE.with(|c| {
        let ptr = c.get();
        assert!(
            !ptr.is_null(),
            "sched operation called from a thread with no bound Core — \
             only code running inside a spawned process may call crate::sched functions"
        );
        // SAFETY: `ptr` was bound by `bind_current_core` and only the
        // binding thread ever dereferences it.
        unsafe { f(&mut *ptr) }
    })
}

fn current_process(core: &Core) -> *mut Process {
    let proc = core.current();
    assert!(!proc.is_null(), "no process is currently running on this core");
    proc
}

/// Gives up the CPU, re-queuing the calling process onto its own core's
/// local run queue so it is likely to run again soon. This is the
/// standard yield point a process calls voluntarily between units of
/// work.
pub fn yield_now() {
    with_core(|core| {
        let proc = current_process(core);
        // SAFETY: `proc` is this core's current process, about to be
        // unscheduled; it is not linked into any run queue yet.
        unsafe {
            (*proc).set_stat(ProcStat::Runnable);
            core.local_mut().push_back(proc);
            X86_64::save_and_jump_to_anchor(proc, core.anchor_mut());
        }
    });
}

/// Sleeps the calling process for at least `ns` nanoseconds: arms its
/// timer slot on this core's own [`crate::timer::TimerHeap`] for
/// `now + ns`, marks it [`ProcStat::Waiting`], and parks. `crate::monitor`
/// sweeps the heap once the deadline elapses and re-queues the process
/// onto this CPU's global run queue — never the local one, since the
/// wake happens from the monitor thread, not from this core's own loop
/// (`examples/original_source/src/sched.c`'s `csp_hangup`).
///
/// # Panics
/// Panics if `ns` overflows `i64` nanoseconds from the current monotonic
/// time, which in practice requires asking to sleep for centuries.
pub fn hangup(ns: u64) {
    with_core(|core| {
        let proc = current_process(core);
        let deadline_ns = crate::timer::now_ns()
            .checked_add(i64::try_from(ns).expect("hangup: sleep duration overflows i64 nanoseconds"))
            .expect("hangup: deadline overflows i64 nanoseconds");
        unsafe {
            (*proc).set_stat(ProcStat::Waiting);
            // SAFETY: `proc` is this core's own current process, which
            // cannot already have a timer armed on this heap — a process
            // only ever arms one timer at a time and always does so from
            // its own core.
            core.shared.timer.lock().arm(proc, deadline_ns);
            X86_64::save_and_jump_to_anchor(proc, core.anchor_mut());
        }
    });
}

/// Returns the process currently running on the calling thread's bound
/// core. Used by [`crate::chan::Channel`] to link itself into a waiter
/// list before parking.
///
/// # Panics
/// Panics under the same conditions as every other function in this
/// module: no core bound, or no process currently running on it.
#[must_use]
pub fn current() -> *mut Process { with_core(current_process) }

/// The CPU id of the calling thread's bound core.
#[must_use]
pub fn current_cpu_id() -> usize { with_core(Core::id) }

/// Re-queues `proc` (parked by some earlier [`park`] call, running on a
/// *different* process's context) onto its own CPU's global run queue.
/// Used by [`crate::chan::Channel`] and [`crate::netpoll`]/[`crate::
/// timer`] consumers to wake a process that isn't the one currently
/// executing.
///
/// # Safety
/// `proc` must currently be parked (not linked into any run queue, not
/// executing) and not concurrently being woken by anything else.
pub unsafe fn wake(global_queues: &[crate::runqueue::GlobalRunQueue], proc: *mut Process) {
    unsafe { (*proc).set_stat(ProcStat::Runnable) };
    unsafe { requeue(global_queues, proc) };
}

/// Re-queues `proc` onto its own CPU's global run queue without touching
/// its [`ProcStat`]. Used where the caller already left a terminal status
/// in place that the process itself must observe on resume —
/// [`crate::netpoll::Netpoll::poll_ready`]'s CAS to
/// [`ProcStat::NetpollAvail`], and `crate::monitor`'s timer sweep CAS to
/// [`ProcStat::NetpollTimeout`] — where stomping the status to
/// [`ProcStat::Runnable`] the way [`wake`] does would erase the very
/// signal [`crate::netpoll::NetpollHandle::wait`] reads right after
/// parking.
///
/// # Safety
/// Same contract as [`wake`].
pub unsafe fn requeue(global_queues: &[crate::runqueue::GlobalRunQueue], proc: *mut Process) {
    let cpu_id = unsafe { (*proc).cpu_id };
    let queue = &global_queues[cpu_id];
    // SAFETY: `proc` is not linked anywhere else per this function's
    // contract.
    if unsafe { queue.push(proc) }.is_err() {
        tracing::error!(cpu_id, "global run queue full while requeuing a parked process");
    }
}

/// Arms a timeout for `proc` (which must be this thread's bound core's
/// current process) on that core's own timer heap. Used by
/// [`crate::netpoll::NetpollHandle::wait`] to race a timeout against
/// readiness.
///
/// # Safety
/// `proc` must not already have a timer armed on this core's heap.
pub unsafe fn arm_current_core_timer(proc: *mut Process, deadline_ns: i64) -> i64 {
    with_core(|core| unsafe { core.shared.timer.lock().arm(proc, deadline_ns) })
}

/// Cancels a timeout armed by [`arm_current_core_timer`] on the calling
/// thread's bound core, returning whether cancellation won the race
/// against the timer firing.
pub fn cancel_current_core_timer(proc: *mut Process, token: i64) -> bool {
    with_core(|core| core.shared.timer.lock().cancel(proc, token))
}

/// Parks the calling process (already transitioned to
/// [`ProcStat::Waiting`] by the caller — channel send/recv and timer
/// sleep do this before calling `park`) and gives up the CPU without
/// re-queueing it anywhere. Some other part of the system (a channel's
/// matching operation, the monitor thread observing timer or netpoll
/// readiness) is responsible for later re-queuing it.
pub fn park() {
    with_core(|core| {
        let proc = current_process(core);
        unsafe {
            X86_64::save_and_jump_to_anchor(proc, core.anchor_mut());
        }
    });
}

/// Hands this CPU's scheduling duties to a spare thread from `pool`
/// (best-effort — see [`crate::core_::pool::CorePool::activate`]) and
/// runs `f`, a syscall or computation that may block the OS thread for a
/// while. Every other process pinned to this CPU continues running on
/// whichever thread the pool handed over to.
///
/// Once `f` returns, this thread no longer owns this CPU's scheduling —
/// the activated spare does — so the calling process cannot simply keep
/// running here. It re-queues itself onto its own CPU's global run queue
/// (so whichever thread is now driving that CPU, or another one stealing
/// from it, picks it up) and jumps back to this activation's own anchor,
/// which lands back in [`run_core_loop`] just long enough for it to
/// notice [`Core::is_retiring`] and return, letting this thread rejoin
/// `pool` as a new spare. Grounded on
/// `examples/original_source/src/corepool.c`'s activation protocol.
pub fn block<F, R>(pool: &crate::core_::pool::CorePool, f: F) -> R
where
    F: FnOnce() -> R,
{
    let cpu_id = with_core(Core::id);
    pool.activate(cpu_id);
    let result = f();

    with_core(|core| {
        let proc = current_process(core);
        core.mark_retiring();
        // SAFETY: `proc` is this core's current process, about to be
        // unscheduled; it is not linked into any run queue yet. The
        // spare `pool.activate` handed this CPU to (or the thread that
        // already owned it, if every spare was busy) will pick it up
        // from the global queue.
        unsafe {
            with_global_queues(|gq| wake(gq, proc));
            X86_64::save_and_jump_to_anchor(proc, core.anchor_mut());
        }
    });

    result
}

/// Terminates the calling process. If it was spawned via
/// [`crate::runtime::Runtime::spawn_sync`], decrements its parent's
/// `nchild` and, on the transition to zero, re-queues the parent
/// (the parent was parked in [`crate::runtime::Runtime::spawn_sync`]
/// waiting for exactly this). Marks itself
/// [`ProcStat::Exited`] and jumps to the anchor; the scheduler loop
/// notices the exited status the next time it looks at `core.current()`
/// and reclaims the stack (`crate::process::trampoline::reclaim`)
/// instead of re-restoring it. Never returns.
pub fn exit_current() -> ! {
    with_core(|core| {
        let proc = current_process(core);
        unsafe {
            let parent = (*proc).parent;
            if !parent.is_null() {
                let remaining = (*parent).nchild.fetch_sub(1, std::sync::atomic::Ordering::AcqRel) - 1;
                if remaining == 0 {
                    // SAFETY: `parent` was parked by `Runtime::spawn_sync`
                    // (status `Waiting`, unlinked from every run queue)
                    // and stays that way until exactly one child observes
                    // this zero transition.
                    with_global_queues(|gq| wake(gq, parent));
                }
            }
            (*proc).set_stat(ProcStat::Exited);
            X86_64::save_and_jump_to_anchor(proc, core.anchor_mut());
        }
    });
    unreachable!("a process's anchor jump on exit must never be resumed")
}

/// The core-facing half of the scheduler: the loop a thread runs for as
/// long as it drives a given CPU (modulo [`block`] hand-offs, which end
/// this call early via [`Core::mark_retiring`] so the thread can rejoin
/// its [`crate::core_::pool::CorePool`]), alternating between restoring a
/// process and being jumped back into when that process yields, hangs
/// up, parks, or exits.
///
/// Grounded on `examples/original_source/src/sched.c`'s `csp_sched_get`
/// and the run loop it drives, and on kingxsp-coio-rs's `Processor::
/// schedule` for the local-then-global-then-steal search order. The idle
/// path (nothing local, global, or stealable) follows `spec.md` §4.5's
/// "Park" step: register in `starving`'s `procs` queue and spin-check for
/// a direct hand-off; once a full second has passed with nothing,
/// escalate to `threads` and block for real rather than keep spinning.
/// Finding work also runs `spec.md` §4.5's load-shedding clause: if the
/// local queue still has more than what was just taken and some other CPU
/// is registered starving, hand it half directly instead of making it
/// wait for `crate::monitor::Monitor`'s next sweep.
pub fn run_core_loop(
    core: &Core,
    cpu_shared: &[std::sync::Arc<crate::core_::CpuShared>],
    global_queues: &[crate::runqueue::GlobalRunQueue],
    starving: &crate::core_::StarvingRegistry,
    alloc: &dyn crate::alloc::StackAllocator,
    shutdown: &std::sync::atomic::AtomicBool,
) {
    use std::sync::atomic::Ordering;

    bind_current_core(
        std::ptr::from_ref(core).cast_mut(),
        std::ptr::from_ref(global_queues),
        std::ptr::from_ref(starving),
    );

    let cpu_id = core.id();
    const ONE_SECOND_NS: i64 = 1_000_000_000;

    // `Some(_)` once this core has registered itself in `starving`'s
    // `procs` queue; cleared the moment it finds work or is handed some
    // directly. `true` once it has further escalated into `threads` and
    // descended to a real OS block.
    let mut idle_since_ns: Option<i64> = None;
    let mut registered_thread = false;

    while !shutdown.load(Ordering::Relaxed) {
        // SAFETY: `core.anchor` is this core's own anchor; the first
        // iteration populates it fresh, later iterations are arrived at
        // via some process's `save_and_jump_to_anchor`.
        unsafe { X86_64::enter_anchor(core.anchor_mut()) };

        let just_ran = core.current();
        if !just_ran.is_null() {
            // SAFETY: `just_ran` was this core's `current` until its own
            // save brought control back here; nothing else touches it
            // between the jump and this check.
            if unsafe { (*just_ran).stat() } == ProcStat::Exited {
                // SAFETY: the process has exited and is unlinked from
                // every run queue; this core is the one that last ran it.
                unsafe { crate::process::reclaim(alloc, cpu_id, just_ran) };
            }
            core.set_current(std::ptr::null_mut());
        }

        if core.is_retiring() {
            // `block`'s epilogue already requeued `just_ran`; this thread
            // is done driving this CPU and must rejoin the pool rather
            // than keep scheduling on its behalf.
            break;
        }

        // SAFETY: `local_mut` is sound here because this loop is the
        // only place that ever calls it for this core, and it never
        // re-enters itself (a process's own `save` always returns
        // control to the top of this same loop iteration, not into a
        // nested call).
        //
        // `spec.md` §4.5 step 1: on a forced miss (every 32nd pop), try
        // the global queue first, then fall back to the local queue
        // before escalating to cross-CPU `steal`. Without the fall-back,
        // a forced miss with an empty global queue would report `None`
        // even though the local queue still holds ready work, sending
        // this core into `starving.register_proc` — a promise (see
        // `monitor.rs`'s and this function's own load-shedding path) that
        // it has stopped touching its own local queue, which the very
        // next iteration's `pop_front` would break.
        let next = unsafe { core.local_mut() }.pop_front().or_else(|| {
            global_queues[cpu_id].pop().or_else(|| unsafe { core.local_mut() }.pop_front_unconditional())
        }).or_else(|| steal(cpu_id, global_queues));

        match next {
            Some(proc) => {
                if idle_since_ns.take().is_some() {
                    starving.unregister_proc(cpu_id);
                }
                registered_thread = false;

                // Load-shedding: give a starving peer half of what's left
                // in our own local queue, directly, rather than leaving it
                // for the monitor's next sweep.
                if unsafe { core.local_mut() }.len() >= 1 {
                    if let Some(victim_cpu) = starving.pop_proc() {
                        if victim_cpu == cpu_id {
                            // Raced with our own registration from a
                            // previous idle spell; nothing to hand off to
                            // ourselves.
                            starving.unregister_proc(victim_cpu);
                        } else {
                            // SAFETY: `victim_cpu` is registered starving,
                            // meaning its own thread is spin-waiting or
                            // deep-asleep and has stopped touching its own
                            // local queue until it observes the signal
                            // this sends.
                            unsafe { core.local_mut().steal_half_into(cpu_shared[victim_cpu].local_mut()) };
                            cpu_shared[victim_cpu].signal_proc_avail();
                        }
                    }
                }

                core.set_current(proc);
                // SAFETY: `proc` was just dequeued, is not running
                // anywhere else, and is fully initialized.
                unsafe { X86_64::restore(proc) }
            }
            None => {
                let now = crate::timer::now_ns();
                match idle_since_ns {
                    None => {
                        idle_since_ns = Some(now);
                        starving.register_proc(cpu_id);
                        std::thread::yield_now();
                    }
                    Some(_) if crate::core_::take_signal(&core.shared) => {
                        // A direct hand-off arrived (load-shedding or the
                        // monitor's first-batch transfer): work is already
                        // sitting in our local queue.
                        starving.unregister_proc(cpu_id);
                        idle_since_ns = None;
                        registered_thread = false;
                    }
                    Some(since) if !registered_thread && now - since >= ONE_SECOND_NS => {
                        starving.unregister_proc(cpu_id);
                        starving.register_thread(cpu_id);
                        registered_thread = true;
                        crate::core_::block_deep(&core.shared, shutdown);
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        idle_since_ns = None;
                        registered_thread = false;
                    }
                    Some(_) => std::thread::yield_now(),
                }
            }
        }
    }
}

/// Tries every other CPU's global run queue in turn; the local run
/// queues themselves are never reached into from outside their owning
/// thread (see `crate::core_::Core::local_mut`'s safety contract), so
/// cross-CPU stealing only ever sees what's already been pushed to a
/// global queue.
fn steal(own_cpu: usize, global_queues: &[crate::runqueue::GlobalRunQueue]) -> Option<*mut Process> {
    global_queues.iter().enumerate().filter(|&(i, _)| i != own_cpu).find_map(|(_, q)| q.pop())
}
