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

//! Runtime startup and shutdown.
//!
//! Grounded on `examples/original_source/src/sched.c`'s
//! `csp_sched_start`: a fixed initialization order (core pools, the
//! allocator, netpoll, timer heaps, the monitor, then one thread per CPU)
//! that the original runs as a `__attribute__((constructor))` before
//! `main`. A library has no equivalent hook, so [`Runtime::start`] is an
//! explicit call the host application makes instead, but the ordering and
//! the components it wires together are the same.

use std::sync::{atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
                 Arc};

use crate::{alloc::{ArenaAllocator, StackAllocator},
            config::{CspError, RuntimeConfig},
            core_::{pin_current_thread_to_cpu, Core, CorePool, CpuShared, StarvingRegistry},
            monitor::Monitor,
            netpoll::{Netpoll, NetpollHandle},
            process::{self, Process},
            runqueue::GlobalRunQueue,
            sched,
            timer::TimerHandle};

/// A running instance of the scheduler, allocator, netpoll registry, and
/// monitor thread, plus the thread pool driving them.
///
/// Construct with [`Runtime::start`]; processes spawned with
/// [`Runtime::spawn`] begin running as soon as some core's thread picks
/// them off its global run queue, which can happen on another thread
/// before `spawn` even returns.
pub struct Runtime {
    cpu_shared: Arc<[Arc<CpuShared>]>,
    global_queues: Arc<[GlobalRunQueue]>,
    starving: Arc<StarvingRegistry>,
    alloc: Arc<ArenaAllocator>,
    netpoll: NetpollHandle,
    pool: CorePool,
    core_shutdown: Arc<AtomicBool>,
    monitor_shutdown: Arc<AtomicBool>,
    monitor_thread: Option<std::thread::JoinHandle<()>>,
    next_pid: AtomicU64,
    spawn_cursor: AtomicUsize,
    config: RuntimeConfig,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("n_cpus", &self.cpu_shared.len())
            .field("pool_threads", &self.pool.size())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Brings up a full runtime: one [`CpuShared`] and [`GlobalRunQueue`]
    /// per CPU (`config.effective_cpu_count()`), the shared [`Netpoll`]
    /// registry, the [`Monitor`] thread, and a single [`CorePool`] sized to
    /// `config.max_threads`, whose first `n_cpus` slots start out already
    /// driving a CPU each (what used to be `Runtime::start`'s separate
    /// per-CPU primary threads) and the rest start idle, available to
    /// [`crate::sched::block`]'s hand-offs.
    ///
    /// # Errors
    /// Propagates [`CspError::NetpollInit`]/[`CspError::RlimitUnavailable`]
    /// from [`Netpoll::new`], or [`CspError::ThreadSpawn`] if the monitor
    /// thread fails to start.
    pub fn start(config: RuntimeConfig) -> Result<Self, CspError> {
        let n_cpus = config.effective_cpu_count();

        let cpu_shared: Arc<[Arc<CpuShared>]> = (0 .. n_cpus).map(CpuShared::new).collect();
        let starving = Arc::new(StarvingRegistry::new());
        let queue_capacity = (config.max_procs_hint / n_cpus).max(1).next_power_of_two();
        let global_queues: Arc<[GlobalRunQueue]> =
            (0 .. n_cpus).map(|_| GlobalRunQueue::with_capacity(queue_capacity)).collect();
        let alloc = Arc::new(ArenaAllocator::new(n_cpus));

        let (netpoll, netpoll_handle) = Netpoll::new()?;
        let monitor = Monitor::new(netpoll, Arc::clone(&cpu_shared), Arc::clone(&global_queues), Arc::clone(&starving));
        let monitor_shutdown = monitor.shutdown_handle();
        let monitor_thread = std::thread::Builder::new()
            .name("csp-monitor".to_string())
            .spawn(move || monitor.run())
            .map_err(|e| CspError::ThreadSpawn(usize::MAX, e.to_string()))?;

        let core_shutdown = Arc::new(AtomicBool::new(false));

        let total_threads = config.max_threads.max(n_cpus);
        let initially_assigned: Vec<usize> = (0 .. n_cpus).collect();
        let pool = {
            let cpu_shared = Arc::clone(&cpu_shared);
            let global_queues = Arc::clone(&global_queues);
            let starving = Arc::clone(&starving);
            let alloc: Arc<dyn StackAllocator + Send + Sync> = Arc::clone(&alloc);
            let shutdown = Arc::clone(&core_shutdown);
            CorePool::new(total_threads, &initially_assigned, move |cpu_id| {
                pin_current_thread_to_cpu(cpu_id);
                let core = Core::new(Arc::clone(&cpu_shared[cpu_id]));
                sched::run_core_loop(&core, &cpu_shared, &global_queues, &starving, alloc.as_ref(), &shutdown);
            })
        };

        Ok(Self {
            cpu_shared,
            global_queues,
            starving,
            alloc,
            netpoll: netpoll_handle,
            pool,
            core_shutdown,
            monitor_shutdown,
            monitor_thread: Some(monitor_thread),
            next_pid: AtomicU64::new(1),
            spawn_cursor: AtomicUsize::new(0),
            config,
        })
    }

    /// The number of CPUs this runtime's scheduler actually uses.
    #[must_use]
    pub fn n_cpus(&self) -> usize { self.cpu_shared.len() }

    /// This runtime's per-CPU global run queues, needed by
    /// [`crate::chan::Channel::bounded`] and [`crate::chan::rendezvous`]
    /// to wake whichever CPU a parked process belongs to.
    #[must_use]
    pub fn global_queues(&self) -> Arc<[GlobalRunQueue]> { Arc::clone(&self.global_queues) }

    /// A handle to this runtime's spare-thread pool, needed by
    /// [`crate::sched::block`].
    #[must_use]
    pub fn core_pool(&self) -> &CorePool { &self.pool }

    /// A cloneable handle onto this runtime's shared netpoll registry,
    /// for process code to call
    /// [`crate::netpoll::NetpollHandle::wait_read`]/
    /// [`crate::netpoll::NetpollHandle::wait_write`].
    #[must_use]
    pub fn netpoll(&self) -> &NetpollHandle { &self.netpoll }

    /// Spawns a new process with [`crate::config::DEFAULT_STACK_SIZE`]
    /// and places it on a CPU chosen round-robin across every CPU this
    /// runtime uses.
    ///
    /// # Errors
    /// Propagates [`CspError::Exhausted`] if the chosen CPU's arena
    /// cannot grow to fit the stack.
    pub fn spawn<F>(&self, name: &'static str, entry: F) -> Result<*mut Process, CspError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_with_stack(name, self.config.default_stack_size, entry)
    }

    /// Same as [`Runtime::spawn`] but with an explicit stack size,
    /// matching `spec.md` §9's per-spawn override.
    ///
    /// # Errors
    /// See [`Runtime::spawn`].
    pub fn spawn_with_stack<F>(&self, name: &'static str, stack_len: usize, entry: F) -> Result<*mut Process, CspError>
    where
        F: FnOnce() + Send + 'static,
    {
        let cpu_id = self.spawn_cursor.fetch_add(1, Ordering::Relaxed) % self.cpu_shared.len();
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let proc = process::spawn(self.alloc.as_ref(), cpu_id, pid, name, stack_len, std::ptr::null_mut(), entry)?;
        // SAFETY: `proc` was just created and is linked nowhere else.
        if unsafe { self.global_queues[cpu_id].push(proc) }.is_err() {
            tracing::error!(cpu_id, pid, "global run queue full immediately after spawn");
        }
        Ok(proc)
    }

    /// Spawns one child process per entry in `tasks` and blocks the
    /// *calling process* until every one of them has run to termination
    /// (`spec.md` §4.5's `spawn_sync`, testable property 7: the parent
    /// resumes iff every child has exited, at which point its `nchild` is
    /// back to zero). Children are placed round-robin across every CPU
    /// this runtime uses, same as [`Runtime::spawn`], so they may run on
    /// any CPU via stealing.
    ///
    /// # Panics
    /// Panics if called from a thread with no process currently running
    /// on it — `spawn_sync` is a suspension point a process hits, not a
    /// host-application API (see [`crate::sched::current`]).
    ///
    /// # Errors
    /// Propagates [`CspError::Exhausted`] if any child's stack allocation
    /// fails. Children already spawned before the failing one keep
    /// running, and the parent's `nchild` was set to the full task count
    /// up front, so a failure here leaves the parent waiting on fewer
    /// children than requested — callers should treat a `spawn_sync`
    /// `Err` as fatal to the whole group rather than retrying.
    pub fn spawn_sync(&self, tasks: Vec<(&'static str, Box<dyn FnOnce() + Send + 'static>)>) -> Result<(), CspError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let parent = sched::current();
        // SAFETY: `parent` is the process currently running on this
        // thread; no child can touch `nchild` until it is actually
        // spawned and scheduled, which happens strictly after this store.
        unsafe { (*parent).nchild.store(tasks.len(), Ordering::Release) };

        for (name, entry) in tasks {
            let cpu_id = self.spawn_cursor.fetch_add(1, Ordering::Relaxed) % self.cpu_shared.len();
            let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
            let proc = process::spawn(
                self.alloc.as_ref(),
                cpu_id,
                pid,
                name,
                self.config.default_stack_size,
                parent,
                entry,
            )?;
            // SAFETY: `proc` was just created and is linked nowhere else.
            if unsafe { self.global_queues[cpu_id].push(proc) }.is_err() {
                tracing::error!(cpu_id, pid, "global run queue full immediately after spawn_sync child spawn");
            }
        }

        // SAFETY: `parent` is this thread's own current process, about to
        // be unscheduled; it is not linked into any run queue, the same
        // precondition every other `crate::sched` park path relies on.
        unsafe { (*parent).set_stat(process::ProcStat::Waiting) };
        sched::park();
        Ok(())
    }

    /// Arms `entry` to run `delay_ns` from now, as its own process
    /// (`spec.md` §4.4's `timer_after`). Unlike [`Runtime::spawn`], the
    /// process is not placed on any run queue immediately — it sits
    /// parked on its CPU's [`crate::timer::TimerHeap`] until the monitor
    /// thread's sweep fires it, exactly like a process that called
    /// [`crate::sched::hangup`] for the same delay, except nothing ever
    /// runs until the deadline.
    ///
    /// # Errors
    /// See [`Runtime::spawn`].
    pub fn timer_after<F>(&self, delay_ns: u64, name: &'static str, entry: F) -> Result<TimerHandle, CspError>
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline_ns = crate::timer::now_ns().saturating_add(i64::try_from(delay_ns).unwrap_or(i64::MAX));
        self.timer_at(deadline_ns, name, entry)
    }

    /// Same as [`Runtime::timer_after`] but with an absolute
    /// `CLOCK_MONOTONIC` deadline (`spec.md` §4.4's `timer_at`).
    ///
    /// # Errors
    /// See [`Runtime::spawn`].
    pub fn timer_at<F>(&self, deadline_ns: i64, name: &'static str, entry: F) -> Result<TimerHandle, CspError>
    where
        F: FnOnce() + Send + 'static,
    {
        let cpu_id = self.spawn_cursor.fetch_add(1, Ordering::Relaxed) % self.cpu_shared.len();
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let proc = process::spawn(
            self.alloc.as_ref(),
            cpu_id,
            pid,
            name,
            self.config.default_stack_size,
            std::ptr::null_mut(),
            entry,
        )?;
        // SAFETY: `proc` was just created, is linked nowhere, and has no
        // timer armed yet.
        unsafe {
            (*proc).set_stat(process::ProcStat::Waiting);
        }
        let token = unsafe { self.cpu_shared[cpu_id].timer.lock().arm(proc, deadline_ns) };
        Ok(TimerHandle { proc, token, cpu_id })
    }

    /// Cancels a timer armed by [`Runtime::timer_after`]/
    /// [`Runtime::timer_at`] before it fires. Returns `false` if the timer
    /// already fired (its process is now running, or has already run to
    /// completion) — the caller must not assume the process was stopped.
    /// On a successful cancel, the process never runs at all, so its
    /// stack allocation is reclaimed here since nothing else will.
    pub fn timer_cancel(&self, handle: TimerHandle) -> bool {
        let cancelled = self.cpu_shared[handle.cpu_id].timer.lock().cancel(handle.proc, handle.token);
        if cancelled {
            // SAFETY: a successful cancel means this process never ran
            // and is linked into no run queue; `handle` was the only
            // remaining reference to it.
            unsafe { process::reclaim(self.alloc.as_ref(), handle.cpu_id, handle.proc) };
        }
        cancelled
    }

    /// Signals every [`CorePool`] thread and the monitor thread to stop,
    /// then joins the monitor thread. Processes still runnable at the time
    /// of the call are abandoned mid-stack, matching
    /// `examples/original_source/src/sched.c`'s own `csp_sched_stop`, which
    /// defers to the OS to reclaim everything rather than attempting an
    /// orderly per-process teardown — `spec.md`'s teardown question is
    /// explicitly left open ("the spec allows either"), and this keeps the
    /// original's choice rather than inventing a drain-and-join protocol it
    /// never had.
    ///
    /// [`CorePool`] threads are not joined here. A thread actively driving
    /// a CPU's [`crate::sched::run_core_loop`] observes `core_shutdown` at
    /// the top of its next iteration and returns, rejoining the pool's
    /// idle-wait rather than exiting — the pool has no mechanism to wake an
    /// *already-idle* thread out of that wait, so both busy and idle pool
    /// threads simply outlive this call, parked forever on their condvar.
    /// The process exiting reclaims them, the same way the original never
    /// joins its core-pool threads either.
    pub fn shutdown(mut self) {
        self.core_shutdown.store(true, Ordering::Relaxed);
        self.monitor_shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.monitor_thread.take() {
            let _ = handle.join();
        }
    }
}
