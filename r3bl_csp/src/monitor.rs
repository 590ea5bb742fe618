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

//! The monitor thread: the one place that bridges netpoll readiness and
//! expired timers back into the per-CPU schedulers, and the primary
//! driver of starvation escalation.
//!
//! Grounded on `examples/original_source/src/monitor.c`: a single
//! dedicated thread owns the netpoll `epoll_wait` call and sweeps every
//! CPU's timer heap once per iteration, waking parked processes by
//! pushing them onto their owning CPU's global run queue. When there's
//! nothing to do it backs off exponentially (the original's
//! `usleep(1)` doubling up to a ceiling) instead of spinning, and when it
//! finds a batch of newly-ready processes it hands them out in groups of
//! [`DISTRIBUTE_BATCH`] starting from a pseudo-randomly chosen CPU so
//! repeated bursts don't always pile onto CPU 0 first. `spec.md` §4.6
//! additionally gives the monitor two jobs tied to `crate::core_::
//! StarvingRegistry`: for the first readiness batch of an iteration, if a
//! CPU is registered starving-for-procs, hand the whole batch straight to
//! that CPU's local queue instead of distributing it; and after every
//! distribution pass, wake one starving-for-threads CPU if any is
//! registered, so a core that has descended to a real OS block doesn't
//! wait for its own spin loop to notice new work (it has none to spin on
//! anymore).

use std::{sync::{atomic::{AtomicBool, Ordering},
                  Arc},
          time::Duration};

use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{core_::{CpuShared, StarvingRegistry},
            netpoll::Netpoll,
            process::{ProcStat, Process},
            runqueue::GlobalRunQueue,
            sched,
            timer};

/// Initial and maximum backoff between idle polling iterations, in
/// microseconds. Matches the shape (not the exact constants, which the
/// original tunes for its own workload) of
/// `examples/original_source/src/monitor.c`'s exponential back-off.
const BACKOFF_MIN_US: u64 = 1;
const BACKOFF_MAX_US: u64 = 10_000;

/// The monitor never distributes more than this many processes to global
/// run queues in one pseudo-random rotation; a larger batch is chunked
/// into groups of this size instead, matching `spec.md` §4's note on the
/// distribution batch size.
const DISTRIBUTE_BATCH: usize = 16;

pub struct Monitor {
    netpoll: Netpoll,
    cpu_shared: Arc<[Arc<CpuShared>]>,
    global_queues: Arc<[GlobalRunQueue]>,
    starving: Arc<StarvingRegistry>,
    shutdown: Arc<AtomicBool>,
}

impl Monitor {
    #[must_use]
    pub fn new(
        netpoll: Netpoll,
        cpu_shared: Arc<[Arc<CpuShared>]>,
        global_queues: Arc<[GlobalRunQueue]>,
        starving: Arc<StarvingRegistry>,
    ) -> Self {
        Self {
            netpoll,
            cpu_shared,
            global_queues,
            starving,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> { Arc::clone(&self.shutdown) }

    /// Runs the monitor loop until [`Monitor::shutdown_handle`]'s flag is
    /// set. Intended to be the body of its own dedicated
    /// `std::thread::spawn`, never called from a core's own thread.
    pub fn run(mut self) {
        let mut rng = SmallRng::from_rng(rand::thread_rng()).expect("failed to seed monitor's SmallRng from thread_rng");
        let mut backoff_us = BACKOFF_MIN_US;

        while !self.shutdown.load(Ordering::Relaxed) {
            let timeout = self.next_wait_timeout();
            // `poll_ready` already CAS'd each of these to `NetpollAvail`;
            // requeuing must not stomp that status (see
            // `crate::sched::requeue`'s docs).
            let ready_from_netpoll = self.netpoll.poll_ready(timeout);
            let (plain_wakes, netpoll_timeouts) = self.sweep_timers();

            let did_work = !ready_from_netpoll.is_empty() || !plain_wakes.is_empty() || !netpoll_timeouts.is_empty();

            // Only the first batch of an iteration (netpoll readiness) is
            // eligible for the direct starving-CPU handoff (`spec.md`
            // §4.6); the later timer batches always go through the normal
            // distribution path.
            self.hand_off_or_wake(ready_from_netpoll, &mut rng);
            self.wake_all(plain_wakes, &mut rng);
            self.requeue_all(netpoll_timeouts, &mut rng);

            if let Some(cpu_id) = self.starving.pop_thread() {
                self.cpu_shared[cpu_id].signal_proc_avail();
            }

            if did_work {
                backoff_us = BACKOFF_MIN_US;
            } else {
                std::thread::sleep(Duration::from_micros(backoff_us));
                backoff_us = (backoff_us * 2).min(BACKOFF_MAX_US);
            }
        }
    }

    /// Bounds how long the next `epoll_wait` may block: no longer than
    /// the soonest timer deadline across every core, and no longer than
    /// the current backoff ceiling when nothing is armed at all.
    fn next_wait_timeout(&self) -> Option<Duration> {
        let now = timer::now_ns();
        let soonest = self
            .cpu_shared
            .iter()
            .filter_map(|shared| shared.timer.lock().next_deadline_ns())
            .min()?;
        let remaining_ns = (soonest - now).max(0);
        Some(Duration::from_nanos(remaining_ns as u64))
    }

    /// Drains every CPU's fired timers, splitting them into two batches:
    /// ordinary sleepers (`crate::sched::hangup`, a `spawn_sync` parent
    /// woken indirectly — anything still [`ProcStat::Waiting`]) versus a
    /// [`crate::netpoll::NetpollHandle::wait`] timeout racing readiness,
    /// identified by successfully CAS-ing the process from
    /// [`ProcStat::NetpollWaiting`] to [`ProcStat::NetpollTimeout`]
    /// — the readiness-vs-timeout race. A process whose netpoll wait already won
    /// via [`Netpoll::poll_ready`] has left `NetpollWaiting` by the time
    /// this CAS runs, so it falls through untouched here — the timeout
    /// side correctly observes it already lost.
    fn sweep_timers(&self) -> (Vec<*mut Process>, Vec<*mut Process>) {
        let now = timer::now_ns();
        let mut plain_wakes = Vec::new();
        let mut netpoll_timeouts = Vec::new();
        for shared in self.cpu_shared.iter() {
            let mut heap = shared.timer.lock();
            while let Some(proc) = heap.pop_ready(now) {
                // SAFETY: `proc` was just popped from this CPU's timer
                // heap, which guarantees it is not concurrently touched by
                // anything but this CAS and (for the netpoll case)
                // `Netpoll::poll_ready`'s matching CAS.
                let became_netpoll_timeout = unsafe {
                    (*proc)
                        .stat
                        .compare_exchange(
                            ProcStat::NetpollWaiting as u8,
                            ProcStat::NetpollTimeout as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                };
                if became_netpoll_timeout {
                    netpoll_timeouts.push(proc);
                } else {
                    plain_wakes.push(proc);
                }
            }
        }
        (plain_wakes, netpoll_timeouts)
    }

    /// Wakes each process in `ready` (setting it [`ProcStat::Runnable`]),
    /// starting the hand-out from a pseudo-randomly chosen offset so a
    /// large batch doesn't systematically favor low-numbered CPUs; each
    /// process still goes to *its own* CPU's global queue — a process
    /// must resume on the CPU it last ran on, since its stack and
    /// registers were saved there — the randomness only affects the
    /// order the batch is processed in.
    fn wake_all(&self, ready: Vec<*mut Process>, rng: &mut SmallRng) {
        self.distribute(ready, rng, true);
    }

    /// Same hand-out as [`Monitor::wake_all`], but leaves each process's
    /// already-terminal [`ProcStat`] ([`ProcStat::NetpollAvail`] or
    /// [`ProcStat::NetpollTimeout`]) untouched — see
    /// [`crate::sched::requeue`].
    fn requeue_all(&self, ready: Vec<*mut Process>, rng: &mut SmallRng) {
        self.distribute(ready, rng, false);
    }

    /// `spec.md` §4.6's first-batch special case: if some CPU is
    /// registered starving-for-procs, skip the global-queue distribution
    /// entirely and push the whole batch straight into that CPU's own
    /// local queue, then wake it directly. Falls back to
    /// [`Monitor::requeue_all`]'s normal distribution when no CPU is
    /// currently registered.
    fn hand_off_or_wake(&self, ready: Vec<*mut Process>, rng: &mut SmallRng) {
        if ready.is_empty() {
            return;
        }
        if let Some(victim_cpu) = self.starving.pop_proc() {
            let victim = &self.cpu_shared[victim_cpu];
            let mut handed_off = false;
            for &proc in &ready {
                // Netpoll readiness can span every CPU in use, but a
                // starving CPU's own local queue only ever holds that
                // CPU's processes, so only entries that actually belong
                // to `victim_cpu` are eligible for the direct handoff;
                // the rest still go through the normal distribution path.
                if unsafe { (*proc).cpu_id } == victim_cpu {
                    // SAFETY: `victim_cpu` is registered starving, meaning
                    // its own thread is spin-waiting or deep-asleep and
                    // has stopped touching its own local queue until it
                    // observes the signal sent below.
                    unsafe { victim.local_mut().push_back(proc) };
                    handed_off = true;
                } else {
                    // SAFETY: see `crate::sched::requeue`'s contract.
                    unsafe { sched::requeue(&self.global_queues, proc) };
                }
            }
            if handed_off {
                victim.signal_proc_avail();
            }
            return;
        }
        self.requeue_all(ready, rng);
    }

    fn distribute(&self, ready: Vec<*mut Process>, rng: &mut SmallRng, set_runnable: bool) {
        for chunk in ready.chunks(DISTRIBUTE_BATCH) {
            let start = rng.gen_range(0 .. chunk.len());
            for offset in 0 .. chunk.len() {
                let proc = chunk[(start + offset) % chunk.len()];
                // SAFETY: see `crate::sched::wake`/`requeue`'s contracts;
                // every entry in `ready` was freshly popped from a timer
                // heap or netpoll's readiness queue and is parked nowhere
                // else.
                if set_runnable {
                    unsafe { sched::wake(&self.global_queues, proc) };
                } else {
                    unsafe { sched::requeue(&self.global_queues, proc) };
                }
            }
        }
    }
}
