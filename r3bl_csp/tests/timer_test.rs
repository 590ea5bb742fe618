//! Integration coverage for timers: [`r3bl_csp::sched::hangup`]'s
//! sleep-and-resume path and [`r3bl_csp::Runtime::timer_after`]/
//! [`r3bl_csp::Runtime::timer_cancel`]'s race between a fired timer and a
//! cancel racing to observe it first.

use std::{sync::{atomic::{AtomicBool, AtomicU64, Ordering},
                  mpsc,
                  Arc},
          time::{Duration, Instant}};

use r3bl_csp::{sched, timer, Runtime, RuntimeConfig};

fn test_runtime() -> Runtime {
    Runtime::start(RuntimeConfig::builder().n_cpus(2).max_threads(4).build()).expect("runtime should start in the test environment")
}

#[test]
fn hangup_resumes_after_roughly_the_requested_delay() {
    let runtime = test_runtime();
    let (tx, rx) = mpsc::channel();

    runtime
        .spawn("sleeper", move || {
            let start = Instant::now();
            sched::hangup(50 * timer::MILLISECOND);
            let _ = tx.send(start.elapsed());
        })
        .unwrap();

    let elapsed = rx.recv_timeout(Duration::from_secs(5)).expect("the sleeper should resume well within the test timeout");
    assert!(elapsed >= Duration::from_millis(45), "resumed too early: {elapsed:?}");

    runtime.shutdown();
}

/// `spec.md` §8's S3: two timers race, the shorter one cancels the
/// longer one from inside its own callback, and the cancelled one must
/// never run.
#[test]
fn timer_cancel_prevents_the_cancelled_timer_from_firing() {
    let runtime = Arc::new(test_runtime());
    let f_ran = Arc::new(AtomicBool::new(false));
    let cancel_succeeded = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = mpsc::channel();

    let f_ran_in_f = Arc::clone(&f_ran);
    let handle_f = runtime.timer_after(2 * timer::SECOND, "timer-f", move || {
        f_ran_in_f.store(true, Ordering::Release);
    }).expect("arming timer f should succeed");

    let runtime_in_g = Arc::clone(&runtime);
    let cancel_succeeded_in_g = Arc::clone(&cancel_succeeded);
    runtime
        .spawn("timer-g-trigger", move || {
            // Runs immediately, well before either timer's deadline.
            let cancelled = runtime_in_g.timer_cancel(handle_f);
            cancel_succeeded_in_g.store(cancelled, Ordering::Release);
            let _ = done_tx.send(());
        })
        .unwrap();

    done_rx.recv_timeout(Duration::from_secs(5)).expect("the cancelling process should run promptly");
    assert!(cancel_succeeded.load(Ordering::Acquire), "cancel must succeed when it races well ahead of the deadline");

    std::thread::sleep(Duration::from_secs(4));
    assert!(!f_ran.load(Ordering::Acquire), "a cancelled timer must never invoke its callback");

    let runtime = Arc::try_unwrap(runtime).unwrap_or_else(|_| panic!("no other clone should outlive the test"));
    runtime.shutdown();
}

#[test]
fn timer_after_runs_the_callback_once_the_deadline_elapses() {
    let runtime = test_runtime();
    let ran_at = Arc::new(AtomicU64::new(0));
    let (tx, rx) = mpsc::channel();

    let ran_at_in_cb = Arc::clone(&ran_at);
    let armed_at = timer::now_ns();
    runtime
        .timer_after(30 * timer::MILLISECOND, "timer-once", move || {
            ran_at_in_cb.store(timer::now_ns() as u64, Ordering::Release);
            let _ = tx.send(());
        })
        .expect("arming the timer should succeed");

    rx.recv_timeout(Duration::from_secs(5)).expect("the timer callback should run within the test timeout");
    let elapsed_ns = ran_at.load(Ordering::Acquire) as i64 - armed_at;
    assert!(elapsed_ns >= 25 * timer::MILLISECOND as i64, "fired too early: {elapsed_ns}ns");

    runtime.shutdown();
}
