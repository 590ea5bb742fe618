//! End-to-end scenario coverage, one test per numbered scenario. S2
//! (fan-in sum) lives in `demos/fan_in_sum.rs` since it doubles as a
//! runnable example; S3 (timer cancel) and S4 (netpoll echo) live in
//! `timer_test.rs`/`netpoll_test.rs` since they're closer in spirit to
//! those modules' other coverage than to this file's broader scenarios.

use std::{sync::{atomic::{AtomicBool, AtomicUsize, Ordering},
                  mpsc,
                  Arc},
          time::Duration};

use r3bl_csp::{sched, Channel, Runtime, RuntimeConfig};

fn test_runtime(n_cpus: usize, max_threads: usize) -> Runtime {
    Runtime::start(RuntimeConfig::builder().n_cpus(n_cpus).max_threads(max_threads).build()).expect("runtime should start in the test environment")
}

/// S1: a bounded channel of capacity 8, one producer pushing `0..10`
/// (more than the channel can hold at once, so the producer must park at
/// least once), one consumer popping exactly 10 values back out in order.
#[test]
fn s1_channel_echo_preserves_order_through_backpressure() {
    let runtime = test_runtime(2, 4);
    let channel: Channel<u32> = Channel::bounded(8, runtime.global_queues());
    let (done_tx, done_rx) = mpsc::channel();

    let producer_channel = channel.clone();
    runtime
        .spawn("producer", move || {
            for i in 0 .. 10 {
                producer_channel.send(i);
            }
        })
        .unwrap();

    runtime
        .spawn("consumer", move || {
            let received: Vec<u32> = (0 .. 10).map(|_| channel.recv()).collect();
            let _ = done_tx.send(received);
        })
        .unwrap();

    let received = done_rx.recv_timeout(Duration::from_secs(5)).expect("the consumer should collect all 10 values promptly");
    assert_eq!(received, (0 .. 10).collect::<Vec<_>>());

    runtime.shutdown();
}

/// Bulk transfer (`spec.md` §4.1/§6's `pushm`/`popm`): a producer sends
/// `0..20` in one `send_many` call against a channel of capacity 8 (so the
/// batch must park partway through and resume), a consumer drains all 20
/// with one `recv_many` call; both ends must see the same values in order.
#[test]
fn bulk_send_and_receive_preserve_order_through_backpressure() {
    let runtime = test_runtime(2, 4);
    let channel: Channel<u32> = Channel::bounded(8, runtime.global_queues());
    let (done_tx, done_rx) = mpsc::channel();

    let producer_channel = channel.clone();
    runtime
        .spawn("bulk-producer", move || {
            let mut batch: std::collections::VecDeque<u32> = (0 .. 20).collect();
            producer_channel.send_many(&mut batch);
            assert!(batch.is_empty(), "send_many must move every value before returning");
        })
        .unwrap();

    runtime
        .spawn("bulk-consumer", move || {
            let mut out = std::collections::VecDeque::new();
            channel.recv_many(20, &mut out);
            let _ = done_tx.send(out);
        })
        .unwrap();

    let received = done_rx.recv_timeout(Duration::from_secs(5)).expect("the consumer should collect all 20 values promptly");
    assert_eq!(received, (0 .. 20).collect::<std::collections::VecDeque<_>>());

    runtime.shutdown();
}

/// S5: every process is spawned round-robin starting from CPU 0, so
/// pinning every spawn to happen from the main process (itself running
/// before any other process exists, hence always landing on CPU 0's
/// queue first) and then yielding should see the work-stealing path
/// eventually distribute children onto every other CPU too.
#[test]
fn s5_idle_cpus_steal_work_from_a_busy_one() {
    const N_CPUS: usize = 4;
    const CHILDREN: usize = 64;

    let runtime = test_runtime(N_CPUS, N_CPUS + 2);
    let ran_on_cpu = Arc::new((0 .. N_CPUS).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
    let (done_tx, done_rx) = mpsc::channel();
    let remaining = Arc::new(AtomicUsize::new(CHILDREN));

    for _ in 0 .. CHILDREN {
        let ran_on_cpu = Arc::clone(&ran_on_cpu);
        let remaining = Arc::clone(&remaining);
        let done_tx = done_tx.clone();
        runtime
            .spawn("steal-target", move || {
                // However many times this process gets requeued (locally
                // or by a thief), it keeps yielding so the scheduler has
                // plenty of chances to steal it before it finishes.
                for _ in 0 .. 8 {
                    sched::yield_now();
                }
                let cpu = sched::current_cpu_id();
                ran_on_cpu[cpu].fetch_add(1, Ordering::AcqRel);
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let _ = done_tx.send(());
                }
            })
            .unwrap();
    }
    drop(done_tx);

    done_rx.recv_timeout(Duration::from_secs(10)).expect("every spawned child should complete");
    let cpus_that_ran_something = ran_on_cpu.iter().filter(|c| c.load(Ordering::Acquire) > 0).count();
    assert!(cpus_that_ran_something > 1, "work-stealing should spread children across more than one CPU, saw {cpus_that_ran_something}");

    runtime.shutdown();
}

/// S6: a process calls `block{ sleep(100ms) }`, handing its CPU off to a
/// spare pool thread; meanwhile a sibling process pinned to the same CPU
/// keeps incrementing a counter, proving the CPU was not actually stalled
/// by the blocking call.
#[test]
fn s6_block_hands_the_cpu_off_to_a_spare_thread() {
    let runtime = Arc::new(test_runtime(1, 3));
    let counter = Arc::new(AtomicUsize::new(0));
    let blocker_returned = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = mpsc::channel();

    let counter_in_counter_proc = Arc::clone(&counter);
    let blocker_returned_in_counter_proc = Arc::clone(&blocker_returned);
    runtime
        .spawn("counter", move || {
            while !blocker_returned_in_counter_proc.load(Ordering::Acquire) {
                counter_in_counter_proc.fetch_add(1, Ordering::AcqRel);
                sched::yield_now();
            }
        })
        .unwrap();

    let runtime_in_blocker = Arc::clone(&runtime);
    let blocker_returned_in_blocker = Arc::clone(&blocker_returned);
    // `sched::block` itself must run inside a process, so spawn one whose
    // entire body is the blocking call.
    runtime
        .spawn("blocker", move || {
            sched::block(runtime_in_blocker.core_pool(), || std::thread::sleep(Duration::from_millis(100)));
            blocker_returned_in_blocker.store(true, Ordering::Release);
            let _ = done_tx.send(());
        })
        .unwrap();

    done_rx.recv_timeout(Duration::from_secs(5)).expect("the blocker process should return from block() promptly");
    assert!(counter.load(Ordering::Acquire) > 0, "the counter process should have made progress while the blocker was parked on a spare thread");

    let runtime = Arc::try_unwrap(runtime).unwrap_or_else(|_| panic!("no other clone should outlive the test"));
    runtime.shutdown();
}
