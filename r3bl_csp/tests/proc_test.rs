//! Integration coverage for process lifecycle: plain [`Runtime::spawn`],
//! [`Runtime::spawn_sync`]'s join-group semantics (a parent resumes only
//! once every child it just spawned has exited), and
//! [`r3bl_csp::sched::yield_now`] cooperating fairly between two
//! processes on the same CPU.

use std::{sync::{atomic::{AtomicUsize, Ordering},
                  mpsc,
                  Arc},
          time::Duration};

use r3bl_csp::{sched, Runtime, RuntimeConfig};

fn test_runtime() -> Runtime {
    Runtime::start(RuntimeConfig::builder().n_cpus(2).max_threads(4).build()).expect("runtime should start in the test environment")
}

#[test]
fn spawn_runs_the_given_closure() {
    let runtime = test_runtime();
    let (tx, rx) = mpsc::channel();
    runtime.spawn("reporter", move || { let _ = tx.send(42); }).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    runtime.shutdown();
}

/// `spec.md` §4.5's testable property 7: `spawn_sync` does not resume the
/// parent until every child has exited, at which point the join group's
/// completion count already reflects every child.
#[test]
fn spawn_sync_blocks_until_every_child_exits() {
    const CHILD_COUNT: usize = 8;

    let runtime = Arc::new(test_runtime());
    let completed_children = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = mpsc::channel();

    let runtime_in_parent = Arc::clone(&runtime);
    let completed_in_parent = Arc::clone(&completed_children);
    runtime
        .spawn("sync-parent", move || {
            let tasks: Vec<(&'static str, Box<dyn FnOnce() + Send>)> = (0 .. CHILD_COUNT)
                .map(|i| {
                    let completed = Arc::clone(&completed_in_parent);
                    let name: &'static str = Box::leak(format!("child-{i}").into_boxed_str());
                    let task: Box<dyn FnOnce() + Send> = Box::new(move || {
                        // Give sibling children a chance to interleave
                        // before this one exits.
                        sched::yield_now();
                        completed.fetch_add(1, Ordering::AcqRel);
                    });
                    (name, task)
                })
                .collect();

            runtime_in_parent.spawn_sync(tasks).expect("spawn_sync should succeed for this test's stack sizes");

            // `spawn_sync` only resumes this process once every child
            // above has run `exit_current`, which happens strictly after
            // the `fetch_add` in its body — so the count must already be
            // `CHILD_COUNT` here.
            let seen = completed_in_parent.load(Ordering::Acquire);
            let _ = done_tx.send(seen);
        })
        .unwrap();

    let seen_by_parent = done_rx.recv_timeout(Duration::from_secs(5)).expect("the parent should resume from spawn_sync promptly");
    assert_eq!(seen_by_parent, CHILD_COUNT);
    assert_eq!(completed_children.load(Ordering::Acquire), CHILD_COUNT);

    let runtime = Arc::try_unwrap(runtime).unwrap_or_else(|_| panic!("no other clone should outlive the test"));
    runtime.shutdown();
}

/// Two processes pinned to the same CPU cooperate via
/// [`sched::yield_now`]: neither one starves the other even though there
/// is no preemption.
#[test]
fn yield_now_lets_sibling_processes_interleave() {
    let runtime = Runtime::start(RuntimeConfig::builder().n_cpus(1).max_threads(2).build()).expect("runtime should start");
    let turns = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = mpsc::channel::<()>();

    for _ in 0 .. 2 {
        let turns = Arc::clone(&turns);
        let done_tx = done_tx.clone();
        runtime
            .spawn("yielder", move || {
                for _ in 0 .. 100 {
                    turns.fetch_add(1, Ordering::AcqRel);
                    sched::yield_now();
                }
                let _ = done_tx.send(());
            })
            .unwrap();
    }
    drop(done_tx);

    for _ in 0 .. 2 {
        done_rx.recv_timeout(Duration::from_secs(5)).expect("both yielders should finish promptly");
    }
    assert_eq!(turns.load(Ordering::Acquire), 200);

    runtime.shutdown();
}
