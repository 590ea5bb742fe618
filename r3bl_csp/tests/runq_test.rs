//! Integration coverage for [`r3bl_csp::runqueue::GlobalRunQueue`] using
//! real [`r3bl_csp::process::Process`] records carved from an
//! [`r3bl_csp::alloc::ArenaAllocator`], rather than the fake records the
//! unit tests next to each run queue build for themselves.

use pretty_assertions::assert_eq;
use r3bl_csp::{alloc::ArenaAllocator, process, runqueue::GlobalRunQueue};

fn spawn_noop(alloc: &ArenaAllocator, pid: u64) -> *mut process::Process {
    process::spawn(alloc, 0, pid, "test", 16 * 1024, std::ptr::null_mut(), || {}).expect("stack allocation should succeed in a fresh arena")
}

#[test]
fn global_queue_is_fifo_and_reports_emptiness() {
    let alloc = ArenaAllocator::new(1);
    let q = GlobalRunQueue::with_capacity(8);
    assert!(q.is_empty_hint());

    let procs: Vec<_> = (0 .. 4).map(|pid| spawn_noop(&alloc, pid)).collect();
    for &p in &procs {
        unsafe { q.push(p) }.expect("queue has room");
    }
    assert!(!q.is_empty_hint());
    assert_eq!(q.len_hint(), 4);

    for &expected in &procs {
        let popped = q.pop().expect("queue should yield what was pushed");
        assert_eq!(unsafe { (*popped).pid }, unsafe { (*expected).pid });
    }
    assert!(q.pop().is_none());

    for p in procs {
        unsafe { process::reclaim(&alloc, 0, p) };
    }
}

#[test]
fn global_queue_rejects_push_past_capacity() {
    let alloc = ArenaAllocator::new(1);
    let q = GlobalRunQueue::with_capacity(2);
    let procs: Vec<_> = (0 .. 2).map(|pid| spawn_noop(&alloc, pid)).collect();
    for &p in &procs {
        unsafe { q.push(p) }.expect("queue has room");
    }
    let overflow = spawn_noop(&alloc, 99);
    assert!(unsafe { q.push(overflow) }.is_err());

    unsafe { process::reclaim(&alloc, 0, overflow) };
    for p in procs {
        let popped = q.pop().unwrap();
        unsafe { process::reclaim(&alloc, 0, popped) };
    }
}
