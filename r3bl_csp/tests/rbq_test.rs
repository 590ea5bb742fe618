//! Integration-level coverage for the lock-free ring buffer
//! ([`r3bl_csp::rbq::RingBuffer`]) beyond the unit tests living next to
//! its implementation: capacity rounding, FIFO ordering under a single
//! thread, and genuine concurrent MPMC traffic.

use std::sync::{atomic::{AtomicUsize, Ordering},
                 Arc};

use pretty_assertions::assert_eq;
use r3bl_csp::rbq::{Multi, RingBuffer};
use test_case::test_case;

#[test_case(1, 1)]
#[test_case(2, 2)]
#[test_case(3, 4)]
#[test_case(5, 8)]
#[test_case(16, 16)]
#[test_case(17, 32)]
fn capacity_rounds_up_to_a_power_of_two(requested: usize, expected: usize) {
    let q: RingBuffer<u32> = RingBuffer::with_capacity(requested);
    assert_eq!(q.capacity(), expected);
}

#[test]
fn fifo_order_single_threaded() {
    let q: RingBuffer<u32> = RingBuffer::with_capacity(16);
    for i in 0 .. 10 {
        q.try_push(i).unwrap();
    }
    for i in 0 .. 10 {
        assert_eq!(q.try_pop(), Some(i));
    }
    assert_eq!(q.try_pop(), None);
}

#[test]
fn rejects_push_past_capacity() {
    let q: RingBuffer<u32> = RingBuffer::with_capacity(2);
    q.try_push(1).unwrap();
    q.try_push(2).unwrap();
    assert_eq!(q.try_push(3), Err(3));
}

#[test]
fn concurrent_producers_and_consumers_preserve_every_item() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 5_000;

    let q: Arc<RingBuffer<usize, Multi, Multi>> = Arc::new(RingBuffer::with_capacity(64));
    let consumed = Arc::new(AtomicUsize::new(0));
    let seen_sum = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|scope| {
        for p in 0 .. PRODUCERS {
            let q = Arc::clone(&q);
            scope.spawn(move || {
                for i in 0 .. PER_PRODUCER {
                    let value = p * PER_PRODUCER + i;
                    loop {
                        if q.try_push(value).is_ok() {
                            break;
                        }
                        std::thread::yield_now();
                    }
                }
            });
        }

        for _ in 0 .. PRODUCERS {
            let q = Arc::clone(&q);
            let consumed = Arc::clone(&consumed);
            let seen_sum = Arc::clone(&seen_sum);
            scope.spawn(move || {
                while consumed.load(Ordering::Relaxed) < PRODUCERS * PER_PRODUCER {
                    if let Some(value) = q.try_pop() {
                        seen_sum.fetch_add(value, Ordering::Relaxed);
                        consumed.fetch_add(1, Ordering::Relaxed);
                    } else {
                        std::thread::yield_now();
                    }
                }
            });
        }
    });

    let expected_sum: usize = (0 .. PRODUCERS * PER_PRODUCER).sum();
    assert_eq!(consumed.load(Ordering::Relaxed), PRODUCERS * PER_PRODUCER);
    assert_eq!(seen_sum.load(Ordering::Relaxed), expected_sum);
}

proptest::proptest! {
    /// Whatever capacity the queue is built with and however many values
    /// fit under it, a single-threaded push-then-pop round trip returns
    /// exactly the pushed sequence in order.
    #[test]
    fn push_then_pop_round_trips_in_order(capacity in 1usize .. 64, count in 0usize .. 64) {
        let q: RingBuffer<usize> = RingBuffer::with_capacity(capacity);
        let to_push = count.min(q.capacity());
        for i in 0 .. to_push {
            q.try_push(i).unwrap();
        }
        for i in 0 .. to_push {
            proptest::prop_assert_eq!(q.try_pop(), Some(i));
        }
        proptest::prop_assert_eq!(q.try_pop(), None);
    }
}
