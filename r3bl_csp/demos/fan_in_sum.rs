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

//! Recursively halves a range of integers, summing each half in its own
//! process via [`r3bl_csp::runtime::Runtime::spawn_sync`] until a leaf
//! range is small enough to sum directly, then fans the partial sums back
//! in. Demonstrates `spawn_sync`'s join-group semantics: a parent process
//! does not resume until every child it just spawned has exited.

use std::sync::{atomic::{AtomicU64, Ordering},
                 mpsc,
                 Arc};

use clap::Parser;
use r3bl_csp::{Runtime, RuntimeConfig};

/// Recursively fans a range of integers out into `spawn_sync` child
/// processes and sums them back in.
#[derive(Parser)]
struct Args {
    /// Sum the integers 0..=upper_bound.
    #[arg(long, default_value_t = 10_000_000)]
    upper_bound: u64,

    /// Below this many elements a leaf sums its range directly rather than
    /// forking further.
    #[arg(long, default_value_t = 4096)]
    leaf_threshold: u64,
}

fn sum_range(runtime: Arc<Runtime>, lo: u64, hi: u64, out: Arc<AtomicU64>, leaf_threshold: u64) {
    if hi - lo <= leaf_threshold {
        out.store((lo ..= hi).sum(), Ordering::Release);
        return;
    }

    let mid = lo + (hi - lo) / 2;
    let left_out = Arc::new(AtomicU64::new(0));
    let right_out = Arc::new(AtomicU64::new(0));

    let left_runtime = Arc::clone(&runtime);
    let left_result = Arc::clone(&left_out);
    let right_runtime = Arc::clone(&runtime);
    let right_result = Arc::clone(&right_out);

    runtime
        .spawn_sync(vec![
            ("sum_left", Box::new(move || sum_range(left_runtime, lo, mid, left_result, leaf_threshold))),
            ("sum_right", Box::new(move || sum_range(right_runtime, mid + 1, hi, right_result, leaf_threshold))),
        ])
        .expect("child stack allocation should not fail for this demo's depth");

    out.store(left_out.load(Ordering::Acquire) + right_out.load(Ordering::Acquire), Ordering::Release);
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let upper_bound = args.upper_bound;
    let leaf_threshold = args.leaf_threshold;

    let runtime = Arc::new(Runtime::start(RuntimeConfig::default()).expect("runtime should start on this host"));
    let (done_tx, done_rx) = mpsc::channel();

    let root_runtime = Arc::clone(&runtime);
    runtime
        .spawn("fan-in-sum-root", move || {
            let total = Arc::new(AtomicU64::new(0));
            sum_range(root_runtime, 0, upper_bound, Arc::clone(&total), leaf_threshold);
            let _ = done_tx.send(total.load(Ordering::Acquire));
        })
        .expect("root process should spawn");

    let total = done_rx.recv().expect("root process should report its result before exiting");
    let expected = (0 ..= upper_bound).sum::<u64>();
    assert_eq!(total, expected, "fan-in sum must match the sequential sum");
    println!("sum(0..={upper_bound}) = {total}");

    let runtime = Arc::try_unwrap(runtime).unwrap_or_else(|_| panic!("every process-held Runtime clone must have exited by now"));
    runtime.shutdown();
}
