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

//! A plain user-space spin mutex.
//!
//! Grounded on `examples/original_source/src/mutex.h`: the original is a
//! thin `pthread_spinlock_t` wrapper used to guard the handful of
//! data structures (the allocator's free-span index, the core table) that
//! are touched rarely enough that a futex-backed mutex would be overkill,
//! but often enough from short critical sections that spinning beats a
//! syscall. `std::sync::Mutex` would pull in the same futex path this
//! crate is trying to avoid on its hot paths, so a small spin lock is
//! rolled by hand instead, same as the original.

use std::{cell::UnsafeCell,
          fmt,
          ops::{Deref, DerefMut},
          sync::atomic::{AtomicBool, Ordering}};

/// A mutual-exclusion lock that spins instead of parking the OS thread.
///
/// Only ever held for a handful of instructions (a free-span rbtree
/// insert/remove, a core-table slot swap); anything that can block
/// (channel send/recv, netpoll wait) must never be called while holding
/// one.
pub struct SpinMutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: `SpinMutex` only exposes `&mut T` through `lock()`, which is only
// granted while `locked` is held, so `T: Send` is the only bound required
// for `Sync` — exactly `std::sync::Mutex`'s bound.
unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Spins until the lock is acquired, then returns a guard.
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let mut spins = 0u32;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Back off with a pause instruction for a while before yielding
            // the OS thread entirely; mirrors the adaptive spin most
            // userspace spinlock implementations (including glibc's
            // pthread_spin_lock on contended paths) use.
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
            spins = spins.wrapping_add(1);
        }
        SpinMutexGuard { mutex: self }
    }

    /// Attempts to acquire the lock without spinning; returns `None` if it
    /// is currently held.
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|()| SpinMutexGuard { mutex: self })
    }

    /// Bypasses locking entirely; only sound with exclusive access (e.g.
    /// during single-threaded setup before other cores are started).
    pub fn get_mut(&mut self) -> &mut T { self.data.get_mut() }
}

impl<T: fmt::Debug> fmt::Debug for SpinMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinMutex").field("data", &*guard).finish(),
            None => f.debug_struct("SpinMutex").field("data", &"<locked>").finish(),
        }
    }
}

#[must_use = "the guard unlocks on drop; binding it to `_` unlocks immediately"]
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard implies `locked == true` and exclusive
        // access to `data` until `Drop` clears it.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see `Deref`.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) { self.mutex.locked.store(false, Ordering::Release); }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::SpinMutex;

    #[test]
    fn mutual_exclusion_under_contention() {
        let counter = Arc::new(SpinMutex::new(0_u64));
        let handles: Vec<_> = (0 .. 8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0 .. 10_000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 80_000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = SpinMutex::new(1);
        let guard = m.lock();
        assert!(m.try_lock().is_none());
        drop(guard);
        assert!(m.try_lock().is_some());
    }
}
