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

//! Per-CPU stack allocator.
//!
//! Grounded on `examples/original_source/src/mem.c`: each CPU owns a
//! large `mmap`-backed arena it carves stacks out of with no locking
//! against other CPUs on the fast path, coalescing freed spans back into
//! a [`rbtree::RbTree`] keyed by address. A process that migrates cores
//! (or simply exits on a different core than the one that spawned it)
//! frees through the owning CPU's [`mailbox::Mailbox`] instead of taking
//! a cross-CPU lock.

pub mod mailbox;
pub mod rbtree;

use std::sync::atomic::{AtomicUsize, Ordering};

use self::{mailbox::{new_mailbox, FreedSpan, Mailbox},
           rbtree::RbTree};
use crate::{config::CspError, mutex::SpinMutex};

/// One growth increment for a CPU's arena: 8 MiB, mmap'd on demand.
const ARENA_CHUNK_SIZE: usize = 8 * 1024 * 1024;

const MAILBOX_CAPACITY: usize = 4096;

/// What [`crate::process::trampoline`] needs from an allocator: carve a
/// `len`-byte, page-aligned region out of `cpu_id`'s arena, and give one
/// back (possibly from a different CPU than the one that allocated it —
/// see [`StackAllocator::dealloc`]'s `owner_cpu` parameter).
pub trait StackAllocator {
    /// # Errors
    /// Returns [`CspError::Exhausted`] if `cpu_id`'s arena cannot grow
    /// enough to satisfy `len` (the underlying `mmap` failed).
    fn alloc(&self, cpu_id: usize, len: usize) -> Result<*mut u8, CspError>;

    /// Returns a region to its owner. `calling_cpu` is whichever CPU is
    /// running the free (usually the CPU that last ran the exiting
    /// process); `owner_cpu` is the CPU the region was originally carved
    /// from. When they differ the free is routed through
    /// [`mailbox::Mailbox`] instead of touching `owner_cpu`'s tree
    /// directly.
    ///
    /// # Safety
    /// `addr`/`len` must exactly match a still-live allocation previously
    /// returned by [`StackAllocator::alloc`] for `owner_cpu`.
    unsafe fn dealloc(&self, calling_cpu: usize, owner_cpu: usize, addr: *mut u8, len: usize);
}

struct CpuArena {
    free_spans: SpinMutex<RbTree>,
    mailbox: Mailbox,
    /// Total bytes ever carved out by `mmap` for this CPU, used only to
    /// pick the next chunk's size hint.
    reserved: AtomicUsize,
}

/// Default [`StackAllocator`]: one [`CpuArena`] per CPU, each grown in
/// [`ARENA_CHUNK_SIZE`] increments via anonymous `mmap`.
#[derive(Debug)]
pub struct ArenaAllocator {
    arenas: Vec<CpuArena>,
}

impl std::fmt::Debug for CpuArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuArena")
            .field("reserved", &self.reserved.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ArenaAllocator {
    #[must_use]
    pub fn new(n_cpus: usize) -> Self {
        let arenas = (0 .. n_cpus)
            .map(|_| CpuArena {
                free_spans: SpinMutex::new(RbTree::new()),
                mailbox: new_mailbox(MAILBOX_CAPACITY),
                reserved: AtomicUsize::new(0),
            })
            .collect();
        Self { arenas }
    }

    fn drain_mailbox(&self, cpu_id: usize, free_spans: &mut RbTree) {
        let arena = &self.arenas[cpu_id];
        while let Some(FreedSpan { addr, len }) = arena.mailbox.try_pop() {
            free_spans.insert_span(addr, len);
        }
    }

    /// `mmap`s a fresh chunk (at least `len`, rounded up to
    /// [`ARENA_CHUNK_SIZE`]) and folds it into the free-span index as one
    /// span.
    fn grow(&self, cpu_id: usize, len: usize, free_spans: &mut RbTree) -> Result<(), CspError> {
        let chunk_len = len.next_multiple_of(ARENA_CHUNK_SIZE).max(ARENA_CHUNK_SIZE);
        // SAFETY: standard anonymous, private mapping; no file descriptor
        // involved, result is checked for `MAP_FAILED` below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                chunk_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CspError::Exhausted {
                cpu_id,
                size: len,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        self.arenas[cpu_id].reserved.fetch_add(chunk_len, Ordering::Relaxed);
        free_spans.insert_span(ptr as usize, chunk_len);
        Ok(())
    }
}

impl StackAllocator for ArenaAllocator {
    fn alloc(&self, cpu_id: usize, len: usize) -> Result<*mut u8, CspError> {
        let len = len.next_multiple_of(page_size());
        let arena = &self.arenas[cpu_id];
        let mut free_spans = arena.free_spans.lock();
        self.drain_mailbox(cpu_id, &mut free_spans);
        if let Some((addr, _)) = free_spans.take_best_fit(len) {
            return Ok(addr as *mut u8);
        }
        self.grow(cpu_id, len, &mut free_spans)?;
        let (addr, _) = free_spans
            .take_best_fit(len)
            .expect("span just inserted by grow() must satisfy its own request");
        Ok(addr as *mut u8)
    }

    unsafe fn dealloc(&self, calling_cpu: usize, owner_cpu: usize, addr: *mut u8, len: usize) {
        if calling_cpu == owner_cpu {
            let mut free_spans = self.arenas[owner_cpu].free_spans.lock();
            free_spans.insert_span(addr as usize, len);
        } else if self.arenas[owner_cpu]
            .mailbox
            .try_push(FreedSpan { addr: addr as usize, len })
            .is_err()
        {
            // Mailbox saturated (vanishingly rare: it would take
            // thousands of in-flight cross-CPU frees). Fall back to
            // taking the owner's lock directly rather than leaking the
            // span.
            let mut free_spans = self.arenas[owner_cpu].free_spans.lock();
            free_spans.insert_span(addr as usize, len);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: `sysconf` with a valid, widely supported name; no
    // preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 { 4096 } else { n as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_dealloc_same_cpu_round_trips() {
        let a = ArenaAllocator::new(1);
        let ptr = a.alloc(0, 16 * 1024).unwrap();
        assert!(!ptr.is_null());
        unsafe { a.dealloc(0, 0, ptr, 16 * 1024) };
        // Freed span should be reusable without growing the arena again.
        let before = a.arenas[0].reserved.load(Ordering::Relaxed);
        let ptr2 = a.alloc(0, 16 * 1024).unwrap();
        let after = a.arenas[0].reserved.load(Ordering::Relaxed);
        assert_eq!(before, after);
        unsafe { a.dealloc(0, 0, ptr2, 16 * 1024) };
    }

    #[test]
    fn cross_cpu_dealloc_routes_through_mailbox() {
        let a = ArenaAllocator::new(2);
        let ptr = a.alloc(0, 16 * 1024).unwrap();
        unsafe { a.dealloc(1, 0, ptr, 16 * 1024) };
        assert_eq!(a.arenas[0].mailbox.len_hint(), 1);
        // Next allocation on cpu 0 drains the mailbox and can reuse it.
        let before = a.arenas[0].reserved.load(Ordering::Relaxed);
        let _ptr2 = a.alloc(0, 16 * 1024).unwrap();
        let after = a.arenas[0].reserved.load(Ordering::Relaxed);
        assert_eq!(before, after);
    }
}
