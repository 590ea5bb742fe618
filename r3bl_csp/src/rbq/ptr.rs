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

//! Zero-sized arity markers for [`super::RingBuffer`].
//!
//! `examples/original_source/src/rbq.h` compiles four near-identical
//! queues (`spsc`, `mpsc`, `spmc`, `mpmc`) from one template header by
//! `#define`-ing which side is allowed to be multi. The same underlying
//! algorithm (a Vyukov-style bounded MPMC ring with a per-slot sequence
//! number) is correct for every arity — a single producer is just an MPMC
//! producer nobody else happens to contend with — so rather than
//! reproduce four copies, one implementation is generic over these marker
//! types. They carry no behavior; they exist so a queue's intended usage
//! is part of its type (`RingBuffer<T, Single, Multi>` cannot be confused
//! with `RingBuffer<T, Multi, Single>` at a call site) and so
//! single-sided call sites can `debug_assert!` their side's exclusivity.

/// Marks a side of a [`super::RingBuffer`] as having exactly one
/// participant.
#[derive(Debug, Clone, Copy, Default)]
pub struct Single;

/// Marks a side of a [`super::RingBuffer`] as having any number of
/// concurrent participants.
#[derive(Debug, Clone, Copy, Default)]
pub struct Multi;

/// Implemented by [`Single`] and [`Multi`]; lets [`super::RingBuffer`]
/// name its arity in `Debug` output without a manual impl per
/// combination.
pub trait Arity: Default + Copy + std::fmt::Debug + 'static {
    const NAME: &'static str;
}

impl Arity for Single {
    const NAME: &'static str = "single";
}

impl Arity for Multi {
    const NAME: &'static str = "multi";
}
