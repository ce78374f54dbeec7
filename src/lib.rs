//! This crate implements a segregated-fit dynamic memory allocator with
//! boundary-tag coalescing, in the style of classic `malloc` designs built
//! directly on a monotonically growing memory region.
//!
//!  - **Free blocks are kept in power-of-two size-class lists.** Allocation
//!    is a first-fit scan starting at the smallest class that can hold the
//!    request, escalating to larger classes until a fit is found.
//!
//!  - **Every block carries redundant boundary tags** (a size+state word at
//!    both ends), so both physical neighbors of any block can be reached in
//!    constant time and adjacent free blocks are merged eagerly on every
//!    `free`.
//!
//!  - **The backing region is provided by an application** through the
//!    [`RegionSource`] trait: a `static` buffer, an arena carved out of
//!    another allocator, or the process break (see [`SbrkSource`]).
//!
//!  - **This crate supports `#![no_std]`.** It can be used in bare-metal
//!    programs that manage their own heap.
//!
//! The allocator is single-threaded by contract: every operation takes
//! `&mut self`, and concurrent callers must either serialize externally or
//! own disjoint [`Segfit`] instances.
//!
//! # Examples
//!
//! ```rust
//! use segfit::{ArenaSource, Segfit};
//! use std::mem::MaybeUninit;
//!
//! let mut arena = [MaybeUninit::uninit(); 65536];
//! let mut heap: Segfit<_> = Segfit::new(ArenaSource::new(&mut arena));
//!
//! unsafe {
//!     let mut ptr1 = heap.allocate(8).unwrap().cast::<u64>();
//!     let mut ptr2 = heap.allocate(8).unwrap().cast::<u64>();
//!     *ptr1.as_mut() = 42;
//!     *ptr2.as_mut() = 56;
//!     assert_eq!(*ptr1.as_ref(), 42);
//!     assert_eq!(*ptr2.as_ref(), 56);
//!     heap.free(Some(ptr1.cast()));
//!     heap.free(Some(ptr2.cast()));
//! }
//! ```
//!
//! # Details
//!
//! ## Changes from the classic design
//!
//!  - The remainder produced by splitting a block is merged with its free
//!    successor before reinsertion, so the no-two-adjacent-free-blocks
//!    invariant holds after *every* operation, not only after `free`.
//!
//!  - The consistency checker is a pure function ([`Segfit::verify`])
//!    returning the full set of detected [`Violations`]; aborting is a
//!    policy layer on top ([`Segfit::check`]).
//!
//!  - Size arithmetic on caller-supplied values is checked; an overflowing
//!    `zero_allocate(count, size)` product is an allocation failure, never a
//!    silent wrap.
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

mod init;
mod region;
mod seg;
pub use self::{
    init::*,
    region::*,
    seg::{InitError, Segfit, Violations, ALIGNMENT, DEFAULT_BUCKETS, MIN_BLOCK_SIZE},
};

#[cfg(any(test, feature = "std"))]
extern crate std;
