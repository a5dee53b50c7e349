//! # knuthalloc - A Boundary-Tag Heap for Fixed Arenas
//!
//! This crate provides a **boundary-tag, free-list heap** that manages a single
//! fixed-size arena handed to it by the caller. It never asks the operating
//! system for memory, which makes it suitable for small embedded targets with
//! no virtual memory and a single execution context.
//!
//! ## Overview
//!
//! The arena is carved into chunks. Each chunk carries its size twice, in a
//! header and a footer, so both physical neighbors can be found with plain
//! offset arithmetic:
//!
//! ```text
//!   Arena (u32 words):
//!
//!   ┌────┬─────────┬────┬────┬──────┬──────┬─────┬────┬────┬─────────┬────┐
//!   │ -4 │ payload │ -4 │ +6 │ next │ prev │ ... │ +6 │ -2 │ payload │ -2 │
//!   └────┴─────────┴────┴────┴──────┴──────┴─────┴────┴────┴─────────┴────┘
//!    allocated (4 words)  free (6 words)                 allocated (2 words)
//!
//!   Negative size = allocated, non-negative = free.
//!   Header and footer must match; a mismatch is treated as corruption.
//! ```
//!
//! Free chunks are threaded onto one doubly linked list, sorted by payload size
//! and linked by word offsets stored in their own first two payload words:
//!
//! ```text
//!   root ──► [2 words] ◄──► [2 words] ◄──► [9 words] ◄──► [240 words] ──► NIL
//! ```
//!
//! Because the list is sorted, the first chunk large enough for a request is
//! also the best fit.
//!
//! ## Crate Structure
//!
//! ```text
//!   knuthalloc
//!   ├── align      - Word rounding macros (words!, bytes!)
//!   ├── chunk      - Boundary-tag layout (internal)
//!   ├── free_list  - Size-sorted offset-linked list (internal)
//!   ├── knuth      - KnuthHeap implementation
//!   ├── heap       - Heap trait shared by all backends
//!   ├── stats      - Timing and outcome counters over any Heap
//!   ├── config     - Arena sizing
//!   └── error      - HeapError
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use knuthalloc::KnuthHeap;
//!
//! let mut arena = vec![0u32; 1024];
//! let mut heap = KnuthHeap::new(&mut arena).unwrap();
//!
//! let ptr = heap.allocate(64).unwrap();
//! unsafe {
//!   ptr.cast::<u32>().write(42);
//!
//!   let ptr = heap.resize(Some(ptr), 256).unwrap().unwrap();
//!   assert_eq!(ptr.cast::<u32>().read(), 42);
//!
//!   heap.release(Some(ptr)).unwrap();
//! }
//! ```
//!
//! ## Operations
//!
//! - **allocate**: first fit on the sorted list, splitting off the tail when it
//!   can stand as a chunk of its own.
//! - **zero_allocate**: as allocate, with the payload cleared.
//! - **release**: coalesces with every free physical neighbor, then relists.
//! - **resize**: never shrinks; grows in place by coalescing when the
//!   neighbors allow it, otherwise moves. A failed resize leaves the original
//!   allocation untouched.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: No synchronization primitives
//! - **Word alignment only**: Payloads are aligned to 4 bytes, nothing more
//! - **Fixed arena**: The heap never grows; when the arena is full, requests fail
//!
//! ## Safety
//!
//! Pointers returned by the heap point into the arena. Releasing or resizing
//! requires `unsafe`: the heap checks the tags around the pointer and refuses
//! pointers it cannot trust, but it cannot prove the caller is done with them.

pub mod align;
mod chunk;
pub mod config;
pub mod error;
mod free_list;
pub mod heap;
mod knuth;
pub mod stats;

pub use config::HeapConfig;
pub use error::HeapError;
pub use free_list::ChunkInfo;
pub use heap::Heap;
pub use knuth::KnuthHeap;
#[cfg(unix)]
pub use stats::MonotonicClock;
pub use stats::{CycleCounter, HeapStats, Instrumented, Op, OpStats};
