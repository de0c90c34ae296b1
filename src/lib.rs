//! A fixed-chunk-size slab allocator.
//!
//! A [`Context`](context::Context) hands out chunks of exactly one size,
//! carved out of blocks acquired from a pluggable
//! [`BlockSource`](host::BlockSource). Blocks are tracked in freelist
//! buckets keyed by how many free chunks they currently hold, so allocation
//! and free are both O(1): the bucket holding the block with the fewest
//! free chunks (but at least one) is cached, and only has to be recomputed
//! when it empties out.
//!
//! Built to run without an allocator-provided heap of its own: the crate is
//! `no_std` outside of tests, and only needs `alloc` for its own small
//! bookkeeping (the bucket array, the context header, debug scratch
//! buffers) — never for the blocks it hands payload memory out of, which
//! always come from the caller's [`BlockSource`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod chunk;
#[cfg(feature = "memory-checking")]
mod check;
pub mod context;
pub mod error;
pub mod framework;
pub mod host;
pub mod stats;

pub use context::Context;
pub use error::{SlabError, SlabResult};
pub use framework::{ContextFramework, MemoryContextOps, NullFramework};
pub use host::{BlockSource, GlobalBlockSource};
pub use stats::Stats;
