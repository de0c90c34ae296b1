//! Usage statistics for a context.
//!
//! Mirrors the memory/utilization summary a slab-style allocator commonly
//! exposes for introspection: bytes reserved from the host, bytes actually
//! handed out, and block/chunk counts, plus a convenience percentage.

use crate::context::ContextInner;
use core::fmt;

/// A point-in-time snapshot of a context's memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Total bytes attributed to this context: its own header plus
    /// `block_count * block_size`.
    pub reserved_bytes: usize,
    /// Bytes currently handed out to callers (`alloc_count * chunk_size`).
    pub used_bytes: usize,
    /// Bytes held in blocks but not currently handed out
    /// (`free_chunks * full_chunk_size`).
    pub free_bytes: usize,
    /// Number of chunks currently free across all blocks.
    pub free_chunks: usize,
    /// Number of blocks currently held.
    pub block_count: usize,
    /// Number of chunks currently allocated.
    pub alloc_count: usize,
    /// Number of chunks one block can hold.
    pub chunks_per_block: u32,
}

impl Stats {
    pub(crate) fn collect(inner: &ContextInner) -> Self {
        let free_chunks: usize = inner
            .buckets()
            .iter()
            .enumerate()
            .map(|(nfree, bucket)| nfree * bucket.iter().count())
            .sum();
        Self {
            reserved_bytes: inner.header_size() + inner.block_count() * inner.block_size(),
            used_bytes: inner.alloc_count() * inner.chunk_size(),
            free_bytes: free_chunks * inner.full_chunk_size(),
            free_chunks,
            block_count: inner.block_count(),
            alloc_count: inner.alloc_count(),
            chunks_per_block: inner.chunks_per_block(),
        }
    }

    /// Fraction of reserved bytes currently in use, from `0.0` to `1.0`.
    ///
    /// Returns `0.0` if nothing has been reserved yet rather than dividing
    /// by zero.
    pub fn utilization(&self) -> f64 {
        if self.reserved_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.reserved_bytes as f64
        }
    }

    pub(crate) fn report(&self, mut emit: impl FnMut(fmt::Arguments)) {
        emit(format_args!(
            "reserved={}B used={}B free={}B({} chunks) blocks={} allocs={} chunks_per_block={} utilization={:.1}%",
            self.reserved_bytes,
            self.used_bytes,
            self.free_bytes,
            self.free_chunks,
            self.block_count,
            self.alloc_count,
            self.chunks_per_block,
            self.utilization() * 100.0,
        ));
    }
}
