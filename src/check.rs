//! Debug-only consistency check.
//!
//! Compiled in only under the `memory-checking` feature, the same way the
//! teacher gates its own malloc consistency check behind a debug config
//! flag: the checks below walk every block and chunk, which is too slow to
//! run on every allocation in a release build.

use crate::block::BlockHeader;
use crate::chunk::{ChunkHeader, FreeSlotLink};
use crate::context::ContextInner;
use crate::error::SlabError;
use alloc::boxed::Box;
use alloc::vec;
use core::ptr::NonNull;
use log::warn;

/// Byte pattern written into the padding between a chunk's user-visible
/// `chunk_size` bytes and its slot boundary, so an overflow write past the
/// requested size shows up on the next [`ContextInner::check`].
pub(crate) const CANARY_BYTE: u8 = 0xc5;

impl ContextInner {
    /// Padding byte count between a chunk's usable payload and its slot
    /// boundary, or `0` if `chunk_size` already fills the aligned slot.
    fn padding_len(&self) -> usize {
        (self.full_chunk_size() - self.chunk_header_size()) - self.chunk_size()
    }

    /// Writes the canary pattern into the trailing padding of a freshly
    /// allocated chunk.
    ///
    /// # Safety
    ///
    /// `payload` must point to `full_chunk_size - chunk_header_size` bytes
    /// just handed out by this context.
    pub(crate) unsafe fn stamp_canary(&self, payload: NonNull<u8>) {
        let padding_len = self.padding_len();
        if padding_len > 0 {
            unsafe {
                core::ptr::write_bytes(payload.as_ptr().add(self.chunk_size()), CANARY_BYTE, padding_len);
            }
        }
    }

    /// Re-checks a chunk's trailing canary at `free` time, catching a write
    /// past `chunk_size` as soon as the chunk comes back rather than waiting
    /// for the next explicit [`check`](Self::check).
    ///
    /// Corruption here is reported as a warning, not an error: `free` itself
    /// cannot fail, and the allocator must stay usable afterward.
    ///
    /// # Safety
    ///
    /// `payload` must point to a chunk this context just handed back through
    /// `free`, not yet unlinked from its block.
    pub(crate) unsafe fn verify_canary_on_free(&self, payload: NonNull<u8>) {
        let padding_len = self.padding_len();
        if padding_len == 0 {
            return;
        }
        let pad = unsafe {
            core::slice::from_raw_parts(payload.as_ptr().add(self.chunk_size()), padding_len)
        };
        if pad.iter().any(|&b| b != CANARY_BYTE) {
            warn!(
                "{}: free() detected a write past chunk_size (canary overwritten)",
                self.name()
            );
        }
    }

    /// Walks every bucket and every block's in-block free list, verifying:
    ///
    /// - each bucket only contains blocks whose `nfree` matches the bucket
    ///   index,
    /// - each block's in-block free list has exactly `nfree` entries and
    ///   never revisits a slot,
    /// - every allocated slot's chunk header still points back to its block
    ///   and, if there's alignment padding, its canary bytes are intact,
    /// - `min_free_chunks` is `0` iff no bucket `>= 1` has any blocks, and
    ///   otherwise names the smallest non-empty one.
    pub fn check(&self) -> Result<(), SlabError> {
        let mut seen_nonempty_min = None;
        for (bucket_idx, bucket) in self.buckets().iter().enumerate() {
            for block in bucket.iter() {
                if block.context != NonNull::from(self) {
                    warn!("block in bucket {bucket_idx} claims a different owning context");
                    return Err(SlabError::CorruptionDetected);
                }
                let nfree = block.nfree as usize;
                if nfree != bucket_idx {
                    warn!("block in bucket {bucket_idx} reports nfree={nfree}");
                    return Err(SlabError::CorruptionDetected);
                }
                self.check_block(NonNull::from(block), nfree)?;
            }
            if bucket_idx >= 1 && !bucket.is_empty() && seen_nonempty_min.is_none() {
                seen_nonempty_min = Some(bucket_idx);
            }
        }
        let expected_min = seen_nonempty_min.unwrap_or(0);
        if expected_min != self.min_free_chunks() {
            warn!(
                "min_free_chunks cursor is {} but smallest non-empty bucket is {}",
                self.min_free_chunks(),
                expected_min
            );
            return Err(SlabError::CorruptionDetected);
        }
        Ok(())
    }

    fn check_block(&self, block_ptr: NonNull<BlockHeader>, expected_free: usize) -> Result<(), SlabError> {
        let chunks_per_block = self.chunks_per_block();
        let mut free_slots: Box<[u8]> =
            vec![0u8; (chunks_per_block as usize).div_ceil(8)].into_boxed_slice();

        let mut slot = unsafe { (*block_ptr.as_ptr()).first_free_slot };
        let mut count = 0usize;
        while slot != chunks_per_block {
            if slot >= chunks_per_block {
                warn!("free list slot {slot} out of range (chunks_per_block={chunks_per_block})");
                return Err(SlabError::CorruptionDetected);
            }
            let byte = &mut free_slots[slot as usize / 8];
            let mask = 1 << (slot % 8);
            if *byte & mask != 0 {
                warn!("free list revisits slot {slot}, cycle detected");
                return Err(SlabError::CorruptionDetected);
            }
            *byte |= mask;
            count += 1;
            slot = unsafe { self.read_free_link(block_ptr, slot) };
        }
        if count != expected_free {
            warn!("block free list has {count} entries, expected {expected_free}");
            return Err(SlabError::CorruptionDetected);
        }

        let padding_len = self.padding_len();
        for slot in 0..chunks_per_block {
            let is_free = free_slots[slot as usize / 8] & (1 << (slot % 8)) != 0;
            if is_free {
                continue;
            }
            let chunk_ptr = unsafe {
                BlockHeader::slot_chunk_ptr(
                    block_ptr,
                    slot,
                    self.block_header_size(),
                    self.full_chunk_size(),
                )
            };
            let header = unsafe { chunk_ptr.cast::<ChunkHeader>().as_ref() };
            if header.block != block_ptr {
                warn!("allocated slot {slot} has a stale back-link");
                return Err(SlabError::CorruptionDetected);
            }
            if padding_len > 0 {
                let payload =
                    unsafe { NonNull::new_unchecked(chunk_ptr.as_ptr().add(self.chunk_header_size())) };
                let pad = unsafe {
                    core::slice::from_raw_parts(payload.as_ptr().add(self.chunk_size()), padding_len)
                };
                if pad.iter().any(|&b| b != CANARY_BYTE) {
                    warn!("allocated slot {slot} overwrote its trailing padding");
                    return Err(SlabError::CorruptionDetected);
                }
            }
        }
        Ok(())
    }

    unsafe fn read_free_link(&self, block_ptr: NonNull<BlockHeader>, slot: u32) -> u32 {
        let chunk_ptr = unsafe {
            BlockHeader::slot_chunk_ptr(block_ptr, slot, self.block_header_size(), self.full_chunk_size())
        };
        let payload = unsafe { NonNull::new_unchecked(chunk_ptr.as_ptr().add(self.chunk_header_size())) };
        unsafe { FreeSlotLink::read(payload) }
    }
}

#[cfg(test)]
mod tests {
    use crate::context::Context;
    use crate::framework::NullFramework;
    use crate::host::test_support::TestBlockSource;

    #[test]
    fn fresh_and_churned_context_passes_check() {
        let mut ctx =
            Context::create("t", None, 60, 1024, TestBlockSource::default(), NullFramework).unwrap();
        assert!(ctx.check().is_ok());
        let mut ptrs = alloc::vec::Vec::new();
        for _ in 0..10 {
            ptrs.push(ctx.alloc(60).unwrap().unwrap());
        }
        assert!(ctx.check().is_ok());
        for p in ptrs.drain(..5) {
            unsafe { ctx.free(p) };
        }
        assert!(ctx.check().is_ok());
        for p in ptrs {
            unsafe { ctx.free(p) };
        }
        assert!(ctx.check().is_ok());
    }
}
