//! The allocator itself: a fixed-chunk-size memory context.
//!
//! A [`Context`] hands out chunks of one fixed size, carved out of blocks
//! acquired from a [`BlockSource`]. Blocks are kept in `chunks_per_block + 1`
//! freelist buckets, bucket `k` holding every block with exactly `k` free
//! chunks. `min_free_chunks` caches the smallest bucket index `>= 1` known to
//! be non-empty, so the common case of "find a block with room" never walks
//! the bucket array: allocation only scans upward when the cached bucket
//! empties out from under it.

use crate::block::{BlockAdapter, BlockHeader};
use crate::chunk::{self, ChunkHeader};
use crate::error::{SlabError, SlabResult};
use crate::framework::ContextFramework;
use crate::host::{BlockSource, GlobalBlockSource};
use crate::stats::Stats;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::fmt;
use core::mem;
use core::ptr::NonNull;
use intrusive_collections::LinkedList;
use log::{debug, trace, warn};

/// Word alignment used for both chunk and block headers.
///
/// Matches the alignment the host allocator already guarantees for any
/// `Layout`, so neither header needs to request anything stricter than a
/// pointer's natural alignment.
const ALIGN: usize = mem::align_of::<usize>();

/// Byte pattern written over a chunk's payload (and a block's whole storage,
/// on release) once it's freed, under the `clobber-freed` feature.
#[cfg(feature = "clobber-freed")]
const CLOBBER_BYTE: u8 = 0xa5;

/// The heap-allocated, address-stable body of a [`Context`].
///
/// Blocks store a back-pointer to this struct (not to the outer [`Context`])
/// so that it stays valid even if the `Context` value itself is moved; only
/// the `Box` storage beneath it is address-stable.
pub struct ContextInner {
    source: Box<dyn BlockSource>,
    framework: Box<dyn ContextFramework>,
    chunk_size: usize,
    block_size: usize,
    chunk_header_size: usize,
    block_header_size: usize,
    full_chunk_size: usize,
    chunks_per_block: u32,
    /// Identity/size tag stamped into every chunk header this context hands
    /// out; see [`crate::chunk::pack_tag`].
    chunk_tag: u32,
    buckets: Vec<LinkedList<BlockAdapter>>,
    min_free_chunks: usize,
    block_count: usize,
    alloc_count: usize,
    name: &'static str,
    #[cfg(feature = "randomize-allocated")]
    rand_state: u64,
}

/// A fixed-chunk-size memory context.
///
/// Dropping a `Context` resets it (freeing every outstanding chunk's
/// backing block) and returns its own header storage to the allocator that
/// produced it; there is no separate "delete" step to remember.
pub struct Context {
    inner: Box<ContextInner>,
}

impl ContextInner {
    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn block_count(&self) -> usize {
        self.block_count
    }

    pub(crate) fn alloc_count(&self) -> usize {
        self.alloc_count
    }

    pub(crate) fn chunks_per_block(&self) -> u32 {
        self.chunks_per_block
    }

    pub(crate) fn min_free_chunks(&self) -> usize {
        self.min_free_chunks
    }

    pub(crate) fn buckets(&self) -> &[LinkedList<BlockAdapter>] {
        &self.buckets
    }

    pub(crate) fn block_header_size(&self) -> usize {
        self.block_header_size
    }

    pub(crate) fn chunk_header_size(&self) -> usize {
        self.chunk_header_size
    }

    pub(crate) fn full_chunk_size(&self) -> usize {
        self.full_chunk_size
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// This context's own header storage: the `ContextInner` struct plus its
    /// bucket array, both counted toward [`Stats::reserved_bytes`].
    pub(crate) fn header_size(&self) -> usize {
        mem::size_of::<ContextInner>()
            + (self.chunks_per_block as usize + 1) * mem::size_of::<LinkedList<BlockAdapter>>()
    }

    fn block_layout(&self) -> Layout {
        Layout::from_size_align(self.block_size, ALIGN).expect("block_size/align already validated")
    }

    /// Advances this context's xorshift64 generator, used to pattern-fill
    /// freshly allocated chunks under `randomize-allocated`.
    #[cfg(feature = "randomize-allocated")]
    fn next_rand(&mut self) -> u64 {
        let mut x = self.rand_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rand_state = x;
        x
    }

    /// Fills a freshly handed-out payload with non-zero noise, so code that
    /// accidentally relies on fresh memory being zeroed fails fast instead of
    /// by accident.
    #[cfg(feature = "randomize-allocated")]
    unsafe fn randomize_payload(&mut self, payload: NonNull<u8>) {
        let len = self.chunk_size;
        let mut written = 0;
        while written < len {
            let word = self.next_rand().to_ne_bytes();
            let n = core::cmp::min(word.len(), len - written);
            unsafe {
                core::ptr::copy_nonoverlapping(word.as_ptr(), payload.as_ptr().add(written), n);
            }
            written += n;
        }
    }

    fn bucket_of(nfree: u32) -> usize {
        nfree as usize
    }

    /// Scans upward from `from` (exclusive) for the next non-empty bucket,
    /// or falls back to `0` (meaning "no block currently has capacity").
    fn rescan_min_free_chunks(&mut self, from: usize) {
        let mut idx = from + 1;
        while idx <= self.chunks_per_block as usize {
            if !self.buckets[idx].is_empty() {
                self.min_free_chunks = idx;
                return;
            }
            idx += 1;
        }
        self.min_free_chunks = 0;
    }

    fn acquire_block(&mut self) -> Option<()> {
        let layout = self.block_layout();
        let raw = self.source.acquire(layout)?;
        let block_ptr = raw.cast::<BlockHeader>();
        let context_ptr = NonNull::from(&*self);
        unsafe {
            BlockHeader::init(
                block_ptr,
                context_ptr,
                self.chunks_per_block,
                self.block_header_size,
                self.chunk_header_size,
                self.full_chunk_size,
                self.chunk_tag,
            );
        }
        let block_ref = unsafe { intrusive_collections::UnsafeRef::from_raw(block_ptr.as_ptr()) };
        self.buckets[self.chunks_per_block as usize].push_front(block_ref);
        self.block_count += 1;
        self.min_free_chunks = self.chunks_per_block as usize;
        trace!(
            "{}: acquired new block ({} chunks free)",
            self.name,
            self.chunks_per_block
        );
        Some(())
    }

    fn release_block(&mut self, block_ptr: NonNull<BlockHeader>) {
        let layout = self.block_layout();
        #[cfg(feature = "clobber-freed")]
        unsafe {
            core::ptr::write_bytes(block_ptr.cast::<u8>().as_ptr(), CLOBBER_BYTE, self.block_size);
        }
        unsafe {
            self.source.release(block_ptr.cast(), layout);
        }
        self.block_count -= 1;
    }

    fn alloc_chunk(&mut self) -> Option<NonNull<u8>> {
        if self.min_free_chunks == 0 {
            self.acquire_block()?;
        }
        let bucket_idx = self.min_free_chunks;
        let mut cursor = self.buckets[bucket_idx].front_mut();
        let block_ref = cursor.remove().expect("min_free_chunks bucket must be non-empty");
        let block_ptr = NonNull::from(&*block_ref);

        let slot = unsafe {
            BlockHeader::pop_free_slot(
                block_ptr,
                self.block_header_size,
                self.chunk_header_size,
                self.full_chunk_size,
            )
            .expect("block's nfree said it had capacity")
        };
        let new_nfree = unsafe { (*block_ptr.as_ptr()).nfree } as usize;
        self.buckets[new_nfree].push_front(block_ref);

        if new_nfree >= 1 {
            self.min_free_chunks = new_nfree;
        } else if self.buckets[bucket_idx].is_empty() {
            self.rescan_min_free_chunks(bucket_idx);
        }

        self.alloc_count += 1;
        let chunk_ptr = unsafe {
            BlockHeader::slot_chunk_ptr(block_ptr, slot, self.block_header_size, self.full_chunk_size)
        };
        let payload = unsafe { NonNull::new_unchecked(chunk_ptr.as_ptr().add(self.chunk_header_size)) };

        #[cfg(feature = "memory-checking")]
        unsafe {
            self.stamp_canary(payload);
        }
        #[cfg(feature = "randomize-allocated")]
        unsafe {
            self.randomize_payload(payload);
        }

        Some(payload)
    }

    unsafe fn free_chunk(&mut self, payload: NonNull<u8>) {
        #[cfg(feature = "memory-checking")]
        unsafe {
            self.verify_canary_on_free(payload);
        }

        let header = unsafe { ChunkHeader::from_payload(payload, self.chunk_header_size) };
        let block_ptr = unsafe { header.as_ref().block };
        let old_nfree = unsafe { (*block_ptr.as_ptr()).nfree } as usize;

        let chunk_ptr = header.cast::<u8>();
        let base = block_ptr.cast::<u8>().as_ptr();
        let offset = unsafe { chunk_ptr.as_ptr().offset_from(base) } as usize;
        let slot = ((offset - self.block_header_size) / self.full_chunk_size) as u32;

        unsafe {
            let mut cursor = self
                .buckets[old_nfree]
                .cursor_mut_from_ptr(block_ptr.as_ptr());
            cursor
                .remove()
                .expect("block must currently sit in its nfree bucket");
        }
        #[cfg(feature = "clobber-freed")]
        unsafe {
            core::ptr::write_bytes(payload.as_ptr(), CLOBBER_BYTE, self.chunk_size);
        }
        unsafe {
            BlockHeader::push_free_slot(
                block_ptr,
                slot,
                self.block_header_size,
                self.chunk_header_size,
                self.full_chunk_size,
            );
        }
        let new_nfree = unsafe { (*block_ptr.as_ptr()).nfree } as usize;

        if new_nfree == self.chunks_per_block as usize {
            self.release_block(block_ptr);
            if self.min_free_chunks == old_nfree && self.buckets[old_nfree].is_empty() {
                self.rescan_min_free_chunks(old_nfree);
            }
            self.alloc_count -= 1;
            return;
        }

        let block_ref = unsafe { intrusive_collections::UnsafeRef::from_raw(block_ptr.as_ptr()) };
        self.buckets[new_nfree].push_front(block_ref);

        let old_bucket_now_empty = self.min_free_chunks == old_nfree && self.buckets[old_nfree].is_empty();
        if self.min_free_chunks == 0 || new_nfree < self.min_free_chunks || old_bucket_now_empty {
            // Either nothing had capacity before, this block is a strictly
            // fuller candidate than the current cursor, or it just vacated
            // the bucket the cursor was pointing at — and since it landed in
            // `new_nfree`, that bucket is non-empty by construction.
            self.min_free_chunks = new_nfree;
        }
        self.alloc_count -= 1;
    }

    /// Releases every block back to the host, leaving the context empty but
    /// still usable.
    fn reset_blocks(&mut self) {
        let layout = self.block_layout();
        let source = &self.source;
        for bucket in self.buckets.iter_mut() {
            let mut cursor = bucket.front_mut();
            while let Some(block_ref) = cursor.remove() {
                let block_ptr = NonNull::from(&*block_ref).cast::<u8>();
                unsafe { source.release(block_ptr, layout) };
                cursor = bucket.front_mut();
            }
        }
        self.block_count = 0;
        self.alloc_count = 0;
        self.min_free_chunks = 0;
        debug!("{}: reset, all blocks released", self.name);
    }
}

impl Context {
    /// Creates a context handing out `chunk_size`-byte chunks, carved out of
    /// `block_size`-byte blocks acquired from `source`.
    ///
    /// `parent` and `name` are passed straight through to
    /// `framework.register`, finalizing the new context under its parent in
    /// whatever bookkeeping the embedding framework keeps; neither is stored
    /// on the context itself.
    pub fn create(
        name: &'static str,
        parent: Option<&str>,
        chunk_size: usize,
        block_size: usize,
        source: impl BlockSource + 'static,
        framework: impl ContextFramework + 'static,
    ) -> SlabResult<Self> {
        if chunk_size == 0 {
            return Err(SlabError::InvariantViolation);
        }
        let chunk_header_size = ChunkHeader::full_header_size(ALIGN);
        let aligned_chunk = (chunk_size + ALIGN - 1) & !(ALIGN - 1);
        if aligned_chunk > chunk::MAX_ENCODED_CHUNK_SIZE {
            return Err(SlabError::InvariantViolation);
        }
        let full_chunk_size = chunk_header_size
            .checked_add(aligned_chunk)
            .ok_or(SlabError::InvariantViolation)?;
        let block_header_size = BlockHeader::header_size(ALIGN);

        if block_size <= block_header_size {
            return Err(SlabError::InvariantViolation);
        }
        let chunks_per_block = ((block_size - block_header_size) / full_chunk_size) as u32;
        if chunks_per_block == 0 {
            return Err(SlabError::InvariantViolation);
        }

        let mut buckets = Vec::with_capacity(chunks_per_block as usize + 1);
        for _ in 0..=chunks_per_block {
            buckets.push(LinkedList::new(BlockAdapter::new()));
        }

        let chunk_tag = chunk::pack_tag(chunk::SLAB_KIND, aligned_chunk);

        let layout = Layout::new::<ContextInner>();
        // SAFETY: `layout` has a non-zero size (`ContextInner` is not a ZST).
        let raw = unsafe { alloc::alloc::alloc(layout) } as *mut ContextInner;
        let raw = NonNull::new(raw).ok_or(SlabError::OutOfMemory)?;
        // SAFETY: `raw` points to a fresh, uninitialized, correctly laid out
        // allocation for `ContextInner`; nothing else can observe it yet.
        unsafe {
            raw.as_ptr().write(ContextInner {
                source: Box::new(source),
                framework: Box::new(framework),
                chunk_size,
                block_size,
                chunk_header_size,
                block_header_size,
                full_chunk_size,
                chunks_per_block,
                chunk_tag,
                buckets,
                min_free_chunks: 0,
                block_count: 0,
                alloc_count: 0,
                name,
                #[cfg(feature = "randomize-allocated")]
                rand_state: (0x9e37_79b9_7f4a_7c15u64
                    ^ (chunk_size as u64)
                    ^ (block_size as u64).rotate_left(32))
                    | 1,
            });
        }
        // SAFETY: `raw` was allocated with `Layout::new::<ContextInner>()` and
        // just initialized above.
        let inner = unsafe { Box::from_raw(raw.as_ptr()) };
        inner.framework.register(parent, name);
        Ok(Context { inner })
    }

    /// Creates a context using the global allocator as its block source and
    /// no framework integration.
    pub fn create_global(name: &'static str, chunk_size: usize, block_size: usize) -> SlabResult<Self> {
        Self::create(
            name,
            None,
            chunk_size,
            block_size,
            GlobalBlockSource,
            crate::framework::NullFramework,
        )
    }

    /// Allocates one chunk. `size` must equal this context's chunk size.
    ///
    /// Returns `Ok(None)` (not an error) when the host allocator could not
    /// supply a new block — this is the expected, recoverable "no memory
    /// right now" outcome, distinct from a misuse error.
    pub fn alloc(&mut self, size: usize) -> SlabResult<Option<NonNull<u8>>> {
        if size != self.inner.chunk_size {
            return Err(SlabError::InvariantViolation);
        }
        Ok(self.inner.alloc_chunk())
    }

    /// Frees a chunk previously returned by [`alloc`](Self::alloc).
    ///
    /// # Safety
    ///
    /// `ptr` must be a live chunk from this context, not already freed.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        unsafe { self.inner.free_chunk(ptr) }
    }

    /// Reallocates a chunk. Since every chunk in a context has the same
    /// size, this only succeeds (as a no-op returning `ptr` unchanged) when
    /// `new_size` equals the context's chunk size.
    pub fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> SlabResult<NonNull<u8>> {
        if new_size != self.inner.chunk_size {
            return Err(SlabError::UnsupportedOperation);
        }
        Ok(ptr)
    }

    /// Releases every block this context holds, without destroying the
    /// context itself.
    pub fn reset(&mut self) {
        self.inner.reset_blocks();
    }

    /// Whether the context currently has any live allocations.
    pub fn is_empty(&self) -> bool {
        self.inner.alloc_count == 0
    }

    /// The fixed payload size this context hands out.
    pub fn chunk_space(&self) -> usize {
        self.inner.chunk_size
    }

    /// Number of chunks currently allocated.
    pub fn alloc_count(&self) -> usize {
        self.inner.alloc_count
    }

    /// Number of blocks currently held, whether or not they have free space.
    pub fn block_count(&self) -> usize {
        self.inner.block_count
    }

    /// Recovers the owning context for a chunk previously returned by
    /// [`alloc`](Self::alloc).
    ///
    /// # Safety
    ///
    /// `ptr` must be a chunk currently owned by `header_size`-consistent
    /// context (i.e. one produced by some `Context::alloc`).
    pub unsafe fn chunk_context(ptr: NonNull<u8>, header_size: usize) -> NonNull<ContextInner> {
        let header = unsafe { ChunkHeader::from_payload(ptr, header_size) };
        let block = unsafe { header.as_ref().block };
        unsafe { block.as_ref().context }
    }

    /// Collects usage statistics, reporting them through `emit` and through
    /// the owning framework's own reporting path.
    pub fn stats(&self, mut emit: impl FnMut(fmt::Arguments)) {
        let framework = &self.inner.framework;
        let name = self.inner.name;
        Stats::collect(&self.inner).report(|args| {
            framework.emit_stats(name, args);
            emit(args);
        });
    }

    /// Runs a full consistency check over every bucket and block.
    ///
    /// Only available with the `memory-checking` feature; intended for
    /// debug builds and tests, not the hot path.
    #[cfg(feature = "memory-checking")]
    pub fn check(&self) -> SlabResult<()> {
        self.inner.check()
    }

    pub(crate) fn inner(&self) -> &ContextInner {
        &self.inner
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.inner.reset_blocks();
        warn!("{}: context dropped", self.inner.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::NullFramework;
    use crate::host::test_support::TestBlockSource;

    fn ctx(chunk_size: usize, block_size: usize) -> Context {
        Context::create(
            "test",
            None,
            chunk_size,
            block_size,
            TestBlockSource::default(),
            NullFramework,
        )
        .unwrap()
    }

    #[test]
    fn rejects_block_too_small_for_one_chunk() {
        assert_eq!(
            Context::create("t", None, 64, 8, TestBlockSource::default(), NullFramework).unwrap_err(),
            SlabError::InvariantViolation
        );
    }

    #[test]
    fn alloc_then_free_roundtrips() {
        let mut c = ctx(64, 1024);
        let p = c.alloc(64).unwrap().unwrap();
        assert_eq!(c.alloc_count(), 1);
        unsafe { c.free(p) };
        assert_eq!(c.alloc_count(), 0);
    }

    #[test]
    fn alloc_wrong_size_is_invariant_violation() {
        let mut c = ctx(64, 1024);
        assert_eq!(c.alloc(32).unwrap_err(), SlabError::InvariantViolation);
    }

    #[test]
    fn fills_one_block_then_grows() {
        let mut c = ctx(64, 1024);
        let mut ptrs = Vec::new();
        for _ in 0..64 {
            if let Some(p) = c.alloc(64).unwrap() {
                ptrs.push(p);
            } else {
                break;
            }
        }
        assert!(c.block_count() >= 1);
        for p in ptrs {
            unsafe { c.free(p) };
        }
        assert_eq!(c.alloc_count(), 0);
    }

    #[test]
    fn realloc_same_size_is_noop() {
        let mut c = ctx(64, 1024);
        let p = c.alloc(64).unwrap().unwrap();
        let p2 = c.realloc(p, 64).unwrap();
        assert_eq!(p, p2);
        unsafe { c.free(p2) };
    }

    #[test]
    fn realloc_different_size_unsupported() {
        let c = ctx(64, 1024);
        let p = NonNull::<u8>::dangling();
        assert_eq!(c.realloc(p, 32).unwrap_err(), SlabError::UnsupportedOperation);
    }
}
