//! Abstraction over the allocator that supplies and reclaims blocks.
//!
//! A [`Context`](crate::context::Context) never calls the global allocator
//! directly. It goes through a [`BlockSource`] so that an embedder (a kernel,
//! an arena, a test harness) can control where the raw memory backing its
//! blocks actually comes from.

use core::alloc::Layout;
use core::ptr::NonNull;

/// Supplies and reclaims the fixed-size blocks a context carves chunks out of.
///
/// # Safety
///
/// Implementors must return memory that is valid for reads and writes for
/// `layout.size()` bytes, aligned to `layout.align()`, and live until it is
/// passed back to [`release`](BlockSource::release). `acquire` and `release`
/// must agree on the same [`Layout`] for a given block.
pub unsafe trait BlockSource {
    /// Acquires a block of memory matching `layout`.
    ///
    /// Returns `None` if the host allocator cannot satisfy the request. This
    /// is the only failure signaled through an `Option` rather than
    /// [`SlabError`](crate::error::SlabError): the allocation hot path never
    /// needs to construct an error value for it.
    fn acquire(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Releases a block previously returned by [`acquire`](BlockSource::acquire).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `self.acquire(layout)` (or another
    /// `BlockSource` with byte-for-byte identical behavior) and not already
    /// released.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A [`BlockSource`] that defers to the process/crate's global allocator.
///
/// This is the default source used when no embedder supplies its own; it is
/// appropriate for hosted (non-`no_std`-only) use and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalBlockSource;

unsafe impl BlockSource for GlobalBlockSource {
    fn acquire(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: `layout` has a non-zero size, checked above.
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        NonNull::new(ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller upholds `BlockSource::release`'s contract.
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    /// A [`BlockSource`] that tracks every live acquisition and asserts that
    /// all of them have been released by the time it is dropped.
    ///
    /// Mirrors the leak-detecting test provider pattern used to exercise
    /// heap-like allocators: every test gets a source that panics on drop if
    /// a context forgot to return a block.
    #[derive(Default)]
    pub struct TestBlockSource {
        live: RefCell<Vec<(NonNull<u8>, Layout)>>,
    }

    unsafe impl BlockSource for TestBlockSource {
        fn acquire(&self, layout: Layout) -> Option<NonNull<u8>> {
            if layout.size() == 0 {
                return None;
            }
            let ptr = unsafe { alloc::alloc::alloc(layout) };
            let ptr = NonNull::new(ptr)?;
            self.live.borrow_mut().push((ptr, layout));
            Some(ptr)
        }

        unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
            let mut live = self.live.borrow_mut();
            let idx = live
                .iter()
                .position(|(p, l)| *p == ptr && *l == layout)
                .expect("release of a block not tracked as live");
            live.swap_remove(idx);
            unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) }
        }
    }

    impl Drop for TestBlockSource {
        fn drop(&mut self) {
            let live = self.live.borrow();
            assert!(live.is_empty(), "{} block(s) leaked", live.len());
        }
    }
}
