//! Property tests covering the allocator's core invariants and laws:
//!
//! - every chunk handed out is distinct from every other live chunk,
//! - `alloc_count` after a sequence of alloc/free ops matches the number of
//!   ops that weren't undone,
//! - `reset` always returns a context to the empty state regardless of
//!   history,
//! - a dropped context never leaks a block (enforced by `LeakCheckingSource`'s
//!   own `Drop` impl panicking on leftovers).

use proptest::prelude::*;
use slab_alloc::context::Context;
use slab_alloc::host::{BlockSource, GlobalBlockSource};
use slab_alloc::NullFramework;
use std::alloc::Layout;
use std::cell::Cell;
use std::ptr::NonNull;

/// A [`BlockSource`] that panics on drop if any block it handed out was
/// never released, catching leaks the same way the crate's own internal
/// test helper does.
#[derive(Default)]
struct LeakCheckingSource {
    outstanding: Cell<usize>,
    inner: GlobalBlockSource,
}

unsafe impl BlockSource for LeakCheckingSource {
    fn acquire(&self, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = self.inner.acquire(layout)?;
        self.outstanding.set(self.outstanding.get() + 1);
        Some(ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        self.outstanding.set(self.outstanding.get() - 1);
        unsafe { self.inner.release(ptr, layout) }
    }
}

impl Drop for LeakCheckingSource {
    fn drop(&mut self) {
        assert_eq!(self.outstanding.get(), 0, "block(s) leaked");
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Alloc,
    Free(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Alloc),
        2 => (0usize..64).prop_map(Op::Free),
    ]
}

proptest! {
    #[test]
    fn alloc_free_sequence_keeps_accounting_consistent(ops in proptest::collection::vec(op_strategy(), 0..200)) {
        let mut ctx = Context::create(
            "prop",
            None,
            64,
            1024,
            LeakCheckingSource::default(),
            NullFramework,
        )
        .unwrap();
        let mut live: Vec<core::ptr::NonNull<u8>> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc => {
                    if let Some(p) = ctx.alloc(64).unwrap() {
                        prop_assert!(!live.contains(&p), "alloc returned a pointer already live");
                        live.push(p);
                    }
                }
                Op::Free(idx) => {
                    if !live.is_empty() {
                        let idx = idx % live.len();
                        let p = live.swap_remove(idx);
                        unsafe { ctx.free(p) };
                    }
                }
            }
            prop_assert_eq!(ctx.alloc_count(), live.len());
        }

        for p in live {
            unsafe { ctx.free(p) };
        }
        prop_assert_eq!(ctx.alloc_count(), 0);
        prop_assert!(ctx.is_empty());
    }

    #[test]
    fn reset_always_empties_the_context(n_allocs in 0usize..300) {
        let mut ctx = Context::create(
            "prop-reset",
            None,
            32,
            512,
            LeakCheckingSource::default(),
            NullFramework,
        )
        .unwrap();
        for _ in 0..n_allocs {
            let _ = ctx.alloc(32).unwrap();
        }
        ctx.reset();
        prop_assert_eq!(ctx.alloc_count(), 0);
        prop_assert_eq!(ctx.block_count(), 0);
        prop_assert!(ctx.is_empty());
    }

    #[test]
    fn realloc_is_identity_at_fixed_size(_seed in 0u8..1) {
        let mut ctx = Context::create(
            "prop-realloc",
            None,
            48,
            768,
            LeakCheckingSource::default(),
            NullFramework,
        )
        .unwrap();
        let p = ctx.alloc(48).unwrap().unwrap();
        let p2 = ctx.realloc(p, 48).unwrap();
        prop_assert_eq!(p, p2);
        unsafe { ctx.free(p2) };
    }

    #[test]
    #[cfg(feature = "memory-checking")]
    fn check_holds_after_every_op(ops in proptest::collection::vec(op_strategy(), 0..200)) {
        let mut ctx = Context::create(
            "prop-check",
            None,
            64,
            1024,
            LeakCheckingSource::default(),
            NullFramework,
        )
        .unwrap();
        let mut live: Vec<core::ptr::NonNull<u8>> = Vec::new();

        prop_assert!(ctx.check().is_ok());
        for op in ops {
            match op {
                Op::Alloc => {
                    if let Some(p) = ctx.alloc(64).unwrap() {
                        live.push(p);
                    }
                }
                Op::Free(idx) => {
                    if !live.is_empty() {
                        let idx = idx % live.len();
                        let p = live.swap_remove(idx);
                        unsafe { ctx.free(p) };
                    }
                }
            }
            prop_assert!(ctx.check().is_ok());
        }

        for p in live {
            unsafe { ctx.free(p) };
        }
        prop_assert!(ctx.check().is_ok());
    }
}
