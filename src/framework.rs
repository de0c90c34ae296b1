//! The interface an embedding memory-context framework consumes.
//!
//! A context doesn't know or care who created it. [`ContextFramework`] is
//! the hook an embedder implements to be told about contexts as they're
//! created and to receive their stats on demand; [`MemoryContextOps`]
//! is the uniform operation surface the framework dispatches through,
//! independent of which concrete context implementation backs it.

use crate::context::Context;
use crate::error::SlabResult;
use core::fmt;
use core::ptr::NonNull;

/// Hook implemented by whatever owns a collection of contexts.
///
/// Mirrors the registration/reporting touch points an external allocator
/// framework needs: know when a context comes into existence, and be able
/// to pull its stats out on demand (for a top-level `SHOW MEMORY`-style
/// dump, a metrics exporter, or a leak audit).
pub trait ContextFramework {
    /// Called once, right after a context is created, finalizing it under
    /// `parent` (if any) and recording `name`.
    fn register(&self, parent: Option<&str>, name: &str);

    /// Called to report a context's stats through the framework's own
    /// formatting/output path.
    fn emit_stats(&self, name: &str, line: fmt::Arguments);
}

/// A [`ContextFramework`] that does nothing.
///
/// The default for contexts created without an explicit framework —
/// registration and stats emission become no-ops rather than requiring
/// every caller to thread through a dummy implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFramework;

impl ContextFramework for NullFramework {
    fn register(&self, _parent: Option<&str>, _name: &str) {}
    fn emit_stats(&self, _name: &str, _line: fmt::Arguments) {}
}

/// Uniform dispatch surface over a context's operations.
///
/// Exists so callers that hold a `&dyn MemoryContextOps` (rather than a
/// concrete [`Context`]) can still drive the full operation set without
/// knowing which context implementation backs it.
pub trait MemoryContextOps {
    /// See [`Context::alloc`].
    fn alloc(&mut self, size: usize) -> SlabResult<Option<NonNull<u8>>>;

    /// See [`Context::free`].
    ///
    /// # Safety
    /// Same preconditions as [`Context::free`].
    unsafe fn free(&mut self, ptr: NonNull<u8>);

    /// See [`Context::realloc`].
    fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> SlabResult<NonNull<u8>>;

    /// See [`Context::reset`].
    fn reset(&mut self);

    /// See [`Context::is_empty`].
    fn is_empty(&self) -> bool;

    /// See [`Context::chunk_space`].
    fn chunk_space(&self) -> usize;

    /// See [`Context::stats`].
    fn stats(&self, emit: &mut dyn FnMut(fmt::Arguments));
}

impl MemoryContextOps for Context {
    fn alloc(&mut self, size: usize) -> SlabResult<Option<NonNull<u8>>> {
        Context::alloc(self, size)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        unsafe { Context::free(self, ptr) }
    }

    fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> SlabResult<NonNull<u8>> {
        Context::realloc(self, ptr, new_size)
    }

    fn reset(&mut self) {
        Context::reset(self)
    }

    fn is_empty(&self) -> bool {
        Context::is_empty(self)
    }

    fn chunk_space(&self) -> usize {
        Context::chunk_space(self)
    }

    fn stats(&self, emit: &mut dyn FnMut(fmt::Arguments)) {
        Context::stats(self, emit)
    }
}
