//! Error kinds produced by the slab allocator.

use core::fmt;

/// An error produced by a [`Context`](crate::context::Context) operation.
///
/// `alloc`'s host-allocator failure is deliberately *not* a variant here: it
/// is signaled by returning `None` rather than by raising, so that the hot
/// allocation path never has to construct an error value (see
/// [`Context::alloc`](crate::context::Context::alloc)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
	/// The host allocator failed while creating a context's header.
	///
	/// The context is not created; no partially-initialized state is left
	/// observable.
	OutOfMemory,
	/// A caller-supplied size didn't match what the operation requires.
	///
	/// Raised when `alloc` is called with a size other than `chunk_size`, or
	/// when `create` is given a `block_size` too small to hold a single
	/// chunk, or when `chunk_size`'s aligned form would overflow the chunk
	/// header's back-link encoding.
	InvariantViolation,
	/// `realloc` was called with a size other than the context's `chunk_size`.
	///
	/// This allocator never resizes in place and never copies; the only
	/// size `realloc` accepts is the one it already has.
	UnsupportedOperation,
	/// A debug-mode consistency check found corrupted allocator state.
	///
	/// Only produced when the `memory-checking` feature is enabled. Callers
	/// are expected to log this and stop, not recover from it; the allocator
	/// itself never raises this internally (see
	/// [`Context::check`](crate::context::Context::check)).
	CorruptionDetected,
}

impl fmt::Display for SlabError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let msg = match self {
			Self::OutOfMemory => "host allocator failed to provide memory for a new context",
			Self::InvariantViolation => "operation size did not match the context's chunk size",
			Self::UnsupportedOperation => "realloc to a different size is not supported",
			Self::CorruptionDetected => "consistency check detected corrupted slab state",
		};
		f.write_str(msg)
	}
}

impl core::error::Error for SlabError {}

/// Convenience alias for fallible slab operations.
pub type SlabResult<T> = Result<T, SlabError>;
