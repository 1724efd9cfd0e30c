//! Element allocator traits
//!
//! The four-operation allocator capability consumed by generic containers:
//! - `allocate` / `deallocate` hand out and take back storage for `n` elements
//! - `construct` / `destroy` act on one element in place and never touch the
//!   pool
//!
//! # Safety
//!
//! ## Trait Safety Contracts
//!
//! - **ElementAllocator**: storage returned by `allocate(n)` is valid and
//!   aligned for `n` values of `T` and not handed to anybody else until it is
//!   deallocated
//! - **SharedBufferAllocator**: a live allocation may have several owners;
//!   it is only reusable after every owner has deallocated it
//!
//! ## Default Implementation Safety
//!
//! `construct` and `destroy` are plain `ptr::write` / `ptr::drop_in_place`;
//! the caller guarantees the slot is valid and in the right state.

use core::ptr::NonNull;

use crate::error::RecycleResult;

/// Allocator of contiguous storage for values of `T`
///
/// Two allocators that compare equal must be interchangeable: storage from
/// one may be deallocated through the other.
///
/// # Safety
///
/// Implementors must ensure that:
/// - a successful `allocate(n)` returns storage valid for reads and writes of
///   `n` values of `T`, aligned for `T`, and exclusive to the caller
/// - `deallocate` rejects (with an error) pointer/count pairs it never issued
///   instead of corrupting its state
pub unsafe trait ElementAllocator<T> {
    /// Allocate storage for `n` elements
    ///
    /// The storage is **not initialized**.
    fn allocate(&self, n: usize) -> RecycleResult<NonNull<T>>;

    /// Give back storage for `n` elements
    ///
    /// # Safety
    ///
    /// - `ptr` must come from `allocate(n)` on an equal allocator
    /// - the caller must own the allocation and not touch it afterwards
    /// - any values still in the storage are not dropped
    unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) -> RecycleResult<()>;

    /// Write `value` into an uninitialized slot
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes and aligned; a value already in the slot
    /// is overwritten without being dropped.
    #[inline]
    unsafe fn construct(&self, ptr: NonNull<T>, value: T) {
        // SAFETY: caller guarantees ptr is valid for writes.
        unsafe { ptr.as_ptr().write(value) };
    }

    /// Drop the value in an initialized slot, leaving it uninitialized
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized value that is not used afterwards.
    #[inline]
    unsafe fn destroy(&self, ptr: NonNull<T>) {
        // SAFETY: caller guarantees ptr points to an initialized value.
        unsafe { ptr.as_ptr().drop_in_place() };
    }
}

/// Allocator whose allocations can have several owners
///
/// Every owner, including the one that called `allocate`, releases its share
/// with `deallocate`; the storage is reusable after the last one.
///
/// # Safety
///
/// Same requirements as [`ElementAllocator`], plus: storage with at least one
/// outstanding owner is never handed out again.
pub unsafe trait SharedBufferAllocator<T>: ElementAllocator<T> {
    /// Register one more owner of a live allocation of `n` elements
    fn increase_usage_counter(&self, ptr: NonNull<T>, n: usize) -> RecycleResult<()>;
}
