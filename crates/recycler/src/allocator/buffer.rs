//! Fixed-length buffer over an element allocator
//!
//! # Safety
//!
//! `RecycledBuffer` keeps two counts:
//! - `capacity`: elements the storage was allocated for, always the count
//!   given back on deallocation
//! - `len`: elements constructed so far; only `[0, len)` is ever exposed
//!
//! `len` only reaches `capacity` once construction has finished. If an
//! element constructor panics, `Drop` destroys the `len` elements built so
//! far and still deallocates the full `capacity`.

use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

#[cfg(feature = "logging")]
use tracing::error;

use super::recycle::RecycleAllocator;
use super::traits::ElementAllocator;
use crate::error::RecycleResult;

/// Owned, initialized, fixed-length buffer of `T` allocated through `A`
///
/// # Examples
///
/// ```
/// use nebula_recycler::prelude::*;
///
/// let mut buffer = RecycledBuffer::<f64>::from_elem(1024, 0.0)?;
/// buffer[0] = 1.5;
/// assert_eq!(buffer.iter().sum::<f64>(), 1.5);
///
/// let address = buffer.as_ptr();
/// drop(buffer);
///
/// // Same size, same storage
/// let again = RecycledBuffer::<f64>::from_elem(1024, 0.0)?;
/// assert_eq!(again.as_ptr(), address);
/// # Ok::<(), RecycleError>(())
/// ```
pub struct RecycledBuffer<T, A: ElementAllocator<T> = RecycleAllocator<T>> {
    ptr: NonNull<T>,
    len: usize,
    capacity: usize,
    allocator: A,
    _owns: PhantomData<T>,
}

// SAFETY: the buffer owns its elements exclusively, like a `Box<[T]>`.
unsafe impl<T: Send, A: ElementAllocator<T> + Send> Send for RecycledBuffer<T, A> {}

// SAFETY: shared access only hands out `&[T]`.
unsafe impl<T: Sync, A: ElementAllocator<T> + Sync> Sync for RecycledBuffer<T, A> {}

impl<T, A: ElementAllocator<T> + Default> RecycledBuffer<T, A> {
    /// Buffer of `len` clones of `value`
    pub fn from_elem(len: usize, value: T) -> RecycleResult<Self>
    where
        T: Clone,
    {
        Self::from_elem_in(len, value, A::default())
    }

    /// Buffer of `len` elements produced by `f(index)`
    pub fn from_fn<F>(len: usize, f: F) -> RecycleResult<Self>
    where
        F: FnMut(usize) -> T,
    {
        Self::from_fn_in(len, f, A::default())
    }

    /// Buffer of `len` default values
    pub fn with_len(len: usize) -> RecycleResult<Self>
    where
        T: Default,
    {
        Self::from_fn(len, |_| T::default())
    }
}

impl<T, A: ElementAllocator<T>> RecycledBuffer<T, A> {
    /// Buffer of `len` clones of `value`, allocated through `allocator`
    pub fn from_elem_in(len: usize, value: T, allocator: A) -> RecycleResult<Self>
    where
        T: Clone,
    {
        Self::from_fn_in(len, |_| value.clone(), allocator)
    }

    /// Buffer of `len` elements produced by `f(index)`, allocated through `allocator`
    ///
    /// An empty buffer allocates nothing.
    pub fn from_fn_in<F>(len: usize, mut f: F, allocator: A) -> RecycleResult<Self>
    where
        F: FnMut(usize) -> T,
    {
        let ptr = if len == 0 {
            NonNull::dangling()
        } else {
            allocator.allocate(len)?
        };

        let mut buffer = Self {
            ptr,
            len: 0,
            capacity: len,
            allocator,
            _owns: PhantomData,
        };

        while buffer.len < buffer.capacity {
            let value = f(buffer.len);
            // SAFETY: slot `len` is inside the allocation and uninitialized.
            unsafe {
                buffer
                    .allocator
                    .construct(buffer.ptr.add(buffer.len), value);
            }
            buffer.len += 1;
        }

        Ok(buffer)
    }

    /// Number of elements
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if the buffer is empty
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the first element
    #[inline]
    pub const fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }

    /// Mutable raw pointer to the first element
    #[inline]
    pub const fn as_mut_ptr(&mut self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Allocator the buffer returns its storage to
    #[inline]
    pub const fn allocator(&self) -> &A {
        &self.allocator
    }
}

impl<T, A: ElementAllocator<T>> Deref for RecycledBuffer<T, A> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &[T] {
        // SAFETY: [0, len) is initialized and owned by self.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T, A: ElementAllocator<T>> DerefMut for RecycledBuffer<T, A> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: [0, len) is initialized and exclusively borrowed through self.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T, A: ElementAllocator<T>> AsRef<[T]> for RecycledBuffer<T, A> {
    fn as_ref(&self) -> &[T] {
        self
    }
}

impl<T, A: ElementAllocator<T>> AsMut<[T]> for RecycledBuffer<T, A> {
    fn as_mut(&mut self) -> &mut [T] {
        self
    }
}

impl<T: Clone, A: ElementAllocator<T> + Clone> RecycledBuffer<T, A> {
    /// Copy into a fresh buffer from the same allocator
    pub fn try_clone(&self) -> RecycleResult<Self> {
        Self::from_fn_in(self.len, |i| self[i].clone(), self.allocator.clone())
    }
}

/// # Panics
///
/// Panics if the allocator cannot provide the storage; use
/// [`try_clone`](RecycledBuffer::try_clone) to handle that case.
impl<T: Clone, A: ElementAllocator<T> + Clone> Clone for RecycledBuffer<T, A> {
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(buffer) => buffer,
            Err(err) => panic!("failed to clone recycled buffer: {err}"),
        }
    }
}

impl<T: fmt::Debug, A: ElementAllocator<T>> fmt::Debug for RecycledBuffer<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: PartialEq, A: ElementAllocator<T>> PartialEq for RecycledBuffer<T, A> {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl<T, A: ElementAllocator<T>> Drop for RecycledBuffer<T, A> {
    fn drop(&mut self) {
        for i in 0..self.len {
            // SAFETY: slot i < len is initialized and never used again.
            unsafe { self.allocator.destroy(self.ptr.add(i)) };
        }

        if self.capacity == 0 {
            return;
        }

        // SAFETY: ptr came from allocate(capacity) on this allocator and the
        // buffer owns it.
        if let Err(err) = unsafe { self.allocator.deallocate(self.ptr, self.capacity) } {
            #[cfg(feature = "logging")]
            error!(error = %err, code = err.code(), "failed to return recycled buffer");
            #[cfg(not(feature = "logging"))]
            let _ = err;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::registry::Registry;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Arc;

    fn allocator<T>() -> RecycleAllocator<T> {
        RecycleAllocator::new_in(Box::leak(Box::new(Registry::new())))
    }

    #[test]
    fn test_from_elem() {
        let buffer = RecycledBuffer::from_elem_in(5, 7u16, allocator()).unwrap();
        assert_eq!(&*buffer, &[7, 7, 7, 7, 7]);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_from_fn_and_mutation() {
        let mut buffer = RecycledBuffer::from_fn_in(4, |i| i * 10, allocator()).unwrap();
        buffer[3] += 1;
        assert_eq!(&*buffer, &[0, 10, 20, 31]);
    }

    #[test]
    fn test_drop_returns_storage() {
        let alloc = allocator::<u64>();
        let registry = alloc.registry();

        let buffer = RecycledBuffer::from_elem_in(32, 1u64, alloc).unwrap();
        let ptr = NonNull::new(buffer.as_ptr().cast_mut()).unwrap();
        assert_eq!(registry.reference_count::<u64, HostBackend>(ptr), Some(1));

        drop(buffer);
        assert_eq!(registry.reference_count::<u64, HostBackend>(ptr), Some(0));
    }

    #[test]
    fn test_elements_dropped() {
        let counter = Arc::new(());
        let buffer = RecycledBuffer::from_elem_in(3, Arc::clone(&counter), allocator()).unwrap();
        assert_eq!(Arc::strong_count(&counter), 4);

        drop(buffer);
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[test]
    fn test_empty_buffer_allocates_nothing() {
        let alloc = allocator::<f32>();
        let registry = alloc.registry();

        let buffer = RecycledBuffer::from_elem_in(0, 0.0f32, alloc).unwrap();
        assert!(buffer.is_empty());
        drop(buffer);
        assert_eq!(registry.pool_count(), 0);
    }

    #[test]
    fn test_zero_sized_elements_recycle() {
        let alloc = allocator::<()>();
        let registry = alloc.registry();

        let buffer = RecycledBuffer::from_elem_in(3, (), alloc).unwrap();
        assert_eq!(buffer.len(), 3);
        let ptr = NonNull::new(buffer.as_ptr().cast_mut()).unwrap();
        drop(buffer);

        let again = RecycledBuffer::from_elem_in(3, (), alloc).unwrap();
        assert_eq!(again.as_ptr(), ptr.as_ptr().cast_const());
        assert_eq!(registry.stats::<(), HostBackend>().unwrap().recycled, 1);
    }

    #[test]
    fn test_panicking_constructor_cleans_up() {
        let alloc = allocator::<String>();
        let registry = alloc.registry();

        let result = catch_unwind(AssertUnwindSafe(|| {
            RecycledBuffer::from_fn_in(
                4,
                |i| {
                    assert!(i < 2, "constructor failure");
                    i.to_string()
                },
                alloc,
            )
        }));
        assert!(result.is_err());

        let stats = registry.stats::<String, HostBackend>().unwrap();
        assert_eq!(stats.used_buffers, 0);
        assert_eq!(stats.unused_buffers, 1);
    }

    #[test]
    fn test_clone_is_deep() {
        let buffer = RecycledBuffer::from_elem_in(3, 2i32, allocator()).unwrap();
        let mut copy = buffer.clone();
        copy[0] = 9;

        assert_ne!(buffer.as_ptr(), copy.as_ptr());
        assert_eq!(&*buffer, &[2, 2, 2]);
        assert_eq!(&*copy, &[9, 2, 2]);
    }
}
