//! Recycling allocator adapter
//!
//! [`RecycleAllocator`] is a zero-state handle onto a [`Registry`]: every
//! call is forwarded to the `(T, B)` pool of that registry. Adapters carry no
//! per-instance state, so any two adapters on the same registry are
//! interchangeable.

use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;

use super::traits::{ElementAllocator, SharedBufferAllocator};
use crate::backend::{Backend, HostBackend};
use crate::error::RecycleResult;
use crate::registry::Registry;

/// Allocator adapter serving `T` from the recycling pool of backend `B`
///
/// # Examples
///
/// ```
/// use nebula_recycler::prelude::*;
///
/// let allocator = RecycleAllocator::<f32>::new();
///
/// let ptr = allocator.allocate(256)?;
/// unsafe { allocator.deallocate(ptr, 256)? };
///
/// // The released buffer is served again
/// assert_eq!(allocator.allocate(256)?, ptr);
/// # unsafe { allocator.deallocate(ptr, 256)? };
/// # Ok::<(), RecycleError>(())
/// ```
pub struct RecycleAllocator<T, B: Backend = HostBackend> {
    registry: &'static Registry,
    _marker: PhantomData<fn() -> (T, B)>,
}

impl<T, B: Backend> RecycleAllocator<T, B> {
    /// Adapter on the process-wide registry
    #[inline]
    pub fn new() -> Self {
        Self::new_in(Registry::global())
    }

    /// Adapter on a specific registry
    #[inline]
    pub const fn new_in(registry: &'static Registry) -> Self {
        Self {
            registry,
            _marker: PhantomData,
        }
    }

    /// Registry this adapter forwards to
    #[inline]
    pub const fn registry(&self) -> &'static Registry {
        self.registry
    }

    /// The adapter for element type `U` on the same registry and backend
    #[inline]
    pub const fn rebind<U>(&self) -> RecycleAllocator<U, B> {
        RecycleAllocator::new_in(self.registry)
    }
}

impl<T, B: Backend> Default for RecycleAllocator<T, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, B: Backend> Clone for RecycleAllocator<T, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, B: Backend> Copy for RecycleAllocator<T, B> {}

/// Equal when both adapters forward to the same registry
impl<T, B: Backend> PartialEq for RecycleAllocator<T, B> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.registry, other.registry)
    }
}

impl<T, B: Backend> Eq for RecycleAllocator<T, B> {}

impl<T, B: Backend> fmt::Debug for RecycleAllocator<T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecycleAllocator")
            .field("type_name", &core::any::type_name::<T>())
            .field("backend", &B::NAME)
            .field("global", &self.registry.is_global())
            .finish()
    }
}

// SAFETY: the registry hands out each live buffer to one `get` caller only,
// sized and aligned for `n` values of `T` by `Layout::array::<T>(n)`, and
// rejects unknown or mis-sized releases with an error.
unsafe impl<T: Send + 'static, B: Backend> ElementAllocator<T> for RecycleAllocator<T, B> {
    #[inline]
    fn allocate(&self, n: usize) -> RecycleResult<NonNull<T>> {
        self.registry.get::<T, B>(n)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) -> RecycleResult<()> {
        // SAFETY: the caller owns the reference it gives back.
        unsafe { self.registry.mark_unused::<T, B>(ptr, n) }
    }
}

// SAFETY: buffers with a non-zero reference count stay in the pool's used set
// and are never recycled.
unsafe impl<T: Send + 'static, B: Backend> SharedBufferAllocator<T> for RecycleAllocator<T, B> {
    #[inline]
    fn increase_usage_counter(&self, ptr: NonNull<T>, n: usize) -> RecycleResult<()> {
        self.registry.increase_usage_counter::<T, B>(ptr, n)
    }
}
