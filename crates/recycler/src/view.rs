//! Reference-counted views over recycled buffers
//!
//! A [`BufferView`] is an unmanaged, cheaply clonable window onto memory it
//! does not own: a pointer plus a shape. [`RecycledView`] pairs such a view
//! with the buffer backing it and keeps the buffer's reference count in step
//! with the number of live handles:
//! - construction allocates one reference
//! - every clone acquires one more
//! - assignment releases the target's old reference first, then acquires one
//!   on the source's buffer
//! - drop releases exactly one
//!
//! A handle whose assignment failed after its old reference was released owns
//! no reference at all; dropping it releases nothing.
//!
//! Moves transfer a handle without touching the count: a moved-from value is
//! gone and never drops, so acquiring on move would leak a reference.
//!
//! # Safety
//!
//! Views never drop their elements and may be read through several handles at
//! once. Element access is therefore the view's own (unsafe) business;
//! [`RecycledView`] only manages the lifetime of the storage.

use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::NonNull;

#[cfg(feature = "logging")]
use tracing::error;

use crate::allocator::{RecycleAllocator, SharedBufferAllocator};
use crate::error::RecycleResult;

// ============================================================================
// View capability
// ============================================================================

/// Unmanaged view constructible from a pointer and a shape
pub trait BufferView<T>: Clone {
    /// Shape arguments, e.g. an extent per dimension
    type Shape;

    /// Elements of backing storage a view of `shape` needs
    fn required_elements(shape: &Self::Shape) -> usize;

    /// Wrap existing storage
    ///
    /// # Safety
    ///
    /// `data` must be valid for `required_elements(&shape)` elements for as
    /// long as the view, or any clone of it, is used.
    unsafe fn from_raw_parts(data: NonNull<T>, shape: Self::Shape) -> Self;

    /// First element of the backing storage
    fn data(&self) -> NonNull<T>;
}

/// One-dimensional view of `len` elements
pub struct SliceView<T> {
    data: NonNull<T>,
    len: usize,
}

// SAFETY: a SliceView is a shared pointer into storage of T; it can move to or
// be shared with another thread whenever &T / &mut T could.
unsafe impl<T: Send> Send for SliceView<T> {}
// SAFETY: see above.
unsafe impl<T: Sync> Sync for SliceView<T> {}

impl<T> Clone for SliceView<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SliceView<T> {}

impl<T> fmt::Debug for SliceView<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceView")
            .field("data", &self.data)
            .field("len", &self.len)
            .finish()
    }
}

impl<T> SliceView<T> {
    /// Number of elements
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if the view is empty
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the first element
    #[inline]
    pub const fn as_ptr(&self) -> *mut T {
        self.data.as_ptr()
    }

    /// Borrow the elements
    ///
    /// # Safety
    ///
    /// All `len` elements must be initialized and not written through another
    /// view while the slice lives.
    #[inline]
    pub unsafe fn as_slice(&self) -> &[T] {
        // SAFETY: caller guarantees initialization and no concurrent writes.
        unsafe { core::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    /// Mutably borrow the elements
    ///
    /// # Safety
    ///
    /// All `len` elements must be initialized and not accessed through another
    /// view while the slice lives.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [T] {
        // SAFETY: caller guarantees initialization and exclusive access.
        unsafe { core::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }
}

impl<T> BufferView<T> for SliceView<T> {
    type Shape = usize;

    #[inline]
    fn required_elements(shape: &usize) -> usize {
        *shape
    }

    #[inline]
    unsafe fn from_raw_parts(data: NonNull<T>, len: usize) -> Self {
        Self { data, len }
    }

    #[inline]
    fn data(&self) -> NonNull<T> {
        self.data
    }
}

// ============================================================================
// Recycled view
// ============================================================================

/// A view that shares ownership of its recycled backing buffer
///
/// # Examples
///
/// ```
/// use nebula_recycler::prelude::*;
///
/// let view = RecycledView::<SliceView<f32>, f32>::filled(64, 1.0)?;
/// let shared = view.clone();
/// assert_eq!(shared.data(), view.data());
///
/// drop(view);
/// // `shared` still holds the buffer
/// assert_eq!(unsafe { shared.as_slice() }[63], 1.0);
/// # Ok::<(), RecycleError>(())
/// ```
pub struct RecycledView<V, T, A = RecycleAllocator<T>>
where
    V: BufferView<T>,
    A: SharedBufferAllocator<T> + Clone,
{
    view: V,
    total_elements: usize,
    allocator: A,
    // false only after a failed `assign_from`
    holds_reference: bool,
    _element: PhantomData<fn() -> T>,
}

impl<V, T, A> RecycledView<V, T, A>
where
    V: BufferView<T>,
    A: SharedBufferAllocator<T> + Clone + Default,
{
    /// Allocate a buffer for `shape` and view it
    ///
    /// The elements are **not initialized**.
    pub fn new(shape: V::Shape) -> RecycleResult<Self> {
        Self::new_in(shape, A::default())
    }

    /// Allocate a buffer for `shape` with every element set to `value`
    pub fn filled(shape: V::Shape, value: T) -> RecycleResult<Self>
    where
        T: Copy,
    {
        Self::filled_in(shape, value, A::default())
    }
}

impl<V, T, A> RecycledView<V, T, A>
where
    V: BufferView<T>,
    A: SharedBufferAllocator<T> + Clone,
{
    /// Allocate a buffer for `shape` through `allocator` and view it
    ///
    /// The elements are **not initialized**.
    pub fn new_in(shape: V::Shape, allocator: A) -> RecycleResult<Self> {
        let total_elements = V::required_elements(&shape);
        let data = allocator.allocate(total_elements)?;

        // SAFETY: data holds total_elements elements and stays allocated
        // while this handle or a clone of it is alive.
        let view = unsafe { V::from_raw_parts(data, shape) };

        Ok(Self {
            view,
            total_elements,
            allocator,
            holds_reference: true,
            _element: PhantomData,
        })
    }

    /// Allocate a buffer for `shape` through `allocator`, every element set to `value`
    pub fn filled_in(shape: V::Shape, value: T, allocator: A) -> RecycleResult<Self>
    where
        T: Copy,
    {
        let this = Self::new_in(shape, allocator)?;
        let data = this.view.data();
        for i in 0..this.total_elements {
            // SAFETY: i < total_elements; T: Copy has no drop glue to skip.
            unsafe { data.add(i).write(value) };
        }
        Ok(this)
    }

    /// Share the buffer with a new handle
    ///
    /// # Errors
    ///
    /// Fails only if the buffer is no longer tracked, which means it was torn
    /// down underneath this handle.
    pub fn try_clone(&self) -> RecycleResult<Self> {
        self.allocator
            .increase_usage_counter(self.view.data(), self.total_elements)?;

        Ok(Self {
            view: self.view.clone(),
            total_elements: self.total_elements,
            allocator: self.allocator.clone(),
            holds_reference: true,
            _element: PhantomData,
        })
    }

    /// Make this handle view `source`'s buffer
    ///
    /// The reference to the current buffer is released before the one on
    /// `source`'s buffer is acquired, so the handle never holds two.
    ///
    /// # Errors
    ///
    /// If the acquire fails, the handle is left viewing `source`'s buffer
    /// without owning a reference to it: dropping it releases nothing, and a
    /// later successful `assign_from` makes it whole again.
    pub fn assign_from(&mut self, source: &Self) -> RecycleResult<()> {
        if self.holds_reference {
            // SAFETY: this handle owns one reference to its current buffer and
            // gives it up here.
            unsafe {
                self.allocator
                    .deallocate(self.view.data(), self.total_elements)?;
            }
            self.holds_reference = false;
        }

        self.view = source.view.clone();
        self.total_elements = source.total_elements;
        self.allocator = source.allocator.clone();

        self.allocator
            .increase_usage_counter(self.view.data(), self.total_elements)?;
        self.holds_reference = true;
        Ok(())
    }

    /// The wrapped view
    #[inline]
    pub const fn view(&self) -> &V {
        &self.view
    }

    /// First element of the backing buffer
    #[inline]
    pub fn data(&self) -> NonNull<T> {
        self.view.data()
    }

    /// Element count of the backing buffer
    #[inline]
    pub const fn total_elements(&self) -> usize {
        self.total_elements
    }

    /// Allocator the buffer is shared through
    #[inline]
    pub const fn allocator(&self) -> &A {
        &self.allocator
    }
}

impl<V, T, A> Deref for RecycledView<V, T, A>
where
    V: BufferView<T>,
    A: SharedBufferAllocator<T> + Clone,
{
    type Target = V;

    #[inline]
    fn deref(&self) -> &V {
        &self.view
    }
}

/// # Panics
///
/// `clone` and `clone_from` panic if the buffer is no longer tracked; use
/// [`try_clone`](RecycledView::try_clone) and
/// [`assign_from`](RecycledView::assign_from) to handle that case.
impl<V, T, A> Clone for RecycledView<V, T, A>
where
    V: BufferView<T>,
    A: SharedBufferAllocator<T> + Clone,
{
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(view) => view,
            Err(err) => panic!("failed to share recycled view: {err}"),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if let Err(err) = self.assign_from(source) {
            panic!("failed to assign recycled view: {err}");
        }
    }
}

impl<V, T, A> fmt::Debug for RecycledView<V, T, A>
where
    V: BufferView<T> + fmt::Debug,
    A: SharedBufferAllocator<T> + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecycledView")
            .field("view", &self.view)
            .field("total_elements", &self.total_elements)
            .field("holds_reference", &self.holds_reference)
            .finish()
    }
}

impl<V, T, A> Drop for RecycledView<V, T, A>
where
    V: BufferView<T>,
    A: SharedBufferAllocator<T> + Clone,
{
    fn drop(&mut self) {
        if !self.holds_reference {
            return;
        }

        // SAFETY: the handle owns exactly one reference.
        if let Err(err) = unsafe {
            self.allocator
                .deallocate(self.view.data(), self.total_elements)
        } {
            #[cfg(feature = "logging")]
            error!(error = %err, code = err.code(), "failed to release recycled view");
            #[cfg(not(feature = "logging"))]
            let _ = err;
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::allocator::ElementAllocator;
    use crate::backend::HostBackend;
    use crate::error::RecycleError;
    use crate::registry::Registry;

    type FloatView = RecycledView<SliceView<f32>, f32>;

    fn allocator() -> RecycleAllocator<f32> {
        RecycleAllocator::new_in(Box::leak(Box::new(Registry::new())))
    }

    fn references(view: &FloatView) -> Option<usize> {
        view.allocator()
            .registry()
            .reference_count::<f32, HostBackend>(view.data())
    }

    #[test]
    fn test_clone_shares_buffer() {
        let view = FloatView::filled_in(16, 2.0, allocator()).unwrap();
        let copy = view.clone();

        assert_eq!(copy.data(), view.data());
        assert_eq!(references(&view), Some(2));

        drop(copy);
        assert_eq!(references(&view), Some(1));
        assert_eq!(unsafe { view.as_slice() }, &[2.0; 16]);
    }

    #[test]
    fn test_move_keeps_count() {
        let view = FloatView::new_in(8, allocator()).unwrap();
        let moved = view;
        assert_eq!(references(&moved), Some(1));

        let boxed = Box::new(moved);
        assert_eq!(references(&boxed), Some(1));
    }

    #[test]
    fn test_assign_releases_then_acquires() {
        let alloc = allocator();
        let source = FloatView::new_in(8, alloc).unwrap();
        let mut target = FloatView::new_in(4, alloc).unwrap();
        let old = target.data();

        target.clone_from(&source);

        assert_eq!(target.data(), source.data());
        assert_eq!(target.total_elements(), 8);
        assert_eq!(references(&source), Some(2));
        assert_eq!(
            alloc.registry().reference_count::<f32, HostBackend>(old),
            Some(0)
        );
    }

    #[test]
    fn test_self_assign_keeps_buffer() {
        let alloc = allocator();
        let view = FloatView::new_in(8, alloc).unwrap();
        let mut other = view.clone();

        // Assigning a handle of the same buffer: release then acquire nets out
        other.assign_from(&view).unwrap();
        assert_eq!(references(&view), Some(2));
    }

    #[test]
    fn test_untracked_buffer_clone_fails() {
        let registry: &'static Registry = Box::leak(Box::new(Registry::new()));
        let view = FloatView::new_in(8, RecycleAllocator::new_in(registry)).unwrap();

        let _report = unsafe { registry.clean_all() };
        assert!(view.try_clone().unwrap_err().is_usage_violation());

        // Dropping now only logs the failed release
        drop(view);
    }

    /// Registry-backed allocator whose acquires can be switched to fail
    #[derive(Clone, Copy)]
    struct FailingAcquire {
        inner: RecycleAllocator<f32>,
        fail: &'static AtomicBool,
    }

    // SAFETY: forwards to the registry allocator.
    unsafe impl ElementAllocator<f32> for FailingAcquire {
        fn allocate(&self, n: usize) -> RecycleResult<NonNull<f32>> {
            self.inner.allocate(n)
        }

        unsafe fn deallocate(&self, ptr: NonNull<f32>, n: usize) -> RecycleResult<()> {
            unsafe { self.inner.deallocate(ptr, n) }
        }
    }

    // SAFETY: forwards to the registry allocator or refuses the acquire.
    unsafe impl SharedBufferAllocator<f32> for FailingAcquire {
        fn increase_usage_counter(&self, ptr: NonNull<f32>, n: usize) -> RecycleResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RecycleError::invalid_request("acquire disabled"));
            }
            self.inner.increase_usage_counter(ptr, n)
        }
    }

    #[test]
    fn test_failed_assign_releases_nothing_on_drop() {
        let alloc = FailingAcquire {
            inner: allocator(),
            fail: Box::leak(Box::new(AtomicBool::new(false))),
        };
        let registry = alloc.inner.registry();
        type Flaky = RecycledView<SliceView<f32>, f32, FailingAcquire>;

        let source = Flaky::new_in(8, alloc).unwrap();
        let mut target = Flaky::new_in(4, alloc).unwrap();
        let old = target.data();

        alloc.fail.store(true, Ordering::SeqCst);
        assert!(target.assign_from(&source).is_err());

        // The old buffer was released, the source's was not acquired
        assert_eq!(registry.reference_count::<f32, HostBackend>(old), Some(0));
        assert_eq!(
            registry.reference_count::<f32, HostBackend>(source.data()),
            Some(1)
        );

        // A retry does not release the old buffer a second time
        assert!(target.assign_from(&source).is_err());
        assert_eq!(registry.stats::<f32, HostBackend>().unwrap().released, 1);

        drop(target);
        assert_eq!(
            registry.reference_count::<f32, HostBackend>(source.data()),
            Some(1)
        );

        // A successful assignment makes a released handle whole again
        alloc.fail.store(false, Ordering::SeqCst);
        let mut late = source.clone();
        alloc.fail.store(true, Ordering::SeqCst);
        let other = Flaky::new_in(4, alloc).unwrap();
        assert!(late.assign_from(&other).is_err());
        alloc.fail.store(false, Ordering::SeqCst);
        late.assign_from(&source).unwrap();
        assert_eq!(
            registry.reference_count::<f32, HostBackend>(source.data()),
            Some(2)
        );
    }

    #[test]
    fn test_zero_extent_view() {
        let view = FloatView::new_in(0, allocator()).unwrap();
        assert!(view.is_empty());
        assert_eq!(references(&view), Some(1));

        let copy = view.clone();
        assert_eq!(references(&view), Some(2));
        drop(copy);
        assert_eq!(references(&view), Some(1));
    }
}
