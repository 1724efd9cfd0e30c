//! Raw memory backends
//!
//! A backend is the leaf of the recycler: it hands out raw memory and takes
//! it back, nothing more. Pools never talk to the system allocator (or to
//! pinned / device memory APIs) directly; they go through a [`Backend`]
//! chosen at the type level, so each `(element type, backend)` pair gets its
//! own pool.
//!
//! Only the plain heap backend ships with this crate. Pinned staging memory
//! or accelerator-resident memory plug in by implementing [`Backend`].

use core::alloc::Layout;
use core::ptr::NonNull;
use std::alloc::{GlobalAlloc, System};

use thiserror::Error;

/// Failure reported by a backend allocation
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend has no memory left for the request; the pool may reclaim and retry
    #[error("out of memory")]
    OutOfMemory,

    /// Any other failure; never retried
    #[error("{0}")]
    Failed(String),
}

/// Raw memory provider behind a pool
///
/// Backends are type-level descriptors: pools build their backend with
/// `Default` and key themselves by its `TypeId`, so two backend types are
/// always two separate sets of pools.
///
/// # Safety
///
/// Implementors must ensure that:
/// - a successful `allocate` returns memory valid for `layout.size()` bytes,
///   aligned to `layout.align()`, and not aliased by any other live allocation
/// - `deallocate` accepts exactly the pointer/layout pairs previously issued
///   by `allocate` on any instance of the same backend type
pub unsafe trait Backend: Default + Send + Sync + 'static {
    /// Short name used in diagnostics and errors
    const NAME: &'static str;

    /// Allocate a block for `layout`
    ///
    /// Pools only ever request non-zero sizes.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, BackendError>;

    /// Return a block to the backend
    ///
    /// # Safety
    ///
    /// - `ptr` must have been returned by `allocate` with the same `layout`
    /// - `ptr` must not be used after this call
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Plain heap memory from the system allocator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostBackend;

// SAFETY: `System` upholds the `GlobalAlloc` contract for non-zero layouts,
// which is the only kind pools request, and null results are mapped to errors.
unsafe impl Backend for HostBackend {
    const NAME: &'static str = "host";

    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, BackendError> {
        if layout.size() == 0 {
            return Err(BackendError::Failed(
                "zero-sized blocks are not served".to_string(),
            ));
        }

        // SAFETY: layout has non-zero size (checked above).
        let ptr = unsafe { System.alloc(layout) };
        NonNull::new(ptr).ok_or(BackendError::OutOfMemory)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller guarantees ptr came from `allocate` with this layout.
        unsafe { System.dealloc(ptr.as_ptr(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_round_trip() {
        let backend = HostBackend;
        let layout = Layout::array::<u64>(16).unwrap();

        let ptr = backend.allocate(layout).unwrap();
        unsafe {
            ptr.as_ptr().write_bytes(0x42, layout.size());
            assert_eq!(*ptr.as_ptr(), 0x42);
            backend.deallocate(ptr, layout);
        }
    }

    #[test]
    fn test_host_rejects_zero_size() {
        let layout = Layout::from_size_align(0, 8).unwrap();
        assert!(matches!(
            HostBackend.allocate(layout),
            Err(BackendError::Failed(_))
        ));
    }

    #[test]
    fn test_host_alignment() {
        let layout = Layout::from_size_align(256, 64).unwrap();
        let ptr = HostBackend.allocate(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        unsafe { HostBackend.deallocate(ptr, layout) };
    }

    #[test]
    fn test_thread_safety_markers() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<HostBackend>();
        assert_sync::<HostBackend>();
    }
}
