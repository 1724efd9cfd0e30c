//! Typed recycling pool
//!
//! # Safety
//!
//! `TypedPool` owns raw backend memory and tracks it by address:
//! - every record lives in exactly one of `used` (reference count >= 1) or
//!   `unused` (reference count == 0)
//! - a record's `layout` is the one its block was allocated with, so it is
//!   also the one it is returned to the backend with
//! - records are only destroyed by `clean_unused_buffers_only` (unused ones)
//!   or by `teardown` / `Drop` (all of them)
//!
//! ## Safety Contracts
//!
//! - `mark_unused`: the caller must own the reference it releases; releasing
//!   somebody else's lets the block be handed out twice
//! - `teardown`: frees blocks that may still be referenced
//! - `Send`: the pool is the only owner of its blocks, so moving it moves them

use core::alloc::Layout;
use core::any::{Any, type_name};
use core::ptr::NonNull;
use std::collections::{HashMap, VecDeque};

#[cfg(feature = "logging")]
use tracing::{debug, error, info, warn};

use super::stats::{PoolCounters, PoolStats};
use crate::backend::{Backend, BackendError};
use crate::config::RecyclerConfig;
use crate::error::{RecycleError, RecycleResult};

/// One block of backend memory tracked by a pool
#[derive(Debug)]
struct BufferRecord<T> {
    ptr: NonNull<T>,
    elements: usize,
    layout: Layout,
    references: usize,
}

/// Pool of recycled buffers of `T` allocated from backend `B`
///
/// All buffers served by one pool hold elements of the same type; requests
/// are matched by exact element count, so a pool typically settles on a
/// handful of distinct sizes (one per computation step shape).
///
/// # Example
/// ```
/// use nebula_recycler::backend::HostBackend;
/// use nebula_recycler::pool::TypedPool;
/// use nebula_recycler::RecyclerConfig;
///
/// let mut pool = TypedPool::<f64, HostBackend>::new(RecyclerConfig::production());
///
/// let first = pool.get(100, || {})?;
/// unsafe { pool.mark_unused(first, 100)? };
///
/// // The same block comes back for the same size
/// let second = pool.get(100, || {})?;
/// assert_eq!(first, second);
/// # unsafe { pool.mark_unused(second, 100)? };
/// # Ok::<(), nebula_recycler::RecycleError>(())
/// ```
pub struct TypedPool<T, B: Backend> {
    used: HashMap<NonNull<T>, BufferRecord<T>>,
    // most recently released first
    unused: VecDeque<BufferRecord<T>>,
    counters: PoolCounters,
    backend: B,
    config: RecyclerConfig,
}

// SAFETY: TypedPool is Send if T is Send.
// - the pool exclusively owns every block it tracks; no other handle frees them
// - NonNull<T> keys are addresses, never dereferenced by the pool except for
//   debug fill patterns written while the pool is exclusively borrowed
// - B: Backend is Send + Sync by trait bound
unsafe impl<T: Send, B: Backend> Send for TypedPool<T, B> {}

impl<T, B: Backend> TypedPool<T, B> {
    /// Create an empty pool
    pub fn new(config: RecyclerConfig) -> Self {
        Self {
            used: HashMap::new(),
            unused: VecDeque::new(),
            counters: PoolCounters::default(),
            backend: B::default(),
            config,
        }
    }

    /// Hand out a buffer of exactly `elements` values of `T`
    ///
    /// Recycles the most recently released unused buffer of that size if
    /// there is one, and allocates from the backend otherwise. When the
    /// backend is out of memory, `reclaim_others` is called to free the
    /// unused buffers of every other pool, this pool's own unused buffers
    /// are freed too, and the allocation is retried exactly once.
    ///
    /// The returned memory is uninitialized on creation; recycled buffers
    /// keep whatever their previous owner left in them.
    pub fn get<F>(&mut self, elements: usize, reclaim_others: F) -> RecycleResult<NonNull<T>>
    where
        F: FnOnce(),
    {
        let layout = Self::layout_for(elements)?;
        self.counters.record_request();

        if let Some(position) = self.unused.iter().position(|r| r.elements == elements)
            && let Some(mut record) = self.unused.remove(position)
        {
            record.references = 1;
            let ptr = record.ptr;
            self.used.insert(ptr, record);
            self.counters.record_recycle();
            return Ok(ptr);
        }

        match self.backend.allocate(layout) {
            Ok(raw) => Ok(self.track_fresh(raw, elements, layout)),
            Err(BackendError::OutOfMemory) => {
                #[cfg(feature = "logging")]
                warn!(
                    type_name = type_name::<T>(),
                    backend = B::NAME,
                    elements,
                    "backend out of memory, reclaiming unused buffers in every pool"
                );

                reclaim_others();
                self.clean_unused_buffers_only();

                match self.backend.allocate(layout) {
                    Ok(raw) => {
                        self.counters.record_oom_recovery();
                        Ok(self.track_fresh(raw, elements, layout))
                    }
                    Err(BackendError::OutOfMemory) => {
                        #[cfg(feature = "logging")]
                        error!(
                            type_name = type_name::<T>(),
                            backend = B::NAME,
                            elements,
                            "allocation failed again after reclaim"
                        );

                        Err(RecycleError::out_of_memory::<T>(B::NAME, elements))
                    }
                    Err(BackendError::Failed(reason)) => {
                        Err(RecycleError::backend(B::NAME, &reason))
                    }
                }
            }
            Err(BackendError::Failed(reason)) => Err(RecycleError::backend(B::NAME, &reason)),
        }
    }

    /// Release one reference to a buffer handed out by [`get`](Self::get)
    ///
    /// When the last reference goes, the buffer moves to the front of the
    /// unused list and becomes the first candidate for recycling.
    ///
    /// # Safety
    ///
    /// The caller must own the reference being released. After the last
    /// reference is gone, the memory may be handed to another caller.
    pub unsafe fn mark_unused(&mut self, ptr: NonNull<T>, elements: usize) -> RecycleResult<()> {
        let record = self.used_record(ptr, elements)?;
        record.references -= 1;
        let now_unused = record.references == 0;
        self.counters.record_release();

        if now_unused && let Some(record) = self.used.remove(&ptr) {
            if let Some(pattern) = self.config.release_pattern {
                // SAFETY: the block is valid for layout.size() bytes and nobody
                // holds a reference to it any more.
                unsafe {
                    record
                        .ptr
                        .cast::<u8>()
                        .as_ptr()
                        .write_bytes(pattern, record.layout.size());
                };
            }
            self.unused.push_front(record);
        }

        Ok(())
    }

    /// Register one more owner of a live buffer
    pub fn increase_usage_counter(&mut self, ptr: NonNull<T>, elements: usize) -> RecycleResult<()> {
        let record = self.used_record(ptr, elements)?;
        record.references += 1;
        Ok(())
    }

    /// Return every unused buffer to the backend
    ///
    /// Buffers in use are untouched, so this is always safe to call.
    /// Returns the number of buffers freed.
    pub fn clean_unused_buffers_only(&mut self) -> usize {
        let freed = self.unused.len();
        for record in self.unused.drain(..) {
            // SAFETY: unused records have no owners; the block and layout came
            // from this backend.
            unsafe { self.backend.deallocate(record.ptr.cast(), record.layout) };
        }

        #[cfg(feature = "logging")]
        if freed > 0 {
            debug!(
                type_name = type_name::<T>(),
                backend = B::NAME,
                freed,
                "returned unused buffers to the backend"
            );
        }

        freed
    }

    /// Return every buffer, used or not, to the backend
    ///
    /// Buffers still in use at this point mean a release was missed upstream;
    /// they are reported (log and `used_buffers` in the returned stats) and
    /// freed anyway.
    ///
    /// # Safety
    ///
    /// No buffer handed out by this pool may be accessed after this call.
    pub unsafe fn teardown(&mut self) -> PoolStats {
        let stats = self.stats();

        #[cfg(feature = "logging")]
        {
            if self.config.report_on_teardown {
                info!(
                    type_name = stats.type_name,
                    backend = stats.backend,
                    oom_recoveries = stats.oom_recoveries,
                    requests = stats.requests,
                    recycled = stats.recycled,
                    created = stats.created,
                    released = stats.released,
                    cleaned = stats.total_buffers(),
                    still_used = stats.used_buffers,
                    recycle_rate = format_args!("{:.1}%", stats.recycle_rate()),
                    "buffer pool teardown"
                );
            }
            if stats.used_buffers > 0 {
                warn!(
                    type_name = stats.type_name,
                    backend = stats.backend,
                    still_used = stats.used_buffers,
                    "buffers still marked as used at teardown; a release was missed upstream"
                );
            }
        }

        // SAFETY: caller guarantees no handed-out buffer is used afterwards.
        unsafe { self.release_all() };
        stats
    }

    /// Snapshot of the counters and current occupancy
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::new(type_name::<T>(), B::NAME, self.counters);
        stats.used_buffers = self.used.len();
        stats.unused_buffers = self.unused.len();
        stats.unused_elements = self.unused.iter().map(|r| r.elements).sum();
        stats
    }

    /// Current reference count of a tracked buffer
    ///
    /// `Some(0)` for an unused buffer, `None` for an address the pool does not track.
    pub fn reference_count(&self, ptr: NonNull<T>) -> Option<usize> {
        self.used.get(&ptr).map(|r| r.references).or_else(|| {
            self.unused
                .iter()
                .any(|r| r.ptr == ptr)
                .then_some(0)
        })
    }

    /// Replace the configuration used for fill patterns and teardown reporting
    pub fn set_config(&mut self, config: RecyclerConfig) {
        self.config = config;
    }

    /// Check whether the pool tracks no buffers at all
    pub fn is_empty(&self) -> bool {
        self.used.is_empty() && self.unused.is_empty()
    }

    /// Backend layout for `elements` values of `T`
    ///
    /// Empty buffers (no elements, or a zero-sized `T`) still take one byte so
    /// that every buffer has its own address to be tracked and recycled by.
    fn layout_for(elements: usize) -> RecycleResult<Layout> {
        let overflow = |_| RecycleError::invalid_request("buffer size overflows isize");
        let layout = Layout::array::<T>(elements).map_err(overflow)?;
        Layout::from_size_align(layout.size().max(1), layout.align()).map_err(overflow)
    }

    fn used_record(
        &mut self,
        ptr: NonNull<T>,
        elements: usize,
    ) -> RecycleResult<&mut BufferRecord<T>> {
        let Some(record) = self.used.get_mut(&ptr) else {
            return Err(RecycleError::unknown_buffer::<T>(
                B::NAME,
                ptr.as_ptr() as usize,
            ));
        };
        if record.elements != elements {
            return Err(RecycleError::size_mismatch(
                ptr.as_ptr() as usize,
                record.elements,
                elements,
            ));
        }
        Ok(record)
    }

    fn track_fresh(&mut self, raw: NonNull<u8>, elements: usize, layout: Layout) -> NonNull<T> {
        if let Some(pattern) = self.config.alloc_pattern {
            // SAFETY: the backend just returned a block valid for layout.size() bytes.
            unsafe { raw.as_ptr().write_bytes(pattern, layout.size()) };
        }

        let ptr = raw.cast::<T>();
        self.used.insert(
            ptr,
            BufferRecord {
                ptr,
                elements,
                layout,
                references: 1,
            },
        );
        self.counters.record_creation();
        ptr
    }

    /// # Safety
    ///
    /// No tracked block may be accessed after this call.
    unsafe fn release_all(&mut self) {
        let records = self.unused.drain(..).chain(self.used.drain().map(|(_, r)| r));
        for record in records {
            // SAFETY: every record was allocated by this backend with its layout.
            unsafe { self.backend.deallocate(record.ptr.cast(), record.layout) };
        }
    }
}

impl<T, B: Backend> Drop for TypedPool<T, B> {
    fn drop(&mut self) {
        // SAFETY: the pool is going away; nothing can reach its blocks through it.
        unsafe { self.release_all() };
    }
}

impl<T, B: Backend> core::fmt::Debug for TypedPool<T, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TypedPool")
            .field("type_name", &type_name::<T>())
            .field("backend", &B::NAME)
            .field("used", &self.used.len())
            .field("unused", &self.unused.len())
            .field("counters", &self.counters)
            .finish()
    }
}

// ============================================================================
// Type-erased view used by the registry
// ============================================================================

/// The two lifecycle hooks the registry keeps per pool, plus downcasting
pub(crate) trait ErasedPool: Send {
    /// Partial reclaim hook
    fn clean_unused_buffers_only(&mut self) -> usize;

    /// Full teardown hook
    ///
    /// # Safety
    ///
    /// Same contract as [`TypedPool::teardown`].
    unsafe fn teardown(&mut self) -> PoolStats;

    fn stats(&self) -> PoolStats;

    fn set_config(&mut self, config: RecyclerConfig);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Send + 'static, B: Backend> ErasedPool for TypedPool<T, B> {
    fn clean_unused_buffers_only(&mut self) -> usize {
        Self::clean_unused_buffers_only(self)
    }

    unsafe fn teardown(&mut self) -> PoolStats {
        // SAFETY: contract forwarded from the caller.
        unsafe { Self::teardown(self) }
    }

    fn stats(&self) -> PoolStats {
        Self::stats(self)
    }

    fn set_config(&mut self, config: RecyclerConfig) {
        Self::set_config(self, config);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
