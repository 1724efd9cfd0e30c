//! Buffer registry
//!
//! The registry owns one [`TypedPool`] per `(element type, backend)` pair and
//! serializes every operation on a single mutex. Pools are created on first
//! reference and kept in registration order, which is also the order used for
//! registry-wide reclaim and teardown.
//!
//! The process-wide instance ([`Registry::global`]) is what the allocator
//! adapters use by default. Tests and embedders can build private instances
//! with [`Registry::new`].

use core::any::TypeId;
#[cfg(feature = "logging")]
use core::any::type_name;
use core::ptr::NonNull;
use std::collections::HashMap;
use std::sync::Once;

use parking_lot::{Mutex, const_mutex};

#[cfg(feature = "logging")]
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::RecyclerConfig;
use crate::error::{RecycleError, RecycleResult};
use crate::pool::{ErasedPool, PoolStats, TypedPool};

/// Pool key: `(TypeId of element type, TypeId of backend)`
type PoolKey = (TypeId, TypeId);

/// The process-wide registry
static GLOBAL: Registry = Registry::new();

/// Installs the process-exit teardown hook once
static EXIT_GUARD: Once = Once::new();

// ============================================================================
// Teardown Report
// ============================================================================

/// Per-pool statistics captured by a full teardown, in registration order
#[must_use]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub pools: Vec<PoolStats>,
}

impl TeardownReport {
    /// Buffers that were still referenced when they were freed
    pub fn outstanding(&self) -> usize {
        self.pools.iter().map(|p| p.used_buffers).sum()
    }

    /// Every buffer had been released before teardown
    pub fn is_clean(&self) -> bool {
        self.outstanding() == 0
    }

    /// Buffers returned to their backends by the teardown
    pub fn freed_buffers(&self) -> usize {
        self.pools.iter().map(PoolStats::total_buffers).sum()
    }

    /// Nothing had been allocated, so nothing was torn down
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

// ============================================================================
// Registry State
// ============================================================================

/// Pools of a live registry
#[derive(Default)]
struct RegistryState {
    // registration order; each entry carries both the partial-reclaim and
    // the full-teardown hook of its pool
    pools: Vec<Box<dyn ErasedPool>>,
    index: HashMap<PoolKey, usize>,
}

impl RegistryState {
    fn key<T: 'static, B: Backend>() -> PoolKey {
        (TypeId::of::<T>(), TypeId::of::<B>())
    }

    /// Index of the pool for `(T, B)`, creating it on first reference
    fn pool_index<T: Send + 'static, B: Backend>(&mut self, config: RecyclerConfig) -> usize {
        let key = Self::key::<T, B>();
        if let Some(&index) = self.index.get(&key) {
            return index;
        }

        let index = self.pools.len();
        self.pools.push(Box::new(TypedPool::<T, B>::new(config)));
        self.index.insert(key, index);

        #[cfg(feature = "logging")]
        debug!(
            type_name = type_name::<T>(),
            backend = B::NAME,
            pools = self.pools.len(),
            "registered buffer pool"
        );

        index
    }

    fn find<T: Send + 'static, B: Backend>(&self) -> Option<&TypedPool<T, B>> {
        let index = *self.index.get(&Self::key::<T, B>())?;
        self.pools[index].as_any().downcast_ref()
    }

    fn find_mut<T: Send + 'static, B: Backend>(&mut self) -> Option<&mut TypedPool<T, B>> {
        let index = *self.index.get(&Self::key::<T, B>())?;
        self.pools[index].as_any_mut().downcast_mut()
    }

    fn get<T: Send + 'static, B: Backend>(
        &mut self,
        elements: usize,
        config: RecyclerConfig,
    ) -> RecycleResult<NonNull<T>> {
        let index = self.pool_index::<T, B>(config);

        // Split the pools so the target can reclaim every other pool while
        // it is itself borrowed; the registry lock is already held.
        let (before, rest) = self.pools.split_at_mut(index);
        let (target, after) = rest.split_at_mut(1);
        let pool = downcast_mut::<T, B>(&mut *target[0]);

        pool.get(elements, || {
            for other in before.iter_mut().chain(after.iter_mut()) {
                other.clean_unused_buffers_only();
            }
        })
    }

    fn clean_unused_buffers(&mut self) -> usize {
        self.pools
            .iter_mut()
            .map(|pool| pool.clean_unused_buffers_only())
            .sum()
    }

    /// # Safety
    ///
    /// No buffer handed out by these pools may be accessed afterwards.
    unsafe fn teardown(mut self) -> TeardownReport {
        let pools = self
            .pools
            .iter_mut()
            // SAFETY: forwarded from the caller.
            .map(|pool| unsafe { pool.teardown() })
            .collect();
        TeardownReport { pools }
    }
}

fn downcast_mut<T: Send + 'static, B: Backend>(pool: &mut dyn ErasedPool) -> &mut TypedPool<T, B> {
    pool.as_any_mut()
        .downcast_mut()
        .expect("pool is stored under the TypeId pair of its own type")
}

// ============================================================================
// Registry
// ============================================================================

struct Inner {
    config: RecyclerConfig,
    state: Option<RegistryState>,
}

/// Registry of recycling pools, one per `(element type, backend)` pair
///
/// Built lazily: no pool exists until the first operation that names one.
/// [`clean_all`](Self::clean_all) tears everything down and leaves the
/// registry ready to rebuild itself on the next call.
///
/// # Examples
///
/// ```
/// use nebula_recycler::backend::HostBackend;
/// use nebula_recycler::Registry;
///
/// let registry = Registry::new();
///
/// let ptr = registry.get::<f32, HostBackend>(100)?;
/// unsafe { registry.mark_unused::<f32, HostBackend>(ptr, 100)? };
///
/// assert_eq!(registry.get::<f32, HostBackend>(100)?, ptr);
///
/// let stats = registry.stats::<f32, HostBackend>().unwrap();
/// assert_eq!((stats.created, stats.recycled), (1, 1));
/// # unsafe { registry.mark_unused::<f32, HostBackend>(ptr, 100)? };
/// # Ok::<(), nebula_recycler::RecycleError>(())
/// ```
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry with the build-dependent default config
    #[must_use]
    pub const fn new() -> Self {
        Self::with_config(RecyclerConfig::new())
    }

    /// Create an empty registry with an explicit config
    #[must_use]
    pub const fn with_config(config: RecyclerConfig) -> Self {
        Self {
            inner: const_mutex(Inner {
                config,
                state: None,
            }),
        }
    }

    /// The process-wide registry
    ///
    /// Its pools are torn down automatically at process exit unless
    /// [`clean_all`](Self::clean_all) already did so.
    #[inline]
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Check whether this is the process-wide registry
    #[inline]
    pub fn is_global(&self) -> bool {
        core::ptr::eq(self, &GLOBAL)
    }

    /// Run `f` on the live state, building it first if needed
    fn with_state<R>(&self, f: impl FnOnce(&mut RegistryState, RecyclerConfig) -> R) -> R {
        let mut inner = self.inner.lock();
        let Inner { config, state } = &mut *inner;

        if state.is_none() {
            if self.is_global() {
                install_exit_guard();
            }

            #[cfg(feature = "logging")]
            debug!(global = self.is_global(), "buffer registry created");
        }

        f(state.get_or_insert_with(RegistryState::default), *config)
    }

    /// Run `f` on the `(T, B)` pool that should track `ptr`
    ///
    /// Neither the registry nor the pool is built here: a pool that does not
    /// exist cannot own the buffer.
    fn with_tracking_pool<T: Send + 'static, B: Backend>(
        &self,
        ptr: NonNull<T>,
        f: impl FnOnce(&mut TypedPool<T, B>) -> RecycleResult<()>,
    ) -> RecycleResult<()> {
        let mut inner = self.inner.lock();
        match inner.state.as_mut().and_then(|state| state.find_mut::<T, B>()) {
            Some(pool) => f(pool),
            None => Err(RecycleError::unknown_buffer::<T>(
                B::NAME,
                ptr.as_ptr() as usize,
            )),
        }
    }

    // ------------------------------------------------------------------------
    // Buffer operations
    // ------------------------------------------------------------------------

    /// Get a buffer of `elements` values of `T` from the `(T, B)` pool
    ///
    /// Recycles an unused buffer of exactly that size when there is one.
    /// Otherwise allocates from `B`; if `B` is out of memory, every pool's
    /// unused buffers are freed and the allocation is retried once.
    ///
    /// The contents of the returned memory are unspecified.
    pub fn get<T: Send + 'static, B: Backend>(&self, elements: usize) -> RecycleResult<NonNull<T>> {
        self.with_state(|state, config| state.get::<T, B>(elements, config))
    }

    /// Release one reference to a buffer obtained from [`get`](Self::get)
    ///
    /// # Errors
    ///
    /// `UnknownBuffer` if `ptr` is not a live buffer of the `(T, B)` pool,
    /// `SizeMismatch` if `elements` differs from its recorded size.
    ///
    /// # Safety
    ///
    /// The caller must own the reference it releases. Once the last reference
    /// is gone the buffer may be handed to another caller.
    pub unsafe fn mark_unused<T: Send + 'static, B: Backend>(
        &self,
        ptr: NonNull<T>,
        elements: usize,
    ) -> RecycleResult<()> {
        self.with_tracking_pool::<T, B>(ptr, |pool| {
            // SAFETY: forwarded from the caller.
            unsafe { pool.mark_unused(ptr, elements) }
        })
    }

    /// Register an additional owner of a live buffer
    ///
    /// # Errors
    ///
    /// Same as [`mark_unused`](Self::mark_unused).
    pub fn increase_usage_counter<T: Send + 'static, B: Backend>(
        &self,
        ptr: NonNull<T>,
        elements: usize,
    ) -> RecycleResult<()> {
        self.with_tracking_pool::<T, B>(ptr, |pool| pool.increase_usage_counter(ptr, elements))
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Free the unused buffers of every pool
    ///
    /// Buffers in use are untouched. A no-op when nothing is unused or the
    /// registry was never built. Returns the number of buffers freed.
    pub fn clean_unused_buffers(&self) -> usize {
        let mut inner = self.inner.lock();
        inner
            .state
            .as_mut()
            .map_or(0, RegistryState::clean_unused_buffers)
    }

    /// Tear down every pool, freeing all buffers, used or not
    ///
    /// The registry is empty afterwards and rebuilds itself on the next call.
    /// A no-op returning an empty report when nothing was ever allocated.
    ///
    /// # Safety
    ///
    /// No buffer obtained from this registry before the call may be
    /// accessed, released or retained afterwards. That includes buffers held
    /// by [`RecycledBuffer`](crate::allocator::RecycledBuffer) and
    /// [`RecycledView`](crate::view::RecycledView) handles: they must all be
    /// dropped or leaked before this runs.
    pub unsafe fn clean_all(&self) -> TeardownReport {
        let mut inner = self.inner.lock();
        let Some(state) = inner.state.take() else {
            return TeardownReport::default();
        };

        #[cfg(feature = "logging")]
        info!(pools = state.pools.len(), "buffer recycler cleanup started");

        // SAFETY: forwarded from the caller.
        let report = unsafe { state.teardown() };

        #[cfg(feature = "logging")]
        {
            if report.is_clean() {
                info!(
                    freed = report.freed_buffers(),
                    "buffer recycler cleanup finished"
                );
            } else {
                warn!(
                    freed = report.freed_buffers(),
                    outstanding = report.outstanding(),
                    "buffer recycler cleanup finished with buffers still in use"
                );
            }
        }

        report
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Snapshot of the `(T, B)` pool, `None` if it does not exist
    pub fn stats<T: Send + 'static, B: Backend>(&self) -> Option<PoolStats> {
        let inner = self.inner.lock();
        inner.state.as_ref()?.find::<T, B>().map(TypedPool::stats)
    }

    /// Snapshots of every pool, in registration order
    pub fn snapshot(&self) -> Vec<PoolStats> {
        let inner = self.inner.lock();
        inner
            .state
            .as_ref()
            .map(|state| state.pools.iter().map(|pool| pool.stats()).collect())
            .unwrap_or_default()
    }

    /// Reference count of a buffer of the `(T, B)` pool
    ///
    /// `Some(0)` for an unused buffer, `None` for an untracked address.
    pub fn reference_count<T: Send + 'static, B: Backend>(&self, ptr: NonNull<T>) -> Option<usize> {
        let inner = self.inner.lock();
        inner.state.as_ref()?.find::<T, B>()?.reference_count(ptr)
    }

    /// Number of pools created so far
    pub fn pool_count(&self) -> usize {
        self.inner
            .lock()
            .state
            .as_ref()
            .map_or(0, |state| state.pools.len())
    }

    /// Check whether the registry has been built and not torn down since
    pub fn is_live(&self) -> bool {
        self.inner.lock().state.is_some()
    }

    /// Current configuration
    pub fn config(&self) -> RecyclerConfig {
        self.inner.lock().config
    }

    /// Replace the configuration of the registry and every existing pool
    pub fn set_config(&self, config: RecyclerConfig) {
        let mut inner = self.inner.lock();
        inner.config = config;
        if let Some(state) = inner.state.as_mut() {
            for pool in &mut state.pools {
                pool.set_config(config);
            }
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(state) = inner.state.take() {
            // SAFETY: adapters and handles borrow the registry for 'static, so
            // a registry being dropped has none left; raw pointers from `get`
            // are the caller's responsibility.
            let _report = unsafe { state.teardown() };
        }
    }
}

impl core::fmt::Debug for Registry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Registry")
            .field("global", &self.is_global())
            .field("config", &inner.config)
            .field(
                "pools",
                &inner.state.as_ref().map_or(0, |state| state.pools.len()),
            )
            .finish()
    }
}

// ============================================================================
// Process-exit teardown
// ============================================================================

fn install_exit_guard() {
    EXIT_GUARD.call_once(|| {
        // SAFETY: registering a plain `extern "C" fn()` with the C runtime.
        let status = unsafe { libc::atexit(teardown_global_at_exit) };

        #[cfg(feature = "logging")]
        if status != 0 {
            warn!(status, "could not register process-exit teardown for the buffer registry");
        }
        #[cfg(not(feature = "logging"))]
        let _ = status;
    });
}

extern "C" fn teardown_global_at_exit() {
    // A no-op if `clean_all` already ran and nothing was allocated since.
    // SAFETY: `main` has returned, so no handle is used again.
    let _report = unsafe { GLOBAL.clean_all() };
}
