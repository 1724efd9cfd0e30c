//! # nebula-recycler
//!
//! Process-wide recycling buffer pools for allocation-heavy numerical code.
//!
//! Computations that request the same buffer shapes over and over (solver
//! steps, stencil sweeps, staging for device transfers) pay for a fresh
//! allocation every time. This crate keeps released buffers in per-type pools
//! and hands them out again for requests of exactly the same size:
//! - one pool per `(element type, backend)` pair, created on first use
//! - per-buffer reference counts, so several views can share one buffer
//! - under memory pressure, every pool's idle buffers are freed and the
//!   failed allocation is retried once
//!
//! ## Quick Start
//!
//! ```rust
//! use nebula_recycler::prelude::*;
//!
//! // Owned, initialized buffer; its storage goes back to the pool on drop
//! let mut samples = RecycledBuffer::<f32>::from_elem(4096, 0.0)?;
//! samples[0] = 1.0;
//! drop(samples);
//!
//! // Shared view: clones share the buffer, the last drop releases it
//! let view = RecycledView::<SliceView<f64>, f64>::filled(128, 0.5)?;
//! let shared = view.clone();
//! assert_eq!(view.data(), shared.data());
//! # Ok::<(), RecycleError>(())
//! ```
//!
//! ## Features
//!
//! - `logging` (default): structured diagnostics through `tracing`
//!
//! ## Architecture
//!
//! - [`backend`]: raw memory providers ([`HostBackend`](backend::HostBackend))
//! - [`pool`]: the per-type pool and its statistics
//! - [`registry`]: the mutex-guarded collection of pools and its lifecycle
//! - [`allocator`]: the allocator adapter and [`RecycledBuffer`](allocator::RecycledBuffer)
//! - [`view`]: reference-counted views over recycled buffers
//! - Standalone error handling via [`error`] module

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(clippy::all)]
#![warn(clippy::perf)]
#![warn(clippy::pedantic)]
#![warn(rust_2018_idioms)]
// Pools, the registry and the adapters manage raw backend memory
#![allow(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// Precision loss in u64 -> f64 casts is acceptable for stats
#![allow(clippy::cast_precision_loss)]
// #[must_use] on fns returning Self/Result documents intent even if type is already must_use
#![allow(clippy::double_must_use)]
#![allow(clippy::return_self_not_must_use)]

// Error types
pub mod error;

// Core modules
pub mod allocator;
pub mod backend;
pub mod config;
pub mod pool;
pub mod registry;
pub mod view;

pub use crate::config::RecyclerConfig;
pub use crate::error::{RecycleError, RecycleResult, Result};
pub use crate::registry::{Registry, TeardownReport};

// Public API exports
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::config::RecyclerConfig;
    pub use crate::error::{RecycleError, RecycleResult};

    pub use crate::allocator::{
        ElementAllocator, RecycleAllocator, RecycledBuffer, SharedBufferAllocator,
    };
    pub use crate::backend::{Backend, HostBackend};
    pub use crate::pool::PoolStats;
    pub use crate::registry::{Registry, TeardownReport};
    pub use crate::view::{BufferView, RecycledView, SliceView};
}

#[cfg(feature = "logging")]
use tracing::debug;

/// Free the idle buffers of every pool in the process-wide registry
///
/// Buffers in use are untouched. Returns the number of buffers freed.
pub fn clean_unused_buffers() -> usize {
    let freed = Registry::global().clean_unused_buffers();

    #[cfg(feature = "logging")]
    debug!(freed, "released idle recycled buffers");

    freed
}

/// Tear down the process-wide registry, freeing every buffer
///
/// Meant for an explicit reset point, e.g. right before the runtime that owns
/// a device backend shuts down. The registry rebuilds itself on next use;
/// without this call it is torn down at process exit.
///
/// # Safety
///
/// See [`Registry::clean_all`]: no buffer, adapter allocation or handle
/// obtained from the process-wide registry may be used afterwards.
pub unsafe fn clean_all() -> TeardownReport {
    // SAFETY: forwarded from the caller.
    unsafe { Registry::global().clean_all() }
}
