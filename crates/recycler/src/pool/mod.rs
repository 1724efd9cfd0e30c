//! Per-type buffer pools
//!
//! One [`TypedPool`] exists per `(element type, backend)` pair. Pools are
//! normally owned by the [`Registry`](crate::registry::Registry), which
//! serializes access to them; a standalone pool is plain `&mut` data.

mod stats;
mod typed;

pub use stats::PoolStats;
pub use typed::TypedPool;

pub(crate) use typed::ErasedPool;
