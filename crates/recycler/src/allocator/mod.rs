//! Allocator adapters over the recycling registry
//!
//! - [`ElementAllocator`] / [`SharedBufferAllocator`]: the capability generic
//!   containers consume
//! - [`RecycleAllocator`]: the adapter that forwards to a [`Registry`](crate::registry::Registry)
//! - [`RecycledBuffer`]: a fixed-length container built on any adapter

mod buffer;
mod recycle;
mod traits;

pub use buffer::RecycledBuffer;
pub use recycle::RecycleAllocator;
pub use traits::{ElementAllocator, SharedBufferAllocator};
