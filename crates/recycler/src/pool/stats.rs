//! Statistics tracking for typed pools
//!
//! Counters are diagnostics only. They are bumped under the registry lock
//! and never feed back into a recycling decision.

/// Monotonic counters of one pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PoolCounters {
    pub(crate) requests: u64,
    pub(crate) recycled: u64,
    pub(crate) created: u64,
    pub(crate) released: u64,
    pub(crate) oom_recoveries: u64,
}

impl PoolCounters {
    /// Record a buffer request
    pub(crate) fn record_request(&mut self) {
        self.requests += 1;
    }

    /// Record a request served from the unused list
    pub(crate) fn record_recycle(&mut self) {
        self.recycled += 1;
    }

    /// Record a request served by a fresh backend allocation
    pub(crate) fn record_creation(&mut self) {
        self.created += 1;
    }

    /// Record a released reference
    pub(crate) fn record_release(&mut self) {
        self.released += 1;
    }

    /// Record a creation that only succeeded after a registry-wide reclaim
    pub(crate) fn record_oom_recovery(&mut self) {
        self.oom_recoveries += 1;
    }
}

/// Point-in-time view of one pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Element type served by the pool
    pub type_name: &'static str,
    /// Backend name
    pub backend: &'static str,

    /// Buffers requested from the pool
    pub requests: u64,
    /// Requests served by recycling an unused buffer
    pub recycled: u64,
    /// Requests that created a new buffer
    pub created: u64,
    /// References released
    pub released: u64,
    /// Creations that needed a registry-wide reclaim first
    pub oom_recoveries: u64,

    /// Buffers with at least one reference
    pub used_buffers: usize,
    /// Buffers kept for recycling
    pub unused_buffers: usize,
    /// Elements held in unused buffers
    pub unused_elements: usize,
}

impl PoolStats {
    pub(crate) fn new(
        type_name: &'static str,
        backend: &'static str,
        counters: PoolCounters,
    ) -> Self {
        Self {
            type_name,
            backend,
            requests: counters.requests,
            recycled: counters.recycled,
            created: counters.created,
            released: counters.released,
            oom_recoveries: counters.oom_recoveries,
            used_buffers: 0,
            unused_buffers: 0,
            unused_elements: 0,
        }
    }

    /// Share of requests served by recycling, in percent
    pub fn recycle_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.recycled as f64 / self.requests as f64 * 100.0
        }
    }

    /// Total buffers tracked by the pool
    pub fn total_buffers(&self) -> usize {
        self.used_buffers + self.unused_buffers
    }
}
