//! Standalone error types for nebula-recycler
//!
//! Uses thiserror for clean, idiomatic Rust error definitions.
//!
//! Two families of failures reach callers:
//! - backend exhaustion, returned only after the registry-wide reclaim and
//!   its single retry have both been spent
//! - usage-contract violations (unknown pointer, element-count mismatch),
//!   which are never retried
//!
//! Buffers still in use at teardown are not an error; they are reported
//! through logging and [`TeardownReport`](crate::registry::TeardownReport).

use thiserror::Error;

#[cfg(feature = "logging")]
use tracing::error;

// ============================================================================
// Main Error Type
// ============================================================================

/// Errors raised by pools, the registry and the allocator adapters
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecycleError {
    // --- Backend Errors ---
    #[error(
        "Out of memory: {elements} x {type_name} ({bytes} bytes) from backend {backend}"
    )]
    OutOfMemory {
        type_name: &'static str,
        backend: &'static str,
        elements: usize,
        bytes: usize,
    },

    #[error("Backend {backend} failed: {reason}")]
    Backend { backend: &'static str, reason: String },

    // --- Usage-Contract Violations ---
    #[error("Buffer {address:#x} is not in use in the {type_name}/{backend} pool")]
    UnknownBuffer {
        type_name: &'static str,
        backend: &'static str,
        address: usize,
    },

    #[error(
        "Buffer {address:#x} holds {recorded} elements but the call named {requested}"
    )]
    SizeMismatch {
        address: usize,
        recorded: usize,
        requested: usize,
    },

    // --- Request Errors ---
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl RecycleError {
    /// Check if the error is backend exhaustion
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// Check if the error reports caller misuse
    #[must_use]
    pub fn is_usage_violation(&self) -> bool {
        matches!(self, Self::UnknownBuffer { .. } | Self::SizeMismatch { .. })
    }

    /// Get error code for categorization
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutOfMemory { .. } => "RECYCLE:BACKEND:OOM",
            Self::Backend { .. } => "RECYCLE:BACKEND:FAILED",
            Self::UnknownBuffer { .. } => "RECYCLE:USAGE:UNKNOWN_BUFFER",
            Self::SizeMismatch { .. } => "RECYCLE:USAGE:SIZE_MISMATCH",
            Self::InvalidRequest { .. } => "RECYCLE:REQUEST:INVALID",
        }
    }

    // ============================================================================
    // Convenience Constructors
    // ============================================================================

    /// Create an out of memory error for `elements` values of `T`
    pub fn out_of_memory<T>(backend: &'static str, elements: usize) -> Self {
        Self::OutOfMemory {
            type_name: core::any::type_name::<T>(),
            backend,
            elements,
            bytes: elements.saturating_mul(core::mem::size_of::<T>()),
        }
    }

    /// Create a backend failure error
    pub fn backend(backend: &'static str, reason: &str) -> Self {
        Self::Backend {
            backend,
            reason: reason.to_string(),
        }
    }

    /// Create an unknown buffer error
    pub fn unknown_buffer<T>(backend: &'static str, address: usize) -> Self {
        #[cfg(feature = "logging")]
        error!(
            address = format_args!("{address:#x}"),
            type_name = core::any::type_name::<T>(),
            backend,
            "release or retain of a buffer the pool does not track"
        );

        Self::UnknownBuffer {
            type_name: core::any::type_name::<T>(),
            backend,
            address,
        }
    }

    /// Create an element-count mismatch error
    pub fn size_mismatch(address: usize, recorded: usize, requested: usize) -> Self {
        #[cfg(feature = "logging")]
        error!(
            address = format_args!("{address:#x}"),
            recorded, requested, "element count disagrees with the pool record"
        );

        Self::SizeMismatch {
            address,
            recorded,
            requested,
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(reason: &str) -> Self {
        Self::InvalidRequest {
            reason: reason.to_string(),
        }
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Result type for recycler operations
pub type RecycleResult<T> = core::result::Result<T, RecycleError>;

/// Generic result type alias
pub type Result<T> = RecycleResult<T>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_memory_message() {
        let error = RecycleError::out_of_memory::<f64>("host", 128);
        let message = error.to_string();
        assert!(message.contains("128"));
        assert!(message.contains("1024 bytes"));
        assert!(message.contains("f64"));
        assert!(error.is_out_of_memory());
        assert!(!error.is_usage_violation());
    }

    #[test]
    fn test_usage_violations() {
        let unknown = RecycleError::unknown_buffer::<f32>("host", 0x1000);
        let mismatch = RecycleError::size_mismatch(0x1000, 10, 11);

        assert!(unknown.is_usage_violation());
        assert!(mismatch.is_usage_violation());
        assert!(unknown.to_string().contains("0x1000"));
        assert!(mismatch.to_string().contains("10 elements"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RecycleError::out_of_memory::<u8>("host", 1).code(),
            "RECYCLE:BACKEND:OOM"
        );
        assert_eq!(
            RecycleError::size_mismatch(1, 2, 3).code(),
            "RECYCLE:USAGE:SIZE_MISMATCH"
        );
        assert_eq!(
            RecycleError::invalid_request("overflow").code(),
            "RECYCLE:REQUEST:INVALID"
        );
    }

    #[test]
    fn test_byte_count_saturates() {
        let error = RecycleError::out_of_memory::<u64>("host", usize::MAX);
        assert!(matches!(
            error,
            RecycleError::OutOfMemory { bytes, .. } if bytes == usize::MAX
        ));
    }
}
