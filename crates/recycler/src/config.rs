//! Recycler configuration

/// Configuration for a [`Registry`](crate::registry::Registry) and the pools it creates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecyclerConfig {
    /// Fill pattern byte for freshly created buffers (for debugging)
    pub alloc_pattern: Option<u8>,
    /// Fill pattern byte for buffers whose last reference was released (for debugging)
    pub release_pattern: Option<u8>,

    /// Log each pool's counters when it is torn down
    pub report_on_teardown: bool,
}

impl Default for RecyclerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RecyclerConfig {
    /// Build-dependent defaults: debug patterns in debug builds only
    #[must_use]
    pub const fn new() -> Self {
        if cfg!(debug_assertions) {
            Self::debug()
        } else {
            Self::production()
        }
    }

    /// Production configuration - no fill patterns
    #[must_use]
    pub const fn production() -> Self {
        Self {
            alloc_pattern: None,
            release_pattern: None,
            report_on_teardown: true,
        }
    }

    /// Debug configuration - poison fresh and released buffers
    #[must_use]
    pub const fn debug() -> Self {
        Self {
            alloc_pattern: Some(0xBB),
            release_pattern: Some(0xDD),
            report_on_teardown: true,
        }
    }

    /// Quiet configuration - nothing but the recycling itself
    #[must_use]
    pub const fn silent() -> Self {
        Self {
            alloc_pattern: None,
            release_pattern: None,
            report_on_teardown: false,
        }
    }

    /// Set the fill pattern for fresh buffers
    #[must_use = "builder methods must be chained or built"]
    pub const fn with_alloc_pattern(mut self, pattern: Option<u8>) -> Self {
        self.alloc_pattern = pattern;
        self
    }

    /// Set the fill pattern for released buffers
    #[must_use = "builder methods must be chained or built"]
    pub const fn with_release_pattern(mut self, pattern: Option<u8>) -> Self {
        self.release_pattern = pattern;
        self
    }

    /// Enable or disable the teardown summary
    #[must_use = "builder methods must be chained or built"]
    pub const fn with_teardown_report(mut self, enabled: bool) -> Self {
        self.report_on_teardown = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(RecyclerConfig::production().alloc_pattern, None);
        assert_eq!(RecyclerConfig::debug().alloc_pattern, Some(0xBB));
        assert_eq!(RecyclerConfig::debug().release_pattern, Some(0xDD));
        assert!(!RecyclerConfig::silent().report_on_teardown);
    }

    #[test]
    fn test_default_follows_build_profile() {
        let config = RecyclerConfig::default();
        assert_eq!(config.alloc_pattern.is_some(), cfg!(debug_assertions));
    }

    #[test]
    fn test_builder() {
        let config = RecyclerConfig::production()
            .with_alloc_pattern(Some(0x11))
            .with_teardown_report(false);
        assert_eq!(config.alloc_pattern, Some(0x11));
        assert_eq!(config.release_pattern, None);
        assert!(!config.report_on_teardown);
    }
}
