//! Per-mount configuration collaborator
//!
//! The core consumes mount settings through the [`MountConfig`] trait;
//! where those settings come from (XML, database, hardcoded) is not its
//! concern. [`StaticMountConfig`] is the in-process implementation used by
//! demos and tests.

use std::collections::HashMap;
use std::time::Duration;

/// Limits applied to one mountpoint's source
#[derive(Debug, Clone)]
pub struct MountLimits {
    /// Upper bound on queued stream bytes before lagging listeners are shed
    pub queue_size_limit: usize,
    /// Trailing window kept so new listeners can start immediately
    pub burst_size: usize,
    /// Producer silence tolerated before the source is considered dead
    pub source_timeout: Duration,
    /// When this mount comes (back) to life, steal listeners parked on its
    /// fallback mount
    pub fallback_override: bool,
}

impl Default for MountLimits {
    fn default() -> Self {
        Self {
            queue_size_limit: 512 * 1024, // 512KB of in-flight stream data
            burst_size: 64 * 1024,
            source_timeout: Duration::from_secs(10),
            fallback_override: false,
        }
    }
}

impl MountLimits {
    /// Clamp the burst window to half the queue limit
    ///
    /// A burst window that rivals the whole queue leaves trimming nothing
    /// to reclaim; cap it and warn like a misconfigured relay would.
    pub fn sanitized(mut self, mount: &str) -> Self {
        let cap = self.queue_size_limit / 2;
        if self.burst_size > cap {
            tracing::warn!(
                mount = %mount,
                burst = self.burst_size,
                clamped = cap,
                "Burst size above half the queue limit, clamping"
            );
            self.burst_size = cap;
        }
        self
    }
}

/// Mount-configuration collaborator
pub trait MountConfig: Send + Sync {
    /// Statically configured fallback mount, if any
    fn fallback_for(&self, mount: &str) -> Option<String>;

    /// Limits for a mountpoint (defaults when unconfigured)
    fn limits_for(&self, mount: &str) -> MountLimits;
}

/// In-memory mount configuration
#[derive(Debug, Default)]
pub struct StaticMountConfig {
    fallbacks: HashMap<String, String>,
    limits: HashMap<String, MountLimits>,
    default_limits: MountLimits,
}

impl StaticMountConfig {
    /// Empty configuration; every mount gets the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the defaults applied to unconfigured mounts
    pub fn default_limits(mut self, limits: MountLimits) -> Self {
        self.default_limits = limits;
        self
    }

    /// Configure a fallback mount
    pub fn fallback(mut self, mount: impl Into<String>, fallback: impl Into<String>) -> Self {
        self.fallbacks.insert(mount.into(), fallback.into());
        self
    }

    /// Configure per-mount limits
    pub fn limits(mut self, mount: impl Into<String>, limits: MountLimits) -> Self {
        self.limits.insert(mount.into(), limits);
        self
    }
}

impl MountConfig for StaticMountConfig {
    fn fallback_for(&self, mount: &str) -> Option<String> {
        self.fallbacks.get(mount).cloned()
    }

    fn limits_for(&self, mount: &str) -> MountLimits {
        self.limits
            .get(mount)
            .unwrap_or(&self.default_limits)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_to_unknown_mounts() {
        let config = StaticMountConfig::new();
        let limits = config.limits_for("/nowhere");
        assert_eq!(limits.queue_size_limit, 512 * 1024);
        assert!(config.fallback_for("/nowhere").is_none());
    }

    #[test]
    fn test_fallback_chain_entries() {
        let config = StaticMountConfig::new()
            .fallback("/live", "/standby")
            .fallback("/standby", "/silence");
        assert_eq!(config.fallback_for("/live").as_deref(), Some("/standby"));
        assert_eq!(
            config.fallback_for("/standby").as_deref(),
            Some("/silence")
        );
    }

    #[test]
    fn test_burst_clamped_to_half_queue() {
        let limits = MountLimits {
            queue_size_limit: 100,
            burst_size: 90,
            ..MountLimits::default()
        }
        .sanitized("/live");
        assert_eq!(limits.burst_size, 50);
    }
}
