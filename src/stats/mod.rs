//! Observability hooks and server-wide counters
//!
//! The core reports state transitions through [`StreamEvents`]; whatever
//! aggregates or exposes them (stats page, metrics exporter) lives
//! outside. [`ServerStats`] is the in-crate aggregator: plug it in as the
//! events sink and it keeps the cheap process-wide counters current.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Side-effect notifications emitted by the core
pub trait StreamEvents: Send + Sync {
    /// A mount's listener count changed
    fn on_listener_count_changed(&self, mount: &str, count: u32) {
        let _ = (mount, count);
    }

    /// A mount's source started or stopped
    fn on_source_state_changed(&self, mount: &str, running: bool) {
        let _ = (mount, running);
    }

    /// A relay's upstream pull reached streaming
    fn on_relay_connected(&self, mount: &str) {
        let _ = mount;
    }
}

/// Events sink that only logs
#[derive(Debug, Default)]
pub struct LogEvents;

impl StreamEvents for LogEvents {
    fn on_listener_count_changed(&self, mount: &str, count: u32) {
        tracing::info!(mount = %mount, listeners = count, "Listener count changed");
    }

    fn on_source_state_changed(&self, mount: &str, running: bool) {
        tracing::info!(mount = %mount, running = running, "Source state changed");
    }

    fn on_relay_connected(&self, mount: &str) {
        tracing::info!(mount = %mount, "Relay connected");
    }
}

/// Silent events sink
#[derive(Debug, Default)]
pub struct NullEvents;

impl StreamEvents for NullEvents {}

/// Default events sink shared by components that weren't given one
pub fn default_events() -> Arc<dyn StreamEvents> {
    Arc::new(LogEvents)
}

/// Process-wide counters, driven by the events it receives
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Sources currently running
    pub sources: AtomicUsize,
    /// Listeners currently attached across all mounts
    pub listeners: AtomicUsize,
    /// Total relay pulls that reached streaming
    pub relay_connections: AtomicU64,
    /// Total listeners ever admitted
    pub listener_connections: AtomicU64,
    /// Last reported count per mount, for turning counts into deltas
    last_counts: Mutex<HashMap<String, u32>>,
}

impl ServerStats {
    /// Fresh zeroed counters
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamEvents for ServerStats {
    fn on_listener_count_changed(&self, mount: &str, count: u32) {
        let old = {
            let mut counts = match self.last_counts.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            counts.insert(mount.to_string(), count).unwrap_or(0)
        };
        if count > old {
            let added = (count - old) as usize;
            self.listeners.fetch_add(added, Ordering::Relaxed);
            self.listener_connections
                .fetch_add(added as u64, Ordering::Relaxed);
        } else {
            self.listeners
                .fetch_sub((old - count) as usize, Ordering::Relaxed);
        }
    }

    fn on_source_state_changed(&self, _mount: &str, running: bool) {
        if running {
            self.sources.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sources.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn on_relay_connected(&self, _mount: &str) {
        self.relay_connections.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_drive_counters() {
        let stats = ServerStats::new();
        stats.on_source_state_changed("/live", true);
        stats.on_listener_count_changed("/live", 2);
        stats.on_listener_count_changed("/live", 1);
        stats.on_listener_count_changed("/live", 3);
        stats.on_listener_count_changed("/other", 1);
        stats.on_relay_connected("/relay");

        assert_eq!(stats.sources.load(Ordering::Relaxed), 1);
        assert_eq!(stats.listeners.load(Ordering::Relaxed), 4);
        // 2 admitted, 1 left, 2 more, 1 on the other mount
        assert_eq!(stats.listener_connections.load(Ordering::Relaxed), 5);
        assert_eq!(stats.relay_connections.load(Ordering::Relaxed), 1);

        stats.on_source_state_changed("/live", false);
        assert_eq!(stats.sources.load(Ordering::Relaxed), 0);
    }
}
