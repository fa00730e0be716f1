//! Relay definitions
//!
//! A relay definition names one local mount and the ordered upstream
//! candidates it pulls from. Definitions are plain data compared by value;
//! the manager diffs reloaded definitions against the live set to decide
//! which relays to keep, restart or tear down.

use std::net::IpAddr;
use std::time::Duration;

/// One upstream server candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// Upstream host name or address
    pub host: String,
    /// Upstream port
    pub port: u16,
    /// Mountpoint requested on the upstream
    pub mount: String,
    /// Connect and response deadline
    pub timeout: Duration,
    /// Local address to bind the outbound socket to
    pub bind: Option<IpAddr>,
}

impl UpstreamConfig {
    /// Candidate with default timeout and no bind address
    pub fn new(host: impl Into<String>, port: u16, mount: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            mount: mount.into(),
            timeout: Duration::from_secs(10),
            bind: None,
        }
    }
}

/// One relay definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Mountpoint the relayed stream is served on locally
    pub local_mount: String,
    /// Upstream candidates, tried in order
    pub upstreams: Vec<UpstreamConfig>,
    /// Username for upstream basic auth
    pub username: Option<String>,
    /// Password for upstream basic auth
    pub password: Option<String>,
    /// Connect only while the local mount has listeners
    pub on_demand: bool,
    /// Disabled definitions stay registered but never connect
    pub enable: bool,
    /// Retry interval after a failed or dropped connection
    pub interval: Duration,
}

impl RelayConfig {
    /// Definition with one upstream and defaults otherwise
    pub fn new(local_mount: impl Into<String>, upstream: UpstreamConfig) -> Self {
        Self {
            local_mount: local_mount.into(),
            upstreams: vec![upstream],
            username: None,
            password: None,
            on_demand: false,
            enable: true,
            interval: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definitions_compare_by_value() {
        let a = RelayConfig::new("/live", UpstreamConfig::new("stream.example.com", 8000, "/src"));
        let mut b = a.clone();
        assert_eq!(a, b);

        b.password = Some("hunter2".to_string());
        assert_ne!(a, b);
    }
}
