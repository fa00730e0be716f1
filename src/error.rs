//! Crate-wide error type
//!
//! Failures are scoped: listener-level problems are handled inside the
//! fan-out and never surface here, producer failures surface as a source
//! state change, and these errors cover the operations a caller invokes
//! directly (admission, registry lookups, relay connects).

use std::io;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mountpoint and relay operations
#[derive(Debug)]
pub enum Error {
    /// The mountpoint is already claimed by another producer or relay
    MountInUse(String),
    /// No running source (and no resolvable fallback) for the mountpoint
    MountUnavailable(String),
    /// The destination of a listener move is neither running nor on-demand
    SourceNotRunning(String),
    /// Outbound relay connection failed
    RelayConnect(String),
    /// The upstream answered with something we can't stream from
    UpstreamResponse(String),
    /// Underlying I/O error
    Io(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::MountInUse(mount) => write!(f, "Mountpoint already in use: {}", mount),
            Error::MountUnavailable(mount) => write!(f, "Mountpoint unavailable: {}", mount),
            Error::SourceNotRunning(mount) => {
                write!(f, "Source not running on mountpoint: {}", mount)
            }
            Error::RelayConnect(msg) => write!(f, "Relay connection failed: {}", msg),
            Error::UpstreamResponse(msg) => write!(f, "Bad upstream response: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_mount() {
        let e = Error::MountInUse("/live.ogg".to_string());
        assert!(e.to_string().contains("/live.ogg"));
    }

    #[test]
    fn test_io_source_chain() {
        let e = Error::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(std::error::Error::source(&e).is_some());
    }
}
