//! # aircast
//!
//! Streaming-media distribution core: one producer per named mountpoint,
//! fanned out unmodified to any number of listeners, each reading at its
//! own pace, with bounded memory and self-healing relays.
//!
//! The pieces:
//!
//! - [`buffer`]: the zero-copy multi-reader stream queue
//! - [`source`]: per-mountpoint ingestion and listener fan-out
//! - [`registry`]: the mount directory, fallback resolution, listener moves
//! - [`relay`]: upstream pulls, reconciliation and retry
//! - [`format`]: the codec-specific framing seam
//! - [`transport`]: the non-blocking listener write seam
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use aircast::config::StaticMountConfig;
//! use aircast::registry::MountRegistry;
//! use aircast::source::ChannelProducer;
//! use aircast::format::FormatKind;
//! use aircast::stats::default_events;
//!
//! #[tokio::main]
//! async fn main() -> aircast::Result<()> {
//!     let registry = Arc::new(MountRegistry::new(
//!         Arc::new(StaticMountConfig::new()),
//!         default_events(),
//!     ));
//!
//!     let source = registry.reserve("/live").await?;
//!     let (feed, producer) = ChannelProducer::new(64);
//!
//!     // feed bytes into `feed` from an encoder task, attach listeners
//!     // with `source.admit(...)`, then drive the mount:
//!     source.run(&registry, producer, FormatKind::Raw.plugin()).await?;
//!     drop(feed);
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod format;
pub mod registry;
pub mod relay;
pub mod source;
pub mod stats;
pub mod transport;

pub use buffer::{BufferQueue, StreamChunk};
pub use config::{MountConfig, MountLimits, StaticMountConfig};
pub use error::{Error, Result};
pub use format::{FormatKind, FormatPlugin, StreamUnit};
pub use registry::MountRegistry;
pub use relay::{RelayConfig, RelayManager, RelayState, UpstreamConfig};
pub use source::{Listener, ListenerInfo, Source};
pub use transport::{ListenerTransport, TcpTransport, TransportError};
