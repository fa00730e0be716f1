//! Relay management
//!
//! The manager owns every configured relay: it diffs reloaded definitions
//! against the live set, drives each relay through
//! `Idle → Connecting → Streaming → Terminating`, and feeds the local
//! Source through the same ingest path a local producer uses. Connect
//! failure is never terminal; a definition that exists keeps retrying.
//!
//! # Architecture
//!
//! ```text
//!   reconcile(configs) ──► relays: { local mount → RelayEntry }
//!                                        │ tick (1s, or on-demand wake)
//!                                        ▼
//!          Idle ──demand/backoff──► Connecting ──200 OK──► Streaming
//!            ▲                          │ fail                 │ drop
//!            └────────── backoff ───────┴──────────────────────┘
//!                          (cleanup/disable → Terminating)
//! ```

pub mod config;
pub mod connect;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::format::FormatKind;
use crate::registry::MountRegistry;
use crate::source::{SocketProducer, Source};

pub use config::{RelayConfig, UpstreamConfig};
pub use connect::{open_upstream, UpstreamConnection};

/// Manager pass interval
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Cap on simultaneous outbound connection attempts
const MAX_CONNECTING: usize = 3;

/// Retry delay for on-demand relays (listeners are waiting)
const SHORT_RETRY: Duration = Duration::from_secs(5);

/// How long termination waits for listeners to drain
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Where one relay currently is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// No upstream connection held
    Idle,
    /// Outbound attempt in flight
    Connecting,
    /// Feeding the local source
    Streaming,
    /// Stopping; waiting for listeners to drain
    Terminating,
}

/// Definition plus live state of one relay
struct RelayEntry {
    config: RelayConfig,
    source: Arc<Source>,
    state: RelayState,
    /// Definition removed; free everything once drained
    cleanup: bool,
    /// Definition changed; reconnect immediately after the old pull stops
    restart_pending: bool,
    next_attempt: Instant,
    terminate_deadline: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

/// Reconciles configured relays against running ones and drives them
pub struct RelayManager {
    registry: Arc<MountRegistry>,
    /// Live relays by local mount; this lock serializes reconciliation
    /// against per-relay state transitions
    relays: Mutex<HashMap<String, RelayEntry>>,
    connecting: Arc<AtomicUsize>,
}

impl RelayManager {
    /// Manager bound to a registry
    pub fn new(registry: Arc<MountRegistry>) -> Self {
        Self {
            registry,
            relays: Mutex::new(HashMap::new()),
            connecting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Diff a freshly loaded definition set against the live relays
    ///
    /// Unchanged definitions keep their live state untouched. Changed
    /// definitions keep their Source (listeners are not disrupted) and
    /// reconnect with the new parameters. Definitions no longer present
    /// are flagged for cleanup and torn down over the next ticks.
    pub async fn reconcile(&self, configs: Vec<RelayConfig>) {
        let keep: HashSet<String> = configs.iter().map(|c| c.local_mount.clone()).collect();
        let mut relays = self.relays.lock().await;

        for config in configs {
            if let Some(entry) = relays.get_mut(&config.local_mount) {
                if entry.config == config && !entry.cleanup {
                    continue;
                }
                info!(mount = %config.local_mount, "Relay definition changed, scheduling restart");
                entry.cleanup = false;
                entry.source.set_on_demand(config.on_demand);
                entry.config = config;
                entry.next_attempt = Instant::now();
                if entry.source.is_running() {
                    entry.restart_pending = true;
                    entry.source.stop_for_restart().await;
                }
                continue;
            }
            match self.registry.reserve(&config.local_mount).await {
                Ok(source) => {
                    source.set_persistent(true);
                    source.set_on_demand(config.on_demand);
                    info!(mount = %config.local_mount, on_demand = config.on_demand,
                          "Relay registered");
                    relays.insert(
                        config.local_mount.clone(),
                        RelayEntry {
                            config,
                            source,
                            state: RelayState::Idle,
                            cleanup: false,
                            restart_pending: false,
                            next_attempt: Instant::now(),
                            terminate_deadline: None,
                            task: None,
                        },
                    );
                }
                Err(e) => {
                    warn!(mount = %config.local_mount, error = %e,
                          "Relay mount unavailable, will retry at next reconcile");
                }
            }
        }

        for (mount, entry) in relays.iter_mut() {
            if !keep.contains(mount) && !entry.cleanup {
                info!(mount = %mount, "Relay definition removed, cleaning up");
                entry.cleanup = true;
            }
        }
    }

    /// One manager pass over every relay
    pub async fn tick(&self) {
        let now = Instant::now();
        let mut freed: Vec<String> = Vec::new();
        let mut relays = self.relays.lock().await;

        for (mount, entry) in relays.iter_mut() {
            if entry.task.as_ref().is_some_and(|t| t.is_finished()) {
                entry.task = None;
            }

            if entry.cleanup || !entry.config.enable {
                match entry.state {
                    RelayState::Terminating => {
                        let drained = entry.task.is_none()
                            && !entry.source.is_running()
                            && entry.source.listener_count() == 0;
                        let expired = entry.terminate_deadline.is_some_and(|d| now >= d);
                        if drained || expired {
                            entry.terminate_deadline = None;
                            if entry.cleanup {
                                freed.push(mount.clone());
                            } else {
                                entry.state = RelayState::Idle;
                            }
                        }
                    }
                    _ => {
                        let busy = entry.task.is_some()
                            || entry.source.is_running()
                            || entry.source.listener_count() > 0;
                        if busy {
                            info!(mount = %mount, "Stopping relay");
                            if entry.task.is_some() {
                                // the pull task runs the shutdown itself
                                entry.source.stop();
                            } else {
                                entry.source.shutdown(&self.registry).await;
                            }
                            entry.state = RelayState::Terminating;
                            entry.terminate_deadline = Some(now + TERMINATION_GRACE);
                        } else if entry.cleanup {
                            freed.push(mount.clone());
                        } else {
                            entry.state = RelayState::Idle;
                        }
                    }
                }
                continue;
            }

            match entry.state {
                RelayState::Idle => {
                    if now < entry.next_attempt {
                        continue;
                    }
                    if entry.config.on_demand && !self.demand_exists(entry).await {
                        continue;
                    }
                    if self.connecting.load(Ordering::SeqCst) >= MAX_CONNECTING {
                        continue;
                    }
                    info!(mount = %mount, "Starting relay");
                    // counted before the spawn so one tick can't blow
                    // past the cap while the tasks are still unpolled
                    self.connecting.fetch_add(1, Ordering::SeqCst);
                    entry.task = Some(tokio::spawn(run_relay(
                        Arc::clone(&self.registry),
                        Arc::clone(&entry.source),
                        entry.config.clone(),
                        Arc::clone(&self.connecting),
                    )));
                    entry.state = RelayState::Connecting;
                }
                RelayState::Connecting => {
                    if entry.source.is_running() {
                        entry.state = RelayState::Streaming;
                    } else if entry.task.is_none() {
                        entry.state = RelayState::Idle;
                        entry.next_attempt = now + self.backoff(entry);
                    }
                }
                RelayState::Streaming => {
                    if entry.task.is_none() {
                        entry.state = RelayState::Idle;
                        entry.next_attempt = now + self.backoff(entry);
                    }
                }
                RelayState::Terminating => {
                    // re-enabled or re-added mid-teardown; finish draining
                    if entry.task.is_none() && !entry.source.is_running() {
                        entry.state = RelayState::Idle;
                        entry.terminate_deadline = None;
                    }
                }
            }
        }

        for mount in freed {
            if let Some(entry) = relays.remove(&mount) {
                entry.source.set_persistent(false);
                self.registry.remove(&mount).await;
                info!(mount = %mount, "Relay freed");
            }
        }
    }

    /// Drive ticks until the task is cancelled
    ///
    /// Wakes early when the registry signals listeners arriving on an
    /// idle on-demand mount.
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = time::sleep(TICK_INTERVAL) => {}
                _ = self.registry.relay_wake().notified() => {}
            }
            self.tick().await;
        }
    }

    /// Current lifecycle state of a relay, by local mount
    pub async fn relay_state(&self, mount: &str) -> Option<RelayState> {
        self.relays.lock().await.get(mount).map(|e| e.state)
    }

    /// The Source a relay feeds, by local mount
    pub async fn relay_source(&self, mount: &str) -> Option<Arc<Source>> {
        self.relays
            .lock()
            .await
            .get(mount)
            .map(|e| Arc::clone(&e.source))
    }

    fn backoff(&self, entry: &mut RelayEntry) -> Duration {
        if entry.restart_pending {
            entry.restart_pending = false;
            return Duration::ZERO;
        }
        if entry.config.on_demand {
            SHORT_RETRY
        } else {
            entry.config.interval
        }
    }

    /// Demand for an on-demand relay: listeners here, listeners parked on
    /// the fallback mount, or an arrival signal consumed from the source
    async fn demand_exists(&self, entry: &RelayEntry) -> bool {
        if entry.source.take_on_demand_request() || entry.source.listener_count() > 0 {
            return true;
        }
        if let Some(fallback) = self.registry.config().fallback_for(&entry.config.local_mount) {
            if let Some(fb_source) = self.registry.find(&fallback).await {
                if fb_source.listener_count() > 0 {
                    return true;
                }
            }
        }
        false
    }
}

impl std::fmt::Debug for RelayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayManager").finish_non_exhaustive()
    }
}

/// One upstream pull, start to finish
///
/// Connects, adopts the response headers into the local source, then
/// drives the source's ingest loop until the stream drops or the source
/// is stopped. The entry's state bookkeeping stays with the manager; this
/// task only touches the source. The manager already counted this task
/// against the connecting cap; releasing that slot once the connect
/// phase ends is this task's job.
async fn run_relay(
    registry: Arc<MountRegistry>,
    source: Arc<Source>,
    config: RelayConfig,
    connecting: Arc<AtomicUsize>,
) {
    let result = connect::open_upstream(&config).await;
    connecting.fetch_sub(1, Ordering::SeqCst);

    match result {
        Ok(conn) => {
            let content_type = conn
                .headers
                .iter()
                .find(|(k, _)| k == "content-type")
                .map(|(_, v)| v.as_str());
            let format = FormatKind::from_content_type(content_type).plugin();

            let adopted: Vec<(String, String)> = conn
                .headers
                .iter()
                .filter(|(k, _)| k == "content-type" || k.starts_with("icy-"))
                .cloned()
                .collect();
            source.adopt_headers(adopted).await;

            info!(mount = %config.local_mount, "Relay connected");
            registry.events().on_relay_connected(&config.local_mount);
            let producer = SocketProducer::new(conn.stream, conn.leftover);
            if let Err(e) = source.run(&registry, producer, format).await {
                warn!(mount = %config.local_mount, error = %e, "Relay stream failed");
            }
        }
        Err(e) => {
            warn!(mount = %config.local_mount, error = %e, "Relay connect failed");
        }
    }
}
