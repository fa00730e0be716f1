//! Mountpoint sources
//!
//! A source owns one mountpoint's ingestion, its stream queue and its
//! listener lists. Whoever feeds it (a local producer or a relay) drives
//! [`Source::run`]; the fan-out in [`fanout`] drains the queue into every
//! attached listener once per tick, under the source's lock.
//!
//! # Architecture
//!
//! ```text
//!   producer bytes ──► FormatPlugin::frame_next ──► ingest ──► BufferQueue
//!                                                               │
//!                                  tick: promote ─ drain ─ trim ┘
//!                                         │
//!                 ┌───────────────────────┼────────────────────┐
//!                 ▼                       ▼                    ▼
//!            [Listener]              [Listener]           [Listener]
//!            cursor+budget           cursor+budget        cursor+budget
//! ```

pub mod fanout;
pub mod listener;
pub mod producer;

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, info, warn};

use crate::buffer::BufferQueue;
use crate::config::MountLimits;
use crate::error::Result;
use crate::format::FormatPlugin;
use crate::registry::MountRegistry;
use crate::stats::StreamEvents;

pub use fanout::FanoutBudget;
pub use listener::{Listener, ListenerInfo};
pub use producer::{ChannelProducer, SocketProducer, StreamProducer};

/// Ingest poll slice; also the fan-out tick interval
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Quick fast-prefix passes allowed between full ticks
const MAX_FAST_PASSES: u32 = 10;

/// Everything a source protects with its lock
pub(crate) struct SourceState {
    pub queue: BufferQueue,
    /// Oldest chunk a new listener may start from
    pub burst_seq: u64,
    /// Bytes currently inside the burst window
    pub burst_offset: usize,
    pub limits: MountLimits,
    pub fallback: Option<String>,
    pub format: Option<Box<dyn FormatPlugin>>,
    /// Active listeners; `[0, first_normal)` is the fast prefix
    pub active: Vec<Listener>,
    pub first_normal: usize,
    /// Admitted but not yet serviced; promoted at the next tick so the
    /// active list is never mutated mid-iteration
    pub pending: Vec<Listener>,
    /// Optional mirror of every ingested unit
    pub dump: Option<Box<dyn Write + Send>>,
    /// File-backed content served in place of a live queue
    pub intro: Option<Bytes>,
    /// Stream headers adopted from the producer (content-type etc.)
    pub headers: Vec<(String, String)>,
    pub last_read: Instant,
    /// Set by ingest when the queue passed its byte limit this tick
    pub overflow: bool,
    pub budget: FanoutBudget,
    /// Next stop keeps listeners parked for a restart instead of
    /// migrating them away
    pub retain_listeners_on_stop: bool,
}

impl SourceState {
    pub(crate) fn new(limits: MountLimits, fallback: Option<String>) -> Self {
        Self {
            queue: BufferQueue::new(),
            burst_seq: 0,
            burst_offset: 0,
            limits,
            fallback,
            format: None,
            active: Vec::new(),
            first_normal: 0,
            pending: Vec::new(),
            dump: None,
            intro: None,
            headers: Vec::new(),
            last_read: Instant::now(),
            overflow: false,
            budget: FanoutBudget::default(),
            retain_listeners_on_stop: false,
        }
    }

    /// Append one framed unit to the queue and slide the burst window
    pub(crate) fn ingest_unit(&mut self, unit: crate::format::StreamUnit) {
        if self.queue.is_empty() {
            self.burst_seq = self.queue.next_seq();
            self.burst_offset = 0;
        }
        let len = unit.data.len();

        if let Some(dump) = self.dump.as_mut() {
            if let Err(e) = dump.write_all(&unit.data) {
                warn!(error = %e, "Dump sink write failed, disabling dump");
                self.dump = None;
            }
        }

        // the queue keeps the only long-lived handle
        let _ = self
            .queue
            .append(unit.data, unit.sync_point, unit.metadata);

        self.burst_offset += len;
        if self.burst_offset > self.limits.burst_size {
            // slide forward one chunk, never past the tail
            if let (Some(burst_chunk), Some(tail)) =
                (self.queue.get(self.burst_seq), self.queue.tail_seq())
            {
                if burst_chunk.seq < tail {
                    self.burst_offset -= burst_chunk.len();
                    self.burst_seq += 1;
                }
            }
        }

        if self.queue.len_bytes() > self.limits.queue_size_limit {
            self.overflow = true;
        }
    }

    pub(crate) fn listener_total(&self) -> u32 {
        (self.active.len() + self.pending.len()) as u32
    }

    /// Flush the stream side of the state after a stop
    fn clear_stream(&mut self) {
        self.queue.clear();
        self.burst_seq = 0;
        self.burst_offset = 0;
        self.format = None;
        self.dump = None;
        self.intro = None;
        self.headers.clear();
        self.overflow = false;
    }
}

/// One mountpoint's live or idle state
pub struct Source {
    mount: String,
    pub(crate) state: Mutex<SourceState>,
    running: AtomicBool,
    on_demand: AtomicBool,
    /// Listeners arrived while idle; a relay should consider starting
    on_demand_req: AtomicBool,
    /// Kept in the registry across disconnects (a relay definition still
    /// references this mount)
    persistent: AtomicBool,
    listener_count: AtomicU32,
    events: Arc<dyn StreamEvents>,
}

impl Source {
    pub(crate) fn new(
        mount: impl Into<String>,
        limits: MountLimits,
        fallback: Option<String>,
        events: Arc<dyn StreamEvents>,
    ) -> Self {
        Self {
            mount: mount.into(),
            state: Mutex::new(SourceState::new(limits, fallback)),
            running: AtomicBool::new(false),
            on_demand: AtomicBool::new(false),
            on_demand_req: AtomicBool::new(false),
            persistent: AtomicBool::new(false),
            listener_count: AtomicU32::new(0),
            events,
        }
    }

    /// Mountpoint name
    pub fn mount(&self) -> &str {
        &self.mount
    }

    /// Whether a producer currently feeds this source
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether this mount starts its relay only when listeners exist
    pub fn is_on_demand(&self) -> bool {
        self.on_demand.load(Ordering::SeqCst)
    }

    /// Mark the mount as relay-on-demand
    pub fn set_on_demand(&self, on_demand: bool) {
        self.on_demand.store(on_demand, Ordering::SeqCst);
    }

    pub(crate) fn set_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::SeqCst);
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::SeqCst)
    }

    /// Listeners currently attached (active + pending)
    pub fn listener_count(&self) -> u32 {
        self.listener_count.load(Ordering::SeqCst)
    }

    /// Consume the "listeners arrived while idle" signal
    pub fn take_on_demand_request(&self) -> bool {
        self.on_demand_req.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn request_on_demand(&self) {
        self.on_demand_req.store(true, Ordering::SeqCst);
    }

    pub(crate) fn publish_listener_count(&self, count: u32) {
        let old = self.listener_count.swap(count, Ordering::SeqCst);
        if old != count {
            self.events.on_listener_count_changed(&self.mount, count);
        }
    }

    /// Mark running without a producer loop (test scaffolding)
    #[cfg(test)]
    pub(crate) fn force_running(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Ask the producer loop to wind down at its next tick
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop but keep listeners parked for an imminent restart
    ///
    /// Used on relay reconfiguration: the definition changed but the
    /// mount lives on, so nobody gets kicked to the fallback.
    pub async fn stop_for_restart(&self) {
        self.state.lock().await.retain_listeners_on_stop = true;
        self.stop();
    }

    /// Queue a listener for admission at the next tick
    pub async fn admit(&self, listener: Listener) {
        let count = {
            let mut st = self.state.lock().await;
            st.pending.push(listener);
            st.listener_total()
        };
        self.publish_listener_count(count);
        if self.is_on_demand() && !self.is_running() {
            self.request_on_demand();
        }
    }

    /// Disconnect one listener by id; returns whether it was found
    pub async fn evict(&self, listener_id: u64) -> bool {
        let (found, count) = {
            let mut st = self.state.lock().await;
            let before = st.listener_total();
            if let Some(idx) = st.active.iter().position(|l| l.id == listener_id) {
                let mut l = st.active.remove(idx);
                if idx < st.first_normal {
                    st.first_normal -= 1;
                }
                l.transport.close();
            } else if let Some(idx) = st.pending.iter().position(|l| l.id == listener_id) {
                let mut l = st.pending.remove(idx);
                l.transport.close();
            }
            let after = st.listener_total();
            (after != before, after)
        };
        if found {
            self.publish_listener_count(count);
        }
        found
    }

    /// Append one framed unit directly (producers that frame their own
    /// units, and tests)
    pub async fn ingest(&self, unit: crate::format::StreamUnit) {
        self.state.lock().await.ingest_unit(unit);
    }

    /// Mirror every ingested unit into `sink`
    pub async fn set_dump(&self, sink: Box<dyn Write + Send>) {
        self.state.lock().await.dump = Some(sink);
    }

    /// Adopt stream headers announced by the producer
    pub async fn adopt_headers(&self, headers: Vec<(String, String)>) {
        self.state.lock().await.headers = headers;
    }

    /// Headers adopted from the current producer
    pub async fn headers(&self) -> Vec<(String, String)> {
        self.state.lock().await.headers.clone()
    }

    /// Read-only listener metadata for reporting
    pub async fn listener_snapshot(&self) -> Vec<ListenerInfo> {
        let st = self.state.lock().await;
        st.active
            .iter()
            .chain(st.pending.iter())
            .map(|l| l.info())
            .collect()
    }

    /// One full service tick: promote, drain, trim
    pub async fn service_tick(&self) {
        let (changed, count) = {
            let mut st = self.state.lock().await;
            let promoted = st.promote_pending();
            let mut fmt = st.format.take();
            let report = st.service_listeners(fmt.as_deref_mut(), false);
            st.format = fmt;
            st.trim_queue();
            (promoted > 0 || report.removed > 0, st.listener_total())
        };
        if changed {
            self.publish_listener_count(count);
        }
        // an on-demand relay mount with nobody listening winds down
        if count == 0 && self.is_on_demand() && self.is_running() {
            info!(mount = %self.mount, "No listeners left on on-demand mount, stopping");
            self.stop();
        }
    }

    /// Drive this source from a producer until it stops or fails
    ///
    /// This is the whole ingest path: read with timeout, frame, append,
    /// tick. A read timeout is producer failure: the source shuts down
    /// (migrating listeners to the fallback where configured) and the
    /// call returns; the process is never affected.
    pub async fn run<P: StreamProducer>(
        self: &Arc<Self>,
        registry: &MountRegistry,
        mut producer: P,
        format: Box<dyn FormatPlugin>,
    ) -> Result<()> {
        self.start(format).await;
        self.apply_fallback_override(registry).await;

        let mut acc = BytesMut::new();
        let mut fast_passes = 0u32;

        while self.is_running() {
            match time::timeout(TICK_INTERVAL, producer.read_chunk()).await {
                Ok(Ok(Some(data))) => {
                    let mut st = self.state.lock().await;
                    st.last_read = Instant::now();
                    acc.extend_from_slice(&data);

                    let mut fmt = st.format.take();
                    if let Some(f) = fmt.as_mut() {
                        let mut units = Vec::new();
                        while let Some(unit) = f.frame_next(&mut acc) {
                            units.push(unit);
                        }
                        for unit in units {
                            st.ingest_unit(unit);
                        }
                    }

                    if fast_passes < MAX_FAST_PASSES {
                        // cheap pass over the fast prefix between reads
                        st.service_listeners(fmt.as_deref_mut(), true);
                        st.format = fmt;
                        fast_passes += 1;
                        continue;
                    }
                    st.format = fmt;
                    fast_passes = 0;
                }
                Ok(Ok(None)) => {
                    info!(mount = %self.mount, "Producer ended the stream");
                    let mut st = self.state.lock().await;
                    let mut fmt = st.format.take();
                    if let Some(f) = fmt.as_mut() {
                        if let Some(unit) = f.frame_flush(&mut acc) {
                            st.ingest_unit(unit);
                        }
                    }
                    st.format = fmt;
                    drop(st);
                    self.stop();
                }
                Ok(Err(e)) => {
                    warn!(mount = %self.mount, error = %e, "Producer read failed");
                    self.stop();
                }
                Err(_) => {
                    // poll slice elapsed with no data; producer deadline?
                    let timed_out = {
                        let st = self.state.lock().await;
                        st.last_read.elapsed() > st.limits.source_timeout
                    };
                    if timed_out {
                        warn!(mount = %self.mount, "Disconnecting source due to read timeout");
                        self.stop();
                    }
                    fast_passes = 0;
                }
            }
            self.service_tick().await;
        }

        self.shutdown(registry).await;
        Ok(())
    }

    /// Serve static file-backed content on this mount until stopped
    ///
    /// Stands in for a live producer on fallback mounts: listeners loop
    /// over `content` from its own offset 0.
    pub async fn run_file(self: &Arc<Self>, registry: &MountRegistry, content: Bytes) -> Result<()> {
        {
            let mut st = self.state.lock().await;
            st.intro = Some(content);
            st.last_read = Instant::now();
        }
        self.running.store(true, Ordering::SeqCst);
        self.events.on_source_state_changed(&self.mount, true);

        while self.is_running() {
            time::sleep(TICK_INTERVAL).await;
            self.service_tick().await;
        }
        self.shutdown(registry).await;
        Ok(())
    }

    async fn start(&self, format: Box<dyn FormatPlugin>) {
        {
            let mut st = self.state.lock().await;
            st.format = Some(format);
            st.last_read = Instant::now();
            st.overflow = false;
        }
        self.running.store(true, Ordering::SeqCst);
        info!(mount = %self.mount, "Source running");
        self.events.on_source_state_changed(&self.mount, true);
    }

    /// Steal listeners back from the fallback when this mount revives
    async fn apply_fallback_override(self: &Arc<Self>, registry: &MountRegistry) {
        let (wanted, fallback) = {
            let st = self.state.lock().await;
            (st.limits.fallback_override, st.fallback.clone())
        };
        if !wanted {
            return;
        }
        let Some(fallback) = fallback else { return };
        if let Some(fb_source) = registry.find(&fallback).await {
            if !Arc::ptr_eq(&fb_source, self) && fb_source.listener_count() > 0 {
                info!(mount = %self.mount, fallback = %fallback, "Reclaiming listeners from fallback");
                let _ = registry.move_clients(&fb_source, self).await;
            }
        }
    }

    /// Wind the source down
    ///
    /// Listeners go to the fallback when one resolves to a live source,
    /// otherwise each gets a clean disconnect. Queue, format plugin and
    /// dump sink are released either way. The `Source` record itself
    /// stays registered only while a relay definition references it.
    pub async fn shutdown(self: &Arc<Self>, registry: &MountRegistry) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if was_running {
            self.events.on_source_state_changed(&self.mount, false);
        }

        let restart = {
            let st = self.state.lock().await;
            st.retain_listeners_on_stop
        };
        if restart {
            let mut st = self.state.lock().await;
            st.retain_listeners_on_stop = false;
            let active = std::mem::take(&mut st.active);
            st.first_normal = 0;
            for mut listener in active {
                listener.clear_cursor();
                st.pending.push(listener);
            }
            st.clear_stream();
            debug!(mount = %self.mount, parked = st.pending.len(), "Source stopped for restart");
            return;
        }

        let fallback = { self.state.lock().await.fallback.clone() };
        if let Some(fallback) = fallback {
            if let Some(dest) = registry.resolve(&fallback).await {
                if !Arc::ptr_eq(&dest, self) {
                    match registry.move_clients(self, &dest).await {
                        Ok(moved) if moved > 0 => {
                            info!(mount = %self.mount, dest = %dest.mount(), moved = moved,
                                  "Moved listeners to fallback");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(mount = %self.mount, error = %e, "Fallback move failed"),
                    }
                }
            }
        }

        let dropped = {
            let mut st = self.state.lock().await;
            st.first_normal = 0;
            let mut dropped: Vec<Listener> = st.active.drain(..).collect();
            dropped.extend(st.pending.drain(..));
            st.clear_stream();
            dropped
        };
        if !dropped.is_empty() {
            info!(mount = %self.mount, count = dropped.len(), "Disconnecting remaining listeners");
            for mut listener in dropped {
                listener.transport.close();
            }
        }
        self.publish_listener_count(0);
        info!(mount = %self.mount, "Source exiting");
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("mount", &self.mount)
            .field("running", &self.is_running())
            .field("on_demand", &self.is_on_demand())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::StreamUnit;
    use crate::stats::NullEvents;
    use crate::transport::SinkTransport;

    fn test_source(limits: MountLimits) -> Arc<Source> {
        Arc::new(Source::new("/test", limits, None, Arc::new(NullEvents)))
    }

    fn unit(len: usize) -> StreamUnit {
        StreamUnit {
            data: Bytes::from(vec![1u8; len]),
            sync_point: true,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_admit_then_tick_delivers_burst() {
        let source = test_source(MountLimits::default());
        source.ingest(unit(100)).await;
        source.ingest(unit(100)).await;

        source
            .admit(Listener::new(Box::new(SinkTransport::new())))
            .await;
        assert_eq!(source.listener_count(), 1);

        source.service_tick().await;
        let snapshot = source.listener_snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].sent_bytes, 200, "burst window delivered");
    }

    #[tokio::test]
    async fn test_queue_recovers_after_evicting_laggard() {
        let limits = MountLimits {
            queue_size_limit: 1024 * 1024,
            burst_size: 64 * 1024,
            ..MountLimits::default()
        };
        let source = test_source(limits);

        // laggard takes a cursor at the head and then never drains
        source.ingest(unit(64 * 1024)).await;
        source
            .admit(Listener::new(Box::new(SinkTransport::always_blocked())))
            .await;
        source.service_tick().await;

        // 2MB of backlog behind a 1MB limit
        for _ in 0..32 {
            source.ingest(unit(64 * 1024)).await;
        }
        source.service_tick().await;

        assert_eq!(source.listener_count(), 0, "laggard disconnected");
        let st = source.state.lock().await;
        assert!(st.queue.len_bytes() <= 1024 * 1024);
    }

    #[tokio::test]
    async fn test_evict_by_id() {
        let source = test_source(MountLimits::default());
        let listener = Listener::new(Box::new(SinkTransport::new()));
        let id = listener.id;
        source.admit(listener).await;

        assert!(source.evict(id).await);
        assert!(!source.evict(id).await);
        assert_eq!(source.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_producer_end() {
        let registry = MountRegistry::new(
            Arc::new(crate::config::StaticMountConfig::new()),
            Arc::new(NullEvents),
        );
        let source = registry.reserve("/live").await.unwrap();

        let (tx, producer) = ChannelProducer::new(8);
        tx.send(Bytes::from(vec![0u8; 4096])).await.unwrap();
        drop(tx);

        source
            .run(&registry, producer, Box::new(crate::format::RawFormat::new()))
            .await
            .unwrap();
        assert!(!source.is_running());
    }

    #[tokio::test]
    async fn test_on_demand_mount_stops_without_listeners() {
        let source = test_source(MountLimits::default());
        source.set_on_demand(true);
        source.running.store(true, Ordering::SeqCst);

        source.service_tick().await;
        assert!(!source.is_running());
    }
}
