//! Per-tick listener servicing
//!
//! The scheduling invariant: within one tick the order is always
//! ingest → promote pending → drain listeners → trim. Trimming runs only
//! after every listener had its chance to advance, so the queue never
//! reclaims a chunk under a reader's cursor.
//!
//! Listeners are partitioned into a "fast" prefix (drained to the tail or
//! burned their whole per-tick budget) and the normal remainder. The
//! remainder is serviced first so fast consumers can't starve slow ones;
//! between ingest reads only the fast prefix gets extra passes.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::buffer::BufferQueue;
use crate::format::FormatPlugin;
use crate::transport::TransportError;

use super::listener::{Cursor, Listener};
use super::SourceState;

/// Per-tick work caps for one listener
///
/// Tuning knobs, not correctness invariants. The defaults are the
/// empirical values the fan-out has always run with: enough to keep a
/// healthy listener at the live edge, small enough that one fat pipe
/// can't monopolize a tick.
#[derive(Debug, Clone)]
pub struct FanoutBudget {
    /// Max transport writes per listener per tick
    pub max_writes_per_tick: usize,
    /// Max bytes per listener per tick
    pub max_bytes_per_tick: usize,
}

impl Default for FanoutBudget {
    fn default() -> Self {
        Self {
            max_writes_per_tick: 20,
            max_bytes_per_tick: 20_000,
        }
    }
}

/// Why a listener was dropped during servicing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoveReason {
    /// Transport reported a hard error
    TransportClosed,
    /// Cursor still on the head chunk while the queue is overflowing
    FellBehind,
}

/// Result of servicing one listener for one tick
enum ServiceOutcome {
    /// Caught up with the tail; goes to the fast prefix
    Drained,
    /// Burned the whole tick budget with data left; also fast
    BudgetExhausted,
    /// Transport would block or no start point yet; normal remainder
    Blocked,
    /// Drop the listener
    Remove(RemoveReason),
}

/// Counters a tick hands back to the source wrapper
#[derive(Debug, Default)]
pub(crate) struct ServiceReport {
    pub promoted: usize,
    pub removed: usize,
}

impl SourceState {
    /// Move pending listeners onto the active list
    ///
    /// New cursors start at the nearest sync point at or after the burst
    /// pointer, never mid-frame. On a file-backed source the listener
    /// starts at the content's own offset 0 instead.
    pub(crate) fn promote_pending(&mut self) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for mut listener in pending {
            if self.intro.is_some() && self.queue.is_empty() {
                listener.intro_offset = Some(0);
            } else if listener.cursor.is_none() {
                listener.cursor = find_start(&self.queue, self.burst_seq);
            }
            // joins the normal remainder; earns its fast slot by draining
            self.active.push(listener);
        }
        debug!(count = count, "Promoted pending listeners");
        count
    }

    /// Drain queue data into listener transports
    ///
    /// With `fast_only` set, services just the fast prefix, the cheap
    /// pass run between ingest reads. A full pass services the normal
    /// remainder first, then re-partitions.
    pub(crate) fn service_listeners(
        &mut self,
        mut fmt: Option<&mut (dyn FormatPlugin + 'static)>,
        fast_only: bool,
    ) -> ServiceReport {
        let mut report = ServiceReport::default();
        if self.active.is_empty() {
            return report;
        }
        let overflow = self.overflow;
        let old = std::mem::take(&mut self.active);
        let fast_len = self.first_normal.min(old.len());

        let mut iter = old.into_iter();
        let prev_fast: Vec<Listener> = iter.by_ref().take(fast_len).collect();
        let prev_normal: Vec<Listener> = iter.collect();

        let mut fast: Vec<Listener> = Vec::new();
        let mut normal: Vec<Listener> = Vec::new();

        if fast_only {
            // the normal remainder keeps its place unserviced this pass
            normal = prev_normal;
            for mut listener in prev_fast {
                let plugin = fmt.as_deref_mut();
                match service_one(
                    &mut listener,
                    &self.queue,
                    self.burst_seq,
                    self.intro.as_ref(),
                    plugin,
                    &self.budget,
                    overflow,
                ) {
                    ServiceOutcome::Drained | ServiceOutcome::BudgetExhausted => {
                        fast.push(listener)
                    }
                    ServiceOutcome::Blocked => normal.push(listener),
                    ServiceOutcome::Remove(reason) => {
                        remove_listener(listener, reason);
                        report.removed += 1;
                    }
                }
            }
        } else {
            // normal remainder first, then the previous fast prefix
            for mut listener in prev_normal.into_iter().chain(prev_fast) {
                let plugin = fmt.as_deref_mut();
                match service_one(
                    &mut listener,
                    &self.queue,
                    self.burst_seq,
                    self.intro.as_ref(),
                    plugin,
                    &self.budget,
                    overflow,
                ) {
                    ServiceOutcome::Drained | ServiceOutcome::BudgetExhausted => {
                        fast.push(listener)
                    }
                    ServiceOutcome::Blocked => normal.push(listener),
                    ServiceOutcome::Remove(reason) => {
                        remove_listener(listener, reason);
                        report.removed += 1;
                    }
                }
            }
        }

        self.first_normal = fast.len();
        fast.extend(normal);
        self.active = fast;
        report
    }

    /// Reclaim head chunks now that every cursor has settled for this tick
    pub(crate) fn trim_queue(&mut self) -> usize {
        let released = self.queue.trim(self.burst_seq);
        if released > 0 {
            debug!(released = released, queued = self.queue.len_bytes(), "Trimmed queue");
        }
        self.overflow = false;
        released
    }
}

/// Locate the nearest safe start position for a fresh cursor
fn find_start(queue: &BufferQueue, burst_seq: u64) -> Option<Cursor> {
    let head = queue.head_seq()?;
    let tail = queue.tail_seq()?;
    let mut seq = burst_seq.max(head);
    while seq <= tail {
        if let Some(chunk) = queue.get(seq) {
            if chunk.sync_point {
                return Some(Cursor { chunk, pos: 0 });
            }
        }
        seq += 1;
    }
    None
}

fn remove_listener(mut listener: Listener, reason: RemoveReason) {
    match reason {
        RemoveReason::TransportClosed => {
            debug!(listener = listener.id, "Removing listener, transport closed")
        }
        RemoveReason::FellBehind => warn!(
            listener = listener.id,
            peer = %listener.transport.peer_label(),
            "Listener fell too far behind, removing"
        ),
    }
    listener.transport.close();
}

/// Service one listener within its tick budget
fn service_one(
    listener: &mut Listener,
    queue: &BufferQueue,
    burst_seq: u64,
    intro: Option<&Bytes>,
    mut fmt: Option<&mut (dyn FormatPlugin + 'static)>,
    budget: &FanoutBudget,
    overflow: bool,
) -> ServiceOutcome {
    let mut writes = 0usize;
    let mut written = 0usize;

    // protocol preamble drains before any stream data
    while let Some(preamble) = listener.preamble.as_ref() {
        if listener.preamble_pos >= preamble.len() {
            listener.preamble = None;
            listener.preamble_pos = 0;
            break;
        }
        match listener.transport.try_write(&preamble[listener.preamble_pos..]) {
            Ok(n) => {
                listener.preamble_pos += n;
                writes += 1;
                written += n;
            }
            Err(TransportError::WouldBlock) => return ServiceOutcome::Blocked,
            Err(TransportError::Closed(_)) => {
                return ServiceOutcome::Remove(RemoveReason::TransportClosed)
            }
        }
        if writes >= budget.max_writes_per_tick || written >= budget.max_bytes_per_tick {
            return ServiceOutcome::BudgetExhausted;
        }
    }

    // file-backed intro content loops; there is no tail to catch up with
    if let (Some(offset), Some(content)) = (listener.intro_offset, intro) {
        if content.is_empty() {
            return ServiceOutcome::Blocked;
        }
        let mut offset = offset % content.len();
        loop {
            match listener.transport.try_write(&content[offset..]) {
                Ok(n) => {
                    offset = (offset + n) % content.len();
                    listener.sent_bytes += n as u64;
                    writes += 1;
                    written += n;
                }
                Err(TransportError::WouldBlock) => {
                    listener.intro_offset = Some(offset);
                    return ServiceOutcome::Blocked;
                }
                Err(TransportError::Closed(_)) => {
                    return ServiceOutcome::Remove(RemoveReason::TransportClosed);
                }
            }
            if writes >= budget.max_writes_per_tick || written >= budget.max_bytes_per_tick {
                listener.intro_offset = Some(offset);
                return ServiceOutcome::BudgetExhausted;
            }
        }
    }

    // late joiners pick up a cursor once a sync point exists
    if listener.cursor.is_none() {
        listener.cursor = find_start(queue, burst_seq);
        if listener.cursor.is_none() {
            return ServiceOutcome::Blocked;
        }
    }

    let mut outcome = ServiceOutcome::BudgetExhausted;
    while writes < budget.max_writes_per_tick && written < budget.max_bytes_per_tick {
        let Some(cursor) = listener.cursor.as_mut() else {
            break;
        };
        if cursor.pos >= cursor.chunk.len() {
            match queue.get(cursor.chunk.seq + 1) {
                Some(next) => {
                    // advance releases the old handle before taking the new
                    *cursor = Cursor {
                        chunk: next,
                        pos: 0,
                    };
                }
                None => {
                    outcome = ServiceOutcome::Drained;
                    break;
                }
            }
            continue;
        }
        let result = match fmt.as_deref_mut() {
            Some(plugin) => plugin.serialize(&cursor.chunk, cursor.pos, listener.transport.as_mut()),
            None => listener.transport.try_write(&cursor.chunk.data[cursor.pos..]),
        };
        match result {
            Ok(n) => {
                cursor.pos += n;
                listener.sent_bytes += n as u64;
                writes += 1;
                written += n;
            }
            Err(TransportError::WouldBlock) => {
                outcome = ServiceOutcome::Blocked;
                break;
            }
            Err(TransportError::Closed(_)) => {
                return ServiceOutcome::Remove(RemoveReason::TransportClosed);
            }
        }
    }

    // the head is about to be reclaimed; anyone still on it has lost
    if overflow {
        if let (Some(cursor), Some(head)) = (listener.cursor.as_ref(), queue.head_seq()) {
            if cursor.chunk.seq == head {
                return ServiceOutcome::Remove(RemoveReason::FellBehind);
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountLimits;
    use crate::format::StreamUnit;
    use crate::transport::SinkTransport;

    fn state_with_limits(queue_limit: usize, burst: usize) -> SourceState {
        SourceState::new(
            MountLimits {
                queue_size_limit: queue_limit,
                burst_size: burst,
                ..MountLimits::default()
            },
            None,
        )
    }

    fn unit(len: usize, sync: bool) -> StreamUnit {
        StreamUnit {
            data: Bytes::from(vec![0x55u8; len]),
            sync_point: sync,
            metadata: None,
        }
    }

    fn sink_listener() -> Listener {
        Listener::new(Box::new(SinkTransport::new()))
    }

    #[test]
    fn test_promoted_listener_starts_at_sync_point() {
        let mut state = state_with_limits(1 << 20, 1 << 16);
        state.ingest_unit(unit(100, false));
        state.ingest_unit(unit(100, true));
        state.ingest_unit(unit(100, false));

        state.pending.push(sink_listener());
        state.promote_pending();

        let cursor = state.active[0].cursor.as_ref().expect("cursor assigned");
        assert_eq!(cursor.chunk.seq, 1, "skipped the non-sync chunk");
        assert_eq!(cursor.pos, 0);
    }

    #[test]
    fn test_drained_listener_received_everything_from_start() {
        let mut state = state_with_limits(1 << 20, 1 << 16);
        for _ in 0..3 {
            state.ingest_unit(unit(50, true));
        }
        state.pending.push(sink_listener());
        state.promote_pending();

        let report = state.service_listeners(None, false);
        assert_eq!(report.removed, 0);
        assert_eq!(state.first_normal, 1, "caught-up listener is fast");
        assert_eq!(state.active[0].sent_bytes, 150);
    }

    #[test]
    fn test_blocked_listener_never_starves_fast_one() {
        let mut state = state_with_limits(1 << 20, 1 << 16);
        state.ingest_unit(unit(50, true));

        state.pending.push(sink_listener());
        state
            .pending
            .push(Listener::new(Box::new(SinkTransport::always_blocked())));
        state.promote_pending();

        for _ in 0..5 {
            state.ingest_unit(unit(50, true));
            state.service_listeners(None, false);
        }

        // both still attached: blocked one skipped, fast one at the tail
        assert_eq!(state.active.len(), 2);
        assert_eq!(state.first_normal, 1);
        let fast = &state.active[0];
        assert_eq!(fast.sent_bytes, 300);
        let blocked = &state.active[1];
        assert_eq!(blocked.sent_bytes, 0);
    }

    #[test]
    fn test_budget_caps_one_tick() {
        let mut state = state_with_limits(1 << 20, 1 << 16);
        state.budget = FanoutBudget {
            max_writes_per_tick: 2,
            max_bytes_per_tick: 1 << 20,
        };
        for _ in 0..5 {
            state.ingest_unit(unit(10, true));
        }
        state.pending.push(sink_listener());
        state.promote_pending();

        state.service_listeners(None, false);
        assert_eq!(state.active[0].sent_bytes, 20, "two writes only");
        assert_eq!(state.first_normal, 1, "budget burner counts as fast");
    }

    #[test]
    fn test_overflow_evicts_listener_stuck_on_head() {
        let mut state = state_with_limits(200, 50);
        state.ingest_unit(unit(100, true));

        // listener takes a cursor on the head chunk and then blocks forever
        state
            .pending
            .push(Listener::new(Box::new(SinkTransport::always_blocked())));
        state.promote_pending();
        state.service_listeners(None, false);

        // push the queue past its limit
        state.ingest_unit(unit(100, true));
        state.ingest_unit(unit(100, true));
        assert!(state.overflow);

        let report = state.service_listeners(None, false);
        assert_eq!(report.removed, 1);
        assert!(state.active.is_empty());

        state.trim_queue();
        assert!(state.queue.len_bytes() <= 200);
        assert!(!state.overflow);
    }

    #[test]
    fn test_preamble_flushes_before_stream_data() {
        let mut state = state_with_limits(1 << 20, 1 << 16);
        state.ingest_unit(unit(10, true));
        state.pending.push(Listener::with_preamble(
            Box::new(SinkTransport::new()),
            Bytes::from_static(b"HDR\r\n\r\n"),
        ));
        state.promote_pending();
        state.service_listeners(None, false);

        let l = &state.active[0];
        assert!(!l.mid_preamble());
        assert_eq!(l.sent_bytes, 10, "preamble bytes not counted as stream");
    }

    #[test]
    fn test_intro_content_loops_from_offset_zero() {
        let mut state = state_with_limits(1 << 20, 1 << 16);
        state.budget = FanoutBudget {
            max_writes_per_tick: 3,
            max_bytes_per_tick: 1 << 20,
        };
        state.intro = Some(Bytes::from_static(b"abc"));
        state.pending.push(sink_listener());
        state.promote_pending();
        assert_eq!(state.active[0].intro_offset, Some(0));

        let report = state.service_listeners(None, false);
        assert_eq!(report.removed, 0);
        assert_eq!(state.active[0].sent_bytes, 9, "looped three times");
    }

    #[test]
    fn test_servicing_through_format_plugin() {
        use crate::format::RawFormat;

        let mut state = state_with_limits(1 << 20, 1 << 16);
        state.format = Some(Box::new(RawFormat::new()));
        state.ingest_unit(unit(50, true));
        state.pending.push(sink_listener());
        state.promote_pending();

        // take/serve/restore, the way a tick threads the plugin through
        let mut fmt = state.format.take();
        let report = state.service_listeners(fmt.as_deref_mut(), false);
        state.format = fmt;

        assert_eq!(report.removed, 0);
        assert_eq!(state.active[0].sent_bytes, 50, "delivered via the plugin");
        assert!(state.format.is_some(), "plugin handed back after the pass");
    }

    #[test]
    fn test_fast_only_pass_skips_normal_remainder() {
        let mut state = state_with_limits(1 << 20, 1 << 16);
        state.ingest_unit(unit(50, true));
        state.pending.push(sink_listener());
        state.promote_pending();
        state.service_listeners(None, false);
        assert_eq!(state.first_normal, 1);

        // a second listener joins the normal remainder
        state.pending.push(sink_listener());
        state.promote_pending();

        state.ingest_unit(unit(50, true));
        state.service_listeners(None, true);

        assert_eq!(state.active[0].sent_bytes, 100, "fast listener serviced");
        // the new one waits for the next full pass
        let waiting = state.active.iter().find(|l| l.sent_bytes < 100).unwrap();
        assert_eq!(waiting.sent_bytes, 0);
    }
}
