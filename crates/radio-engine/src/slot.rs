//! A single playback slot: bookkeeping around one media element.
//!
//! The slot owns no I/O.  The pool feeds it raw `MediaEvent`s and it answers
//! with normalized `SlotEvent`s, updating its own state and metrics on the way.
//! A pending load is signalled through a per-load channel so the pool can await
//! readiness without holding the pool lock.

use std::time::Duration;

use radio_proto::protocol::{OpId, StationId};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::MediaError;
use crate::media::{MediaEvent, MediaSource};
use crate::source::ProxyRewrite;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotState {
    Idle,
    Loading,
    MetadataReady,
    Loaded,
    Ready,
    Playing,
    Paused,
    Waiting,
    Stalled,
    Error,
    Aborted,
    Ended,
}

impl SlotState {
    /// Buffered enough to start without another network round trip.
    pub fn is_ready_like(&self) -> bool {
        matches!(self, SlotState::Ready | SlotState::Paused | SlotState::Playing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Good,
    Unstable,
    Poor,
    Critical,
}

impl ConnectionQuality {
    fn from_failures(failures: u32) -> Self {
        match failures {
            0 => ConnectionQuality::Good,
            1 => ConnectionQuality::Unstable,
            2 | 3 => ConnectionQuality::Poor,
            _ => ConnectionQuality::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotEventKind {
    Loading,
    Metadata,
    Loaded,
    Ready,
    Playing,
    Paused,
    Waiting,
    Stalled,
    Error,
    Ended,
    Aborted,
}

/// Normalized lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotEvent {
    pub kind: SlotEventKind,
    pub index: usize,
    pub state: SlotState,
    pub previous_state: SlotState,
    pub station_id: Option<StationId>,
    pub op_id: Option<OpId>,
    pub error: Option<MediaError>,
}

/// What a pending load hears from its slot.
#[derive(Debug)]
pub(crate) enum LoadSignal {
    /// Buffered range grew without readiness.
    Progress,
    /// First data arrived after this long.
    FirstByte(Duration),
    Done(Result<(), MediaError>),
}

/// Snapshot of the fields the watchdog needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotMetrics {
    pub state: SlotState,
    pub op_id: Option<OpId>,
    pub station_id: Option<StationId>,
    pub is_hls: bool,
    pub position: f64,
    pub buffered_end: f64,
}

impl SlotMetrics {
    pub fn buffered_ahead(&self) -> f64 {
        (self.buffered_end - self.position).max(0.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub index: usize,
    pub state: SlotState,
    pub station_id: Option<StationId>,
    pub op_id: Option<OpId>,
    pub is_preload: bool,
    pub is_hls: bool,
    pub error_count: u32,
    pub recovery_attempt: u32,
    pub connection_quality: ConnectionQuality,
    pub buffered_ahead_seconds: f64,
    pub play_intended: bool,
    pub volume: f32,
}

#[derive(Debug)]
pub struct PlaybackSlot {
    pub(crate) index: usize,
    pub(crate) state: SlotState,
    pub(crate) station_id: Option<StationId>,
    pub(crate) op_id: Option<OpId>,
    pub(crate) is_preload: bool,
    pub(crate) is_hls: bool,
    pub(crate) error_count: u32,
    pub(crate) recovery_attempt: u32,
    pub(crate) connection_quality: ConnectionQuality,
    pub(crate) last_used: Instant,
    pub(crate) play_intended: bool,
    pub(crate) volume: f32,
    /// Original (unresolved) source URL of the current assignment.
    pub(crate) url: Option<String>,
    pub(crate) load_attempts: u32,
    /// Bumped every time the slot is (re)assigned or reset.
    pub(crate) epoch: u64,
    position: f64,
    buffered_end: f64,
    last_progress: Option<Instant>,
    last_error_at: Option<Instant>,
    load_started_at: Option<Instant>,
    first_byte_seen: bool,
    pending: Option<mpsc::UnboundedSender<LoadSignal>>,
}

impl PlaybackSlot {
    pub fn new(index: usize, now: Instant) -> Self {
        Self {
            index,
            state: SlotState::Idle,
            station_id: None,
            op_id: None,
            is_preload: false,
            is_hls: false,
            error_count: 0,
            recovery_attempt: 0,
            connection_quality: ConnectionQuality::Good,
            last_used: now,
            play_intended: false,
            volume: 1.0,
            url: None,
            load_attempts: 0,
            epoch: 0,
            position: 0.0,
            buffered_end: 0.0,
            last_progress: None,
            last_error_at: None,
            load_started_at: None,
            first_byte_seen: false,
            pending: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn station_id(&self) -> Option<StationId> {
        self.station_id
    }

    pub fn op_id(&self) -> Option<OpId> {
        self.op_id
    }

    pub fn last_progress(&self) -> Option<Instant> {
        self.last_progress
    }

    pub fn buffered_ahead_seconds(&self) -> f64 {
        (self.buffered_end - self.position).max(0.0)
    }

    pub fn metrics(&self) -> SlotMetrics {
        SlotMetrics {
            state: self.state,
            op_id: self.op_id,
            station_id: self.station_id,
            is_hls: self.is_hls,
            position: self.position,
            buffered_end: self.buffered_end,
        }
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            index: self.index,
            state: self.state,
            station_id: self.station_id,
            op_id: self.op_id,
            is_preload: self.is_preload,
            is_hls: self.is_hls,
            error_count: self.error_count,
            recovery_attempt: self.recovery_attempt,
            connection_quality: self.connection_quality,
            buffered_ahead_seconds: self.buffered_ahead_seconds(),
            play_intended: self.play_intended,
            volume: self.volume,
        }
    }

    /// Bind a new source.  A load still pending on this slot is told it was
    /// aborted first, so its waiter can never observe this load's outcome.
    ///
    /// `reassign` is false for reconnects of the same assignment: the epoch
    /// and station context are kept.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn begin_load(
        &mut self,
        source: &MediaSource,
        station_id: StationId,
        op_id: Option<OpId>,
        preload: bool,
        reassign: bool,
        proxy: &ProxyRewrite,
        now: Instant,
    ) -> (MediaSource, mpsc::UnboundedReceiver<LoadSignal>) {
        self.abort_pending("superseded by a new load");

        if self.url.as_deref() == Some(source.url.as_str()) && self.station_id == Some(station_id) {
            self.load_attempts += 1;
        } else {
            self.load_attempts = 1;
        }

        if reassign {
            self.epoch += 1;
            self.error_count = 0;
            self.recovery_attempt = 0;
            self.connection_quality = ConnectionQuality::Good;
            self.play_intended = false;
        }

        self.station_id = Some(station_id);
        self.op_id = op_id;
        self.is_preload = preload;
        self.is_hls = source.hls;
        self.url = Some(source.url.clone());
        self.last_used = now;
        self.position = 0.0;
        self.buffered_end = 0.0;
        self.last_progress = None;
        self.load_started_at = Some(now);
        self.first_byte_seen = false;
        self.set_state(SlotState::Loading);

        let (tx, rx) = mpsc::unbounded_channel();
        self.pending = Some(tx);

        let resolved = MediaSource {
            url: proxy.resolve(&source.url, self.load_attempts),
            hls: source.hls,
        };
        (resolved, rx)
    }

    /// Continue the attempt count of an earlier failed load of the same
    /// source, which may have run on another slot or before a reset.
    pub(crate) fn carry_attempts(&mut self, url: &str, station_id: StationId, attempts: u32) {
        if attempts == 0 {
            return;
        }
        let same = self.url.as_deref() == Some(url) && self.station_id == Some(station_id);
        let current = if same { self.load_attempts } else { 0 };
        self.url = Some(url.to_string());
        self.station_id = Some(station_id);
        self.load_attempts = current.max(attempts);
    }

    /// Back to a blank idle slot.
    pub(crate) fn reset(&mut self) {
        self.abort_pending("slot reset");
        self.epoch += 1;
        self.state = SlotState::Idle;
        self.station_id = None;
        self.op_id = None;
        self.is_preload = false;
        self.is_hls = false;
        self.error_count = 0;
        self.recovery_attempt = 0;
        self.connection_quality = ConnectionQuality::Good;
        self.play_intended = false;
        self.url = None;
        self.load_attempts = 0;
        self.position = 0.0;
        self.buffered_end = 0.0;
        self.last_progress = None;
        self.last_error_at = None;
        self.load_started_at = None;
        self.first_byte_seen = false;
    }

    pub(crate) fn set_recovery_attempt(&mut self, attempt: u32) {
        self.recovery_attempt = attempt;
        self.update_quality();
    }

    pub(crate) fn mark_stalled(&mut self) {
        self.set_state(SlotState::Stalled);
    }

    fn abort_pending(&mut self, why: &str) {
        if let Some(tx) = self.pending.take() {
            let _ = tx.send(LoadSignal::Done(Err(MediaError::aborted(why))));
        }
    }

    fn resolve_pending(&mut self, result: Result<(), MediaError>) {
        if let Some(tx) = self.pending.take() {
            let _ = tx.send(LoadSignal::Done(result));
        }
    }

    fn signal_pending(&self, signal: LoadSignal) {
        if let Some(tx) = &self.pending {
            let _ = tx.send(signal);
        }
    }

    fn note_first_byte(&mut self, now: Instant) {
        if self.first_byte_seen {
            return;
        }
        self.first_byte_seen = true;
        if let Some(started) = self.load_started_at {
            self.signal_pending(LoadSignal::FirstByte(now.saturating_duration_since(started)));
        }
    }

    fn update_quality(&mut self) {
        self.connection_quality =
            ConnectionQuality::from_failures(self.error_count.max(self.recovery_attempt));
    }

    fn set_state(&mut self, state: SlotState) -> SlotState {
        let previous = self.state;
        self.state = state;
        previous
    }

    fn event(&self, kind: SlotEventKind, previous_state: SlotState) -> SlotEvent {
        SlotEvent {
            kind,
            index: self.index,
            state: self.state,
            previous_state,
            station_id: self.station_id,
            op_id: self.op_id,
            error: None,
        }
    }

    fn transition(&mut self, state: SlotState, kind: SlotEventKind) -> Option<SlotEvent> {
        let previous = self.set_state(state);
        Some(self.event(kind, previous))
    }

    /// Feed one raw element event.  Returns the normalized event, if any.
    pub(crate) fn apply(
        &mut self,
        event: MediaEvent,
        now: Instant,
        error_debounce: Duration,
    ) -> Option<SlotEvent> {
        if self.url.is_none() && !matches!(event, MediaEvent::Error(_) | MediaEvent::Abort) {
            // A blank slot has nothing to report; late events from a previous
            // source land here after a reset.
            trace!("slot {}: dropping {:?} on unbound slot", self.index, event);
            return None;
        }

        match event {
            MediaEvent::LoadStart => self.transition(SlotState::Loading, SlotEventKind::Loading),
            MediaEvent::LoadedMetadata => {
                self.note_first_byte(now);
                self.transition(SlotState::MetadataReady, SlotEventKind::Metadata)
            }
            MediaEvent::LoadedData => self.transition(SlotState::Loaded, SlotEventKind::Loaded),
            MediaEvent::CanPlay => {
                self.resolve_pending(Ok(()));
                if self.state == SlotState::Playing {
                    return None;
                }
                self.transition(SlotState::Ready, SlotEventKind::Ready)
            }
            MediaEvent::Playing => {
                self.resolve_pending(Ok(()));
                self.last_progress = Some(now);
                self.transition(SlotState::Playing, SlotEventKind::Playing)
            }
            MediaEvent::Pause => self.transition(SlotState::Paused, SlotEventKind::Paused),
            MediaEvent::Waiting => self.transition(SlotState::Waiting, SlotEventKind::Waiting),
            MediaEvent::Stalled => {
                let previous = self.state;
                // Informational: readiness is decided by the watchdog, so the
                // slot keeps its state unless it was already waiting.
                if self.state == SlotState::Waiting {
                    self.state = SlotState::Stalled;
                }
                Some(self.event(SlotEventKind::Stalled, previous))
            }
            MediaEvent::TimeUpdate { position } => {
                if position > self.position {
                    self.last_progress = Some(now);
                }
                self.position = position;
                None
            }
            MediaEvent::Progress { buffered_end } => {
                if buffered_end > self.buffered_end {
                    self.last_progress = Some(now);
                    self.note_first_byte(now);
                    self.signal_pending(LoadSignal::Progress);
                }
                self.buffered_end = buffered_end;
                None
            }
            MediaEvent::Error(err) => {
                if self.url.is_none() {
                    debug!("slot {}: ignoring error without a bound source: {}", self.index, err);
                    return None;
                }
                if let Some(last) = self.last_error_at {
                    if now.saturating_duration_since(last) < error_debounce {
                        trace!("slot {}: debounced repeated error: {}", self.index, err);
                        return None;
                    }
                }
                self.last_error_at = Some(now);
                self.error_count += 1;
                self.update_quality();
                self.resolve_pending(Err(err.clone()));
                let previous = self.set_state(SlotState::Error);
                let mut ev = self.event(SlotEventKind::Error, previous);
                ev.error = Some(err);
                Some(ev)
            }
            MediaEvent::Ended => self.transition(SlotState::Ended, SlotEventKind::Ended),
            MediaEvent::Abort => {
                if self.url.is_none() {
                    return None;
                }
                self.resolve_pending(Err(MediaError::aborted("load aborted by element")));
                self.transition(SlotState::Aborted, SlotEventKind::Aborted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaErrorKind;

    const DEBOUNCE: Duration = Duration::from_millis(500);

    fn bound_slot(now: Instant) -> (PlaybackSlot, mpsc::UnboundedReceiver<LoadSignal>) {
        let mut slot = PlaybackSlot::new(0, now);
        let source = MediaSource {
            url: "http://radio.example/live".into(),
            hls: false,
        };
        let (_, rx) = slot.begin_load(&source, 7, Some(OpId(1)), false, true, &ProxyRewrite::default(), now);
        (slot, rx)
    }

    #[test]
    fn unbound_slot_ignores_errors() {
        let now = Instant::now();
        let mut slot = PlaybackSlot::new(0, now);
        let ev = slot.apply(MediaEvent::Error(MediaError::network("boom")), now, DEBOUNCE);
        assert!(ev.is_none());
        assert_eq!(slot.error_count, 0);
        assert_eq!(slot.state(), SlotState::Idle);
    }

    #[test]
    fn repeated_errors_are_debounced() {
        let now = Instant::now();
        let (mut slot, _rx) = bound_slot(now);
        let err = MediaError::network("reset");

        assert!(slot.apply(MediaEvent::Error(err.clone()), now, DEBOUNCE).is_some());
        assert!(slot
            .apply(MediaEvent::Error(err.clone()), now + Duration::from_millis(200), DEBOUNCE)
            .is_none());
        assert_eq!(slot.error_count, 1);

        let later = slot.apply(MediaEvent::Error(err), now + Duration::from_millis(800), DEBOUNCE);
        assert_eq!(later.map(|e| e.kind), Some(SlotEventKind::Error));
        assert_eq!(slot.error_count, 2);
        assert_eq!(slot.connection_quality, ConnectionQuality::Poor);
    }

    #[test]
    fn events_carry_context() {
        let now = Instant::now();
        let (mut slot, _rx) = bound_slot(now);
        let ev = slot.apply(MediaEvent::CanPlay, now, DEBOUNCE).unwrap();
        assert_eq!(ev.kind, SlotEventKind::Ready);
        assert_eq!(ev.previous_state, SlotState::Loading);
        assert_eq!(ev.station_id, Some(7));
        assert_eq!(ev.op_id, Some(OpId(1)));
    }

    #[test]
    fn new_load_aborts_the_stale_one() {
        let now = Instant::now();
        let (mut slot, mut first) = bound_slot(now);
        let source = MediaSource {
            url: "http://radio.example/other".into(),
            hls: false,
        };
        let (_, mut second) = slot.begin_load(&source, 8, Some(OpId(2)), false, true, &ProxyRewrite::default(), now);

        match first.try_recv() {
            Ok(LoadSignal::Done(Err(e))) => assert_eq!(e.kind, MediaErrorKind::Aborted),
            other => panic!("unexpected {other:?}"),
        }

        slot.apply(MediaEvent::CanPlay, now, DEBOUNCE);
        assert!(matches!(second.try_recv(), Ok(LoadSignal::Done(Ok(())))));
    }

    #[test]
    fn same_url_counts_attempts() {
        let now = Instant::now();
        let (mut slot, _rx) = bound_slot(now);
        let source = MediaSource {
            url: "http://radio.example/live".into(),
            hls: false,
        };
        let (resolved, _rx2) =
            slot.begin_load(&source, 7, Some(OpId(1)), false, false, &ProxyRewrite::default(), now);
        assert_eq!(slot.load_attempts, 2);
        assert!(resolved.url.contains("_cb="));
    }

    #[test]
    fn carried_attempts_survive_a_reset() {
        let now = Instant::now();
        let mut slot = PlaybackSlot::new(1, now);
        let source = MediaSource {
            url: "http://radio.example/live".into(),
            hls: false,
        };
        slot.carry_attempts(&source.url, 7, 2);
        let (resolved, _rx) =
            slot.begin_load(&source, 7, Some(OpId(3)), false, true, &ProxyRewrite::default(), now);
        assert_eq!(slot.load_attempts, 3);
        assert!(resolved.url.contains("_cb="));

        slot.reset();
        slot.carry_attempts(&source.url, 7, 0);
        let (resolved, _rx) =
            slot.begin_load(&source, 7, Some(OpId(4)), false, true, &ProxyRewrite::default(), now);
        assert_eq!(slot.load_attempts, 1);
        assert_eq!(resolved.url, source.url);
    }

    #[test]
    fn progress_feeds_the_pending_load() {
        let now = Instant::now();
        let (mut slot, mut rx) = bound_slot(now);
        slot.apply(
            MediaEvent::Progress { buffered_end: 1.5 },
            now + Duration::from_secs(4),
            DEBOUNCE,
        );
        assert!(matches!(rx.try_recv(), Ok(LoadSignal::FirstByte(d)) if d == Duration::from_secs(4)));
        assert!(matches!(rx.try_recv(), Ok(LoadSignal::Progress)));
        // no growth, no signal
        slot.apply(MediaEvent::Progress { buffered_end: 1.5 }, now, DEBOUNCE);
        assert!(rx.try_recv().is_err());
        assert!((slot.buffered_ahead_seconds() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn reset_clears_everything() {
        let now = Instant::now();
        let (mut slot, _rx) = bound_slot(now);
        let epoch = slot.epoch;
        slot.reset();
        assert_eq!(slot.state(), SlotState::Idle);
        assert_eq!(slot.station_id(), None);
        assert_eq!(slot.op_id(), None);
        assert!(slot.epoch > epoch);
    }
}
