//! Fixed-size pool of playback slots.
//!
//! The pool is the only place that marks a slot active.  All slot bookkeeping
//! lives behind one mutex that is never held across an await on a media
//! element; indices mid-transition are kept out of allocation by a
//! reservation count instead.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use radio_proto::config::EngineConfig;
use radio_proto::protocol::{is_hls_url, OpId, Station, StationId};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crossfade::{Crossfade, FadeOutcome, FadeSide};
use crate::error::{EngineError, MediaError, Result};
use crate::media::{MediaBackend, MediaElement, MediaEvent, MediaEventSink, MediaSource, MixGraph};
use crate::slot::{LoadSignal, PlaybackSlot, SlotEvent, SlotMetrics, SlotSnapshot, SlotState};
use crate::source::ProxyRewrite;

/// Extra load budget each time the buffered range grows without readiness.
pub const PROGRESS_EXTENSION: Duration = Duration::from_secs(5);
/// First-byte latency above this earns a one-off extension.
pub const SLOW_FIRST_BYTE: Duration = Duration::from_secs(3);
pub const SLOW_FIRST_BYTE_EXTENSION: Duration = Duration::from_secs(10);
/// How long a new switch waits after cancelling the one in flight.
const SUPERSEDE_GRACE: Duration = Duration::from_millis(50);

/// Adaptive load timeout.
#[derive(Debug, Clone)]
pub struct LoadDeadline {
    started: Instant,
    budget: Duration,
    cap: Duration,
    slow_start_extended: bool,
}

impl LoadDeadline {
    pub fn new(started: Instant, base: Duration, cap: Duration) -> Self {
        Self {
            started,
            budget: base.min(cap),
            cap: cap.max(base),
            slow_start_extended: false,
        }
    }

    /// A deadline that never extends.
    pub fn fixed(started: Instant, timeout: Duration) -> Self {
        Self::new(started, timeout, timeout)
    }

    pub fn at(&self) -> Instant {
        self.started + self.budget
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn on_progress(&mut self) {
        self.budget = (self.budget + PROGRESS_EXTENSION).min(self.cap);
    }

    pub fn on_first_byte(&mut self, latency: Duration) {
        if latency > SLOW_FIRST_BYTE && !self.slow_start_extended {
            self.slow_start_extended = true;
            self.budget = (self.budget + SLOW_FIRST_BYTE_EXTENSION).min(self.cap);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectMode {
    /// Reload the source into the existing decode pipeline.
    Soft,
    /// Rebuild the pipeline first.
    Hard,
}

impl ReconnectMode {
    pub fn for_attempt(attempt: u32) -> Self {
        if attempt <= 1 {
            ReconnectMode::Soft
        } else {
            ReconnectMode::Hard
        }
    }
}

impl fmt::Display for ReconnectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectMode::Soft => f.write_str("soft"),
            ReconnectMode::Hard => f.write_str("hard"),
        }
    }
}

/// What a successful switch hands back.
#[derive(Clone)]
pub struct PlaybackHandle {
    pub slot: usize,
    pub station_id: StationId,
    pub op_id: OpId,
    pub element: Arc<dyn MediaElement>,
    /// Whether the slot's output goes through the mix graph.
    pub mixed: bool,
}

impl fmt::Debug for PlaybackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackHandle")
            .field("slot", &self.slot)
            .field("station_id", &self.station_id)
            .field("op_id", &self.op_id)
            .field("mixed", &self.mixed)
            .finish()
    }
}

#[derive(Debug)]
struct StationLoad {
    index: usize,
    ticket: u64,
    token: CancellationToken,
}

#[derive(Debug)]
pub(crate) struct PoolInner {
    slots: Vec<PlaybackSlot>,
    active: Option<usize>,
    reserved: HashMap<usize, u32>,
    loads: HashMap<StationId, StationLoad>,
    /// Attempts already spent on a station's URL by loads that failed.
    failed_loads: HashMap<StationId, (String, u32)>,
    next_ticket: u64,
}

impl PoolInner {
    fn new(size: usize, now: Instant) -> Self {
        Self {
            slots: (0..size).map(|i| PlaybackSlot::new(i, now)).collect(),
            active: None,
            reserved: HashMap::new(),
            loads: HashMap::new(),
            failed_loads: HashMap::new(),
            next_ticket: 0,
        }
    }

    fn reserve(&mut self, index: usize) {
        *self.reserved.entry(index).or_insert(0) += 1;
    }

    fn release(&mut self, index: usize) {
        if let Some(count) = self.reserved.get_mut(&index) {
            *count -= 1;
            if *count == 0 {
                self.reserved.remove(&index);
            }
        }
    }

    fn is_reserved(&self, index: usize) -> bool {
        self.reserved.contains_key(&index)
    }

    fn is_free(&self, index: usize) -> bool {
        self.active != Some(index) && !self.is_reserved(index)
    }

    fn free_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.slots.len()).filter(move |&i| self.is_free(i))
    }

    /// Pick a slot for a new load.  The flag says whether the slot still
    /// holds a source that must be evicted.
    fn allocate(&self) -> Option<(usize, bool)> {
        if let Some(i) = self.free_indices().find(|&i| {
            self.slots[i].state == SlotState::Idle && self.slots[i].station_id.is_none()
        }) {
            return Some((i, self.slots[i].url.is_some()));
        }

        if let Some(i) = self.free_indices().find(|&i| {
            matches!(self.slots[i].state, SlotState::Paused | SlotState::Ended)
        }) {
            return Some((i, true));
        }

        self.free_indices()
            .min_by_key(|&i| self.slots[i].last_used)
            .map(|i| (i, true))
    }
}

pub struct PlaybackPool {
    elements: Vec<Arc<dyn MediaElement>>,
    mix: Option<Arc<dyn MixGraph>>,
    inner: Mutex<PoolInner>,
    transition: Mutex<Option<(u64, CancellationToken)>>,
    transition_seq: AtomicU64,
    preload_gate: Semaphore,
    crossfade: Crossfade,
    proxy: ProxyRewrite,
    load_timeout: Duration,
    load_timeout_cap: Duration,
    probe_timeout: Duration,
    error_debounce: Duration,
}

impl PlaybackPool {
    /// Build the pool and one element per slot.  The receiver carries every
    /// raw element event, tagged with its slot index.
    pub fn new(
        config: &EngineConfig,
        backend: &dyn MediaBackend,
    ) -> anyhow::Result<(Arc<Self>, mpsc::UnboundedReceiver<(usize, MediaEvent)>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let size = config.pool_size.max(1);
        let elements = (0..size)
            .map(|i| backend.create(i, MediaEventSink::new(i, tx.clone())))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let pool = Self {
            elements,
            mix: backend.mix_graph(),
            inner: Mutex::new(PoolInner::new(size, Instant::now())),
            transition: Mutex::new(None),
            transition_seq: AtomicU64::new(0),
            preload_gate: Semaphore::new(1),
            crossfade: Crossfade::new(config.fade_duration(), config.fade_steps),
            proxy: ProxyRewrite::new(&config.proxy),
            load_timeout: config.load_timeout(),
            load_timeout_cap: config.load_timeout_cap(),
            probe_timeout: config.probe_timeout(),
            error_debounce: config.error_debounce(),
        };
        info!(
            "pool: {} slots, {} crossfade",
            size,
            if pool.mix.is_some() { "mixed" } else { "stepped" }
        );
        Ok((Arc::new(pool), rx))
    }

    pub fn size(&self) -> usize {
        self.elements.len()
    }

    pub fn has_mix_graph(&self) -> bool {
        self.mix.is_some()
    }

    pub fn element(&self, index: usize) -> Option<Arc<dyn MediaElement>> {
        self.elements.get(index).cloned()
    }

    pub async fn active_index(&self) -> Option<usize> {
        self.inner.lock().await.active
    }

    /// Active slot with the station / op it currently serves.
    pub async fn active_context(&self) -> Option<(usize, Option<StationId>, Option<OpId>)> {
        let inner = self.inner.lock().await;
        inner
            .active
            .map(|i| (i, inner.slots[i].station_id, inner.slots[i].op_id))
    }

    pub async fn is_reserved(&self, index: usize) -> bool {
        self.inner.lock().await.is_reserved(index)
    }

    pub async fn slot_metrics(&self, index: usize) -> Option<SlotMetrics> {
        self.inner.lock().await.slots.get(index).map(|s| s.metrics())
    }

    pub async fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.inner
            .lock()
            .await
            .slots
            .iter()
            .map(|s| s.snapshot())
            .collect()
    }

    /// Route one raw element event through its slot.
    pub async fn handle_media_event(&self, index: usize, event: MediaEvent) -> Option<SlotEvent> {
        let mut inner = self.inner.lock().await;
        let slot = inner.slots.get_mut(index)?;
        slot.apply(event, Instant::now(), self.error_debounce)
    }

    /// Mark the slot stalled if it still serves `op_id`.
    pub async fn mark_stalled(&self, index: usize, op_id: Option<OpId>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.slots.get_mut(index) {
            Some(slot) if slot.op_id == op_id && slot.station_id.is_some() => {
                slot.mark_stalled();
                true
            }
            _ => false,
        }
    }

    /// Next slot a load would use, evicting it if needed.  `None` means every
    /// slot is active or reserved.
    pub async fn get_next_available(&self) -> Option<usize> {
        let index = {
            let mut inner = self.inner.lock().await;
            let (index, evict) = inner.allocate()?;
            if !evict {
                return Some(index);
            }
            debug!("pool: evicting slot {}", index);
            inner.slots[index].reset();
            index
        };
        if let Err(e) = self.elements[index].unload().await {
            debug!("pool: unload of evicted slot {} failed: {}", index, e);
        }
        Some(index)
    }

    pub async fn load_station(
        &self,
        station: &Station,
        url: &str,
        preload: bool,
        op_id: Option<OpId>,
    ) -> Result<usize> {
        let cancel = CancellationToken::new();
        self.load_into_slot(station, url, preload, op_id, &cancel, false)
            .await
    }

    async fn load_into_slot(
        &self,
        station: &Station,
        url: &str,
        preload: bool,
        op_id: Option<OpId>,
        cancel: &CancellationToken,
        keep_reserved: bool,
    ) -> Result<usize> {
        let started = Instant::now();
        let (index, source, rx, ticket, token, epoch, evicted, attempt) = {
            let mut inner = self.inner.lock().await;

            if let Some(earlier) = inner.loads.remove(&station.id) {
                debug!(
                    "pool: cancelling earlier load of station {} on slot {}",
                    station.id, earlier.index
                );
                earlier.token.cancel();
            }

            let Some((index, evicted)) = inner.allocate() else {
                return Err(if preload {
                    EngineError::PoolExhausted
                } else {
                    EngineError::NoAvailableSlot
                });
            };
            if evicted {
                inner.slots[index].reset();
            }
            inner.reserve(index);

            let carried = inner
                .failed_loads
                .get(&station.id)
                .filter(|(failed_url, _)| failed_url == url)
                .map_or(0, |(_, attempts)| *attempts);
            inner.slots[index].carry_attempts(url, station.id, carried);

            let requested = MediaSource {
                url: url.to_string(),
                hls: is_hls_url(url),
            };
            let (source, rx) = inner.slots[index].begin_load(
                &requested,
                station.id,
                op_id,
                preload,
                true,
                &self.proxy,
                started,
            );
            let attempt = inner.slots[index].load_attempts;

            inner.next_ticket += 1;
            let ticket = inner.next_ticket;
            let token = cancel.child_token();
            inner.loads.insert(
                station.id,
                StationLoad {
                    index,
                    ticket,
                    token: token.clone(),
                },
            );
            (index, source, rx, ticket, token, inner.slots[index].epoch, evicted, attempt)
        };

        info!(
            "pool: loading station {} ({}) into slot {}{}{}",
            station.id,
            station.name,
            index,
            if preload { " [preload]" } else { "" },
            if evicted { " [evicted]" } else { "" }
        );

        let element = Arc::clone(&self.elements[index]);
        let outcome = match element.load(&source).await {
            Ok(()) => {
                let deadline = LoadDeadline::new(started, self.load_timeout, self.load_timeout_cap);
                self.await_ready(rx, &token, deadline).await
            }
            Err(e) => Err(e.into()),
        };

        let mut inner = self.inner.lock().await;
        if inner
            .loads
            .get(&station.id)
            .is_some_and(|l| l.ticket == ticket)
        {
            inner.loads.remove(&station.id);
        }

        let slot = &inner.slots[index];
        let owned = slot.epoch == epoch && slot.op_id == op_id;

        match outcome {
            Ok(()) if owned => {
                inner.failed_loads.remove(&station.id);
                if !keep_reserved {
                    inner.release(index);
                }
                debug!("pool: slot {} ready for station {}", index, station.id);
                Ok(index)
            }
            Ok(()) => {
                inner.release(index);
                debug!("pool: slot {} was reassigned during load, dropping result", index);
                Err(EngineError::Superseded)
            }
            Err(e) => {
                inner.release(index);
                if !e.is_stale() {
                    inner
                        .failed_loads
                        .insert(station.id, (url.to_string(), attempt));
                }
                let reset = owned && inner.active != Some(index);
                if reset {
                    inner.slots[index].reset();
                }
                drop(inner);
                if reset {
                    let _ = element.unload().await;
                }
                debug!("pool: load into slot {} failed: {}", index, e);
                Err(e)
            }
        }
    }

    async fn await_ready(
        &self,
        mut rx: mpsc::UnboundedReceiver<LoadSignal>,
        token: &CancellationToken,
        mut deadline: LoadDeadline,
    ) -> Result<()> {
        loop {
            let at = deadline.at();
            tokio::select! {
                _ = token.cancelled() => return Err(EngineError::Superseded),
                _ = tokio::time::sleep_until(at) => {
                    return Err(EngineError::LoadTimeout(deadline.budget()));
                }
                signal = rx.recv() => match signal {
                    Some(LoadSignal::Done(result)) => return result.map_err(EngineError::from),
                    Some(LoadSignal::Progress) => deadline.on_progress(),
                    Some(LoadSignal::FirstByte(latency)) => deadline.on_first_byte(latency),
                    None => return Err(MediaError::aborted("load channel closed").into()),
                },
            }
        }
    }

    async fn begin_transition(&self) -> (u64, CancellationToken) {
        let seq = self.transition_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let previous = self.transition.lock().await.replace((seq, token.clone()));
        if let Some((_, earlier)) = previous {
            debug!("pool: aborting in-flight switch");
            earlier.cancel();
            tokio::time::sleep(SUPERSEDE_GRACE).await;
        }
        (seq, token)
    }

    async fn end_transition(&self, seq: u64) {
        let mut current = self.transition.lock().await;
        if current.as_ref().is_some_and(|(s, _)| *s == seq) {
            *current = None;
        }
    }

    /// Make `station` the audible one.  At most one switch runs at a time:
    /// a newer call cancels this one at its next await point.
    pub async fn switch_to_station(
        self: &Arc<Self>,
        station: &Station,
        url: &str,
        volume: f32,
        op_id: OpId,
    ) -> Result<PlaybackHandle> {
        let volume = volume.clamp(0.0, 1.0);
        let (seq, token) = self.begin_transition().await;

        let mut held = Vec::new();
        let outgoing = {
            let mut inner = self.inner.lock().await;
            let active = inner.active;
            if let Some(i) = active {
                inner.reserve(i);
                held.push(i);
            }
            active
        };

        let result = self
            .run_switch(station, url, volume, op_id, outgoing, &token, &mut held)
            .await;

        {
            let mut inner = self.inner.lock().await;
            for index in held {
                inner.release(index);
            }
        }
        self.end_transition(seq).await;

        match &result {
            Ok(handle) => info!(
                "pool: station {} active on slot {} ({})",
                station.id, handle.slot, op_id
            ),
            Err(e) => debug!("pool: switch to station {} ended: {}", station.id, e),
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_switch(
        self: &Arc<Self>,
        station: &Station,
        url: &str,
        volume: f32,
        op_id: OpId,
        outgoing: Option<usize>,
        token: &CancellationToken,
        held: &mut Vec<usize>,
    ) -> Result<PlaybackHandle> {
        if let Some(active) = outgoing {
            let already_audible = {
                let mut inner = self.inner.lock().await;
                let slot = &mut inner.slots[active];
                let same = slot.station_id == Some(station.id)
                    && matches!(
                        slot.state,
                        SlotState::Playing | SlotState::Paused | SlotState::Ready | SlotState::Waiting
                    );
                if same {
                    slot.op_id = Some(op_id);
                    slot.play_intended = true;
                }
                same
            };
            if already_audible {
                debug!("pool: station {} already on slot {}", station.id, active);
                self.apply_volume(active, volume).await?;
                self.elements[active].play().await?;
                return Ok(self.handle(active, station.id, op_id));
            }
        }

        let reused = {
            let mut inner = self.inner.lock().await;
            let candidate = (0..inner.slots.len()).find(|&i| {
                let slot = &inner.slots[i];
                Some(i) != outgoing
                    && inner.is_free(i)
                    && slot.station_id == Some(station.id)
                    && slot.is_preload
                    && slot.state.is_ready_like()
            });
            if let Some(i) = candidate {
                let slot = &mut inner.slots[i];
                slot.is_preload = false;
                slot.op_id = Some(op_id);
                inner.reserve(i);
            }
            candidate
        };

        let index = match reused {
            Some(i) => {
                info!("pool: reusing preloaded slot {} for station {}", i, station.id);
                i
            }
            None => {
                self.load_into_slot(station, url, false, Some(op_id), token, true)
                    .await?
            }
        };
        held.push(index);

        if token.is_cancelled() {
            self.park_as_preload(index).await;
            return Err(EngineError::Superseded);
        }

        let (incoming, outgoing_side) = {
            let mut inner = self.inner.lock().await;
            inner.slots[index].play_intended = true;
            let incoming = FadeSide {
                index,
                element: Arc::clone(&self.elements[index]),
                volume: 0.0,
            };
            let outgoing_side = outgoing.filter(|&o| o != index).map(|o| FadeSide {
                index: o,
                element: Arc::clone(&self.elements[o]),
                volume: inner.slots[o].volume,
            });
            (incoming, outgoing_side)
        };

        let outcome = match self
            .crossfade
            .run(outgoing_side.as_ref(), &incoming, volume, self.mix.as_deref(), token)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_stale() {
                    self.park_as_preload(index).await;
                } else {
                    self.inner.lock().await.slots[index].reset();
                    let _ = self.elements[index].unload().await;
                }
                return Err(e);
            }
        };

        // Promote.  The fade has happened, so the pool follows what is audible.
        let demoted = {
            let mut inner = self.inner.lock().await;
            inner.active = Some(index);
            let slot = &mut inner.slots[index];
            slot.volume = volume;
            slot.last_used = Instant::now();
            slot.is_preload = false;
            outgoing_side.as_ref().map(|side| {
                let old = &mut inner.slots[side.index];
                old.reset();
                (side.index, old.epoch)
            })
        };

        match (outcome, demoted) {
            (FadeOutcome::PauseDeferred(after), Some((old, epoch))) => {
                self.schedule_deferred_pause(old, epoch, after);
            }
            (FadeOutcome::OutgoingPaused, Some((old, _))) => {
                if let Err(e) = self.elements[old].unload().await {
                    debug!("pool: unload of demoted slot {} failed: {}", old, e);
                }
            }
            _ => {}
        }

        Ok(self.handle(index, station.id, op_id))
    }

    fn handle(&self, index: usize, station_id: StationId, op_id: OpId) -> PlaybackHandle {
        PlaybackHandle {
            slot: index,
            station_id,
            op_id,
            element: Arc::clone(&self.elements[index]),
            mixed: self.mix.is_some(),
        }
    }

    /// Keep a loaded-but-superseded slot around as a preload.
    async fn park_as_preload(&self, index: usize) {
        let mut inner = self.inner.lock().await;
        if inner.active != Some(index) {
            let slot = &mut inner.slots[index];
            slot.is_preload = true;
            slot.op_id = None;
            slot.play_intended = false;
        }
    }

    /// Pause the demoted slot once its gain ramp is done, unless it has been
    /// handed out again in the meantime.
    fn schedule_deferred_pause(self: &Arc<Self>, index: usize, epoch: u64, after: Duration) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let still_ours = {
                let inner = pool.inner.lock().await;
                inner.slots[index].epoch == epoch && inner.is_free(index)
            };
            if !still_ours {
                debug!("pool: slot {} reassigned, skipping deferred pause", index);
                return;
            }
            let element = &pool.elements[index];
            if let Err(e) = element.pause().await {
                debug!("pool: deferred pause of slot {} failed: {}", index, e);
            }
            let _ = element.unload().await;
        });
    }

    async fn apply_volume(&self, index: usize, volume: f32) -> Result<()> {
        let element = &self.elements[index];
        match &self.mix {
            Some(mix) => {
                element.set_volume(1.0).await?;
                mix.set_gain(index, volume);
            }
            None => element.set_volume(volume).await?,
        }
        Ok(())
    }

    pub async fn set_volume(&self, volume: f32) -> Result<Option<usize>> {
        let volume = volume.clamp(0.0, 1.0);
        let active = {
            let mut inner = self.inner.lock().await;
            let active = inner.active;
            if let Some(i) = active {
                inner.slots[i].volume = volume;
            }
            active
        };
        if let Some(i) = active {
            self.apply_volume(i, volume).await?;
        }
        Ok(active)
    }

    pub async fn pause_active(&self) -> Result<usize> {
        let index = {
            let mut inner = self.inner.lock().await;
            let index = inner.active.ok_or(EngineError::NoActiveSlot)?;
            inner.slots[index].play_intended = false;
            index
        };
        self.elements[index].pause().await?;
        Ok(index)
    }

    pub async fn resume_active(&self) -> Result<usize> {
        let index = {
            let mut inner = self.inner.lock().await;
            let index = inner.active.ok_or(EngineError::NoActiveSlot)?;
            inner.slots[index].play_intended = true;
            index
        };
        self.elements[index].play().await?;
        Ok(index)
    }

    /// Release the active slot entirely.
    pub async fn stop_active(&self) -> Option<usize> {
        let index = {
            let mut inner = self.inner.lock().await;
            let index = inner.active.take()?;
            inner.slots[index].reset();
            index
        };
        let element = &self.elements[index];
        let _ = element.pause().await;
        let _ = element.unload().await;
        Some(index)
    }

    /// Reload the source of `index` if it still serves `op_id`.  Attempt 1 is
    /// a soft reconnect, later attempts rebuild the pipeline first.  Readiness
    /// is awaited with the fixed probe timeout.
    pub async fn reconnect_slot(&self, index: usize, op_id: OpId, attempt: u32) -> Result<()> {
        let mode = ReconnectMode::for_attempt(attempt);
        let started = Instant::now();

        let (source, rx, epoch, resume) = {
            let mut inner = self.inner.lock().await;
            let slot = inner
                .slots
                .get_mut(index)
                .ok_or(EngineError::NoActiveSlot)?;
            if slot.op_id != Some(op_id) {
                return Err(EngineError::ContextChanged {
                    captured: op_id,
                    current: slot.op_id,
                });
            }
            let (Some(url), Some(station_id)) = (slot.url.clone(), slot.station_id) else {
                return Err(EngineError::NoActiveSlot);
            };
            slot.set_recovery_attempt(attempt);
            let requested = MediaSource {
                url,
                hls: slot.is_hls,
            };
            let (source, rx) = slot.begin_load(
                &requested,
                station_id,
                Some(op_id),
                false,
                false,
                &self.proxy,
                started,
            );
            (source, rx, slot.epoch, slot.play_intended)
        };

        info!("pool: {} reconnect of slot {} (attempt {})", mode, index, attempt);
        let element = &self.elements[index];
        if mode == ReconnectMode::Hard {
            element.rebuild().await?;
        }
        element.load(&source).await?;

        let probe = CancellationToken::new();
        self.await_ready(rx, &probe, LoadDeadline::fixed(started, self.probe_timeout))
            .await?;

        {
            let inner = self.inner.lock().await;
            let slot = &inner.slots[index];
            if slot.epoch != epoch || slot.op_id != Some(op_id) {
                return Err(EngineError::ContextChanged {
                    captured: op_id,
                    current: slot.op_id,
                });
            }
        }

        if resume {
            element.play().await?;
        }
        Ok(())
    }

    async fn holds_station(&self, station_id: StationId) -> bool {
        let inner = self.inner.lock().await;
        inner.loads.contains_key(&station_id)
            || inner.slots.iter().any(|s| s.station_id == Some(station_id))
    }

    /// Warm up to `stations` in the background, one at a time.  Failures are
    /// logged and skipped; pool exhaustion ends the batch quietly.
    pub fn preload_stations(self: &Arc<Self>, stations: Vec<(Station, String)>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(_permit) = pool.preload_gate.acquire().await else {
                return;
            };
            for (station, url) in stations {
                if pool.holds_station(station.id).await {
                    continue;
                }
                match pool.load_station(&station, &url, true, None).await {
                    Ok(index) => debug!("pool: preloaded {} into slot {}", station.name, index),
                    Err(EngineError::PoolExhausted) => {
                        debug!("pool: exhausted, skipping remaining preloads");
                        break;
                    }
                    Err(e) => warn!("pool: preload of {} failed: {}", station.name, e),
                }
            }
        })
    }

    /// Clear a non-active slot back to idle.  The active slot is left alone.
    pub async fn reset_slot(&self, index: usize) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.active == Some(index) {
                warn!("pool: refusing to reset active slot {}", index);
                return Err(EngineError::SlotActive(index));
            }
            let Some(slot) = inner.slots.get_mut(index) else {
                return Err(EngineError::Backend(format!("no slot {index}")));
            };
            slot.reset();
        }
        let _ = self.elements[index].unload().await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.active = None;
            for slot in inner.slots.iter_mut() {
                slot.reset();
            }
        }
        if let Some((_, token)) = self.transition.lock().await.take() {
            token.cancel();
        }
        for element in &self.elements {
            let _ = element.unload().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(inner: &mut PoolInner, index: usize, station: StationId, state: SlotState, now: Instant) {
        let source = MediaSource {
            url: format!("http://s{station}.example/live"),
            hls: false,
        };
        inner.slots[index].begin_load(&source, station, None, false, true, &ProxyRewrite::default(), now);
        inner.slots[index].state = state;
    }

    #[test]
    fn allocation_prefers_blank_slots() {
        let now = Instant::now();
        let mut inner = PoolInner::new(3, now);
        bind(&mut inner, 0, 1, SlotState::Playing, now);
        inner.active = Some(0);
        bind(&mut inner, 1, 2, SlotState::Paused, now);
        assert_eq!(inner.allocate(), Some((2, false)));
    }

    #[test]
    fn allocation_then_paused_then_lru() {
        let now = Instant::now();
        let mut inner = PoolInner::new(3, now);
        bind(&mut inner, 0, 1, SlotState::Playing, now);
        inner.active = Some(0);
        bind(&mut inner, 1, 2, SlotState::Ready, now);
        bind(&mut inner, 2, 3, SlotState::Paused, now + Duration::from_secs(5));
        assert_eq!(inner.allocate(), Some((2, true)));

        inner.slots[2].state = SlotState::Ready;
        // slot 1 was used earliest
        assert_eq!(inner.allocate(), Some((1, true)));
    }

    #[test]
    fn allocation_skips_active_and_reserved() {
        let now = Instant::now();
        let mut inner = PoolInner::new(3, now);
        inner.active = Some(0);
        inner.reserve(1);
        inner.reserve(2);
        assert_eq!(inner.allocate(), None);

        inner.reserve(2);
        inner.release(2);
        assert_eq!(inner.allocate(), None, "reservations are counted");
        inner.release(2);
        assert_eq!(inner.allocate(), Some((2, false)));
    }

    #[test]
    fn deadline_extends_and_caps() {
        let now = Instant::now();
        let mut d = LoadDeadline::new(now, Duration::from_secs(15), Duration::from_secs(60));
        d.on_progress();
        assert_eq!(d.budget(), Duration::from_secs(20));
        d.on_first_byte(Duration::from_secs(4));
        d.on_first_byte(Duration::from_secs(4));
        assert_eq!(d.budget(), Duration::from_secs(30));
        for _ in 0..20 {
            d.on_progress();
        }
        assert_eq!(d.budget(), Duration::from_secs(60));
        assert_eq!(d.at(), now + Duration::from_secs(60));
    }

    #[test]
    fn fast_first_byte_earns_nothing() {
        let now = Instant::now();
        let mut d = LoadDeadline::new(now, Duration::from_secs(15), Duration::from_secs(60));
        d.on_first_byte(Duration::from_millis(800));
        assert_eq!(d.budget(), Duration::from_secs(15));
        let mut fixed = LoadDeadline::fixed(now, Duration::from_secs(5));
        fixed.on_progress();
        assert_eq!(fixed.budget(), Duration::from_secs(5));
    }

    #[test]
    fn reconnect_mode_by_attempt() {
        assert_eq!(ReconnectMode::for_attempt(1), ReconnectMode::Soft);
        assert_eq!(ReconnectMode::for_attempt(2), ReconnectMode::Hard);
        assert_eq!(ReconnectMode::for_attempt(5), ReconnectMode::Hard);
    }
}
