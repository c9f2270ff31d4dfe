//! `StreamingEngine`: the one surface callers talk to.
//!
//! Intent flows down (engine -> pool -> slot), status flows up through a
//! single pump task that owns the order in which element events, stall
//! reports and connectivity changes reach the state machine.
//!
//! ```text
//!   switch_to_station ─▶ PlaybackPool ─▶ MediaElement
//!                             ▲                │
//!   StallWatchdog ──stall──▶ pump ◀──events────┘
//!                             │
//!                 PlayerStateMachine ──▶ subscribe_state()
//!                 RecoveryManager   ──▶ subscribe_diagnostics()
//! ```

use std::sync::{Arc, Weak};

use radio_proto::config::EngineConfig;
use radio_proto::protocol::{
    Diagnostic, DiagnosticKind, OpId, PlayerEvent, PlayerState, StateChange, Station, StationId,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{EngineError, Result};
use crate::fsm::{ErrorCallback, PlayerStateMachine, TransitionContext};
use crate::media::{MediaBackend, MediaEvent};
use crate::network::NetworkMonitor;
use crate::pool::{PlaybackHandle, PlaybackPool};
use crate::recovery::{should_retry, RecoveryManager, RecoveryOptions, RecoveryResult};
use crate::slot::{SlotEventKind, SlotSnapshot, SlotState};
use crate::watchdog::{spawn_watchdog, StallSignal, WatchdogHandle, WatchdogSettings};

pub fn slot_recovery_id(index: usize) -> String {
    format!("slot:{index}")
}

pub fn switch_recovery_id(station_id: StationId) -> String {
    format!("switch:{station_id}")
}

/// Clamp into `[0, 1]`; NaN is rejected rather than guessed at.
pub fn validate_volume(volume: f32) -> Result<f32> {
    if volume.is_nan() {
        return Err(EngineError::InvalidVolume(volume));
    }
    Ok(volume.clamp(0.0, 1.0))
}

#[derive(Debug, Clone)]
struct Intent {
    station: Station,
    volume: f32,
    op_id: OpId,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state: PlayerState,
    pub previous: Option<PlayerState>,
    pub active_slot: Option<usize>,
    pub station_id: Option<StationId>,
    pub op_id: Option<OpId>,
    pub volume: Option<f32>,
    pub online: bool,
    pub slots: Vec<SlotSnapshot>,
}

/// How a recovery run maps onto the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryPath {
    /// STALLED -> RECOVERING -> BUFFERING / ERROR
    Stall,
    /// ERROR -> RETRYING -> LOADING / ERROR
    Retry,
    /// Nothing visible until the outcome.
    Silent,
}

struct EngineInner {
    config: EngineConfig,
    pool: Arc<PlaybackPool>,
    fsm: Mutex<PlayerStateMachine>,
    state_events: broadcast::Sender<StateChange>,
    recovery: RecoveryManager,
    network: NetworkMonitor,
    diagnostics: broadcast::Sender<Diagnostic>,
    intent: Mutex<Option<Intent>>,
    watchdog: Mutex<Option<WatchdogHandle>>,
    stall_tx: mpsc::UnboundedSender<StallSignal>,
    shutdown: CancellationToken,
}

/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct StreamingEngine {
    inner: Arc<EngineInner>,
}

impl StreamingEngine {
    /// Build the engine and start its event pump.  Must be called from
    /// within a tokio runtime.
    pub fn new(
        config: EngineConfig,
        backend: &dyn MediaBackend,
        network: NetworkMonitor,
    ) -> anyhow::Result<Self> {
        let config = config.validated();
        let (pool, media_rx) = PlaybackPool::new(&config, backend)?;
        let fsm = PlayerStateMachine::new(config.history_len);
        let state_events = fsm.sender();
        let (diagnostics, _) = broadcast::channel(256);
        let (stall_tx, stall_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let recovery = RecoveryManager::new(config.recovery.clone());
        let online_rx = network.subscribe();

        let inner = Arc::new(EngineInner {
            config,
            pool,
            fsm: Mutex::new(fsm),
            state_events,
            recovery,
            network,
            diagnostics,
            intent: Mutex::new(None),
            watchdog: Mutex::new(None),
            stall_tx,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(pump(
            Arc::downgrade(&inner),
            media_rx,
            stall_rx,
            online_rx,
            shutdown,
        ));

        Ok(Self { inner })
    }

    pub fn pool(&self) -> &Arc<PlaybackPool> {
        &self.inner.pool
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.inner.state_events.subscribe()
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.inner.diagnostics.subscribe()
    }

    pub async fn set_error_callback(&self, callback: ErrorCallback) {
        self.inner.fsm.lock().await.set_error_callback(callback);
    }

    pub async fn state(&self) -> PlayerState {
        self.inner.fsm.lock().await.current()
    }

    pub async fn history(&self) -> Vec<StateChange> {
        self.inner.fsm.lock().await.history()
    }

    pub async fn is_playable(&self) -> bool {
        self.inner.fsm.lock().await.is_playable()
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        let (state, previous) = {
            let fsm = self.inner.fsm.lock().await;
            (fsm.current(), fsm.previous())
        };
        let intent = self.inner.intent.lock().await.clone();
        EngineSnapshot {
            state,
            previous,
            active_slot: self.inner.pool.active_index().await,
            station_id: intent.as_ref().map(|i| i.station.id),
            op_id: intent.as_ref().map(|i| i.op_id),
            volume: intent.as_ref().map(|i| i.volume),
            online: self.inner.network.is_online(),
            slots: self.inner.pool.snapshot().await,
        }
    }

    fn diagnose(&self, diagnostic: Diagnostic) {
        trace!("diagnostic: {:?}", diagnostic);
        let _ = self.inner.diagnostics.send(diagnostic);
    }

    async fn current_op(&self) -> Option<OpId> {
        self.inner.intent.lock().await.as_ref().map(|i| i.op_id)
    }

    async fn ensure_current(&self, op_id: OpId) -> Result<()> {
        let current = self.current_op().await;
        if current == Some(op_id) {
            Ok(())
        } else {
            Err(EngineError::ContextChanged {
                captured: op_id,
                current,
            })
        }
    }

    // ── switching ─────────────────────────────────────────────────────────────

    /// Make `station` the audible one.  `op_id` identifies this intent; any
    /// older intent still in flight is abandoned.
    pub async fn switch_to_station(
        &self,
        station: &Station,
        url: &str,
        volume: f32,
        op_id: OpId,
    ) -> Result<PlaybackHandle> {
        let volume = validate_volume(volume)?;
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::Shutdown);
        }

        let previous = self.inner.intent.lock().await.replace(Intent {
            station: station.clone(),
            volume,
            op_id,
        });
        if let Some(previous) = previous {
            self.inner
                .recovery
                .cancel_recovery(&switch_recovery_id(previous.station.id))
                .await;
        }
        if let Some(index) = self.inner.pool.active_index().await {
            self.inner
                .recovery
                .cancel_recovery(&slot_recovery_id(index))
                .await;
        }
        self.stop_watchdog().await;

        info!("engine: switching to {} ({}) {}", station.name, station.id, op_id);
        self.enter_switch(station.id, op_id).await;

        match self
            .inner
            .pool
            .switch_to_station(station, url, volume, op_id)
            .await
        {
            Ok(handle) => {
                self.finish_switch(&handle).await;
                Ok(handle)
            }
            Err(e) if e.is_stale() => Err(e),
            Err(e) => self.fail_switch(station, url, volume, op_id, e).await,
        }
    }

    async fn enter_switch(&self, station_id: StationId, op_id: OpId) {
        let ctx = TransitionContext::default().intent(Some(station_id), Some(op_id));
        let mut fsm = self.inner.fsm.lock().await;
        match fsm.current() {
            PlayerState::Idle | PlayerState::Error | PlayerState::Retrying => {
                fsm.transition(PlayerEvent::Load, ctx);
            }
            PlayerState::Switching => {}
            PlayerState::Recovering => {
                let mut superseded = ctx.clone();
                superseded.reason = Some("superseded by a new station".into());
                fsm.transition(PlayerEvent::Failed, superseded);
                fsm.transition(PlayerEvent::Load, ctx);
            }
            PlayerState::PausedWaiting => {
                fsm.transition(PlayerEvent::Stop, ctx.clone());
                fsm.transition(PlayerEvent::Load, ctx);
            }
            _ => {
                fsm.transition(PlayerEvent::Switch, ctx);
            }
        }
    }

    async fn finish_switch(&self, handle: &PlaybackHandle) {
        if self.ensure_current(handle.op_id).await.is_err() {
            return;
        }
        let ctx = TransitionContext::default()
            .intent(Some(handle.station_id), Some(handle.op_id))
            .slot(Some(handle.slot));
        let mut fsm = self.inner.fsm.lock().await;
        if matches!(
            fsm.current(),
            PlayerState::Loading | PlayerState::Switching | PlayerState::Buffering
        ) {
            fsm.transition(PlayerEvent::Ready, ctx.clone());
        }
        if fsm.current() == PlayerState::Ready {
            fsm.transition(PlayerEvent::Play, ctx);
        }
    }

    async fn fail_switch(
        &self,
        station: &Station,
        url: &str,
        volume: f32,
        op_id: OpId,
        error: EngineError,
    ) -> Result<PlaybackHandle> {
        let recoverable = error.is_recoverable();
        warn!("engine: switch to {} failed: {}", station.name, error);
        {
            let ctx = TransitionContext::reason(error.to_string())
                .recoverable(recoverable)
                .intent(Some(station.id), Some(op_id));
            self.inner
                .fsm
                .lock()
                .await
                .transition(PlayerEvent::Error, ctx);
        }
        if !recoverable {
            return Err(error);
        }
        self.retry_switch(station, url, volume, op_id).await
    }

    /// ERROR -> RETRYING -> LOADING under backoff until the switch lands.
    async fn retry_switch(
        &self,
        station: &Station,
        url: &str,
        volume: f32,
        op_id: OpId,
    ) -> Result<PlaybackHandle> {
        let id = switch_recovery_id(station.id);
        self.diagnose(
            Diagnostic::new(DiagnosticKind::RecoveryStarted)
                .station(Some(station.id), Some(op_id))
                .detail("switch"),
        );

        let landed: Arc<Mutex<Option<PlaybackHandle>>> = Arc::new(Mutex::new(None));
        let max_retries = self.inner.config.recovery.max_retries.max(1);

        let engine = self.clone();
        let station_owned = station.clone();
        let url = url.to_string();
        let slot = Arc::clone(&landed);
        let attempt_fn = move |attempt: u32| {
            let engine = engine.clone();
            let station = station_owned.clone();
            let url = url.clone();
            let slot = Arc::clone(&slot);
            async move {
                engine.ensure_current(op_id).await?;
                let ctx = TransitionContext::default().intent(Some(station.id), Some(op_id));
                {
                    let mut fsm = engine.inner.fsm.lock().await;
                    if fsm.current() == PlayerState::Error {
                        if !fsm.is_retryable() {
                            return Err(EngineError::RecoveryExhausted {
                                attempts: fsm.retry_count(),
                                reason: "retry limit reached".into(),
                            });
                        }
                        fsm.transition(PlayerEvent::Retry, ctx.clone());
                    }
                    fsm.transition(PlayerEvent::Load, ctx);
                }

                match engine
                    .inner
                    .pool
                    .switch_to_station(&station, &url, volume, op_id)
                    .await
                {
                    Ok(handle) => {
                        *slot.lock().await = Some(handle);
                        Ok(())
                    }
                    Err(e) => {
                        if !e.is_stale() && engine.ensure_current(op_id).await.is_ok() {
                            let offline = !engine.inner.network.is_online();
                            let again = attempt < max_retries && should_retry(&e, attempt, offline);
                            let ctx = TransitionContext::reason(e.to_string())
                                .recoverable(again)
                                .intent(Some(station.id), Some(op_id));
                            engine
                                .inner
                                .fsm
                                .lock()
                                .await
                                .transition(PlayerEvent::Error, ctx);
                        }
                        Err(e)
                    }
                }
            }
        };

        let result = self
            .inner
            .recovery
            .start_recovery(id, attempt_fn, RecoveryOptions::default())
            .await;

        match result {
            RecoveryResult::Recovered { attempts } => {
                let handle = landed.lock().await.take().ok_or(EngineError::Superseded)?;
                self.diagnose(
                    Diagnostic::new(DiagnosticKind::RecoverySuccess)
                        .slot(handle.slot)
                        .station(Some(station.id), Some(op_id))
                        .detail(format!("{attempts} attempt(s)")),
                );
                self.finish_switch(&handle).await;
                Ok(handle)
            }
            RecoveryResult::Failed { attempts, error } => {
                self.diagnose(
                    Diagnostic::new(DiagnosticKind::RecoveryFailed)
                        .station(Some(station.id), Some(op_id))
                        .detail(error.to_string()),
                );
                Err(EngineError::RecoveryExhausted {
                    attempts,
                    reason: error.to_string(),
                })
            }
            RecoveryResult::Cancelled => Err(EngineError::Superseded),
        }
    }

    // ── transport ─────────────────────────────────────────────────────────────

    /// Pause the active slot.  False if there is nothing to pause.
    pub async fn pause(&self) -> bool {
        let Some((index, station_id, op_id)) = self.inner.pool.active_context().await else {
            return false;
        };
        if !self.inner.fsm.lock().await.can(PlayerEvent::Pause) {
            return false;
        }
        if let Err(e) = self.inner.pool.pause_active().await {
            warn!("engine: pause failed: {}", e);
            return false;
        }
        self.stop_watchdog().await;
        let ctx = TransitionContext::default()
            .intent(station_id, op_id)
            .slot(Some(index));
        let mut fsm = self.inner.fsm.lock().await;
        // The element's own pause event may have been handled already.
        fsm.transition(PlayerEvent::Pause, ctx)
            || matches!(fsm.current(), PlayerState::Paused | PlayerState::PausedWaiting)
    }

    pub async fn resume(&self) -> Result<bool> {
        let Some((index, station_id, op_id)) = self.inner.pool.active_context().await else {
            return Ok(false);
        };
        let event = match self.inner.fsm.lock().await.current() {
            PlayerState::Paused => PlayerEvent::Play,
            PlayerState::PausedWaiting => PlayerEvent::Resume,
            _ => return Ok(false),
        };
        self.inner.pool.resume_active().await?;

        let ctx = TransitionContext::default()
            .intent(station_id, op_id)
            .slot(Some(index));
        let (resumed, now) = {
            let mut fsm = self.inner.fsm.lock().await;
            let moved = fsm.transition(event, ctx);
            let now = fsm.current();
            (moved || matches!(now, PlayerState::Playing | PlayerState::Waiting), now)
        };
        if resumed && now == PlayerState::Waiting {
            self.start_watchdog(index, op_id).await;
        }
        Ok(resumed)
    }

    pub async fn set_volume(&self, volume: f32) -> Result<()> {
        let volume = validate_volume(volume)?;
        if let Some(intent) = self.inner.intent.lock().await.as_mut() {
            intent.volume = volume;
        }
        self.inner.pool.set_volume(volume).await?;
        Ok(())
    }

    /// Drop the current intent and release the active slot.
    pub async fn stop(&self) {
        let intent = self.inner.intent.lock().await.take();
        if let Some(intent) = intent {
            self.inner
                .recovery
                .cancel_recovery(&switch_recovery_id(intent.station.id))
                .await;
        }
        if let Some(index) = self.inner.pool.active_index().await {
            self.inner
                .recovery
                .cancel_recovery(&slot_recovery_id(index))
                .await;
        }
        self.stop_watchdog().await;
        self.inner.pool.stop_active().await;

        let mut fsm = self.inner.fsm.lock().await;
        match fsm.current() {
            PlayerState::Idle => {}
            PlayerState::Paused | PlayerState::PausedWaiting => {
                fsm.transition(PlayerEvent::Stop, TransitionContext::reason("stopped"));
            }
            _ => fsm.reset(),
        }
    }

    /// Reconnect the active slot: soft first, then hard.
    pub async fn reconnect(&self) -> RecoveryResult {
        let Some((index, _, Some(op_id))) = self.inner.pool.active_context().await else {
            return RecoveryResult::Failed {
                attempts: 0,
                error: EngineError::NoActiveSlot,
            };
        };
        self.stop_watchdog().await;
        self.recover(index, op_id).await
    }

    pub fn preload_stations(&self, stations: Vec<(Station, String)>) -> JoinHandle<()> {
        self.inner.pool.preload_stations(stations)
    }

    /// Push a connectivity change (same as setting it on the monitor).
    pub fn set_online(&self, online: bool) {
        self.inner.network.set_online(online);
    }

    pub async fn shutdown(&self) {
        info!("engine: shutting down");
        self.inner.shutdown.cancel();
        self.inner.recovery.cancel_all().await;
        self.stop_watchdog().await;
        self.inner.pool.shutdown().await;
    }

    // ── recovery ──────────────────────────────────────────────────────────────

    async fn recover(&self, index: usize, op_id: OpId) -> RecoveryResult {
        let station_id = self.inner.intent.lock().await.as_ref().map(|i| i.station.id);
        let ctx = TransitionContext::default()
            .intent(station_id, Some(op_id))
            .slot(Some(index));

        let path = {
            let mut fsm = self.inner.fsm.lock().await;
            match fsm.current() {
                PlayerState::Waiting => {
                    fsm.transition(PlayerEvent::Stalled, ctx.clone());
                    fsm.transition(PlayerEvent::Recover, ctx.clone());
                    RecoveryPath::Stall
                }
                PlayerState::Stalled if fsm.is_recoverable() => {
                    fsm.transition(PlayerEvent::Recover, ctx.clone());
                    RecoveryPath::Stall
                }
                PlayerState::Stalled => {
                    let attempts = fsm.recovery_attempts();
                    let mut fatal = ctx.clone();
                    fatal.reason = Some("stall recovery attempts exhausted".into());
                    fatal.recoverable = Some(false);
                    fsm.transition(PlayerEvent::Error, fatal);
                    return RecoveryResult::Failed {
                        attempts,
                        error: EngineError::RecoveryExhausted {
                            attempts,
                            reason: "stall recovery attempts exhausted".into(),
                        },
                    };
                }
                PlayerState::Error if fsm.is_retryable() => {
                    fsm.transition(PlayerEvent::Retry, ctx.clone());
                    RecoveryPath::Retry
                }
                PlayerState::Error => {
                    let attempts = fsm.retry_count();
                    return RecoveryResult::Failed {
                        attempts,
                        error: EngineError::RecoveryExhausted {
                            attempts,
                            reason: "retry limit reached".into(),
                        },
                    };
                }
                _ => RecoveryPath::Silent,
            }
        };

        self.diagnose(
            Diagnostic::new(DiagnosticKind::RecoveryStarted)
                .slot(index)
                .station(station_id, Some(op_id)),
        );

        let pool = Arc::clone(&self.inner.pool);
        let result = self
            .inner
            .recovery
            .start_recovery(
                slot_recovery_id(index),
                move |attempt| {
                    let pool = Arc::clone(&pool);
                    async move { pool.reconnect_slot(index, op_id, attempt).await }
                },
                RecoveryOptions::default(),
            )
            .await;

        let current = self.ensure_current(op_id).await.is_ok();
        match &result {
            RecoveryResult::Recovered { attempts } => {
                self.diagnose(
                    Diagnostic::new(DiagnosticKind::RecoverySuccess)
                        .slot(index)
                        .station(station_id, Some(op_id))
                        .detail(format!("{attempts} attempt(s)")),
                );
                if current {
                    let audible = self
                        .inner
                        .pool
                        .slot_metrics(index)
                        .await
                        .is_some_and(|m| m.state == SlotState::Playing);
                    let buffering = {
                        let mut fsm = self.inner.fsm.lock().await;
                        match path {
                            RecoveryPath::Stall => {
                                fsm.transition(PlayerEvent::Recovered, ctx.clone());
                            }
                            RecoveryPath::Retry => {
                                fsm.transition(PlayerEvent::Load, ctx.clone());
                            }
                            RecoveryPath::Silent => {}
                        }
                        // BUFFERING holds until the element reports playback.
                        let hold = fsm.current() == PlayerState::Buffering && !audible;
                        if !hold {
                            if matches!(fsm.current(), PlayerState::Buffering | PlayerState::Loading) {
                                fsm.transition(PlayerEvent::Ready, ctx.clone());
                            }
                            if fsm.current() == PlayerState::Ready {
                                fsm.transition(PlayerEvent::Play, ctx);
                            }
                        }
                        hold
                    };
                    if buffering {
                        self.start_watchdog(index, Some(op_id)).await;
                    }
                }
            }
            RecoveryResult::Failed { error, .. } => {
                self.diagnose(
                    Diagnostic::new(DiagnosticKind::RecoveryFailed)
                        .slot(index)
                        .station(station_id, Some(op_id))
                        .detail(error.to_string()),
                );
                if current {
                    let mut fatal = ctx;
                    fatal.reason = Some(error.to_string());
                    fatal.recoverable = Some(false);
                    let mut fsm = self.inner.fsm.lock().await;
                    match path {
                        RecoveryPath::Stall => {
                            fsm.transition(PlayerEvent::Failed, fatal);
                        }
                        _ => {
                            fsm.transition(PlayerEvent::Error, fatal);
                        }
                    }
                }
            }
            RecoveryResult::Cancelled => {
                debug!("engine: recovery of slot {} cancelled", index);
            }
        }
        result
    }

    // ── watchdog ──────────────────────────────────────────────────────────────

    async fn start_watchdog(&self, index: usize, op_id: Option<OpId>) {
        let mut current = self.inner.watchdog.lock().await;
        if let Some(handle) = current.as_ref() {
            if handle.is_running() && handle.index() == index && handle.op_id() == op_id {
                return;
            }
        }
        *current = Some(spawn_watchdog(
            Arc::clone(&self.inner.pool),
            index,
            op_id,
            WatchdogSettings::from(&self.inner.config),
            self.inner.diagnostics.clone(),
            self.inner.stall_tx.clone(),
        ));
    }

    async fn stop_watchdog(&self) {
        if let Some(handle) = self.inner.watchdog.lock().await.take() {
            handle.stop();
        }
    }

    // ── pump handlers ─────────────────────────────────────────────────────────

    async fn on_media_event(&self, index: usize, event: MediaEvent) {
        let Some(ev) = self.inner.pool.handle_media_event(index, event).await else {
            return;
        };

        if ev.kind == SlotEventKind::Stalled {
            self.diagnose(
                Diagnostic::new(DiagnosticKind::StalledEvent)
                    .slot(index)
                    .station(ev.station_id, ev.op_id),
            );
        }

        let active = self.inner.pool.active_index().await;
        let current_op = self.current_op().await;
        if active != Some(index) || ev.op_id.is_none() || ev.op_id != current_op {
            trace!("engine: ignoring {:?} from slot {}", ev.kind, index);
            return;
        }

        let ctx = TransitionContext::default()
            .intent(ev.station_id, ev.op_id)
            .slot(Some(index));

        match ev.kind {
            SlotEventKind::Waiting => {
                let watch = {
                    let mut fsm = self.inner.fsm.lock().await;
                    match fsm.current() {
                        PlayerState::Playing | PlayerState::Paused => {
                            fsm.transition(PlayerEvent::Waiting, ctx);
                        }
                        PlayerState::Loading | PlayerState::Loaded => {
                            fsm.transition(PlayerEvent::Play, ctx);
                        }
                        PlayerState::Switching => {
                            fsm.transition(PlayerEvent::Buffering, ctx);
                        }
                        _ => {}
                    }
                    // a paused element never advances; nothing to watch
                    matches!(fsm.current(), PlayerState::Waiting | PlayerState::Buffering)
                };
                if watch {
                    self.start_watchdog(index, ev.op_id).await;
                }
            }
            SlotEventKind::Stalled => {
                let state = self.state().await;
                if matches!(state, PlayerState::Playing | PlayerState::Waiting) {
                    self.start_watchdog(index, ev.op_id).await;
                }
            }
            SlotEventKind::Playing => {
                self.stop_watchdog().await;
                let mut fsm = self.inner.fsm.lock().await;
                match fsm.current() {
                    PlayerState::Waiting => {
                        fsm.transition(PlayerEvent::Resume, ctx);
                    }
                    PlayerState::Buffering => {
                        fsm.transition(PlayerEvent::Ready, ctx.clone());
                        fsm.transition(PlayerEvent::Play, ctx);
                    }
                    PlayerState::Ready | PlayerState::Paused => {
                        fsm.transition(PlayerEvent::Play, ctx);
                    }
                    _ => {}
                }
            }
            SlotEventKind::Paused => {
                self.stop_watchdog().await;
                let mut fsm = self.inner.fsm.lock().await;
                if matches!(
                    fsm.current(),
                    PlayerState::Playing
                        | PlayerState::Waiting
                        | PlayerState::Buffering
                        | PlayerState::Stalled
                ) {
                    fsm.transition(PlayerEvent::Pause, ctx);
                }
            }
            SlotEventKind::Ended => {
                self.stop_watchdog().await;
                let mut fsm = self.inner.fsm.lock().await;
                if fsm.current() == PlayerState::Playing {
                    fsm.transition(PlayerEvent::End, ctx);
                }
            }
            SlotEventKind::Error => {
                if self
                    .inner
                    .recovery
                    .is_active(&slot_recovery_id(index))
                    .await
                {
                    debug!("engine: slot {} error during recovery, left to the attempt", index);
                    return;
                }
                self.stop_watchdog().await;
                let recoverable = ev.error.as_ref().is_some_and(|e| e.kind.is_recoverable());
                let reason = ev
                    .error
                    .as_ref()
                    .map_or_else(|| "unknown error".to_string(), |e| e.to_string());
                let ctx = TransitionContext::reason(reason)
                    .recoverable(recoverable)
                    .intent(ev.station_id, ev.op_id)
                    .slot(Some(index));
                let entered = self
                    .inner
                    .fsm
                    .lock()
                    .await
                    .transition(PlayerEvent::Error, ctx);
                if entered && recoverable {
                    if let Some(op_id) = ev.op_id {
                        let engine = self.clone();
                        tokio::spawn(async move {
                            engine.recover(index, op_id).await;
                        });
                    }
                }
            }
            _ => {}
        }
    }

    async fn on_stall(&self, signal: StallSignal) {
        let active = self.inner.pool.active_index().await;
        if active != Some(signal.index) || signal.op_id != self.current_op().await {
            return;
        }
        let Some(op_id) = signal.op_id else {
            return;
        };
        self.inner.pool.mark_stalled(signal.index, signal.op_id).await;

        {
            let mut fsm = self.inner.fsm.lock().await;
            if fsm.current() == PlayerState::Waiting {
                let ctx = TransitionContext::reason(format!(
                    "no progress for {}ms",
                    signal.idle_for.as_millis()
                ))
                .intent(signal.station_id, signal.op_id)
                .slot(Some(signal.index));
                fsm.transition(PlayerEvent::Stalled, ctx);
            }
        }
        self.inner.watchdog.lock().await.take();

        let engine = self.clone();
        let index = signal.index;
        tokio::spawn(async move {
            engine.recover(index, op_id).await;
        });
    }

    async fn on_network(&self, online: bool) {
        info!("engine: network {}", if online { "online" } else { "offline" });
        self.inner.recovery.set_online(online).await;
        self.diagnose(Diagnostic::new(if online {
            DiagnosticKind::NetworkOnline
        } else {
            DiagnosticKind::NetworkOffline
        }));
    }
}

async fn pump(
    engine: Weak<EngineInner>,
    mut media: mpsc::UnboundedReceiver<(usize, MediaEvent)>,
    mut stalls: mpsc::UnboundedReceiver<StallSignal>,
    mut online: watch::Receiver<bool>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some((index, event)) = media.recv() => {
                let Some(inner) = engine.upgrade() else { break };
                StreamingEngine { inner }.on_media_event(index, event).await;
            }
            Some(signal) = stalls.recv() => {
                let Some(inner) = engine.upgrade() else { break };
                StreamingEngine { inner }.on_stall(signal).await;
            }
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
                let value = *online.borrow_and_update();
                let Some(inner) = engine.upgrade() else { break };
                StreamingEngine { inner }.on_network(value).await;
            }
            else => break,
        }
    }
    debug!("engine: pump stopped");
}
