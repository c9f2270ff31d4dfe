//! Global playback-intent state machine.
//!
//! One instance per engine.  The transition table is a pure function
//! (`next_state`); `PlayerStateMachine` layers counters, entry side effects,
//! a bounded history and a broadcast channel on top of it.

use std::collections::VecDeque;

use chrono::Utc;
use radio_proto::protocol::{
    OpId, PlayerEvent, PlayerState, StateChange, StationId, TransitionMetadata,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Stalls that may be recovered before a stall is treated as fatal.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;
/// Retries from ERROR before the intent is given up.
pub const MAX_RETRIES: u32 = 5;

/// The transition table.  `None` means the event is not accepted in `from`.
pub fn next_state(from: PlayerState, event: PlayerEvent) -> Option<PlayerState> {
    use PlayerEvent as E;
    use PlayerState as S;

    let to = match (from, event) {
        (S::Idle, E::Load) => S::Loading,
        (S::Idle, E::Error) => S::Error,

        (S::Loading, E::Loaded) => S::Loaded,
        (S::Loading, E::Ready) => S::Ready,
        (S::Loading, E::Play) => S::Buffering,
        (S::Loading, E::Error) => S::Error,
        (S::Loading, E::Switch) => S::Switching,

        (S::Loaded, E::Buffering) => S::Buffering,
        (S::Loaded, E::Play) => S::Buffering,
        (S::Loaded, E::Error) => S::Error,
        (S::Loaded, E::Switch) => S::Switching,

        (S::Buffering, E::Ready) => S::Ready,
        (S::Buffering, E::Pause) => S::Paused,
        (S::Buffering, E::Error) => S::Error,
        (S::Buffering, E::Switch) => S::Switching,

        (S::Ready, E::Play) => S::Playing,
        (S::Ready, E::Force) => S::Playing,
        (S::Ready, E::Error) => S::Error,
        (S::Ready, E::Switch) => S::Switching,

        (S::Playing, E::Pause) => S::Paused,
        (S::Playing, E::Waiting) => S::Waiting,
        (S::Playing, E::End) => S::Idle,
        (S::Playing, E::Error) => S::Error,
        (S::Playing, E::Switch) => S::Switching,

        (S::Switching, E::Ready) => S::Ready,
        (S::Switching, E::Play) => S::Playing,
        (S::Switching, E::Buffering) => S::Buffering,
        (S::Switching, E::Loaded) => S::Loaded,
        (S::Switching, E::Error) => S::Error,

        (S::Waiting, E::Resume) => S::Playing,
        (S::Waiting, E::Pause) => S::Paused,
        (S::Waiting, E::Stalled) => S::Stalled,
        (S::Waiting, E::Error) => S::Error,
        (S::Waiting, E::Switch) => S::Switching,

        (S::Paused, E::Play) => S::Playing,
        (S::Paused, E::Resume) => S::Playing,
        (S::Paused, E::Waiting) => S::PausedWaiting,
        (S::Paused, E::Stop) => S::Idle,
        (S::Paused, E::Error) => S::Error,
        (S::Paused, E::Switch) => S::Switching,

        (S::PausedWaiting, E::Play) => S::Waiting,
        (S::PausedWaiting, E::Resume) => S::Waiting,
        (S::PausedWaiting, E::Stop) => S::Idle,

        (S::Stalled, E::Recover) => S::Recovering,
        (S::Stalled, E::Pause) => S::Paused,
        (S::Stalled, E::Error) => S::Error,
        (S::Stalled, E::Switch) => S::Switching,

        (S::Recovering, E::Recovered) => S::Buffering,
        (S::Recovering, E::Failed) => S::Error,

        (S::Error, E::Retry) => S::Retrying,
        (S::Error, E::Reset) => S::Idle,
        (S::Error, E::Load) => S::Loading,

        (S::Retrying, E::Load) => S::Loading,
        (S::Retrying, E::Error) => S::Error,

        _ => return None,
    };
    Some(to)
}

/// Caller-supplied context merged into the transition payload.
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    pub reason: Option<String>,
    pub recoverable: Option<bool>,
    pub station_id: Option<StationId>,
    pub op_id: Option<OpId>,
    pub slot: Option<usize>,
}

impl TransitionContext {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = Some(recoverable);
        self
    }

    pub fn intent(mut self, station_id: Option<StationId>, op_id: Option<OpId>) -> Self {
        self.station_id = station_id;
        self.op_id = op_id;
        self
    }

    pub fn slot(mut self, slot: Option<usize>) -> Self {
        self.slot = slot;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    errors: u32,
    stalls: u32,
    recovery_attempts: u32,
    retries: u32,
    switches: u32,
}

pub type ErrorCallback = Box<dyn Fn(&StateChange) + Send + Sync>;

pub struct PlayerStateMachine {
    current: PlayerState,
    previous: Option<PlayerState>,
    counters: Counters,
    last_metadata: TransitionMetadata,
    history: VecDeque<StateChange>,
    history_len: usize,
    events: broadcast::Sender<StateChange>,
    on_error: Option<ErrorCallback>,
}

impl PlayerStateMachine {
    pub fn new(history_len: usize) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            current: PlayerState::Idle,
            previous: None,
            counters: Counters::default(),
            last_metadata: TransitionMetadata::default(),
            history: VecDeque::with_capacity(history_len.max(1)),
            history_len: history_len.max(1),
            events,
            on_error: None,
        }
    }

    pub fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.on_error = Some(callback);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Sender side, for handing out subscriptions without the machine.
    pub fn sender(&self) -> broadcast::Sender<StateChange> {
        self.events.clone()
    }

    pub fn current(&self) -> PlayerState {
        self.current
    }

    pub fn previous(&self) -> Option<PlayerState> {
        self.previous
    }

    pub fn last_metadata(&self) -> &TransitionMetadata {
        &self.last_metadata
    }

    pub fn history(&self) -> Vec<StateChange> {
        self.history.iter().cloned().collect()
    }

    pub fn stall_count(&self) -> u32 {
        self.counters.stalls
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.counters.recovery_attempts
    }

    pub fn retry_count(&self) -> u32 {
        self.counters.retries
    }

    pub fn can(&self, event: PlayerEvent) -> bool {
        next_state(self.current, event).is_some()
    }

    pub fn fire(&mut self, event: PlayerEvent) -> bool {
        self.transition(event, TransitionContext::default())
    }

    /// Apply `event`.  Returns false (and changes nothing) when the current
    /// state does not accept it.
    pub fn transition(&mut self, event: PlayerEvent, ctx: TransitionContext) -> bool {
        let from = self.current;
        let Some(to) = next_state(from, event) else {
            debug!("fsm: {} rejects {:?}", from, event);
            return false;
        };

        match to {
            PlayerState::Playing => {
                self.counters.errors = 0;
                self.counters.stalls = 0;
                self.counters.recovery_attempts = 0;
                self.counters.retries = 0;
            }
            PlayerState::Stalled => self.counters.stalls += 1,
            PlayerState::Recovering => self.counters.recovery_attempts += 1,
            PlayerState::Retrying => self.counters.retries += 1,
            PlayerState::Switching => self.counters.switches += 1,
            PlayerState::Error => self.counters.errors += 1,
            _ => {}
        }

        let metadata = TransitionMetadata {
            error_count: self.counters.errors,
            stall_count: self.counters.stalls,
            recovery_attempts: self.counters.recovery_attempts,
            retry_count: self.counters.retries,
            switch_count: self.counters.switches,
            reason: ctx.reason,
            recoverable: ctx.recoverable,
            station_id: ctx.station_id,
            op_id: ctx.op_id,
            slot: ctx.slot,
        };

        self.previous = Some(from);
        self.current = to;
        self.last_metadata = metadata.clone();

        let change = StateChange {
            from,
            to,
            event,
            metadata,
            at: Utc::now(),
        };

        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(change.clone());

        if to == PlayerState::Error {
            warn!(
                "fsm: {} -> ERROR ({})",
                from,
                change.metadata.reason.as_deref().unwrap_or("no reason")
            );
            if let Some(callback) = &self.on_error {
                callback(&change);
            }
        } else {
            debug!("fsm: {} --{:?}--> {}", from, event, to);
        }

        // No subscribers is fine.
        let _ = self.events.send(change);
        true
    }

    /// Back to IDLE from anywhere, counters cleared.  Emitted as a RESET
    /// transition so observers see it.
    pub fn reset(&mut self) {
        let from = self.current;
        self.counters = Counters::default();
        self.previous = Some(from);
        self.current = PlayerState::Idle;
        self.last_metadata = TransitionMetadata::default();
        if from != PlayerState::Idle {
            let change = StateChange {
                from,
                to: PlayerState::Idle,
                event: PlayerEvent::Reset,
                metadata: TransitionMetadata::default(),
                at: Utc::now(),
            };
            if self.history.len() == self.history_len {
                self.history.pop_front();
            }
            self.history.push_back(change.clone());
            let _ = self.events.send(change);
        }
    }

    pub fn is_playable(&self) -> bool {
        matches!(
            self.current,
            PlayerState::Ready
                | PlayerState::Playing
                | PlayerState::Paused
                | PlayerState::Waiting
                | PlayerState::PausedWaiting
                | PlayerState::Switching
        )
    }

    pub fn is_recoverable(&self) -> bool {
        // The RECOVERING entry that follows will bump the counter, so "prior"
        // attempts is the value before that.
        self.current == PlayerState::Stalled
            && self.counters.recovery_attempts < MAX_RECOVERY_ATTEMPTS
    }

    pub fn is_retryable(&self) -> bool {
        self.current == PlayerState::Error && self.counters.retries < MAX_RETRIES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn drive(fsm: &mut PlayerStateMachine, events: &[PlayerEvent]) {
        for e in events {
            assert!(fsm.fire(*e), "{:?} rejected in {}", e, fsm.current());
        }
    }

    #[test]
    fn happy_path_reaches_playing() {
        let mut fsm = PlayerStateMachine::new(100);
        drive(
            &mut fsm,
            &[PlayerEvent::Load, PlayerEvent::Ready, PlayerEvent::Play],
        );
        assert_eq!(fsm.current(), PlayerState::Playing);
        assert_eq!(fsm.previous(), Some(PlayerState::Ready));
        assert!(fsm.is_playable());
    }

    #[test]
    fn rejected_event_has_no_side_effect() {
        let mut fsm = PlayerStateMachine::new(100);
        let mut rx = fsm.subscribe();
        assert!(!fsm.fire(PlayerEvent::Play));
        assert_eq!(fsm.current(), PlayerState::Idle);
        assert!(fsm.history().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stall_counter_increments_once_per_entry() {
        let mut fsm = PlayerStateMachine::new(100);
        drive(
            &mut fsm,
            &[
                PlayerEvent::Load,
                PlayerEvent::Ready,
                PlayerEvent::Play,
                PlayerEvent::Waiting,
                PlayerEvent::Stalled,
            ],
        );
        assert_eq!(fsm.stall_count(), 1);
        // Already stalled: a second signal is rejected, counter untouched.
        assert!(!fsm.fire(PlayerEvent::Stalled));
        assert_eq!(fsm.stall_count(), 1);
        assert!(fsm.is_recoverable());
    }

    #[test]
    fn playing_clears_counters() {
        let mut fsm = PlayerStateMachine::new(100);
        drive(
            &mut fsm,
            &[
                PlayerEvent::Load,
                PlayerEvent::Error,
                PlayerEvent::Retry,
                PlayerEvent::Load,
                PlayerEvent::Ready,
                PlayerEvent::Play,
                PlayerEvent::Waiting,
                PlayerEvent::Stalled,
                PlayerEvent::Recover,
                PlayerEvent::Recovered,
                PlayerEvent::Ready,
                PlayerEvent::Play,
            ],
        );
        let meta = fsm.last_metadata();
        assert_eq!(meta.error_count, 0);
        assert_eq!(meta.stall_count, 0);
        assert_eq!(meta.recovery_attempts, 0);
        assert_eq!(meta.retry_count, 0);
    }

    #[test]
    fn recovery_guard_runs_out() {
        let mut fsm = PlayerStateMachine::new(100);
        drive(
            &mut fsm,
            &[
                PlayerEvent::Load,
                PlayerEvent::Ready,
                PlayerEvent::Play,
                PlayerEvent::Waiting,
                PlayerEvent::Stalled,
            ],
        );
        for _ in 0..MAX_RECOVERY_ATTEMPTS {
            assert!(fsm.is_recoverable());
            drive(
                &mut fsm,
                &[
                    PlayerEvent::Recover,
                    PlayerEvent::Recovered,
                    PlayerEvent::Pause,
                    PlayerEvent::Waiting,
                ],
            );
            // PAUSED_WAITING -> WAITING -> STALLED without passing PLAYING
            drive(&mut fsm, &[PlayerEvent::Resume, PlayerEvent::Stalled]);
        }
        assert_eq!(fsm.current(), PlayerState::Stalled);
        assert!(!fsm.is_recoverable());
    }

    #[test]
    fn retry_guard_runs_out() {
        let mut fsm = PlayerStateMachine::new(100);
        drive(&mut fsm, &[PlayerEvent::Error]);
        for _ in 0..MAX_RETRIES {
            assert!(fsm.is_retryable());
            drive(
                &mut fsm,
                &[PlayerEvent::Retry, PlayerEvent::Load, PlayerEvent::Error],
            );
        }
        assert!(!fsm.is_retryable());
        assert!(fsm.fire(PlayerEvent::Reset));
        assert_eq!(fsm.current(), PlayerState::Idle);
    }

    #[test]
    fn error_callback_sees_payload() {
        let mut fsm = PlayerStateMachine::new(100);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        fsm.set_error_callback(Box::new(move |change| {
            assert_eq!(change.to, PlayerState::Error);
            assert_eq!(change.metadata.recoverable, Some(false));
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        fsm.transition(
            PlayerEvent::Error,
            TransitionContext::reason("format unsupported").recoverable(false),
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(fsm.last_metadata().error_count, 1);
    }

    #[test]
    fn history_is_bounded() {
        let mut fsm = PlayerStateMachine::new(4);
        for _ in 0..5 {
            drive(&mut fsm, &[PlayerEvent::Load, PlayerEvent::Error, PlayerEvent::Reset]);
        }
        let history = fsm.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history.last().map(|c| c.to), Some(PlayerState::Idle));
    }

    #[test]
    fn reset_is_observable() {
        let mut fsm = PlayerStateMachine::new(10);
        let mut rx = fsm.subscribe();
        drive(&mut fsm, &[PlayerEvent::Load]);
        fsm.reset();
        assert_eq!(fsm.current(), PlayerState::Idle);
        assert_eq!(rx.try_recv().map(|c| c.to).ok(), Some(PlayerState::Loading));
        let reset = rx.try_recv().ok();
        assert_eq!(reset.map(|c| c.event), Some(PlayerEvent::Reset));
    }
}
