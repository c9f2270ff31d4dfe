use proptest::prelude::*;
use radio_engine::fsm::{next_state, PlayerStateMachine, MAX_RECOVERY_ATTEMPTS, MAX_RETRIES};
use radio_engine::TransitionContext;
use radio_proto::protocol::{PlayerEvent, PlayerState};

fn any_event() -> impl Strategy<Value = PlayerEvent> {
    (0..PlayerEvent::ALL.len()).prop_map(|i| PlayerEvent::ALL[i])
}

proptest! {
    #[test]
    fn unlisted_transitions_change_nothing(events in prop::collection::vec(any_event(), 0..64)) {
        let mut fsm = PlayerStateMachine::new(32);
        for event in events {
            let before = fsm.current();
            let expected = next_state(before, event);
            let accepted = fsm.fire(event);
            prop_assert_eq!(accepted, expected.is_some());
            prop_assert_eq!(fsm.current(), expected.unwrap_or(before));
        }
    }

    #[test]
    fn history_is_bounded_and_chained(events in prop::collection::vec(any_event(), 0..128)) {
        let mut fsm = PlayerStateMachine::new(16);
        for event in events {
            fsm.fire(event);
        }
        let history = fsm.history();
        prop_assert!(history.len() <= 16);
        for pair in history.windows(2) {
            prop_assert_eq!(pair[0].to, pair[1].from);
        }
        if let Some(last) = history.last() {
            prop_assert_eq!(last.to, fsm.current());
        }
    }

    #[test]
    fn playing_clears_failure_counters(events in prop::collection::vec(any_event(), 0..64)) {
        let mut fsm = PlayerStateMachine::new(64);
        for event in events {
            fsm.fire(event);
            if fsm.current() == PlayerState::Playing {
                prop_assert_eq!(fsm.stall_count(), 0);
                prop_assert_eq!(fsm.recovery_attempts(), 0);
                prop_assert_eq!(fsm.retry_count(), 0);
            }
        }
    }
}

#[test]
fn every_state_is_reachable_from_idle() {
    use std::collections::{HashSet, VecDeque};

    let mut seen = HashSet::from([PlayerState::Idle]);
    let mut queue = VecDeque::from([PlayerState::Idle]);
    while let Some(state) = queue.pop_front() {
        for event in PlayerEvent::ALL {
            if let Some(next) = next_state(state, event) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
    }
    assert_eq!(seen.len(), PlayerState::ALL.len());
}

#[test]
fn recovery_budget_runs_out() {
    let mut fsm = PlayerStateMachine::new(64);
    for event in [
        PlayerEvent::Load,
        PlayerEvent::Ready,
        PlayerEvent::Play,
        PlayerEvent::Waiting,
        PlayerEvent::Stalled,
    ] {
        assert!(fsm.fire(event));
    }

    for _ in 0..MAX_RECOVERY_ATTEMPTS {
        assert!(fsm.is_recoverable());
        assert!(fsm.fire(PlayerEvent::Recover));
        assert!(fsm.fire(PlayerEvent::Recovered));
        // back to STALLED without ever reaching PLAYING
        for event in [
            PlayerEvent::Pause,
            PlayerEvent::Waiting,
            PlayerEvent::Resume,
            PlayerEvent::Stalled,
        ] {
            assert!(fsm.fire(event));
        }
    }
    assert_eq!(fsm.current(), PlayerState::Stalled);
    assert_eq!(fsm.recovery_attempts(), MAX_RECOVERY_ATTEMPTS);
    assert!(!fsm.is_recoverable());
}

#[test]
fn retry_budget_runs_out() {
    let mut fsm = PlayerStateMachine::new(64);
    assert!(fsm.fire(PlayerEvent::Load));
    for _ in 0..MAX_RETRIES {
        assert!(fsm.transition(
            PlayerEvent::Error,
            TransitionContext::reason("network").recoverable(true)
        ));
        assert!(fsm.is_retryable());
        assert!(fsm.fire(PlayerEvent::Retry));
        assert!(fsm.fire(PlayerEvent::Load));
    }
    assert!(fsm.fire(PlayerEvent::Error));
    assert_eq!(fsm.retry_count(), MAX_RETRIES);
    assert!(!fsm.is_retryable());
}
