mod common;

use common::{settle, station, test_config, url, FakeBackend};
use proptest::prelude::*;
use radio_engine::{EngineError, NetworkMonitor, StreamingEngine};
use radio_proto::protocol::OpId;

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn reconnect_under_another_op_is_refused(current in 1u64..1_000, captured in 1u64..1_000) {
        prop_assume!(current != captured);

        let err = paused_runtime().block_on(async {
            let backend = FakeBackend::new();
            let engine =
                StreamingEngine::new(test_config(), &backend, NetworkMonitor::default()).unwrap();
            let handle = engine
                .switch_to_station(&station(1), &url(1), 0.5, OpId(current))
                .await
                .unwrap();
            settle().await;
            let err = engine
                .pool()
                .reconnect_slot(handle.slot, OpId(captured), 1)
                .await
                .unwrap_err();
            engine.shutdown().await;
            err
        });

        prop_assert!(err.is_stale());
        let is_context_changed = matches!(
            err,
            EngineError::ContextChanged { captured: c, current: Some(now) }
                if c == OpId(captured) && now == OpId(current)
        );
        prop_assert!(is_context_changed);
    }
}
