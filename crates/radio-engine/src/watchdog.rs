//! Stall detection.
//!
//! `StallWatchdog` is the pure comparison logic: feed it one progress sample
//! per tick and it says whether anything moved.  `spawn_watchdog` runs it on
//! an interval against a pool slot and reports through the diagnostic channel.

use std::sync::Arc;
use std::time::Duration;

use radio_proto::config::EngineConfig;
use radio_proto::protocol::{Diagnostic, DiagnosticKind, OpId, StationId};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pool::PlaybackPool;

/// Smallest position / buffer change that counts as movement.
const PROGRESS_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub position: f64,
    pub buffered_end: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// First sample, nothing to compare against yet.
    Baseline,
    Progressed {
        /// Movement resumed after at least one idle tick.
        after_idle: bool,
    },
    Idle {
        idle_for: Duration,
    },
    /// Idle past the threshold.  Reported exactly once.
    Stalled {
        idle_for: Duration,
    },
    /// Still stalled; already reported.
    StillStalled,
}

#[derive(Debug)]
pub struct StallWatchdog {
    threshold: Duration,
    last: Option<ProgressSample>,
    last_progress: Instant,
    idle_ticks: u32,
    stalled: bool,
}

impl StallWatchdog {
    pub fn new(threshold: Duration, now: Instant) -> Self {
        Self {
            threshold,
            last: None,
            last_progress: now,
            idle_ticks: 0,
            stalled: false,
        }
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn tick(&mut self, sample: ProgressSample, now: Instant) -> Verdict {
        let Some(last) = self.last.replace(sample) else {
            return Verdict::Baseline;
        };

        let moved = sample.position > last.position + PROGRESS_EPSILON
            || sample.buffered_end > last.buffered_end + PROGRESS_EPSILON;
        if moved {
            let after_idle = self.idle_ticks > 0;
            self.last_progress = now;
            self.idle_ticks = 0;
            self.stalled = false;
            return Verdict::Progressed { after_idle };
        }

        self.idle_ticks += 1;
        let idle_for = now.saturating_duration_since(self.last_progress);
        if self.stalled {
            Verdict::StillStalled
        } else if idle_for > self.threshold {
            self.stalled = true;
            Verdict::Stalled { idle_for }
        } else {
            Verdict::Idle { idle_for }
        }
    }
}

/// Buffered-ahead level below which the slot counts as running low.
/// Segment delivery arrives in coarse chunks, so HLS gets a lower bar.
pub fn low_buffer_threshold(is_hls: bool, min_buffer_ahead: f64) -> f64 {
    if is_hls {
        min_buffer_ahead * 0.25
    } else {
        min_buffer_ahead * 0.5
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogSettings {
    pub interval: Duration,
    pub stall_threshold: Duration,
    pub min_buffer_ahead: f64,
}

impl From<&EngineConfig> for WatchdogSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            interval: config.watchdog_interval(),
            stall_threshold: config.stall_threshold(),
            min_buffer_ahead: config.min_buffer_ahead_secs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallSignal {
    pub index: usize,
    pub station_id: Option<StationId>,
    pub op_id: Option<OpId>,
    pub idle_for: Duration,
}

/// Stops the watchdog task when stopped or dropped.
#[derive(Debug)]
pub struct WatchdogHandle {
    index: usize,
    op_id: Option<OpId>,
    token: CancellationToken,
}

impl WatchdogHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn op_id(&self) -> Option<OpId> {
        self.op_id
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Watch slot `index` while it serves `op_id`.  Ends on its own after
/// reporting a stall or once the slot moves to another op.
pub fn spawn_watchdog(
    pool: Arc<PlaybackPool>,
    index: usize,
    op_id: Option<OpId>,
    settings: WatchdogSettings,
    diagnostics: broadcast::Sender<Diagnostic>,
    stalls: mpsc::UnboundedSender<StallSignal>,
) -> WatchdogHandle {
    let token = CancellationToken::new();
    let stop = token.clone();

    tokio::spawn(async move {
        let start = Instant::now();
        let mut watchdog = StallWatchdog::new(settings.stall_threshold, start);
        let mut ticker = tokio::time::interval_at(start + settings.interval, settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut low = false;

        debug!("watchdog: started on slot {} ({:?})", index, op_id);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(metrics) = pool.slot_metrics(index).await else {
                break;
            };
            if metrics.op_id != op_id || metrics.station_id.is_none() {
                debug!("watchdog: slot {} changed hands, stopping", index);
                break;
            }

            let diag = |kind| {
                Diagnostic::new(kind)
                    .slot(index)
                    .station(metrics.station_id, op_id)
            };

            let ahead = metrics.buffered_ahead();
            let threshold = low_buffer_threshold(metrics.is_hls, settings.min_buffer_ahead);
            if ahead < threshold && !low {
                low = true;
                let _ = diagnostics.send(diag(DiagnosticKind::LowBuffer).detail(format!("{ahead:.2}s ahead")));
            } else if ahead >= threshold && low {
                low = false;
                let _ = diagnostics.send(diag(DiagnosticKind::BufferRecovered).detail(format!("{ahead:.2}s ahead")));
            }

            let sample = ProgressSample {
                position: metrics.position,
                buffered_end: metrics.buffered_end,
            };
            match watchdog.tick(sample, Instant::now()) {
                Verdict::Progressed { after_idle: true } => {
                    let _ = diagnostics.send(diag(DiagnosticKind::ProgressDetected));
                }
                Verdict::Stalled { idle_for } => {
                    info!("watchdog: slot {} stalled, no progress for {:?}", index, idle_for);
                    let _ = diagnostics.send(
                        diag(DiagnosticKind::StallDetected).detail(format!("{}ms", idle_for.as_millis())),
                    );
                    let _ = stalls.send(StallSignal {
                        index,
                        station_id: metrics.station_id,
                        op_id,
                        idle_for,
                    });
                    // Recovery decides what happens next.
                    break;
                }
                _ => {}
            }
        }
        stop.cancel();
        debug!("watchdog: stopped on slot {}", index);
    });

    WatchdogHandle {
        index,
        op_id,
        token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(position: f64, buffered_end: f64) -> ProgressSample {
        ProgressSample {
            position,
            buffered_end,
        }
    }

    #[test]
    fn stall_is_reported_once() {
        let t0 = Instant::now();
        let tick = Duration::from_millis(1500);
        let mut wd = StallWatchdog::new(Duration::from_secs(8), t0);

        assert_eq!(wd.tick(sample(10.0, 14.0), t0), Verdict::Baseline);
        let mut stalls = 0;
        for n in 1..=10u32 {
            if let Verdict::Stalled { .. } = wd.tick(sample(10.0, 14.0), t0 + tick * n) {
                stalls += 1;
            }
        }
        assert_eq!(stalls, 1);
        assert!(wd.is_stalled());
        assert_eq!(wd.tick(sample(10.0, 14.0), t0 + tick * 11), Verdict::StillStalled);
    }

    #[test]
    fn buffer_growth_counts_as_progress() {
        let t0 = Instant::now();
        let mut wd = StallWatchdog::new(Duration::from_secs(8), t0);
        wd.tick(sample(5.0, 6.0), t0);
        assert!(matches!(
            wd.tick(sample(5.0, 6.0), t0 + Duration::from_secs(2)),
            Verdict::Idle { .. }
        ));
        assert_eq!(
            wd.tick(sample(5.0, 7.5), t0 + Duration::from_secs(4)),
            Verdict::Progressed { after_idle: true }
        );
        // the idle clock restarted at the last progress
        assert!(matches!(
            wd.tick(sample(5.0, 7.5), t0 + Duration::from_secs(11)),
            Verdict::Idle { idle_for } if idle_for == Duration::from_secs(7)
        ));
    }

    #[test]
    fn progress_clears_stall() {
        let t0 = Instant::now();
        let mut wd = StallWatchdog::new(Duration::from_secs(1), t0);
        wd.tick(sample(0.0, 0.0), t0);
        assert!(matches!(
            wd.tick(sample(0.0, 0.0), t0 + Duration::from_secs(2)),
            Verdict::Stalled { .. }
        ));
        wd.tick(sample(0.5, 0.5), t0 + Duration::from_secs(3));
        assert!(!wd.is_stalled());
    }

    #[test]
    fn hls_threshold_is_lower() {
        assert_eq!(low_buffer_threshold(true, 4.0), 1.0);
        assert_eq!(low_buffer_threshold(false, 4.0), 2.0);
    }
}
