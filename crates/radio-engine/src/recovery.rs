//! Retry orchestration keyed by recovery id.
//!
//! Each id owns at most one task.  The task runs the caller's attempt function
//! under exponential backoff with jitter, waits out network outages and is
//! woken early when connectivity returns.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use radio_proto::config::RecoveryConfig;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, MediaErrorKind, Result};

/// Up to this fraction of the exponential delay is added as jitter.
pub const MAX_JITTER: f64 = 0.3;
/// Delays computed this soon after coming back online are shortened.
pub const ONLINE_BOOST_WINDOW: Duration = Duration::from_secs(5);
pub const ONLINE_BOOST_CAP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryTaskState {
    Pending,
    Attempting,
    Waiting,
    Paused,
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub enum RecoveryResult {
    Recovered { attempts: u32 },
    Failed { attempts: u32, error: EngineError },
    Cancelled,
}

impl RecoveryResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RecoveryResult::Recovered { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryOptions {
    /// Total attempts allowed; defaults to the configured `max_retries`.
    pub max_retries: Option<u32>,
    /// Fixed delays after attempt 1, 2, ...  The last entry repeats.
    pub delay_schedule: Option<Vec<Duration>>,
}

/// Delay before the attempt that follows failed attempt `attempt` (1-based).
/// `jitter` is the random fraction in `[0, MAX_JITTER]`.
pub fn compute_delay(
    config: &RecoveryConfig,
    attempt: u32,
    schedule: Option<&[Duration]>,
    jitter: f64,
    recently_online: bool,
) -> Duration {
    let attempt = attempt.max(1);
    let delay = match schedule.filter(|s| !s.is_empty()) {
        Some(schedule) => {
            let idx = (attempt as usize - 1).min(schedule.len() - 1);
            schedule[idx]
        }
        None => {
            let exp = config.base_delay().as_secs_f64()
                * config.multiplier.powi(attempt as i32 - 1);
            let jittered = exp * (1.0 + jitter.clamp(0.0, MAX_JITTER));
            Duration::from_secs_f64(jittered.min(config.max_delay().as_secs_f64()))
        }
    };

    if recently_online {
        (delay / 2).min(ONLINE_BOOST_CAP)
    } else {
        delay
    }
}

/// Whether a failed attempt deserves another go.
pub fn should_retry(error: &EngineError, attempt: u32, offline: bool) -> bool {
    if error.is_stale() || error.media_kind() == Some(MediaErrorKind::FormatUnsupported) {
        return false;
    }
    error.is_network() || (error.is_demuxer() && attempt < 2) || offline
}

struct TaskEntry {
    serial: u64,
    state: RecoveryTaskState,
    attempts: u32,
    token: CancellationToken,
    wake: Arc<Notify>,
    outcome: watch::Receiver<Option<RecoveryResult>>,
}

#[derive(Debug, Clone, Copy)]
struct NetworkView {
    online: bool,
    online_since: Option<Instant>,
}

struct Shared {
    config: RecoveryConfig,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    network: Mutex<NetworkView>,
    next_serial: AtomicU64,
}

impl Shared {
    async fn set_task_state(&self, id: &str, serial: u64, state: RecoveryTaskState, attempts: u32) {
        if let Some(task) = self.tasks.lock().await.get_mut(id) {
            if task.serial == serial {
                task.state = state;
                task.attempts = attempts;
            }
        }
    }

    async fn is_online(&self) -> bool {
        self.network.lock().await.online
    }

    async fn next_delay(&self, attempt: u32, schedule: Option<&[Duration]>) -> Duration {
        let recently_online = self
            .network
            .lock()
            .await
            .online_since
            .is_some_and(|t| t.elapsed() < ONLINE_BOOST_WINDOW);
        let jitter = rand::thread_rng().gen_range(0.0..=MAX_JITTER);
        compute_delay(&self.config, attempt, schedule, jitter, recently_online)
    }

    async fn finish(&self, id: &str, serial: u64) {
        let mut tasks = self.tasks.lock().await;
        if tasks.get(id).is_some_and(|t| t.serial == serial) {
            tasks.remove(id);
        }
    }
}

enum Step<T> {
    Done(T),
    Cancelled,
}

#[derive(Clone)]
pub struct RecoveryManager {
    shared: Arc<Shared>,
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                tasks: Mutex::new(HashMap::new()),
                network: Mutex::new(NetworkView {
                    online: true,
                    online_since: None,
                }),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    /// Run `attempt_fn` until it succeeds, fails terminally or is cancelled.
    /// A second call with an id that is already running joins the existing
    /// task and gets the same outcome; its `attempt_fn` is dropped.
    pub async fn start_recovery<F, Fut>(
        &self,
        id: impl Into<String>,
        attempt_fn: F,
        options: RecoveryOptions,
    ) -> RecoveryResult
    where
        F: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = id.into();
        let mut outcome = {
            let mut tasks = self.shared.tasks.lock().await;
            match tasks.get(&id) {
                Some(existing) => {
                    debug!("recovery {}: already running, joining", id);
                    existing.outcome.clone()
                }
                None => {
                    let serial = self.shared.next_serial.fetch_add(1, Ordering::Relaxed);
                    let token = CancellationToken::new();
                    let wake = Arc::new(Notify::new());
                    let (tx, rx) = watch::channel(None);
                    tasks.insert(
                        id.clone(),
                        TaskEntry {
                            serial,
                            state: RecoveryTaskState::Pending,
                            attempts: 0,
                            token: token.clone(),
                            wake: Arc::clone(&wake),
                            outcome: rx.clone(),
                        },
                    );
                    let max_retries = options
                        .max_retries
                        .unwrap_or(self.shared.config.max_retries)
                        .max(1);
                    tokio::spawn(run_task(
                        Arc::clone(&self.shared),
                        id.clone(),
                        serial,
                        attempt_fn,
                        max_retries,
                        options.delay_schedule,
                        token,
                        wake,
                        tx,
                    ));
                    rx
                }
            }
        };

        loop {
            if let Some(result) = outcome.borrow().clone() {
                return result;
            }
            if outcome.changed().await.is_err() {
                return outcome.borrow().clone().unwrap_or(RecoveryResult::Cancelled);
            }
        }
    }

    /// Stop the task for `id`.  Returns false if there was none.
    pub async fn cancel_recovery(&self, id: &str) -> bool {
        let Some(task) = self.shared.tasks.lock().await.remove(id) else {
            return false;
        };
        debug!("recovery {}: cancelled", id);
        task.token.cancel();
        true
    }

    pub async fn cancel_all(&self) {
        let drained: Vec<_> = self.shared.tasks.lock().await.drain().collect();
        for (id, task) in drained {
            debug!("recovery {}: cancelled", id);
            task.token.cancel();
        }
    }

    pub async fn is_active(&self, id: &str) -> bool {
        self.shared.tasks.lock().await.contains_key(id)
    }

    pub async fn task_state(&self, id: &str) -> Option<(RecoveryTaskState, u32)> {
        self.shared
            .tasks
            .lock()
            .await
            .get(id)
            .map(|t| (t.state, t.attempts))
    }

    pub async fn is_online(&self) -> bool {
        self.shared.is_online().await
    }

    /// Connectivity changed.  Offline marks running attempts paused; online
    /// cuts every pending backoff short.
    pub async fn set_online(&self, online: bool) {
        {
            let mut network = self.shared.network.lock().await;
            if network.online == online {
                return;
            }
            network.online = online;
            if online {
                network.online_since = Some(Instant::now());
            }
        }

        let mut tasks = self.shared.tasks.lock().await;
        for (id, task) in tasks.iter_mut() {
            match (online, task.state) {
                (false, RecoveryTaskState::Attempting) => {
                    debug!("recovery {}: paused while offline", id);
                    task.state = RecoveryTaskState::Paused;
                }
                (true, RecoveryTaskState::Waiting) => {
                    debug!("recovery {}: back online, rescheduling", id);
                    task.wake.notify_waiters();
                }
                _ => {}
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task<F, Fut>(
    shared: Arc<Shared>,
    id: String,
    serial: u64,
    mut attempt_fn: F,
    max_retries: u32,
    schedule: Option<Vec<Duration>>,
    token: CancellationToken,
    wake: Arc<Notify>,
    tx: watch::Sender<Option<RecoveryResult>>,
) where
    F: FnMut(u32) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut attempt = 0;
    let result = loop {
        attempt += 1;
        let state = if shared.is_online().await {
            RecoveryTaskState::Attempting
        } else {
            RecoveryTaskState::Paused
        };
        shared.set_task_state(&id, serial, state, attempt).await;

        let fut = attempt_fn(attempt);
        let step = tokio::select! {
            _ = token.cancelled() => Step::Cancelled,
            r = fut => Step::Done(r),
        };
        let error = match step {
            Step::Cancelled => break RecoveryResult::Cancelled,
            Step::Done(Ok(())) => {
                shared
                    .set_task_state(&id, serial, RecoveryTaskState::Success, attempt)
                    .await;
                info!("recovery {}: succeeded on attempt {}", id, attempt);
                break RecoveryResult::Recovered { attempts: attempt };
            }
            Step::Done(Err(e)) if e.is_stale() => {
                debug!("recovery {}: context moved on ({})", id, e);
                break RecoveryResult::Cancelled;
            }
            Step::Done(Err(e)) => e,
        };

        let offline = !shared.is_online().await;
        if attempt >= max_retries || !should_retry(&error, attempt, offline) {
            shared
                .set_task_state(&id, serial, RecoveryTaskState::Failed, attempt)
                .await;
            warn!("recovery {}: giving up after {} attempt(s): {}", id, attempt, error);
            break RecoveryResult::Failed {
                attempts: attempt,
                error,
            };
        }

        let delay = shared.next_delay(attempt, schedule.as_deref()).await;
        debug!(
            "recovery {}: attempt {} failed ({}), next in {:?}",
            id, attempt, error, delay
        );
        // Registered before the task shows as waiting, so a wake sent in
        // between is not lost and none is left over for a later wait.
        let mut wakeup = std::pin::pin!(wake.notified());
        wakeup.as_mut().enable();
        shared
            .set_task_state(&id, serial, RecoveryTaskState::Waiting, attempt)
            .await;

        let waited = tokio::select! {
            _ = token.cancelled() => Step::Cancelled,
            _ = tokio::time::sleep(delay) => Step::Done(()),
            _ = &mut wakeup => Step::Done(()),
        };
        if let Step::Cancelled = waited {
            break RecoveryResult::Cancelled;
        }
        if shared.network.lock().await.online_since.is_some_and(|t| t.elapsed() < delay) {
            // Woken by reconnection: short fixed pause instead of the backoff.
            let resumed = tokio::select! {
                _ = token.cancelled() => Step::Cancelled,
                _ = tokio::time::sleep(shared.config.online_resume()) => Step::Done(()),
            };
            if let Step::Cancelled = resumed {
                break RecoveryResult::Cancelled;
            }
        }
    };

    shared.finish(&id, serial).await;
    let _ = tx.send(Some(result));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use std::sync::atomic::AtomicU32;

    fn fail(kind: MediaErrorKind) -> Result<()> {
        Err(MediaError::new(kind, "test failure").into())
    }

    fn config() -> RecoveryConfig {
        RecoveryConfig {
            max_retries: 5,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            online_resume_ms: 500,
        }
    }

    #[test]
    fn exponential_delay_with_jitter_bounds() {
        let c = config();
        assert_eq!(compute_delay(&c, 1, None, 0.0, false), Duration::from_secs(1));
        assert_eq!(compute_delay(&c, 1, None, 0.3, false), Duration::from_millis(1300));
        assert_eq!(compute_delay(&c, 3, None, 0.0, false), Duration::from_secs(4));
        // jitter is clamped
        assert_eq!(compute_delay(&c, 1, None, 5.0, false), Duration::from_millis(1300));
        assert_eq!(compute_delay(&c, 10, None, 0.3, false), Duration::from_secs(30));
    }

    #[test]
    fn schedule_and_online_boost() {
        let c = config();
        let schedule = [Duration::from_millis(200), Duration::from_secs(6)];
        assert_eq!(compute_delay(&c, 1, Some(&schedule), 0.3, false), Duration::from_millis(200));
        assert_eq!(compute_delay(&c, 4, Some(&schedule), 0.0, false), Duration::from_secs(6));
        assert_eq!(compute_delay(&c, 4, Some(&schedule), 0.0, true), Duration::from_secs(2));
        assert_eq!(compute_delay(&c, 1, None, 0.0, true), Duration::from_millis(500));
    }

    #[test]
    fn retry_policy() {
        let net: EngineError = MediaError::network("reset").into();
        let demux: EngineError = MediaError::new(MediaErrorKind::Demuxer, "bad packet").into();
        let decode: EngineError = MediaError::decode("corrupt frame").into();
        let unsupported: EngineError =
            MediaError::new(MediaErrorKind::FormatUnsupported, "no codec").into();

        assert!(should_retry(&net, 4, false));
        assert!(should_retry(&demux, 1, false));
        assert!(!should_retry(&demux, 2, false));
        assert!(!should_retry(&decode, 1, false));
        assert!(should_retry(&decode, 1, true));
        assert!(!should_retry(&unsupported, 1, true));
        assert!(!should_retry(&EngineError::Superseded, 1, true));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let manager = RecoveryManager::new(config());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let started = Instant::now();

        let result = manager
            .start_recovery(
                "slot:0",
                move |attempt| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            fail(MediaErrorKind::Network)
                        } else {
                            Ok(())
                        }
                    }
                },
                RecoveryOptions::default(),
            )
            .await;

        assert!(matches!(result, RecoveryResult::Recovered { attempts: 3 }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s..1.3s then 2s..2.6s
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3) && waited <= Duration::from_millis(3900));
        assert!(!manager.is_active("slot:0").await);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_start_joins_existing_task() {
        let manager = RecoveryManager::new(config());
        let calls = Arc::new(AtomicU32::new(0));

        let attempt = |calls: Arc<AtomicU32>| {
            move |_attempt: u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<(), EngineError>(())
                }
            }
        };

        let (a, b) = tokio::join!(
            manager.start_recovery("switch:7", attempt(Arc::clone(&calls)), RecoveryOptions::default()),
            manager.start_recovery("switch:7", attempt(Arc::clone(&calls)), RecoveryOptions::default()),
        );
        assert!(a.is_success() && b.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_fails_immediately() {
        let manager = RecoveryManager::new(config());
        let result = manager
            .start_recovery(
                "slot:1",
                |_| async { fail(MediaErrorKind::FormatUnsupported) },
                RecoveryOptions::default(),
            )
            .await;
        assert!(matches!(result, RecoveryResult::Failed { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn max_retries_is_respected() {
        let manager = RecoveryManager::new(config());
        let result = manager
            .start_recovery(
                "slot:2",
                |_| async { fail(MediaErrorKind::Network) },
                RecoveryOptions {
                    max_retries: Some(2),
                    delay_schedule: Some(vec![Duration::from_millis(10)]),
                },
            )
            .await;
        assert!(matches!(result, RecoveryResult::Failed { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_ends_the_task() {
        let manager = RecoveryManager::new(config());
        let runner = manager.clone();
        let handle = tokio::spawn(async move {
            runner
                .start_recovery(
                    "slot:0",
                    |_| async { fail(MediaErrorKind::Network) },
                    RecoveryOptions {
                        max_retries: Some(10),
                        delay_schedule: Some(vec![Duration::from_secs(60)]),
                    },
                )
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            manager.task_state("slot:0").await,
            Some((RecoveryTaskState::Waiting, 1))
        );
        assert!(manager.cancel_recovery("slot:0").await);
        assert!(matches!(handle.await.unwrap(), RecoveryResult::Cancelled));
        assert!(!manager.cancel_recovery("slot:0").await);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_context_counts_as_cancelled() {
        let manager = RecoveryManager::new(config());
        let result = manager
            .start_recovery(
                "slot:0",
                |_| async {
                    Result::<()>::Err(EngineError::ContextChanged {
                        captured: radio_proto::protocol::OpId(1),
                        current: Some(radio_proto::protocol::OpId(2)),
                    })
                },
                RecoveryOptions::default(),
            )
            .await;
        assert!(matches!(result, RecoveryResult::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn coming_online_cuts_backoff_short() {
        let manager = RecoveryManager::new(config());
        manager.set_online(false).await;

        let runner = manager.clone();
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            runner
                .start_recovery(
                    "slot:0",
                    |attempt| async move {
                        if attempt == 1 {
                            fail(MediaErrorKind::Decode)
                        } else {
                            Ok(())
                        }
                    },
                    RecoveryOptions {
                        max_retries: None,
                        delay_schedule: Some(vec![Duration::from_secs(30)]),
                    },
                )
                .await
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        manager.set_online(true).await;
        let result = handle.await.unwrap();
        assert!(matches!(result, RecoveryResult::Recovered { attempts: 2 }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_pauses_a_running_attempt() {
        let manager = RecoveryManager::new(config());
        let runner = manager.clone();
        let handle = tokio::spawn(async move {
            runner
                .start_recovery(
                    "slot:0",
                    |_| async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok::<(), EngineError>(())
                    },
                    RecoveryOptions::default(),
                )
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            manager.task_state("slot:0").await,
            Some((RecoveryTaskState::Attempting, 1))
        );
        manager.set_online(false).await;
        assert_eq!(
            manager.task_state("slot:0").await,
            Some((RecoveryTaskState::Paused, 1))
        );

        assert!(matches!(handle.await.unwrap(), RecoveryResult::Recovered { attempts: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn unused_online_wake_does_not_cut_the_next_backoff() {
        let manager = RecoveryManager::new(config());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let runner = manager.clone();
        tokio::spawn(async move {
            runner
                .start_recovery(
                    "slot:0",
                    move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async { fail(MediaErrorKind::Network) }
                    },
                    RecoveryOptions {
                        max_retries: None,
                        delay_schedule: Some(vec![Duration::from_secs(4)]),
                    },
                )
                .await
        });

        // t=100ms: the wake cuts the 4s backoff, attempt 2 follows the 500ms resume pause
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.set_online(false).await;
        manager.set_online(true).await;

        // t=200ms: nobody is waiting on the wake this time
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.set_online(false).await;
        manager.set_online(true).await;

        // attempt 2 fails at 600ms and waits its boosted 2s in full
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            manager.task_state("slot:0").await,
            Some((RecoveryTaskState::Waiting, 2))
        );

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        manager.cancel_all().await;
    }
}
