//! Scriptable in-memory media backend for engine tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use radio_engine::media::{
    MediaBackend, MediaElement, MediaEvent, MediaEventSink, MediaSource, MixGraph,
};
use radio_engine::{MediaError, MediaErrorKind};
use radio_proto::config::EngineConfig;
use radio_proto::protocol::Station;

/// How an element answers a `load` of a matching URL.
#[derive(Debug, Clone)]
pub enum Script {
    Ready,
    Fail(MediaErrorKind),
    /// Fail the first `n` loads, then behave like `Ready`.
    FailTimes(u32, MediaErrorKind),
    /// Never become ready.
    Hang,
    /// Become ready, but report `waiting` instead of `playing` on play.
    Starve,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Load(String),
    Play,
    Pause,
    SetVolume(f32),
    Unload,
    Rebuild,
}

#[derive(Default)]
struct Scripts {
    rules: Vec<(String, Script)>,
}

impl Scripts {
    /// Next outcome for `url`; `FailTimes` counts down.
    fn take(&mut self, url: &str) -> Script {
        for (prefix, script) in self.rules.iter_mut() {
            if url.starts_with(prefix.as_str()) {
                return match script {
                    Script::FailTimes(0, _) => Script::Ready,
                    Script::FailTimes(n, kind) => {
                        *n -= 1;
                        Script::Fail(*kind)
                    }
                    other => other.clone(),
                };
            }
        }
        Script::Ready
    }
}

pub struct FakeElement {
    pub index: usize,
    sink: MediaEventSink,
    scripts: Arc<Mutex<Scripts>>,
    calls: Mutex<Vec<Call>>,
    volume: Mutex<f32>,
    starving: Mutex<bool>,
    transport_delay: Arc<Mutex<Option<Duration>>>,
}

impl FakeElement {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn volumes(&self) -> Vec<f32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::SetVolume(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn loads(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Load(url) => Some(url),
                _ => None,
            })
            .collect()
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock().unwrap()
    }

    /// Push a raw event as if the decoder produced it.
    pub fn emit(&self, event: MediaEvent) {
        self.sink.emit(event);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn linger(&self) {
        let delay = *self.transport_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl MediaElement for FakeElement {
    async fn load(&self, source: &MediaSource) -> Result<(), MediaError> {
        self.record(Call::Load(source.url.clone()));
        let script = self.scripts.lock().unwrap().take(&source.url);
        *self.starving.lock().unwrap() = matches!(script, Script::Starve);
        self.sink.emit(MediaEvent::LoadStart);
        match script {
            Script::Ready | Script::FailTimes(..) | Script::Starve => {
                self.sink.emit(MediaEvent::LoadedMetadata);
                self.sink.emit(MediaEvent::LoadedData);
                self.sink.emit(MediaEvent::Progress { buffered_end: 5.0 });
                self.sink.emit(MediaEvent::CanPlay);
            }
            Script::Fail(kind) => {
                self.sink.emit(MediaEvent::Error(MediaError::new(kind, "scripted failure")));
            }
            Script::Hang => {}
        }
        Ok(())
    }

    async fn play(&self) -> Result<(), MediaError> {
        self.record(Call::Play);
        if *self.starving.lock().unwrap() {
            self.sink.emit(MediaEvent::Waiting);
        } else {
            self.sink.emit(MediaEvent::Playing);
        }
        self.linger().await;
        Ok(())
    }

    async fn pause(&self) -> Result<(), MediaError> {
        self.record(Call::Pause);
        self.sink.emit(MediaEvent::Pause);
        self.linger().await;
        Ok(())
    }

    async fn set_volume(&self, volume: f32) -> Result<(), MediaError> {
        self.record(Call::SetVolume(volume));
        *self.volume.lock().unwrap() = volume;
        Ok(())
    }

    async fn unload(&self) -> Result<(), MediaError> {
        self.record(Call::Unload);
        Ok(())
    }

    async fn rebuild(&self) -> Result<(), MediaError> {
        self.record(Call::Rebuild);
        Ok(())
    }
}

/// Records gain changes; ramps jump straight to their end value.
#[derive(Default)]
pub struct FakeMix {
    gains: Mutex<Vec<f32>>,
    pub ramps: Mutex<Vec<(usize, f32, f32)>>,
}

impl MixGraph for FakeMix {
    fn set_gain(&self, index: usize, gain: f32) {
        let mut gains = self.gains.lock().unwrap();
        if gains.len() <= index {
            gains.resize(index + 1, 0.0);
        }
        gains[index] = gain;
    }

    fn ramp_gain(&self, index: usize, from: f32, to: f32, _over: Duration) {
        self.ramps.lock().unwrap().push((index, from, to));
        self.set_gain(index, to);
    }

    fn gain(&self, index: usize) -> f32 {
        self.gains.lock().unwrap().get(index).copied().unwrap_or(0.0)
    }
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    scripts: Arc<Mutex<Scripts>>,
    elements: Arc<Mutex<Vec<Arc<FakeElement>>>>,
    transport_delay: Arc<Mutex<Option<Duration>>>,
    pub mix: Option<Arc<FakeMix>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mix() -> Self {
        Self {
            mix: Some(Arc::new(FakeMix::default())),
            ..Self::default()
        }
    }

    pub fn script(&self, url_prefix: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .rules
            .push((url_prefix.to_string(), script));
    }

    /// Make `play` / `pause` return only after `delay`, their event already sent.
    pub fn slow_transport(&self, delay: Duration) {
        *self.transport_delay.lock().unwrap() = Some(delay);
    }

    pub fn element(&self, index: usize) -> Arc<FakeElement> {
        Arc::clone(&self.elements.lock().unwrap()[index])
    }
}

impl MediaBackend for FakeBackend {
    fn create(&self, index: usize, sink: MediaEventSink) -> anyhow::Result<Arc<dyn MediaElement>> {
        let element = Arc::new(FakeElement {
            index,
            sink,
            scripts: Arc::clone(&self.scripts),
            calls: Mutex::new(Vec::new()),
            volume: Mutex::new(1.0),
            starving: Mutex::new(false),
            transport_delay: Arc::clone(&self.transport_delay),
        });
        self.elements.lock().unwrap().push(Arc::clone(&element));
        Ok(element)
    }

    fn mix_graph(&self) -> Option<Arc<dyn MixGraph>> {
        self.mix.clone().map(|m| m as Arc<dyn MixGraph>)
    }
}

pub fn station(id: u64) -> Station {
    Station {
        id,
        name: format!("Station {id}"),
        url: url(id),
        ..Station::default()
    }
}

pub fn url(id: u64) -> String {
    format!("http://radio{id}.test/stream")
}

/// Short fades and timeouts so paused-clock tests stay readable.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig {
        pool_size: 3,
        fade_ms: 100,
        fade_steps: 4,
        load_timeout_ms: 2_000,
        load_timeout_cap_ms: 4_000,
        watchdog_interval_ms: 500,
        stall_threshold_ms: 2_000,
        probe_timeout_ms: 1_000,
        ..EngineConfig::default()
    };
    config.recovery.base_delay_ms = 100;
    config.recovery.max_delay_ms = 1_000;
    config
}

/// Let spawned tasks (the event pump in particular) catch up.
pub async fn settle() {
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
