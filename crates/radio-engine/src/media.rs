//! The decoder seam.
//!
//! A `MediaBackend` hands out one `MediaElement` per playback slot.  Elements
//! are black boxes that fetch, demux and decode a stream; all the engine sees
//! is the async control surface below plus the low-level `MediaEvent`s the
//! element pushes into its `MediaEventSink`.
//!
//! ```text
//!   MediaElement ──emit──▶ MediaEventSink ──(index, MediaEvent)──▶ pool pump
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::MediaError;

/// A resolved source ready to hand to a decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSource {
    pub url: String,
    /// Segment-based delivery through the HLS pipeline.
    pub hls: bool,
}

/// Raw notifications from a media element.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    LoadStart,
    LoadedMetadata,
    LoadedData,
    CanPlay,
    Playing,
    Pause,
    Waiting,
    /// Data stopped arriving (informational; the watchdog decides).
    Stalled,
    TimeUpdate { position: f64 },
    Progress { buffered_end: f64 },
    Error(MediaError),
    Ended,
    Abort,
}

/// Sender half handed to an element at creation, tagged with its slot.
#[derive(Debug, Clone)]
pub struct MediaEventSink {
    index: usize,
    tx: mpsc::UnboundedSender<(usize, MediaEvent)>,
}

impl MediaEventSink {
    pub fn new(index: usize, tx: mpsc::UnboundedSender<(usize, MediaEvent)>) -> Self {
        Self { index, tx }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns false once the pool has gone away.
    pub fn emit(&self, event: MediaEvent) -> bool {
        self.tx.send((self.index, event)).is_ok()
    }
}

/// One decodable output channel.
#[async_trait]
pub trait MediaElement: Send + Sync {
    /// Bind a new source and start buffering (paused).
    async fn load(&self, source: &MediaSource) -> Result<(), MediaError>;
    async fn play(&self) -> Result<(), MediaError>;
    async fn pause(&self) -> Result<(), MediaError>;
    /// Volume in `[0, 1]`; callers clamp.
    async fn set_volume(&self, volume: f32) -> Result<(), MediaError>;
    /// Drop the current source and any connection behind it.
    async fn unload(&self) -> Result<(), MediaError>;
    /// Tear the decode pipeline down and build a fresh one.
    async fn rebuild(&self) -> Result<(), MediaError>;
}

/// A shared mixing graph with one gain stage per slot.
pub trait MixGraph: Send + Sync {
    fn set_gain(&self, index: usize, gain: f32);
    /// Linear ramp; returns immediately, the graph runs it on its own clock.
    fn ramp_gain(&self, index: usize, from: f32, to: f32, over: Duration);
    fn gain(&self, index: usize) -> f32;
}

pub trait MediaBackend: Send + Sync {
    fn create(&self, index: usize, sink: MediaEventSink) -> anyhow::Result<Arc<dyn MediaElement>>;

    /// Backends without a mixing graph get the stepped-volume crossfade.
    fn mix_graph(&self) -> Option<Arc<dyn MixGraph>> {
        None
    }
}
