//! Streaming playback engine: a pool of media elements with crossfaded
//! switching, stall detection, backoff recovery and an explicit player state
//! machine, fronted by [`StreamingEngine`].

pub mod crossfade;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod media;
pub mod mpv;
pub mod network;
pub mod pool;
pub mod recovery;
pub mod slot;
pub mod source;
pub mod watchdog;

pub use engine::{EngineSnapshot, StreamingEngine};
pub use error::{EngineError, MediaError, MediaErrorKind, Result};
pub use fsm::{PlayerStateMachine, TransitionContext};
pub use media::{MediaBackend, MediaElement, MediaEvent, MediaEventSink, MediaSource, MixGraph};
pub use network::NetworkMonitor;
pub use pool::{PlaybackHandle, PlaybackPool};
pub use recovery::{RecoveryManager, RecoveryOptions, RecoveryResult};
pub use watchdog::StallWatchdog;
