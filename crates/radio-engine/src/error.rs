//! Error taxonomy for the playback engine.

use std::fmt;
use std::time::Duration;

use radio_proto::protocol::OpId;
use thiserror::Error;

/// Coarse class of a decoder / network failure, as reported by a media element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaErrorKind {
    Network,
    Decode,
    Demuxer,
    FormatUnsupported,
    Aborted,
    Timeout,
    Unknown,
}

impl MediaErrorKind {
    /// Unsupported formats will not start working on a retry.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, MediaErrorKind::FormatUnsupported | MediaErrorKind::Aborted)
    }
}

impl fmt::Display for MediaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaErrorKind::Network => "network",
            MediaErrorKind::Decode => "decode",
            MediaErrorKind::Demuxer => "demuxer",
            MediaErrorKind::FormatUnsupported => "format unsupported",
            MediaErrorKind::Aborted => "aborted",
            MediaErrorKind::Timeout => "timeout",
            MediaErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct MediaError {
    pub kind: MediaErrorKind,
    pub message: String,
}

impl MediaError {
    pub fn new(kind: MediaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::Network, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::Decode, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::Aborted, message)
    }
}

/// Main error type of the engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Every slot is active or mid-transition.  Callers should retry later.
    #[error("No available audio elements in pool")]
    NoAvailableSlot,

    /// Same condition as `NoAvailableSlot`, hit by a best-effort preload.
    #[error("pool exhausted, preload skipped")]
    PoolExhausted,

    #[error("load timed out after {0:?}")]
    LoadTimeout(Duration),

    #[error(transparent)]
    Media(#[from] MediaError),

    /// The slot or intent an async step captured has moved on.
    #[error("playback context changed (captured {captured}, current {current:?})")]
    ContextChanged {
        captured: OpId,
        current: Option<OpId>,
    },

    #[error("switch superseded by a newer request")]
    Superseded,

    #[error("slot {0} is active and cannot be reset")]
    SlotActive(usize),

    #[error("no active slot")]
    NoActiveSlot,

    #[error("invalid volume {0}")]
    InvalidVolume(f32),

    #[error("recovery failed after {attempts} attempt(s): {reason}")]
    RecoveryExhausted { attempts: u32, reason: String },

    #[error("media backend error: {0}")]
    Backend(String),

    #[error("engine is shut down")]
    Shutdown,
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn media_kind(&self) -> Option<MediaErrorKind> {
        match self {
            EngineError::Media(e) => Some(e.kind),
            EngineError::LoadTimeout(_) => Some(MediaErrorKind::Timeout),
            _ => None,
        }
    }

    /// Network-class failures: worth retrying once connectivity allows it.
    pub fn is_network(&self) -> bool {
        matches!(
            self.media_kind(),
            Some(MediaErrorKind::Network | MediaErrorKind::Timeout)
        )
    }

    pub fn is_demuxer(&self) -> bool {
        self.media_kind() == Some(MediaErrorKind::Demuxer)
    }

    /// Errors that indicate the work was superseded rather than failed.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            EngineError::ContextChanged { .. } | EngineError::Superseded | EngineError::Shutdown
        )
    }

    /// Whether local retry is worth attempting at all.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Media(e) => e.kind.is_recoverable(),
            EngineError::LoadTimeout(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_message_is_stable() {
        assert_eq!(
            EngineError::NoAvailableSlot.to_string(),
            "No available audio elements in pool"
        );
    }

    #[test]
    fn classification() {
        let unsupported: EngineError =
            MediaError::new(MediaErrorKind::FormatUnsupported, "no demuxer").into();
        assert!(!unsupported.is_recoverable());
        assert!(!unsupported.is_network());

        let net: EngineError = MediaError::network("connection reset").into();
        assert!(net.is_recoverable());
        assert!(net.is_network());

        assert!(EngineError::LoadTimeout(Duration::from_secs(15)).is_network());
        assert!(EngineError::Superseded.is_stale());
        assert!(!EngineError::NoAvailableSlot.is_recoverable());
    }
}
