use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 2;

/// Stable identifier of a station within the loaded station list.
pub type StationId = u64;

// ── operation ids ─────────────────────────────────────────────────────────────

/// Token identifying one user playback intent.  Every asynchronous step
/// captures the id that was current when it started and drops its result if
/// the id has moved on in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Monotonic opId source.  Owned by the caller; mint one per play intent.
#[derive(Debug)]
pub struct OpIdGenerator {
    next: AtomicU64,
}

impl Default for OpIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl OpIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn mint(&self) -> OpId {
        OpId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

// ── wire commands / broadcasts ────────────────────────────────────────────────

/// Messages sent from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Play { station_idx: usize },
    Stop,
    Next,
    Prev,
    Random,
    TogglePause,
    Volume { value: f32 },
    /// Force a reconnect of the active slot.
    Reconnect,
    /// Warm idle slots with the given stations.
    Preload { station_idxs: Vec<usize> },
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: DaemonState,
    },
    State {
        data: DaemonState,
    },
    StateChange {
        change: StateChange,
    },
    Diagnostic {
        diagnostic: Diagnostic,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

// ── player state machine vocabulary ───────────────────────────────────────────

/// Global playback-intent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    #[default]
    Idle,
    Loading,
    Loaded,
    Buffering,
    Ready,
    Playing,
    Paused,
    Waiting,
    PausedWaiting,
    Switching,
    Stalled,
    Recovering,
    Error,
    Retrying,
}

impl PlayerState {
    pub const ALL: [PlayerState; 14] = [
        PlayerState::Idle,
        PlayerState::Loading,
        PlayerState::Loaded,
        PlayerState::Buffering,
        PlayerState::Ready,
        PlayerState::Playing,
        PlayerState::Paused,
        PlayerState::Waiting,
        PlayerState::PausedWaiting,
        PlayerState::Switching,
        PlayerState::Stalled,
        PlayerState::Recovering,
        PlayerState::Error,
        PlayerState::Retrying,
    ];

    /// Stable rest states: nothing is in flight.
    pub fn is_rest_state(&self) -> bool {
        matches!(self, PlayerState::Idle | PlayerState::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerState::Idle => "IDLE",
            PlayerState::Loading => "LOADING",
            PlayerState::Loaded => "LOADED",
            PlayerState::Buffering => "BUFFERING",
            PlayerState::Ready => "READY",
            PlayerState::Playing => "PLAYING",
            PlayerState::Paused => "PAUSED",
            PlayerState::Waiting => "WAITING",
            PlayerState::PausedWaiting => "PAUSED_WAITING",
            PlayerState::Switching => "SWITCHING",
            PlayerState::Stalled => "STALLED",
            PlayerState::Recovering => "RECOVERING",
            PlayerState::Error => "ERROR",
            PlayerState::Retrying => "RETRYING",
        }
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs accepted by the player state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerEvent {
    Load,
    Loaded,
    Buffering,
    Ready,
    Play,
    Force,
    Pause,
    Resume,
    Waiting,
    End,
    Stop,
    Error,
    Switch,
    Stalled,
    Recover,
    Recovered,
    Failed,
    Retry,
    Reset,
}

impl PlayerEvent {
    pub const ALL: [PlayerEvent; 19] = [
        PlayerEvent::Load,
        PlayerEvent::Loaded,
        PlayerEvent::Buffering,
        PlayerEvent::Ready,
        PlayerEvent::Play,
        PlayerEvent::Force,
        PlayerEvent::Pause,
        PlayerEvent::Resume,
        PlayerEvent::Waiting,
        PlayerEvent::End,
        PlayerEvent::Stop,
        PlayerEvent::Error,
        PlayerEvent::Switch,
        PlayerEvent::Stalled,
        PlayerEvent::Recover,
        PlayerEvent::Recovered,
        PlayerEvent::Failed,
        PlayerEvent::Retry,
        PlayerEvent::Reset,
    ];
}

/// Counters and context attached to every transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionMetadata {
    pub error_count: u32,
    pub stall_count: u32,
    pub recovery_attempts: u32,
    pub retry_count: u32,
    pub switch_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_id: Option<StationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<OpId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: PlayerState,
    pub to: PlayerState,
    pub event: PlayerEvent,
    pub metadata: TransitionMetadata,
    pub at: DateTime<Utc>,
}

// ── diagnostics ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticKind {
    StalledEvent,
    ProgressDetected,
    StallDetected,
    BufferRecovered,
    LowBuffer,
    RecoveryStarted,
    RecoverySuccess,
    RecoveryFailed,
    NetworkOffline,
    NetworkOnline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    #[serde(rename = "type")]
    pub kind: DiagnosticKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_id: Option<StationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<OpId>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind) -> Self {
        Self {
            kind,
            index: None,
            station_id: None,
            op_id: None,
            detail: String::new(),
        }
    }

    pub fn slot(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn station(mut self, station_id: Option<StationId>, op_id: Option<OpId>) -> Self {
        self.station_id = station_id;
        self.op_id = op_id;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

// ── daemon snapshot ───────────────────────────────────────────────────────────

/// Full state of the daemon.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonState {
    /// Bumped on every state change.
    #[serde(default)]
    pub rev: u64,
    pub stations: Vec<Station>,
    pub current_station: Option<usize>,
    pub volume: f32,
    #[serde(default)]
    pub player_state: PlayerState,
    #[serde(default)]
    pub active_slot: Option<usize>,
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Station {
    /// Assigned by the loader; unique within one station list.
    #[serde(default)]
    pub id: StationId,
    pub name: String,
    pub url: String,
    /// Short description / blurb
    #[serde(default)]
    pub description: String,
    /// Parent network or brand (e.g. "NTS", "SomaFM", "BBC")
    #[serde(default)]
    pub network: String,
    /// Searchable tags (genre, style, language, etc.)
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Station {
    /// True when the stream URL points at an HLS playlist.
    pub fn is_hls(&self) -> bool {
        is_hls_url(&self.url)
    }
}

pub fn is_hls_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase().ends_with(".m3u8")
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_encode_decode() {
        let msg = Message::Command(Command::Play { station_idx: 5 });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::Play { station_idx }) => assert_eq!(station_idx, 5),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_partial_frame_is_rejected() {
        let encoded = Message::Command(Command::Reconnect).encode().unwrap();
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(Message::decode(&encoded[..3]).is_err());
    }

    #[test]
    fn test_diagnostic_wire_names() {
        let diag = Diagnostic::new(DiagnosticKind::StallDetected)
            .slot(1)
            .detail("no progress for 8.0s");
        let json = serde_json::to_value(&diag).unwrap();
        assert_eq!(json["type"], "stall-detected");
        assert_eq!(json["index"], 1);
        assert!(json.get("station_id").is_none());
    }

    #[test]
    fn test_player_state_wire_names() {
        let json = serde_json::to_string(&PlayerState::PausedWaiting).unwrap();
        assert_eq!(json, "\"PAUSED_WAITING\"");
        assert_eq!(PlayerState::PausedWaiting.to_string(), "PAUSED_WAITING");
    }

    #[test]
    fn test_op_ids_are_monotonic() {
        let ids = OpIdGenerator::new();
        let a = ids.mint();
        let b = ids.mint();
        assert!(b > a);
    }

    #[test]
    fn test_hls_detection_ignores_query() {
        assert!(is_hls_url("https://cdn.example/live/master.M3U8?token=1"));
        assert!(!is_hls_url("https://ice.example/stream.mp3"));
        assert!(!is_hls_url("https://ice.example/stream?format=.m3u8x"));
    }
}
