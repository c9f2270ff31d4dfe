/// mpv-backed media elements: one idle mpv process per playback slot, driven
/// over its JSON IPC socket.
///
/// ```text
///   MpvElement::connect()
///         │
///         ├── writer_task   ← MpvRequest via mpsc, serialised → socket
///         ├── reader_task   ← JSON lines from socket
///         │                      ├── response (request_id) → matched oneshot
///         │                      └── event / property-change → event channel
///         └── event pump    ← translates mpv events into MediaEvents
/// ```
///
/// mpv has no shared mixing graph, so crossfades over these elements use
/// stepped per-element volume.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::error::{MediaError, MediaErrorKind};
use crate::media::{MediaBackend, MediaElement, MediaEvent, MediaEventSink, MediaSource};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

const IPC_TIMEOUT: Duration = Duration::from_secs(5);

// ── observation property IDs ──────────────────────────────────────────────────

pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSE: u64 = 2;
pub const OBS_TIME_POS: u64 = 4;
pub const OBS_CACHE_PAUSED: u64 = 8;
pub const OBS_CACHE_TIME: u64 = 9;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An unsolicited line from mpv (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

/// Classify mpv's `file_error` string.
fn classify_file_error(file_error: &str) -> MediaErrorKind {
    let e = file_error.to_ascii_lowercase();
    if e.contains("unrecognized file format") {
        MediaErrorKind::FormatUnsupported
    } else if e.contains("demux") {
        MediaErrorKind::Demuxer
    } else if e.contains("no audio or video") {
        MediaErrorKind::Decode
    } else if e.contains("loading failed") || e.contains("network") || e.contains("timed out") {
        MediaErrorKind::Network
    } else {
        MediaErrorKind::Unknown
    }
}

/// Map one mpv event onto element events.
pub fn translate(event: &MpvEvent) -> Vec<MediaEvent> {
    if let Some((id, data)) = event.as_property_change() {
        return match id {
            OBS_CORE_IDLE if data.as_bool() == Some(false) => vec![MediaEvent::Playing],
            OBS_PAUSE if data.as_bool() == Some(true) => vec![MediaEvent::Pause],
            OBS_CACHE_PAUSED if data.as_bool() == Some(true) => vec![MediaEvent::Waiting],
            OBS_TIME_POS => data
                .as_f64()
                .map(|position| vec![MediaEvent::TimeUpdate { position }])
                .unwrap_or_default(),
            OBS_CACHE_TIME => data
                .as_f64()
                .map(|buffered_end| vec![MediaEvent::Progress { buffered_end }])
                .unwrap_or_default(),
            _ => Vec::new(),
        };
    }

    match event.event_name() {
        Some("start-file") => vec![MediaEvent::LoadStart],
        Some("file-loaded") => vec![
            MediaEvent::LoadedMetadata,
            MediaEvent::LoadedData,
            MediaEvent::CanPlay,
        ],
        Some("end-file") => match event.raw.get("reason").and_then(Value::as_str) {
            Some("eof") => vec![MediaEvent::Ended],
            Some("error") => {
                let detail = event
                    .raw
                    .get("file_error")
                    .and_then(Value::as_str)
                    .unwrap_or("playback error");
                vec![MediaEvent::Error(MediaError::new(
                    classify_file_error(detail),
                    detail,
                ))]
            }
            Some("quit") => vec![MediaEvent::Abort],
            // "stop" / "redirect" follow our own loadfile / stop commands
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

// ── IPC handle ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(IPC_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn set_property(&self, name: &str, value: Value) -> anyhow::Result<()> {
        self.send(json!(["set_property", name, value])).await?;
        Ok(())
    }

    pub async fn observe_all_properties(&self) {
        let props = [
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_PAUSE, "pause"),
            (OBS_TIME_POS, "time-pos"),
            (OBS_CACHE_PAUSED, "paused-for-cache"),
            (OBS_CACHE_TIME, "demuxer-cache-time"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);
    tokio::spawn(writer_task(write_half, cmd_rx, Arc::clone(&pending)));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));
    MpvHandle { tx: cmd_tx }
}

async fn fail_pending(pending: &PendingMap, why: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("mpv IPC {}", why)));
    }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(Value::as_u64) {
                    let Some(tx) = pending.lock().await.remove(&req_id) else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                        continue;
                    };
                    let result = if val["error"].as_str() == Some("success") {
                        Ok(val)
                    } else {
                        let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                        debug!("mpv reader: response req={} err={}", req_id, err);
                        Err(anyhow::anyhow!("mpv error: {}", err))
                    };
                    let _ = tx.send(result);
                } else if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, "read error").await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // register before writing so the reader can match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── element ───────────────────────────────────────────────────────────────────

struct Connection {
    process: tokio::process::Child,
    handle: MpvHandle,
    pump: JoinHandle<()>,
}

impl Connection {
    fn alive(&mut self) -> bool {
        self.process.try_wait().ok().flatten().is_none()
    }

    async fn close(mut self) {
        self.pump.abort();
        let _ = self.process.kill().await;
    }
}

/// A playback slot backed by its own mpv process.  The process is spawned
/// on first use and respawned on `rebuild` or after it dies.
pub struct MpvElement {
    index: usize,
    sink: MediaEventSink,
    volume: Mutex<f32>,
    conn: Mutex<Option<Connection>>,
}

fn ipc_error(e: anyhow::Error) -> MediaError {
    MediaError::new(MediaErrorKind::Unknown, format!("mpv: {e}"))
}

impl MpvElement {
    pub fn new(index: usize, sink: MediaEventSink, volume: f32) -> Self {
        Self {
            index,
            sink,
            volume: Mutex::new(volume),
            conn: Mutex::new(None),
        }
    }

    async fn handle(&self) -> Result<MpvHandle, MediaError> {
        let mut conn = self.conn.lock().await;
        if let Some(existing) = conn.as_mut() {
            if existing.alive() {
                return Ok(existing.handle.clone());
            }
            warn!("mpv[{}]: process died, respawning", self.index);
        }
        if let Some(dead) = conn.take() {
            dead.close().await;
        }
        let volume = *self.volume.lock().await;
        let fresh = self.spawn(volume).await.map_err(ipc_error)?;
        let handle = fresh.handle.clone();
        *conn = Some(fresh);
        Ok(handle)
    }

    async fn spawn(&self, volume: f32) -> anyhow::Result<Connection> {
        let binary = radio_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        let socket_name = radio_proto::platform::mpv_socket_name(self.index);

        #[cfg(unix)]
        let _ = tokio::fs::remove_file(&socket_name).await;

        info!("mpv[{}]: spawning process", self.index);
        let process = tokio::process::Command::new(binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--pause")
            .arg("--quiet")
            .arg(radio_proto::platform::mpv_socket_arg(self.index))
            .arg(format!("--volume={}", volume_pct(volume)))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let (event_tx, mut event_rx) = mpsc::channel::<MpvEvent>(256);
        let handle = connect(&socket_name, event_tx).await?;
        handle.observe_all_properties().await;

        let sink = self.sink.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                for media_event in translate(&event) {
                    if !sink.emit(media_event) {
                        return;
                    }
                }
            }
        });

        Ok(Connection {
            process,
            handle,
            pump,
        })
    }
}

fn volume_pct(volume: f32) -> i64 {
    (volume * 100.0).clamp(0.0, 100.0).round() as i64
}

#[cfg(unix)]
async fn connect(socket_name: &str, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
    let socket_path = std::path::PathBuf::from(socket_name);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if socket_path.exists() {
            break;
        }
    }
    if !socket_path.exists() {
        anyhow::bail!("mpv IPC socket did not appear");
    }
    let stream = UnixStream::connect(&socket_path).await?;
    let (read_half, write_half) = stream.into_split();
    Ok(start_io_tasks(read_half, write_half, event_tx))
}

#[cfg(windows)]
async fn connect(socket_name: &str, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
    let pipe_path = format!(r"\\.\pipe\{}", socket_name);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(client) = ClientOptions::new().open(&pipe_path) {
            let (read_half, write_half) = tokio::io::split(client);
            return Ok(start_io_tasks(read_half, write_half, event_tx));
        }
    }
    anyhow::bail!("mpv named pipe did not appear")
}

#[async_trait]
impl MediaElement for MpvElement {
    async fn load(&self, source: &MediaSource) -> Result<(), MediaError> {
        let handle = self.handle().await?;
        handle
            .set_property("pause", json!(true))
            .await
            .map_err(ipc_error)?;
        handle
            .send(json!(["loadfile", source.url]))
            .await
            .map_err(|e| MediaError::network(e.to_string()))?;
        Ok(())
    }

    async fn play(&self) -> Result<(), MediaError> {
        let handle = self.handle().await?;
        handle.set_property("pause", json!(false)).await.map_err(ipc_error)
    }

    async fn pause(&self) -> Result<(), MediaError> {
        let handle = self.handle().await?;
        handle.set_property("pause", json!(true)).await.map_err(ipc_error)
    }

    async fn set_volume(&self, volume: f32) -> Result<(), MediaError> {
        *self.volume.lock().await = volume;
        // no process yet: the volume goes on the command line at spawn
        let handle = match self.conn.lock().await.as_ref() {
            Some(conn) => conn.handle.clone(),
            None => return Ok(()),
        };
        handle
            .set_property("volume", json!(volume_pct(volume)))
            .await
            .map_err(ipc_error)
    }

    async fn unload(&self) -> Result<(), MediaError> {
        let handle = match self.conn.lock().await.as_ref() {
            Some(conn) => conn.handle.clone(),
            None => return Ok(()),
        };
        handle.send(json!(["stop"])).await.map_err(ipc_error)?;
        Ok(())
    }

    async fn rebuild(&self) -> Result<(), MediaError> {
        info!("mpv[{}]: rebuilding", self.index);
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close().await;
        }
        self.handle().await.map(|_| ())
    }
}

/// One mpv process per slot, created lazily.
#[derive(Debug, Clone)]
pub struct MpvBackend {
    initial_volume: f32,
}

impl MpvBackend {
    pub fn new(initial_volume: f32) -> Self {
        Self {
            initial_volume: initial_volume.clamp(0.0, 1.0),
        }
    }
}

impl Default for MpvBackend {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl MediaBackend for MpvBackend {
    fn create(&self, index: usize, sink: MediaEventSink) -> anyhow::Result<Arc<dyn MediaElement>> {
        Ok(Arc::new(MpvElement::new(index, sink, self.initial_volume)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(raw: Value) -> MpvEvent {
        MpvEvent { raw }
    }

    #[test]
    fn file_loaded_means_ready_to_play() {
        let out = translate(&ev(json!({"event": "file-loaded"})));
        assert_eq!(out.last(), Some(&MediaEvent::CanPlay));
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn property_changes_map_to_element_events() {
        let playing = ev(json!({"event": "property-change", "id": OBS_CORE_IDLE, "data": false}));
        assert_eq!(translate(&playing), vec![MediaEvent::Playing]);

        let idle = ev(json!({"event": "property-change", "id": OBS_CORE_IDLE, "data": true}));
        assert!(translate(&idle).is_empty());

        let cache = ev(json!({"event": "property-change", "id": OBS_CACHE_PAUSED, "data": true}));
        assert_eq!(translate(&cache), vec![MediaEvent::Waiting]);

        let buffered = ev(json!({"event": "property-change", "id": OBS_CACHE_TIME, "data": 12.5}));
        assert_eq!(
            translate(&buffered),
            vec![MediaEvent::Progress { buffered_end: 12.5 }]
        );
    }

    #[test]
    fn end_file_reasons() {
        assert_eq!(
            translate(&ev(json!({"event": "end-file", "reason": "eof"}))),
            vec![MediaEvent::Ended]
        );
        assert!(translate(&ev(json!({"event": "end-file", "reason": "stop"}))).is_empty());

        let failed = translate(&ev(json!({
            "event": "end-file",
            "reason": "error",
            "file_error": "unrecognized file format"
        })));
        match failed.as_slice() {
            [MediaEvent::Error(e)] => assert_eq!(e.kind, MediaErrorKind::FormatUnsupported),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn loading_failures_are_network_errors() {
        assert_eq!(classify_file_error("loading failed"), MediaErrorKind::Network);
        assert_eq!(classify_file_error("Demuxer error"), MediaErrorKind::Demuxer);
        assert_eq!(classify_file_error("???"), MediaErrorKind::Unknown);
    }
}
