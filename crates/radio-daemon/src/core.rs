//! DaemonCore: owns the engine and turns client commands into play intents.
//!
//! Every external input (client commands, engine events, connectivity,
//! shutdown) arrives as a `DaemonEvent` on one channel and is handled in
//! order by `run`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use radio_engine::mpv::MpvBackend;
use radio_engine::network::spawn_probe;
use radio_engine::{NetworkMonitor, RecoveryResult, StreamingEngine};
use radio_proto::config::Config;
use radio_proto::protocol::{Command, Diagnostic, OpIdGenerator, PlayerState, StateChange, Station};
use radio_proto::state::{
    load_stations_from_m3u, load_stations_from_toml, parse_m3u_from_str, StateManager,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::BroadcastMessage;

#[derive(Debug)]
pub enum DaemonEvent {
    ClientCommand(Command),
    ClientConnected,
    ClientCountChanged(usize),
    EngineState(StateChange),
    EngineDiagnostic(Diagnostic),
    Online(bool),
    /// A play intent ended in an error the client should see.
    PlayFailed { station_idx: usize, message: String },
    Shutdown,
}

pub struct DaemonCore {
    config: Config,
    engine: StreamingEngine,
    state_manager: Arc<StateManager>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    event_tx: mpsc::Sender<DaemonEvent>,
    op_ids: OpIdGenerator,
    shutdown: CancellationToken,
}

impl DaemonCore {
    pub async fn new(
        config: Config,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> anyhow::Result<Self> {
        let stations = load_stations(&config).await?;
        info!("Loaded {} stations", stations.len());

        let state_manager = Arc::new(StateManager::new(config.daemon.state_file.clone(), stations));
        let volume = state_manager.get_state().await.volume;

        let network = NetworkMonitor::default();
        let backend = MpvBackend::new(volume);
        let engine = StreamingEngine::new(config.engine.clone(), &backend, network)?;

        Ok(Self {
            config,
            engine,
            state_manager,
            broadcast_tx,
            event_tx,
            op_ids: OpIdGenerator::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    pub async fn run(self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        self.spawn_forwarders();

        let _probe = spawn_probe(
            self.engine.network().clone(),
            self.config.network.probe_addr.clone(),
            Duration::from_millis(self.config.network.probe_interval_ms),
            self.config.engine.probe_timeout(),
            self.shutdown.clone(),
        );

        while let Some(event) = event_rx.recv().await {
            match event {
                DaemonEvent::ClientCommand(cmd) => self.handle_command(cmd).await,
                DaemonEvent::ClientConnected => debug!("client connected"),
                DaemonEvent::ClientCountChanged(n) => debug!("{} client(s) connected", n),
                DaemonEvent::EngineState(change) => {
                    let active = self.engine.pool().active_index().await;
                    self.state_manager.set_player_state(change.to, active).await;
                    self.send(BroadcastMessage::StateChange(change));
                    self.send(BroadcastMessage::StateUpdated);
                }
                DaemonEvent::EngineDiagnostic(diagnostic) => {
                    self.send(BroadcastMessage::Diagnostic(diagnostic));
                }
                DaemonEvent::Online(online) => {
                    self.state_manager.set_online(online).await;
                    self.send(BroadcastMessage::StateUpdated);
                }
                DaemonEvent::PlayFailed {
                    station_idx,
                    message,
                } => {
                    warn!("Station {} failed: {}", station_idx, message);
                    self.send(BroadcastMessage::Error(message));
                }
                DaemonEvent::Shutdown => {
                    info!("Shutting down");
                    break;
                }
            }
        }

        self.shutdown.cancel();
        self.engine.shutdown().await;
        Ok(())
    }

    /// Pipe engine and connectivity events into the daemon event channel.
    fn spawn_forwarders(&self) {
        let mut states = self.engine.subscribe_state();
        let tx = self.event_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    r = states.recv() => r,
                };
                match change {
                    Ok(change) => {
                        if tx.send(DaemonEvent::EngineState(change)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("state forwarder lagged by {}", n)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut diagnostics = self.engine.subscribe_diagnostics();
        let tx = self.event_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let diagnostic = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    r = diagnostics.recv() => r,
                };
                match diagnostic {
                    Ok(d) => {
                        if tx.send(DaemonEvent::EngineDiagnostic(d)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut online = self.engine.network().subscribe();
        let tx = self.event_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    r = online.changed() => {
                        if r.is_err() {
                            break;
                        }
                    }
                }
                let value = *online.borrow_and_update();
                if tx.send(DaemonEvent::Online(value)).await.is_err() {
                    break;
                }
            }
        });
    }

    async fn handle_command(&self, cmd: Command) {
        match cmd {
            Command::Play { station_idx } => self.play(station_idx).await,
            Command::Next => {
                if let Some(idx) = self.state_manager.next_index().await {
                    self.play(idx).await;
                }
            }
            Command::Prev => {
                if let Some(idx) = self.state_manager.prev_index().await {
                    self.play(idx).await;
                }
            }
            Command::Random => {
                if let Some(idx) = self.state_manager.random_index().await {
                    self.play(idx).await;
                }
            }
            Command::Stop => {
                self.engine.stop().await;
                self.state_manager.set_player_state(PlayerState::Idle, None).await;
                self.send(BroadcastMessage::StateUpdated);
            }
            Command::TogglePause => self.toggle_pause().await,
            Command::Volume { value } => {
                if let Err(e) = self.engine.set_volume(value).await {
                    self.send(BroadcastMessage::Error(e.to_string()));
                    return;
                }
                if let Err(e) = self.state_manager.set_volume(value).await {
                    warn!("Failed to persist volume: {}", e);
                }
                self.send(BroadcastMessage::StateUpdated);
            }
            Command::Reconnect => {
                let engine = self.engine.clone();
                let tx = self.broadcast_tx.clone();
                tokio::spawn(async move {
                    match engine.reconnect().await {
                        RecoveryResult::Recovered { attempts } => {
                            info!("Reconnected after {} attempt(s)", attempts)
                        }
                        RecoveryResult::Failed { error, .. } => {
                            let message = format!("Reconnect failed: {error}");
                            let _ = tx.send(BroadcastMessage::Error(message));
                        }
                        RecoveryResult::Cancelled => debug!("Reconnect cancelled"),
                    }
                });
            }
            Command::Preload { station_idxs } => {
                let mut list = Vec::new();
                for idx in station_idxs {
                    match self.state_manager.station(idx).await {
                        Some(station) => {
                            let url = station.url.clone();
                            list.push((station, url));
                        }
                        None => debug!("Preload: no station {}", idx),
                    }
                }
                if !list.is_empty() {
                    self.engine.preload_stations(list);
                }
            }
            Command::GetState => self.send(BroadcastMessage::StateUpdated),
        }
    }

    /// Mint a fresh opId and hand the switch to the engine.  The switch runs
    /// in its own task so a newer command can supersede it.
    async fn play(&self, station_idx: usize) {
        let Some(station) = self.state_manager.station(station_idx).await else {
            self.send(BroadcastMessage::Error(format!("No station at index {station_idx}")));
            return;
        };
        if let Err(e) = self.state_manager.set_current_station(station_idx).await {
            warn!("Failed to persist current station: {}", e);
        }
        self.send(BroadcastMessage::StateUpdated);

        let op_id = self.op_ids.mint();
        let volume = self.state_manager.get_state().await.volume;
        info!("Play {} ({}) as {:?}", station.name, station.url, op_id);

        let engine = self.engine.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let url = station.url.clone();
            match engine.switch_to_station(&station, &url, volume, op_id).await {
                Ok(handle) => debug!("{:?} playing on slot {}", op_id, handle.slot),
                Err(e) if e.is_stale() => debug!("{:?} superseded: {}", op_id, e),
                Err(e) => {
                    let _ = tx
                        .send(DaemonEvent::PlayFailed {
                            station_idx,
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        });
    }

    async fn toggle_pause(&self) {
        match self.engine.state().await {
            PlayerState::Paused | PlayerState::PausedWaiting => {
                if let Err(e) = self.engine.resume().await {
                    self.send(BroadcastMessage::Error(format!("Resume failed: {e}")));
                }
            }
            PlayerState::Idle => {
                let current = self.state_manager.get_state().await.current_station;
                if let Some(idx) = current {
                    self.play(idx).await;
                }
            }
            _ => {
                if !self.engine.pause().await {
                    debug!("Nothing to pause");
                }
            }
        }
    }

    fn send(&self, message: BroadcastMessage) {
        let _ = self.broadcast_tx.send(message);
    }
}

/// Local TOML file first, then the configured m3u (URL or path).
async fn load_stations(config: &Config) -> anyhow::Result<Vec<Station>> {
    let toml_path = &config.stations.stations_toml;
    if toml_path.exists() {
        info!("Loading stations from {:?}", toml_path);
        return load_stations_from_toml(toml_path);
    }

    let source = config.stations.m3u_url.trim();
    if source.is_empty() {
        warn!("No station list configured");
        return Ok(Vec::new());
    }
    if source.starts_with("http://") || source.starts_with("https://") {
        info!("Fetching stations from {}", source);
        let body = reqwest::get(source)
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("fetching {source}"))?
            .text()
            .await?;
        return parse_m3u_from_str(&body);
    }
    load_stations_from_m3u(Path::new(source)).map_err(|e| {
        error!("Failed to read {}: {}", source, e);
        e
    })
}
