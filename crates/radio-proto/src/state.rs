use crate::protocol::{DaemonState, PlayerState, Station, StationId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    pub last_station_idx: Option<usize>,
    pub volume: f32,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            last_station_idx: None,
            volume: 0.7,
        }
    }
}

pub struct StateManager {
    state: Arc<RwLock<DaemonState>>,
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf, stations: Vec<Station>) -> Self {
        let persistent = Self::load_persistent(&state_file);

        let current_station = persistent
            .last_station_idx
            .filter(|idx| *idx < stations.len());
        let state = DaemonState {
            rev: 1,
            stations,
            current_station,
            volume: persistent.volume.clamp(0.0, 1.0),
            player_state: PlayerState::Idle,
            active_slot: None,
            online: true,
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            state_file,
        }
    }

    pub fn arc(&self) -> Arc<RwLock<DaemonState>> {
        Arc::clone(&self.state)
    }

    pub async fn get_state(&self) -> DaemonState {
        self.state.read().await.clone()
    }

    pub async fn station(&self, idx: usize) -> Option<Station> {
        self.state.read().await.stations.get(idx).cloned()
    }

    pub async fn set_current_station(&self, idx: usize) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.current_station = Some(idx);
            state.rev += 1;
        }
        self.save().await
    }

    pub async fn set_player_state(&self, player_state: PlayerState, active_slot: Option<usize>) {
        let mut state = self.state.write().await;
        state.player_state = player_state;
        state.active_slot = active_slot;
        state.rev += 1;
    }

    pub async fn set_online(&self, online: bool) {
        let mut state = self.state.write().await;
        state.online = online;
        state.rev += 1;
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.volume = volume.clamp(0.0, 1.0);
            state.rev += 1;
        }
        self.save().await
    }

    /// Index after the current one, wrapping.  `None` with an empty list.
    pub async fn next_index(&self) -> Option<usize> {
        let state = self.state.read().await;
        let len = state.stations.len();
        if len == 0 {
            return None;
        }
        Some(state.current_station.map_or(0, |current| (current + 1) % len))
    }

    pub async fn prev_index(&self) -> Option<usize> {
        let state = self.state.read().await;
        let len = state.stations.len();
        if len == 0 {
            return None;
        }
        Some(match state.current_station {
            Some(0) | None => len - 1,
            Some(current) => current - 1,
        })
    }

    pub async fn random_index(&self) -> Option<usize> {
        use rand::Rng;

        let len = self.state.read().await.stations.len();
        if len == 0 {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..len))
    }

    async fn save(&self) -> anyhow::Result<()> {
        let persistent = {
            let state = self.state.read().await;
            PersistentState {
                last_station_idx: state.current_station,
                volume: state.volume,
            }
        };

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &Path) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(state_file) {
            if let Ok(persistent) = serde_json::from_str::<PersistentState>(&content) {
                return persistent;
            }
        }
        PersistentState::default()
    }
}

/// Give every station a stable id derived from its position (1-based, so 0
/// never names a real station).
pub fn assign_station_ids(stations: &mut [Station]) {
    for (idx, station) in stations.iter_mut().enumerate() {
        station.id = idx as StationId + 1;
    }
}

pub fn parse_m3u_from_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let mut stations = Vec::new();
    let mut pending_name: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if let Some(comma_idx) = rest.find(',') {
                pending_name = Some(rest[comma_idx + 1..].trim().to_string());
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let url = line.to_string();
        let name = pending_name.take().unwrap_or_else(|| url.clone());

        stations.push(Station {
            name,
            url,
            ..Station::default()
        });
    }

    assign_station_ids(&mut stations);
    Ok(stations)
}

pub fn load_stations_from_m3u(path: &Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_m3u_from_str(&content)
}

// ── TOML station loader ───────────────────────────────────────────────────────

/// Intermediate struct that matches the TOML `[[station]]` table.
/// We keep this separate from `Station` so the TOML schema can diverge from
/// the wire protocol struct without breaking either.
#[derive(Debug, serde::Deserialize)]
struct TomlStationFile {
    station: Vec<TomlStation>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlStation {
    name: String,
    url: String,
    #[serde(default)]
    network: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
}

pub fn load_stations_from_toml(path: &Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_stations_from_toml_str(&content)
}

pub fn parse_stations_from_toml_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let file: TomlStationFile = toml::from_str(content)?;
    let mut stations: Vec<Station> = file
        .station
        .into_iter()
        .map(|s| Station {
            id: 0,
            name: s.name,
            url: s.url,
            network: s.network,
            description: s.description,
            tags: s.tags,
        })
        .collect();
    assign_station_ids(&mut stations);
    Ok(stations)
}
