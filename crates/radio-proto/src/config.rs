use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub stations: StationsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port of the local relay that proxy-rewritten stream URLs point at.
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

/// Where the station list comes from: a local TOML file or an m3u URL/path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationsConfig {
    /// Path to a local TOML station file (highest priority).
    /// Defaults to `$XDG_CONFIG_HOME/radio/stations.toml`.
    #[serde(default = "default_stations_toml")]
    pub stations_toml: PathBuf,
    /// URL or file path for an m3u station list (fallback when TOML not found).
    #[serde(default)]
    pub m3u_url: String,
}

// ── engine ────────────────────────────────────────────────────────────────────

/// Tunables of the streaming playback engine.  All durations are in
/// milliseconds on disk; use the accessor methods for `Duration`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_fade_ms")]
    pub fade_ms: u64,
    #[serde(default = "default_fade_steps")]
    pub fade_steps: u32,
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
    #[serde(default = "default_load_timeout_cap_ms")]
    pub load_timeout_cap_ms: u64,
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
    #[serde(default = "default_stall_threshold_ms")]
    pub stall_threshold_ms: u64,
    /// Buffer-ahead the engine aims for; the low-buffer threshold is a
    /// fraction of this that depends on the stream type.
    #[serde(default = "default_min_buffer_ahead_secs")]
    pub min_buffer_ahead_secs: f64,
    #[serde(default = "default_error_debounce_ms")]
    pub error_debounce_ms: u64,
    /// Readiness probe timeout for a single recovery attempt.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Delay used for tasks that were waiting when the network came back.
    #[serde(default = "default_online_resume_ms")]
    pub online_resume_ms: u64,
}

/// Origins that must be fetched through the local relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Host suffixes, e.g. `"example-radio.net"` matches `ice1.example-radio.net`.
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default = "default_proxy_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TCP address used as the connectivity probe target.
    #[serde(default = "default_probe_addr")]
    pub probe_addr: String,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

impl EngineConfig {
    /// Boundary validation: clamp nonsensical values instead of letting them
    /// leak into the hot path.
    pub fn validated(mut self) -> Self {
        self.pool_size = self.pool_size.max(1);
        self.fade_steps = self.fade_steps.max(1);
        self.load_timeout_cap_ms = self.load_timeout_cap_ms.max(self.load_timeout_ms);
        self.watchdog_interval_ms = self.watchdog_interval_ms.max(10);
        self.history_len = self.history_len.max(1);
        if !self.min_buffer_ahead_secs.is_finite() || self.min_buffer_ahead_secs < 0.0 {
            self.min_buffer_ahead_secs = default_min_buffer_ahead_secs();
        }
        if !self.recovery.multiplier.is_finite() || self.recovery.multiplier < 1.0 {
            self.recovery.multiplier = 1.0;
        }
        self.recovery.max_delay_ms = self.recovery.max_delay_ms.max(self.recovery.base_delay_ms);
        self
    }

    pub fn fade_duration(&self) -> Duration {
        Duration::from_millis(self.fade_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn load_timeout_cap(&self) -> Duration {
        Duration::from_millis(self.load_timeout_cap_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    pub fn error_debounce(&self) -> Duration {
        Duration::from_millis(self.error_debounce_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl RecoveryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn online_resume(&self) -> Duration {
        Duration::from_millis(self.online_resume_ms)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            proxy_port: default_proxy_port(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
        }
    }
}

impl Default for StationsConfig {
    fn default() -> Self {
        Self {
            stations_toml: default_stations_toml(),
            m3u_url: String::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            fade_ms: default_fade_ms(),
            fade_steps: default_fade_steps(),
            load_timeout_ms: default_load_timeout_ms(),
            load_timeout_cap_ms: default_load_timeout_cap_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            stall_threshold_ms: default_stall_threshold_ms(),
            min_buffer_ahead_secs: default_min_buffer_ahead_secs(),
            error_debounce_ms: default_error_debounce_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            history_len: default_history_len(),
            recovery: RecoveryConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            online_resume_ms: default_online_resume_ms(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            base_url: default_proxy_base_url(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_addr: default_probe_addr(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_port() -> u16 {
    8990
}

fn default_volume() -> f32 {
    0.7
}

fn default_pool_size() -> usize {
    3
}

fn default_fade_ms() -> u64 {
    300
}

fn default_fade_steps() -> u32 {
    10
}

fn default_load_timeout_ms() -> u64 {
    15_000
}

fn default_load_timeout_cap_ms() -> u64 {
    60_000
}

fn default_watchdog_interval_ms() -> u64 {
    1_500
}

fn default_stall_threshold_ms() -> u64 {
    8_000
}

fn default_min_buffer_ahead_secs() -> f64 {
    4.0
}

fn default_error_debounce_ms() -> u64 {
    500
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_history_len() -> usize {
    100
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_online_resume_ms() -> u64 {
    500
}

fn default_proxy_base_url() -> String {
    format!("http://{}:{}", default_bind_address(), default_proxy_port())
}

fn default_probe_addr() -> String {
    "1.1.1.1:53".to_string()
}

fn default_probe_interval_ms() -> u64 {
    5_000
}

fn default_stations_toml() -> PathBuf {
    // On Windows, check for portable stations.toml in executable directory
    #[cfg(windows)]
    {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let portable_stations = exe_dir.join("stations.toml");
                if portable_stations.exists() {
                    return portable_stations;
                }
            }
        }
    }

    platform::config_dir().join("stations.toml")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.engine = config.engine.validated();
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            http: HttpConfig::default(),
            mpv: MpvConfig::default(),
            stations: StationsConfig::default(),
            engine: EngineConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.http.proxy_port, 8990);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.engine.pool_size, 3);
        assert_eq!(config.engine.fade_duration(), Duration::from_millis(300));
        assert_eq!(config.engine.stall_threshold(), Duration::from_secs(8));
        assert_eq!(config.engine.recovery.max_retries, 5);
        assert_eq!(config.engine.proxy.base_url, "http://127.0.0.1:8990");
        assert!(config
            .stations
            .stations_toml
            .ends_with("radio/stations.toml"));
    }

    #[test]
    fn test_partial_engine_table_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [engine]
            fade_ms = 500

            [engine.proxy]
            domains = ["geo-locked.example"]
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.fade_ms, 500);
        assert_eq!(config.engine.pool_size, 3);
        assert_eq!(config.engine.proxy.domains, vec!["geo-locked.example"]);
        assert_eq!(config.engine.recovery.base_delay_ms, 1_000);
    }

    #[test]
    fn test_validation_clamps_bad_values() {
        let engine = EngineConfig {
            pool_size: 0,
            fade_steps: 0,
            load_timeout_ms: 20_000,
            load_timeout_cap_ms: 5_000,
            min_buffer_ahead_secs: f64::NAN,
            recovery: RecoveryConfig {
                multiplier: 0.5,
                ..RecoveryConfig::default()
            },
            ..EngineConfig::default()
        }
        .validated();
        assert_eq!(engine.pool_size, 1);
        assert_eq!(engine.fade_steps, 1);
        assert_eq!(engine.load_timeout_cap_ms, 20_000);
        assert_eq!(engine.min_buffer_ahead_secs, 4.0);
        assert_eq!(engine.recovery.multiplier, 1.0);
    }
}
