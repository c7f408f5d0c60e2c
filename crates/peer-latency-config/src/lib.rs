//! Shared configuration for peer-latency hosts
//!
//! Reads from ~/.peer-latency/config.toml

use anyhow::{Context, Result};
use peer_latency::{LatencyConfig, DEFAULT_ICE_SERVERS, MOCK_UID_PREFIX};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Default signaling server
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:3003";

/// Top-level config structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub measurement: MeasurementConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub ice: IceConfig,
}

/// Probe timing and scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    #[serde(default = "default_setup_timeout_ms")]
    pub setup_timeout_ms: u64,
    #[serde(default = "default_measurement_timeout_ms")]
    pub measurement_timeout_ms: u64,
    /// Delay between the channel opening and the first ping
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_sample_target")]
    pub sample_target: u32,
    /// Finalize as soon as this many pongs are back with none outstanding
    #[serde(default = "default_early_finalize_samples")]
    pub early_finalize_samples: usize,
    /// Wait this many ping intervals after the last ping before finalizing
    #[serde(default = "default_completion_grace_factor")]
    pub completion_grace_factor: u32,
    #[serde(default = "default_unstable_jitter_ms")]
    pub unstable_jitter_ms: f64,
    #[serde(default = "default_max_inbound_sessions")]
    pub max_inbound_sessions: usize,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            setup_timeout_ms: default_setup_timeout_ms(),
            measurement_timeout_ms: default_measurement_timeout_ms(),
            warmup_ms: default_warmup_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            sample_target: default_sample_target(),
            early_finalize_samples: default_early_finalize_samples(),
            completion_grace_factor: default_completion_grace_factor(),
            unstable_jitter_ms: default_unstable_jitter_ms(),
            max_inbound_sessions: default_max_inbound_sessions(),
        }
    }
}

fn default_setup_timeout_ms() -> u64 {
    10_000
}

fn default_measurement_timeout_ms() -> u64 {
    10_000
}

fn default_warmup_ms() -> u64 {
    100
}

fn default_ping_interval_ms() -> u64 {
    180
}

fn default_sample_target() -> u32 {
    5
}

fn default_early_finalize_samples() -> usize {
    3
}

fn default_completion_grace_factor() -> u32 {
    4
}

fn default_unstable_jitter_ms() -> f64 {
    6.0
}

fn default_max_inbound_sessions() -> usize {
    1
}

/// Peer selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// How long a measurement stays fresh
    #[serde(default = "default_measurement_ttl_secs")]
    pub measurement_ttl_secs: u64,
    #[serde(default = "default_mock_uid_prefix")]
    pub mock_uid_prefix: String,
    /// Uids that are never measured
    #[serde(default)]
    pub excluded_uids: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            measurement_ttl_secs: default_measurement_ttl_secs(),
            mock_uid_prefix: default_mock_uid_prefix(),
            excluded_uids: vec![],
        }
    }
}

fn default_tick_interval_secs() -> u64 {
    10
}

fn default_measurement_ttl_secs() -> u64 {
    120
}

fn default_mock_uid_prefix() -> String {
    MOCK_UID_PREFIX.to_string()
}

/// Signaling relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    #[serde(default = "default_signaling_url")]
    pub url: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: default_signaling_url(),
        }
    }
}

fn default_signaling_url() -> String {
    DEFAULT_SIGNALING_URL.to_string()
}

/// NAT traversal servers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_ice_servers")]
    pub servers: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: default_ice_servers(),
        }
    }
}

fn default_ice_servers() -> Vec<String> {
    DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect()
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = get_config_path();

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load config, returning default on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_path = get_config_path();

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Runtime tunables for the latency manager
    pub fn latency_config(&self) -> LatencyConfig {
        let m = &self.measurement;
        let s = &self.scheduler;
        LatencyConfig {
            tick_interval: Duration::from_secs(s.tick_interval_secs),
            measurement_ttl: Duration::from_secs(s.measurement_ttl_secs),
            setup_timeout: Duration::from_millis(m.setup_timeout_ms),
            measurement_timeout: Duration::from_millis(m.measurement_timeout_ms),
            warmup_delay: Duration::from_millis(m.warmup_ms),
            ping_interval: Duration::from_millis(m.ping_interval_ms),
            ping_sample_target: m.sample_target,
            early_finalize_samples: m.early_finalize_samples,
            completion_grace_factor: m.completion_grace_factor,
            unstable_jitter_ms: m.unstable_jitter_ms,
            max_inbound_sessions: m.max_inbound_sessions,
            mock_uid_prefix: s.mock_uid_prefix.clone(),
            excluded_uids: s.excluded_uids.iter().cloned().collect(),
            ice_servers: self.ice.servers.clone(),
        }
    }
}

/// Get the config directory (~/.peer-latency)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PEER_LATENCY_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peer-latency")
}

/// Get the config file path (~/.peer-latency/config.toml)
pub fn get_config_path() -> PathBuf {
    get_config_dir().join("config.toml")
}
