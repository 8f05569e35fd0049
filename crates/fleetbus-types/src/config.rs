//! Configuration types for Fleetbus.
//!
//! `FleetConfig` represents `fleetbus.toml` in the data directory. Every field
//! has a default so an empty or missing file is valid.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
}

/// File bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus directory; relative paths resolve against the data directory.
    #[serde(default = "default_bus_dir")]
    pub dir: PathBuf,

    /// Live bus size above which compaction is due.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold_bytes: u64,

    /// How long a `request` waits for its ACK before a retry.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Retries before a pending ACK is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Largest accepted serialized payload; larger appends are rejected.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// How long bookkeeping waits for `bus.lock` before giving up.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_bus_dir() -> PathBuf {
    PathBuf::from("bus")
}

fn default_compaction_threshold() -> u64 {
    100 * 1024
}

fn default_ack_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_payload_bytes() -> usize {
    64 * 1024
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            dir: default_bus_dir(),
            compaction_threshold_bytes: default_compaction_threshold(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retries: default_max_retries(),
            max_payload_bytes: default_max_payload_bytes(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

/// Hub server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// First port tried; the hub walks upward while ports are taken.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u16,

    /// Heartbeat age after which an agent is reported stale (reaped at 2x).
    #[serde(default = "default_heartbeat_stale_ms")]
    pub heartbeat_stale_ms: u64,

    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,

    /// Requests allowed per client IP within one window.
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: u32,

    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,

    /// Per-agent undelivered message cap (oldest dropped first).
    #[serde(default = "default_pending_queue_capacity")]
    pub pending_queue_capacity: usize,

    /// Directory holding `<session_id>.json` files for live sessions.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,

    /// Hub state file (`{port, pid}`); relative to the data directory.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3847
}

fn default_max_port_attempts() -> u16 {
    10
}

fn default_heartbeat_stale_ms() -> u64 {
    60_000
}

fn default_reaper_interval_ms() -> u64 {
    15_000
}

fn default_rate_limit_max() -> u32 {
    120
}

fn default_rate_limit_window_ms() -> u64 {
    60_000
}

fn default_pending_queue_capacity() -> usize {
    100
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("sessions")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("hub-state.json")
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_port_attempts: default_max_port_attempts(),
            heartbeat_stale_ms: default_heartbeat_stale_ms(),
            reaper_interval_ms: default_reaper_interval_ms(),
            rate_limit_max: default_rate_limit_max(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
            pending_queue_capacity: default_pending_queue_capacity(),
            sessions_dir: default_sessions_dir(),
            state_file: default_state_file(),
        }
    }
}

/// Agent-side connector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Explicit hub base URL. When unset the hub state file is consulted.
    #[serde(default)]
    pub hub_url: Option<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Open the WebSocket push channel after HTTP registration succeeds.
    #[serde(default = "default_enable_push")]
    pub enable_push: bool,
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_enable_push() -> bool {
    true
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            hub_url: None,
            request_timeout_ms: default_request_timeout_ms(),
            enable_push: default_enable_push(),
        }
    }
}
