//! Configuration loader for Fleetbus.
//!
//! Reads `fleetbus.toml` from the data directory (`~/.fleetbus/` in production)
//! and deserializes it into [`FleetConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use fleetbus_types::config::FleetConfig;

use crate::filesystem::resolve_in;

pub const CONFIG_FILE: &str = "fleetbus.toml";

/// Load configuration from `{data_dir}/fleetbus.toml`.
///
/// - Missing file: [`FleetConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_config(data_dir: &Path) -> FleetConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return FleetConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return FleetConfig::default();
        }
    };

    match toml::from_str::<FleetConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            FleetConfig::default()
        }
    }
}

/// Absolute locations derived from a data directory and its config.
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub data_dir: PathBuf,
    /// Root of the message bus files.
    pub bus_dir: PathBuf,
    /// Directory of `<session_id>.json` files that make a session valid.
    pub sessions_dir: PathBuf,
    /// Where a running hub advertises its port.
    pub state_file: PathBuf,
}

impl ResolvedPaths {
    pub fn new(data_dir: &Path, config: &FleetConfig) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            bus_dir: resolve_in(data_dir, &config.bus.dir),
            sessions_dir: resolve_in(data_dir, &config.hub.sessions_dir),
            state_file: resolve_in(data_dir, &config.hub.state_file),
        }
    }
}
