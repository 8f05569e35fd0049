//! Shared context for CLI commands.
//!
//! Resolves the data directory, loads `fleetbus.toml`, and opens the bus.

use std::path::PathBuf;
use std::sync::Arc;

use fleetbus_infra::bus::MessageBus;
use fleetbus_infra::config::{ResolvedPaths, load_config};
use fleetbus_infra::filesystem::resolve_data_dir;
use fleetbus_types::config::FleetConfig;

pub struct AppContext {
    pub config: FleetConfig,
    pub paths: ResolvedPaths,
    pub bus: Arc<MessageBus>,
}

impl AppContext {
    /// Build the context, preferring an explicit `--data-dir`.
    pub async fn init(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_config(&data_dir).await;
        let paths = ResolvedPaths::new(&data_dir, &config);
        let bus = MessageBus::open(&paths.bus_dir, config.bus.clone()).await?;

        tracing::debug!(
            data_dir = %paths.data_dir.display(),
            bus_dir = %paths.bus_dir.display(),
            "context ready"
        );

        Ok(Self {
            config,
            paths,
            bus: Arc::new(bus),
        })
    }
}
