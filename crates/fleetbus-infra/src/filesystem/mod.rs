//! Filesystem adapters for Fleetbus.
//!
//! Data directory resolution, the on-disk session directory used to validate
//! agent registrations, and the hub state file.

pub mod hub_state;
pub mod sessions;

use std::path::{Path, PathBuf};

pub use hub_state::HubStateStore;
pub use sessions::SessionFiles;

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `FLEETBUS_DATA_DIR` environment variable
/// 2. `~/.fleetbus`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FLEETBUS_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".fleetbus");
    }

    // Last resort: current directory
    PathBuf::from(".fleetbus")
}

/// Resolve a configured path against the data directory unless absolute.
pub fn resolve_in(data_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir.join(path)
    }
}
