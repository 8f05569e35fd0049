//! Hub state file: `{port, pid}` while a hub is running.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fleetbus_types::hub::HubStateFile;
use tracing::warn;

/// Reads and writes the hub state file.
#[derive(Debug, Clone)]
pub struct HubStateStore {
    path: PathBuf,
}

impl HubStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self, state: &HubStateFile) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(state).map_err(std::io::Error::other)?;
        tokio::fs::write(&self.path, content).await
    }

    /// The recorded state, or `None` when absent or unreadable.
    pub async fn read(&self) -> Option<HubStateFile> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "cannot read hub state file");
                return None;
            }
        };
        serde_json::from_str(&content)
            .inspect_err(|err| {
                warn!(path = %self.path.display(), error = %err, "malformed hub state file");
            })
            .ok()
    }

    pub async fn remove(&self) -> std::io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_read_remove() {
        let tmp = TempDir::new().unwrap();
        let store = HubStateStore::new(tmp.path().join("hub-state.json"));
        assert!(store.read().await.is_none());

        let state = HubStateFile {
            port: 3848,
            pid: 4242,
            started_at: None,
        };
        store.write(&state).await.unwrap();
        assert_eq!(store.read().await, Some(state));

        store.remove().await.unwrap();
        assert!(store.read().await.is_none());
        store.remove().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_state_reads_as_none() {
        let tmp = TempDir::new().unwrap();
        let store = HubStateStore::new(tmp.path().join("hub-state.json"));
        tokio::fs::write(store.path(), "port=1").await.unwrap();
        assert!(store.read().await.is_none());
    }
}
