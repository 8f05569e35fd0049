//! Cross-process lock for bus bookkeeping.
//!
//! The lock is a file created with `create_new`; whoever creates it holds the
//! lock until the guard is dropped. A lock file older than
//! [`STALE_LOCK_AGE`] is assumed to belong to a crashed process and removed.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use fleetbus_types::error::BusError;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Age after which an existing lock file is broken.
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(60);

const RETRY_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug)]
pub(crate) struct BusLock {
    path: PathBuf,
}

impl BusLock {
    pub(crate) async fn acquire(path: &Path, timeout: Duration) -> Result<Self, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(std::process::id().to_string().as_bytes())
                        .await?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(path).await {
                        warn!(path = %path.display(), "breaking stale bus lock");
                        let _ = tokio::fs::remove_file(path).await;
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(BusError::LockTimeout(path.display().to_string()));
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for BusLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn is_stale(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}
