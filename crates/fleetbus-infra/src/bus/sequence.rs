//! Per-sender sequence numbers.
//!
//! Each sender's last assigned `sender_seq` is kept in `sequences/<from>.seq`.
//! If that file is missing or unreadable, the highest sequence the sender has
//! in the live bus is used instead, so numbering never restarts below a value
//! a reader may still see.

use std::io::ErrorKind;

use fleetbus_types::error::BusError;
use tracing::warn;

use super::{MessageBus, write_atomic};

impl MessageBus {
    /// Next sequence number for `from`. Callers hold `append_lock`.
    pub(super) async fn next_sender_seq(&self, from: &str) -> Result<u64, BusError> {
        let path = self.paths.sequence(from);
        let last = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match content.trim().parse::<u64>() {
                Ok(seq) => seq,
                Err(_) => {
                    warn!(from, "unreadable sequence file; recovering from bus");
                    self.highest_seq_in_bus(from).await?
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => self.highest_seq_in_bus(from).await?,
            Err(err) => return Err(err.into()),
        };
        Ok(last + 1)
    }

    pub(super) async fn store_sender_seq(&self, from: &str, seq: u64) -> Result<(), BusError> {
        write_atomic(&self.paths.sequence(from), seq.to_string().as_bytes()).await
    }

    async fn highest_seq_in_bus(&self, from: &str) -> Result<u64, BusError> {
        Ok(self
            .scan()
            .await?
            .iter()
            .filter(|e| e.from == from)
            .map(|e| e.sender_seq)
            .max()
            .unwrap_or(0))
    }
}
