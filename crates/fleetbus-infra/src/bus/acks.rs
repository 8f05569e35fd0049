//! Request/ACK tracking, retries, and the dead-letter queue.

use std::io::ErrorKind;

use chrono::{DateTime, Duration, Utc};
use fleetbus_types::ack::{AckSweep, DlqEntry, DlqReason, PendingAck};
use fleetbus_types::envelope::{Envelope, EnvelopeDraft, MessageKind};
use fleetbus_types::error::BusError;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{MessageBus, append_line, parse_lines, write_atomic};

impl MessageBus {
    /// When a request sent or retried at `now` stops waiting.
    fn ack_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        i64::try_from(self.config.ack_timeout_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Append a `request` envelope and start waiting for its ACK.
    pub async fn request(
        &self,
        from: &str,
        to: &str,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<Envelope, BusError> {
        let envelope = self
            .append(EnvelopeDraft::new(MessageKind::Request, from, to, topic, payload))
            .await?;

        let now = Utc::now();
        let pending = PendingAck {
            message_id: envelope.id.clone(),
            from: envelope.from.clone(),
            to: envelope.to.clone(),
            deadline_at: self.ack_deadline(now),
            retries: 0,
            created_at: now,
        };
        let mut line = serde_json::to_string(&pending)?;
        line.push('\n');
        let _lock = self.lock().await?;
        append_line(&self.paths.pending_acks, line).await?;
        debug!(message_id = %envelope.id, to, "request awaiting ack");
        Ok(envelope)
    }

    /// Confirm a request: drop its pending entry and tell the requester.
    ///
    /// Returns the `ack` envelope, or `None` when the request is unknown.
    pub async fn send_ack(
        &self,
        acker: &str,
        message_id: &str,
    ) -> Result<Option<Envelope>, BusError> {
        let removed = {
            let _lock = self.lock().await?;
            let mut pending = self.read_pending().await?;
            let position = pending.iter().position(|p| p.message_id == message_id);
            let removed = position.map(|i| pending.remove(i));
            if removed.is_some() {
                self.write_pending(&pending).await?;
            }
            removed
        };

        let Some(requester) = self.requester_of(removed.as_ref(), message_id).await? else {
            warn!(message_id, "ack for unknown request");
            return Ok(None);
        };
        let ack = self
            .append(
                EnvelopeDraft::new(MessageKind::Ack, acker, requester, "ack", json!({}))
                    .correlated_with(message_id),
            )
            .await?;
        Ok(Some(ack))
    }

    /// Reject a request. The pending entry stays, so the request keeps
    /// retrying until it is acknowledged or dead-lettered.
    pub async fn send_nack(
        &self,
        acker: &str,
        message_id: &str,
        reason: &str,
    ) -> Result<Option<Envelope>, BusError> {
        let pending = self.read_pending().await?;
        let entry = pending.iter().find(|p| p.message_id == message_id);
        let Some(requester) = self.requester_of(entry, message_id).await? else {
            warn!(message_id, "nack for unknown request");
            return Ok(None);
        };
        let nack = self
            .append(
                EnvelopeDraft::new(
                    MessageKind::Nack,
                    acker,
                    requester,
                    "nack",
                    json!({ "reason": reason }),
                )
                .correlated_with(message_id),
            )
            .await?;
        Ok(Some(nack))
    }

    /// Sender of the original request, from its pending entry or the bus.
    async fn requester_of(
        &self,
        pending: Option<&PendingAck>,
        message_id: &str,
    ) -> Result<Option<String>, BusError> {
        if let Some(entry) = pending {
            return Ok(Some(entry.from.clone()));
        }
        Ok(self
            .scan()
            .await?
            .into_iter()
            .find(|e| e.id == message_id)
            .map(|e| e.from))
    }

    /// Retry or dead-letter every pending ACK whose deadline has passed.
    ///
    /// Entries under the retry budget get `retries + 1` and a fresh deadline;
    /// their ids are returned for the caller to re-send. Entries at the budget
    /// move to the DLQ with reason `ack_timeout` and leave the pending file.
    pub async fn process_ack_timeouts(&self) -> Result<AckSweep, BusError> {
        let _lock = self.lock().await?;
        let pending = self.read_pending().await?;
        let now = Utc::now();
        let mut sweep = AckSweep::default();
        let mut keep = Vec::with_capacity(pending.len());
        let mut dead = Vec::new();

        for mut entry in pending {
            if !entry.is_overdue(now) {
                keep.push(entry);
            } else if entry.retries < self.config.max_retries {
                entry.retries += 1;
                entry.deadline_at = self.ack_deadline(now);
                sweep.retried += 1;
                sweep.retried_ids.push(entry.message_id.clone());
                keep.push(entry);
            } else {
                dead.push(DlqEntry {
                    message_id: entry.message_id.clone(),
                    reason: DlqReason::AckTimeout,
                    detail: json!({
                        "from": entry.from,
                        "to": entry.to,
                        "retries": entry.retries,
                        "created_at": entry.created_at,
                    }),
                    moved_at: now,
                });
            }
        }

        if sweep.retried == 0 && dead.is_empty() {
            return Ok(sweep);
        }

        for entry in &dead {
            let mut line = serde_json::to_string(entry)?;
            line.push('\n');
            append_line(&self.paths.dlq, line).await?;
            warn!(message_id = %entry.message_id, "moved to dead-letter queue");
        }
        sweep.dlqd = dead.len();
        self.write_pending(&keep).await?;
        info!(retried = sweep.retried, dlqd = sweep.dlqd, "processed ack timeouts");
        Ok(sweep)
    }

    pub async fn pending_acks(&self) -> Result<Vec<PendingAck>, BusError> {
        self.read_pending().await
    }

    pub async fn dlq_entries(&self) -> Result<Vec<DlqEntry>, BusError> {
        match tokio::fs::read(&self.paths.dlq).await {
            Ok(content) => Ok(parse_lines(&content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Operator action: empty the DLQ. Returns how many entries were dropped.
    pub async fn clear_dlq(&self) -> Result<usize, BusError> {
        let _lock = self.lock().await?;
        let count = self.dlq_entries().await?.len();
        if count > 0 {
            write_atomic(&self.paths.dlq, b"").await?;
            info!(count, "cleared dead-letter queue");
        }
        Ok(count)
    }

    pub(super) async fn read_pending(&self) -> Result<Vec<PendingAck>, BusError> {
        match tokio::fs::read(&self.paths.pending_acks).await {
            Ok(content) => Ok(parse_lines(&content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_pending(&self, entries: &[PendingAck]) -> Result<(), BusError> {
        let mut content = String::new();
        for entry in entries {
            content.push_str(&serde_json::to_string(entry)?);
            content.push('\n');
        }
        write_atomic(&self.paths.pending_acks, content.as_bytes()).await
    }
}
