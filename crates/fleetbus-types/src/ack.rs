//! Delivery-confirmation bookkeeping: pending ACKs and dead letters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A `request` envelope still waiting for its ACK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAck {
    /// Id of the request envelope.
    pub message_id: String,
    /// Requester, who receives the ACK or NACK.
    pub from: String,
    /// Recipient expected to acknowledge.
    pub to: String,
    /// When the current attempt stops waiting.
    pub deadline_at: DateTime<Utc>,
    /// Re-sends so far.
    #[serde(default)]
    pub retries: u32,
    pub created_at: DateTime<Utc>,
}

impl PendingAck {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.deadline_at <= now
    }
}

/// Why a message ended up in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    AckTimeout,
}

/// A message that exhausted its delivery budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub message_id: String,
    pub reason: DlqReason,
    /// Sender, recipient, and retry count at the time it was given up on.
    #[serde(default)]
    pub detail: serde_json::Value,
    pub moved_at: DateTime<Utc>,
}

/// Result of one pass over overdue pending ACKs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckSweep {
    /// Overdue entries given another attempt.
    pub retried: usize,
    /// Overdue entries moved to the DLQ.
    pub dlqd: usize,
    /// Ids of the retried requests, for re-delivery to live links.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retried_ids: Vec<String>,
}
