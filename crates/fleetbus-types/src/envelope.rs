//! Message envelope types for the shared agent bus.
//!
//! An [`Envelope`] is one line of `bus.jsonl`. Producers build an
//! [`EnvelopeDraft`]; the bus assigns `id`, `ts`, and `sender_seq` on append.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Recipient value addressing every reader on the bus.
pub const BROADCAST: &str = "*";

/// Recipient value for the orchestrating PM (served by the hub's brain).
pub const PM: &str = "pm";

/// Sender id used by the hub for its audit records and PM responses.
pub const HUB_SENDER: &str = "pm-hub";

/// Delivery tier. Lower rank is delivered first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Blocking,
    #[default]
    Normal,
    Fyi,
}

impl Priority {
    /// Sort rank used by the bus reader: blocking=0, normal=1, fyi=2.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Blocking => 0,
            Priority::Normal => 1,
            Priority::Fyi => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Blocking => "blocking",
            Priority::Normal => "normal",
            Priority::Fyi => "fyi",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocking" => Ok(Priority::Blocking),
            "normal" => Ok(Priority::Normal),
            "fyi" => Ok(Priority::Fyi),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// The `type` field of an envelope.
///
/// Known kinds are typed; anything else written by other tools is kept
/// verbatim in [`MessageKind::Other`] so it survives a read/rewrite cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Notify,
    Broadcast,
    Request,
    Ack,
    Nack,
    AskPm,
    PmResponse,
    TaskDelegate,
    TaskComplete,
    Heartbeat,
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Notify => "notify",
            MessageKind::Broadcast => "broadcast",
            MessageKind::Request => "request",
            MessageKind::Ack => "ack",
            MessageKind::Nack => "nack",
            MessageKind::AskPm => "ask_pm",
            MessageKind::PmResponse => "pm_response",
            MessageKind::TaskDelegate => "task_delegate",
            MessageKind::TaskComplete => "task_complete",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Other(s) => s,
        }
    }
}

impl From<String> for MessageKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "notify" => MessageKind::Notify,
            "broadcast" => MessageKind::Broadcast,
            "request" => MessageKind::Request,
            "ack" => MessageKind::Ack,
            "nack" => MessageKind::Nack,
            "ask_pm" => MessageKind::AskPm,
            "pm_response" => MessageKind::PmResponse,
            "task_delegate" => MessageKind::TaskDelegate,
            "task_complete" => MessageKind::TaskComplete,
            "heartbeat" => MessageKind::Heartbeat,
            _ => MessageKind::Other(s),
        }
    }
}

impl From<&str> for MessageKind {
    fn from(s: &str) -> Self {
        MessageKind::from(s.to_string())
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// UUIDv7 string assigned on append.
    pub id: String,
    /// Append time (ISO-8601).
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: String,
    /// Session id, [`BROADCAST`], or [`PM`].
    pub to: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub priority: Priority,
    /// Time to live in milliseconds; `0` never expires.
    #[serde(default)]
    pub ttl_ms: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Per-sender sequence number, starting at 1.
    #[serde(default)]
    pub sender_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST
    }

    /// Whether `reader` should see this message.
    ///
    /// Direct messages match on equality (which also covers the `pm` reader).
    /// Broadcasts reach everyone except their sender.
    pub fn is_addressed_to(&self, reader: &str) -> bool {
        self.to == reader || (self.is_broadcast() && self.from != reader)
    }

    /// Whether the TTL has elapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_ms == 0 {
            return false;
        }
        i64::try_from(self.ttl_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .and_then(|ttl| self.ts.checked_add_signed(ttl))
            .is_some_and(|expires_at| expires_at < now)
    }
}

/// An envelope before the bus has assigned its identity fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeDraft {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub ttl_ms: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl EnvelopeDraft {
    pub fn new(
        kind: impl Into<MessageKind>,
        from: impl Into<String>,
        to: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            from: from.into(),
            to: to.into(),
            topic: topic.into(),
            priority: Priority::Normal,
            ttl_ms: 0,
            payload,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn correlated_with(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Stamp the identity fields and produce the final envelope.
    pub fn into_envelope(self, id: String, ts: DateTime<Utc>, sender_seq: u64) -> Envelope {
        Envelope {
            id,
            ts,
            kind: self.kind,
            from: self.from,
            to: self.to,
            topic: self.topic,
            priority: self.priority,
            ttl_ms: self.ttl_ms,
            payload: self.payload,
            sender_seq,
            correlation_id: self.correlation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(to: &str, from: &str) -> Envelope {
        EnvelopeDraft::new(MessageKind::Notify, from, to, "test.topic", json!({"n": 1}))
            .into_envelope("id-1".to_string(), Utc::now(), 1)
    }

    #[test]
    fn priority_ranks_blocking_first() {
        assert!(Priority::Blocking.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Fyi.rank());
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!("fyi".parse::<Priority>().unwrap(), Priority::Fyi);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn envelope_serializes_wire_field_names() {
        let env = sample("agent-1", "agent-2");
        let json_str = serde_json::to_string(&env).unwrap();
        assert!(json_str.contains("\"type\":\"notify\""));
        assert!(json_str.contains("\"priority\":\"normal\""));
        assert!(json_str.contains("\"sender_seq\":1"));
        assert!(!json_str.contains("correlation_id"));
    }

    #[test]
    fn unknown_kind_is_preserved() {
        let line = r#"{"id":"x","ts":"2026-01-01T00:00:00Z","type":"design_token_sync","from":"a","to":"*"}"#;
        let env: Envelope = serde_json::from_str(line).unwrap();
        assert_eq!(env.kind, MessageKind::Other("design_token_sync".to_string()));
        assert_eq!(env.priority, Priority::Normal);
        let back = serde_json::to_string(&env).unwrap();
        assert!(back.contains("\"type\":\"design_token_sync\""));
    }

    #[test]
    fn addressing_rules() {
        assert!(sample("agent-1", "agent-2").is_addressed_to("agent-1"));
        assert!(!sample("agent-1", "agent-2").is_addressed_to("agent-3"));
        assert!(sample(BROADCAST, "agent-2").is_addressed_to("agent-3"));
        assert!(!sample(BROADCAST, "agent-2").is_addressed_to("agent-2"));
        assert!(sample(PM, "agent-2").is_addressed_to(PM));
    }

    #[test]
    fn ttl_expiry() {
        let mut env = sample("a", "b");
        env.ts = Utc::now() - Duration::seconds(10);
        assert!(!env.is_expired_at(Utc::now()));
        env.ttl_ms = 1_000;
        assert!(env.is_expired_at(Utc::now()));
        env.ttl_ms = 60_000;
        assert!(!env.is_expired_at(Utc::now()));
    }

    #[test]
    fn draft_builder_sets_correlation() {
        let env = EnvelopeDraft::new("nack", "a", "b", "t", json!({}))
            .with_priority(Priority::Blocking)
            .correlated_with("req-1")
            .into_envelope("id".into(), Utc::now(), 7);
        assert_eq!(env.kind, MessageKind::Nack);
        assert_eq!(env.priority, Priority::Blocking);
        assert_eq!(env.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(env.sender_seq, 7);
    }
}
