//! File-backed message bus.
//!
//! The bus is a directory shared by the hub and every agent process:
//!
//! ```text
//! bus.jsonl              live log, one envelope per line
//! cursors/<reader>.json  one cursor per reader
//! pending_acks.jsonl     requests awaiting an ACK
//! dlq.jsonl              dead letters
//! archive/bus-<ts>.jsonl compacted prefixes
//! sequences/<from>.seq   last sender_seq per sender
//! bus.gen                compaction generation and the bytes it cut
//! bus.lock               held while bookkeeping files are rewritten
//! ```
//!
//! Appends are one `write_all` of a complete line on an `O_APPEND` handle, so
//! concurrent writers never interleave partial lines and never lock. Readers
//! hold the lock only while they copy bytes out of the live file, so a read
//! never straddles a compaction. Cursors carry the generation their offset
//! belongs to and are rebased when the file has been compacted since.

mod acks;
mod compact;
mod lock;
mod pm;
mod sequence;

use std::io::{ErrorKind, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use fleetbus_core::delivery::sort_for_delivery;
use fleetbus_core::session::validate_session_id;
use fleetbus_types::config::BusConfig;
use fleetbus_types::cursor::Cursor;
use fleetbus_types::envelope::{Envelope, EnvelopeDraft};
use fleetbus_types::error::BusError;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub use compact::CompactionReport;
use lock::BusLock;
pub use pm::{ASK_PM_TOPIC, PM_RESPONSE_TOPIC};

/// Locations of every file the bus owns.
#[derive(Debug, Clone)]
pub struct BusPaths {
    /// Bus directory.
    pub root: PathBuf,
    /// Live JSONL log.
    pub bus: PathBuf,
    /// Directory of per-reader cursor files.
    pub cursors: PathBuf,
    /// Requests still waiting for an ACK.
    pub pending_acks: PathBuf,
    /// Dead-letter log.
    pub dlq: PathBuf,
    /// Directory of compacted prefixes.
    pub archive: PathBuf,
    /// Directory of per-sender sequence counters.
    pub sequences: PathBuf,
    /// Compaction generation record.
    pub generation: PathBuf,
    /// Cross-process lock file.
    pub lock: PathBuf,
}

impl BusPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            bus: root.join("bus.jsonl"),
            cursors: root.join("cursors"),
            pending_acks: root.join("pending_acks.jsonl"),
            dlq: root.join("dlq.jsonl"),
            archive: root.join("archive"),
            sequences: root.join("sequences"),
            generation: root.join("bus.gen"),
            lock: root.join("bus.lock"),
            root,
        }
    }

    pub fn cursor(&self, reader: &str) -> PathBuf {
        self.cursors.join(format!("{reader}.json"))
    }

    pub fn sequence(&self, from: &str) -> PathBuf {
        self.sequences.join(format!("{from}.seq"))
    }
}

/// Messages returned by [`MessageBus::read`] and the cursor to save once
/// they are handled.
#[derive(Debug, Clone)]
pub struct ReadBatch {
    /// Messages for the reader, in delivery order.
    pub messages: Vec<Envelope>,
    /// Cursor positioned after the last complete line read.
    pub cursor: Cursor,
}

impl ReadBatch {
    pub fn ids(&self) -> Vec<String> {
        self.messages.iter().map(|m| m.id.clone()).collect()
    }
}

/// Append-only log with per-reader cursors, ACK tracking, and compaction.
pub struct MessageBus {
    paths: BusPaths,
    config: BusConfig,
    /// Serializes sequence assignment and the append that uses it.
    append_lock: Mutex<()>,
}

impl MessageBus {
    /// Open (creating if needed) the bus rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>, config: BusConfig) -> Result<Self, BusError> {
        let paths = BusPaths::new(root);
        for dir in [&paths.root, &paths.cursors, &paths.archive, &paths.sequences] {
            tokio::fs::create_dir_all(dir).await?;
        }
        debug!(root = %paths.root.display(), "message bus opened");
        Ok(Self {
            paths,
            config,
            append_lock: Mutex::new(()),
        })
    }

    pub fn paths(&self) -> &BusPaths {
        &self.paths
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    async fn lock(&self) -> Result<BusLock, BusError> {
        BusLock::acquire(
            &self.paths.lock,
            Duration::from_millis(self.config.lock_timeout_ms),
        )
        .await
    }

    /// Stamp `draft` with id, timestamp, and the sender's next sequence
    /// number, then append it as one line.
    pub async fn append(&self, draft: EnvelopeDraft) -> Result<Envelope, BusError> {
        validate_session_id(&draft.from)
            .map_err(|_| BusError::InvalidSessionId(draft.from.clone()))?;

        let size = serde_json::to_vec(&draft.payload)?.len();
        if size > self.config.max_payload_bytes {
            return Err(BusError::PayloadTooLarge {
                size,
                limit: self.config.max_payload_bytes,
            });
        }

        let _guard = self.append_lock.lock().await;
        let seq = self.next_sender_seq(&draft.from).await?;
        let envelope = draft.into_envelope(Uuid::now_v7().to_string(), Utc::now(), seq);

        let mut line = serde_json::to_string(&envelope)?;
        line.push('\n');
        append_line(&self.paths.bus, line).await?;
        self.store_sender_seq(&envelope.from, seq).await?;

        debug!(
            message_id = %envelope.id,
            from = %envelope.from,
            to = %envelope.to,
            kind = %envelope.kind,
            sender_seq = seq,
            "appended to bus"
        );
        Ok(envelope)
    }

    /// Load a reader's cursor, recovering from corruption and clamping an
    /// offset that points past the end of the bus.
    pub async fn load_cursor(&self, reader: &str) -> Result<Cursor, BusError> {
        validate_session_id(reader).map_err(|_| BusError::InvalidSessionId(reader.to_string()))?;
        let path = self.paths.cursor(reader);

        let mut cursor = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<Cursor>(&content) {
                Ok(cursor) if cursor.session_id == reader => cursor,
                Ok(cursor) => {
                    warn!(
                        reader,
                        found = %cursor.session_id,
                        "cursor belongs to another reader; recovering with defaults"
                    );
                    Cursor::recovered(reader)
                }
                Err(err) => {
                    warn!(reader, error = %err, "corrupt cursor; recovering with defaults");
                    Cursor::recovered(reader)
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Cursor::new(reader),
            Err(err) => return Err(err.into()),
        };

        let len = self.bus_len().await?;
        if cursor.byte_offset > len {
            warn!(
                reader,
                byte_offset = cursor.byte_offset,
                bus_len = len,
                "cursor beyond end of bus; clamping"
            );
            cursor.byte_offset = len;
        }
        Ok(cursor)
    }

    /// Read every complete line after the cursor and return the messages
    /// addressed to its reader, in delivery order.
    ///
    /// Malformed lines are skipped. A final line without its newline is an
    /// append still in flight and is left for the next read. The returned
    /// cursor is not persisted; pass it to [`MessageBus::ack`] once handled.
    pub async fn read(&self, cursor: &Cursor) -> Result<ReadBatch, BusError> {
        let reader = cursor.session_id.as_str();
        let mut next = cursor.clone();

        let lock = self.lock().await?;
        let current = self.read_generation().await?;
        self.rebase(&mut next, &current).await?;
        let mut file = match tokio::fs::File::open(&self.paths.bus).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(ReadBatch {
                    messages: Vec::new(),
                    cursor: next,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let len = file.metadata().await?.len();
        let start = next.byte_offset.min(len);
        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        drop(lock);

        let complete = buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        let now = Utc::now();
        let mut consumed = 0u64;
        let mut messages = Vec::new();

        for raw in buf[..complete].split(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let envelope: Envelope = match serde_json::from_str(line) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(reader, error = %err, "skipping malformed bus line");
                    continue;
                }
            };
            consumed += 1;

            if !envelope.is_addressed_to(reader) || cursor.has_processed(&envelope.id) {
                continue;
            }
            if envelope.is_expired_at(now) {
                debug!(reader, message_id = %envelope.id, "skipping expired message");
                continue;
            }
            messages.push(envelope);
        }

        sort_for_delivery(&mut messages);
        next.byte_offset = start + complete as u64;
        next.last_seq += consumed;
        Ok(ReadBatch {
            messages,
            cursor: next,
        })
    }

    /// Persist an advanced cursor and remember `ids` as processed.
    ///
    /// A cursor taken before a compaction is rebased onto the live file
    /// first, so its offset never skips lines written after the cut.
    pub async fn ack(&self, cursor: &Cursor, ids: &[String]) -> Result<Cursor, BusError> {
        validate_session_id(&cursor.session_id)
            .map_err(|_| BusError::InvalidSessionId(cursor.session_id.clone()))?;

        let mut saved = cursor.clone();
        saved.remember(ids.iter().cloned());
        saved.recovered = false;

        let _lock = self.lock().await?;
        let current = self.read_generation().await?;
        self.rebase(&mut saved, &current).await?;
        let len = self.bus_len().await?;
        saved.byte_offset = saved.byte_offset.min(len);
        self.store_cursor(&saved).await?;
        Ok(saved)
    }

    /// Shortcut for agents: load the cursor, read, and ack everything read.
    pub async fn drain(&self, reader: &str) -> Result<Vec<Envelope>, BusError> {
        let cursor = self.load_cursor(reader).await?;
        let batch = self.read(&cursor).await?;
        self.ack(&batch.cursor, &batch.ids()).await?;
        Ok(batch.messages)
    }

    /// Current size of the live bus file (0 when absent).
    pub async fn bus_len(&self) -> Result<u64, BusError> {
        match tokio::fs::metadata(&self.paths.bus).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Every parseable envelope currently in the live bus, in log order.
    pub async fn scan(&self) -> Result<Vec<Envelope>, BusError> {
        let content = match tokio::fs::read(&self.paths.bus).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(parse_lines(&content))
    }

    async fn store_cursor(&self, cursor: &Cursor) -> Result<(), BusError> {
        let content = serde_json::to_string_pretty(cursor)?;
        write_atomic(&self.paths.cursor(&cursor.session_id), content.as_bytes()).await
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("root", &self.paths.root)
            .finish()
    }
}

/// Parse JSONL content, skipping blank and malformed lines.
pub(crate) fn parse_lines<T: serde::de::DeserializeOwned>(content: &[u8]) -> Vec<T> {
    content
        .split(|b| *b == b'\n')
        .filter_map(|raw| {
            let line = String::from_utf8_lossy(raw);
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            serde_json::from_str(line)
                .inspect_err(|err| warn!(error = %err, "skipping malformed line"))
                .ok()
        })
        .collect()
}

/// Append one complete line with a single write on an `O_APPEND` handle.
pub(crate) async fn append_line(path: &Path, line: String) -> Result<(), BusError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(line.as_bytes())
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(())
}

/// Replace `path` by writing a sibling temp file and renaming it over.
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), BusError> {
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, content).await?;
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbus_types::envelope::{BROADCAST, MessageKind, PM, Priority};
    use serde_json::json;
    use tempfile::TempDir;

    pub(super) async fn open_bus(tmp: &TempDir) -> MessageBus {
        MessageBus::open(tmp.path().join("bus"), BusConfig::default())
            .await
            .unwrap()
    }

    fn notify(from: &str, to: &str, priority: Priority) -> EnvelopeDraft {
        EnvelopeDraft::new(MessageKind::Notify, from, to, "test", json!({"p": priority.as_str()}))
            .with_priority(priority)
    }

    #[tokio::test]
    async fn append_assigns_identity_and_sequence() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;

        let first = bus.append(notify("A", "B", Priority::Normal)).await.unwrap();
        let second = bus.append(notify("A", "B", Priority::Normal)).await.unwrap();
        let other = bus.append(notify("C", "B", Priority::Normal)).await.unwrap();

        assert_eq!(first.sender_seq, 1);
        assert_eq!(second.sender_seq, 2);
        assert_eq!(other.sender_seq, 1);
        assert_ne!(first.id, second.id);

        let content = tokio::fs::read_to_string(&bus.paths().bus).await.unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(content.ends_with('\n'));
    }

    #[tokio::test]
    async fn read_orders_by_priority() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;
        bus.append(notify("A", "B", Priority::Fyi)).await.unwrap();
        bus.append(notify("A", "B", Priority::Blocking)).await.unwrap();
        bus.append(notify("A", "B", Priority::Normal)).await.unwrap();

        let cursor = bus.load_cursor("B").await.unwrap();
        let batch = bus.read(&cursor).await.unwrap();
        let order: Vec<_> = batch.messages.iter().map(|m| m.priority).collect();
        assert_eq!(
            order,
            vec![Priority::Blocking, Priority::Normal, Priority::Fyi]
        );
    }

    #[tokio::test]
    async fn read_keeps_sender_fifo() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;
        for _ in 0..3 {
            bus.append(notify("A", "B", Priority::Normal)).await.unwrap();
        }
        let batch = bus.read(&Cursor::new("B")).await.unwrap();
        let seqs: Vec<u64> = batch.messages.iter().map(|m| m.sender_seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn read_filters_by_recipient() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;
        bus.append(notify("A", "B", Priority::Normal)).await.unwrap();
        bus.append(notify("A", "C", Priority::Normal)).await.unwrap();
        bus.append(notify("A", BROADCAST, Priority::Normal)).await.unwrap();
        bus.append(notify("B", BROADCAST, Priority::Normal)).await.unwrap();
        bus.append(notify("A", PM, Priority::Normal)).await.unwrap();

        let for_b = bus.read(&Cursor::new("B")).await.unwrap();
        assert_eq!(for_b.messages.len(), 2);
        assert!(for_b.messages.iter().all(|m| m.from == "A"));

        let for_pm = bus.read(&Cursor::new(PM)).await.unwrap();
        assert_eq!(for_pm.messages.len(), 3);
    }

    #[tokio::test]
    async fn ack_advances_and_dedupes() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;
        bus.append(notify("A", "B", Priority::Normal)).await.unwrap();

        let batch = bus.read(&bus.load_cursor("B").await.unwrap()).await.unwrap();
        assert_eq!(batch.messages.len(), 1);
        let saved = bus.ack(&batch.cursor, &batch.ids()).await.unwrap();
        assert_eq!(saved.byte_offset, bus.bus_len().await.unwrap());
        assert_eq!(saved.last_seq, 1);

        let again = bus.read(&bus.load_cursor("B").await.unwrap()).await.unwrap();
        assert!(again.messages.is_empty());

        // Re-reading from the start still skips processed ids.
        let mut rewound = bus.load_cursor("B").await.unwrap();
        rewound.byte_offset = 0;
        assert!(bus.read(&rewound).await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn malformed_and_partial_lines() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;
        bus.append(notify("A", "B", Priority::Normal)).await.unwrap();
        append_line(&bus.paths().bus, "{not json}\n".to_string())
            .await
            .unwrap();
        bus.append(notify("A", "B", Priority::Normal)).await.unwrap();
        append_line(&bus.paths().bus, "{\"id\":\"half".to_string())
            .await
            .unwrap();

        let batch = bus.read(&Cursor::new("B")).await.unwrap();
        assert_eq!(batch.messages.len(), 2);
        let len = bus.bus_len().await.unwrap();
        assert_eq!(batch.cursor.byte_offset, len - "{\"id\":\"half".len() as u64);
    }

    #[tokio::test]
    async fn expired_messages_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;
        let mut stale = notify("A", "B", Priority::Normal)
            .into_envelope("old".into(), Utc::now() - chrono::Duration::seconds(60), 1);
        stale.ttl_ms = 1_000;
        let line = format!("{}\n", serde_json::to_string(&stale).unwrap());
        append_line(&bus.paths().bus, line).await.unwrap();

        let batch = bus.read(&Cursor::new("B")).await.unwrap();
        assert!(batch.messages.is_empty());
        assert_eq!(batch.cursor.byte_offset, bus.bus_len().await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_cursor_is_recovered() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;
        tokio::fs::write(bus.paths().cursor("B"), "{{{ nope")
            .await
            .unwrap();

        let cursor = bus.load_cursor("B").await.unwrap();
        assert!(cursor.recovered);
        assert_eq!(cursor.byte_offset, 0);

        let saved = bus.ack(&cursor, &[]).await.unwrap();
        assert!(!saved.recovered);
        assert!(!bus.load_cursor("B").await.unwrap().recovered);
    }

    #[tokio::test]
    async fn cursor_past_end_is_clamped() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;
        bus.append(notify("A", "B", Priority::Normal)).await.unwrap();
        let mut cursor = Cursor::new("B");
        cursor.byte_offset = 1_000_000;
        tokio::fs::write(
            bus.paths().cursor("B"),
            serde_json::to_string(&cursor).unwrap(),
        )
        .await
        .unwrap();

        let loaded = bus.load_cursor("B").await.unwrap();
        assert_eq!(loaded.byte_offset, bus.bus_len().await.unwrap());
        assert!(!loaded.recovered);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = BusConfig {
            max_payload_bytes: 16,
            ..BusConfig::default()
        };
        let bus = MessageBus::open(tmp.path(), config).await.unwrap();
        let draft = EnvelopeDraft::new("notify", "A", "B", "t", json!({"text": "x".repeat(64)}));
        assert!(matches!(
            bus.append(draft).await,
            Err(BusError::PayloadTooLarge { limit: 16, .. })
        ));
        assert_eq!(bus.bus_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unsafe_sender_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;
        let draft = EnvelopeDraft::new("notify", "../evil", "B", "t", json!({}));
        assert!(matches!(
            bus.append(draft).await,
            Err(BusError::InvalidSessionId(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_appends_never_interleave() {
        let tmp = TempDir::new().unwrap();
        let bus = std::sync::Arc::new(open_bus(&tmp).await);
        let mut handles = Vec::new();
        for w in 0..8 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let from = format!("W{w}");
                    let payload = json!({"blob": "z".repeat(2_000)});
                    bus.append(EnvelopeDraft::new("notify", from, "R", "t", payload))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let all = bus.scan().await.unwrap();
        assert_eq!(all.len(), 80);
        let batch = bus.read(&Cursor::new("R")).await.unwrap();
        assert_eq!(batch.messages.len(), 80);
    }
}
