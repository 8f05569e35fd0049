//! Bus compaction.
//!
//! The prefix every reader has consumed (up to the smallest cursor offset) is
//! moved into `archive/`, the live file is rewritten to hold only the tail, and
//! every cursor is rebased onto the new file. The cut never passes an
//! unanswered `ask_pm` or a request still waiting for its ACK, since the PM
//! and the ACK sweep find those by scanning the live file.
//!
//! Each compaction bumps the generation in `bus.gen` and records how many
//! bytes it cut, so a cursor held in memory across the compaction can still
//! be mapped onto the new file.

use std::collections::HashSet;
use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;

use chrono::Utc;
use fleetbus_types::cursor::Cursor;
use fleetbus_types::envelope::Envelope;
use fleetbus_types::error::BusError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use super::pm::unanswered_ids;
use super::{MessageBus, append_line, write_atomic};

/// Contents of `bus.gen`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct Generation {
    pub generation: u64,
    /// Bytes removed from the front of the file by the compaction that
    /// started this generation.
    pub cut: u64,
}

/// What a compaction pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    /// Lines moved into the archive.
    pub archived_messages: usize,
    /// Generation this pass started; 0 when nothing was archived.
    pub generation: u64,
    pub archived_bytes: u64,
    /// Size of the live file after the pass.
    pub retained_bytes: u64,
    /// Archive file written, if anything was moved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<PathBuf>,
}

impl MessageBus {
    /// Whether the live bus has grown past the compaction threshold.
    pub async fn needs_compaction(&self) -> Result<bool, BusError> {
        Ok(self.bus_len().await? > self.config.compaction_threshold_bytes)
    }

    /// Archive the prefix all readers have consumed and keep only the tail.
    ///
    /// Nothing is moved when there are no reader cursors, or when any cursor
    /// is unreadable, since its position is then unknown.
    pub async fn compact_bus(&self) -> Result<CompactionReport, BusError> {
        let _lock = self.lock().await?;
        let previous = self.read_generation().await?;

        let Some(cursors) = self.all_cursors().await? else {
            return Ok(CompactionReport::default());
        };
        if cursors.is_empty() {
            debug!("no reader cursors; nothing to compact");
            return Ok(CompactionReport::default());
        }

        let mut old = match tokio::fs::File::open(&self.paths.bus).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(CompactionReport::default());
            }
            Err(err) => return Err(err.into()),
        };
        let mut content = Vec::new();
        old.read_to_end(&mut content).await?;
        let read_len = content.len();

        let lowest = cursors
            .iter()
            .map(|c| usize::try_from(c.byte_offset).unwrap_or(usize::MAX))
            .min()
            .unwrap_or(0)
            .min(read_len);
        // Only cut on a line boundary.
        let boundary = content[..lowest]
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |i| i + 1);
        let cut = self.first_pinned_line(&content, boundary).await?;
        if cut < boundary {
            debug!(boundary, cut, "open request holds back compaction");
        }
        if cut == 0 {
            return Ok(CompactionReport {
                retained_bytes: read_len as u64,
                ..CompactionReport::default()
            });
        }

        let (prefix, tail) = content.split_at(cut);
        let archive = self.paths.archive.join(format!(
            "bus-{}.jsonl",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        tokio::fs::write(&archive, prefix).await?;
        write_atomic(&self.paths.bus, tail).await?;

        // Writers that opened the old file before the rename may have
        // appended after our read; carry those lines over.
        old.seek(SeekFrom::Start(read_len as u64)).await?;
        let mut late = Vec::new();
        old.read_to_end(&mut late).await?;
        if !late.is_empty() {
            warn!(bytes = late.len(), "carrying late appends into compacted bus");
            append_line(&self.paths.bus, String::from_utf8_lossy(&late).into_owned()).await?;
        }

        let next = Generation {
            generation: previous.generation + 1,
            cut: cut as u64,
        };
        write_atomic(&self.paths.generation, &serde_json::to_vec(&next)?).await?;

        for mut cursor in cursors {
            self.rebase(&mut cursor, &previous).await?;
            cursor.byte_offset = cursor.byte_offset.saturating_sub(next.cut);
            cursor.generation = next.generation;
            self.store_cursor(&cursor).await?;
        }

        let report = CompactionReport {
            archived_messages: prefix.iter().filter(|b| **b == b'\n').count(),
            generation: next.generation,
            archived_bytes: cut as u64,
            retained_bytes: (tail.len() + late.len()) as u64,
            archive: Some(archive),
        };
        info!(
            generation = report.generation,
            archived_messages = report.archived_messages,
            archived_bytes = report.archived_bytes,
            retained_bytes = report.retained_bytes,
            "compacted bus"
        );
        Ok(report)
    }

    /// Offset of the first line before `boundary` that must stay live: an
    /// unanswered `ask_pm` or a request still waiting for its ACK. Returns
    /// `boundary` when nothing in the prefix is pinned.
    async fn first_pinned_line(
        &self,
        content: &[u8],
        boundary: usize,
    ) -> Result<usize, BusError> {
        let log: Vec<Envelope> = super::parse_lines(content);
        let mut pinned: HashSet<String> = unanswered_ids(&log)
            .into_iter()
            .map(str::to_string)
            .collect();
        pinned.extend(self.read_pending().await?.into_iter().map(|p| p.message_id));
        if pinned.is_empty() {
            return Ok(boundary);
        }

        let mut offset = 0;
        for raw in content[..boundary].split_inclusive(|b| *b == b'\n') {
            let id = serde_json::from_slice::<Envelope>(raw.trim_ascii())
                .ok()
                .map(|envelope| envelope.id);
            if id.is_some_and(|id| pinned.contains(&id)) {
                return Ok(offset);
            }
            offset += raw.len();
        }
        Ok(boundary)
    }

    /// The current generation record; generation 0 before any compaction.
    pub(super) async fn read_generation(&self) -> Result<Generation, BusError> {
        match tokio::fs::read(&self.paths.generation).await {
            Ok(content) => Ok(serde_json::from_slice(&content).unwrap_or_else(|err| {
                warn!(error = %err, "unreadable bus generation; assuming none");
                Generation::default()
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Generation::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Map `cursor` onto the live file of generation `current`.
    ///
    /// A cursor one generation behind loses the bytes that compaction cut.
    /// Anything older falls back to the reader's persisted position, which
    /// compaction always keeps current.
    pub(super) async fn rebase(
        &self,
        cursor: &mut Cursor,
        current: &Generation,
    ) -> Result<(), BusError> {
        if cursor.generation == current.generation {
            return Ok(());
        }
        if cursor.generation + 1 == current.generation {
            cursor.byte_offset = cursor.byte_offset.saturating_sub(current.cut);
        } else {
            let persisted = self.persisted_offset(&cursor.session_id, current).await?;
            if cursor.byte_offset > 0 {
                warn!(
                    reader = %cursor.session_id,
                    held = cursor.generation,
                    current = current.generation,
                    byte_offset = persisted,
                    "cursor is several compactions old; resuming from saved position"
                );
            }
            cursor.byte_offset = persisted;
        }
        cursor.generation = current.generation;
        Ok(())
    }

    async fn persisted_offset(
        &self,
        reader: &str,
        current: &Generation,
    ) -> Result<u64, BusError> {
        match tokio::fs::read_to_string(self.paths.cursor(reader)).await {
            Ok(content) => Ok(serde_json::from_str::<Cursor>(&content)
                .ok()
                .filter(|c| c.generation == current.generation)
                .map_or(0, |c| c.byte_offset)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Every persisted cursor, or `None` if any of them cannot be parsed.
    async fn all_cursors(&self) -> Result<Option<Vec<Cursor>>, BusError> {
        let mut dir = match tokio::fs::read_dir(&self.paths.cursors).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Some(Vec::new())),
            Err(err) => return Err(err.into()),
        };

        let mut cursors = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<Cursor>(&content) {
                Ok(cursor) => cursors.push(cursor),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "unreadable cursor; skipping compaction"
                    );
                    return Ok(None);
                }
            }
        }
        Ok(Some(cursors))
    }
}

#[cfg(test)]
mod tests {
    use fleetbus_types::config::BusConfig;
    use fleetbus_types::envelope::EnvelopeDraft;
    use fleetbus_types::hub::PmAnswer;
    use serde_json::json;
    use tempfile::TempDir;

    use super::super::tests::open_bus;
    use super::*;

    fn chunky(from: &str, to: &str) -> EnvelopeDraft {
        EnvelopeDraft::new("notify", from, to, "bulk", json!({"blob": "q".repeat(1_000)}))
    }

    #[tokio::test]
    async fn threshold_triggers_needs_compaction() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;
        assert!(!bus.needs_compaction().await.unwrap());
        while bus.bus_len().await.unwrap() <= 100 * 1024 {
            bus.append(chunky("A", "B")).await.unwrap();
        }
        assert!(bus.needs_compaction().await.unwrap());
    }

    #[tokio::test]
    async fn compaction_archives_only_consumed_prefix() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;
        while bus.bus_len().await.unwrap() <= 100 * 1024 {
            bus.append(chunky("A", "B")).await.unwrap();
        }
        let batch = bus.read(&bus.load_cursor("B").await.unwrap()).await.unwrap();
        let consumed: Vec<String> = batch.ids();
        bus.ack(&batch.cursor, &consumed).await.unwrap();

        // Written after B's cursor, so it must survive.
        let tail_msg = bus.append(chunky("A", "B")).await.unwrap();

        let report = bus.compact_bus().await.unwrap();
        assert_eq!(report.archived_messages, consumed.len());
        let archive = report.archive.unwrap();

        let archived: Vec<String> = tokio::fs::read_to_string(&archive)
            .await
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(archived, consumed);

        let live = bus.scan().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, tail_msg.id);
        assert!(!bus.needs_compaction().await.unwrap());

        let cursor = bus.load_cursor("B").await.unwrap();
        assert_eq!(cursor.byte_offset, 0);
        let next = bus.read(&cursor).await.unwrap();
        assert_eq!(next.messages.len(), 1);
        assert_eq!(next.messages[0].id, tail_msg.id);
    }

    #[tokio::test]
    async fn slowest_reader_bounds_compaction() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;
        for _ in 0..4 {
            bus.append(chunky("A", "*")).await.unwrap();
        }
        // C has read only the first two lines.
        let all = bus.read(&bus.load_cursor("C").await.unwrap()).await.unwrap();
        let content = tokio::fs::read(&bus.paths().bus).await.unwrap();
        let second_line_end = content
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == b'\n')
            .nth(1)
            .map(|(i, _)| i as u64 + 1)
            .unwrap();
        let mut partial = all.cursor.clone();
        partial.byte_offset = second_line_end;
        bus.ack(&partial, &[]).await.unwrap();

        let b = bus.read(&bus.load_cursor("B").await.unwrap()).await.unwrap();
        bus.ack(&b.cursor, &b.ids()).await.unwrap();

        let report = bus.compact_bus().await.unwrap();
        assert_eq!(report.archived_messages, 2);
        assert_eq!(bus.scan().await.unwrap().len(), 2);

        let b_after = bus.load_cursor("B").await.unwrap();
        assert_eq!(b_after.byte_offset, bus.bus_len().await.unwrap());
        let c_after = bus.load_cursor("C").await.unwrap();
        assert_eq!(c_after.byte_offset, 0);
        assert_eq!(bus.read(&c_after).await.unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn ack_after_compaction_keeps_later_messages() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;
        bus.append(chunky("A", "B")).await.unwrap();
        bus.drain("B").await.unwrap();
        for _ in 0..5 {
            bus.append(chunky("A", "B")).await.unwrap();
        }

        // B reads but is still working when the hub compacts.
        let stale = bus.load_cursor("B").await.unwrap();
        let batch = bus.read(&stale).await.unwrap();
        assert_eq!(batch.messages.len(), 5);
        let report = bus.compact_bus().await.unwrap();
        assert_eq!(report.archived_messages, 1);
        assert_eq!(report.generation, 1);

        let late = bus.append(chunky("A", "B")).await.unwrap();

        // A read from the pre-compaction cursor still starts at the right line.
        let reread = bus.read(&stale).await.unwrap();
        assert_eq!(reread.messages.len(), 6);
        assert_eq!(reread.cursor.generation, 1);

        let saved = bus.ack(&batch.cursor, &batch.ids()).await.unwrap();
        assert_eq!(saved.generation, 1);
        let next = bus.drain("B").await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, late.id);
    }

    #[tokio::test]
    async fn unanswered_ask_pm_survives_compaction() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;
        let ask = bus
            .send_ask_pm("S-1", "which branch?", json!({}))
            .await
            .unwrap();
        while bus.bus_len().await.unwrap() <= 100 * 1024 {
            bus.append(chunky("A", "S-1")).await.unwrap();
        }
        // The only reader with a cursor is fully caught up.
        bus.drain("S-1").await.unwrap();

        let report = bus.compact_bus().await.unwrap();
        assert_eq!(report.archived_messages, 0);
        let open = bus.unanswered_pm_requests().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, ask.id);

        bus.send_pm_response("S-1", &ask.id, &PmAnswer::new("main"))
            .await
            .unwrap();
        bus.drain("S-1").await.unwrap();
        let report = bus.compact_bus().await.unwrap();
        assert!(report.archived_messages > 0);
        assert!(bus.unanswered_pm_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn awaited_request_holds_back_compaction() {
        let tmp = TempDir::new().unwrap();
        let bus = open_bus(&tmp).await;
        bus.append(chunky("A", "B")).await.unwrap();
        let request = bus.request("A", "B", "review", json!({})).await.unwrap();
        bus.append(chunky("A", "B")).await.unwrap();
        bus.drain("B").await.unwrap();

        let report = bus.compact_bus().await.unwrap();
        assert_eq!(report.archived_messages, 1);
        let live = bus.scan().await.unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].id, request.id);
        let cursor = bus.load_cursor("B").await.unwrap();
        assert_eq!(cursor.byte_offset, bus.bus_len().await.unwrap());
    }

    #[tokio::test]
    async fn no_cursors_means_no_compaction() {
        let tmp = TempDir::new().unwrap();
        let bus = MessageBus::open(tmp.path(), BusConfig::default()).await.unwrap();
        bus.append(chunky("A", "B")).await.unwrap();
        let before = bus.bus_len().await.unwrap();

        let report = bus.compact_bus().await.unwrap();
        assert_eq!(report, CompactionReport::default());
        assert_eq!(bus.bus_len().await.unwrap(), before);
    }
}
