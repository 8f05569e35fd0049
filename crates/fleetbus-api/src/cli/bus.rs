//! Operator commands against the local bus: send, read, compact, acks, dlq.

use anyhow::{Context, Result, anyhow};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use fleetbus_types::envelope::{Envelope, EnvelopeDraft, MessageKind, Priority};

use crate::state::AppContext;

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).fg(Color::White))
            .collect::<Vec<_>>(),
    );
    table
}

fn priority_cell(priority: Priority) -> Cell {
    let cell = Cell::new(priority);
    match priority {
        Priority::Blocking => cell.fg(Color::Red),
        Priority::Normal => cell,
        Priority::Fyi => cell.fg(Color::DarkGrey),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[allow(clippy::too_many_arguments)]
pub async fn send(
    ctx: &AppContext,
    from: &str,
    to: &str,
    topic: &str,
    priority: &str,
    payload: &str,
    kind: &str,
    request: bool,
    json: bool,
) -> Result<()> {
    let priority: Priority = priority.parse().map_err(|e: String| anyhow!(e))?;
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("--payload must be valid JSON")?;

    let envelope = if request {
        ctx.bus.request(from, to, topic, payload).await?
    } else {
        let draft = EnvelopeDraft::new(MessageKind::from(kind), from, to, topic, payload)
            .with_priority(priority);
        ctx.bus.append(draft).await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&envelope)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Sent {} {} -> {} on '{}'",
        style("✓").green().bold(),
        style(&envelope.kind).bold(),
        style(&envelope.from).cyan(),
        style(&envelope.to).cyan(),
        envelope.topic
    );
    println!(
        "  {}",
        style(format!("id {} seq {}", envelope.id, envelope.sender_seq)).dim()
    );
    if request {
        println!(
            "  {}",
            style("Waiting for an ACK; see `fleetbus acks list`.").dim()
        );
    }
    println!();
    Ok(())
}

pub async fn read(ctx: &AppContext, reader: &str, ack: bool, json: bool) -> Result<()> {
    let cursor = ctx.bus.load_cursor(reader).await?;
    let batch = ctx.bus.read(&cursor).await?;
    if ack {
        ctx.bus.ack(&batch.cursor, &batch.ids()).await?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&batch.messages)?);
        return Ok(());
    }

    if cursor.recovered {
        println!(
            "  {} Cursor for '{}' was unreadable and has been reset.",
            style("!").yellow().bold(),
            reader
        );
    }

    if batch.messages.is_empty() {
        println!();
        println!(
            "  {} No new messages for '{}'.",
            style("i").blue().bold(),
            style(reader).cyan()
        );
        println!();
        return Ok(());
    }

    println!("{}", message_table(&batch.messages));
    if ack {
        println!(
            "  {} {} message(s) acknowledged.",
            style("✓").green(),
            batch.messages.len()
        );
    } else {
        println!(
            "  {}",
            style("Cursor not advanced; pass --ack to consume.").dim()
        );
    }
    println!();
    Ok(())
}

fn message_table(messages: &[Envelope]) -> Table {
    let mut table = new_table(&["Id", "Kind", "From", "Topic", "Priority", "Payload"]);
    for message in messages {
        let mut payload = message.payload.to_string();
        if payload.len() > 60 {
            let cut = (0..=57).rev().find(|i| payload.is_char_boundary(*i)).unwrap_or(0);
            payload.truncate(cut);
            payload.push_str("...");
        }
        table.add_row(vec![
            Cell::new(short_id(&message.id)).fg(Color::DarkGrey),
            Cell::new(&message.kind),
            Cell::new(&message.from).fg(Color::Cyan),
            Cell::new(&message.topic),
            priority_cell(message.priority),
            Cell::new(payload),
        ]);
    }
    table
}

pub async fn compact(ctx: &AppContext, force: bool, json: bool) -> Result<()> {
    if !force && !ctx.bus.needs_compaction().await? {
        let size = ctx.bus.bus_len().await?;
        if json {
            let skipped = serde_json::json!({
                "compacted": false,
                "bus_bytes": size,
                "threshold_bytes": ctx.bus.config().compaction_threshold_bytes,
            });
            println!("{}", serde_json::to_string_pretty(&skipped)?);
        } else {
            println!();
            println!(
                "  {} Bus is {} bytes, under the {} byte threshold. Use --force to compact anyway.",
                style("i").blue().bold(),
                size,
                ctx.bus.config().compaction_threshold_bytes
            );
            println!();
        }
        return Ok(());
    }

    let report = ctx.bus.compact_bus().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    match &report.archive {
        Some(archive) => {
            println!(
                "  {} Archived {} message(s) ({} bytes) to {}",
                style("✓").green().bold(),
                report.archived_messages,
                report.archived_bytes,
                style(archive.display()).dim()
            );
            println!("  {} bytes remain on the live bus.", report.retained_bytes);
        }
        None => println!(
            "  {} Nothing every reader has consumed yet.",
            style("i").blue().bold()
        ),
    }
    println!();
    Ok(())
}

pub async fn acks_sweep(ctx: &AppContext, json: bool) -> Result<()> {
    let sweep = ctx.bus.process_ack_timeouts().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&sweep)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} retried, {} dead-lettered",
        style("✓").green().bold(),
        style(sweep.retried).yellow(),
        style(sweep.dlqd).red()
    );
    for id in &sweep.retried_ids {
        println!("    {} {}", style("↻").dim(), id);
    }
    println!();
    Ok(())
}

pub async fn acks_list(ctx: &AppContext, json: bool) -> Result<()> {
    let pending = ctx.bus.pending_acks().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
        return Ok(());
    }

    if pending.is_empty() {
        println!();
        println!("  {} No requests awaiting an ACK.", style("i").blue().bold());
        println!();
        return Ok(());
    }

    let now = chrono::Utc::now();
    let mut table = new_table(&["Id", "From", "To", "Retries", "Deadline"]);
    for entry in &pending {
        let deadline = entry.deadline_at.format("%H:%M:%S").to_string();
        let deadline = if entry.is_overdue(now) {
            Cell::new(format!("{deadline} (overdue)")).fg(Color::Red)
        } else {
            Cell::new(deadline).fg(Color::DarkGrey)
        };
        table.add_row(vec![
            Cell::new(&entry.message_id),
            Cell::new(&entry.from).fg(Color::Cyan),
            Cell::new(&entry.to).fg(Color::Cyan),
            Cell::new(entry.retries),
            deadline,
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn acks_ack(ctx: &AppContext, acker: &str, message_id: &str, json: bool) -> Result<()> {
    let ack = ctx.bus.send_ack(acker, message_id).await?;
    report_reply(ack, message_id, "Acknowledged", json)
}

pub async fn acks_nack(
    ctx: &AppContext,
    acker: &str,
    message_id: &str,
    reason: &str,
    json: bool,
) -> Result<()> {
    let nack = ctx.bus.send_nack(acker, message_id, reason).await?;
    report_reply(nack, message_id, "Rejected", json)
}

fn report_reply(reply: Option<Envelope>, message_id: &str, verb: &str, json: bool) -> Result<()> {
    let Some(reply) = reply else {
        return Err(anyhow!("no request with id '{message_id}' on the bus"));
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&reply)?);
    } else {
        println!(
            "  {} {verb} {} (notified {})",
            style("✓").green().bold(),
            message_id,
            style(&reply.to).cyan()
        );
    }
    Ok(())
}

pub async fn dlq_list(ctx: &AppContext, json: bool) -> Result<()> {
    let entries = ctx.bus.dlq_entries().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!();
        println!("  {} Dead-letter queue is empty.", style("i").blue().bold());
        println!();
        return Ok(());
    }

    let mut table = new_table(&["Id", "Reason", "Detail", "Moved"]);
    for entry in &entries {
        let reason = serde_json::to_value(&entry.reason)?;
        table.add_row(vec![
            Cell::new(&entry.message_id),
            Cell::new(reason.as_str().unwrap_or("-")).fg(Color::Red),
            Cell::new(entry.detail.to_string()),
            Cell::new(entry.moved_at.format("%Y-%m-%d %H:%M:%S")).fg(Color::DarkGrey),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn dlq_clear(ctx: &AppContext, json: bool) -> Result<()> {
    let cleared = ctx.bus.clear_dlq().await?;
    if json {
        println!("{}", serde_json::json!({ "cleared": cleared }));
    } else {
        println!(
            "  {} Cleared {} dead-lettered message(s).",
            style("✓").green().bold(),
            cleared
        );
    }
    Ok(())
}
