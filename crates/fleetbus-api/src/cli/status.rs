//! `fleetbus status`: ask the running hub for its agents.

use std::time::Duration;

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use fleetbus_infra::connector::{FileBusTransport, HubTransport, discover_hub_url};
use fleetbus_infra::filesystem::HubStateStore;
use fleetbus_types::agent::{AgentStatus, HubStatus};

use crate::state::AppContext;

pub async fn status(ctx: &AppContext, json: bool) -> Result<()> {
    let store = HubStateStore::new(&ctx.paths.state_file);
    let Some(url) = discover_hub_url(&ctx.config.connector, &store).await else {
        return not_running(ctx, json);
    };

    let timeout = Duration::from_millis(ctx.config.connector.request_timeout_ms);
    let hub = HubTransport::new(&url, timeout, FileBusTransport::new(ctx.bus.clone()))?;
    let status = match hub.status().await {
        Ok(status) => status,
        Err(err) => {
            tracing::debug!(url = %url, error = %err, "hub did not answer");
            return not_running(ctx, json);
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    print_status(&url, &status);
    Ok(())
}

fn not_running(ctx: &AppContext, json: bool) -> Result<()> {
    if json {
        let status = serde_json::json!({
            "listening": false,
            "state_file": ctx.paths.state_file.display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!();
        println!(
            "  {} No hub is running. Start one with: {}",
            style("i").blue().bold(),
            style("fleetbus serve").yellow()
        );
        println!();
    }
    Ok(())
}

fn print_status(url: &str, status: &HubStatus) {
    println!();
    println!(
        "  {} Fleetbus hub at {}",
        style("⚡").bold(),
        style(url).cyan()
    );
    println!();
    println!("  {}", style("── Hub ──").dim());
    println!("  Agents:   {}", style(status.connected_agents).bold());
    let brain = if status.brain_available {
        style("available").green()
    } else {
        style("unavailable").yellow()
    };
    println!("  PM brain: {brain}");
    println!();

    if status.agents.is_empty() {
        println!("  {}", style("No agents registered.").dim());
        println!();
        return;
    }

    println!("{}", agent_table(&status.agents));
    println!();
}

fn agent_table(agents: &[AgentStatus]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Session").fg(Color::White),
        Cell::new("Role").fg(Color::White),
        Cell::new("Task").fg(Color::White),
        Cell::new("Link").fg(Color::White),
        Cell::new("Heartbeat").fg(Color::White),
    ]);

    for agent in agents {
        let link = if agent.ws_connected {
            Cell::new("● push").fg(Color::Green)
        } else {
            Cell::new("○ http").fg(Color::DarkGrey)
        };
        let age = format_age(agent.heartbeat_age_ms);
        let heartbeat = if agent.stale {
            Cell::new(format!("{age} (stale)")).fg(Color::Yellow)
        } else {
            Cell::new(age).fg(Color::DarkGrey)
        };
        table.add_row(vec![
            Cell::new(&agent.session_id).fg(Color::Cyan),
            Cell::new(&agent.role),
            Cell::new(agent.task_id.as_deref().unwrap_or("-")),
            link,
            heartbeat,
        ]);
    }
    table
}

fn format_age(ms: u64) -> String {
    match ms / 1000 {
        0 => "just now".to_string(),
        s @ 1..=59 => format!("{s}s ago"),
        s @ 60..=3599 => format!("{}m ago", s / 60),
        s => format!("{}h ago", s / 3600),
    }
}
