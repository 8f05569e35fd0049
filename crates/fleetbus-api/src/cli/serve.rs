//! `fleetbus serve`: run the hub in the foreground.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use console::style;

use fleetbus_api::hub::{Hub, HubState};
use fleetbus_infra::filesystem::{HubStateStore, SessionFiles};

use crate::state::AppContext;

/// Start the hub and block until `shutdown` resolves.
pub async fn serve(
    ctx: AppContext,
    port: Option<u16>,
    json: bool,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let mut config = ctx.config.hub.clone();
    if let Some(port) = port {
        config.port = port;
    }
    let host = config.host.clone();

    tokio::fs::create_dir_all(&ctx.paths.sessions_dir).await?;
    let sessions = Arc::new(SessionFiles::new(&ctx.paths.sessions_dir));

    // No PM brain from the CLI; ask-pm calls get 503 until an embedder provides one.
    let state = HubState::new(config, ctx.bus.clone(), sessions, None);
    let hub = Hub::new(state, HubStateStore::new(&ctx.paths.state_file));
    let bound = hub.start().await?;

    if json {
        let started = serde_json::json!({
            "listening": true,
            "host": host,
            "port": bound,
            "pid": std::process::id(),
            "state_file": ctx.paths.state_file.display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&started)?);
    } else {
        println!();
        println!(
            "  {} Fleetbus hub listening on {}",
            style("⚡").bold(),
            style(format!("http://{host}:{bound}")).cyan()
        );
        println!(
            "  {} {}",
            style("bus:").dim(),
            style(ctx.paths.bus_dir.display()).dim()
        );
        println!("  {}", style("Press Ctrl+C to stop").dim());
    }

    shutdown.await;
    hub.stop().await;

    if !json {
        println!("\n  Hub stopped.");
    }
    Ok(())
}
