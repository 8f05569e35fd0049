//! Fleetbus CLI entry point.
//!
//! Binary name: `fleetbus`
//!
//! Parses CLI arguments, sets up tracing, opens the bus under the data
//! directory, then dispatches to a command handler or runs the hub.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use fleetbus_observe::tracing_setup::{
    LogFormat, TracingOptions, filter_for_verbosity, init_tracing, shutdown_tracing,
};

use cli::{AcksCommand, Cli, Commands, DlqCommand};
use state::AppContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        default_filter: filter_for_verbosity(cli.verbose, cli.quiet).to_string(),
        format: if cli.log_json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        enable_otel: std::env::var_os("FLEETBUS_OTEL").is_some(),
    };
    if let Err(err) = init_tracing(&options) {
        eprintln!("Warning: tracing already initialized: {err}");
    }

    // Shell completions don't need the bus
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "fleetbus", &mut std::io::stdout());
        return Ok(());
    }

    let ctx = AppContext::init(cli.data_dir.clone()).await?;
    let json = cli.json;

    let result = match cli.command {
        Commands::Serve { port } => cli::serve::serve(ctx, port, json, shutdown_signal()).await,
        Commands::Status => cli::status::status(&ctx, json).await,
        Commands::Send {
            from,
            to,
            topic,
            priority,
            payload,
            kind,
            request,
        } => {
            cli::bus::send(
                &ctx, &from, &to, &topic, &priority, &payload, &kind, request, json,
            )
            .await
        }
        Commands::Read { reader, ack } => cli::bus::read(&ctx, &reader, ack, json).await,
        Commands::Compact { force } => cli::bus::compact(&ctx, force, json).await,
        Commands::Acks { action } => match action {
            AcksCommand::Sweep => cli::bus::acks_sweep(&ctx, json).await,
            AcksCommand::List => cli::bus::acks_list(&ctx, json).await,
            AcksCommand::Ack { acker, message_id } => {
                cli::bus::acks_ack(&ctx, &acker, &message_id, json).await
            }
            AcksCommand::Nack {
                acker,
                message_id,
                reason,
            } => cli::bus::acks_nack(&ctx, &acker, &message_id, &reason, json).await,
        },
        Commands::Dlq { action } => match action {
            DlqCommand::List => cli::bus::dlq_list(&ctx, json).await,
            DlqCommand::Clear => cli::bus::dlq_clear(&ctx, json).await,
        },
        Commands::Completions { .. } => Ok(()),
    };

    shutdown_tracing();
    result
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
