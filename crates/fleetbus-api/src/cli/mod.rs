//! CLI command definitions for the `fleetbus` binary.

pub mod bus;
pub mod serve;
pub mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Reliable messaging between cooperating agent processes.
#[derive(Parser)]
#[command(name = "fleetbus", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Data directory (defaults to ~/.fleetbus).
    #[arg(long, global = true, env = "FLEETBUS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the hub until Ctrl+C or SIGTERM.
    Serve {
        /// First port to try (overrides fleetbus.toml).
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show a running hub's status.
    Status,

    /// Append an envelope to the bus.
    Send {
        /// Sender id.
        #[arg(long)]
        from: String,

        /// Recipient id, or `*` for everyone.
        #[arg(long)]
        to: String,

        #[arg(long)]
        topic: String,

        /// blocking, normal or fyi.
        #[arg(long, default_value = "normal")]
        priority: String,

        /// JSON payload.
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Message kind.
        #[arg(long, default_value = "notify")]
        kind: String,

        /// Send as a request that must be acknowledged.
        #[arg(long, conflicts_with = "kind")]
        request: bool,
    },

    /// Read a reader's pending messages.
    Read {
        /// Reader id (session id).
        reader: String,

        /// Advance the reader's cursor past what was read.
        #[arg(long)]
        ack: bool,
    },

    /// Compact the bus if it has grown past the threshold.
    Compact {
        /// Compact regardless of size.
        #[arg(long)]
        force: bool,
    },

    /// Request acknowledgements.
    Acks {
        #[command(subcommand)]
        action: AcksCommand,
    },

    /// Dead-letter queue.
    Dlq {
        #[command(subcommand)]
        action: DlqCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum AcksCommand {
    /// Retry or dead-letter overdue requests.
    Sweep,

    /// List requests still waiting for an ACK.
    #[command(alias = "ls")]
    List,

    /// Acknowledge a request.
    Ack {
        /// Who is acknowledging.
        #[arg(long = "as")]
        acker: String,

        message_id: String,
    },

    /// Reject a request; it keeps retrying.
    Nack {
        /// Who is rejecting.
        #[arg(long = "as")]
        acker: String,

        message_id: String,

        #[arg(long, default_value = "rejected")]
        reason: String,
    },
}

#[derive(Subcommand)]
pub enum DlqCommand {
    /// List dead-lettered messages.
    #[command(alias = "ls")]
    List,

    /// Empty the dead-letter queue.
    Clear,
}
