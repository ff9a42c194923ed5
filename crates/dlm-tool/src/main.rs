//! DLM admin tool (dlm_tool).
//!
//! Queries and controls a running dlm_controld over its control socket.
//!
//! # Usage
//!
//! ```text
//! dlm_tool [OPTIONS] <COMMAND>
//!
//! Commands:
//!   ls         List lockspaces, or show one in detail
//!   status     Daemon status and fencing; -n adds node histories
//!   dump       Recent daemon log lines
//!   plocks     Plock state of a lockspace
//!   join       Join a lockspace
//!   leave      Leave a lockspace
//!   fence-ack  Exempt a failed node from fencing
//!
//! Options:
//!   -a, --address <ADDRESS>  dlm_controld address [default: 127.0.0.1]
//!   -p, --port <PORT>        dlm_controld port [default: 21066]
//! ```

mod cluster;
mod common;
mod lockspace;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dlm_proto::defaults::{DEFAULT_CONTROL_ADDR, DEFAULT_CONTROL_PORT};
use dlm_proto::node::NodeId;

/// DLM admin tool.
#[derive(Parser)]
#[command(name = "dlm_tool", version, about = "DLM cluster control admin tool")]
struct Cli {
    /// dlm_controld address
    #[arg(short = 'a', long, default_value = DEFAULT_CONTROL_ADDR)]
    address: String,

    /// dlm_controld control port
    #[arg(short = 'p', long, default_value_t = DEFAULT_CONTROL_PORT)]
    port: u16,

    /// Enable verbose/debug logging
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List lockspaces, or show one in detail
    Ls {
        name: Option<String>,
    },
    /// Daemon status and fencing
    Status {
        /// Show per-lockspace node histories
        #[arg(short = 'n', long)]
        nodes: bool,
    },
    /// Recent daemon log lines
    Dump,
    /// Plock state of a lockspace
    Plocks {
        name: String,
    },
    /// Join a lockspace
    Join {
        name: String,
    },
    /// Leave a lockspace
    Leave {
        name: String,
    },
    /// Exempt a failed node from fencing
    FenceAck {
        nodeid: NodeId,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let addr = &cli.address;
    let port = cli.port;

    match cli.command {
        Commands::Ls { name } => lockspace::list(addr, port, name).await,
        Commands::Status { nodes } => cluster::status(addr, port, nodes).await,
        Commands::Dump => cluster::dump(addr, port).await,
        Commands::Plocks { name } => lockspace::plocks(addr, port, name).await,
        Commands::Join { name } => lockspace::join(addr, port, name).await,
        Commands::Leave { name } => lockspace::leave(addr, port, name).await,
        Commands::FenceAck { nodeid } => cluster::fence_ack(addr, port, nodeid).await,
    }
}
