//! DLM cluster control daemon (dlm_controld).
//!
//! Runs the user-space side of the kernel distributed lock manager:
//! lockspace membership and recovery, fencing of failed nodes, and
//! cluster-wide POSIX locks.
//!
//! Usage:
//!   dlm_controld --our-nodeid <ID> --cluster-name <NAME> [OPTIONS]
//!
//! The daemon creates a tokio runtime and runs:
//! 1. The event loop owning all protocol state
//! 2. The group driver pump
//! 3. The kernel bridge worker (and the plock device reader)
//! 4. The control socket for `dlm_tool`
//! 5. The housekeeping ticker

mod admin;
mod bridge;
mod clock;
mod config;
mod daemon;
mod fence;
mod group;
mod lockspace;
mod logging;
mod outbox;
mod plock;
mod protocol;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tokio::sync::mpsc;
use tracing::{error, info};

use dlm_proto::defaults::*;
use dlm_proto::node::NodeId;

use crate::bridge::configfs::ConfigfsBridge;
use crate::bridge::{plock_dev, KernelBridge, MemoryBridge};
use crate::config::DaemonConfig;
use crate::daemon::{Daemon, DaemonEvent};
use crate::fence::CommandAgent;
use crate::group::local::LocalBus;
use crate::group::GroupDriver;
use crate::logging::DumpBuffer;

/// DLM cluster control daemon
#[derive(Parser, Debug)]
#[command(name = "dlm_controld", version, about = "DLM cluster control daemon")]
struct Args {
    /// Local node id as assigned by the cluster manager
    #[arg(long)]
    our_nodeid: NodeId,

    /// Cluster name
    #[arg(long)]
    cluster_name: String,

    /// Control socket bind address
    #[arg(long, default_value = DEFAULT_CONTROL_ADDR)]
    control_addr: IpAddr,

    /// Control socket port
    #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
    control_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Group communication driver: "local" (single host)
    #[arg(long, default_value = "local")]
    group_driver: String,

    /// Kernel interface: "configfs" or "memory" (no kernel DLM)
    #[arg(long, default_value = "configfs")]
    kernel: String,

    /// Seconds to wait before fencing nodes never seen as members
    #[arg(long, default_value_t = DEFAULT_POST_JOIN_DELAY_SECS)]
    post_join_delay: u64,

    #[arg(long, default_value_t = DEFAULT_ENABLE_FENCING, action = ArgAction::Set)]
    enable_fencing: bool,

    #[arg(long, default_value_t = DEFAULT_ENABLE_STARTUP_FENCING, action = ArgAction::Set)]
    enable_startup_fencing: bool,

    #[arg(long, default_value_t = DEFAULT_ENABLE_CONCURRENT_FENCING, action = ArgAction::Set)]
    enable_concurrent_fencing: bool,

    #[arg(long, default_value_t = DEFAULT_ENABLE_QUORUM_FENCING, action = ArgAction::Set)]
    enable_quorum_fencing: bool,

    /// Fence agent program
    #[arg(long, default_value = DEFAULT_FENCE_ALL_AGENT)]
    fence_agent: String,

    /// First fence retry delay (ms)
    #[arg(long, default_value_t = DEFAULT_FENCE_RETRY_BASE_MS)]
    fence_retry_base_ms: u64,

    /// Longest fence retry delay (ms)
    #[arg(long, default_value_t = DEFAULT_FENCE_RETRY_MAX_MS)]
    fence_retry_max_ms: u64,

    /// Block recovery after a failed fence instead of retrying
    #[arg(long)]
    fence_fatal: bool,

    #[arg(long, default_value_t = DEFAULT_ENABLE_PLOCK, action = ArgAction::Set)]
    enable_plock: bool,

    /// Log every plock operation
    #[arg(long)]
    plock_debug: bool,

    /// Local plock operations per second (0 = unlimited)
    #[arg(long, default_value_t = DEFAULT_PLOCK_RATE_LIMIT)]
    plock_rate_limit: u32,

    #[arg(long, default_value_t = DEFAULT_PLOCK_OWNERSHIP, action = ArgAction::Set)]
    plock_ownership: bool,

    /// Interval between resource pruning passes (ms)
    #[arg(long, default_value_t = DEFAULT_DROP_RESOURCES_TIME_MS)]
    drop_resources_time: u64,

    /// Resources dropped per pruning pass
    #[arg(long, default_value_t = DEFAULT_DROP_RESOURCES_COUNT)]
    drop_resources_count: usize,

    /// Idle time before a resource may be dropped (ms)
    #[arg(long, default_value_t = DEFAULT_DROP_RESOURCES_AGE_MS)]
    drop_resources_age: u64,

    #[arg(long, default_value = DEFAULT_CONFIGFS_ROOT)]
    configfs_root: PathBuf,

    #[arg(long, default_value = DEFAULT_SYSFS_ROOT)]
    sysfs_root: PathBuf,

    /// Kernel plock device
    #[arg(long)]
    plock_device: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> DaemonConfig {
        let mut cfg = DaemonConfig::new(self.our_nodeid, &self.cluster_name);
        cfg.control_addr = SocketAddr::new(self.control_addr, self.control_port);
        cfg.post_join_delay = Duration::from_secs(self.post_join_delay);
        cfg.enable_fencing = self.enable_fencing;
        cfg.enable_startup_fencing = self.enable_startup_fencing;
        cfg.enable_concurrent_fencing = self.enable_concurrent_fencing;
        cfg.enable_quorum_fencing = self.enable_quorum_fencing;
        cfg.fence_agent = self.fence_agent.clone();
        cfg.fence_retry_base = Duration::from_millis(self.fence_retry_base_ms);
        cfg.fence_retry_max = Duration::from_millis(self.fence_retry_max_ms);
        cfg.fence_fatal = self.fence_fatal;
        cfg.enable_plock = self.enable_plock;
        cfg.plock_debug = self.plock_debug;
        cfg.plock_rate_limit = self.plock_rate_limit;
        cfg.plock_ownership = self.plock_ownership;
        cfg.drop_resources_time = Duration::from_millis(self.drop_resources_time);
        cfg.drop_resources_count = self.drop_resources_count;
        cfg.drop_resources_age = Duration::from_millis(self.drop_resources_age);
        cfg.configfs_root = self.configfs_root.clone();
        cfg.sysfs_root = self.sysfs_root.clone();
        cfg.plock_device = self.plock_device.clone();
        cfg
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let dump = DumpBuffer::new(DEFAULT_LOG_DUMP_LINES);
    logging::init(&args.log_level, dump.clone());

    info!("dlm_controld v{} starting", env!("CARGO_PKG_VERSION"));

    let config = args.config();
    if config.validate().is_err() {
        std::process::exit(1);
    }

    let (event_tx, event_rx) = mpsc::channel(DEFAULT_EVENT_CHANNEL_SIZE);
    let (bridge_tx, bridge_rx) = mpsc::channel(DEFAULT_BRIDGE_CHANNEL_SIZE);

    // ---------------------------------------------------------------
    // Kernel interface
    // ---------------------------------------------------------------
    let plock_writer = match &config.plock_device {
        Some(path) => match plock_dev::open(path).await {
            Ok((reader, writer)) => {
                plock_dev::spawn_reader(reader, event_tx.clone());
                Some(writer)
            }
            Err(_) => std::process::exit(1),
        },
        None => None,
    };

    let kernel: Arc<dyn KernelBridge> = match args.kernel.as_str() {
        "memory" => {
            info!("using in-memory kernel bridge");
            Arc::new(MemoryBridge::new())
        }
        _ => {
            if !config.configfs_root.exists() {
                error!(
                    "dlm configfs {} not found, is the dlm module loaded?",
                    config.configfs_root.display()
                );
                std::process::exit(1);
            }
            Arc::new(ConfigfsBridge::new(
                config.configfs_root.clone(),
                config.sysfs_root.clone(),
                plock_writer,
            ))
        }
    };
    bridge::spawn_worker(kernel, bridge_rx, event_tx.clone());

    // ---------------------------------------------------------------
    // Group communication
    // ---------------------------------------------------------------
    if args.group_driver != "local" {
        error!("unknown group driver '{}'", args.group_driver);
        std::process::exit(1);
    }
    let bus = LocalBus::new();
    let driver = Arc::new(bus.endpoint(config.our_nodeid));
    let pump_driver = driver.clone();
    let pump_tx = event_tx.clone();
    tokio::spawn(async move {
        loop {
            let event = match pump_driver.recv_event().await {
                Ok(ev) => ev,
                Err(e) => {
                    info!("group event pump ending: {}", e);
                    break;
                }
            };
            if pump_tx.send(DaemonEvent::Group(event)).await.is_err() {
                break;
            }
        }
    });

    // ---------------------------------------------------------------
    // Control socket, ticker, signals
    // ---------------------------------------------------------------
    let listener = match admin::listen(config.control_addr).await {
        Ok(l) => l,
        Err(_) => std::process::exit(1),
    };
    tokio::spawn(admin::accept_loop(listener, event_tx.clone()));

    let tick_tx = event_tx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(DEFAULT_TICK_MS));
        loop {
            interval.tick().await;
            if tick_tx.send(DaemonEvent::Tick).await.is_err() {
                break;
            }
        }
    });

    let signal_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("SIGINT received, shutting down");
            let _ = signal_tx.send(DaemonEvent::Shutdown).await;
        }
    });

    let agent = Arc::new(CommandAgent::new(&config.fence_agent));
    let group: Arc<dyn GroupDriver> = driver;
    let daemon = Daemon::new(config, group, bridge_tx, event_tx, agent, dump);
    if let Err(e) = daemon.run(event_rx).await {
        error!("daemon failed: {}", e);
        std::process::exit(1);
    }
}
