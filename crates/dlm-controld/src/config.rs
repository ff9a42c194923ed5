//! Daemon configuration.
//!
//! Built once at startup from command-line flags (see `main.rs`) and
//! passed by value into the daemon state. Defaults live in
//! [`dlm_proto::defaults`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use dlm_proto::constants::DLM_LOCKSPACE_LEN;
use dlm_proto::defaults::*;
use dlm_proto::error::{DlmError, DlmResult};
use dlm_proto::node::NodeId;
use tracing::error;

/// Runtime options of the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub our_nodeid: NodeId,
    pub cluster_name: String,

    /// Control socket for `dlm_tool`.
    pub control_addr: SocketAddr,

    /// Grace period before fencing nodes never seen as cluster members.
    pub post_join_delay: Duration,

    pub enable_fencing: bool,
    pub enable_startup_fencing: bool,
    pub enable_concurrent_fencing: bool,
    pub enable_quorum_fencing: bool,
    pub fence_agent: String,
    pub fence_retry_base: Duration,
    pub fence_retry_max: Duration,
    /// Stop retrying after the first failed fence attempt.
    pub fence_fatal: bool,

    pub enable_plock: bool,
    pub plock_debug: bool,
    /// Local plock operations per second, 0 for unlimited.
    pub plock_rate_limit: u32,
    pub plock_ownership: bool,
    pub drop_resources_time: Duration,
    pub drop_resources_count: usize,
    pub drop_resources_age: Duration,

    pub configfs_root: PathBuf,
    pub sysfs_root: PathBuf,
    /// Kernel plock device; plocks from the kernel are not read when unset.
    pub plock_device: Option<PathBuf>,
}

impl DaemonConfig {
    /// Configuration with every tunable at its default.
    pub fn new(our_nodeid: NodeId, cluster_name: &str) -> Self {
        let control_addr = SocketAddr::new(
            DEFAULT_CONTROL_ADDR
                .parse()
                .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
            DEFAULT_CONTROL_PORT,
        );

        Self {
            our_nodeid,
            cluster_name: cluster_name.to_string(),
            control_addr,
            post_join_delay: Duration::from_secs(DEFAULT_POST_JOIN_DELAY_SECS),
            enable_fencing: DEFAULT_ENABLE_FENCING,
            enable_startup_fencing: DEFAULT_ENABLE_STARTUP_FENCING,
            enable_concurrent_fencing: DEFAULT_ENABLE_CONCURRENT_FENCING,
            enable_quorum_fencing: DEFAULT_ENABLE_QUORUM_FENCING,
            fence_agent: DEFAULT_FENCE_ALL_AGENT.to_string(),
            fence_retry_base: Duration::from_millis(DEFAULT_FENCE_RETRY_BASE_MS),
            fence_retry_max: Duration::from_millis(DEFAULT_FENCE_RETRY_MAX_MS),
            fence_fatal: false,
            enable_plock: DEFAULT_ENABLE_PLOCK,
            plock_debug: DEFAULT_PLOCK_DEBUG,
            plock_rate_limit: DEFAULT_PLOCK_RATE_LIMIT,
            plock_ownership: DEFAULT_PLOCK_OWNERSHIP,
            drop_resources_time: Duration::from_millis(DEFAULT_DROP_RESOURCES_TIME_MS),
            drop_resources_count: DEFAULT_DROP_RESOURCES_COUNT,
            drop_resources_age: Duration::from_millis(DEFAULT_DROP_RESOURCES_AGE_MS),
            configfs_root: PathBuf::from(DEFAULT_CONFIGFS_ROOT),
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            plock_device: None,
        }
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> DlmResult<()> {
        if self.our_nodeid == 0 {
            error!("no local node id configured");
            return Err(DlmError::InvalidParms);
        }
        if self.cluster_name.is_empty() {
            error!("no cluster name");
            return Err(DlmError::InvalidParms);
        }
        if self.cluster_name.len() > DLM_LOCKSPACE_LEN {
            error!("cluster name too long: {}", self.cluster_name);
            return Err(DlmError::InvalidParms);
        }
        if self.fence_retry_base > self.fence_retry_max {
            error!("fence retry base exceeds fence retry max");
            return Err(DlmError::InvalidParms);
        }
        Ok(())
    }
}

/// Validate a lockspace name supplied by a client.
pub fn check_lockspace_name(name: &str) -> DlmResult<()> {
    if name.is_empty() || name.len() > DLM_LOCKSPACE_LEN {
        return Err(DlmError::InvalidParms);
    }
    if name.contains('/') || name.starts_with('.') {
        return Err(DlmError::InvalidParms);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let cfg = DaemonConfig::new(1, "alpha");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.control_addr.port(), DEFAULT_CONTROL_PORT);
        assert!(cfg.enable_fencing);
        assert!(!cfg.plock_ownership);
    }

    #[test]
    fn test_missing_identity_is_fatal() {
        assert_eq!(
            DaemonConfig::new(0, "alpha").validate(),
            Err(DlmError::InvalidParms)
        );
        assert_eq!(
            DaemonConfig::new(1, "").validate(),
            Err(DlmError::InvalidParms)
        );
    }

    #[test]
    fn test_lockspace_names() {
        assert!(check_lockspace_name("gfs0").is_ok());
        assert!(check_lockspace_name("").is_err());
        assert!(check_lockspace_name("../etc").is_err());
        assert!(check_lockspace_name(&"x".repeat(DLM_LOCKSPACE_LEN + 1)).is_err());
    }
}
