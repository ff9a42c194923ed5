//! Tunable operational defaults for dlm_controld.
//!
//! Protocol-level constants (wire format, versions, flags) remain in
//! [`crate::constants`]. This module centralizes the configurable
//! defaults that can be overridden via CLI flags.

// ─── Network / Port Defaults ────────────────────────────────────────────────

/// Default control-socket port for administrative clients (localhost only).
pub const DEFAULT_CONTROL_PORT: u16 = 21066;

/// Default control-socket bind address.
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1";

/// Maximum size of a single administrative message (bytes). 16 MB.
pub const DEFAULT_MAX_ADMIN_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

// ─── Cluster / Recovery ─────────────────────────────────────────────────────

/// Seconds to wait after joining before fencing nodes that never joined.
pub const DEFAULT_POST_JOIN_DELAY_SECS: u64 = 30;

// ─── Fencing ────────────────────────────────────────────────────────────────

pub const DEFAULT_ENABLE_FENCING: bool = true;
pub const DEFAULT_ENABLE_STARTUP_FENCING: bool = true;
pub const DEFAULT_ENABLE_CONCURRENT_FENCING: bool = false;
pub const DEFAULT_ENABLE_QUORUM_FENCING: bool = true;

/// Agent run by the fence actor for a failed node.
pub const DEFAULT_FENCE_ALL_AGENT: &str = "dlm_stonith";

/// First retry delay after a failed fence attempt (milliseconds).
pub const DEFAULT_FENCE_RETRY_BASE_MS: u64 = 1000;

/// Upper bound on the fence retry delay (milliseconds).
pub const DEFAULT_FENCE_RETRY_MAX_MS: u64 = 60_000;

// ─── Plocks ─────────────────────────────────────────────────────────────────

pub const DEFAULT_ENABLE_PLOCK: bool = true;
pub const DEFAULT_PLOCK_DEBUG: bool = false;

/// Local plock operations applied per second (0 = unlimited).
pub const DEFAULT_PLOCK_RATE_LIMIT: u32 = 0;

pub const DEFAULT_PLOCK_OWNERSHIP: bool = false;

/// Interval between resource pruning passes (milliseconds).
pub const DEFAULT_DROP_RESOURCES_TIME_MS: u64 = 10_000;

/// Maximum resources dropped per pruning pass.
pub const DEFAULT_DROP_RESOURCES_COUNT: usize = 10;

/// Minimum idle age before an unused resource is dropped (milliseconds).
pub const DEFAULT_DROP_RESOURCES_AGE_MS: u64 = 10_000;

// ─── Kernel Interface ───────────────────────────────────────────────────────

pub const DEFAULT_CONFIGFS_ROOT: &str = "/sys/kernel/config/dlm/cluster";
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/kernel/dlm";

// ─── Event Loop ─────────────────────────────────────────────────────────────

/// Channel buffer size for the daemon event queue.
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 1024;

/// Channel buffer size for queued kernel bridge directives.
pub const DEFAULT_BRIDGE_CHANNEL_SIZE: usize = 256;

/// Event loop housekeeping tick (milliseconds).
pub const DEFAULT_TICK_MS: u64 = 1000;

/// Number of log lines retained for `dlm_tool dump`.
pub const DEFAULT_LOG_DUMP_LINES: usize = 4096;
