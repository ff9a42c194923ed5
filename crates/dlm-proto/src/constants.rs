/// DLM protocol and system constants.

/// Maximum lockspace name length (mirrors the kernel's DLM_LOCKSPACE_LEN).
pub const DLM_LOCKSPACE_LEN: usize = 64;

/// Size of the fixed inter-node message header in bytes.
pub const DLM_HEADER_SIZE: usize = 40;

/// Name of the daemon-wide group every dlm_controld joins.
pub const DAEMON_GROUP_NAME: &str = "dlm:controld";

/// Prefix of every lockspace group name.
pub const LOCKSPACE_GROUP_PREFIX: &str = "dlm:ls:";

/// Daemon protocol version we run (major, minor, patch).
pub const DAEMON_PROTO_VER: [u16; 3] = [3, 1, 1];

/// Plock protocol version we run (major, minor, patch).
pub const PLOCK_PROTO_VER: [u16; 3] = [1, 2, 0];

/// Global id reserved for daemon-group messages (protocol, fencing).
pub const DAEMON_GLOBAL_ID: u32 = 0;

/// Header flag: accompanies start, sender is joining.
pub const DLM_MFLG_JOINING: u32 = 1;
/// Header flag: accompanies start, sender has plock state.
pub const DLM_MFLG_HAVEPLOCK: u32 = 2;
/// Header flag: accompanies start, sender supersedes its earlier start.
pub const DLM_MFLG_NACK: u32 = 4;

/// Fence result code for a successful fence.
pub const FENCE_RESULT_OK: i32 = 0;

/// Number of resources packed into a single plocks-data message.
pub const PLOCK_DATA_CHUNK_RESOURCES: usize = 64;

/// Kernel sysfs control values.
pub const SYSFS_CONTROL_STOP: i32 = 0;
pub const SYSFS_CONTROL_START: i32 = 1;

/// Default vote weight for a lockspace member.
pub const DEFAULT_NODE_WEIGHT: u32 = 1;
