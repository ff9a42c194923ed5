//! Administrative request and response types.
//!
//! `dlm_tool` sends an [`AdminRequest`] over the daemon's control socket
//! and reads back an [`AdminResponse`]. Snapshots are read-only copies
//! of daemon state; producing them never affects the protocol.

use serde::{Deserialize, Serialize};

use crate::error::DlmError;
use crate::message::{LockImage, PlockInfo};
use crate::node::{LeaveReason, LockspaceState, NodeId, RingId};

/// Requests accepted on the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdminRequest {
    /// Daemon-wide status: cluster members, protocol, fencing.
    DaemonStatus,
    /// Summaries of every lockspace.
    ListLockspaces,
    /// Summary of one lockspace.
    LockspaceInfo { name: String },
    /// Per-node history of one lockspace.
    LockspaceNodes { name: String },
    /// Recent daemon log lines.
    Dump,
    /// Plock resources of one lockspace.
    PlockDump { name: String },
    /// Join a lockspace locally.
    Join { name: String },
    /// Leave a lockspace locally.
    Leave { name: String },
    /// Exempt a failed node from the current fence wait.
    FenceAck { nodeid: NodeId },
}

/// Response to an [`AdminRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdminResponse {
    Ok,
    Error(DlmError),
    DaemonStatus(DaemonStatus),
    Lockspaces(Vec<LockspaceSummary>),
    Lockspace(LockspaceSummary),
    Nodes(Vec<NodeSummary>),
    Dump(Vec<String>),
    Plocks(Vec<PlockResourceSummary>),
}

/// Daemon-wide status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub our_nodeid: NodeId,
    pub cluster_name: String,
    pub cluster_members: Vec<NodeId>,
    pub daemon_run_version: [u16; 3],
    pub plock_run_version: [u16; 3],
    pub fence_actor: Option<NodeId>,
    /// A fence attempt failed and fatal mode is blocking recovery.
    pub fence_failed: bool,
    pub fencing: Vec<FenceSummary>,
}

/// Fence state of one failed node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FenceSummary {
    pub nodeid: NodeId,
    pub fail_walltime: u64,
    /// "pending", "in-progress", "fenced", "failed", "cleared".
    pub state: String,
    pub attempts: u32,
    pub last_fenced_walltime: u64,
}

/// Lockspace status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockspaceSummary {
    pub name: String,
    pub global_id: u32,
    pub state: LockspaceState,
    pub ring_id: RingId,
    pub epoch: u32,
    pub started_count: u32,
    pub change_seq: u32,
    pub change_queue_depth: usize,
    pub members: Vec<NodeId>,
    pub pending_acks: Vec<NodeId>,
    pub pending_fences: Vec<NodeId>,
    pub joining: bool,
    pub leaving: bool,
    pub kernel_stopped: bool,
    pub saved_messages: usize,
    pub plock_resources: usize,
    pub need_plocks: bool,
    /// Why recovery is currently stuck, if it is.
    pub recovery_error: Option<DlmError>,
}

/// Per-node history entry of a lockspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub nodeid: NodeId,
    pub member: bool,
    pub add_walltime: u64,
    pub remove_walltime: u64,
    pub fail_reason: Option<LeaveReason>,
    pub check_fencing: bool,
    /// Daemon-relative milliseconds of the fence that covered the node's
    /// last failure, 0 if none.
    pub fenced_monotime: u64,
    pub last_start_seq: u32,
}

/// Plock resource snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlockResourceSummary {
    pub number: u64,
    pub owner: NodeId,
    pub locks: Vec<LockImage>,
    pub waiters: Vec<PlockInfo>,
}
