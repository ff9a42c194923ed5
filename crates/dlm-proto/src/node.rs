/// Node, ring and lockspace state types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster node identifier as assigned by the cluster manager.
pub type NodeId = u32;

/// Identifier of a group-communication membership configuration.
///
/// Ordered by sequence first; the representative node id only breaks
/// ties between rings formed concurrently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RingId {
    pub nodeid: NodeId,
    pub seq: u64,
}

impl RingId {
    pub fn new(nodeid: NodeId, seq: u64) -> Self {
        Self { nodeid, seq }
    }
}

impl PartialOrd for RingId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RingId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq
            .cmp(&other.seq)
            .then(self.nodeid.cmp(&other.nodeid))
    }
}

impl fmt::Display for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.nodeid, self.seq)
    }
}

/// Why a node left a group, as reported by group communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaveReason {
    /// Clean leave requested by the node itself.
    Leave,
    /// The node's cluster membership was lost.
    NodeDown,
    /// The node came back before its failure was processed.
    NodeUp,
    /// The daemon process on the node died.
    ProcDown,
}

impl LeaveReason {
    /// A departure that requires the node to be fenced before recovery.
    pub fn is_failure(self) -> bool {
        !matches!(self, LeaveReason::Leave)
    }
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeaveReason::Leave => "leave",
            LeaveReason::NodeDown => "nodedown",
            LeaveReason::NodeUp => "nodeup",
            LeaveReason::ProcDown => "procdown",
        };
        f.write_str(s)
    }
}

/// Recovery state of a lockspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockspaceState {
    /// Created, no configuration change seen yet.
    Idle,
    /// A configuration change has been recorded.
    ChangeOpen,
    /// Waiting for failed members to be fenced.
    AwaitingFence,
    /// Start sent, waiting for every member's start.
    AwaitingAcks,
    /// The current change has completed.
    Started,
    /// Local leave in progress.
    Leaving,
}

impl fmt::Display for LockspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockspaceState::Idle => "idle",
            LockspaceState::ChangeOpen => "change_open",
            LockspaceState::AwaitingFence => "wait_fencing",
            LockspaceState::AwaitingAcks => "wait_messages",
            LockspaceState::Started => "started",
            LockspaceState::Leaving => "leaving",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_id_ordering() {
        let a = RingId::new(3, 10);
        let b = RingId::new(1, 11);
        let c = RingId::new(1, 10);
        assert!(a < b);
        assert!(c < a);
        assert_eq!(a.to_string(), "3:10");
    }

    #[test]
    fn test_leave_reason_failure() {
        assert!(!LeaveReason::Leave.is_failure());
        assert!(LeaveReason::NodeDown.is_failure());
        assert!(LeaveReason::ProcDown.is_failure());
    }
}
