//! Group communication drivers.
//!
//! The daemon runs on top of a virtually synchronous group service: every
//! group member sees the same sequence of configuration changes and, in
//! between them, the same totally ordered stream of messages. The daemon
//! joins one daemon-wide group plus one group per lockspace.
//!
//! Only the in-process `local` driver is provided here; production
//! deployments plug a cluster-manager binding in behind [`GroupDriver`].

use async_trait::async_trait;
use dlm_proto::error::DlmResult;
use dlm_proto::node::{LeaveReason, NodeId, RingId};

/// A membership configuration change on one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub group: String,
    pub ring_id: RingId,
    /// Members after the change, sorted.
    pub members: Vec<NodeId>,
    pub left: Vec<(NodeId, LeaveReason)>,
    pub joined: Vec<NodeId>,
}

impl ConfigChange {
    pub fn left_reason(&self, nodeid: NodeId) -> Option<LeaveReason> {
        self.left
            .iter()
            .find(|(n, _)| *n == nodeid)
            .map(|(_, r)| *r)
    }
}

/// Events delivered from the group driver to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    ConfigChange(ConfigChange),
    /// A message multicast by `sender`, delivered in group order.
    Message {
        group: String,
        sender: NodeId,
        data: Vec<u8>,
    },
}

/// Trait that all group communication backends must implement.
#[async_trait]
pub trait GroupDriver: Send + Sync {
    /// Human-readable name of this driver.
    fn name(&self) -> &str;

    /// Join a group. Completion is reported by a configuration change
    /// that lists us as joined.
    async fn join(&self, group: &str) -> DlmResult<()>;

    /// Leave a group. Completion is reported by a configuration change
    /// that lists us as having left.
    async fn leave(&self, group: &str) -> DlmResult<()>;

    /// Multicast to all members of a group, ourselves included.
    async fn multicast(&self, group: &str, data: &[u8]) -> DlmResult<()>;

    /// Receive the next event. Blocks (async) until one is available.
    async fn recv_event(&self) -> DlmResult<GroupEvent>;
}

pub mod local;
