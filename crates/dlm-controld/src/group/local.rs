//! In-process group communication.
//!
//! A [`LocalBus`] stands in for the cluster's group service: it keeps the
//! membership of every group and fans configuration changes and messages
//! out to the endpoints of all member nodes. Every delivery happens while
//! the bus lock is held, so all endpoints observe one total order.
//!
//! Used for single-host runs and for multi-node tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info};

use dlm_proto::error::{DlmError, DlmResult};
use dlm_proto::node::{LeaveReason, NodeId, RingId};

use super::{ConfigChange, GroupDriver, GroupEvent};

struct BusState {
    /// Group name -> sorted member list.
    groups: BTreeMap<String, Vec<NodeId>>,
    endpoints: BTreeMap<NodeId, mpsc::UnboundedSender<GroupEvent>>,
    ring_seq: u64,
}

impl BusState {
    fn deliver(&mut self, to: NodeId, event: GroupEvent) {
        if let Some(tx) = self.endpoints.get(&to) {
            if tx.send(event).is_err() {
                debug!("local bus: endpoint {} gone", to);
                self.endpoints.remove(&to);
            }
        }
    }

    fn next_ring(&mut self, members: &[NodeId]) -> RingId {
        self.ring_seq += 1;
        RingId::new(members.first().copied().unwrap_or(0), self.ring_seq)
    }

    fn confchg(
        &mut self,
        group: &str,
        joined: Vec<NodeId>,
        left: Vec<(NodeId, LeaveReason)>,
    ) {
        let members = self.groups.get(group).cloned().unwrap_or_default();
        let cc = ConfigChange {
            group: group.to_string(),
            ring_id: self.next_ring(&members),
            members: members.clone(),
            left: left.clone(),
            joined,
        };

        for &m in &members {
            self.deliver(m, GroupEvent::ConfigChange(cc.clone()));
        }
        // A node that left sees its own departure.
        for (n, _) in left {
            if !members.contains(&n) {
                self.deliver(n, GroupEvent::ConfigChange(cc.clone()));
            }
        }
    }
}

/// Shared in-process group service.
#[derive(Clone)]
pub struct LocalBus {
    state: Arc<Mutex<BusState>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                groups: BTreeMap::new(),
                endpoints: BTreeMap::new(),
                ring_seq: 0,
            })),
        }
    }

    fn lock(&self) -> DlmResult<std::sync::MutexGuard<'_, BusState>> {
        self.state.lock().map_err(|_| DlmError::GroupError)
    }

    /// Attach a node to the bus and return its driver.
    pub fn endpoint(&self, nodeid: NodeId) -> LocalDriver {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.lock() {
            state.endpoints.insert(nodeid, tx);
        }
        LocalDriver {
            nodeid,
            bus: self.clone(),
            event_rx: AsyncMutex::new(rx),
        }
    }

    /// Simulate the failure of a node: it is removed from every group
    /// with the given reason and its endpoint is detached.
    #[cfg(test)]
    pub fn fail_node(&self, nodeid: NodeId, reason: LeaveReason) -> DlmResult<()> {
        let mut state = self.lock()?;
        state.endpoints.remove(&nodeid);

        let groups: Vec<String> = state
            .groups
            .iter()
            .filter(|(_, m)| m.contains(&nodeid))
            .map(|(g, _)| g.clone())
            .collect();

        tracing::warn!("local bus: node {} failed ({})", nodeid, reason);
        for group in groups {
            if let Some(members) = state.groups.get_mut(&group) {
                members.retain(|&n| n != nodeid);
            }
            state.confchg(&group, Vec::new(), vec![(nodeid, reason)]);
        }
        Ok(())
    }

    /// Current members of a group.
    #[cfg(test)]
    pub fn members(&self, group: &str) -> Vec<NodeId> {
        self.lock()
            .ok()
            .and_then(|s| s.groups.get(group).cloned())
            .unwrap_or_default()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's view of a [`LocalBus`].
pub struct LocalDriver {
    nodeid: NodeId,
    bus: LocalBus,
    event_rx: AsyncMutex<mpsc::UnboundedReceiver<GroupEvent>>,
}

#[async_trait]
impl GroupDriver for LocalDriver {
    fn name(&self) -> &str {
        "local"
    }

    async fn join(&self, group: &str) -> DlmResult<()> {
        let mut state = self.bus.lock()?;
        let members = state.groups.entry(group.to_string()).or_default();
        if members.contains(&self.nodeid) {
            debug!("local bus: {} already in {}", self.nodeid, group);
            return Ok(());
        }
        members.push(self.nodeid);
        members.sort_unstable();

        info!("local bus: node {} joining {}", self.nodeid, group);
        state.confchg(group, vec![self.nodeid], Vec::new());
        Ok(())
    }

    async fn leave(&self, group: &str) -> DlmResult<()> {
        let mut state = self.bus.lock()?;
        let members = state.groups.get_mut(group).ok_or(DlmError::GroupError)?;
        if !members.contains(&self.nodeid) {
            return Err(DlmError::GroupError);
        }
        members.retain(|&n| n != self.nodeid);
        let empty = members.is_empty();

        info!("local bus: node {} leaving {}", self.nodeid, group);
        state.confchg(group, Vec::new(), vec![(self.nodeid, LeaveReason::Leave)]);
        if empty {
            state.groups.remove(group);
        }
        Ok(())
    }

    async fn multicast(&self, group: &str, data: &[u8]) -> DlmResult<()> {
        let mut state = self.bus.lock()?;
        let members = state.groups.get(group).cloned().ok_or(DlmError::GroupError)?;
        if !members.contains(&self.nodeid) {
            return Err(DlmError::GroupError);
        }
        for m in members {
            state.deliver(
                m,
                GroupEvent::Message {
                    group: group.to_string(),
                    sender: self.nodeid,
                    data: data.to_vec(),
                },
            );
        }
        Ok(())
    }

    async fn recv_event(&self) -> DlmResult<GroupEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await.ok_or(DlmError::GroupError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_cc(d: &LocalDriver) -> ConfigChange {
        match d.recv_event().await.unwrap() {
            GroupEvent::ConfigChange(cc) => cc,
            other => panic!("expected ConfigChange, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_delivers_confchg_to_all() {
        let bus = LocalBus::new();
        let a = bus.endpoint(1);
        let b = bus.endpoint(2);

        a.join("g").await.unwrap();
        let cc = next_cc(&a).await;
        assert_eq!(cc.members, vec![1]);
        assert_eq!(cc.joined, vec![1]);

        b.join("g").await.unwrap();
        let ca = next_cc(&a).await;
        let cb = next_cc(&b).await;
        assert_eq!(ca, cb);
        assert_eq!(ca.members, vec![1, 2]);
        assert_eq!(ca.joined, vec![2]);
        assert!(ca.ring_id > cc.ring_id);
    }

    #[tokio::test]
    async fn test_multicast_total_order() {
        let bus = LocalBus::new();
        let a = bus.endpoint(1);
        let b = bus.endpoint(2);
        a.join("g").await.unwrap();
        b.join("g").await.unwrap();
        next_cc(&a).await;
        next_cc(&a).await;
        next_cc(&b).await;

        a.multicast("g", b"one").await.unwrap();
        b.multicast("g", b"two").await.unwrap();

        for d in [&a, &b] {
            let mut seen = Vec::new();
            for _ in 0..2 {
                match d.recv_event().await.unwrap() {
                    GroupEvent::Message { sender, data, .. } => seen.push((sender, data)),
                    other => panic!("unexpected {:?}", other),
                }
            }
            assert_eq!(seen, vec![(1, b"one".to_vec()), (2, b"two".to_vec())]);
        }
    }

    #[tokio::test]
    async fn test_leave_seen_by_leaver() {
        let bus = LocalBus::new();
        let a = bus.endpoint(1);
        let b = bus.endpoint(2);
        a.join("g").await.unwrap();
        b.join("g").await.unwrap();
        next_cc(&a).await;
        next_cc(&a).await;
        next_cc(&b).await;

        b.leave("g").await.unwrap();
        let ca = next_cc(&a).await;
        let cb = next_cc(&b).await;
        assert_eq!(ca.members, vec![1]);
        assert_eq!(cb.left_reason(2), Some(LeaveReason::Leave));
        assert!(b.multicast("g", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_fail_node() {
        let bus = LocalBus::new();
        let a = bus.endpoint(1);
        let b = bus.endpoint(2);
        a.join("g").await.unwrap();
        b.join("g").await.unwrap();
        next_cc(&a).await;
        next_cc(&a).await;

        bus.fail_node(2, LeaveReason::NodeDown).unwrap();
        let cc = next_cc(&a).await;
        assert_eq!(cc.members, vec![1]);
        assert_eq!(cc.left, vec![(2, LeaveReason::NodeDown)]);
        assert_eq!(bus.members("g"), vec![1]);
    }

    #[tokio::test]
    async fn test_multicast_requires_membership() {
        let bus = LocalBus::new();
        let a = bus.endpoint(1);
        assert_eq!(a.multicast("g", b"x").await, Err(DlmError::GroupError));
        assert_eq!(a.leave("g").await, Err(DlmError::GroupError));
    }
}
