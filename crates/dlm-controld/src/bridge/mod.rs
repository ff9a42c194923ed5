//! Kernel/recovery bridge.
//!
//! The kernel DLM learns about lockspace membership and recovery
//! progress only through this interface. Protocol code queues
//! [`BridgeRequest`]s; a worker task applies them, in order, through a
//! [`KernelBridge`] backend and reports each outcome back to the event
//! loop so that slow kernel I/O never stalls message processing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use dlm_proto::constants::DEFAULT_NODE_WEIGHT;
use dlm_proto::error::{DlmError, DlmResult};
use dlm_proto::message::{LockImage, PlockInfo, ResourceImage};
use dlm_proto::node::NodeId;

use crate::daemon::DaemonEvent;

pub mod configfs;
pub mod plock_dev;

/// Result of a plock operation, returned to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlockReply {
    pub info: PlockInfo,
    /// 0 on success, a negative errno, or 1 when a get found a conflict.
    pub rv: i32,
    /// Conflicting lock reported by a get.
    pub conflict: Option<LockImage>,
}

/// Work for the kernel bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeRequest {
    /// Publish lockspace membership. An empty member list removes the
    /// lockspace from the kernel.
    Membership {
        ls: String,
        global_id: u32,
        members: Vec<NodeId>,
        /// Members that left and rejoined and must be re-added.
        renew: Vec<NodeId>,
    },
    /// Install plock state received from another node.
    PlockState {
        ls: String,
        resources: Vec<ResourceImage>,
    },
    Started {
        ls: String,
        change_seq: u32,
    },
    Stopped {
        ls: String,
    },
    PlockResult {
        ls: String,
        reply: PlockReply,
    },
}

impl BridgeRequest {
    pub fn lockspace(&self) -> &str {
        match self {
            BridgeRequest::Membership { ls, .. }
            | BridgeRequest::PlockState { ls, .. }
            | BridgeRequest::Started { ls, .. }
            | BridgeRequest::Stopped { ls }
            | BridgeRequest::PlockResult { ls, .. } => ls,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BridgeRequest::Membership { .. } => "membership",
            BridgeRequest::PlockState { .. } => "plock_state",
            BridgeRequest::Started { .. } => "start",
            BridgeRequest::Stopped { .. } => "stop",
            BridgeRequest::PlockResult { .. } => "plock_result",
        }
    }
}

/// Trait that all kernel interface backends must implement.
#[async_trait]
pub trait KernelBridge: Send + Sync {
    /// Human-readable name of this backend.
    fn name(&self) -> &str;

    async fn apply_membership(
        &self,
        ls: &str,
        global_id: u32,
        members: &[NodeId],
        renew: &[NodeId],
    ) -> DlmResult<()>;

    async fn apply_plock_state(&self, ls: &str, resources: &[ResourceImage]) -> DlmResult<()>;

    /// Let the kernel resume lock operations after recovery.
    async fn notify_started(&self, ls: &str, change_seq: u32) -> DlmResult<()>;

    /// Suspend kernel lock operations pending recovery.
    async fn notify_stopped(&self, ls: &str) -> DlmResult<()>;

    async fn plock_result(&self, ls: &str, reply: &PlockReply) -> DlmResult<()>;

    /// Vote weight of a node in lockspace directory placement.
    fn get_weight(&self, nodeid: NodeId) -> u32;

    /// Whether the kernel's cluster configuration knows `nodeid`.
    fn is_cluster_member(&self, nodeid: NodeId) -> bool;
}

async fn apply(bridge: &dyn KernelBridge, req: &BridgeRequest) -> DlmResult<()> {
    match req {
        BridgeRequest::Membership {
            ls,
            global_id,
            members,
            renew,
        } => bridge.apply_membership(ls, *global_id, members, renew).await,
        BridgeRequest::PlockState { ls, resources } => {
            bridge.apply_plock_state(ls, resources).await
        }
        BridgeRequest::Started { ls, change_seq } => bridge.notify_started(ls, *change_seq).await,
        BridgeRequest::Stopped { ls } => bridge.notify_stopped(ls).await,
        BridgeRequest::PlockResult { ls, reply } => bridge.plock_result(ls, reply).await,
    }
}

/// Spawn the worker that applies bridge requests in queue order.
pub fn spawn_worker(
    bridge: Arc<dyn KernelBridge>,
    mut rx: mpsc::Receiver<BridgeRequest>,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            let result = apply(bridge.as_ref(), &req).await;
            if let Err(e) = result {
                error!(
                    "kernel bridge {} {} for {} failed: {}",
                    bridge.name(),
                    req.name(),
                    req.lockspace(),
                    e
                );
            }
            let done = DaemonEvent::BridgeDone {
                ls: req.lockspace().to_string(),
                op: req.name(),
                result,
            };
            if event_tx.send(done).await.is_err() {
                break;
            }
        }
        debug!("kernel bridge worker exiting");
    })
}

/// What an in-memory kernel knows about one lockspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryLockspace {
    pub global_id: u32,
    pub members: Vec<NodeId>,
    pub running: bool,
    pub last_start: u32,
    pub renewals: Vec<NodeId>,
    pub plock_resources: usize,
    pub replies: Vec<PlockReply>,
}

/// Kernel bridge that keeps the kernel's view in memory.
///
/// Used when running without the kernel DLM, and by tests that inspect
/// what would have reached the kernel.
#[derive(Clone, Default)]
pub struct MemoryBridge {
    state: Arc<Mutex<BTreeMap<String, MemoryLockspace>>>,
}

impl MemoryBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lockspace(&self, ls: &str) -> Option<MemoryLockspace> {
        self.state.lock().ok().and_then(|s| s.get(ls).cloned())
    }

    fn with<R>(&self, ls: &str, f: impl FnOnce(&mut MemoryLockspace) -> R) -> DlmResult<R> {
        let mut state = self.state.lock().map_err(|_| DlmError::Bridge)?;
        Ok(f(state.entry(ls.to_string()).or_default()))
    }
}

#[async_trait]
impl KernelBridge for MemoryBridge {
    fn name(&self) -> &str {
        "memory"
    }

    async fn apply_membership(
        &self,
        ls: &str,
        global_id: u32,
        members: &[NodeId],
        renew: &[NodeId],
    ) -> DlmResult<()> {
        if members.is_empty() {
            let mut state = self.state.lock().map_err(|_| DlmError::Bridge)?;
            state.remove(ls);
            return Ok(());
        }
        self.with(ls, |k| {
            k.global_id = global_id;
            k.members = members.to_vec();
            k.renewals.extend_from_slice(renew);
        })
    }

    async fn apply_plock_state(&self, ls: &str, resources: &[ResourceImage]) -> DlmResult<()> {
        self.with(ls, |k| k.plock_resources = resources.len())
    }

    async fn notify_started(&self, ls: &str, change_seq: u32) -> DlmResult<()> {
        self.with(ls, |k| {
            k.running = true;
            k.last_start = change_seq;
        })
    }

    async fn notify_stopped(&self, ls: &str) -> DlmResult<()> {
        self.with(ls, |k| k.running = false)
    }

    async fn plock_result(&self, ls: &str, reply: &PlockReply) -> DlmResult<()> {
        self.with(ls, |k| k.replies.push(*reply))
    }

    fn get_weight(&self, _nodeid: NodeId) -> u32 {
        DEFAULT_NODE_WEIGHT
    }

    fn is_cluster_member(&self, _nodeid: NodeId) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_applies_in_order_and_reports() {
        let bridge = MemoryBridge::new();
        let (req_tx, req_rx) = mpsc::channel(8);
        let (ev_tx, mut ev_rx) = mpsc::channel(8);
        let worker = spawn_worker(Arc::new(bridge.clone()), req_rx, ev_tx);

        req_tx
            .send(BridgeRequest::Membership {
                ls: "a".into(),
                global_id: 9,
                members: vec![1, 2],
                renew: vec![],
            })
            .await
            .unwrap();
        req_tx
            .send(BridgeRequest::Started {
                ls: "a".into(),
                change_seq: 3,
            })
            .await
            .unwrap();

        for op in ["membership", "start"] {
            match ev_rx.recv().await.unwrap() {
                DaemonEvent::BridgeDone { ls, op: got, result } => {
                    assert_eq!(ls, "a");
                    assert_eq!(got, op);
                    assert!(result.is_ok());
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        let k = bridge.lockspace("a").unwrap();
        assert_eq!(k.members, vec![1, 2]);
        assert!(k.running);
        assert_eq!(k.last_start, 3);

        drop(req_tx);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_membership_removes_lockspace() {
        let bridge = MemoryBridge::new();
        bridge.apply_membership("a", 9, &[1], &[]).await.unwrap();
        assert!(bridge.lockspace("a").is_some());
        bridge.apply_membership("a", 9, &[], &[]).await.unwrap();
        assert!(bridge.lockspace("a").is_none());
    }
}
