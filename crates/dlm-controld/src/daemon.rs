//! Daemon state and the event loop.
//!
//! All protocol state is owned by [`Daemon`] and mutated only from
//! [`Daemon::run`]. Everything that can block (group I/O, the kernel
//! bridge, fence agents, admin clients) runs in other tasks and talks to
//! the loop through [`DaemonEvent`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use dlm_proto::admin::{AdminRequest, AdminResponse, DaemonStatus};
use dlm_proto::constants::{DAEMON_GLOBAL_ID, DAEMON_GROUP_NAME};
use dlm_proto::error::{DlmError, DlmResult};
use dlm_proto::header::{frame, parse, DlmHeader, MsgType};
use dlm_proto::message::{FenceClearInfo, Message, PlockInfo};
use dlm_proto::node::NodeId;

use crate::bridge::{BridgeRequest, PlockReply};
use crate::clock::Clock;
use crate::config::{check_lockspace_name, DaemonConfig};
use crate::fence::{FenceAgent, FenceConfig, FenceCoordinator};
use crate::group::{ConfigChange, GroupDriver, GroupEvent};
use crate::lockspace::{lockspace_global_id, ConfchgOutcome, Lockspace, LsCtx};
use crate::logging::DumpBuffer;
use crate::outbox::{group_lockspace, GroupRequest, Outbox};
use crate::protocol::ProtocolState;

const EINVAL: i32 = 22;

/// Everything the event loop reacts to.
#[derive(Debug)]
pub enum DaemonEvent {
    Group(GroupEvent),
    Admin {
        req: AdminRequest,
        reply: oneshot::Sender<AdminResponse>,
    },
    /// A plock request read from the kernel. `reply` is false for
    /// requests the kernel does not wait on.
    LocalPlock {
        global_id: u32,
        info: PlockInfo,
        reply: bool,
    },
    FenceDone {
        nodeid: NodeId,
        result: i32,
    },
    BridgeDone {
        ls: String,
        op: &'static str,
        result: DlmResult<()>,
    },
    Tick,
    Shutdown,
}

pub struct Daemon {
    config: DaemonConfig,
    clock: Clock,
    fence: FenceCoordinator,
    protocol: ProtocolState,
    lockspaces: BTreeMap<String, Lockspace>,
    by_global: BTreeMap<u32, String>,
    out: Outbox,
    group: Arc<dyn GroupDriver>,
    bridge_tx: mpsc::Sender<BridgeRequest>,
    event_tx: mpsc::Sender<DaemonEvent>,
    agent: Arc<dyn FenceAgent>,
    dump: DumpBuffer,
    agents_running: BTreeSet<NodeId>,
    daemon_members: Vec<NodeId>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        group: Arc<dyn GroupDriver>,
        bridge_tx: mpsc::Sender<BridgeRequest>,
        event_tx: mpsc::Sender<DaemonEvent>,
        agent: Arc<dyn FenceAgent>,
        dump: DumpBuffer,
    ) -> Self {
        let fence = FenceCoordinator::new(config.our_nodeid, FenceConfig::from(&config));
        Self {
            config,
            clock: Clock::new(),
            fence,
            protocol: ProtocolState::default(),
            lockspaces: BTreeMap::new(),
            by_global: BTreeMap::new(),
            out: Outbox::new(),
            group,
            bridge_tx,
            event_tx,
            agent,
            dump,
            agents_running: BTreeSet::new(),
            daemon_members: Vec::new(),
        }
    }

    /// Join the daemon group and process events until shutdown.
    pub async fn run(mut self, mut rx: mpsc::Receiver<DaemonEvent>) -> DlmResult<()> {
        self.group.join(DAEMON_GROUP_NAME).await?;
        info!(
            "daemon running: node {} cluster {} group driver {}",
            self.config.our_nodeid,
            self.config.cluster_name,
            self.group.name()
        );

        while let Some(event) = rx.recv().await {
            if !self.handle_event(event) {
                break;
            }
            self.flush().await;
        }

        self.shutdown().await;
        Ok(())
    }

    /// Apply one event. Returns false when the loop should stop.
    pub fn handle_event(&mut self, event: DaemonEvent) -> bool {
        match event {
            DaemonEvent::Group(GroupEvent::ConfigChange(cc)) => self.handle_confchg(cc),
            DaemonEvent::Group(GroupEvent::Message {
                group,
                sender,
                data,
            }) => self.handle_message(&group, sender, &data),
            DaemonEvent::Admin { req, reply } => {
                let resp = self.handle_admin(req);
                if reply.send(resp).is_err() {
                    debug!("admin client went away");
                }
            }
            DaemonEvent::LocalPlock {
                global_id,
                info,
                reply,
            } => self.handle_local_plock(global_id, info, reply),
            DaemonEvent::FenceDone { nodeid, result } => self.handle_fence_done(nodeid, result),
            DaemonEvent::BridgeDone { ls, op, result } => {
                if let Err(e) = result {
                    if let Some(l) = self.lockspaces.get_mut(&ls) {
                        l.bridge_failed(op, e);
                    }
                }
            }
            DaemonEvent::Tick => self.tick(),
            DaemonEvent::Shutdown => {
                info!("shutdown requested");
                return false;
            }
        }
        self.run_fencing();
        true
    }

    fn handle_confchg(&mut self, cc: ConfigChange) {
        let now = self.clock.now();

        if cc.group == DAEMON_GROUP_NAME {
            info!(
                "daemon group ring {} members {:?} joined {:?} left {:?}",
                cc.ring_id, cc.members, cc.joined, cc.left
            );
            self.fence.cluster_change(&cc.members, &cc.joined, &cc.left, now);
            self.daemon_members = cc.members.clone();
            if self.protocol.confchg(&cc.members, &cc.joined) && cc.members.contains(&self.config.our_nodeid) {
                let hd = DlmHeader::new(MsgType::Protocol, self.config.our_nodeid, DAEMON_GLOBAL_ID);
                self.out
                    .send(DAEMON_GROUP_NAME, hd, Message::Protocol(self.protocol.ours()));
            }
            self.poll_lockspaces();
            return;
        }

        let Some(name) = group_lockspace(&cc.group).map(str::to_string) else {
            warn!("confchg for unknown group {}", cc.group);
            return;
        };
        let Some(ls) = self.lockspaces.get_mut(&name) else {
            debug!("confchg for lockspace {} we are not in", name);
            return;
        };
        let mut ctx = LsCtx {
            fence: &mut self.fence,
            now,
            out: &mut self.out,
        };
        if ls.confchg(&cc, &mut ctx) == ConfchgOutcome::Left {
            let global_id = ls.global_id();
            self.lockspaces.remove(&name);
            self.by_global.remove(&global_id);
            self.out.bridge(BridgeRequest::Membership {
                ls: name.clone(),
                global_id,
                members: Vec::new(),
                renew: Vec::new(),
            });
            info!("{} removed", name);
        }
    }

    fn handle_message(&mut self, group: &str, sender: NodeId, data: &[u8]) {
        let our = self.config.our_nodeid;
        let (hd, payload) = match parse(data) {
            Ok(v) => v,
            Err(e) => {
                warn!("drop message from {} on {}: {}", sender, group, e);
                return;
            }
        };
        if let Err(e) = hd.validate(sender, our, |gid| self.by_global.contains_key(&gid)) {
            debug!("drop {} from {}: {}", hd.msg_type.name(), sender, e);
            return;
        }
        let msg = match Message::decode(hd.msg_type, payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("drop {} from {}: {}", hd.msg_type.name(), sender, e);
                return;
            }
        };
        let now = self.clock.now();

        if group == DAEMON_GROUP_NAME {
            match msg {
                Message::Protocol(info) => self.protocol.receive(sender, info),
                Message::FenceResult(info) => {
                    self.fence.receive_fence_result(sender, &info, now);
                    self.poll_lockspaces();
                }
                Message::FenceClear(clear) => {
                    self.fence.receive_fence_clear(sender, clear.nodeid, now);
                    self.poll_lockspaces();
                }
                other => warn!("unexpected {} on daemon group", other.msg_type().name()),
            }
            return;
        }

        let Some(name) = group_lockspace(group) else {
            warn!("message for unknown group {}", group);
            return;
        };
        if !self.protocol.is_compatible(sender) {
            debug!("{} drop {} from incompatible node {}", name, hd.msg_type.name(), sender);
            return;
        }
        let Some(ls) = self.lockspaces.get_mut(name) else {
            return;
        };
        if hd.global_id != ls.global_id() {
            warn!("{} drop {} with global id {:x}", name, hd.msg_type.name(), hd.global_id);
            return;
        }

        let mut ctx = LsCtx {
            fence: &mut self.fence,
            now,
            out: &mut self.out,
        };
        let result = match msg {
            Message::Start(info) => ls.receive_start(sender, &hd, info, &mut ctx),
            other if hd.msg_type.is_plock() => ls.receive_plock_message(sender, &hd, other, &mut ctx),
            _ => {
                warn!("{} unexpected {} on lockspace group", name, hd.msg_type.name());
                Ok(())
            }
        };
        if let Err(e) = result {
            if e.is_protocol_local() {
                debug!("{} dropped {} from {}: {}", name, hd.msg_type.name(), sender, e);
            } else {
                error!("{} {} from {} failed: {}", name, hd.msg_type.name(), sender, e);
            }
        }
    }

    fn handle_local_plock(&mut self, global_id: u32, info: PlockInfo, reply: bool) {
        let Some(name) = self.by_global.get(&global_id).cloned() else {
            warn!("plock for unknown lockspace {:x}", global_id);
            if reply {
                self.out.bridge(BridgeRequest::PlockResult {
                    ls: format!("{:x}", global_id),
                    reply: PlockReply {
                        info,
                        rv: -EINVAL,
                        conflict: None,
                    },
                });
            }
            return;
        };
        let now = self.clock.now();
        if let Some(ls) = self.lockspaces.get_mut(&name) {
            let mut ctx = LsCtx {
                fence: &mut self.fence,
                now,
                out: &mut self.out,
            };
            ls.local_plock(info, reply, &mut ctx);
        }
    }

    fn handle_fence_done(&mut self, nodeid: NodeId, result: i32) {
        self.agents_running.remove(&nodeid);
        let now = self.clock.now();
        if let Some(info) = self.fence.agent_done(nodeid, result, now) {
            let hd = DlmHeader::new(MsgType::FenceResult, self.config.our_nodeid, DAEMON_GLOBAL_ID)
                .with_data(nodeid, 0);
            self.out.send(DAEMON_GROUP_NAME, hd, Message::FenceResult(info));
        }
    }

    /// Start agents for fence jobs this node is responsible for.
    fn run_fencing(&mut self) {
        let now = self.clock.now();
        for job in self.fence.take_runnable(now) {
            if !self.agents_running.insert(job.nodeid) {
                continue;
            }
            let agent = self.agent.clone();
            let tx = self.event_tx.clone();
            tokio::spawn(async move {
                let result = match agent.fence(job.nodeid, job.fail_walltime).await {
                    Ok(code) => code,
                    Err(e) => {
                        error!("fence agent {} node {}: {}", agent.name(), job.nodeid, e);
                        -1
                    }
                };
                let done = DaemonEvent::FenceDone {
                    nodeid: job.nodeid,
                    result,
                };
                if tx.send(done).await.is_err() {
                    debug!("event loop gone before fence result");
                }
            });
        }
    }

    fn poll_lockspaces(&mut self) {
        let now = self.clock.now();
        for ls in self.lockspaces.values_mut() {
            let mut ctx = LsCtx {
                fence: &mut self.fence,
                now,
                out: &mut self.out,
            };
            ls.apply_changes(&mut ctx);
        }
    }

    fn tick(&mut self) {
        let now = self.clock.now();
        for ls in self.lockspaces.values_mut() {
            let mut ctx = LsCtx {
                fence: &mut self.fence,
                now,
                out: &mut self.out,
            };
            ls.tick(&mut ctx);
        }
    }

    fn join_lockspace(&mut self, name: &str) -> DlmResult<()> {
        check_lockspace_name(name)?;
        if self.lockspaces.contains_key(name) {
            return Err(DlmError::LockspaceExists);
        }
        let global_id = lockspace_global_id(name);
        if let Some(other) = self.by_global.get(&global_id) {
            error!("{} global id {:x} collides with {}", name, global_id, other);
            return Err(DlmError::LockspaceExists);
        }

        let ls = Lockspace::new(name, &self.config);
        info!("{} join, global id {:x}", name, global_id);
        self.out.groups.push(GroupRequest::Join(ls.group().to_string()));
        self.by_global.insert(global_id, name.to_string());
        self.lockspaces.insert(name.to_string(), ls);
        Ok(())
    }

    fn leave_lockspace(&mut self, name: &str) -> DlmResult<()> {
        let now = self.clock.now();
        let ls = self.lockspaces.get_mut(name).ok_or(DlmError::NoLockspace)?;
        let mut ctx = LsCtx {
            fence: &mut self.fence,
            now,
            out: &mut self.out,
        };
        ls.leave(&mut ctx)
    }

    fn with_lockspace<T>(&self, name: &str, f: impl FnOnce(&Lockspace) -> T) -> DlmResult<T> {
        self.lockspaces.get(name).map(f).ok_or(DlmError::NoLockspace)
    }

    pub fn handle_admin(&mut self, req: AdminRequest) -> AdminResponse {
        let result = match req {
            AdminRequest::DaemonStatus => Ok(AdminResponse::DaemonStatus(DaemonStatus {
                our_nodeid: self.config.our_nodeid,
                cluster_name: self.config.cluster_name.clone(),
                cluster_members: self.daemon_members.clone(),
                daemon_run_version: self.protocol.run().daemon,
                plock_run_version: self.protocol.run().plock,
                fence_actor: self.fence.fence_actor(),
                fence_failed: self.fence.has_failure(),
                fencing: self.fence.summaries(),
            })),
            AdminRequest::ListLockspaces => Ok(AdminResponse::Lockspaces(
                self.lockspaces.values().map(Lockspace::summary).collect(),
            )),
            AdminRequest::LockspaceInfo { name } => self
                .with_lockspace(&name, Lockspace::summary)
                .map(AdminResponse::Lockspace),
            AdminRequest::LockspaceNodes { name } => self
                .with_lockspace(&name, Lockspace::nodes)
                .map(AdminResponse::Nodes),
            AdminRequest::PlockDump { name } => self
                .with_lockspace(&name, Lockspace::plock_snapshot)
                .map(AdminResponse::Plocks),
            AdminRequest::Dump => Ok(AdminResponse::Dump(self.dump.lines())),
            AdminRequest::Join { name } => self.join_lockspace(&name).map(|_| AdminResponse::Ok),
            AdminRequest::Leave { name } => self.leave_lockspace(&name).map(|_| AdminResponse::Ok),
            AdminRequest::FenceAck { nodeid } => {
                warn!("operator fence ack for node {}", nodeid);
                let hd = DlmHeader::new(MsgType::FenceClear, self.config.our_nodeid, DAEMON_GLOBAL_ID)
                    .with_data(nodeid, 0);
                self.out
                    .send(DAEMON_GROUP_NAME, hd, Message::FenceClear(FenceClearInfo { nodeid }));
                Ok(AdminResponse::Ok)
            }
        };
        result.unwrap_or_else(AdminResponse::Error)
    }

    /// Hand queued output to the group driver and the bridge worker.
    async fn flush(&mut self) {
        for m in self.out.take_messages() {
            let payload = match m.msg.encode() {
                Ok(p) => p,
                Err(e) => {
                    error!("encode {} failed: {}", m.header.msg_type.name(), e);
                    continue;
                }
            };
            let buf = frame(&m.header, &payload);
            if let Err(e) = self.group.multicast(&m.group, &buf).await {
                error!("multicast {} on {} failed: {}", m.header.msg_type.name(), m.group, e);
            }
        }

        for req in std::mem::take(&mut self.out.bridge) {
            if self.bridge_tx.send(req).await.is_err() {
                error!("kernel bridge worker is gone");
            }
        }

        for req in std::mem::take(&mut self.out.groups) {
            let result = match &req {
                GroupRequest::Join(g) => self.group.join(g).await,
                GroupRequest::Leave(g) => self.group.leave(g).await,
            };
            if let Err(e) = result {
                error!("group request {:?} failed: {}", req, e);
            }
        }
    }

    async fn shutdown(&mut self) {
        let names: Vec<String> = self.lockspaces.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.leave_lockspace(&name) {
                debug!("{} leave on shutdown: {}", name, e);
            }
        }
        self.flush().await;
        if let Err(e) = self.group.leave(DAEMON_GROUP_NAME).await {
            warn!("leave daemon group failed: {}", e);
        }
        info!("daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{spawn_worker, MemoryBridge};
    use crate::group::local::LocalBus;
    use async_trait::async_trait;
    use dlm_proto::message::PlockOp;
    use dlm_proto::node::{LeaveReason, LockspaceState};
    use std::time::Duration;

    struct OkAgent;

    #[async_trait]
    impl FenceAgent for OkAgent {
        fn name(&self) -> &str {
            "ok"
        }

        async fn fence(&self, _nodeid: NodeId, _fail_walltime: u64) -> DlmResult<i32> {
            Ok(0)
        }
    }

    struct TestNode {
        tx: mpsc::Sender<DaemonEvent>,
        kernel: MemoryBridge,
    }

    fn start_node(bus: &LocalBus, nodeid: NodeId) -> TestNode {
        let mut config = DaemonConfig::new(nodeid, "test");
        config.post_join_delay = Duration::ZERO;
        config.enable_quorum_fencing = false;

        let driver = Arc::new(bus.endpoint(nodeid));
        let kernel = MemoryBridge::new();
        let (event_tx, event_rx) = mpsc::channel(256);
        let (bridge_tx, bridge_rx) = mpsc::channel(256);
        spawn_worker(Arc::new(kernel.clone()), bridge_rx, event_tx.clone());

        let group: Arc<dyn GroupDriver> = driver.clone();
        let pump_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Ok(ev) = driver.recv_event().await {
                if pump_tx.send(DaemonEvent::Group(ev)).await.is_err() {
                    break;
                }
            }
        });

        let daemon = Daemon::new(
            config,
            group,
            bridge_tx,
            event_tx.clone(),
            Arc::new(OkAgent),
            DumpBuffer::new(16),
        );
        tokio::spawn(daemon.run(event_rx));
        TestNode {
            tx: event_tx,
            kernel,
        }
    }

    async fn admin(node: &TestNode, req: AdminRequest) -> AdminResponse {
        let (reply, rx) = oneshot::channel();
        node.tx.send(DaemonEvent::Admin { req, reply }).await.unwrap();
        rx.await.unwrap()
    }

    async fn wait_state(node: &TestNode, name: &str, members: &[NodeId]) {
        for _ in 0..200 {
            if let AdminResponse::Lockspace(s) =
                admin(node, AdminRequest::LockspaceInfo { name: name.into() }).await
            {
                if s.state == LockspaceState::Started && s.members == members {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("lockspace {} never reached members {:?}", name, members);
    }

    #[tokio::test]
    async fn test_join_reaches_kernel() {
        let bus = LocalBus::new();
        let a = start_node(&bus, 1);
        let b = start_node(&bus, 2);

        assert!(matches!(
            admin(&a, AdminRequest::Join { name: "gfs0".into() }).await,
            AdminResponse::Ok
        ));
        assert!(matches!(
            admin(&a, AdminRequest::Join { name: "gfs0".into() }).await,
            AdminResponse::Error(DlmError::LockspaceExists)
        ));
        admin(&b, AdminRequest::Join { name: "gfs0".into() }).await;

        wait_state(&a, "gfs0", &[1, 2]).await;
        wait_state(&b, "gfs0", &[1, 2]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let k = a.kernel.lockspace("gfs0").unwrap();
        assert_eq!(k.members, vec![1, 2]);
        assert!(k.running);
        assert_eq!(k.global_id, lockspace_global_id("gfs0"));
    }

    #[tokio::test]
    async fn test_failed_node_fenced_then_recovered() {
        let bus = LocalBus::new();
        let a = start_node(&bus, 1);
        let b = start_node(&bus, 2);
        let c = start_node(&bus, 3);
        for n in [&a, &b, &c] {
            admin(n, AdminRequest::Join { name: "gfs0".into() }).await;
        }
        wait_state(&a, "gfs0", &[1, 2, 3]).await;

        bus.fail_node(3, LeaveReason::NodeDown).unwrap();

        wait_state(&a, "gfs0", &[1, 2]).await;
        wait_state(&b, "gfs0", &[1, 2]).await;
        match admin(&a, AdminRequest::DaemonStatus).await {
            AdminResponse::DaemonStatus(s) => {
                assert_eq!(s.fence_actor, Some(1));
                assert!(s.fencing.iter().any(|f| f.nodeid == 3 && f.state == "fenced"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_leave_removes_lockspace() {
        let bus = LocalBus::new();
        let a = start_node(&bus, 1);
        admin(&a, AdminRequest::Join { name: "gfs0".into() }).await;
        wait_state(&a, "gfs0", &[1]).await;

        assert!(matches!(
            admin(&a, AdminRequest::Leave { name: "gfs0".into() }).await,
            AdminResponse::Ok
        ));
        for _ in 0..200 {
            if let AdminResponse::Lockspaces(l) = admin(&a, AdminRequest::ListLockspaces).await {
                if l.is_empty() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    assert!(a.kernel.lockspace("gfs0").is_none());
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("lockspace not removed");
    }

    async fn wait_removed(node: &TestNode) {
        for _ in 0..200 {
            if let AdminResponse::Lockspaces(l) = admin(node, AdminRequest::ListLockspaces).await {
                if l.is_empty() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("lockspace not removed");
    }

    fn unlock(nodeid: NodeId) -> PlockInfo {
        PlockInfo {
            op: PlockOp::Unlock,
            number: 0x10,
            start: 0,
            end: u64::MAX,
            ex: false,
            wait: false,
            nodeid,
            owner: 0xab,
            pid: 400,
            fsid: 3,
        }
    }

    #[tokio::test]
    async fn test_close_unlock_does_not_outlive_lockspace() {
        let bus = LocalBus::new();
        let a = start_node(&bus, 1);
        let global_id = lockspace_global_id("gfs0");
        admin(&a, AdminRequest::Join { name: "gfs0".into() }).await;
        wait_state(&a, "gfs0", &[1]).await;

        // close unlock, then leave before it can be delivered back
        a.tx.send(DaemonEvent::LocalPlock { global_id, info: unlock(1), reply: false })
            .await
            .unwrap();
        admin(&a, AdminRequest::Leave { name: "gfs0".into() }).await;
        wait_removed(&a).await;

        admin(&a, AdminRequest::Join { name: "gfs0".into() }).await;
        wait_state(&a, "gfs0", &[1]).await;
        a.tx.send(DaemonEvent::LocalPlock { global_id, info: unlock(1), reply: true })
            .await
            .unwrap();

        for _ in 0..200 {
            let replies = a.kernel.lockspace("gfs0").map(|k| k.replies).unwrap_or_default();
            if let Some(r) = replies.first() {
                assert_eq!(r.info, unlock(1));
                assert_eq!(r.rv, 0);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("explicit unlock never answered");
    }

    #[tokio::test]
    async fn test_unknown_lockspace_queries() {
        let bus = LocalBus::new();
        let a = start_node(&bus, 1);
        assert!(matches!(
            admin(&a, AdminRequest::LockspaceInfo { name: "nope".into() }).await,
            AdminResponse::Error(DlmError::NoLockspace)
        ));
        assert!(matches!(
            admin(&a, AdminRequest::Join { name: String::new() }).await,
            AdminResponse::Error(DlmError::InvalidParms)
        ));
    }
}
