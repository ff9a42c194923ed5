//! Membership change tracking of one lockspace.
//!
//! Every configuration change of the lockspace group opens a change. The
//! change waits until its failed members are fenced, then each member
//! multicasts a start message describing its view. When every member of
//! the agreed view has sent a start for that view, the change completes:
//! the kernel is given the new membership and restarted, departed nodes'
//! plocks are purged, and plock state is transferred to members that
//! lack it.
//!
//! Views are reconciled deterministically. The agreed view is the one
//! carried by the start of the lowest-numbered sender that lists itself;
//! a node whose view differs adopts it, re-checks fencing, and resends
//! its start with the NACK flag. Since every node sees the same ordered
//! stream of starts, every node completes at the same point.
//!
//! A configuration change that arrives while a change is active replaces
//! it; departures recorded since the last completed change carry over.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use tracing::{debug, error, info, warn};

use dlm_proto::admin::{LockspaceSummary, NodeSummary, PlockResourceSummary};
use dlm_proto::error::{DlmError, DlmResult};
use dlm_proto::header::{DlmHeader, MsgFlags, MsgType};
use dlm_proto::message::{Message, PlockInfo, StartInfo};
use dlm_proto::node::{LeaveReason, LockspaceState, NodeId, RingId};

use crate::bridge::{BridgeRequest, PlockReply};
use crate::clock::Now;
use crate::config::DaemonConfig;
use crate::fence::{FenceCoordinator, FenceHandle, FenceStatus};
use crate::group::ConfigChange;
use crate::outbox::{lockspace_group, GroupRequest, Outbox};
use crate::plock::{PlockCtx, PlockEngine, PlockOptions};

const EIO: i32 = 5;

/// Everything a lockspace handler may touch outside the lockspace.
pub struct LsCtx<'a> {
    pub fence: &'a mut FenceCoordinator,
    pub now: Now,
    pub out: &'a mut Outbox,
}

/// Global id of a lockspace, shared with the kernel and carried in every
/// lockspace message.
pub fn lockspace_global_id(name: &str) -> u32 {
    match crc32fast::hash(name.as_bytes()) {
        0 => 1,
        id => id,
    }
}

/// What happened to the lockspace on a configuration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfchgOutcome {
    Continue,
    /// We are no longer in the group; the lockspace should be removed.
    Left,
}

#[derive(Debug, Clone, Default)]
pub struct NodeHistory {
    pub member: bool,
    pub add_walltime: u64,
    pub add_monotime: u64,
    pub remove_walltime: u64,
    pub fail_walltime: u64,
    pub fail_monotime: u64,
    pub fail_reason: Option<LeaveReason>,
    pub check_fencing: bool,
    pub fenced_monotime: u64,
    pub last_start_seq: u32,
}

#[derive(Debug, Clone)]
struct ReceivedStart {
    info: StartInfo,
    flags: MsgFlags,
    seq: u32,
}

impl ReceivedStart {
    fn view(&self) -> BTreeSet<NodeId> {
        self.info.members.iter().copied().collect()
    }
}

#[derive(Debug)]
struct Change {
    seq: u32,
    ring_id: RingId,
    members: BTreeSet<NodeId>,
    joined: BTreeSet<NodeId>,
    removed: BTreeSet<NodeId>,
    failed: BTreeSet<NodeId>,
    renewed: BTreeSet<NodeId>,
    fences: BTreeMap<NodeId, FenceHandle>,
    starts: BTreeMap<NodeId, ReceivedStart>,
    state: LockspaceState,
    start_sent: bool,
    nacks: u32,
    fence_failed: bool,
}

/// A plock message held back until the lockspace can apply it.
#[derive(Debug, Clone)]
struct SavedMessage {
    nodeid: NodeId,
    header: DlmHeader,
    msg: Message,
}

/// Local plock rate limiter: at most `limit` operations per second.
#[derive(Debug)]
struct RateLimiter {
    limit: u32,
    window_start: u64,
    count: u32,
}

impl RateLimiter {
    fn allow(&mut self, now: u64) -> bool {
        if self.limit == 0 {
            return true;
        }
        if now.saturating_sub(self.window_start) >= 1000 {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= self.limit {
            return false;
        }
        self.count += 1;
        true
    }
}

pub struct Lockspace {
    name: String,
    group: String,
    global_id: u32,
    our_nodeid: NodeId,
    ring_id: RingId,
    joining: bool,
    leaving: bool,
    kernel_stopped: bool,
    change_seq: u32,
    epoch: u32,
    started_count: u32,
    started_members: BTreeSet<NodeId>,
    /// Departures since the last completed change.
    pending_left: BTreeMap<NodeId, LeaveReason>,
    change: Option<Change>,
    history: BTreeMap<NodeId, NodeHistory>,
    saved: VecDeque<SavedMessage>,
    plock: PlockEngine,
    enable_plock: bool,
    need_plocks: bool,
    plock_data_node: NodeId,
    plock_data_seq: u32,
    plock_data_chunks: u32,
    pending_local: VecDeque<PlockInfo>,
    /// Local requests the kernel does not wait on (close unlocks).
    silent: HashSet<PlockInfo>,
    rate: RateLimiter,
    drop_interval_ms: u64,
    last_drop: u64,
    recovery_error: Option<DlmError>,
}

impl Lockspace {
    pub fn new(name: &str, config: &DaemonConfig) -> Self {
        let opts = PlockOptions {
            ownership: config.plock_ownership,
            debug: config.plock_debug,
            drop_age_ms: config.drop_resources_age.as_millis() as u64,
            drop_count: config.drop_resources_count,
        };
        Self {
            name: name.to_string(),
            group: lockspace_group(name),
            global_id: lockspace_global_id(name),
            our_nodeid: config.our_nodeid,
            ring_id: RingId::default(),
            joining: true,
            leaving: false,
            kernel_stopped: true,
            change_seq: 0,
            epoch: 0,
            started_count: 0,
            started_members: BTreeSet::new(),
            pending_left: BTreeMap::new(),
            change: None,
            history: BTreeMap::new(),
            saved: VecDeque::new(),
            plock: PlockEngine::new(opts),
            enable_plock: config.enable_plock,
            need_plocks: false,
            plock_data_node: 0,
            plock_data_seq: 0,
            plock_data_chunks: 0,
            pending_local: VecDeque::new(),
            silent: HashSet::new(),
            rate: RateLimiter {
                limit: config.plock_rate_limit,
                window_start: 0,
                count: 0,
            },
            drop_interval_ms: config.drop_resources_time.as_millis() as u64,
            last_drop: 0,
            recovery_error: None,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn global_id(&self) -> u32 {
        self.global_id
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.started_members.iter().copied().collect()
    }

    pub fn state(&self) -> LockspaceState {
        if self.leaving {
            return LockspaceState::Leaving;
        }
        match &self.change {
            Some(c) => c.state,
            None if self.started_count > 0 => LockspaceState::Started,
            None => LockspaceState::Idle,
        }
    }

    pub fn need_plocks(&self) -> bool {
        self.need_plocks
    }

    fn history_mut(&mut self, nodeid: NodeId) -> &mut NodeHistory {
        self.history.entry(nodeid).or_default()
    }

    /// Process a configuration change of the lockspace group.
    pub fn confchg(&mut self, cc: &ConfigChange, ctx: &mut LsCtx<'_>) -> ConfchgOutcome {
        let our = self.our_nodeid;
        if cc.left_reason(our).is_some() {
            info!("{} left group, ring {}", self.name, cc.ring_id);
            return ConfchgOutcome::Left;
        }
        if self.leaving {
            debug!("{} ignoring confchg while leaving", self.name);
            return ConfchgOutcome::Continue;
        }
        if !cc.members.contains(&our) {
            warn!("{} confchg {} without us", self.name, cc.ring_id);
            return ConfchgOutcome::Continue;
        }

        self.ring_id = cc.ring_id;
        let now = ctx.now;

        for &nodeid in &cc.joined {
            let h = self.history_mut(nodeid);
            h.member = true;
            h.add_walltime = now.wall;
            h.add_monotime = now.mono;
        }
        for &(nodeid, reason) in &cc.left {
            let h = self.history_mut(nodeid);
            h.member = false;
            h.remove_walltime = now.wall;
            if reason.is_failure() {
                h.fail_reason = Some(reason);
                h.fail_walltime = now.wall;
                h.fail_monotime = now.mono;
                h.check_fencing = true;
            }
            let prev = self.pending_left.get(&nodeid).copied();
            if !prev.map_or(false, |p| p.is_failure()) {
                self.pending_left.insert(nodeid, reason);
            }
        }

        if !self.kernel_stopped {
            ctx.out.bridge(BridgeRequest::Stopped {
                ls: self.name.clone(),
            });
            self.kernel_stopped = true;
        }

        if let Some(old) = self.change.take() {
            info!(
                "{} change {} superseded by ring {}",
                self.name, old.seq, cc.ring_id
            );
        }

        self.change_seq += 1;
        let members: BTreeSet<NodeId> = cc.members.iter().copied().collect();
        let change = self.build_change(cc.ring_id, members, ctx);
        info!(
            "{} change {} ring {} members {:?} joined {:?} removed {:?} failed {:?}",
            self.name,
            change.seq,
            change.ring_id,
            change.members,
            change.joined,
            change.removed,
            change.failed
        );
        self.change = Some(change);
        self.apply_changes(ctx);
        ConfchgOutcome::Continue
    }

    /// Derive a change against the last completed membership.
    fn build_change(
        &mut self,
        ring_id: RingId,
        members: BTreeSet<NodeId>,
        ctx: &mut LsCtx<'_>,
    ) -> Change {
        let before = &self.started_members;
        let joined: BTreeSet<NodeId> = members.difference(before).copied().collect();
        let removed: BTreeSet<NodeId> = before.difference(&members).copied().collect();
        let renewed: BTreeSet<NodeId> = before
            .intersection(&members)
            .filter(|n| self.pending_left.contains_key(n))
            .copied()
            .collect();
        let failed: BTreeSet<NodeId> = self
            .pending_left
            .iter()
            .filter(|(n, r)| r.is_failure() && (!members.contains(n) || renewed.contains(n)))
            .map(|(&n, _)| n)
            .collect();

        let mut fences = BTreeMap::new();
        for &nodeid in &failed {
            let h = self.history.get(&nodeid).cloned().unwrap_or_default();
            let reason = h.fail_reason.unwrap_or(LeaveReason::NodeDown);
            let handle =
                ctx.fence
                    .request_fence(nodeid, h.fail_walltime, h.fail_monotime, reason, &self.group);
            fences.insert(nodeid, handle);
        }

        Change {
            seq: self.change_seq,
            ring_id,
            members,
            joined,
            removed,
            failed,
            renewed,
            fences,
            starts: BTreeMap::new(),
            state: LockspaceState::ChangeOpen,
            start_sent: false,
            nacks: 0,
            fence_failed: false,
        }
    }

    /// Drive the active change as far as it can go.
    pub fn apply_changes(&mut self, ctx: &mut LsCtx<'_>) {
        loop {
            let Some(mut change) = self.change.take() else {
                return;
            };

            match change.state {
                LockspaceState::ChangeOpen => {
                    change.state = if change.fences.is_empty() {
                        self.send_start(&mut change, ctx);
                        LockspaceState::AwaitingAcks
                    } else {
                        LockspaceState::AwaitingFence
                    };
                    self.change = Some(change);
                }
                LockspaceState::AwaitingFence => {
                    if !self.poll_fencing(&mut change, ctx) {
                        self.change = Some(change);
                        return;
                    }
                    self.send_start(&mut change, ctx);
                    change.state = LockspaceState::AwaitingAcks;
                    self.change = Some(change);
                }
                LockspaceState::AwaitingAcks => {
                    if !start_complete(&change) {
                        self.change = Some(change);
                        return;
                    }
                    self.complete_change(change, ctx);
                }
                _ => {
                    self.change = Some(change);
                    return;
                }
            }
        }
    }

    /// Returns true once every failed member is fenced or exempt.
    fn poll_fencing(&mut self, change: &mut Change, ctx: &mut LsCtx<'_>) -> bool {
        let mut done = Vec::new();
        let mut failed = false;
        for (&nodeid, handle) in &change.fences {
            match ctx.fence.poll_result(handle) {
                FenceStatus::Fenced => done.push(nodeid),
                FenceStatus::Failed => failed = true,
                FenceStatus::Pending => {}
            }
        }
        for nodeid in done {
            change.fences.remove(&nodeid);
            let fenced = ctx.fence.fence_node_time(nodeid).unwrap_or(0);
            let h = self.history_mut(nodeid);
            h.check_fencing = false;
            h.fenced_monotime = fenced;
            info!("{} node {} fenced", self.name, nodeid);
        }

        if failed && !change.fence_failed {
            error!(
                "{} recovery blocked: fencing failed for {:?}",
                self.name,
                change.fences.keys().collect::<Vec<_>>()
            );
            change.fence_failed = true;
            self.recovery_error = Some(DlmError::FenceFailure);
        }
        change.fences.is_empty()
    }

    fn has_plock_state(&self) -> bool {
        self.enable_plock && self.started_count > 0 && !self.need_plocks
    }

    fn send_start(&self, change: &mut Change, ctx: &mut LsCtx<'_>) {
        let mut flags = MsgFlags::empty();
        if self.joining {
            flags.insert(MsgFlags::JOINING);
        }
        if self.has_plock_state() {
            flags.insert(MsgFlags::HAVEPLOCK);
        }
        if change.start_sent {
            flags.insert(MsgFlags::NACK);
        }

        let info = StartInfo {
            ring_id: change.ring_id,
            epoch: self.epoch(),
            started_count: self.started_count,
            members: change.members.iter().copied().collect(),
            joined: change.joined.iter().copied().collect(),
            removed: change.removed.iter().copied().collect(),
            failed: change.failed.iter().copied().collect(),
        };
        let hd = DlmHeader::new(MsgType::Start, self.our_nodeid, self.global_id)
            .with_flags(flags)
            .with_data(change.seq, change.ring_id.seq as u32);

        debug!(
            "{} send start change {} ring {} flags {:#x}",
            self.name,
            change.seq,
            change.ring_id,
            flags.bits()
        );
        ctx.out.send(&self.group, hd, Message::Start(info));
        change.start_sent = true;
    }

    /// Record a start message and advance the change.
    pub fn receive_start(
        &mut self,
        sender: NodeId,
        hd: &DlmHeader,
        info: StartInfo,
        ctx: &mut LsCtx<'_>,
    ) -> DlmResult<()> {
        if self.leaving {
            return Ok(());
        }
        self.history_mut(sender).last_start_seq = hd.msgdata;

        let Some(mut change) = self.change.take() else {
            if info.ring_id < self.ring_id {
                warn!(
                    "{} stale start from {} ring {} current {}",
                    self.name, sender, info.ring_id, self.ring_id
                );
                return Err(DlmError::OrderingViolation);
            }
            debug!("{} start from {} with no change active", self.name, sender);
            return Ok(());
        };

        if info.ring_id < change.ring_id {
            warn!(
                "{} stale start from {} ring {} current {}",
                self.name, sender, info.ring_id, change.ring_id
            );
            self.change = Some(change);
            return Err(DlmError::OrderingViolation);
        }

        debug!(
            "{} receive start from {} change {} ring {} flags {:#x}",
            self.name,
            sender,
            hd.msgdata,
            info.ring_id,
            hd.flags.bits()
        );
        change.starts.insert(
            sender,
            ReceivedStart {
                info,
                flags: hd.flags,
                seq: hd.msgdata,
            },
        );

        self.reconcile_view(&mut change, ctx);
        self.change = Some(change);
        self.apply_changes(ctx);
        Ok(())
    }

    /// Adopt the agreed view when ours differs from it.
    fn reconcile_view(&mut self, change: &mut Change, ctx: &mut LsCtx<'_>) {
        let leader = change
            .starts
            .iter()
            .find(|(n, s)| s.info.members.contains(n))
            .map(|(&n, s)| (n, s.view(), s.info.ring_id, s.info.failed.clone()));
        let Some((leader, view, leader_ring, leader_failed)) = leader else {
            return;
        };
        if view == change.members {
            return;
        }
        if !view.contains(&self.our_nodeid) {
            warn!(
                "{} view of node {} excludes us, waiting for a configuration change",
                self.name, leader
            );
            return;
        }

        info!(
            "{} adopting view of node {}: {:?} (ours {:?})",
            self.name, leader, view, change.members
        );

        let now = ctx.now;
        // Departures we missed take the leader's verdict on whether they failed.
        let dropped: Vec<NodeId> = change.members.difference(&view).copied().collect();
        for nodeid in dropped {
            if self.pending_left.contains_key(&nodeid) {
                continue;
            }
            let reason = if leader_failed.contains(&nodeid) {
                LeaveReason::NodeDown
            } else {
                LeaveReason::Leave
            };
            self.pending_left.insert(nodeid, reason);
            let h = self.history_mut(nodeid);
            h.member = false;
            h.remove_walltime = now.wall;
            if reason.is_failure() {
                h.fail_reason = Some(reason);
                h.fail_walltime = now.wall;
                h.fail_monotime = now.mono;
                h.check_fencing = true;
            }
        }

        let ring = change.ring_id.max(leader_ring);
        self.ring_id = self.ring_id.max(ring);
        let mut rebuilt = self.build_change(ring, view, ctx);
        rebuilt.starts = std::mem::take(&mut change.starts);
        rebuilt.start_sent = change.start_sent;
        rebuilt.nacks = change.nacks + 1;
        *change = rebuilt;
    }

    fn complete_change(&mut self, change: Change, ctx: &mut LsCtx<'_>) {
        let max_epoch = change
            .members
            .iter()
            .filter_map(|m| change.starts.get(m))
            .map(|s| s.info.epoch)
            .max()
            .unwrap_or(0);
        self.epoch = max_epoch + 1;
        self.started_count += 1;
        self.joining = false;
        self.started_members = change.members.clone();
        self.pending_left.clear();
        self.recovery_error = None;
        for &nodeid in &change.failed {
            self.history_mut(nodeid).check_fencing = false;
        }

        info!(
            "{} change {} complete: epoch {} members {:?} nacks {}",
            self.name, change.seq, self.epoch, change.members, change.nacks
        );

        let departed: BTreeSet<NodeId> = change
            .removed
            .iter()
            .chain(change.renewed.iter())
            .chain(change.failed.iter())
            .copied()
            .collect();
        for nodeid in departed {
            self.with_plock(ctx, |plock, pctx| plock.purge_node(nodeid, pctx));
        }

        ctx.out.bridge(BridgeRequest::Membership {
            ls: self.name.clone(),
            global_id: self.global_id,
            members: change.members.iter().copied().collect(),
            renew: change.renewed.iter().copied().collect(),
        });
        ctx.out.bridge(BridgeRequest::Started {
            ls: self.name.clone(),
            change_seq: change.seq,
        });
        self.kernel_stopped = false;

        // Saved messages predate the state snapshot below.
        self.process_saved(ctx);
        self.plan_plock_transfer(&change, ctx);
        self.drain_local(ctx);
    }

    /// Decide who sends plock state and who needs it.
    fn plan_plock_transfer(&mut self, change: &Change, ctx: &mut LsCtx<'_>) {
        if !self.enable_plock {
            return;
        }
        let have: Vec<NodeId> = change
            .members
            .iter()
            .filter(|m| {
                change
                    .starts
                    .get(m)
                    .map_or(false, |s| s.flags.contains(MsgFlags::HAVEPLOCK))
            })
            .copied()
            .collect();
        let needy: Vec<NodeId> = change
            .members
            .iter()
            .filter(|m| !have.contains(m))
            .copied()
            .collect();

        if needy.is_empty() {
            return;
        }
        let Some(&data_node) = have.first() else {
            // Nobody has state yet: everyone starts empty.
            self.need_plocks = false;
            return;
        };
        let data_seq = change.starts.get(&data_node).map_or(0, |s| s.seq);

        if needy.contains(&self.our_nodeid) {
            info!(
                "{} need plocks from node {} seq {}",
                self.name, data_node, data_seq
            );
            self.need_plocks = true;
            self.plock_data_node = data_node;
            self.plock_data_seq = data_seq;
            self.plock_data_chunks = 0;
            self.plock.clear();
            self.saved.clear();
        }

        if data_node == self.our_nodeid {
            let seq = change.seq;
            self.with_plock(ctx, |plock, pctx| plock.send_all_data(seq, pctx));
        }
    }

    fn can_process_plocks(&self) -> bool {
        self.change.is_none() && !self.need_plocks && self.started_count > 0 && !self.leaving
    }

    /// Apply saved plock messages in arrival order.
    fn process_saved(&mut self, ctx: &mut LsCtx<'_>) {
        if !self.can_process_plocks() || self.saved.is_empty() {
            return;
        }
        let count = self.saved.len();
        while let Some(m) = self.saved.pop_front() {
            self.with_plock(ctx, |plock, pctx| plock.receive(m.nodeid, &m.header, &m.msg, pctx));
        }
        info!("{} processed {} saved plock messages", self.name, count);
    }

    /// Handle a delivered plock-class message.
    pub fn receive_plock_message(
        &mut self,
        sender: NodeId,
        hd: &DlmHeader,
        msg: Message,
        ctx: &mut LsCtx<'_>,
    ) -> DlmResult<()> {
        if self.leaving {
            return Ok(());
        }
        if !self.enable_plock {
            debug!("{} plocks disabled, dropping {}", self.name, hd.msg_type.name());
            return Ok(());
        }

        match &msg {
            Message::PlocksData(data) => {
                if !self.is_expected_data(sender, hd) {
                    debug!("{} ignoring plocks data from {}", self.name, sender);
                    return Ok(());
                }
                if self.plock.receive_data(sender, hd, data, ctx.now.mono) {
                    self.plock_data_chunks += 1;
                }
                return Ok(());
            }
            Message::PlocksDone => {
                if !self.is_expected_data(sender, hd) {
                    debug!("{} ignoring plocks done from {}", self.name, sender);
                    return Ok(());
                }
                if hd.msgdata2 != self.plock_data_chunks {
                    warn!(
                        "{} plocks done from {} expects {} chunks, got {}",
                        self.name, sender, hd.msgdata2, self.plock_data_chunks
                    );
                }
                self.need_plocks = false;
                info!(
                    "{} received plock state: {} resources",
                    self.name,
                    self.plock.resource_count()
                );
                ctx.out.bridge(BridgeRequest::PlockState {
                    ls: self.name.clone(),
                    resources: self.plock.images(),
                });
                self.process_saved(ctx);
                self.drain_local(ctx);
                return Ok(());
            }
            _ => {}
        }

        if !self.can_process_plocks() {
            self.saved.push_back(SavedMessage {
                nodeid: sender,
                header: *hd,
                msg,
            });
            return Ok(());
        }

        self.with_plock(ctx, |plock, pctx| plock.receive(sender, hd, &msg, pctx));
        Ok(())
    }

    fn is_expected_data(&self, sender: NodeId, hd: &DlmHeader) -> bool {
        self.need_plocks && sender == self.plock_data_node && hd.msgdata == self.plock_data_seq
    }

    /// A plock request from the local kernel. `reply` is false for
    /// requests the kernel does not wait on.
    pub fn local_plock(&mut self, info: PlockInfo, reply: bool, ctx: &mut LsCtx<'_>) {
        if self.leaving || !self.enable_plock {
            if reply {
                ctx.out.bridge(BridgeRequest::PlockResult {
                    ls: self.name.clone(),
                    reply: PlockReply {
                        info,
                        rv: -EIO,
                        conflict: None,
                    },
                });
            }
            return;
        }
        if !reply {
            self.silent.insert(info);
        }
        self.pending_local.push_back(info);
        self.drain_local(ctx);
    }

    /// Run the plock engine with this lockspace's output, holding back
    /// replies to silent requests.
    fn with_plock<R>(
        &mut self,
        ctx: &mut LsCtx<'_>,
        f: impl FnOnce(&mut PlockEngine, &mut PlockCtx<'_>) -> R,
    ) -> R {
        let mark = ctx.out.bridge.len();
        let result = {
            let mut pctx = PlockCtx {
                ls: &self.name,
                global_id: self.global_id,
                our_nodeid: self.our_nodeid,
                now: ctx.now.mono,
                out: ctx.out,
            };
            f(&mut self.plock, &mut pctx)
        };
        if !self.silent.is_empty() {
            let silent = &mut self.silent;
            let queued = ctx.out.bridge.split_off(mark);
            ctx.out.bridge.extend(queued.into_iter().filter(|req| match req {
                BridgeRequest::PlockResult { reply, .. } => !silent.remove(&reply.info),
                _ => true,
            }));
        }
        result
    }

    fn drain_local(&mut self, ctx: &mut LsCtx<'_>) {
        if !self.can_process_plocks() {
            return;
        }
        while !self.pending_local.is_empty() {
            if !self.rate.allow(ctx.now.mono) {
                debug!(
                    "{} plock rate limit, {} deferred",
                    self.name,
                    self.pending_local.len()
                );
                return;
            }
            let Some(info) = self.pending_local.pop_front() else {
                return;
            };
            self.with_plock(ctx, |plock, pctx| plock.local_request(info, pctx));
        }
    }

    /// Periodic work: fence polling, deferred plocks, resource dropping.
    pub fn tick(&mut self, ctx: &mut LsCtx<'_>) {
        self.apply_changes(ctx);
        self.drain_local(ctx);

        if self.can_process_plocks()
            && ctx.now.mono.saturating_sub(self.last_drop) >= self.drop_interval_ms
        {
            self.last_drop = ctx.now.mono;
            self.with_plock(ctx, |plock, pctx| plock.drop_resources(pctx));
        }
    }

    /// Begin a local leave.
    pub fn leave(&mut self, ctx: &mut LsCtx<'_>) -> DlmResult<()> {
        if self.leaving {
            return Err(DlmError::Busy);
        }
        info!("{} leave", self.name);
        self.leaving = true;
        ctx.fence.cancel_scope(&self.group);
        self.change = None;
        self.saved.clear();

        for info in self.pending_local.drain(..) {
            if self.silent.remove(&info) {
                continue;
            }
            ctx.out.bridge(BridgeRequest::PlockResult {
                ls: self.name.clone(),
                reply: PlockReply {
                    info,
                    rv: -EIO,
                    conflict: None,
                },
            });
        }
        self.silent.clear();
        if !self.kernel_stopped {
            ctx.out.bridge(BridgeRequest::Stopped {
                ls: self.name.clone(),
            });
            self.kernel_stopped = true;
        }
        ctx.out.groups.push(GroupRequest::Leave(self.group.clone()));
        Ok(())
    }

    /// Note a kernel bridge failure; cleared by the next completed change.
    pub fn bridge_failed(&mut self, op: &str, err: DlmError) {
        warn!("{} kernel {} failed: {}", self.name, op, err);
        self.recovery_error = Some(DlmError::Bridge);
    }

    pub fn summary(&self) -> LockspaceSummary {
        let (pending_acks, pending_fences, change_seq) = match &self.change {
            Some(c) => (
                c.members
                    .iter()
                    .filter(|m| {
                        c.starts
                            .get(m)
                            .map_or(true, |s| s.view() != c.members)
                    })
                    .copied()
                    .collect(),
                c.fences.keys().copied().collect(),
                c.seq,
            ),
            None => (Vec::new(), Vec::new(), self.change_seq),
        };

        LockspaceSummary {
            name: self.name.clone(),
            global_id: self.global_id,
            state: self.state(),
            ring_id: self.ring_id,
            epoch: self.epoch(),
            started_count: self.started_count,
            change_seq,
            change_queue_depth: usize::from(self.change.is_some()),
            members: self.members(),
            pending_acks,
            pending_fences,
            joining: self.joining,
            leaving: self.leaving,
            kernel_stopped: self.kernel_stopped,
            saved_messages: self.saved.len(),
            plock_resources: self.plock.resource_count(),
            need_plocks: self.need_plocks(),
            recovery_error: self.recovery_error,
        }
    }

    pub fn nodes(&self) -> Vec<NodeSummary> {
        self.history
            .iter()
            .map(|(&nodeid, h)| NodeSummary {
                nodeid,
                member: h.member,
                add_walltime: h.add_walltime,
                remove_walltime: h.remove_walltime,
                fail_reason: h.fail_reason,
                check_fencing: h.check_fencing,
                fenced_monotime: h.fenced_monotime,
                last_start_seq: h.last_start_seq,
            })
            .collect()
    }

    pub fn plock_snapshot(&self) -> Vec<PlockResourceSummary> {
        self.plock.snapshot()
    }
}

/// Every member of the change's view has sent a start with that view.
fn start_complete(change: &Change) -> bool {
    change.members.iter().all(|m| {
        change
            .starts
            .get(m)
            .map_or(false, |s| s.view() == change.members)
    })
}
