//! Replicated POSIX lock (plock) engine of one lockspace.
//!
//! By default every plock operation is multicast on the lockspace group
//! and applied by every member in delivery order, so all members hold
//! identical lock state. With ownership enabled, a node may claim a
//! resource that nobody else uses and then serve its operations locally;
//! other nodes get the state back (via sync messages) when they ask for
//! the resource.
//!
//! The engine performs no I/O. Messages and kernel replies go to the
//! [`Outbox`] in the [`PlockCtx`].

pub mod resource;

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use dlm_proto::admin::PlockResourceSummary;
use dlm_proto::constants::PLOCK_DATA_CHUNK_RESOURCES;
use dlm_proto::header::DlmHeader;
use dlm_proto::message::{
    LockImage, Message, PlockDrop, PlockInfo, PlockOp, PlockOwn, PlocksData, ResourceImage,
    SyncLock,
};
use dlm_proto::node::NodeId;

use crate::bridge::{BridgeRequest, PlockReply};
use crate::outbox::{lockspace_group, Outbox};

use self::resource::{LockOutcome, Resource};

const EAGAIN: i32 = 11;

/// Per-call context: where the engine's output goes.
pub struct PlockCtx<'a> {
    pub ls: &'a str,
    pub global_id: u32,
    pub our_nodeid: NodeId,
    /// Monotonic milliseconds.
    pub now: u64,
    pub out: &'a mut Outbox,
}

impl PlockCtx<'_> {
    fn send(&mut self, msg: Message, msgdata: u32, msgdata2: u32) {
        let hd = DlmHeader::new(msg.msg_type(), self.our_nodeid, self.global_id)
            .with_data(msgdata, msgdata2);
        let group = lockspace_group(self.ls);
        self.out.send(&group, hd, msg);
    }

    fn reply(&mut self, info: &PlockInfo, rv: i32, conflict: Option<LockImage>) {
        if info.nodeid != self.our_nodeid {
            return;
        }
        self.out.bridge(BridgeRequest::PlockResult {
            ls: self.ls.to_string(),
            reply: PlockReply {
                info: *info,
                rv,
                conflict,
            },
        });
    }
}

/// Engine options.
#[derive(Debug, Clone, Copy)]
pub struct PlockOptions {
    pub ownership: bool,
    pub debug: bool,
    pub drop_age_ms: u64,
    pub drop_count: usize,
}

pub struct PlockEngine {
    opts: PlockOptions,
    resources: BTreeMap<u64, Resource>,
    /// `(sender, seq, chunk)` of bulk-data messages already applied.
    applied_data: BTreeSet<(NodeId, u32, u32)>,
    /// Highest sync sequence applied per sender.
    sync_seq: BTreeMap<NodeId, u32>,
    send_seq: u32,
}

impl PlockEngine {
    pub fn new(opts: PlockOptions) -> Self {
        Self {
            opts,
            resources: BTreeMap::new(),
            applied_data: BTreeSet::new(),
            sync_seq: BTreeMap::new(),
            send_seq: 0,
        }
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    #[cfg(test)]
    pub fn resource(&self, number: u64) -> Option<&Resource> {
        self.resources.get(&number)
    }

    fn next_seq(&mut self) -> u32 {
        self.send_seq = self.send_seq.wrapping_add(1);
        self.send_seq
    }

    fn get_or_create(&mut self, number: u64, now: u64) -> &mut Resource {
        self.resources
            .entry(number)
            .or_insert_with(|| Resource::new(number, now))
    }

    fn prune(&mut self, number: u64) {
        let unused = self
            .resources
            .get(&number)
            .map_or(false, |r| r.is_unused() && r.owner == 0 && !r.own_requested);
        if unused {
            self.resources.remove(&number);
        }
    }

    /// A plock request from the local kernel.
    pub fn local_request(&mut self, info: PlockInfo, ctx: &mut PlockCtx<'_>) {
        if self.opts.debug {
            debug!(
                "{} local {:?} {:x} {}-{} ex {} owner {:x}",
                ctx.ls, info.op, info.number, info.start, info.end, info.ex, info.owner
            );
        }
        if !self.opts.ownership {
            ctx.send(Message::Plock(info), 0, 0);
            return;
        }

        let our = ctx.our_nodeid;
        let r = self.get_or_create(info.number, ctx.now);
        r.last_access = ctx.now;

        if r.owner == our && !r.releasing {
            self.apply_op(&info, ctx);
            return;
        }

        r.pending.push_back(info);
        if r.own_requested || r.releasing {
            return;
        }
        r.own_requested = true;
        let claim = if r.owner == 0 { our } else { 0 };
        let number = r.number;
        ctx.send(Message::PlockOwn(PlockOwn { number, owner: claim }), 0, 0);
    }

    /// Apply a delivered plock-class message (everything except bulk data).
    pub fn receive(&mut self, sender: NodeId, hd: &DlmHeader, msg: &Message, ctx: &mut PlockCtx<'_>) {
        match msg {
            Message::Plock(info) => self.receive_plock(sender, info, ctx),
            Message::PlockOwn(own) => self.receive_own(sender, own, ctx),
            Message::PlockDrop(drop) => self.receive_drop(sender, drop, ctx),
            Message::PlockSyncLock(sync) => self.receive_sync_lock(sender, hd, sync),
            Message::PlockSyncWaiter(info) => self.receive_sync_waiter(sender, hd, info),
            other => debug!("{} plock engine ignores {:?}", ctx.ls, other.msg_type()),
        }
    }

    fn receive_plock(&mut self, sender: NodeId, info: &PlockInfo, ctx: &mut PlockCtx<'_>) {
        if info.nodeid != sender {
            warn!(
                "{} plock from {} claims node {}, dropped",
                ctx.ls, sender, info.nodeid
            );
            return;
        }

        let our = ctx.our_nodeid;
        let r = self.get_or_create(info.number, ctx.now);
        r.last_access = ctx.now;

        if r.owner != 0 && r.owner != sender {
            // Held until the owner hands the resource back.
            r.deferred.push_back((sender, *info));
            if r.owner == our && !r.releasing {
                self.start_release(info.number, ctx);
            }
            return;
        }
        self.apply_op(info, ctx);
    }

    fn apply_op(&mut self, info: &PlockInfo, ctx: &mut PlockCtx<'_>) {
        let debug_on = self.opts.debug;
        let r = self.get_or_create(info.number, ctx.now);

        match info.op {
            PlockOp::Lock => match r.lock(info) {
                LockOutcome::Granted => ctx.reply(info, 0, None),
                LockOutcome::Queued => {
                    if debug_on {
                        debug!("{} {:x} waiter node {} owner {:x}", ctx.ls, info.number, info.nodeid, info.owner);
                    }
                }
                LockOutcome::Conflict => ctx.reply(info, -EAGAIN, None),
            },
            PlockOp::Unlock => {
                r.unlock(info);
                if info.start == 0 && info.end == u64::MAX {
                    r.drop_waiters_of(info.nodeid, info.owner);
                }
                ctx.reply(info, 0, None);
                for granted in r.grant_waiters() {
                    ctx.reply(&granted, 0, None);
                }
            }
            PlockOp::Get => {
                let conflict = r.get(info);
                ctx.reply(info, if conflict.is_some() { 1 } else { 0 }, conflict);
            }
        }
        self.prune(info.number);
    }

    fn receive_own(&mut self, sender: NodeId, own: &PlockOwn, ctx: &mut PlockCtx<'_>) {
        let our = ctx.our_nodeid;
        let r = self.get_or_create(own.number, ctx.now);

        if own.owner == sender {
            if r.owner == 0 && !r.used_by_others(sender) {
                r.owner = sender;
            } else if r.owner != sender {
                debug!("{} {:x} claim by {} refused, owner {}", ctx.ls, own.number, sender, r.owner);
            }
            if sender != our {
                return;
            }

            r.own_requested = false;
            if r.owner == our {
                let pending: Vec<PlockInfo> = r.pending.drain(..).collect();
                for info in pending {
                    self.apply_op(&info, ctx);
                }
            } else if r.owner == 0 {
                let pending: Vec<PlockInfo> = r.pending.drain(..).collect();
                for info in pending {
                    ctx.send(Message::Plock(info), 0, 0);
                }
            } else {
                r.own_requested = true;
                ctx.send(Message::PlockOwn(PlockOwn { number: own.number, owner: 0 }), 0, 0);
            }
            return;
        }

        if own.owner != 0 {
            warn!("{} {:x} bad own message from {}", ctx.ls, own.number, sender);
            return;
        }

        if sender == r.owner {
            self.release_done(own.number, ctx);
        } else if r.owner == our && !r.releasing {
            self.start_release(own.number, ctx);
        }
    }

    /// Hand an owned resource back: replay its state, then announce the
    /// release.
    fn start_release(&mut self, number: u64, ctx: &mut PlockCtx<'_>) {
        let Some(r) = self.resources.get_mut(&number) else {
            return;
        };
        r.releasing = true;
        let locks = r.locks.clone();
        let waiters: Vec<PlockInfo> = r.waiters.iter().copied().collect();

        for lock in locks {
            let seq = self.next_seq();
            ctx.send(Message::PlockSyncLock(SyncLock { number, lock }), seq, 0);
        }
        for w in waiters {
            let seq = self.next_seq();
            ctx.send(Message::PlockSyncWaiter(w), seq, 0);
        }
        info!("{} {:x} releasing ownership", ctx.ls, number);
        ctx.send(Message::PlockOwn(PlockOwn { number, owner: 0 }), 0, 0);
    }

    fn release_done(&mut self, number: u64, ctx: &mut PlockCtx<'_>) {
        let our = ctx.our_nodeid;
        let Some(r) = self.resources.get_mut(&number) else {
            return;
        };
        r.owner = 0;
        r.releasing = false;

        let deferred: Vec<(NodeId, PlockInfo)> = r.deferred.drain(..).collect();
        let pending: Vec<PlockInfo> = r.pending.drain(..).collect();
        let had_request = r.own_requested;
        r.own_requested = false;

        for (_, info) in deferred {
            self.apply_op(&info, ctx);
        }
        // Our own queued operations now go through the group.
        for info in pending {
            if info.nodeid == our {
                ctx.send(Message::Plock(info), 0, 0);
            }
        }
        if had_request {
            debug!("{} {:x} release request satisfied", ctx.ls, number);
        }
        self.prune(number);
    }

    fn receive_drop(&mut self, sender: NodeId, drop: &PlockDrop, ctx: &mut PlockCtx<'_>) {
        let Some(r) = self.resources.get(&drop.number) else {
            return;
        };
        if r.owner != sender {
            debug!("{} {:x} drop from non-owner {}", ctx.ls, drop.number, sender);
            return;
        }
        let pending: Vec<PlockInfo> = r.pending.iter().copied().collect();
        self.resources.remove(&drop.number);

        // Queued local operations start over against the fresh resource.
        for info in pending {
            self.local_request(info, ctx);
        }
    }

    fn sync_is_new(&mut self, sender: NodeId, seq: u32) -> bool {
        let last = self.sync_seq.entry(sender).or_insert(0);
        if seq != 0 && seq <= *last {
            return false;
        }
        *last = seq;
        true
    }

    fn receive_sync_lock(&mut self, sender: NodeId, hd: &DlmHeader, sync: &SyncLock) {
        if !self.sync_is_new(sender, hd.msgdata) {
            debug!("duplicate sync lock {} from {}", hd.msgdata, sender);
            return;
        }
        let Some(r) = self.resources.get_mut(&sync.number) else {
            return;
        };
        if r.owner != sender {
            return;
        }
        if !r.locks.contains(&sync.lock) {
            r.locks.push(sync.lock);
        }
    }

    fn receive_sync_waiter(&mut self, sender: NodeId, hd: &DlmHeader, info: &PlockInfo) {
        if !self.sync_is_new(sender, hd.msgdata) {
            debug!("duplicate sync waiter {} from {}", hd.msgdata, sender);
            return;
        }
        let Some(r) = self.resources.get_mut(&info.number) else {
            return;
        };
        if r.owner != sender {
            return;
        }
        if !r.waiters.contains(info) {
            r.waiters.push_back(*info);
        }
    }

    /// Remove all state of a departed node and grant what it was blocking.
    pub fn purge_node(&mut self, nodeid: NodeId, ctx: &mut PlockCtx<'_>) {
        let our = ctx.our_nodeid;
        let numbers: Vec<u64> = self.resources.keys().copied().collect();
        let mut purged = 0usize;

        for number in numbers {
            let Some(r) = self.resources.get_mut(&number) else {
                continue;
            };
            if r.purge_node(nodeid) {
                purged += 1;
            }

            let mut resend = Vec::new();
            if r.owner == nodeid {
                r.owner = 0;
                r.releasing = false;
                if r.own_requested {
                    r.own_requested = false;
                    resend = r.pending.drain(..).collect();
                }
            }
            let deferred: Vec<(NodeId, PlockInfo)> = if r.owner == 0 {
                r.deferred.drain(..).collect()
            } else {
                Vec::new()
            };
            let granted = r.grant_waiters();

            for g in granted {
                ctx.reply(&g, 0, None);
            }
            for (_, info) in deferred {
                self.apply_op(&info, ctx);
            }
            for info in resend {
                if info.nodeid == our {
                    ctx.send(Message::Plock(info), 0, 0);
                }
            }
            self.prune(number);
        }

        self.sync_seq.remove(&nodeid);
        self.applied_data.retain(|(n, _, _)| *n != nodeid);
        if purged > 0 {
            info!("{} purged plocks of node {} from {} resources", ctx.ls, nodeid, purged);
        }
    }

    /// Owner-side housekeeping: give up resources unused for a while.
    pub fn drop_resources(&mut self, ctx: &mut PlockCtx<'_>) {
        if !self.opts.ownership {
            return;
        }
        let our = ctx.our_nodeid;
        let mut dropped = Vec::new();
        for r in self.resources.values_mut() {
            if dropped.len() >= self.opts.drop_count {
                break;
            }
            if r.owner != our || r.releasing || !r.is_unused() {
                continue;
            }
            if ctx.now.saturating_sub(r.last_access) < self.opts.drop_age_ms {
                continue;
            }
            r.releasing = true;
            dropped.push(r.number);
        }
        for number in dropped {
            ctx.send(Message::PlockDrop(PlockDrop { number }), 0, 0);
        }
    }

    /// Send the full state to nodes that need it, in chunks, followed by
    /// a done marker carrying the chunk count.
    pub fn send_all_data(&mut self, seq: u32, ctx: &mut PlockCtx<'_>) {
        let images: Vec<ResourceImage> = self.resources.values().map(|r| r.image()).collect();
        let mut chunks = 0u32;
        for chunk in images.chunks(PLOCK_DATA_CHUNK_RESOURCES) {
            ctx.send(
                Message::PlocksData(PlocksData {
                    resources: chunk.to_vec(),
                }),
                seq,
                chunks,
            );
            chunks += 1;
        }
        info!(
            "{} sent plock state: {} resources in {} messages",
            ctx.ls,
            images.len(),
            chunks
        );
        ctx.send(Message::PlocksDone, seq, chunks);
    }

    /// Apply one chunk of transferred state. Chunks already applied are
    /// ignored.
    pub fn receive_data(&mut self, sender: NodeId, hd: &DlmHeader, data: &PlocksData, now: u64) -> bool {
        if !self.applied_data.insert((sender, hd.msgdata, hd.msgdata2)) {
            debug!("duplicate plocks data {}:{} from {}", hd.msgdata, hd.msgdata2, sender);
            return false;
        }
        for image in &data.resources {
            self.get_or_create(image.number, now).install(image);
        }
        true
    }

    /// Discard all state before receiving a fresh copy.
    pub fn clear(&mut self) {
        self.resources.clear();
        self.applied_data.clear();
        self.sync_seq.clear();
    }

    pub fn images(&self) -> Vec<ResourceImage> {
        self.resources.values().map(|r| r.image()).collect()
    }

    pub fn snapshot(&self) -> Vec<PlockResourceSummary> {
        self.resources
            .values()
            .map(|r| PlockResourceSummary {
                number: r.number,
                owner: r.owner,
                locks: r.locks.clone(),
                waiters: r.waiters.iter().copied().collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(ownership: bool) -> PlockOptions {
        PlockOptions {
            ownership,
            debug: false,
            drop_age_ms: 1000,
            drop_count: 10,
        }
    }

    fn info(op: PlockOp, nodeid: NodeId, owner: u64, start: u64, end: u64, ex: bool) -> PlockInfo {
        PlockInfo {
            op,
            number: 42,
            start,
            end,
            ex,
            wait: false,
            nodeid,
            owner,
            pid: 1,
            fsid: 5,
        }
    }

    fn ctx<'a>(our: NodeId, out: &'a mut Outbox) -> PlockCtx<'a> {
        PlockCtx {
            ls: "a",
            global_id: 5,
            our_nodeid: our,
            now: 0,
            out,
        }
    }

    fn replies(out: &Outbox) -> Vec<i32> {
        out.bridge
            .iter()
            .filter_map(|r| match r {
                BridgeRequest::PlockResult { reply, .. } => Some(reply.rv),
                _ => None,
            })
            .collect()
    }

    /// Deliver every queued message to every engine, in order, until quiet.
    fn run(engines: &mut [(NodeId, PlockEngine, Outbox)]) {
        loop {
            let mut msgs = Vec::new();
            for (_, _, out) in engines.iter_mut() {
                msgs.extend(out.take_messages());
            }
            if msgs.is_empty() {
                return;
            }
            for m in msgs {
                for (our, engine, out) in engines.iter_mut() {
                    let mut c = ctx(*our, out);
                    engine.receive(m.header.nodeid, &m.header, &m.msg, &mut c);
                }
            }
        }
    }

    #[test]
    fn test_local_request_is_broadcast() {
        let mut e = PlockEngine::new(opts(false));
        let mut out = Outbox::new();
        e.local_request(info(PlockOp::Lock, 1, 1, 0, 9, true), &mut ctx(1, &mut out));
        assert_eq!(out.messages.len(), 1);
        assert!(matches!(out.messages[0].msg, Message::Plock(_)));
        assert_eq!(e.resource_count(), 0);
    }

    #[test]
    fn test_replicated_lock_and_conflict() {
        let mut e = PlockEngine::new(opts(false));
        let mut out = Outbox::new();
        let hd = DlmHeader::new(dlm_proto::header::MsgType::Plock, 2, 5);

        let a = info(PlockOp::Lock, 2, 1, 0, 99, true);
        e.receive(2, &hd, &Message::Plock(a), &mut ctx(1, &mut out));
        assert_eq!(e.resource(42).unwrap().locks.len(), 1);
        // reply only for our own requests
        assert!(replies(&out).is_empty());

        let hd1 = DlmHeader::new(dlm_proto::header::MsgType::Plock, 1, 5);
        let b = info(PlockOp::Lock, 1, 1, 50, 60, false);
        e.receive(1, &hd1, &Message::Plock(b), &mut ctx(1, &mut out));
        assert_eq!(replies(&out), vec![-EAGAIN]);
    }

    #[test]
    fn test_unlock_grants_waiter_and_replies() {
        let mut e = PlockEngine::new(opts(false));
        let mut out = Outbox::new();
        let hd2 = DlmHeader::new(dlm_proto::header::MsgType::Plock, 2, 5);
        let hd1 = DlmHeader::new(dlm_proto::header::MsgType::Plock, 1, 5);

        e.receive(2, &hd2, &Message::Plock(info(PlockOp::Lock, 2, 1, 0, 99, true)), &mut ctx(1, &mut out));
        let mut w = info(PlockOp::Lock, 1, 7, 0, 9, true);
        w.wait = true;
        e.receive(1, &hd1, &Message::Plock(w), &mut ctx(1, &mut out));
        assert!(replies(&out).is_empty());

        e.receive(2, &hd2, &Message::Plock(info(PlockOp::Unlock, 2, 1, 0, 99, false)), &mut ctx(1, &mut out));
        assert_eq!(replies(&out), vec![0]);
        assert_eq!(e.resource(42).unwrap().locks[0].nodeid, 1);
    }

    #[test]
    fn test_resource_pruned_when_empty() {
        let mut e = PlockEngine::new(opts(false));
        let mut out = Outbox::new();
        let hd = DlmHeader::new(dlm_proto::header::MsgType::Plock, 1, 5);
        e.receive(1, &hd, &Message::Plock(info(PlockOp::Lock, 1, 1, 0, 9, true)), &mut ctx(1, &mut out));
        e.receive(1, &hd, &Message::Plock(info(PlockOp::Unlock, 1, 1, 0, 9, true)), &mut ctx(1, &mut out));
        assert_eq!(e.resource_count(), 0);
        assert_eq!(replies(&out), vec![0, 0]);
    }

    #[test]
    fn test_purge_node_grants_waiters() {
        let mut e = PlockEngine::new(opts(false));
        let mut out = Outbox::new();
        let hd3 = DlmHeader::new(dlm_proto::header::MsgType::Plock, 3, 5);
        let hd1 = DlmHeader::new(dlm_proto::header::MsgType::Plock, 1, 5);
        e.receive(3, &hd3, &Message::Plock(info(PlockOp::Lock, 3, 1, 0, 99, true)), &mut ctx(1, &mut out));
        let mut w = info(PlockOp::Lock, 1, 1, 0, 99, true);
        w.wait = true;
        e.receive(1, &hd1, &Message::Plock(w), &mut ctx(1, &mut out));

        e.purge_node(3, &mut ctx(1, &mut out));
        assert_eq!(replies(&out), vec![0]);
        let r = e.resource(42).unwrap();
        assert_eq!(r.locks.len(), 1);
        assert_eq!(r.locks[0].nodeid, 1);
    }

    #[test]
    fn test_bulk_data_idempotent() {
        let mut src = PlockEngine::new(opts(false));
        let mut out = Outbox::new();
        for n in 0..(PLOCK_DATA_CHUNK_RESOURCES as u64 + 5) {
            let mut i = info(PlockOp::Lock, 1, 1, 0, 9, true);
            i.number = n;
            let hd = DlmHeader::new(dlm_proto::header::MsgType::Plock, 1, 5);
            src.receive(1, &hd, &Message::Plock(i), &mut ctx(1, &mut out));
        }
        let mut out = Outbox::new();
        src.send_all_data(7, &mut ctx(1, &mut out));
        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.messages[2].msg, Message::PlocksDone);
        assert_eq!(out.messages[2].header.msgdata2, 2);

        let mut dst = PlockEngine::new(opts(false));
        for m in &out.messages {
            if let Message::PlocksData(data) = &m.msg {
                assert!(dst.receive_data(1, &m.header, data, 0));
                // replay of the same chunk changes nothing
                assert!(!dst.receive_data(1, &m.header, data, 0));
            }
        }
        assert_eq!(dst.images(), src.images());
    }

    #[test]
    fn test_ownership_claim_and_local_service() {
        let mut engines = vec![
            (1, PlockEngine::new(opts(true)), Outbox::new()),
            (2, PlockEngine::new(opts(true)), Outbox::new()),
        ];
        {
            let (our, e, out) = &mut engines[0];
            e.local_request(info(PlockOp::Lock, 1, 1, 0, 9, true), &mut ctx(*our, out));
        }
        run(&mut engines);

        assert_eq!(engines[0].1.resource(42).unwrap().owner, 1);
        assert_eq!(engines[1].1.resource(42).unwrap().owner, 1);
        assert_eq!(replies(&engines[0].2), vec![0]);
        // served locally: node 2 never saw the lock
        assert!(engines[1].1.resource(42).unwrap().locks.is_empty());

        // a second local op needs no messages
        {
            let (our, e, out) = &mut engines[0];
            e.local_request(info(PlockOp::Lock, 1, 1, 20, 29, true), &mut ctx(*our, out));
            assert!(out.messages.is_empty());
        }
    }

    #[test]
    fn test_ownership_release_syncs_state() {
        let mut engines = vec![
            (1, PlockEngine::new(opts(true)), Outbox::new()),
            (2, PlockEngine::new(opts(true)), Outbox::new()),
        ];
        {
            let (our, e, out) = &mut engines[0];
            e.local_request(info(PlockOp::Lock, 1, 1, 0, 9, true), &mut ctx(*our, out));
        }
        run(&mut engines);

        // node 2 wants the same range without waiting
        {
            let (our, e, out) = &mut engines[1];
            e.local_request(info(PlockOp::Lock, 2, 1, 0, 9, true), &mut ctx(*our, out));
        }
        run(&mut engines);

        for (_, e, _) in &engines {
            let r = e.resource(42).unwrap();
            assert_eq!(r.owner, 0);
            assert_eq!(r.locks.len(), 1);
            assert_eq!(r.locks[0].nodeid, 1);
        }
        assert_eq!(replies(&engines[1].2), vec![-EAGAIN]);
    }

    #[test]
    fn test_sync_replay_is_ignored() {
        use dlm_proto::header::MsgType;

        let mut e = PlockEngine::new(opts(true));
        let mut out = Outbox::new();
        let own = DlmHeader::new(MsgType::PlockOwn, 2, 5);
        e.receive(2, &own, &Message::PlockOwn(PlockOwn { number: 42, owner: 2 }), &mut ctx(1, &mut out));
        assert_eq!(e.resource(42).unwrap().owner, 2);

        let lock = LockImage { start: 0, end: 9, ex: true, nodeid: 2, owner: 1, pid: 1 };
        let sync_lock = Message::PlockSyncLock(SyncLock { number: 42, lock });
        let lock_hd = DlmHeader::new(MsgType::PlockSyncLock, 2, 5).with_data(1, 0);
        let mut waiter = info(PlockOp::Lock, 2, 3, 5, 5, true);
        waiter.wait = true;
        let sync_waiter = Message::PlockSyncWaiter(waiter);
        let waiter_hd = DlmHeader::new(MsgType::PlockSyncWaiter, 2, 5).with_data(2, 0);

        for _ in 0..2 {
            e.receive(2, &lock_hd, &sync_lock, &mut ctx(1, &mut out));
            e.receive(2, &waiter_hd, &sync_waiter, &mut ctx(1, &mut out));
        }
        let r = e.resource(42).unwrap();
        assert_eq!(r.locks, vec![lock]);
        assert_eq!(r.waiters.iter().copied().collect::<Vec<_>>(), vec![waiter]);

        // the sequence number alone rejects a late copy
        let r = e.resources.get_mut(&42).unwrap();
        r.locks.clear();
        r.waiters.clear();
        e.receive(2, &lock_hd, &sync_lock, &mut ctx(1, &mut out));
        e.receive(2, &waiter_hd, &sync_waiter, &mut ctx(1, &mut out));
        let r = e.resource(42).unwrap();
        assert!(r.locks.is_empty());
        assert!(r.waiters.is_empty());
        assert!(out.messages.is_empty());
    }

    #[test]
    fn test_drop_unused_resource() {
        let mut engines = vec![
            (1, PlockEngine::new(opts(true)), Outbox::new()),
            (2, PlockEngine::new(opts(true)), Outbox::new()),
        ];
        {
            let (our, e, out) = &mut engines[0];
            e.local_request(info(PlockOp::Lock, 1, 1, 0, 9, true), &mut ctx(*our, out));
        }
        run(&mut engines);
        {
            let (our, e, out) = &mut engines[0];
            e.local_request(info(PlockOp::Unlock, 1, 1, 0, 9, true), &mut ctx(*our, out));
            let mut c = ctx(*our, out);
            c.now = 5000;
            e.drop_resources(&mut c);
        }
        run(&mut engines);
        assert_eq!(engines[0].1.resource_count(), 0);
        assert_eq!(engines[1].1.resource_count(), 0);
    }
}
