//! POSIX byte-range lock state of a single resource.
//!
//! Locks are identified by `(nodeid, owner)`. A new lock by an owner
//! replaces whatever that owner held in the range (converting and
//! splitting as needed), and adjacent or overlapping locks of the same
//! owner and mode are merged.

use std::collections::VecDeque;

use dlm_proto::message::{LockImage, PlockInfo, ResourceImage};
use dlm_proto::node::NodeId;

/// Outcome of a lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    Queued,
    Conflict,
}

fn ranges_overlap(s1: u64, e1: u64, s2: u64, e2: u64) -> bool {
    s1 <= e2 && s2 <= e1
}

fn same_owner(lock: &LockImage, nodeid: NodeId, owner: u64) -> bool {
    lock.nodeid == nodeid && lock.owner == owner
}

pub fn image_of(info: &PlockInfo) -> LockImage {
    LockImage {
        start: info.start,
        end: info.end,
        ex: info.ex,
        nodeid: info.nodeid,
        owner: info.owner,
        pid: info.pid,
    }
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub number: u64,
    /// Owning node in ownership mode, 0 when state is fully replicated.
    pub owner: NodeId,
    pub locks: Vec<LockImage>,
    /// Blocked requests, granted in arrival order.
    pub waiters: VecDeque<PlockInfo>,
    /// Local requests waiting for an ownership change.
    pub pending: VecDeque<PlockInfo>,
    /// Remote requests delivered while another node owned the resource.
    pub deferred: VecDeque<(NodeId, PlockInfo)>,
    /// Ownership mode: our claim or release request is in flight.
    pub own_requested: bool,
    /// Ownership mode: we are handing the resource back.
    pub releasing: bool,
    pub last_access: u64,
}

impl Resource {
    pub fn new(number: u64, now_mono: u64) -> Self {
        Self {
            number,
            owner: 0,
            locks: Vec::new(),
            waiters: VecDeque::new(),
            pending: VecDeque::new(),
            deferred: VecDeque::new(),
            own_requested: false,
            releasing: false,
            last_access: now_mono,
        }
    }

    /// First lock of another owner that conflicts with `info`.
    pub fn find_conflict(&self, info: &PlockInfo) -> Option<&LockImage> {
        self.locks.iter().find(|l| {
            !same_owner(l, info.nodeid, info.owner)
                && ranges_overlap(l.start, l.end, info.start, info.end)
                && (l.ex || info.ex)
        })
    }

    /// Remove `[start, end]` from every lock of the given owner, splitting
    /// locks that extend past either side. Returns whether anything changed.
    fn cut_range(&mut self, nodeid: NodeId, owner: u64, start: u64, end: u64) -> bool {
        let mut changed = false;
        let mut kept = Vec::with_capacity(self.locks.len() + 1);

        for lock in self.locks.drain(..) {
            if !same_owner(&lock, nodeid, owner) || !ranges_overlap(lock.start, lock.end, start, end) {
                kept.push(lock);
                continue;
            }
            changed = true;
            if lock.start < start {
                kept.push(LockImage {
                    end: start - 1,
                    ..lock
                });
            }
            if lock.end > end {
                kept.push(LockImage {
                    start: end + 1,
                    ..lock
                });
            }
        }
        self.locks = kept;
        changed
    }

    /// Merge adjacent and overlapping locks of the same owner and mode.
    fn coalesce(&mut self, nodeid: NodeId, owner: u64) {
        let (mut mine, mut rest): (Vec<LockImage>, Vec<LockImage>) = self
            .locks
            .drain(..)
            .partition(|l| same_owner(l, nodeid, owner));
        mine.sort_by_key(|l| (l.start, l.end));

        let mut merged: Vec<LockImage> = Vec::with_capacity(mine.len());
        for lock in mine {
            if let Some(last) = merged.last_mut() {
                let touches = last.end == u64::MAX || lock.start <= last.end + 1;
                if last.ex == lock.ex && touches {
                    last.end = last.end.max(lock.end);
                    continue;
                }
            }
            merged.push(lock);
        }

        rest.extend(merged);
        self.locks = rest;
    }

    /// Install a lock with no conflict check.
    pub fn add_lock(&mut self, lock: LockImage) {
        self.cut_range(lock.nodeid, lock.owner, lock.start, lock.end);
        self.locks.push(lock);
        self.coalesce(lock.nodeid, lock.owner);
    }

    /// Try to grant `info`; queue it when it conflicts and the requester
    /// is willing to wait.
    pub fn lock(&mut self, info: &PlockInfo) -> LockOutcome {
        if self.find_conflict(info).is_some() {
            if info.wait {
                self.waiters.push_back(*info);
                return LockOutcome::Queued;
            }
            return LockOutcome::Conflict;
        }
        self.add_lock(image_of(info));
        LockOutcome::Granted
    }

    /// Release `[start, end]` held by the requester.
    pub fn unlock(&mut self, info: &PlockInfo) -> bool {
        self.cut_range(info.nodeid, info.owner, info.start, info.end)
    }

    /// Conflicting lock for an F_GETLK-style query.
    pub fn get(&self, info: &PlockInfo) -> Option<LockImage> {
        self.find_conflict(info).copied()
    }

    /// Grant queued waiters that no longer conflict, in FIFO order.
    pub fn grant_waiters(&mut self) -> Vec<PlockInfo> {
        let mut granted = Vec::new();
        let mut still = VecDeque::with_capacity(self.waiters.len());

        while let Some(w) = self.waiters.pop_front() {
            if self.find_conflict(&w).is_none() {
                self.add_lock(image_of(&w));
                granted.push(w);
            } else {
                still.push_back(w);
            }
        }
        self.waiters = still;
        granted
    }

    /// Remove every lock and waiter held by `nodeid`.
    pub fn purge_node(&mut self, nodeid: NodeId) -> bool {
        let before = self.locks.len() + self.waiters.len();
        self.locks.retain(|l| l.nodeid != nodeid);
        self.waiters.retain(|w| w.nodeid != nodeid);
        self.deferred.retain(|(n, _)| *n != nodeid);
        before != self.locks.len() + self.waiters.len()
    }

    /// Remove waiters matching an owner; a closed file no longer waits.
    pub fn drop_waiters_of(&mut self, nodeid: NodeId, owner: u64) {
        self.waiters
            .retain(|w| !(w.nodeid == nodeid && w.owner == owner));
    }

    /// No locks and no queued work of any kind.
    pub fn is_unused(&self) -> bool {
        self.locks.is_empty()
            && self.waiters.is_empty()
            && self.pending.is_empty()
            && self.deferred.is_empty()
    }

    /// Whether any node other than `nodeid` holds or waits on the resource.
    pub fn used_by_others(&self, nodeid: NodeId) -> bool {
        self.locks.iter().any(|l| l.nodeid != nodeid)
            || self.waiters.iter().any(|w| w.nodeid != nodeid)
    }

    pub fn image(&self) -> ResourceImage {
        ResourceImage {
            number: self.number,
            owner: self.owner,
            locks: self.locks.clone(),
            waiters: self.waiters.iter().copied().collect(),
        }
    }

    /// Merge a transferred image. Locks and waiters already present are
    /// not duplicated.
    pub fn install(&mut self, image: &ResourceImage) {
        self.owner = image.owner;
        for lock in &image.locks {
            if !self.locks.contains(lock) {
                self.locks.push(*lock);
            }
        }
        for w in &image.waiters {
            if !self.waiters.contains(w) {
                self.waiters.push_back(*w);
            }
        }
    }
}
