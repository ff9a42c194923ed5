//! Daemon and plock protocol negotiation on the daemon group.
//!
//! Every daemon announces the versions it supports whenever membership of
//! the daemon group grows. A node whose major version differs from ours
//! is incompatible and its lockspace traffic is ignored; among compatible
//! members the run version is the lowest minor/patch anyone supports.

use std::collections::BTreeMap;

use tracing::{info, warn};

use dlm_proto::constants::{DAEMON_PROTO_VER, PLOCK_PROTO_VER};
use dlm_proto::message::ProtocolInfo;
use dlm_proto::node::NodeId;

pub struct ProtocolState {
    ours: ProtocolInfo,
    nodes: BTreeMap<NodeId, ProtocolInfo>,
    run: ProtocolInfo,
}

fn compatible(a: [u16; 3], b: [u16; 3]) -> bool {
    a[0] == b[0]
}

fn lowest(a: [u16; 3], b: [u16; 3]) -> [u16; 3] {
    if (b[1], b[2]) < (a[1], a[2]) {
        b
    } else {
        a
    }
}

impl Default for ProtocolState {
    fn default() -> Self {
        Self::new(ProtocolInfo {
            daemon: DAEMON_PROTO_VER,
            plock: PLOCK_PROTO_VER,
        })
    }
}

impl ProtocolState {
    pub fn new(ours: ProtocolInfo) -> Self {
        Self {
            ours,
            nodes: BTreeMap::new(),
            run: ours,
        }
    }

    pub fn ours(&self) -> ProtocolInfo {
        self.ours
    }

    pub fn run(&self) -> ProtocolInfo {
        self.run
    }

    /// Update for a daemon group change. Returns true if we should
    /// announce our versions.
    pub fn confchg(&mut self, members: &[NodeId], joined: &[NodeId]) -> bool {
        self.nodes.retain(|n, _| members.contains(n));
        self.recompute();
        !joined.is_empty()
    }

    pub fn receive(&mut self, sender: NodeId, info: ProtocolInfo) {
        if !compatible(self.ours.daemon, info.daemon) {
            warn!(
                "node {} daemon protocol {:?} incompatible with {:?}",
                sender, info.daemon, self.ours.daemon
            );
        } else if !compatible(self.ours.plock, info.plock) {
            warn!(
                "node {} plock protocol {:?} incompatible with {:?}",
                sender, info.plock, self.ours.plock
            );
        }
        self.nodes.insert(sender, info);
        self.recompute();
    }

    /// Whether lockspace messages from `nodeid` may be processed. Nodes
    /// that have not announced yet are given the benefit of the doubt.
    pub fn is_compatible(&self, nodeid: NodeId) -> bool {
        self.nodes.get(&nodeid).map_or(true, |info| {
            compatible(self.ours.daemon, info.daemon) && compatible(self.ours.plock, info.plock)
        })
    }

    fn recompute(&mut self) {
        let mut run = self.ours;
        for info in self.nodes.values() {
            if compatible(self.ours.daemon, info.daemon) {
                run.daemon = lowest(run.daemon, info.daemon);
            }
            if compatible(self.ours.plock, info.plock) {
                run.plock = lowest(run.plock, info.plock);
            }
        }
        if run != self.run {
            info!(
                "run protocol daemon {:?} plock {:?}",
                run.daemon, run.plock
            );
            self.run = run;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proto(daemon: [u16; 3], plock: [u16; 3]) -> ProtocolInfo {
        ProtocolInfo { daemon, plock }
    }

    #[test]
    fn test_run_version_is_lowest_compatible() {
        let mut p = ProtocolState::new(proto([3, 1, 1], [1, 2, 0]));
        assert!(p.confchg(&[1, 2, 3], &[2, 3]));
        p.receive(2, proto([3, 0, 5], [1, 2, 0]));
        p.receive(3, proto([4, 0, 0], [1, 1, 0]));
        assert_eq!(p.run(), proto([3, 0, 5], [1, 1, 0]));
        assert!(p.is_compatible(2));
        assert!(!p.is_compatible(3));
        assert!(p.is_compatible(9));

        // departed nodes stop holding the version down
        assert!(!p.confchg(&[1, 3], &[]));
        assert_eq!(p.run(), proto([3, 1, 1], [1, 1, 0]));
    }
}
