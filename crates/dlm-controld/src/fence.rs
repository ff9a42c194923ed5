//! Fencing coordinator.
//!
//! Failed nodes must be fenced before any lockspace they belonged to may
//! recover. Requests from the daemon group and from every lockspace are
//! coalesced per node; the lowest live cluster member acts as fence actor
//! and runs the agent, then broadcasts the outcome so that every daemon
//! records the same fence time.
//!
//! The coordinator itself performs no I/O. The event loop asks it for
//! runnable jobs, runs them through a [`FenceAgent`], and feeds the
//! outcomes back.

use std::collections::{BTreeMap, BTreeSet};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use dlm_proto::admin::FenceSummary;
use dlm_proto::constants::FENCE_RESULT_OK;
use dlm_proto::error::{DlmError, DlmResult};
use dlm_proto::message::FenceResultInfo;
use dlm_proto::node::{LeaveReason, NodeId};

use crate::clock::Now;
use crate::config::DaemonConfig;

/// Fencing options, in milliseconds where applicable.
#[derive(Debug, Clone)]
pub struct FenceConfig {
    pub enabled: bool,
    pub startup: bool,
    pub concurrent: bool,
    pub quorum: bool,
    pub fatal: bool,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub post_join_delay_ms: u64,
}

impl From<&DaemonConfig> for FenceConfig {
    fn from(cfg: &DaemonConfig) -> Self {
        Self {
            enabled: cfg.enable_fencing,
            startup: cfg.enable_startup_fencing,
            concurrent: cfg.enable_concurrent_fencing,
            quorum: cfg.enable_quorum_fencing,
            fatal: cfg.fence_fatal,
            retry_base_ms: cfg.fence_retry_base.as_millis() as u64,
            retry_max_ms: cfg.fence_retry_max.as_millis() as u64,
            post_join_delay_ms: cfg.post_join_delay.as_millis() as u64,
        }
    }
}

/// Result of polling a fence request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Pending,
    Fenced,
    /// Fencing failed and will not be retried.
    Failed,
}

/// Handle returned by [`FenceCoordinator::request_fence`].
///
/// Carries the caller's failure time: a fence only satisfies the handle
/// if it covers that failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceHandle {
    pub nodeid: NodeId,
    pub fail_monotime: u64,
}

/// A fence operation the actor should run now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceJob {
    pub nodeid: NodeId,
    pub fail_walltime: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Waiting,
    InProgress,
    RetryAt(u64),
    Failed,
}

#[derive(Debug)]
struct FenceRequest {
    fail_walltime: u64,
    reason: LeaveReason,
    state: RequestState,
    attempts: u32,
    /// Groups that are waiting on this request.
    scopes: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct NodeRecord {
    member: bool,
    ever_member: bool,
    add_monotime: u64,
    last_fenced_walltime: u64,
    last_fenced_monotime: Option<u64>,
    cleared_monotime: Option<u64>,
}

pub struct FenceCoordinator {
    our_nodeid: NodeId,
    config: FenceConfig,
    nodes: BTreeMap<NodeId, NodeRecord>,
    requests: BTreeMap<NodeId, FenceRequest>,
    max_members: usize,
}

impl FenceCoordinator {
    pub fn new(our_nodeid: NodeId, config: FenceConfig) -> Self {
        Self {
            our_nodeid,
            config,
            nodes: BTreeMap::new(),
            requests: BTreeMap::new(),
            max_members: 0,
        }
    }

    /// Record a configuration change of the daemon group.
    ///
    /// Members that failed get a fence request; members that came back
    /// resolve any request still outstanding for them.
    pub fn cluster_change(
        &mut self,
        members: &[NodeId],
        joined: &[NodeId],
        left: &[(NodeId, LeaveReason)],
        now: Now,
    ) {
        for &nodeid in members {
            let rec = self.nodes.entry(nodeid).or_default();
            if !rec.member || joined.contains(&nodeid) {
                rec.add_monotime = now.mono;
            }
            rec.member = true;
            rec.ever_member = true;
        }
        self.max_members = self.max_members.max(members.len());

        for &nodeid in joined {
            if self.requests.remove(&nodeid).is_some() {
                info!("fence request for node {} dropped, node rejoined", nodeid);
            }
        }

        for &(nodeid, reason) in left {
            if let Some(rec) = self.nodes.get_mut(&nodeid) {
                rec.member = false;
            }
            if reason.is_failure() {
                self.request_fence(
                    nodeid,
                    now.wall,
                    now.mono,
                    reason,
                    dlm_proto::constants::DAEMON_GROUP_NAME,
                );
            }
        }
    }

    /// Ask for `nodeid` to be fenced for the failure observed at the given
    /// times. Requests are coalesced per node.
    pub fn request_fence(
        &mut self,
        nodeid: NodeId,
        fail_walltime: u64,
        fail_monotime: u64,
        reason: LeaveReason,
        scope: &str,
    ) -> FenceHandle {
        let handle = FenceHandle {
            nodeid,
            fail_monotime,
        };

        if let Some(req) = self.requests.get_mut(&nodeid) {
            req.scopes.insert(scope.to_string());
            return handle;
        }
        if self.is_fenced_since(nodeid, fail_monotime) {
            debug!("fence request node {} already satisfied", nodeid);
            return handle;
        }

        info!(
            "fence request node {} reason {} fail_walltime {} scope {}",
            nodeid, reason, fail_walltime, scope
        );
        let mut scopes = BTreeSet::new();
        scopes.insert(scope.to_string());
        self.requests.insert(
            nodeid,
            FenceRequest {
                fail_walltime,
                reason,
                state: RequestState::Waiting,
                attempts: 0,
                scopes,
            },
        );
        handle
    }

    /// Whether `nodeid` was fenced, cleared, or rejoined after a failure
    /// observed at `fail_monotime`.
    fn is_fenced_since(&self, nodeid: NodeId, fail_monotime: u64) -> bool {
        if !self.config.enabled {
            return true;
        }
        let rec = match self.nodes.get(&nodeid) {
            Some(rec) => rec,
            None => return !self.config.startup,
        };
        if !rec.ever_member && !self.config.startup {
            return true;
        }
        if rec.member && rec.add_monotime > fail_monotime {
            return true;
        }
        let covers = |t: Option<u64>| t.map_or(false, |t| t >= rec.add_monotime);
        covers(rec.last_fenced_monotime) || covers(rec.cleared_monotime)
    }

    pub fn poll_result(&self, handle: &FenceHandle) -> FenceStatus {
        if self.is_fenced_since(handle.nodeid, handle.fail_monotime) {
            return FenceStatus::Fenced;
        }
        match self.requests.get(&handle.nodeid) {
            Some(req) if req.state == RequestState::Failed => FenceStatus::Failed,
            _ => FenceStatus::Pending,
        }
    }

    /// Local monotonic time at which the last successful fence of
    /// `nodeid` was recorded.
    pub fn fence_node_time(&self, nodeid: NodeId) -> Option<u64> {
        self.nodes.get(&nodeid).and_then(|r| r.last_fenced_monotime)
    }

    /// The node responsible for running fence agents.
    pub fn fence_actor(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, r)| r.member)
            .map(|(&n, _)| n)
    }

    pub fn cluster_members(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, r)| r.member)
            .map(|(&n, _)| n)
            .collect()
    }

    fn quorate(&self) -> bool {
        if !self.config.quorum {
            return true;
        }
        self.cluster_members().len() * 2 > self.max_members
    }

    fn retry_delay(&self, attempts: u32) -> u64 {
        let shift = attempts.saturating_sub(1).min(16);
        self.config
            .retry_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.config.retry_max_ms)
    }

    /// Requests this node should start fencing now.
    pub fn take_runnable(&mut self, now: Now) -> Vec<FenceJob> {
        if self.fence_actor() != Some(self.our_nodeid) {
            return Vec::new();
        }
        if !self.quorate() {
            debug!("fencing deferred, cluster not quorate");
            return Vec::new();
        }

        let mut in_progress = self
            .requests
            .values()
            .filter(|r| r.state == RequestState::InProgress)
            .count();
        let mut jobs = Vec::new();

        for (&nodeid, req) in self.requests.iter_mut() {
            if !self.config.concurrent && in_progress > 0 {
                break;
            }
            let due = match req.state {
                RequestState::Waiting => true,
                RequestState::RetryAt(t) => t <= now.mono,
                RequestState::InProgress | RequestState::Failed => false,
            };
            if !due {
                continue;
            }
            let ever_member = self.nodes.get(&nodeid).map_or(false, |r| r.ever_member);
            if !ever_member && now.mono < self.config.post_join_delay_ms {
                continue;
            }

            req.state = RequestState::InProgress;
            req.attempts += 1;
            in_progress += 1;
            info!(
                "fence node {} attempt {} reason {}",
                nodeid, req.attempts, req.reason
            );
            jobs.push(FenceJob {
                nodeid,
                fail_walltime: req.fail_walltime,
            });
        }
        jobs
    }

    /// Record the agent's exit status for a job this node ran. Returns the
    /// result to broadcast to the daemon group.
    pub fn agent_done(&mut self, nodeid: NodeId, result: i32, now: Now) -> Option<FenceResultInfo> {
        let retry = self.requests.get(&nodeid).map(|r| self.retry_delay(r.attempts));
        let req = match self.requests.get_mut(&nodeid) {
            Some(req) if req.state == RequestState::InProgress => req,
            _ => {
                debug!("fence result for node {} with no request in progress", nodeid);
                return None;
            }
        };

        if result == FENCE_RESULT_OK {
            info!("fence agent succeeded for node {}", nodeid);
        } else if self.config.fatal {
            error!(
                "fence agent failed for node {} result {}, recovery blocked",
                nodeid, result
            );
            req.state = RequestState::Failed;
        } else {
            let delay = retry.unwrap_or(self.config.retry_base_ms);
            warn!(
                "fence agent failed for node {} result {}, retry in {} ms",
                nodeid, result, delay
            );
            req.state = RequestState::RetryAt(now.mono + delay);
        }

        Some(FenceResultInfo {
            nodeid,
            result,
            fence_walltime: now.wall,
        })
    }

    /// Apply a fence result broadcast by the actor.
    pub fn receive_fence_result(&mut self, sender: NodeId, info: &FenceResultInfo, now: Now) {
        if info.result != FENCE_RESULT_OK {
            warn!(
                "node {} reports fencing of node {} failed: {}",
                sender, info.nodeid, info.result
            );
            if self.config.fatal {
                if let Some(req) = self.requests.get_mut(&info.nodeid) {
                    req.state = RequestState::Failed;
                }
            }
            return;
        }

        info!(
            "node {} fenced by node {} at {}",
            info.nodeid, sender, info.fence_walltime
        );
        let rec = self.nodes.entry(info.nodeid).or_default();
        rec.last_fenced_walltime = info.fence_walltime;
        rec.last_fenced_monotime = Some(now.mono);
        self.requests.remove(&info.nodeid);
    }

    /// Apply an operator override that exempts `nodeid` from fencing.
    pub fn receive_fence_clear(&mut self, sender: NodeId, nodeid: NodeId, now: Now) {
        warn!("fencing of node {} cleared by node {}", nodeid, sender);
        let rec = self.nodes.entry(nodeid).or_default();
        rec.cleared_monotime = Some(now.mono);
        self.requests.remove(&nodeid);
    }

    /// Withdraw a group's interest in outstanding requests.
    pub fn cancel_scope(&mut self, scope: &str) {
        self.requests.retain(|nodeid, req| {
            req.scopes.remove(scope);
            let keep = !req.scopes.is_empty() || req.state == RequestState::InProgress;
            if !keep {
                debug!("fence request node {} cancelled with {}", nodeid, scope);
            }
            keep
        });
    }

    /// Whether any failed fence is blocking recovery.
    pub fn has_failure(&self) -> bool {
        self.requests.values().any(|r| r.state == RequestState::Failed)
    }

    pub fn summaries(&self) -> Vec<FenceSummary> {
        let mut out: Vec<FenceSummary> = self
            .requests
            .iter()
            .map(|(&nodeid, req)| FenceSummary {
                nodeid,
                fail_walltime: req.fail_walltime,
                state: match req.state {
                    RequestState::Waiting => "pending".to_string(),
                    RequestState::InProgress => "in-progress".to_string(),
                    RequestState::RetryAt(_) => "retry".to_string(),
                    RequestState::Failed => "failed".to_string(),
                },
                attempts: req.attempts,
                last_fenced_walltime: self
                    .nodes
                    .get(&nodeid)
                    .map_or(0, |r| r.last_fenced_walltime),
            })
            .collect();

        for (&nodeid, rec) in &self.nodes {
            if self.requests.contains_key(&nodeid) || rec.last_fenced_monotime.is_none() {
                continue;
            }
            out.push(FenceSummary {
                nodeid,
                fail_walltime: 0,
                state: "fenced".to_string(),
                attempts: 0,
                last_fenced_walltime: rec.last_fenced_walltime,
            });
        }
        out
    }
}

/// Something that can power off or isolate a node.
#[async_trait]
pub trait FenceAgent: Send + Sync {
    fn name(&self) -> &str;

    /// Fence `nodeid`, returning the agent's result code (0 on success).
    async fn fence(&self, nodeid: NodeId, fail_walltime: u64) -> DlmResult<i32>;
}

/// Runs an external fence agent program as
/// `<agent> --nodeid <id> --fail-time <secs>`.
pub struct CommandAgent {
    program: String,
}

impl CommandAgent {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

#[async_trait]
impl FenceAgent for CommandAgent {
    fn name(&self) -> &str {
        &self.program
    }

    async fn fence(&self, nodeid: NodeId, fail_walltime: u64) -> DlmResult<i32> {
        let status = Command::new(&self.program)
            .arg("--nodeid")
            .arg(nodeid.to_string())
            .arg("--fail-time")
            .arg(fail_walltime.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                error!("failed to run fence agent {}: {}", self.program, e);
                DlmError::FenceFailure
            })?;

        debug!("fence agent {} node {} exited {}", self.program, nodeid, status);
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FenceConfig {
        FenceConfig {
            enabled: true,
            startup: true,
            concurrent: false,
            quorum: true,
            fatal: false,
            retry_base_ms: 1000,
            retry_max_ms: 8000,
            post_join_delay_ms: 0,
        }
    }

    fn three_node(our: NodeId, config: FenceConfig) -> FenceCoordinator {
        let mut fc = FenceCoordinator::new(our, config);
        fc.cluster_change(&[1, 2, 3], &[our], &[], Now::at(100, 10));
        fc
    }

    #[test]
    fn test_failure_creates_request_and_actor_runs_it() {
        let mut fc = three_node(1, cfg());
        fc.cluster_change(&[1, 2], &[], &[(3, LeaveReason::NodeDown)], Now::at(200, 100));
        let h = fc.request_fence(3, 200, 100, LeaveReason::NodeDown, "dlm:ls:a");
        assert_eq!(fc.poll_result(&h), FenceStatus::Pending);

        let jobs = fc.take_runnable(Now::at(201, 110));
        assert_eq!(jobs, vec![FenceJob { nodeid: 3, fail_walltime: 200 }]);
        assert!(fc.take_runnable(Now::at(201, 111)).is_empty());

        let info = fc.agent_done(3, 0, Now::at(205, 150)).unwrap();
        assert_eq!(fc.poll_result(&h), FenceStatus::Pending);
        fc.receive_fence_result(1, &info, Now::at(205, 151));
        assert_eq!(fc.poll_result(&h), FenceStatus::Fenced);
        assert_eq!(fc.fence_node_time(3), Some(151));
    }

    #[test]
    fn test_non_actor_waits_for_result() {
        let mut fc = three_node(2, cfg());
        fc.cluster_change(&[1, 2], &[], &[(3, LeaveReason::NodeDown)], Now::at(200, 100));
        assert_eq!(fc.fence_actor(), Some(1));
        assert!(fc.take_runnable(Now::at(200, 100)).is_empty());

        let h = FenceHandle { nodeid: 3, fail_monotime: 100 };
        fc.receive_fence_result(
            1,
            &FenceResultInfo { nodeid: 3, result: 0, fence_walltime: 210 },
            Now::at(210, 300),
        );
        assert_eq!(fc.poll_result(&h), FenceStatus::Fenced);
    }

    #[test]
    fn test_requests_coalesce() {
        let mut fc = three_node(1, cfg());
        fc.cluster_change(&[1, 2], &[], &[(3, LeaveReason::NodeDown)], Now::at(200, 100));
        fc.request_fence(3, 200, 101, LeaveReason::NodeDown, "dlm:ls:a");
        fc.request_fence(3, 200, 102, LeaveReason::NodeDown, "dlm:ls:b");
        assert_eq!(fc.take_runnable(Now::at(200, 103)).len(), 1);
        assert_eq!(fc.summaries().len(), 1);
    }

    #[test]
    fn test_retry_backoff() {
        let mut fc = three_node(1, cfg());
        fc.cluster_change(&[1, 2], &[], &[(3, LeaveReason::NodeDown)], Now::at(200, 100));
        assert_eq!(fc.take_runnable(Now::at(200, 100)).len(), 1);
        fc.agent_done(3, 1, Now::at(201, 200));

        assert!(fc.take_runnable(Now::at(201, 1100)).is_empty());
        assert_eq!(fc.take_runnable(Now::at(202, 1200)).len(), 1);
        fc.agent_done(3, 1, Now::at(203, 1300));
        // second failure doubles the delay
        assert!(fc.take_runnable(Now::at(204, 3200)).is_empty());
        assert_eq!(fc.take_runnable(Now::at(204, 3300)).len(), 1);
    }

    #[test]
    fn test_fatal_mode_blocks() {
        let mut config = cfg();
        config.fatal = true;
        let mut fc = three_node(1, config);
        fc.cluster_change(&[1, 2], &[], &[(3, LeaveReason::NodeDown)], Now::at(200, 100));
        let h = fc.request_fence(3, 200, 100, LeaveReason::NodeDown, "dlm:ls:a");
        fc.take_runnable(Now::at(200, 100));
        fc.agent_done(3, 1, Now::at(201, 200));
        assert_eq!(fc.poll_result(&h), FenceStatus::Failed);
        assert!(fc.has_failure());
        assert!(fc.take_runnable(Now::at(300, 99_000)).is_empty());
    }

    #[test]
    fn test_serialized_unless_concurrent() {
        let mut fc = FenceCoordinator::new(1, cfg());
        fc.cluster_change(&[1, 2, 3, 4, 5], &[1], &[], Now::at(100, 10));
        fc.cluster_change(
            &[1, 2, 3],
            &[],
            &[(4, LeaveReason::NodeDown), (5, LeaveReason::NodeDown)],
            Now::at(200, 100),
        );
        assert_eq!(fc.take_runnable(Now::at(200, 100)).len(), 1);

        let mut config = cfg();
        config.concurrent = true;
        let mut fc = FenceCoordinator::new(1, config);
        fc.cluster_change(&[1, 2, 3, 4, 5], &[1], &[], Now::at(100, 10));
        fc.cluster_change(
            &[1, 2, 3],
            &[],
            &[(4, LeaveReason::NodeDown), (5, LeaveReason::NodeDown)],
            Now::at(200, 100),
        );
        assert_eq!(fc.take_runnable(Now::at(200, 100)).len(), 2);
    }

    #[test]
    fn test_quorum_required() {
        let mut fc = FenceCoordinator::new(1, cfg());
        fc.cluster_change(&[1, 2], &[1], &[], Now::at(100, 10));
        fc.cluster_change(&[1], &[], &[(2, LeaveReason::NodeDown)], Now::at(200, 100));
        assert!(fc.take_runnable(Now::at(200, 100)).is_empty());

        let mut config = cfg();
        config.quorum = false;
        let mut fc = FenceCoordinator::new(1, config);
        fc.cluster_change(&[1, 2], &[1], &[], Now::at(100, 10));
        fc.cluster_change(&[1], &[], &[(2, LeaveReason::NodeDown)], Now::at(200, 100));
        assert_eq!(fc.take_runnable(Now::at(200, 100)).len(), 1);
    }

    #[test]
    fn test_exemptions() {
        // fencing disabled
        let mut config = cfg();
        config.enabled = false;
        let mut fc = three_node(1, config);
        let h = fc.request_fence(3, 200, 100, LeaveReason::NodeDown, "dlm:ls:a");
        assert_eq!(fc.poll_result(&h), FenceStatus::Fenced);

        // operator clear
        let mut fc = three_node(1, cfg());
        fc.cluster_change(&[1, 2], &[], &[(3, LeaveReason::NodeDown)], Now::at(200, 100));
        let h = fc.request_fence(3, 200, 100, LeaveReason::NodeDown, "dlm:ls:a");
        fc.receive_fence_clear(2, 3, Now::at(201, 120));
        assert_eq!(fc.poll_result(&h), FenceStatus::Fenced);

        // rejoined after failure
        let mut fc = three_node(1, cfg());
        fc.cluster_change(&[1, 2], &[], &[(3, LeaveReason::NodeDown)], Now::at(200, 100));
        let h = fc.request_fence(3, 200, 100, LeaveReason::NodeDown, "dlm:ls:a");
        fc.cluster_change(&[1, 2, 3], &[3], &[], Now::at(230, 400));
        assert_eq!(fc.poll_result(&h), FenceStatus::Fenced);
        assert!(fc.take_runnable(Now::at(230, 400)).is_empty());
    }

    #[test]
    fn test_old_fence_does_not_cover_new_failure() {
        let mut fc = three_node(1, cfg());
        fc.cluster_change(&[1, 2], &[], &[(3, LeaveReason::NodeDown)], Now::at(200, 100));
        fc.receive_fence_result(
            1,
            &FenceResultInfo { nodeid: 3, result: 0, fence_walltime: 201 },
            Now::at(201, 110),
        );
        fc.cluster_change(&[1, 2, 3], &[3], &[], Now::at(300, 500));
        fc.cluster_change(&[1, 2], &[], &[(3, LeaveReason::NodeDown)], Now::at(400, 900));

        let h = FenceHandle { nodeid: 3, fail_monotime: 900 };
        assert_eq!(fc.poll_result(&h), FenceStatus::Pending);
    }

    #[test]
    fn test_lockspace_failure_seen_before_cluster_failure() {
        let mut fc = three_node(2, cfg());
        // lockspace group reports the failure first
        let h = fc.request_fence(3, 200, 100, LeaveReason::NodeDown, "dlm:ls:a");
        fc.cluster_change(&[1, 2], &[], &[(3, LeaveReason::NodeDown)], Now::at(200, 105));
        fc.receive_fence_result(
            1,
            &FenceResultInfo { nodeid: 3, result: 0, fence_walltime: 210 },
            Now::at(210, 300),
        );
        assert_eq!(fc.poll_result(&h), FenceStatus::Fenced);
    }

    #[test]
    fn test_cancel_scope() {
        let mut fc = three_node(2, cfg());
        fc.request_fence(3, 200, 100, LeaveReason::NodeDown, "dlm:ls:a");
        assert_eq!(fc.summaries().len(), 1);
        fc.cancel_scope("dlm:ls:a");
        assert!(fc.summaries().is_empty());
    }

    #[test]
    fn test_startup_fencing_disabled() {
        let mut config = cfg();
        config.startup = false;
        let mut fc = three_node(1, config);
        // node 9 was never a cluster member
        let h = fc.request_fence(9, 200, 100, LeaveReason::NodeDown, "dlm:ls:a");
        assert_eq!(fc.poll_result(&h), FenceStatus::Fenced);
    }

    #[test]
    fn test_post_join_delay() {
        let mut config = cfg();
        config.post_join_delay_ms = 30_000;
        let mut fc = three_node(1, config);
        fc.request_fence(9, 200, 100, LeaveReason::NodeDown, "dlm:ls:a");
        assert!(fc.take_runnable(Now::at(200, 1000)).is_empty());
        assert_eq!(fc.take_runnable(Now::at(230, 30_000)).len(), 1);
    }

    #[tokio::test]
    async fn test_command_agent_exit_status() {
        assert_eq!(CommandAgent::new("true").fence(3, 100).await, Ok(0));
        assert_eq!(CommandAgent::new("false").fence(3, 100).await, Ok(1));
        assert_eq!(
            CommandAgent::new("/nonexistent/fence_agent").fence(3, 100).await,
            Err(DlmError::FenceFailure)
        );
    }
}
