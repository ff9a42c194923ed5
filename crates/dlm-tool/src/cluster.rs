//! Daemon-wide subcommands: status, dump, fence-ack.

use tabled::{Table, Tabled};

use dlm_proto::admin::{AdminRequest, AdminResponse, FenceSummary, NodeSummary};
use dlm_proto::node::NodeId;

use crate::common::{exit_error, format_nodes, format_time, request, unexpected};

#[derive(Tabled)]
struct FenceRow {
    #[tabled(rename = "Node")]
    nodeid: NodeId,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Failed")]
    failed: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Last Fenced")]
    fenced: String,
}

impl From<&FenceSummary> for FenceRow {
    fn from(f: &FenceSummary) -> Self {
        Self {
            nodeid: f.nodeid,
            state: f.state.clone(),
            failed: format_time(f.fail_walltime),
            attempts: f.attempts,
            fenced: format_time(f.last_fenced_walltime),
        }
    }
}

#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Node")]
    nodeid: NodeId,
    #[tabled(rename = "Member")]
    member: bool,
    #[tabled(rename = "Added")]
    added: String,
    #[tabled(rename = "Removed")]
    removed: String,
    #[tabled(rename = "Fail Reason")]
    reason: String,
    #[tabled(rename = "Check Fencing")]
    check_fencing: bool,
    #[tabled(rename = "Start Seq")]
    start_seq: u32,
}

impl From<&NodeSummary> for NodeRow {
    fn from(n: &NodeSummary) -> Self {
        Self {
            nodeid: n.nodeid,
            member: n.member,
            added: format_time(n.add_walltime),
            removed: format_time(n.remove_walltime),
            reason: n.fail_reason.map_or("-".to_string(), |r| r.to_string()),
            check_fencing: n.check_fencing,
            start_seq: n.last_start_seq,
        }
    }
}

fn version(v: [u16; 3]) -> String {
    format!("{}.{}.{}", v[0], v[1], v[2])
}

pub async fn status(addr: &str, port: u16, nodes: bool) {
    let status = match request(addr, port, AdminRequest::DaemonStatus).await {
        Ok(AdminResponse::DaemonStatus(s)) => s,
        Ok(resp) => unexpected(resp),
        Err(e) => exit_error(&format!("status failed: {}", e)),
    };

    println!("cluster       {}", status.cluster_name);
    println!("our node      {}", status.our_nodeid);
    println!("members       {}", format_nodes(&status.cluster_members));
    println!(
        "protocol      daemon {} plock {}",
        version(status.daemon_run_version),
        version(status.plock_run_version)
    );
    println!(
        "fence actor   {}",
        status.fence_actor.map_or("-".to_string(), |n| n.to_string())
    );
    if status.fence_failed {
        println!("fencing       FAILED, recovery blocked");
    }
    if !status.fencing.is_empty() {
        let rows: Vec<FenceRow> = status.fencing.iter().map(FenceRow::from).collect();
        println!();
        println!("{}", Table::new(&rows));
    }

    if !nodes {
        return;
    }
    let lockspaces = match request(addr, port, AdminRequest::ListLockspaces).await {
        Ok(AdminResponse::Lockspaces(l)) => l,
        Ok(resp) => unexpected(resp),
        Err(e) => exit_error(&format!("list failed: {}", e)),
    };
    for ls in lockspaces {
        let history = match request(addr, port, AdminRequest::LockspaceNodes { name: ls.name.clone() }).await {
            Ok(AdminResponse::Nodes(n)) => n,
            Ok(resp) => unexpected(resp),
            Err(e) => exit_error(&format!("nodes of {} failed: {}", ls.name, e)),
        };
        let rows: Vec<NodeRow> = history.iter().map(NodeRow::from).collect();
        println!();
        println!("lockspace {}", ls.name);
        println!("{}", Table::new(&rows));
    }
}

pub async fn dump(addr: &str, port: u16) {
    match request(addr, port, AdminRequest::Dump).await {
        Ok(AdminResponse::Dump(lines)) => {
            for line in lines {
                println!("{}", line);
            }
        }
        Ok(resp) => unexpected(resp),
        Err(e) => exit_error(&format!("dump failed: {}", e)),
    }
}

pub async fn fence_ack(addr: &str, port: u16, nodeid: NodeId) {
    match request(addr, port, AdminRequest::FenceAck { nodeid }).await {
        Ok(AdminResponse::Ok) => println!("Fencing of node {} acknowledged", nodeid),
        Ok(resp) => unexpected(resp),
        Err(e) => exit_error(&format!("fence ack failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlm_proto::node::LeaveReason;

    #[test]
    fn test_node_row() {
        let row = NodeRow::from(&NodeSummary {
            nodeid: 3,
            member: false,
            add_walltime: 0,
            remove_walltime: 60,
            fail_reason: Some(LeaveReason::NodeDown),
            check_fencing: true,
            fenced_monotime: 0,
            last_start_seq: 4,
        });
        assert_eq!(row.reason, "nodedown");
        assert_eq!(row.added, "-");
        assert_eq!(row.removed, "1970-01-01 00:01:00");
    }

    #[test]
    fn test_version() {
        assert_eq!(version([3, 1, 1]), "3.1.1");
    }
}
