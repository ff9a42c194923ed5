//! Lockspace subcommands: ls, plocks, join, leave.

use tabled::{Table, Tabled};

use dlm_proto::admin::{AdminRequest, AdminResponse, LockspaceSummary, PlockResourceSummary};

use crate::common::{exit_error, format_nodes, request, unexpected};

#[derive(Tabled)]
struct LockspaceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Id")]
    id: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Epoch")]
    epoch: u32,
    #[tabled(rename = "Members")]
    members: String,
    #[tabled(rename = "Wait Start")]
    pending_acks: String,
    #[tabled(rename = "Wait Fence")]
    pending_fences: String,
    #[tabled(rename = "Plocks")]
    plocks: usize,
}

impl From<&LockspaceSummary> for LockspaceRow {
    fn from(s: &LockspaceSummary) -> Self {
        Self {
            name: s.name.clone(),
            id: format!("{:08x}", s.global_id),
            state: s.state.to_string(),
            epoch: s.epoch,
            members: format_nodes(&s.members),
            pending_acks: format_nodes(&s.pending_acks),
            pending_fences: format_nodes(&s.pending_fences),
            plocks: s.plock_resources,
        }
    }
}

#[derive(Tabled)]
struct LockRow {
    #[tabled(rename = "Resource")]
    number: String,
    #[tabled(rename = "Owner")]
    owner: u32,
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "Range")]
    range: String,
    #[tabled(rename = "Node")]
    nodeid: u32,
    #[tabled(rename = "Pid")]
    pid: u32,
    #[tabled(rename = "Lock Owner")]
    lock_owner: String,
}

fn lock_rows(resources: &[PlockResourceSummary]) -> Vec<LockRow> {
    let mut rows = Vec::new();
    for r in resources {
        for l in &r.locks {
            rows.push(LockRow {
                number: format!("{:x}", r.number),
                owner: r.owner,
                mode: if l.ex { "WR" } else { "RD" }.to_string(),
                range: format!("{}-{}", l.start, l.end),
                nodeid: l.nodeid,
                pid: l.pid,
                lock_owner: format!("{:x}", l.owner),
            });
        }
        for w in &r.waiters {
            rows.push(LockRow {
                number: format!("{:x}", r.number),
                owner: r.owner,
                mode: if w.ex { "WR wait" } else { "RD wait" }.to_string(),
                range: format!("{}-{}", w.start, w.end),
                nodeid: w.nodeid,
                pid: w.pid,
                lock_owner: format!("{:x}", w.owner),
            });
        }
    }
    rows
}

fn print_detail(s: &LockspaceSummary) {
    println!("name          {}", s.name);
    println!("id            0x{:08x}", s.global_id);
    println!("state         {}", s.state);
    println!("ring          {}", s.ring_id);
    println!("epoch         {}", s.epoch);
    println!("started       {}", s.started_count);
    println!("change        seq {} queued {}", s.change_seq, s.change_queue_depth);
    println!("members       {}", format_nodes(&s.members));
    println!("wait start    {}", format_nodes(&s.pending_acks));
    println!("wait fence    {}", format_nodes(&s.pending_fences));
    println!(
        "flags         joining={} leaving={} kernel_stopped={} need_plocks={}",
        s.joining, s.leaving, s.kernel_stopped, s.need_plocks
    );
    println!("saved msgs    {}", s.saved_messages);
    println!("plock rsrcs   {}", s.plock_resources);
    if let Some(e) = s.recovery_error {
        println!("blocked       {}", e);
    }
}

pub async fn list(addr: &str, port: u16, name: Option<String>) {
    let summaries = match name {
        Some(name) => match request(addr, port, AdminRequest::LockspaceInfo { name }).await {
            Ok(AdminResponse::Lockspace(s)) => {
                print_detail(&s);
                return;
            }
            Ok(resp) => unexpected(resp),
            Err(e) => exit_error(&format!("lockspace info failed: {}", e)),
        },
        None => match request(addr, port, AdminRequest::ListLockspaces).await {
            Ok(AdminResponse::Lockspaces(l)) => l,
            Ok(resp) => unexpected(resp),
            Err(e) => exit_error(&format!("list failed: {}", e)),
        },
    };

    if summaries.is_empty() {
        println!("No lockspaces.");
        return;
    }
    let rows: Vec<LockspaceRow> = summaries.iter().map(LockspaceRow::from).collect();
    println!("{}", Table::new(&rows));
}

pub async fn plocks(addr: &str, port: u16, name: String) {
    match request(addr, port, AdminRequest::PlockDump { name }).await {
        Ok(AdminResponse::Plocks(resources)) => {
            let rows = lock_rows(&resources);
            if rows.is_empty() {
                println!("No plocks ({} resources).", resources.len());
                return;
            }
            println!("{}", Table::new(&rows));
        }
        Ok(resp) => unexpected(resp),
        Err(e) => exit_error(&format!("plock dump failed: {}", e)),
    }
}

pub async fn join(addr: &str, port: u16, name: String) {
    match request(addr, port, AdminRequest::Join { name: name.clone() }).await {
        Ok(AdminResponse::Ok) => println!("Joining lockspace {}", name),
        Ok(resp) => unexpected(resp),
        Err(e) => exit_error(&format!("join {} failed: {}", name, e)),
    }
}

pub async fn leave(addr: &str, port: u16, name: String) {
    match request(addr, port, AdminRequest::Leave { name: name.clone() }).await {
        Ok(AdminResponse::Ok) => println!("Leaving lockspace {}", name),
        Ok(resp) => unexpected(resp),
        Err(e) => exit_error(&format!("leave {} failed: {}", name, e)),
    }
}
