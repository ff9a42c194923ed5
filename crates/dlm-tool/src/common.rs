//! Shared utilities for the dlm_tool CLI.
//!
//! Provides connection helpers, request/response framing, and formatting
//! functions used across all subcommands.

use dlm_core::frame::{read_frame, write_frame};
use dlm_proto::admin::{AdminRequest, AdminResponse};
use dlm_proto::error::{DlmError, DlmResult};
use dlm_proto::node::NodeId;
use tokio::net::TcpStream;
use tracing::debug;

/// Connect to dlm_controld's control socket.
pub async fn connect(addr: &str, port: u16) -> TcpStream {
    match dlm_core::net::connect_to(addr, port).await {
        Ok(s) => s,
        Err(_) => exit_error(&format!("cannot connect to dlm_controld at {}:{}", addr, port)),
    }
}

/// Send a request and read back the response.
pub async fn send_request(stream: &mut TcpStream, req: &AdminRequest) -> DlmResult<AdminResponse> {
    write_frame(stream, req).await?;
    read_frame(stream).await?.ok_or(DlmError::NetworkError)
}

/// Connect, send one request, and turn daemon-side errors into `Err`.
pub async fn request(addr: &str, port: u16, req: AdminRequest) -> DlmResult<AdminResponse> {
    let mut stream = connect(addr, port).await;
    debug!("request {:?}", req);
    match send_request(&mut stream, &req).await? {
        AdminResponse::Error(e) => Err(e),
        other => Ok(other),
    }
}

/// Compact node list: "1 2 3", or "-" when empty.
pub fn format_nodes(nodes: &[NodeId]) -> String {
    if nodes.is_empty() {
        return "-".to_string();
    }
    nodes
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format an epoch-seconds timestamp as a human-readable string.
pub fn format_time(epoch_secs: u64) -> String {
    if epoch_secs == 0 {
        return "-".to_string();
    }
    let days = epoch_secs / 86400;
    let rem = epoch_secs % 86400;
    let (year, month, day) = days_to_date(days);

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year,
        month,
        day,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Convert days since Unix epoch to (year, month, day).
fn days_to_date(days: u64) -> (u64, u64, u64) {
    // Algorithm from http://howardhinnant.github.io/date_algorithms.html
    let z = days + 719468;
    let era = z / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

/// Print an error message and exit.
pub fn exit_error(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}

/// Report an unexpected response variant and exit.
pub fn unexpected(resp: AdminResponse) -> ! {
    exit_error(&format!("unexpected response: {:?}", resp))
}
