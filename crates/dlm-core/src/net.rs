//! Async TCP helpers for the control socket.

use dlm_proto::{DlmError, DlmResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

/// Connect to a daemon's control socket.
pub async fn connect_to(addr: &str, port: u16) -> DlmResult<TcpStream> {
    let target = format!("{}:{}", addr, port);
    debug!("connecting to {}", target);

    let stream = TcpStream::connect(&target)
        .await
        .map_err(|_| DlmError::NetworkError)?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Create the control-socket listener.
pub async fn create_listen_socket(addr: SocketAddr) -> DlmResult<TcpListener> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("failed to bind control socket {}: {}", addr, e);
        DlmError::SystemError
    })?;

    debug!("control socket listening on {}", addr);
    Ok(listener)
}
