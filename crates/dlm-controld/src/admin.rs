//! Control socket for `dlm_tool`.
//!
//! Each client connection is served by its own task:
//!   accept_loop → spawn(handle_client) → read_frame → event loop → write_frame
//!
//! Requests are answered by the event loop, so they observe the same
//! state as protocol handlers.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use dlm_core::frame::{read_frame, write_frame};
use dlm_proto::admin::AdminRequest;
use dlm_proto::error::{DlmError, DlmResult};

use crate::daemon::DaemonEvent;

/// Bind the control socket.
pub async fn listen(addr: SocketAddr) -> DlmResult<TcpListener> {
    let listener = dlm_core::net::create_listen_socket(addr).await?;
    info!("control socket on {}", addr);
    Ok(listener)
}

/// Accept loop: spawn a handler per client until the event loop exits.
pub async fn accept_loop(listener: TcpListener, event_tx: mpsc::Sender<DaemonEvent>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!("admin connection from {}", peer);
                        let tx = event_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, tx).await {
                                debug!("admin client {} disconnected: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("accept error: {}", e),
                }
            }
            _ = event_tx.closed() => {
                info!("control socket shutting down");
                break;
            }
        }
    }
}

async fn handle_client(mut stream: TcpStream, event_tx: mpsc::Sender<DaemonEvent>) -> DlmResult<()> {
    while let Some(req) = read_frame::<AdminRequest>(&mut stream).await? {
        debug!("admin request {:?}", req);
        let (reply, rx) = oneshot::channel();
        event_tx
            .send(DaemonEvent::Admin { req, reply })
            .await
            .map_err(|_| DlmError::SystemError)?;
        let resp = rx.await.map_err(|_| DlmError::SystemError)?;
        write_frame(&mut stream, &resp).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlm_proto::admin::AdminResponse;

    async fn request(stream: &mut TcpStream, req: &AdminRequest) -> DlmResult<AdminResponse> {
        write_frame(stream, req).await?;
        read_frame(stream).await?.ok_or(DlmError::NetworkError)
    }

    #[tokio::test]
    async fn test_requests_reach_event_loop() {
        let listener = listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(accept_loop(listener, tx));

        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if let DaemonEvent::Admin { req, reply } = ev {
                    let resp = match req {
                        AdminRequest::Dump => AdminResponse::Dump(vec!["hello".into()]),
                        _ => AdminResponse::Error(DlmError::NoLockspace),
                    };
                    reply.send(resp).unwrap();
                }
            }
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        match request(&mut stream, &AdminRequest::Dump).await.unwrap() {
            AdminResponse::Dump(lines) => assert_eq!(lines, vec!["hello".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
        match request(&mut stream, &AdminRequest::ListLockspaces).await.unwrap() {
            AdminResponse::Error(e) => assert_eq!(e, DlmError::NoLockspace),
            other => panic!("unexpected {:?}", other),
        }
    }
}
