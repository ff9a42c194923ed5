//! Length-prefixed bincode framing.
//!
//! Wire format: `[u32 big-endian length][bincode(value)]`. Used for both
//! directions of the control socket.

use dlm_proto::defaults::DEFAULT_MAX_ADMIN_MESSAGE_SIZE;
use dlm_proto::{DlmError, DlmResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Write one framed value.
pub async fn write_frame<T: Serialize>(
    stream: &mut (impl AsyncWriteExt + Unpin),
    value: &T,
) -> DlmResult<()> {
    let data = bincode::serialize(value).map_err(|_| DlmError::SystemError)?;
    if data.len() > DEFAULT_MAX_ADMIN_MESSAGE_SIZE as usize {
        return Err(DlmError::InvalidParms);
    }
    stream
        .write_u32(data.len() as u32)
        .await
        .map_err(|_| DlmError::NetworkError)?;
    stream
        .write_all(&data)
        .await
        .map_err(|_| DlmError::NetworkError)?;
    stream.flush().await.map_err(|_| DlmError::NetworkError)?;
    Ok(())
}

/// Read one framed value.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before
/// a new frame started.
pub async fn read_frame<T: DeserializeOwned>(
    stream: &mut (impl AsyncReadExt + Unpin),
) -> DlmResult<Option<T>> {
    let len = match stream.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(_) => return Err(DlmError::NetworkError),
    };
    if len > DEFAULT_MAX_ADMIN_MESSAGE_SIZE {
        return Err(DlmError::InvalidParms);
    }

    let mut buf = vec![0u8; len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|_| DlmError::NetworkError)?;

    bincode::deserialize(&buf)
        .map(Some)
        .map_err(|_| DlmError::SystemError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlm_proto::admin::AdminRequest;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_frame(&mut a, &AdminRequest::Join { name: "gfs0".into() })
            .await
            .unwrap();
        drop(a);

        let req: AdminRequest = read_frame(&mut b).await.unwrap().unwrap();
        match req {
            AdminRequest::Join { name } => assert_eq!(name, "gfs0"),
            other => panic!("expected Join, got {:?}", other),
        }

        // Clean EOF between frames.
        let next: Option<AdminRequest> = read_frame(&mut b).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(DEFAULT_MAX_ADMIN_MESSAGE_SIZE + 1).await.unwrap();
        let res: DlmResult<Option<AdminRequest>> = read_frame(&mut b).await;
        assert_eq!(res.unwrap_err(), DlmError::InvalidParms);
    }
}
