//! Kernel plock device (`/dev/misc/dlm_plock`).
//!
//! The kernel hands each POSIX lock request on a DLM-backed file system
//! to user space as one fixed-size `dlm_plock_info` record, and expects
//! the same record back with `rv` filled in. Records are in host byte
//! order.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use dlm_proto::constants::PLOCK_PROTO_VER;
use dlm_proto::error::{DlmError, DlmResult};
use dlm_proto::message::{PlockInfo, PlockOp};

use super::PlockReply;
use crate::daemon::DaemonEvent;

/// Size of `struct dlm_plock_info`.
pub const PLOCK_INFO_SIZE: usize = 64;

const OP_LOCK: u8 = 1;
const OP_UNLOCK: u8 = 2;
const OP_GET: u8 = 3;

/// Set on unlocks issued when a file is closed; the kernel expects no reply.
pub const FL_CLOSE: u8 = 1;

/// A request read from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelPlock {
    pub info: PlockInfo,
    pub flags: u8,
}

impl KernelPlock {
    pub fn wants_reply(&self) -> bool {
        self.flags & FL_CLOSE == 0
    }
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_ne_bytes(b)
}

fn i32_at(buf: &[u8], off: usize) -> i32 {
    u32_at(buf, off) as i32
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_ne_bytes(b)
}

/// Decode one device record.
pub fn decode(buf: &[u8; PLOCK_INFO_SIZE]) -> DlmResult<KernelPlock> {
    let major = u32_at(buf, 0);
    if major != PLOCK_PROTO_VER[0] as u32 {
        warn!("plock device version {} unsupported", major);
        return Err(DlmError::InvalidParms);
    }
    let op = match buf[12] {
        OP_LOCK => PlockOp::Lock,
        OP_UNLOCK => PlockOp::Unlock,
        OP_GET => PlockOp::Get,
        other => {
            warn!("plock device optype {} unknown", other);
            return Err(DlmError::InvalidParms);
        }
    };
    let nodeid = i32_at(buf, 20);
    if nodeid < 0 {
        return Err(DlmError::InvalidParms);
    }

    Ok(KernelPlock {
        info: PlockInfo {
            op,
            ex: buf[13] != 0,
            wait: buf[14] != 0,
            pid: u32_at(buf, 16),
            nodeid: nodeid as u32,
            fsid: u32_at(buf, 28),
            number: u64_at(buf, 32),
            start: u64_at(buf, 40),
            end: u64_at(buf, 48),
            owner: u64_at(buf, 56),
        },
        flags: buf[15],
    })
}

/// Encode a request record, as the kernel would write it.
pub fn encode(info: &PlockInfo, flags: u8, rv: i32) -> [u8; PLOCK_INFO_SIZE] {
    let mut buf = [0u8; PLOCK_INFO_SIZE];
    for (i, v) in PLOCK_PROTO_VER.iter().enumerate() {
        buf[i * 4..i * 4 + 4].copy_from_slice(&(*v as u32).to_ne_bytes());
    }
    buf[12] = match info.op {
        PlockOp::Lock => OP_LOCK,
        PlockOp::Unlock => OP_UNLOCK,
        PlockOp::Get => OP_GET,
    };
    buf[13] = info.ex as u8;
    buf[14] = info.wait as u8;
    buf[15] = flags;
    buf[16..20].copy_from_slice(&info.pid.to_ne_bytes());
    buf[20..24].copy_from_slice(&(info.nodeid as i32).to_ne_bytes());
    buf[24..28].copy_from_slice(&rv.to_ne_bytes());
    buf[28..32].copy_from_slice(&info.fsid.to_ne_bytes());
    buf[32..40].copy_from_slice(&info.number.to_ne_bytes());
    buf[40..48].copy_from_slice(&info.start.to_ne_bytes());
    buf[48..56].copy_from_slice(&info.end.to_ne_bytes());
    buf[56..64].copy_from_slice(&info.owner.to_ne_bytes());
    buf
}

/// Encode a reply. A get that found a conflict reports the conflicting
/// lock in place of the requested range.
pub fn encode_reply(reply: &PlockReply) -> [u8; PLOCK_INFO_SIZE] {
    let mut info = reply.info;
    let mut rv = reply.rv;
    if let Some(c) = reply.conflict {
        info.start = c.start;
        info.end = c.end;
        info.ex = c.ex;
        info.pid = c.pid;
        info.nodeid = c.nodeid;
        rv = 1;
    }
    encode(&info, 0, rv)
}

/// Write side of the device, shared with the kernel bridge.
pub struct PlockWriter {
    file: Mutex<File>,
}

impl PlockWriter {
    pub async fn write_reply(&self, reply: &PlockReply) -> DlmResult<()> {
        let buf = encode_reply(reply);
        let mut file = self.file.lock().await;
        file.write_all(&buf).await.map_err(|e| {
            error!("plock device write failed: {}", e);
            DlmError::Bridge
        })
    }
}

/// Open the device for reading requests and writing replies.
pub async fn open(path: &Path) -> DlmResult<(File, PlockWriter)> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| {
            error!("cannot open plock device {}: {}", path.display(), e);
            DlmError::Bridge
        })?;
    let writer = file.try_clone()?;
    info!("opened plock device {}", path.display());
    Ok((
        File::from_std(file),
        PlockWriter {
            file: Mutex::new(File::from_std(writer)),
        },
    ))
}

/// Forward kernel requests to the event loop until the device closes.
pub fn spawn_reader(mut file: File, event_tx: mpsc::Sender<DaemonEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; PLOCK_INFO_SIZE];
        loop {
            if let Err(e) = file.read_exact(&mut buf).await {
                error!("plock device read failed: {}", e);
                break;
            }
            let req = match decode(&buf) {
                Ok(req) => req,
                Err(_) => continue,
            };
            let event = DaemonEvent::LocalPlock {
                global_id: req.info.fsid,
                info: req.info,
                reply: req.wants_reply(),
            };
            if event_tx.send(event).await.is_err() {
                break;
            }
        }
        debug!("plock device reader exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlm_proto::message::LockImage;

    fn info() -> PlockInfo {
        PlockInfo {
            op: PlockOp::Lock,
            number: 0x1234,
            start: 10,
            end: 19,
            ex: true,
            wait: true,
            nodeid: 2,
            owner: 0xfeed,
            pid: 4242,
            fsid: 0xabcd,
        }
    }

    #[test]
    fn test_record_layout() {
        let buf = encode(&info(), FL_CLOSE, -11);
        assert_eq!(u32_at(&buf, 0), 1);
        assert_eq!(u32_at(&buf, 4), 2);
        assert_eq!(buf[12], OP_LOCK);
        assert_eq!(&buf[13..16], &[1, 1, FL_CLOSE]);
        assert_eq!(u32_at(&buf, 16), 4242);
        assert_eq!(i32_at(&buf, 24), -11);
        assert_eq!(u32_at(&buf, 28), 0xabcd);
        assert_eq!(u64_at(&buf, 32), 0x1234);
        assert_eq!(u64_at(&buf, 56), 0xfeed);

        let req = decode(&buf).unwrap();
        assert_eq!(req.info, info());
        assert!(!req.wants_reply());
    }

    #[test]
    fn test_reject_bad_records() {
        let mut buf = encode(&info(), 0, 0);
        buf[12] = 9;
        assert_eq!(decode(&buf), Err(DlmError::InvalidParms));

        let mut buf = encode(&info(), 0, 0);
        buf[0..4].copy_from_slice(&7u32.to_ne_bytes());
        assert_eq!(decode(&buf), Err(DlmError::InvalidParms));
    }

    #[test]
    fn test_get_conflict_reply() {
        let mut get = info();
        get.op = PlockOp::Get;
        let reply = PlockReply {
            info: get,
            rv: 0,
            conflict: Some(LockImage {
                start: 0,
                end: 99,
                ex: false,
                nodeid: 3,
                owner: 1,
                pid: 7,
            }),
        };
        let buf = encode_reply(&reply);
        let back = decode(&buf).unwrap().info;
        assert_eq!(i32_at(&buf, 24), 1);
        assert_eq!((back.start, back.end, back.ex, back.nodeid, back.pid), (0, 99, false, 3, 7));
        assert_eq!(back.owner, get.owner);
    }

    #[tokio::test]
    async fn test_writer_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlm_plock");
        std::fs::write(&path, b"").unwrap();
        let (_reader, writer) = open(&path).await.unwrap();
        let reply = PlockReply { info: info(), rv: 0, conflict: None };
        writer.write_reply(&reply).await.unwrap();
        writer.write_reply(&reply).await.unwrap();
        drop(writer);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 2 * PLOCK_INFO_SIZE);
        let mut rec = [0u8; PLOCK_INFO_SIZE];
        rec.copy_from_slice(&bytes[PLOCK_INFO_SIZE..]);
        assert_eq!(decode(&rec).unwrap().info, info());
    }
}
