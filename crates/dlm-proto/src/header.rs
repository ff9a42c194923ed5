//! Fixed inter-node message header.
//!
//! Every message exchanged between daemons, on the daemon group or on a
//! lockspace group, starts with this 40-byte header in little-endian
//! byte order:
//!
//! ```text
//! offset  size  field
//!      0     6  version[3]   (u16 each)
//!      6     2  type
//!      8     4  nodeid       sender
//!     12     4  to_nodeid    recipient, 0 for all
//!     16     4  global_id    lockspace id, 0 for daemon messages
//!     20     4  flags
//!     24     4  msgdata      type specific (change seq, op seq, nodeid)
//!     28     4  msgdata2     type specific (ring seq, chunk index)
//!     32     8  pad
//! ```
//!
//! The payload that follows is type specific (see [`crate::message`]).

use serde::{Deserialize, Serialize};

use crate::constants::{
    DAEMON_GLOBAL_ID, DAEMON_PROTO_VER, DLM_HEADER_SIZE, DLM_MFLG_HAVEPLOCK, DLM_MFLG_JOINING,
    DLM_MFLG_NACK,
};
use crate::error::ValidationError;
use crate::node::NodeId;

/// Message types carried in the header.
///
/// Values 10-13 belong to the deadlock detector, which is not part of
/// this daemon; they are rejected as unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum MsgType {
    Protocol = 1,
    Start = 2,
    Plock = 3,
    PlockOwn = 4,
    PlockDrop = 5,
    PlockSyncLock = 6,
    PlockSyncWaiter = 7,
    PlocksDone = 8,
    PlocksData = 9,
    FenceResult = 14,
    FenceClear = 15,
}

impl MsgType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Protocol),
            2 => Some(Self::Start),
            3 => Some(Self::Plock),
            4 => Some(Self::PlockOwn),
            5 => Some(Self::PlockDrop),
            6 => Some(Self::PlockSyncLock),
            7 => Some(Self::PlockSyncWaiter),
            8 => Some(Self::PlocksDone),
            9 => Some(Self::PlocksData),
            14 => Some(Self::FenceResult),
            15 => Some(Self::FenceClear),
            _ => None,
        }
    }

    /// Messages exchanged on the daemon group rather than a lockspace group.
    pub fn is_daemon(self) -> bool {
        matches!(self, Self::Protocol | Self::FenceResult | Self::FenceClear)
    }

    /// Messages handled by the plock engine.
    pub fn is_plock(self) -> bool {
        matches!(
            self,
            Self::Plock
                | Self::PlockOwn
                | Self::PlockDrop
                | Self::PlockSyncLock
                | Self::PlockSyncWaiter
                | Self::PlocksDone
                | Self::PlocksData
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::Start => "start",
            Self::Plock => "plock",
            Self::PlockOwn => "plock_own",
            Self::PlockDrop => "plock_drop",
            Self::PlockSyncLock => "plock_sync_lock",
            Self::PlockSyncWaiter => "plock_sync_waiter",
            Self::PlocksDone => "plocks_done",
            Self::PlocksData => "plocks_data",
            Self::FenceResult => "fence_result",
            Self::FenceClear => "fence_clear",
        }
    }
}

/// Header flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsgFlags(pub u32);

impl MsgFlags {
    pub const JOINING: MsgFlags = MsgFlags(DLM_MFLG_JOINING);
    pub const HAVEPLOCK: MsgFlags = MsgFlags(DLM_MFLG_HAVEPLOCK);
    pub const NACK: MsgFlags = MsgFlags(DLM_MFLG_NACK);

    pub fn empty() -> Self {
        MsgFlags(0)
    }

    pub fn contains(self, other: MsgFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MsgFlags) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for MsgFlags {
    type Output = MsgFlags;

    fn bitor(self, rhs: MsgFlags) -> MsgFlags {
        MsgFlags(self.0 | rhs.0)
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlmHeader {
    pub version: [u16; 3],
    pub msg_type: MsgType,
    pub nodeid: NodeId,
    pub to_nodeid: NodeId,
    pub global_id: u32,
    pub flags: MsgFlags,
    pub msgdata: u32,
    pub msgdata2: u32,
}

impl DlmHeader {
    /// Build a broadcast header at the protocol version we run.
    pub fn new(msg_type: MsgType, nodeid: NodeId, global_id: u32) -> Self {
        Self {
            version: DAEMON_PROTO_VER,
            msg_type,
            nodeid,
            to_nodeid: 0,
            global_id,
            flags: MsgFlags::empty(),
            msgdata: 0,
            msgdata2: 0,
        }
    }

    pub fn to(mut self, nodeid: NodeId) -> Self {
        self.to_nodeid = nodeid;
        self
    }

    pub fn with_flags(mut self, flags: MsgFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_data(mut self, msgdata: u32, msgdata2: u32) -> Self {
        self.msgdata = msgdata;
        self.msgdata2 = msgdata2;
        self
    }

    /// Check a parsed header against the receiving node's context.
    ///
    /// `sender` is the node group communication says the message came from;
    /// `known_global` reports whether a lockspace with the given global id
    /// exists locally.
    pub fn validate(
        &self,
        sender: NodeId,
        our_nodeid: NodeId,
        known_global: impl FnOnce(u32) -> bool,
    ) -> Result<(), ValidationError> {
        if self.nodeid != sender {
            return Err(ValidationError::BadSender);
        }
        if self.to_nodeid != 0 && self.to_nodeid != our_nodeid {
            return Err(ValidationError::WrongTarget);
        }
        if self.msg_type.is_daemon() {
            if self.global_id != DAEMON_GLOBAL_ID {
                return Err(ValidationError::UnknownLockspace);
            }
            return Ok(());
        }
        if self.msg_type != MsgType::Start && !known_global(self.global_id) {
            return Err(ValidationError::UnknownLockspace);
        }
        Ok(())
    }
}

/// Serialize a header and payload into a single wire buffer.
pub fn frame(header: &DlmHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DLM_HEADER_SIZE + payload.len());
    for v in header.version {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf.extend_from_slice(&(header.msg_type as u16).to_le_bytes());
    buf.extend_from_slice(&header.nodeid.to_le_bytes());
    buf.extend_from_slice(&header.to_nodeid.to_le_bytes());
    buf.extend_from_slice(&header.global_id.to_le_bytes());
    buf.extend_from_slice(&header.flags.bits().to_le_bytes());
    buf.extend_from_slice(&header.msgdata.to_le_bytes());
    buf.extend_from_slice(&header.msgdata2.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Parse a wire buffer into its header and payload.
///
/// Only the major version has to match ours; minor and patch levels are
/// negotiated on the daemon group.
pub fn parse(buf: &[u8]) -> Result<(DlmHeader, &[u8]), ValidationError> {
    if buf.len() < DLM_HEADER_SIZE {
        return Err(ValidationError::Truncated);
    }

    let version = [read_u16(buf, 0), read_u16(buf, 2), read_u16(buf, 4)];
    if version[0] != DAEMON_PROTO_VER[0] {
        return Err(ValidationError::BadVersion);
    }

    let msg_type = MsgType::from_u16(read_u16(buf, 6)).ok_or(ValidationError::UnknownType)?;

    let header = DlmHeader {
        version,
        msg_type,
        nodeid: read_u32(buf, 8),
        to_nodeid: read_u32(buf, 12),
        global_id: read_u32(buf, 16),
        flags: MsgFlags(read_u32(buf, 20)),
        msgdata: read_u32(buf, 24),
        msgdata2: read_u32(buf, 28),
    };

    Ok((header, &buf[DLM_HEADER_SIZE..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DlmHeader {
        DlmHeader::new(MsgType::Start, 2, 0xdead_beef)
            .with_flags(MsgFlags::JOINING | MsgFlags::NACK)
            .with_data(7, 42)
    }

    #[test]
    fn test_frame_parse_roundtrip() {
        let hd = sample();
        let buf = frame(&hd, b"payload");
        assert_eq!(buf.len(), DLM_HEADER_SIZE + 7);

        let (parsed, payload) = parse(&buf).unwrap();
        assert_eq!(parsed, hd);
        assert_eq!(payload, b"payload");
        assert!(parsed.flags.contains(MsgFlags::JOINING));
        assert!(!parsed.flags.contains(MsgFlags::HAVEPLOCK));
    }

    #[test]
    fn test_parse_truncated() {
        let buf = frame(&sample(), &[]);
        for len in 0..DLM_HEADER_SIZE {
            assert_eq!(parse(&buf[..len]), Err(ValidationError::Truncated));
        }
    }

    #[test]
    fn test_parse_bad_version() {
        let mut buf = frame(&sample(), &[]);
        buf[0] = buf[0].wrapping_add(1);
        assert_eq!(parse(&buf), Err(ValidationError::BadVersion));

        // Minor version differences are accepted.
        let mut buf = frame(&sample(), &[]);
        buf[2] = 99;
        assert!(parse(&buf).is_ok());
    }

    #[test]
    fn test_parse_unknown_type() {
        let mut buf = frame(&sample(), &[]);
        // Deadlock cycle start is not handled by this daemon.
        buf[6] = 10;
        buf[7] = 0;
        assert_eq!(parse(&buf), Err(ValidationError::UnknownType));
    }

    #[test]
    fn test_validate() {
        let hd = sample();
        assert_eq!(hd.validate(3, 1, |_| true), Err(ValidationError::BadSender));

        let targeted = hd.to(5);
        assert_eq!(
            targeted.validate(2, 1, |_| true),
            Err(ValidationError::WrongTarget)
        );
        assert!(targeted.validate(2, 5, |_| true).is_ok());

        // Start messages are accepted for lockspaces we don't know yet.
        assert!(hd.validate(2, 1, |_| false).is_ok());

        let plock = DlmHeader::new(MsgType::Plock, 2, 9);
        assert_eq!(
            plock.validate(2, 1, |_| false),
            Err(ValidationError::UnknownLockspace)
        );
        assert!(plock.validate(2, 1, |id| id == 9).is_ok());

        let fence = DlmHeader::new(MsgType::FenceResult, 2, 9);
        assert_eq!(
            fence.validate(2, 1, |_| true),
            Err(ValidationError::UnknownLockspace)
        );
        let fence = DlmHeader::new(MsgType::FenceResult, 2, DAEMON_GLOBAL_ID);
        assert!(fence.validate(2, 1, |_| false).is_ok());
    }

    #[test]
    fn test_parse_garbage_never_panics() {
        let mut seed: u32 = 0x1234_5678;
        for len in 0..128 {
            let bytes: Vec<u8> = (0..len)
                .map(|_| {
                    seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
                    (seed >> 16) as u8
                })
                .collect();
            let _ = parse(&bytes);
        }
    }
}
