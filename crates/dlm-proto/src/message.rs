/// Typed message payloads carried behind [`crate::header::DlmHeader`].
///
/// Payloads are bincode-encoded. The header's `msg_type` selects which
/// payload follows; [`Message::decode`] turns the pair back into a typed
/// value.

use serde::{Deserialize, Serialize};

use crate::error::{DlmError, DlmResult, ValidationError};
use crate::header::MsgType;
use crate::node::{NodeId, RingId};

/// Protocol versions a daemon supports, exchanged on the daemon group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInfo {
    pub daemon: [u16; 3],
    pub plock: [u16; 3],
}

/// Body of a start message: the sender's view of one membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartInfo {
    /// Ring the sender's change was opened for.
    pub ring_id: RingId,
    /// Last epoch the sender completed (0 if never started).
    pub epoch: u32,
    /// Number of times the sender's lockspace has started.
    pub started_count: u32,
    /// Members after the change, sorted.
    pub members: Vec<NodeId>,
    pub joined: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    /// Nodes that left without a clean leave since the last start,
    /// including ones that have already rejoined.
    pub failed: Vec<NodeId>,
}

/// POSIX lock operation requested by a kernel client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlockOp {
    Lock,
    Unlock,
    Get,
}

/// One plock request, as forwarded from the kernel and replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlockInfo {
    pub op: PlockOp,
    /// Resource number (inode) the lock applies to.
    pub number: u64,
    pub start: u64,
    pub end: u64,
    pub ex: bool,
    /// Block until granted (F_SETLKW) rather than fail on conflict.
    pub wait: bool,
    /// Node the request originated on.
    pub nodeid: NodeId,
    /// Lock owner on the originating node.
    pub owner: u64,
    pub pid: u32,
    pub fsid: u32,
}

/// A granted lock as carried in sync and bulk-data messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockImage {
    pub start: u64,
    pub end: u64,
    pub ex: bool,
    pub nodeid: NodeId,
    pub owner: u64,
    pub pid: u32,
}

/// Full state of one resource, used by bulk transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceImage {
    pub number: u64,
    pub owner: NodeId,
    pub locks: Vec<LockImage>,
    pub waiters: Vec<PlockInfo>,
}

/// Change of resource ownership (ownership mode only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlockOwn {
    pub number: u64,
    /// New owner, or 0 to request/announce release.
    pub owner: NodeId,
}

/// Removal of an unused resource by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlockDrop {
    pub number: u64,
}

/// A granted lock replayed by an owner giving up a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLock {
    pub number: u64,
    pub lock: LockImage,
}

/// One chunk of a full plock state transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlocksData {
    pub resources: Vec<ResourceImage>,
}

/// Outcome of a fence operation, broadcast by the fence actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FenceResultInfo {
    pub nodeid: NodeId,
    pub result: i32,
    /// Wall-clock seconds at which the fence completed.
    pub fence_walltime: u64,
}

/// Operator exemption of a node from the current fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FenceClearInfo {
    pub nodeid: NodeId,
}

/// A decoded message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Protocol(ProtocolInfo),
    Start(StartInfo),
    Plock(PlockInfo),
    PlockOwn(PlockOwn),
    PlockDrop(PlockDrop),
    PlockSyncLock(SyncLock),
    PlockSyncWaiter(PlockInfo),
    PlocksDone,
    PlocksData(PlocksData),
    FenceResult(FenceResultInfo),
    FenceClear(FenceClearInfo),
}

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, ValidationError> {
    bincode::deserialize(payload).map_err(|_| ValidationError::BadPayload)
}

fn encode<T: Serialize>(value: &T) -> DlmResult<Vec<u8>> {
    bincode::serialize(value).map_err(|_| DlmError::SystemError)
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Protocol(_) => MsgType::Protocol,
            Message::Start(_) => MsgType::Start,
            Message::Plock(_) => MsgType::Plock,
            Message::PlockOwn(_) => MsgType::PlockOwn,
            Message::PlockDrop(_) => MsgType::PlockDrop,
            Message::PlockSyncLock(_) => MsgType::PlockSyncLock,
            Message::PlockSyncWaiter(_) => MsgType::PlockSyncWaiter,
            Message::PlocksDone => MsgType::PlocksDone,
            Message::PlocksData(_) => MsgType::PlocksData,
            Message::FenceResult(_) => MsgType::FenceResult,
            Message::FenceClear(_) => MsgType::FenceClear,
        }
    }

    /// Decode the payload that followed a header of type `msg_type`.
    pub fn decode(msg_type: MsgType, payload: &[u8]) -> Result<Message, ValidationError> {
        Ok(match msg_type {
            MsgType::Protocol => Message::Protocol(decode(payload)?),
            MsgType::Start => Message::Start(decode(payload)?),
            MsgType::Plock => Message::Plock(decode(payload)?),
            MsgType::PlockOwn => Message::PlockOwn(decode(payload)?),
            MsgType::PlockDrop => Message::PlockDrop(decode(payload)?),
            MsgType::PlockSyncLock => Message::PlockSyncLock(decode(payload)?),
            MsgType::PlockSyncWaiter => Message::PlockSyncWaiter(decode(payload)?),
            MsgType::PlocksDone => Message::PlocksDone,
            MsgType::PlocksData => Message::PlocksData(decode(payload)?),
            MsgType::FenceResult => Message::FenceResult(decode(payload)?),
            MsgType::FenceClear => Message::FenceClear(decode(payload)?),
        })
    }

    /// Encode the payload for this message.
    pub fn encode(&self) -> DlmResult<Vec<u8>> {
        match self {
            Message::Protocol(v) => encode(v),
            Message::Start(v) => encode(v),
            Message::Plock(v) => encode(v),
            Message::PlockOwn(v) => encode(v),
            Message::PlockDrop(v) => encode(v),
            Message::PlockSyncLock(v) => encode(v),
            Message::PlockSyncWaiter(v) => encode(v),
            Message::PlocksDone => Ok(Vec::new()),
            Message::PlocksData(v) => encode(v),
            Message::FenceResult(v) => encode(v),
            Message::FenceClear(v) => encode(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{frame, parse, DlmHeader};

    #[test]
    fn test_start_through_frame() {
        let start = StartInfo {
            ring_id: RingId::new(1, 8),
            epoch: 3,
            started_count: 3,
            members: vec![1, 2],
            joined: vec![],
            removed: vec![3],
            failed: vec![3],
        };
        let msg = Message::Start(start.clone());
        let hd = DlmHeader::new(msg.msg_type(), 1, 77).with_data(4, 8);
        let buf = frame(&hd, &msg.encode().unwrap());

        let (parsed, payload) = parse(&buf).unwrap();
        assert_eq!(parsed, hd);
        assert_eq!(
            Message::decode(parsed.msg_type, payload).unwrap(),
            Message::Start(start)
        );
    }

    #[test]
    fn test_plocks_done_has_empty_payload() {
        assert!(Message::PlocksDone.encode().unwrap().is_empty());
        assert_eq!(
            Message::decode(MsgType::PlocksDone, &[]).unwrap(),
            Message::PlocksDone
        );
    }

    #[test]
    fn test_bad_payload() {
        assert_eq!(
            Message::decode(MsgType::Plock, &[1, 2, 3]),
            Err(ValidationError::BadPayload)
        );
        assert_eq!(
            Message::decode(MsgType::Start, &[]),
            Err(ValidationError::BadPayload)
        );
    }
}
