/// DLM control daemon error types.
///
/// Protocol-level failures are represented by a single `Copy` enum so they
/// can be logged, carried in events, and returned to administrative
/// clients without allocation.

use serde::{Deserialize, Serialize};

/// Why an inter-node message was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum ValidationError {
    #[error("message truncated")]
    Truncated,
    #[error("incompatible protocol version")]
    BadVersion,
    #[error("unknown message type")]
    UnknownType,
    #[error("message addressed to another node")]
    WrongTarget,
    #[error("unknown lockspace global id")]
    UnknownLockspace,
    #[error("malformed payload")]
    BadPayload,
    #[error("sender does not match header")]
    BadSender,
}

/// Unified error type for all daemon operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum DlmError {
    #[error("invalid message: {0}")]
    Validation(ValidationError),
    #[error("fencing failed")]
    FenceFailure,
    #[error("lockspace recovery blocked")]
    RecoveryBlocked,
    #[error("kernel bridge error")]
    Bridge,
    #[error("message references a stale ring")]
    OrderingViolation,
    #[error("lock conflict")]
    LockConflict,
    #[error("no such lockspace")]
    NoLockspace,
    #[error("lockspace exists already")]
    LockspaceExists,
    #[error("lockspace is busy")]
    Busy,
    #[error("network error")]
    NetworkError,
    #[error("group communication error")]
    GroupError,
    #[error("invalid parameters")]
    InvalidParms,
    #[error("system error")]
    SystemError,
    #[error("I/O error")]
    Eio,
}

impl DlmError {
    /// Whether the error is a per-message protocol error that must be
    /// dropped and logged rather than propagated.
    pub fn is_protocol_local(self) -> bool {
        matches!(self, Self::Validation(_) | Self::OrderingViolation)
    }
}

impl From<ValidationError> for DlmError {
    fn from(e: ValidationError) -> Self {
        DlmError::Validation(e)
    }
}

/// Result type alias for daemon operations.
pub type DlmResult<T> = Result<T, DlmError>;

impl From<std::io::Error> for DlmError {
    fn from(_: std::io::Error) -> Self {
        DlmError::Eio
    }
}
