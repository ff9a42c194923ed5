//! # dlm-proto
//!
//! Protocol types, constants, and data structures for the DLM cluster
//! control daemon.
//!
//! This crate defines the fixed inter-node message header, the typed
//! message payloads carried behind it, error types, and the
//! administrative request/response types shared by `dlm_controld` and
//! `dlm_tool`.

pub mod admin;
pub mod constants;
pub mod defaults;
pub mod error;
pub mod header;
pub mod message;
pub mod node;

// Re-export commonly used types at the crate root
pub use error::{DlmError, DlmResult, ValidationError};
pub use header::{DlmHeader, MsgFlags, MsgType};
pub use message::Message;
pub use node::{LeaveReason, LockspaceState, NodeId, RingId};
