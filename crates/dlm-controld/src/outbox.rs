//! Side effects produced by protocol handlers.
//!
//! Lockspace, plock and fencing code is pure with respect to I/O: every
//! handler appends what it wants done to an [`Outbox`], and the event
//! loop performs the work after the handler returns.

use dlm_proto::constants::{DAEMON_GROUP_NAME, LOCKSPACE_GROUP_PREFIX};
use dlm_proto::header::DlmHeader;
use dlm_proto::message::Message;

use crate::bridge::BridgeRequest;

/// A message to multicast on a group.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub group: String,
    pub header: DlmHeader,
    pub msg: Message,
}

/// Group membership requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupRequest {
    Join(String),
    Leave(String),
}

#[derive(Debug, Default)]
pub struct Outbox {
    pub messages: Vec<Outgoing>,
    pub bridge: Vec<BridgeRequest>,
    pub groups: Vec<GroupRequest>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, group: &str, header: DlmHeader, msg: Message) {
        self.messages.push(Outgoing {
            group: group.to_string(),
            header,
            msg,
        });
    }

    pub fn bridge(&mut self, req: BridgeRequest) {
        self.bridge.push(req);
    }

    /// Take the queued messages, leaving the rest in place.
    pub fn take_messages(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.messages)
    }
}

/// Group name of a lockspace.
pub fn lockspace_group(name: &str) -> String {
    format!("{}{}", LOCKSPACE_GROUP_PREFIX, name)
}

/// Lockspace name of a group, or `None` for the daemon group and
/// foreign groups.
pub fn group_lockspace(group: &str) -> Option<&str> {
    if group == DAEMON_GROUP_NAME {
        return None;
    }
    group.strip_prefix(LOCKSPACE_GROUP_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_names() {
        assert_eq!(lockspace_group("gfs0"), "dlm:ls:gfs0");
        assert_eq!(group_lockspace("dlm:ls:gfs0"), Some("gfs0"));
        assert_eq!(group_lockspace(DAEMON_GROUP_NAME), None);
        assert_eq!(group_lockspace("other"), None);
    }
}
