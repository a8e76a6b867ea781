use crate::raft::{Command, GroupId, LogIndex, NodeId};

#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Address {
    /// A remote peer.
    Peer(NodeId),
    /// The local node.
    Local,
    /// A local client.
    Client,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub group: GroupId,
    pub from: Address,
    pub to: Address,
    pub command: Command,
}

impl Message {
    pub fn new(group: GroupId, from: Address, to: Address, command: Command) -> Message {
        Message {
            group,
            from,
            to,
            command,
        }
    }
}

/// Opaque payload of a client proposal, tagged with the session it was issued under.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    data: Vec<u8>,
    session: Option<crate::raft::SessionTag>,
}

impl Proposal {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            session: None,
        }
    }

    pub fn with_session(data: Vec<u8>, session: crate::raft::SessionTag) -> Self {
        Self {
            data,
            session: Some(session),
        }
    }

    pub fn session(&self) -> Option<crate::raft::SessionTag> {
        self.session
    }

    pub fn get(self) -> Vec<u8> {
        self.data
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// The request was applied to the local state machine at `index`.
    Applied { index: LogIndex },
    /// A commit index that reflects every write acknowledged before the read was issued.
    ReadIndex(LogIndex),
    /// The request was accepted without a log entry.
    Done,
}

impl Response {
    pub fn index(&self) -> Option<LogIndex> {
        match self {
            Response::Applied { index } | Response::ReadIndex(index) => Some(*index),
            Response::Done => None,
        }
    }
}
