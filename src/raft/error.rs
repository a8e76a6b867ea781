use crate::error::FurrowError;
use crate::raft::fsm::Instruction;
use crate::raft::rpc::Message;

/// Failures reported by a group's consensus layer. These travel over the wire when a leader
/// answers a forwarded request, so they carry no foreign error types.
#[derive(Debug, Serialize, Deserialize, Clone, Hash, PartialEq, Eq, PartialOrd)]
pub enum RaftError {
    /// No leader is known, or the leader is handing off leadership.
    NoLeader,
    /// The group refused the request.
    Rejected,
    /// The entry was overwritten by a different leader before it committed.
    Aborted,
    /// The group is shutting down.
    Terminated,
    /// A joint configuration has not yet been left.
    ConfigChangeInFlight,
    MessageError { error_msg: String },
}

impl RaftError {
    /// Classify a failure on the linearizable read path.
    pub fn into_read_error(self) -> FurrowError {
        match self {
            RaftError::NoLeader => FurrowError::ReadDropped,
            RaftError::Rejected | RaftError::ConfigChangeInFlight => FurrowError::ReadRejected,
            RaftError::Aborted => FurrowError::ReadAborted,
            RaftError::Terminated | RaftError::MessageError { .. } => FurrowError::ReadTerminated,
        }
    }
}

impl From<RaftError> for FurrowError {
    fn from(err: RaftError) -> FurrowError {
        match err {
            RaftError::NoLeader => FurrowError::Dropped,
            RaftError::Rejected => FurrowError::Rejected,
            RaftError::Aborted => FurrowError::Aborted,
            RaftError::Terminated => FurrowError::Terminated,
            RaftError::ConfigChangeInFlight => FurrowError::ConfigChangeInFlight,
            RaftError::MessageError { error_msg } => FurrowError::Internal(error_msg),
        }
    }
}

impl From<tokio::sync::mpsc::error::SendError<Message>> for RaftError {
    fn from(err: tokio::sync::mpsc::error::SendError<Message>) -> Self {
        RaftError::MessageError {
            error_msg: err.to_string(),
        }
    }
}

impl From<tokio::sync::mpsc::error::SendError<Instruction>> for RaftError {
    fn from(err: tokio::sync::mpsc::error::SendError<Instruction>) -> Self {
        RaftError::MessageError {
            error_msg: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RaftError;
    use crate::error::FurrowError;

    #[test]
    fn classification() {
        assert_eq!(FurrowError::from(RaftError::NoLeader), FurrowError::Dropped);
        assert_eq!(RaftError::Aborted.into_read_error(), FurrowError::ReadAborted);
        assert_eq!(RaftError::NoLeader.into_read_error(), FurrowError::ReadDropped);
    }
}
