use crate::raft::GroupId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FurrowError>;

/// Errors surfaced to callers of the host and the record facades. The kinds are stable; callers
/// match on them to decide whether to retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FurrowError {
    #[error("record not found")]
    NotFound,
    #[error("deadline expired")]
    Timeout,
    #[error("cluster offline")]
    ClusterOffline,
    #[error("group {0} is not hosted on this node")]
    GroupMissing(GroupId),
    #[error("proposal dropped")]
    Dropped,
    #[error("proposal rejected")]
    Rejected,
    #[error("proposal aborted")]
    Aborted,
    #[error("group terminated")]
    Terminated,
    #[error("read aborted")]
    ReadAborted,
    #[error("read dropped")]
    ReadDropped,
    #[error("read rejected")]
    ReadRejected,
    #[error("read terminated")]
    ReadTerminated,
    #[error("a membership change is already in flight")]
    ConfigChangeInFlight,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("saved in some groups only: {0}")]
    PartialSaveConsistencyWarning(String),
    #[error("applied index moved backwards from {current} to {recovered}")]
    BackwardAppliedIndex { current: u64, recovered: u64 },
    #[error("unsupported query")]
    UnsupportedQuery,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl FurrowError {
    pub fn serialization(msg: impl ToString) -> Self {
        FurrowError::Serialization(msg.to_string())
    }

    pub fn internal(msg: impl ToString) -> Self {
        FurrowError::Internal(msg.to_string())
    }
}

impl From<std::io::Error> for FurrowError {
    fn from(err: std::io::Error) -> Self {
        FurrowError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for FurrowError {
    fn from(err: serde_json::Error) -> Self {
        FurrowError::Serialization(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for FurrowError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        FurrowError::Serialization(err.to_string())
    }
}

impl From<sled::Error> for FurrowError {
    fn from(err: sled::Error) -> Self {
        FurrowError::Storage(err.to_string())
    }
}

impl From<config::ConfigError> for FurrowError {
    fn from(err: config::ConfigError) -> Self {
        FurrowError::InvalidConfig(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for FurrowError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        FurrowError::Timeout
    }
}

impl From<tokio::task::JoinError> for FurrowError {
    fn from(err: tokio::task::JoinError) -> Self {
        FurrowError::Internal(err.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for FurrowError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        FurrowError::Terminated
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for FurrowError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        FurrowError::Terminated
    }
}

impl<T> From<tokio::sync::mpsc::error::TrySendError<T>> for FurrowError {
    fn from(err: tokio::sync::mpsc::error::TrySendError<T>) -> Self {
        match err {
            tokio::sync::mpsc::error::TrySendError::Full(_) => FurrowError::Rejected,
            tokio::sync::mpsc::error::TrySendError::Closed(_) => FurrowError::Terminated,
        }
    }
}

impl From<tokio::sync::broadcast::error::SendError<()>> for FurrowError {
    fn from(_: tokio::sync::broadcast::error::SendError<()>) -> Self {
        FurrowError::Terminated
    }
}
