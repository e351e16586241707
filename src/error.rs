//! Crate-wide error type and the subset of wire error codes the core speaks.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RaftError>;

/// Error codes carried on the wire. Kept separate from
/// [`RaftError`] because responses must serialize a stable code even when
/// the local error has more context attached than the wire needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    Succeeded,
    LogGap,
    LogStale,
    TermOutOfDate,
    WaitingSnapshot,
    LeaderChanged,
    UnknownAppendLog,
    WalFail,
    BufferOverflow,
    TooManyRequests,
    HostStopped,
    NotReady,
    BadState,
    RpcException,
    InvalidPeer,
    SendingSnapshot,
    PersistSnapshotFailed,
    AtomicOpFailed,
    WriteBlocked,
    RaftStopped,
    RetryExhausted,
    UnknownPart,
}

/// The crate's single error currency. Every fallible public operation
/// returns `Result<T, RaftError>`.
#[derive(Error, Debug)]
pub enum RaftError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL append out of order: expected log id {expected}, got {got}")]
    AppendOutOfOrder { expected: i64, got: i64 },

    #[error("WAL append term went backwards: last term {last}, got {got}")]
    AppendTermRegressed { last: i64, got: i64 },

    #[error("rollback target {target} is below committed log id {committed}")]
    RollbackBelowCommitted { target: i64, committed: i64 },

    #[error("WAL corruption: {0}")]
    WalCorruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("log gap: leader needs to back up (follower committed={committed})")]
    LogGap { committed: i64 },

    #[error("log stale: request term {req_term} behind local term {local_term}")]
    LogStale { req_term: i64, local_term: i64 },

    #[error("term out of date: local term {local_term}, request term {req_term}")]
    TermOutOfDate { local_term: i64, req_term: i64 },

    #[error("waiting for snapshot install")]
    WaitingSnapshot,

    #[error("leader changed, currently known leader: {0:?}")]
    LeaderChanged(crate::ids::HostAddr),

    #[error("append log outcome unknown, leadership may have changed")]
    UnknownAppendLog,

    #[error("buffer overflow: pending batch at capacity")]
    BufferOverflow,

    #[error("too many outstanding requests to host")]
    TooManyRequests,

    #[error("host pipeline stopped")]
    HostStopped,

    #[error("partition not ready (status={0})")]
    NotReady(String),

    #[error("invalid state: {0}")]
    BadState(String),

    #[error("rpc exception: {0}")]
    RpcException(String),

    #[error("peer {0:?} is not a recognized member")]
    InvalidPeer(crate::ids::HostAddr),

    #[error("already sending a snapshot to this peer")]
    SendingSnapshot,

    #[error("failed to persist snapshot batch: {0}")]
    PersistSnapshotFailed(String),

    #[error("atomic op rejected by its pre-replication check")]
    AtomicOpFailed,

    #[error("state machine write blocked")]
    WriteBlocked,

    #[error("partition stopped")]
    RaftStopped,

    #[error("retries exhausted")]
    RetryExhausted,

    #[error("unknown (space, part)")]
    UnknownPart,

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl RaftError {
    /// Map to the wire-level [`ErrorCode`] carried in RPC responses.
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            RaftError::LogGap { .. } => ErrorCode::LogGap,
            RaftError::LogStale { .. } => ErrorCode::LogStale,
            RaftError::TermOutOfDate { .. } => ErrorCode::TermOutOfDate,
            RaftError::WaitingSnapshot => ErrorCode::WaitingSnapshot,
            RaftError::LeaderChanged(_) => ErrorCode::LeaderChanged,
            RaftError::UnknownAppendLog => ErrorCode::UnknownAppendLog,
            RaftError::Io(_) | RaftError::WalCorruption(_) => ErrorCode::WalFail,
            RaftError::BufferOverflow => ErrorCode::BufferOverflow,
            RaftError::TooManyRequests => ErrorCode::TooManyRequests,
            RaftError::HostStopped => ErrorCode::HostStopped,
            RaftError::NotReady(_) => ErrorCode::NotReady,
            RaftError::BadState(_)
            | RaftError::AppendOutOfOrder { .. }
            | RaftError::AppendTermRegressed { .. }
            | RaftError::RollbackBelowCommitted { .. } => ErrorCode::BadState,
            RaftError::RpcException(_) => ErrorCode::RpcException,
            RaftError::InvalidPeer(_) => ErrorCode::InvalidPeer,
            RaftError::SendingSnapshot => ErrorCode::SendingSnapshot,
            RaftError::PersistSnapshotFailed(_) => ErrorCode::PersistSnapshotFailed,
            RaftError::AtomicOpFailed => ErrorCode::AtomicOpFailed,
            RaftError::WriteBlocked => ErrorCode::WriteBlocked,
            RaftError::RaftStopped => ErrorCode::RaftStopped,
            RaftError::RetryExhausted => ErrorCode::RetryExhausted,
            RaftError::UnknownPart => ErrorCode::UnknownPart,
            RaftError::Serialization(_)
            | RaftError::LockPoisoned(_)
            | RaftError::ChannelClosed(_) => ErrorCode::BadState,
        }
    }
}

impl From<bincode::error::EncodeError> for RaftError {
    fn from(e: bincode::error::EncodeError) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for RaftError {
    fn from(e: bincode::error::DecodeError) -> Self {
        RaftError::Serialization(e.to_string())
    }
}
