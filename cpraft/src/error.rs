use thiserror::Error;

use crate::types::{GroupId, LogIndex, MemberId, Term};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not the leader, current leader: {leader:?}")]
    NotLeader { leader: Option<MemberId> },

    #[error("group {0} is destroyed")]
    GroupDestroyed(GroupId),

    #[error("group {0} already exists")]
    DuplicateGroup(GroupId),

    #[error("operation timed out, outcome unknown")]
    Timeout,

    #[error("group {0} is unknown")]
    UnknownGroup(GroupId),

    #[error("group {group} failed: {reason}")]
    GroupFailed { group: GroupId, reason: String },

    #[error("membership change rejected: {0}")]
    MembershipChange(String),

    #[error("object {0} is destroyed")]
    ObjectDestroyed(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Errors that terminate the node of the affected group.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::GroupFailed { .. })
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("log corrupted: {0}")]
    Corrupted(String),

    #[error("entry {index} does not follow last index {last}")]
    NonContiguous { index: LogIndex, last: LogIndex },

    #[error("index {index} is compacted, log starts after {offset}")]
    Compacted { index: LogIndex, offset: LogIndex },
}

/// Protocol-internal rejections. Resolved inside the node and only logged.
#[derive(Debug, Error)]
pub(crate) enum Rejection {
    #[error("log inconsistency at {index}: leader term {expected}, local term {found:?}")]
    LogInconsistency {
        index: LogIndex,
        expected: Term,
        found: Option<Term>,
    },

    #[error("snapshot at {index} is not newer than commit index {commit}")]
    SnapshotInstallRejected { index: LogIndex, commit: LogIndex },

    #[error("message term {term} is behind current term {current}")]
    StaleTerm { term: Term, current: Term },
}
