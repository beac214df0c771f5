//! Messages exchanged between members of a group.
//!
//! Delivery is neither reliable nor ordered; every message carries the
//! sender's term so stale traffic can be recognised.

use serde_derive::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::types::{GroupId, LogEntry, LogIndex, MemberId, Membership, Term};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub group_id: GroupId,
    pub from: MemberId,
    pub to: MemberId,
    pub term: Term,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    VoteRequest {
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    VoteResponse {
        granted: bool,
    },
    /// Empty `entries` doubles as the leader heartbeat.
    AppendEntries {
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    /// On success `index` is the last index known to match the leader; on
    /// failure it echoes the rejected `prev_log_index`.
    AppendResponse {
        success: bool,
        index: LogIndex,
        last_log_index: LogIndex,
    },
    InstallSnapshot(SnapshotChunk),
    /// `next_offset` is the next byte the follower expects; `done` means the
    /// follower now holds state at least up to `last_included_index`.
    InstallSnapshotResponse {
        last_included_index: LogIndex,
        next_offset: u64,
        done: bool,
    },
}

/// A slice of the leader's latest snapshot, starting at byte `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub membership: Membership,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::VoteRequest { .. } => "vote_request",
            MessageBody::VoteResponse { .. } => "vote_response",
            MessageBody::AppendEntries { .. } => "append_entries",
            MessageBody::AppendResponse { .. } => "append_response",
            MessageBody::InstallSnapshot(_) => "install_snapshot",
            MessageBody::InstallSnapshotResponse { .. } => "install_snapshot_response",
        }
    }
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
