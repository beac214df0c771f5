//! Core data model shared by the log, the snapshot store and the protocol.

use serde_derive::{Deserialize, Serialize};
use std::fmt;

pub type MemberId = u64;
pub type Term = u64;
pub type LogIndex = u64;

/// Name of a consensus group. Never reused once destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId {
    name: String,
    id: u64,
}

impl GroupId {
    pub fn new(name: impl Into<String>, id: u64) -> Self {
        GroupId {
            name: name.into(),
            id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// File-system friendly form, used for per-group directories.
    pub(crate) fn dir_name(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}", name, self.id)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupLifecycleState {
    Active,
    Destroying,
    Destroyed,
}

/// Ordered, versioned member set. `index` is the log index of the entry
/// that introduced it (0 for the initial members).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub index: LogIndex,
    pub members: Vec<MemberId>,
}

impl Membership {
    pub fn new(index: LogIndex, mut members: Vec<MemberId>) -> Self {
        members.sort_unstable();
        members.dedup();
        Membership { index, members }
    }

    pub fn contains(&self, member: MemberId) -> bool {
        self.members.binary_search(&member).is_ok()
    }

    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn peers_of(&self, member: MemberId) -> Vec<MemberId> {
        self.members
            .iter()
            .copied()
            .filter(|m| *m != member)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by every new leader so earlier-term entries can commit.
    Noop,
    Operation(Vec<u8>),
    Membership(Vec<MemberId>),
    DestroyGroup,
}

impl EntryPayload {
    pub fn size(&self) -> usize {
        match self {
            EntryPayload::Operation(data) => data.len(),
            EntryPayload::Membership(members) => members.len() * 8,
            EntryPayload::Noop | EntryPayload::DestroyGroup => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, payload: EntryPayload) -> Self {
        LogEntry {
            index,
            term,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub membership: Membership,
    pub data: Vec<u8>,
}

/// Term and vote; must hit stable storage before the node answers an RPC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<MemberId>,
}
