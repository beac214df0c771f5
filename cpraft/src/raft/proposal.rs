use std::collections::BTreeMap;
use std::mem;
use tokio::sync::oneshot;
use tokio::sync::oneshot::Receiver;
use tokio::sync::oneshot::Sender;

use crate::error::{Error, Result};
use crate::raft::raft_core::Applied;
use crate::types::{EntryPayload, LogIndex, MemberId, Term};

/// A submission waiting for its entry to be applied.
pub struct Proposal {
    pub payload: EntryPayload,
    // Set once the leader has appended it.
    pub proposed: LogIndex,
    pub term: Term,
    pub propose_success: Option<Sender<Result<Vec<u8>>>>,
}

impl Proposal {
    fn new(payload: EntryPayload) -> (Self, Receiver<Result<Vec<u8>>>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            payload,
            proposed: 0,
            term: 0,
            propose_success: Some(tx),
        };
        (proposal, rx)
    }

    pub fn operation(data: Vec<u8>) -> (Self, Receiver<Result<Vec<u8>>>) {
        Proposal::new(EntryPayload::Operation(data))
    }

    pub fn membership(members: Vec<MemberId>) -> (Self, Receiver<Result<Vec<u8>>>) {
        Proposal::new(EntryPayload::Membership(members))
    }

    pub fn destroy_group() -> (Self, Receiver<Result<Vec<u8>>>) {
        Proposal::new(EntryPayload::DestroyGroup)
    }

    /// Resolves the submitter; a submitter that gave up is ignored.
    pub fn complete(&mut self, result: Result<Vec<u8>>) {
        if let Some(sender) = self.propose_success.take() {
            let _ = sender.send(result);
        }
    }
}

/// Proposals appended by this member, keyed by log index. A member that led,
/// lost its suffix and leads again proposes at indexes it used before, so
/// arrival order says nothing about index order.
#[derive(Default)]
pub struct PendingProposals {
    by_index: BTreeMap<LogIndex, Proposal>,
}

impl PendingProposals {
    /// A proposal already waiting at the same index lost its entry to a
    /// newer term.
    pub fn insert(&mut self, proposal: Proposal, leader: Option<MemberId>) {
        if let Some(mut replaced) = self.by_index.insert(proposal.proposed, proposal) {
            replaced.complete(Err(Error::NotLeader { leader }));
        }
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    /// Resolves proposals whose index was applied. An entry applied with a
    /// different term replaced the proposal; indexes covered by
    /// `last_applied` without an applied entry were skipped by a snapshot
    /// install and have an unknown outcome.
    pub fn notice_applied(
        &mut self,
        applied: &[Applied],
        last_applied: LogIndex,
        leader: Option<MemberId>,
    ) {
        for entry in applied {
            if let Some(mut proposal) = self.by_index.remove(&entry.index) {
                if proposal.term == entry.term {
                    proposal.complete(Ok(entry.result.clone()));
                } else {
                    proposal.complete(Err(Error::NotLeader { leader }));
                }
            }
        }
        let pending = self.by_index.split_off(&(last_applied + 1));
        for (_, mut proposal) in mem::replace(&mut self.by_index, pending) {
            proposal.complete(Err(Error::Timeout));
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Proposal> {
        mem::take(&mut self.by_index).into_values()
    }
}
