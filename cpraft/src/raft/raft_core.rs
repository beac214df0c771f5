//! Protocol state of one member of one group.
//!
//! `RaftCore` is a deterministic state machine driven from outside: the
//! owning node feeds it ticks, inbound messages and proposals, then drains
//! the outbound messages and applied results it produced. It never blocks
//! and never touches the network.

use fxhash::{FxHashMap, FxHashSet};
use rand::Rng;
use slog::{debug, info, o, warn, Logger};
use std::cmp;
use std::mem;
use std::sync::Arc;

use crate::config::RaftConfig;
use crate::error::{Error, Rejection, Result};
use crate::metrics::{ROLE_COUNTER_VEC, SNAPSHOT_COUNTER_VEC};
use crate::raft::messages::{Message, MessageBody, SnapshotChunk};
use crate::raft::snapshot::SnapshotStore;
use crate::raft::storage::Storage;
use crate::raft::StateMachine;
use crate::types::{
    EntryPayload, GroupId, HardState, LogEntry, LogIndex, MemberId, Membership, Role, Snapshot,
    Term,
};

/// Point-in-time view of a member, published after every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub member_id: MemberId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<MemberId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub first_index: LogIndex,
    pub last_index: LogIndex,
    pub snapshot_index: LogIndex,
    pub members: Vec<MemberId>,
}

/// Result of applying one committed entry. Entries without a state machine
/// operation produce an empty result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub index: LogIndex,
    pub term: Term,
    pub result: Vec<u8>,
}

/// Leader's view of one follower.
#[derive(Debug, Clone)]
struct Progress {
    match_index: LogIndex,
    next_index: LogIndex,
    // Send one batch at a time until the follower's position is known.
    probing: bool,
    recent_active: bool,
    // Byte offset of an in-flight snapshot transfer.
    snapshot_offset: Option<u64>,
}

impl Progress {
    fn new(next_index: LogIndex) -> Self {
        Progress {
            match_index: 0,
            next_index,
            probing: true,
            recent_active: true,
            snapshot_offset: None,
        }
    }
}

/// Snapshot being reassembled from chunks on a follower.
#[derive(Debug)]
struct IncomingSnapshot {
    index: LogIndex,
    term: Term,
    membership: Membership,
    data: Vec<u8>,
}

pub struct RaftCore<S: StateMachine> {
    id: MemberId,
    group_id: GroupId,
    cfg: RaftConfig,
    storage: Box<dyn Storage>,
    snapshots: Arc<dyn SnapshotStore>,
    state_machine: S,
    logger: Logger,

    term: Term,
    voted_for: Option<MemberId>,
    role: Role,
    leader: Option<MemberId>,

    // Latest membership in the log, and the latest one applied.
    membership: Membership,
    committed_membership: Membership,

    commit_index: LogIndex,
    last_applied: LogIndex,
    latest_snapshot: Option<Snapshot>,
    applied_bytes_since_snapshot: usize,
    // First index of the current leadership, the leader's no-op.
    term_start_index: LogIndex,

    votes: FxHashSet<MemberId>,
    rejections: FxHashSet<MemberId>,
    progress: FxHashMap<MemberId, Progress>,
    incoming_snapshot: Option<IncomingSnapshot>,

    election_elapsed: u32,
    heartbeat_elapsed: u32,
    randomized_election_timeout: u32,

    msgs: Vec<Message>,
    applied: Vec<Applied>,
    destroy_committed: bool,
}

impl<S: StateMachine> RaftCore<S> {
    /// Rebuilds a member from its persisted log, hard state and snapshot.
    /// `initial_members` is used until a snapshot or log entry says otherwise;
    /// it may be empty for a member that waits to be added.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: MemberId,
        group_id: GroupId,
        initial_members: Vec<MemberId>,
        cfg: RaftConfig,
        mut storage: Box<dyn Storage>,
        snapshots: Arc<dyn SnapshotStore>,
        mut state_machine: S,
        logger: Logger,
    ) -> Result<Self> {
        cfg.validate()?;
        let logger = logger.new(o!("group" => group_id.to_string(), "member" => id));
        let hs = storage.hard_state();
        let latest_snapshot = snapshots.load(&group_id)?;

        let mut committed_membership = Membership::new(0, initial_members);
        let mut snapshot_index = 0;
        if let Some(snapshot) = &latest_snapshot {
            let (index, term) = (snapshot.last_included_index, snapshot.last_included_term);
            state_machine
                .restore(index, term, &snapshot.data)
                .map_err(|e| Error::GroupFailed {
                    group: group_id.clone(),
                    reason: format!("snapshot restore failed: {}", e),
                })?;
            // A crash between saving a snapshot and compacting the log leaves
            // entries the snapshot already covers.
            if let Some(found) = storage.term_at(index) {
                if found != term && index >= storage.first_index() {
                    let first = storage.first_index();
                    storage.truncate_suffix_from(first)?;
                }
            }
            if storage.offset().0 < index {
                storage.truncate_prefix_up_to(index, term)?;
            }
            committed_membership = snapshot.membership.clone();
            snapshot_index = index;
        }
        if storage.offset().0 > snapshot_index {
            return Err(Error::GroupFailed {
                group: group_id,
                reason: format!(
                    "log is compacted up to {} but the latest snapshot is at {}",
                    storage.offset().0,
                    snapshot_index
                ),
            });
        }

        let mut core = RaftCore {
            id,
            group_id,
            cfg,
            storage,
            snapshots,
            state_machine,
            logger,
            term: hs.term,
            voted_for: hs.voted_for,
            role: Role::Follower,
            leader: None,
            membership: committed_membership.clone(),
            committed_membership,
            commit_index: snapshot_index,
            last_applied: snapshot_index,
            latest_snapshot,
            applied_bytes_since_snapshot: 0,
            term_start_index: 0,
            votes: FxHashSet::default(),
            rejections: FxHashSet::default(),
            progress: FxHashMap::default(),
            incoming_snapshot: None,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election_timeout: 0,
            msgs: Vec::new(),
            applied: Vec::new(),
            destroy_committed: false,
        };
        core.recompute_membership();
        core.reset_randomized_election_timeout();
        info!(core.logger, "member started";
            "term" => core.term,
            "last_index" => core.storage.last_index(),
            "snapshot_index" => snapshot_index,
            "members" => ?core.membership.members);
        Ok(core)
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn leader(&self) -> Option<MemberId> {
        self.leader
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.latest_snapshot
            .as_ref()
            .map_or(0, |s| s.last_included_index)
    }

    /// True once a replicated destroy entry has been applied. Nothing after
    /// it is applied.
    pub fn is_destroy_committed(&self) -> bool {
        self.destroy_committed
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            member_id: self.id,
            role: self.role,
            term: self.term,
            leader: self.leader,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            first_index: self.storage.first_index(),
            last_index: self.storage.last_index(),
            snapshot_index: self.snapshot_index(),
            members: self.membership.members.clone(),
        }
    }

    pub fn take_messages(&mut self) -> Vec<Message> {
        mem::take(&mut self.msgs)
    }

    pub fn take_applied(&mut self) -> Vec<Applied> {
        mem::take(&mut self.applied)
    }

    /// Read-only operation against local state, possibly stale.
    pub fn query(&self, data: &[u8]) -> Vec<u8> {
        self.state_machine.query(data)
    }

    /// Advances logical time by one tick.
    pub fn tick(&mut self) -> Result<()> {
        self.election_elapsed += 1;
        if self.role == Role::Leader {
            self.heartbeat_elapsed += 1;
            if self.election_elapsed >= self.cfg.election_tick {
                self.election_elapsed = 0;
                if self.cfg.check_quorum && !self.quorum_active() {
                    warn!(self.logger, "lost contact with a majority, stepping down";
                        "term" => self.term);
                    return self.become_follower(self.term, None);
                }
            }
            if self.heartbeat_elapsed >= self.cfg.heartbeat_tick {
                self.heartbeat_elapsed = 0;
                self.broadcast_append()?;
            }
            return Ok(());
        }
        if self.election_elapsed >= self.randomized_election_timeout {
            self.campaign()?;
        }
        Ok(())
    }

    /// Appends a new entry as leader and starts replicating it.
    pub fn propose(&mut self, payload: EntryPayload) -> Result<(LogIndex, Term)> {
        if self.role != Role::Leader {
            return Err(Error::NotLeader {
                leader: self.leader,
            });
        }
        if self.destroy_committed {
            return Err(Error::GroupDestroyed(self.group_id.clone()));
        }
        if let EntryPayload::Membership(members) = &payload {
            self.check_membership_change(members)?;
        }
        let index = self.storage.last_index() + 1;
        let term = self.term;
        self.append_entry(LogEntry::new(index, term, payload))?;
        self.maybe_commit()?;
        self.broadcast_append()?;
        Ok((index, term))
    }

    /// Handles one inbound message. Messages for another member or group are
    /// dropped.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        if msg.group_id != self.group_id || msg.to != self.id {
            warn!(self.logger, "dropping misrouted message";
                "kind" => msg.body.kind(), "to" => msg.to);
            return Ok(());
        }
        if msg.term < self.term {
            let rejection = Rejection::StaleTerm {
                term: msg.term,
                current: self.term,
            };
            debug!(self.logger, "{}", rejection; "kind" => msg.body.kind(), "from" => msg.from);
            self.reply_stale(msg);
            return Ok(());
        }
        if msg.term > self.term {
            let leader = match msg.body {
                MessageBody::AppendEntries { .. } | MessageBody::InstallSnapshot(_) => {
                    Some(msg.from)
                }
                _ => None,
            };
            self.become_follower(msg.term, leader)?;
        }

        let (from, term) = (msg.from, msg.term);
        match msg.body {
            MessageBody::VoteRequest {
                last_log_index,
                last_log_term,
            } => {
                let granted = self.on_vote_request(term, from, last_log_index, last_log_term)?;
                self.send(from, MessageBody::VoteResponse { granted });
            }
            MessageBody::VoteResponse { granted } => self.on_vote_response(from, granted)?,
            MessageBody::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let count = entries.len() as u64;
                let success = self.on_append_entries(
                    term,
                    from,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                )?;
                let index = if success {
                    prev_log_index + count
                } else {
                    prev_log_index
                };
                let last_log_index = self.storage.last_index();
                self.send(
                    from,
                    MessageBody::AppendResponse {
                        success,
                        index,
                        last_log_index,
                    },
                );
            }
            MessageBody::AppendResponse {
                success,
                index,
                last_log_index,
            } => self.on_append_response(from, success, index, last_log_index)?,
            MessageBody::InstallSnapshot(chunk) => {
                let last_included_index = chunk.last_included_index;
                let (next_offset, done) = self.on_install_snapshot(term, from, chunk)?;
                self.send(
                    from,
                    MessageBody::InstallSnapshotResponse {
                        last_included_index,
                        next_offset,
                        done,
                    },
                );
            }
            MessageBody::InstallSnapshotResponse {
                last_included_index,
                next_offset,
                done,
            } => self.on_install_snapshot_response(from, last_included_index, next_offset, done)?,
        }
        Ok(())
    }

    /// Decides a vote request. A vote is granted at most once per term, and
    /// only to a candidate whose `(last_log_term, last_log_index)` is at
    /// least as large as ours.
    pub fn on_vote_request(
        &mut self,
        term: Term,
        candidate: MemberId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> Result<bool> {
        if term < self.term {
            return Ok(false);
        }
        if term > self.term {
            self.become_follower(term, None)?;
        }
        let can_vote = self.voted_for.is_none() || self.voted_for == Some(candidate);
        let ours = (self.storage.last_term(), self.storage.last_index());
        let up_to_date = (last_log_term, last_log_index) >= ours;
        if !(can_vote && up_to_date) {
            debug!(self.logger, "rejected vote";
                "candidate" => candidate, "term" => term,
                "voted_for" => ?self.voted_for, "up_to_date" => up_to_date);
            return Ok(false);
        }
        if self.voted_for.is_none() {
            self.voted_for = Some(candidate);
            self.persist_hard_state()?;
        }
        self.election_elapsed = 0;
        debug!(self.logger, "granted vote"; "candidate" => candidate, "term" => term);
        Ok(true)
    }

    /// Follower side of log replication. Returns whether the entries were
    /// accepted; entries conflicting with the leader are replaced.
    pub fn on_append_entries(
        &mut self,
        leader_term: Term,
        leader_id: MemberId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Result<bool> {
        if leader_term < self.term {
            return Ok(false);
        }
        if leader_term > self.term || self.role != Role::Follower {
            self.become_follower(leader_term, Some(leader_id))?;
        }
        self.leader = Some(leader_id);
        self.election_elapsed = 0;

        let offset = self.storage.offset().0;
        if prev_log_index >= offset {
            let found = self.storage.term_at(prev_log_index);
            if found != Some(prev_log_term) {
                let rejection = Rejection::LogInconsistency {
                    index: prev_log_index,
                    expected: prev_log_term,
                    found,
                };
                debug!(self.logger, "{}", rejection; "leader" => leader_id);
                return Ok(false);
            }
        }

        let last_new = prev_log_index + entries.len() as u64;
        for entry in entries {
            // Covered by our snapshot, hence committed and matching.
            if entry.index <= offset {
                continue;
            }
            match self.storage.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    if entry.index <= self.commit_index {
                        return Err(self.failure(format!(
                            "leader {} conflicts with committed entry {}",
                            leader_id, entry.index
                        )));
                    }
                    info!(self.logger, "truncating conflicting suffix";
                        "from" => entry.index, "last_index" => self.storage.last_index());
                    self.storage.truncate_suffix_from(entry.index)?;
                    self.recompute_membership();
                    self.append_entry(entry)?;
                }
                None => self.append_entry(entry)?,
            }
        }

        let commit = cmp::min(leader_commit, last_new);
        if commit > self.commit_index {
            self.commit_index = commit;
            self.apply_committed()?;
        }
        Ok(true)
    }

    /// Follower side of chunked snapshot transfer. Returns the next byte
    /// offset expected and whether the snapshot is now in place.
    pub fn on_install_snapshot(
        &mut self,
        leader_term: Term,
        leader_id: MemberId,
        chunk: SnapshotChunk,
    ) -> Result<(u64, bool)> {
        if leader_term < self.term {
            return Ok((0, false));
        }
        if leader_term > self.term || self.role != Role::Follower {
            self.become_follower(leader_term, Some(leader_id))?;
        }
        self.leader = Some(leader_id);
        self.election_elapsed = 0;

        if chunk.last_included_index <= self.commit_index {
            let rejection = Rejection::SnapshotInstallRejected {
                index: chunk.last_included_index,
                commit: self.commit_index,
            };
            debug!(self.logger, "{}", rejection);
            self.incoming_snapshot = None;
            return Ok((0, true));
        }

        let same = matches!(&self.incoming_snapshot,
            Some(s) if s.index == chunk.last_included_index && s.term == chunk.last_included_term);
        if !same {
            if chunk.offset != 0 {
                return Ok((0, false));
            }
            self.incoming_snapshot = Some(IncomingSnapshot {
                index: chunk.last_included_index,
                term: chunk.last_included_term,
                membership: chunk.membership,
                data: Vec::new(),
            });
        }
        let incoming = match self.incoming_snapshot.as_mut() {
            Some(incoming) => incoming,
            None => return Ok((0, false)),
        };
        let received = incoming.data.len() as u64;
        if chunk.offset != received {
            return Ok((received, false));
        }
        incoming.data.extend_from_slice(&chunk.data);
        let received = incoming.data.len() as u64;
        if !chunk.done {
            return Ok((received, false));
        }

        if let Some(incoming) = self.incoming_snapshot.take() {
            self.install_snapshot(Snapshot {
                last_included_index: incoming.index,
                last_included_term: incoming.term,
                membership: incoming.membership,
                data: incoming.data,
            })?;
        }
        Ok((received, true))
    }

    /// Replaces local state with `snapshot`. Returns false, changing
    /// nothing, when the snapshot is not newer than what is committed here
    /// or than the stored snapshot.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<bool> {
        let index = snapshot.last_included_index;
        let term = snapshot.last_included_term;
        if index <= self.commit_index {
            let rejection = Rejection::SnapshotInstallRejected {
                index,
                commit: self.commit_index,
            };
            debug!(self.logger, "{}", rejection);
            return Ok(false);
        }
        if !self.snapshots.save(&self.group_id, &snapshot)? {
            debug!(self.logger, "stored snapshot is newer"; "index" => index);
            return Ok(false);
        }
        self.state_machine
            .restore(index, term, &snapshot.data)
            .map_err(|e| self.failure(format!("snapshot restore failed: {}", e)))?;

        if self.storage.term_at(index) != Some(term) {
            let first = self.storage.first_index();
            self.storage.truncate_suffix_from(first)?;
        }
        self.storage.truncate_prefix_up_to(index, term)?;

        self.commit_index = index;
        self.last_applied = index;
        self.applied_bytes_since_snapshot = 0;
        self.committed_membership = snapshot.membership.clone();
        self.latest_snapshot = Some(snapshot);
        self.recompute_membership();

        SNAPSHOT_COUNTER_VEC.with_label_values(&["installed"]).inc();
        info!(self.logger, "installed snapshot";
            "index" => index, "term" => term, "members" => ?self.membership.members);
        Ok(true)
    }

    /// Snapshots the applied state and compacts the log behind it. Returns
    /// the snapshot index, or None when nothing was applied since the last
    /// snapshot.
    pub fn take_snapshot(&mut self) -> Result<Option<LogIndex>> {
        let index = self.last_applied;
        if index == 0 || index <= self.snapshot_index() {
            return Ok(None);
        }
        let term = match self.storage.term_at(index) {
            Some(term) => term,
            None => {
                return Err(self.failure(format!("applied entry {} is missing from the log", index)))
            }
        };
        let snapshot = Snapshot {
            last_included_index: index,
            last_included_term: term,
            membership: self.committed_membership.clone(),
            data: self.state_machine.snapshot(),
        };
        self.snapshots.save(&self.group_id, &snapshot)?;
        self.storage.truncate_prefix_up_to(index, term)?;
        let size = snapshot.data.len();
        self.latest_snapshot = Some(snapshot);
        self.applied_bytes_since_snapshot = 0;

        SNAPSHOT_COUNTER_VEC.with_label_values(&["taken"]).inc();
        info!(self.logger, "took snapshot"; "index" => index, "term" => term, "bytes" => size);
        Ok(Some(index))
    }

    fn on_vote_response(&mut self, from: MemberId, granted: bool) -> Result<()> {
        if self.role != Role::Candidate || !self.membership.contains(from) {
            return Ok(());
        }
        if granted {
            self.votes.insert(from);
        } else {
            self.rejections.insert(from);
        }
        let majority = self.membership.majority();
        let granted = self
            .membership
            .members
            .iter()
            .filter(|m| self.votes.contains(*m))
            .count();
        if granted >= majority {
            self.become_leader()?;
        } else if self.rejections.len() >= majority {
            info!(self.logger, "lost election"; "term" => self.term);
            self.become_follower(self.term, None)?;
        }
        Ok(())
    }

    fn on_append_response(
        &mut self,
        from: MemberId,
        success: bool,
        index: LogIndex,
        last_log_index: LogIndex,
    ) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let last_index = self.storage.last_index();
        let pr = match self.progress.get_mut(&from) {
            Some(pr) => pr,
            None => return Ok(()),
        };
        pr.recent_active = true;
        let send_more = if success {
            pr.match_index = cmp::max(pr.match_index, index);
            pr.next_index = cmp::max(pr.next_index, index + 1);
            pr.probing = false;
            pr.next_index <= last_index
        } else {
            if pr.snapshot_offset.is_some() {
                return Ok(());
            }
            if last_log_index < pr.match_index {
                // The follower restarted without its log.
                warn!(self.logger, "follower log is behind its acknowledged index";
                    "from" => from, "match_index" => pr.match_index, "last_log_index" => last_log_index);
                pr.match_index = last_log_index;
            } else if index < pr.match_index {
                return Ok(());
            }
            pr.next_index = cmp::max(pr.match_index + 1, cmp::min(index, last_log_index + 1));
            pr.probing = true;
            true
        };
        if success {
            self.maybe_commit()?;
        }
        if send_more && self.role == Role::Leader {
            self.send_append(from)?;
        }
        Ok(())
    }

    fn on_install_snapshot_response(
        &mut self,
        from: MemberId,
        last_included_index: LogIndex,
        next_offset: u64,
        done: bool,
    ) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let current = self.snapshot_index();
        let pr = match self.progress.get_mut(&from) {
            Some(pr) => pr,
            None => return Ok(()),
        };
        pr.recent_active = true;
        if pr.snapshot_offset.is_none() {
            return Ok(());
        }
        if last_included_index != current {
            // A newer snapshot replaced the one being sent.
            pr.snapshot_offset = Some(0);
        } else if done {
            pr.snapshot_offset = None;
            pr.match_index = cmp::max(pr.match_index, last_included_index);
            pr.next_index = last_included_index + 1;
            pr.probing = true;
        } else {
            pr.snapshot_offset = Some(next_offset);
        }
        if done && last_included_index == current {
            info!(self.logger, "snapshot transfer finished";
                "to" => from, "index" => last_included_index);
            self.maybe_commit()?;
        }
        if self.role == Role::Leader {
            self.send_append(from)?;
        }
        Ok(())
    }

    fn reply_stale(&mut self, msg: Message) {
        let body = match msg.body {
            MessageBody::VoteRequest { .. } => MessageBody::VoteResponse { granted: false },
            MessageBody::AppendEntries { prev_log_index, .. } => MessageBody::AppendResponse {
                success: false,
                index: prev_log_index,
                last_log_index: self.storage.last_index(),
            },
            MessageBody::InstallSnapshot(chunk) => MessageBody::InstallSnapshotResponse {
                last_included_index: chunk.last_included_index,
                next_offset: 0,
                done: false,
            },
            _ => return,
        };
        self.send(msg.from, body);
    }

    fn check_membership_change(&self, members: &[MemberId]) -> Result<()> {
        if self.membership.index > self.commit_index {
            return Err(Error::MembershipChange(
                "another membership change is in progress".into(),
            ));
        }
        if self.commit_index < self.term_start_index {
            return Err(Error::MembershipChange(
                "leader has not committed an entry in its term yet".into(),
            ));
        }
        let proposed = Membership::new(0, members.to_vec());
        if proposed.members.is_empty() {
            return Err(Error::MembershipChange("membership must not be empty".into()));
        }
        let added = proposed
            .members
            .iter()
            .filter(|m| !self.membership.contains(**m))
            .count();
        let removed = self
            .membership
            .members
            .iter()
            .filter(|m| !proposed.contains(**m))
            .count();
        if added + removed > 1 {
            return Err(Error::MembershipChange(format!(
                "only one member may change at a time, {:?} -> {:?}",
                self.membership.members, proposed.members
            )));
        }
        Ok(())
    }

    fn campaign(&mut self) -> Result<()> {
        if !self.membership.contains(self.id) {
            self.election_elapsed = 0;
            return Ok(());
        }
        self.become_candidate()?;
        info!(self.logger, "starting election"; "term" => self.term);
        if self.membership.majority() <= 1 {
            return self.become_leader();
        }
        let last_log_index = self.storage.last_index();
        let last_log_term = self.storage.last_term();
        for peer in self.membership.peers_of(self.id) {
            self.send(
                peer,
                MessageBody::VoteRequest {
                    last_log_index,
                    last_log_term,
                },
            );
        }
        Ok(())
    }

    fn become_follower(&mut self, term: Term, leader: Option<MemberId>) -> Result<()> {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.persist_hard_state()?;
        }
        let previous = self.role;
        self.role = Role::Follower;
        self.leader = leader;
        self.election_elapsed = 0;
        self.votes.clear();
        self.rejections.clear();
        self.progress.clear();
        self.reset_randomized_election_timeout();
        if previous != Role::Follower {
            ROLE_COUNTER_VEC.with_label_values(&[Role::Follower.as_str()]).inc();
            info!(self.logger, "became follower";
                "term" => self.term, "previous" => previous.as_str(), "leader" => ?leader);
        }
        Ok(())
    }

    fn become_candidate(&mut self) -> Result<()> {
        self.term += 1;
        self.voted_for = Some(self.id);
        self.persist_hard_state()?;
        self.role = Role::Candidate;
        self.leader = None;
        self.election_elapsed = 0;
        self.votes.clear();
        self.rejections.clear();
        self.votes.insert(self.id);
        self.progress.clear();
        self.reset_randomized_election_timeout();
        ROLE_COUNTER_VEC.with_label_values(&[Role::Candidate.as_str()]).inc();
        Ok(())
    }

    fn become_leader(&mut self) -> Result<()> {
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        self.votes.clear();
        self.rejections.clear();
        let next_index = self.storage.last_index() + 1;
        self.progress = self
            .membership
            .peers_of(self.id)
            .into_iter()
            .map(|peer| (peer, Progress::new(next_index)))
            .collect();
        ROLE_COUNTER_VEC.with_label_values(&[Role::Leader.as_str()]).inc();
        info!(self.logger, "became leader"; "term" => self.term, "last_index" => next_index - 1);

        self.term_start_index = next_index;
        self.append_entry(LogEntry::new(next_index, self.term, EntryPayload::Noop))?;
        self.maybe_commit()?;
        self.broadcast_append()
    }

    fn persist_hard_state(&mut self) -> Result<()> {
        self.storage.set_hard_state(HardState {
            term: self.term,
            voted_for: self.voted_for,
        })?;
        Ok(())
    }

    fn reset_randomized_election_timeout(&mut self) {
        let timeout = self.cfg.election_tick;
        self.randomized_election_timeout = rand::thread_rng().gen_range(timeout..2 * timeout);
    }

    /// Counts members heard from since the last check and clears the marks.
    fn quorum_active(&mut self) -> bool {
        let mut active = 0;
        for member in &self.membership.members {
            if *member == self.id {
                active += 1;
            } else if let Some(pr) = self.progress.get_mut(member) {
                if pr.recent_active {
                    active += 1;
                }
                pr.recent_active = false;
            }
        }
        active >= self.membership.majority()
    }

    fn append_entry(&mut self, entry: LogEntry) -> Result<()> {
        if let EntryPayload::Membership(members) = &entry.payload {
            self.membership = Membership::new(entry.index, members.clone());
            info!(self.logger, "membership changed";
                "index" => entry.index, "members" => ?self.membership.members);
            if self.role == Role::Leader {
                self.sync_progress(entry.index);
            }
        }
        self.storage.append(entry)?;
        Ok(())
    }

    fn sync_progress(&mut self, next_index: LogIndex) {
        let membership = self.membership.clone();
        for peer in membership.peers_of(self.id) {
            self.progress
                .entry(peer)
                .or_insert_with(|| Progress::new(next_index));
        }
        self.progress.retain(|id, _| membership.contains(*id));
    }

    /// Membership in effect is the latest one anywhere in the log.
    fn recompute_membership(&mut self) {
        let mut membership = self.committed_membership.clone();
        let from = cmp::max(self.storage.first_index(), membership.index + 1);
        for index in from..=self.storage.last_index() {
            if let Some(LogEntry {
                payload: EntryPayload::Membership(members),
                ..
            }) = self.storage.entry_at(index)
            {
                membership = Membership::new(index, members);
            }
        }
        self.membership = membership;
    }

    fn maybe_commit(&mut self) -> Result<()> {
        if self.role != Role::Leader || self.membership.members.is_empty() {
            return Ok(());
        }
        let last_index = self.storage.last_index();
        let mut matched: Vec<LogIndex> = self
            .membership
            .members
            .iter()
            .map(|m| {
                if *m == self.id {
                    last_index
                } else {
                    self.progress.get(m).map_or(0, |pr| pr.match_index)
                }
            })
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[self.membership.majority() - 1];
        // Only entries of the current term are committed by counting.
        if candidate > self.commit_index && self.storage.term_at(candidate) == Some(self.term) {
            self.commit_index = candidate;
            self.apply_committed()?;
        }
        Ok(())
    }

    fn apply_committed(&mut self) -> Result<()> {
        let destroyed_before = self.destroy_committed;
        while self.last_applied < self.commit_index && !self.destroy_committed {
            let index = self.last_applied + 1;
            let entry = match self.storage.entry_at(index) {
                Some(entry) => entry,
                None => {
                    return Err(
                        self.failure(format!("committed entry {} is missing from the log", index))
                    )
                }
            };
            self.applied_bytes_since_snapshot += entry.payload.size();
            let result = match entry.payload {
                EntryPayload::Noop => Vec::new(),
                EntryPayload::Operation(data) => self.state_machine.apply(index, &data),
                EntryPayload::Membership(members) => {
                    self.committed_membership = Membership::new(index, members);
                    Vec::new()
                }
                EntryPayload::DestroyGroup => {
                    info!(self.logger, "destroy entry applied"; "index" => index);
                    self.destroy_committed = true;
                    Vec::new()
                }
            };
            self.last_applied = index;
            self.applied.push(Applied {
                index,
                term: entry.term,
                result,
            });
            if self.should_snapshot() {
                self.take_snapshot()?;
            }
        }

        if self.destroy_committed && !destroyed_before && self.role == Role::Leader {
            // The leader stops after this step; followers must see the commit.
            self.broadcast_append()?;
        }

        if self.role == Role::Leader
            && self.committed_membership.index == self.membership.index
            && !self.membership.contains(self.id)
        {
            info!(self.logger, "removed from the group, stepping down"; "term" => self.term);
            self.become_follower(self.term, None)?;
        }
        Ok(())
    }

    fn should_snapshot(&self) -> bool {
        let entries = self.last_applied - self.snapshot_index();
        (self.cfg.snapshot_entry_threshold > 0 && entries >= self.cfg.snapshot_entry_threshold)
            || (self.cfg.snapshot_size_threshold > 0
                && self.applied_bytes_since_snapshot >= self.cfg.snapshot_size_threshold)
    }

    fn broadcast_append(&mut self) -> Result<()> {
        for peer in self.membership.peers_of(self.id) {
            self.send_append(peer)?;
        }
        Ok(())
    }

    fn send_append(&mut self, to: MemberId) -> Result<()> {
        let (next_index, probing, snapshot_offset) = match self.progress.get(&to) {
            Some(pr) => (pr.next_index, pr.probing, pr.snapshot_offset),
            None => return Ok(()),
        };
        if let Some(offset) = snapshot_offset {
            return self.send_snapshot_chunk(to, offset);
        }
        let next_index = cmp::min(next_index, self.storage.last_index() + 1);
        let prev_log_index = next_index - 1;
        let prev_log_term = match self.storage.term_at(prev_log_index) {
            Some(term) => term,
            None => {
                info!(self.logger, "follower is behind the log, sending snapshot";
                    "to" => to, "next_index" => next_index, "snapshot_index" => self.snapshot_index());
                if let Some(pr) = self.progress.get_mut(&to) {
                    pr.snapshot_offset = Some(0);
                }
                return self.send_snapshot_chunk(to, 0);
            }
        };
        let entries = self.storage.entries(next_index, self.cfg.max_append_entries);
        let sent = entries.len() as u64;
        let leader_commit = self.commit_index;
        self.send(
            to,
            MessageBody::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            },
        );
        if let Some(pr) = self.progress.get_mut(&to) {
            pr.next_index = if probing { next_index } else { next_index + sent };
        }
        Ok(())
    }

    fn send_snapshot_chunk(&mut self, to: MemberId, offset: u64) -> Result<()> {
        if self.latest_snapshot.is_none() {
            self.latest_snapshot = self.snapshots.load(&self.group_id)?;
        }
        let snapshot = match &self.latest_snapshot {
            Some(snapshot) => snapshot,
            None => return Err(self.failure("log is compacted but no snapshot is stored".into())),
        };
        let len = snapshot.data.len() as u64;
        let start = cmp::min(offset, len);
        let end = cmp::min(start + self.cfg.snapshot_chunk_size as u64, len);
        let chunk = SnapshotChunk {
            last_included_index: snapshot.last_included_index,
            last_included_term: snapshot.last_included_term,
            membership: snapshot.membership.clone(),
            offset: start,
            data: snapshot.data[start as usize..end as usize].to_vec(),
            done: end == len,
        };
        self.send(to, MessageBody::InstallSnapshot(chunk));
        Ok(())
    }

    fn send(&mut self, to: MemberId, body: MessageBody) {
        self.msgs.push(Message {
            group_id: self.group_id.clone(),
            from: self.id,
            to,
            term: self.term,
            body,
        });
    }

    fn failure(&self, reason: String) -> Error {
        Error::GroupFailed {
            group: self.group_id.clone(),
            reason,
        }
    }
}
