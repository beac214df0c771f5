//! Raft node implementation
//! One task per group member owns the protocol state, the log and the state
//! machine; everything else talks to it through channels.

use std::mem;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::config::RaftConfig;
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleNotifier;
use crate::metrics;
use crate::raft::messages::Message;
use crate::raft::proposal::{PendingProposals, Proposal};
use crate::raft::raft_core::{Applied, NodeStatus, RaftCore};
use crate::raft::StateMachine;
use crate::transport::Transport;
use crate::types::{EntryPayload, GroupId, GroupLifecycleState, LogIndex, MemberId, Role};

// Bounded like the mailbox so a stalled node pushes back on submitters.
const PROPOSAL_CHANNEL_SIZE: usize = 1024;
const COMMAND_CHANNEL_SIZE: usize = 16;

pub(crate) enum Command {
    /// Local teardown: drain, mark destroyed, notify services.
    Destroy(oneshot::Sender<()>),
    /// Stops the task without destroying the group.
    Shutdown(oneshot::Sender<()>),
    TakeSnapshot(oneshot::Sender<Result<Option<LogIndex>>>),
    QueryLocal {
        data: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    },
}

/// State shared between a node task and its handles.
pub(crate) struct GroupStatus {
    lifecycle: RwLock<GroupLifecycleState>,
    node: RwLock<NodeStatus>,
    failure: RwLock<Option<String>>,
}

impl GroupStatus {
    fn new(node: NodeStatus) -> Self {
        GroupStatus {
            lifecycle: RwLock::new(GroupLifecycleState::Active),
            node: RwLock::new(node),
            failure: RwLock::new(None),
        }
    }

    pub(crate) fn lifecycle(&self) -> GroupLifecycleState {
        *self.lifecycle.read().unwrap()
    }

    fn mark_destroying(&self) {
        let mut lifecycle = self.lifecycle.write().unwrap();
        if *lifecycle == GroupLifecycleState::Active {
            *lifecycle = GroupLifecycleState::Destroying;
        }
    }

    /// Moves to `Destroyed`; false if some caller already did.
    pub(crate) fn mark_destroyed(&self) -> bool {
        let mut lifecycle = self.lifecycle.write().unwrap();
        if *lifecycle == GroupLifecycleState::Destroyed {
            return false;
        }
        *lifecycle = GroupLifecycleState::Destroyed;
        true
    }

    fn node(&self) -> NodeStatus {
        self.node.read().unwrap().clone()
    }

    fn failure(&self) -> Option<String> {
        self.failure.read().unwrap().clone()
    }
}

/// Raft node implementation
/// Owns one member of one group and drives it from mailbox, proposals,
/// commands and the tick timer.
pub struct Node<S: StateMachine> {
    core: RaftCore<S>,
    transport: Arc<dyn Transport>,
    my_mailbox: Receiver<Message>,
    proposals: Receiver<Proposal>,
    commands: Receiver<Command>,
    proposed: PendingProposals,
    status: Arc<GroupStatus>,
    notifier: Arc<LifecycleNotifier>,
    tick_interval: Duration,
}

impl<S: StateMachine> Node<S> {
    /// Registers the member with the transport and spawns its task on the
    /// current tokio runtime.
    pub fn start(
        core: RaftCore<S>,
        transport: Arc<dyn Transport>,
        notifier: Arc<LifecycleNotifier>,
        cfg: &RaftConfig,
    ) -> RaftNodeHandle {
        let group_id = core.group_id().clone();
        let member_id = core.id();
        let (mailbox_tx, my_mailbox) = mpsc::channel(cfg.mailbox_size);
        let (proposals_tx, proposals) = mpsc::channel(PROPOSAL_CHANNEL_SIZE);
        let (commands_tx, commands) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let status = Arc::new(GroupStatus::new(core.status()));
        transport.register(&group_id, member_id, mailbox_tx);

        let node = Node {
            core,
            transport,
            my_mailbox,
            proposals,
            commands,
            proposed: PendingProposals::default(),
            status: status.clone(),
            notifier,
            tick_interval: cfg.tick_interval(),
        };
        tokio::spawn(node.run_background_tasks());

        RaftNodeHandle {
            group_id,
            member_id,
            proposals: proposals_tx,
            commands: commands_tx,
            status,
        }
    }

    /// Main event loop. Exactly one event is handled per iteration, then
    /// the produced messages and applied entries are flushed.
    async fn run_background_tasks(mut self) {
        let mut ticker = time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                Some(msg) = self.my_mailbox.recv() => {
                    let mut step = self.core.step(msg);
                    while step.is_ok() {
                        match self.my_mailbox.try_recv() {
                            Ok(msg) => step = self.core.step(msg),
                            Err(_) => break,
                        }
                    }
                    step
                }
                Some(proposal) = self.proposals.recv() => {
                    let mut step = self.propose(proposal);
                    while step.is_ok() {
                        match self.proposals.try_recv() {
                            Ok(proposal) => step = self.propose(proposal),
                            Err(_) => break,
                        }
                    }
                    step
                }
                Some(command) = self.commands.recv() => match command {
                    Command::Destroy(ack) => {
                        self.on_ready();
                        self.destroy();
                        let _ = ack.send(());
                        return;
                    }
                    Command::Shutdown(ack) => {
                        self.shutdown();
                        let _ = ack.send(());
                        return;
                    }
                    Command::TakeSnapshot(reply) => match self.core.take_snapshot() {
                        Ok(index) => {
                            let _ = reply.send(Ok(index));
                            Ok(())
                        }
                        Err(e) => {
                            let _ = reply.send(Err(self.failed_error(e.to_string())));
                            Err(e)
                        }
                    },
                    Command::QueryLocal { data, reply } => {
                        let _ = reply.send(self.core.query(&data));
                        Ok(())
                    }
                },
                _ = ticker.tick() => self.core.tick(),
            };

            if let Err(e) = step {
                self.fail(e);
                return;
            }
            self.on_ready();
            if self.core.is_destroy_committed() {
                self.destroy();
                return;
            }
        }
    }

    /// Propose a new entry to the raft group
    /// Non-fatal rejections resolve the proposal right away.
    fn propose(&mut self, mut proposal: Proposal) -> Result<()> {
        let payload = mem::replace(&mut proposal.payload, EntryPayload::Noop);
        match self.core.propose(payload) {
            Ok((index, term)) => {
                proposal.proposed = index;
                proposal.term = term;
                self.proposed.insert(proposal, self.core.leader());
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                proposal.complete(Err(self.failed_error(e.to_string())));
                Err(e)
            }
            Err(e) => {
                proposal.complete(Err(e));
                Ok(())
            }
        }
    }

    /// Process raft ready state
    /// Sends outbound messages, resolves applied proposals and publishes the
    /// status snapshot read by handles.
    fn on_ready(&mut self) {
        for msg in self.core.take_messages() {
            self.transport.send(msg);
        }
        let applied = self.core.take_applied();
        self.notice_proposed(applied);
        *self.status.node.write().unwrap() = self.core.status();
    }

    /// Notify proposals about their status
    fn notice_proposed(&mut self, applied: Vec<Applied>) {
        let leader = self.core.leader();
        self.proposed
            .notice_applied(&applied, self.core.last_applied(), leader);
    }

    /// Fails everything pending with `error`, and stops accepting proposals.
    fn drain_proposals(&mut self, error: impl Fn() -> Error) {
        self.proposals.close();
        while let Ok(mut proposal) = self.proposals.try_recv() {
            proposal.complete(Err(error()));
        }
        for mut proposal in self.proposed.drain() {
            proposal.complete(Err(error()));
        }
    }

    fn destroy(&mut self) {
        let group_id = self.core.group_id().clone();
        self.status.mark_destroying();
        self.drain_proposals(|| Error::GroupDestroyed(group_id.clone()));
        self.transport.unregister(&group_id, self.core.id());
        if self.status.mark_destroyed() {
            log::info!("group {} destroyed on member {}", group_id, self.core.id());
            self.notifier.notify_group_destroy(&group_id);
        }
    }

    fn shutdown(&mut self) {
        let group_id = self.core.group_id().clone();
        let reason = format!("member {} shut down", self.core.id());
        self.drain_proposals(|| Error::GroupFailed {
            group: group_id.clone(),
            reason: reason.clone(),
        });
        self.transport.unregister(&group_id, self.core.id());
        log::info!("group {} stopped on member {}", group_id, self.core.id());
    }

    fn fail(&mut self, e: Error) {
        let group_id = self.core.group_id().clone();
        log::error!(
            "group {} failed on member {}, operator intervention required: {}",
            group_id,
            self.core.id(),
            e
        );
        let reason = e.to_string();
        *self.status.failure.write().unwrap() = Some(reason.clone());
        self.drain_proposals(|| Error::GroupFailed {
            group: group_id.clone(),
            reason: reason.clone(),
        });
        self.transport.unregister(&group_id, self.core.id());
    }

    fn failed_error(&self, reason: String) -> Error {
        Error::GroupFailed {
            group: self.core.group_id().clone(),
            reason,
        }
    }
}

/// Cloneable front end of a node task.
#[derive(Clone)]
pub struct RaftNodeHandle {
    group_id: GroupId,
    member_id: MemberId,
    proposals: Sender<Proposal>,
    commands: Sender<Command>,
    status: Arc<GroupStatus>,
}

impl RaftNodeHandle {
    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn status(&self) -> NodeStatus {
        self.status.node()
    }

    pub fn lifecycle(&self) -> GroupLifecycleState {
        self.status.lifecycle()
    }

    /// Reason of the fatal error that stopped this member, if any.
    pub fn failure(&self) -> Option<String> {
        self.status.failure()
    }

    pub fn is_leader(&self) -> bool {
        self.status().role == Role::Leader
    }

    pub fn leader(&self) -> Option<MemberId> {
        self.status().leader
    }

    /// Replicates `operation` and returns the state machine's result once it
    /// is applied on this member. On `Timeout` the operation may still
    /// commit later.
    pub async fn submit(&self, operation: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        metrics::record_metrics("submit", || async move {
            self.replicate(Proposal::operation(operation), timeout).await
        })
        .await
    }

    /// Adds or removes a single member.
    pub async fn change_membership(&self, members: Vec<MemberId>, timeout: Duration) -> Result<()> {
        metrics::record_metrics("change_membership", || async move {
            self.replicate(Proposal::membership(members), timeout).await
        })
        .await
        .map(|_| ())
    }

    /// Destroys the group on every member through the replicated log.
    pub async fn terminate(&self, timeout: Duration) -> Result<()> {
        self.replicate(Proposal::destroy_group(), timeout)
            .await
            .map(|_| ())
    }

    pub async fn take_snapshot(&self) -> Result<Option<LogIndex>> {
        self.check_available()?;
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::TakeSnapshot(tx)).await.is_err() {
            return Err(self.closed_error());
        }
        rx.await.map_err(|_| self.closed_error())?
    }

    /// Read-only operation against this member's state, possibly stale.
    pub async fn query_local(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        self.check_available()?;
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::QueryLocal { data, reply })
            .await
            .is_err()
        {
            return Err(self.closed_error());
        }
        rx.await.map_err(|_| self.closed_error())
    }

    async fn replicate(
        &self,
        (proposal, rx): (Proposal, oneshot::Receiver<Result<Vec<u8>>>),
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.check_available()?;
        let status = self.status();
        if status.role != Role::Leader {
            return Err(Error::NotLeader {
                leader: status.leader,
            });
        }
        let replicated = async {
            if self.proposals.send(proposal).await.is_err() {
                return Err(self.closed_error());
            }
            rx.await.map_err(|_| self.closed_error())?
        };
        match time::timeout(timeout, replicated).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Tears the member down locally and waits until lifecycle callbacks
    /// have run. Safe to call repeatedly.
    pub(crate) async fn destroy(&self) {
        if self.lifecycle() == GroupLifecycleState::Destroyed {
            return;
        }
        self.status.mark_destroying();
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Destroy(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub(crate) fn mark_destroyed(&self) -> bool {
        self.status.mark_destroyed()
    }

    pub(crate) async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.lifecycle() != GroupLifecycleState::Active {
            return Err(Error::GroupDestroyed(self.group_id.clone()));
        }
        if let Some(reason) = self.failure() {
            return Err(Error::GroupFailed {
                group: self.group_id.clone(),
                reason,
            });
        }
        Ok(())
    }

    fn closed_error(&self) -> Error {
        match self.failure() {
            Some(reason) => Error::GroupFailed {
                group: self.group_id.clone(),
                reason,
            },
            None if self.lifecycle() != GroupLifecycleState::Active => {
                Error::GroupDestroyed(self.group_id.clone())
            }
            None => Error::GroupFailed {
                group: self.group_id.clone(),
                reason: format!("member {} is stopped", self.member_id),
            },
        }
    }
}
