//! Delivery of protocol messages between the members of a group.
//!
//! The protocol tolerates loss, duplication and reordering, so a transport
//! only needs best-effort delivery into the target member's mailbox.

use fxhash::{FxHashMap, FxHashSet};
use std::sync::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;

use crate::raft::messages::Message;
use crate::types::{GroupId, MemberId};

pub trait Transport: Send + Sync {
    /// Routes messages for `member` of `group_id` into `mailbox`, replacing
    /// any previous registration.
    fn register(&self, group_id: &GroupId, member: MemberId, mailbox: Sender<Message>);

    fn unregister(&self, group_id: &GroupId, member: MemberId);

    /// Never blocks; undeliverable messages are dropped.
    fn send(&self, msg: Message);
}

#[derive(Default)]
struct Routes {
    mailboxes: FxHashMap<GroupId, FxHashMap<MemberId, Sender<Message>>>,
    isolated: FxHashSet<MemberId>,
    cut_links: FxHashSet<(MemberId, MemberId)>,
}

impl Routes {
    fn connected(&self, from: MemberId, to: MemberId) -> bool {
        !self.isolated.contains(&from)
            && !self.isolated.contains(&to)
            && !self.cut_links.contains(&(from, to))
    }
}

/// In-process network between the members hosted by this process. Messages
/// are encoded and decoded on the way, as between processes, and partitions
/// can be injected per member or per link.
#[derive(Default)]
pub struct LocalNetwork {
    routes: RwLock<Routes>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        LocalNetwork::default()
    }

    /// Drops all traffic from and to `member`, in every group.
    pub fn isolate(&self, member: MemberId) {
        log::info!("isolating member {}", member);
        self.routes.write().unwrap().isolated.insert(member);
    }

    pub fn reconnect(&self, member: MemberId) {
        log::info!("reconnecting member {}", member);
        self.routes.write().unwrap().isolated.remove(&member);
    }

    /// Drops traffic between `a` and `b` in both directions.
    pub fn cut_link(&self, a: MemberId, b: MemberId) {
        let mut routes = self.routes.write().unwrap();
        routes.cut_links.insert((a, b));
        routes.cut_links.insert((b, a));
    }

    pub fn heal(&self) {
        let mut routes = self.routes.write().unwrap();
        routes.isolated.clear();
        routes.cut_links.clear();
    }
}

impl Transport for LocalNetwork {
    fn register(&self, group_id: &GroupId, member: MemberId, mailbox: Sender<Message>) {
        self.routes
            .write()
            .unwrap()
            .mailboxes
            .entry(group_id.clone())
            .or_default()
            .insert(member, mailbox);
    }

    fn unregister(&self, group_id: &GroupId, member: MemberId) {
        let mut routes = self.routes.write().unwrap();
        if let Some(members) = routes.mailboxes.get_mut(group_id) {
            members.remove(&member);
            if members.is_empty() {
                routes.mailboxes.remove(group_id);
            }
        }
    }

    fn send(&self, msg: Message) {
        let routes = self.routes.read().unwrap();
        if !routes.connected(msg.from, msg.to) {
            return;
        }
        let mailbox = match routes
            .mailboxes
            .get(&msg.group_id)
            .and_then(|members| members.get(&msg.to))
        {
            Some(mailbox) => mailbox,
            None => {
                log::debug!(
                    "no route to member {} of group {}, dropping {}",
                    msg.to,
                    msg.group_id,
                    msg.body.kind()
                );
                return;
            }
        };
        let msg = match msg.encode().and_then(|bytes| Message::decode(&bytes)) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("raft message codec error: {}", e);
                return;
            }
        };
        match mailbox.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                log::warn!(
                    "mailbox of member {} in group {} is full, dropping {}",
                    msg.to,
                    msg.group_id,
                    msg.body.kind()
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::messages::MessageBody;
    use tokio::sync::mpsc;

    fn vote(group_id: &GroupId, from: MemberId, to: MemberId) -> Message {
        Message {
            group_id: group_id.clone(),
            from,
            to,
            term: 1,
            body: MessageBody::VoteResponse { granted: true },
        }
    }

    #[test]
    fn test_routes_by_group_and_member() {
        let network = LocalNetwork::new();
        let g1 = GroupId::new("g", 1);
        let g2 = GroupId::new("g", 2);
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        network.register(&g1, 2, tx1);
        network.register(&g2, 2, tx2);

        network.send(vote(&g1, 1, 2));
        network.send(vote(&g1, 1, 3));
        assert_eq!(rx1.try_recv().unwrap(), vote(&g1, 1, 2));
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());

        network.unregister(&g1, 2);
        network.send(vote(&g1, 1, 2));
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn test_partitions_drop_traffic() {
        let network = LocalNetwork::new();
        let group = GroupId::new("g", 1);
        let (tx, mut rx) = mpsc::channel(8);
        network.register(&group, 2, tx);

        network.isolate(1);
        network.send(vote(&group, 1, 2));
        assert!(rx.try_recv().is_err());

        network.reconnect(1);
        network.cut_link(2, 3);
        network.send(vote(&group, 3, 2));
        network.send(vote(&group, 1, 2));
        assert_eq!(rx.try_recv().unwrap().from, 1);
        assert!(rx.try_recv().is_err());

        network.heal();
        network.send(vote(&group, 3, 2));
        assert_eq!(rx.try_recv().unwrap().from, 3);
    }

    #[test]
    fn test_full_mailbox_drops_instead_of_blocking() {
        let network = LocalNetwork::new();
        let group = GroupId::new("g", 1);
        let (tx, mut rx) = mpsc::channel(1);
        network.register(&group, 2, tx);
        network.send(vote(&group, 1, 2));
        network.send(vote(&group, 3, 2));
        assert_eq!(rx.try_recv().unwrap().from, 1);
        assert!(rx.try_recv().is_err());
    }
}
