use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use cpraft::raft::discard_logger;
use cpraft::{
    AtomicRefService, AtomicRefStateMachine, Error, GroupId, GroupLifecycleState,
    LifecycleNotifier, LocalNetwork, LogIndex, MemberId, RaftConfig,
    RaftGroupLifecycleAwareService, RaftGroupManager, RaftNodeHandle, StateMachine, Term,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn test_config() -> RaftConfig {
    RaftConfig {
        tick_interval_ms: 10,
        election_tick: 10,
        heartbeat_tick: 2,
        ..Default::default()
    }
}

/// Keeps the last written value and the number of writes.
#[derive(Default)]
struct Register {
    value: Vec<u8>,
    writes: u64,
}

impl StateMachine for Register {
    fn apply(&mut self, _index: LogIndex, data: &[u8]) -> Vec<u8> {
        self.value = data.to_vec();
        self.writes += 1;
        self.writes.to_be_bytes().to_vec()
    }

    fn query(&self, _data: &[u8]) -> Vec<u8> {
        self.value.clone()
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&(self.writes, &self.value)).unwrap()
    }

    fn restore(&mut self, _last_index: LogIndex, _last_term: Term, data: &[u8]) -> anyhow::Result<()> {
        let (writes, value) = bincode::deserialize(data)?;
        self.writes = writes;
        self.value = value;
        Ok(())
    }
}

#[derive(Default)]
struct CountingService {
    destroyed: Mutex<Vec<GroupId>>,
}

impl CountingService {
    fn count(&self, group_id: &GroupId) -> usize {
        self.destroyed
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == group_id)
            .count()
    }
}

impl RaftGroupLifecycleAwareService for CountingService {
    fn on_group_destroy(&self, group_id: &GroupId) -> anyhow::Result<()> {
        self.destroyed.lock().unwrap().push(group_id.clone());
        Ok(())
    }
}

struct Member {
    manager: Arc<RaftGroupManager>,
    service: Arc<CountingService>,
}

struct Cluster {
    network: Arc<LocalNetwork>,
    config: RaftConfig,
    members: Vec<MemberId>,
    hosted: Vec<Member>,
}

impl Cluster {
    fn new(size: u64, config: RaftConfig) -> Self {
        let network = Arc::new(LocalNetwork::new());
        let members: Vec<MemberId> = (1..=size).collect();
        let mut cluster = Cluster {
            network,
            config,
            members: members.clone(),
            hosted: Vec::new(),
        };
        for member in members {
            let hosted = cluster.start_member(member);
            cluster.hosted.push(hosted);
        }
        cluster
    }

    fn start_member(&self, member: MemberId) -> Member {
        let notifier = Arc::new(LifecycleNotifier::new());
        let service = Arc::new(CountingService::default());
        notifier.register("counting", service.clone());
        let manager = RaftGroupManager::new(
            member,
            self.config.clone(),
            self.network.clone(),
            notifier,
        )
        .unwrap()
        .with_logger(discard_logger());
        Member {
            manager: Arc::new(manager),
            service,
        }
    }

    fn member(&self, member: MemberId) -> &Member {
        &self.hosted[(member - 1) as usize]
    }

    fn create_group<S, F>(&self, group_id: &GroupId, factory: F) -> Vec<RaftNodeHandle>
    where
        S: StateMachine,
        F: Fn() -> S,
    {
        self.hosted
            .iter()
            .map(|m| {
                m.manager
                    .create_group(group_id.clone(), self.members.clone(), |_| factory())
                    .unwrap()
            })
            .collect()
    }

    /// Replaces `member` with a fresh one that has lost all its state.
    async fn replace(&mut self, member: MemberId) {
        self.member(member).manager.shutdown().await;
        let fresh = self.start_member(member);
        self.hosted[(member - 1) as usize] = fresh;
    }
}

async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + TIMEOUT;
    while !condition().await {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_leader(handles: &[RaftNodeHandle]) -> RaftNodeHandle {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let leader = handles
            .iter()
            .filter(|h| h.is_leader())
            .max_by_key(|h| h.status().term);
        if let Some(leader) = leader {
            return leader.clone();
        }
        assert!(Instant::now() < deadline, "no leader elected");
        sleep(Duration::from_millis(10)).await;
    }
}

/// Submits through whichever member currently leads.
async fn submit(handles: &[RaftNodeHandle], data: Vec<u8>) -> cpraft::Result<Vec<u8>> {
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        for handle in handles.iter().filter(|h| h.is_leader()) {
            match handle.submit(data.clone(), TIMEOUT).await {
                Err(Error::NotLeader { .. }) | Err(Error::Timeout) => {}
                result => return result,
            }
        }
        if Instant::now() > deadline {
            return Err(Error::Timeout);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_atomic_ref_replicates_to_every_member() {
    let cluster = Cluster::new(3, test_config());
    let group = GroupId::new("refs", 1);
    let handles = cluster.create_group(&group, AtomicRefStateMachine::new);
    let services: Vec<_> = cluster
        .hosted
        .iter()
        .map(|m| AtomicRefService::new(&m.manager, TIMEOUT))
        .collect();

    let leader = wait_leader(&handles).await;
    let leader_service = &services[(leader.member_id() - 1) as usize];
    let proxy = leader_service.atomic_ref::<String>("x@refs").unwrap();
    proxy.set(&"hello".to_string()).await.unwrap();
    assert_eq!(proxy.get().await.unwrap(), Some("hello".to_string()));

    for service in &services {
        let replica = service.atomic_ref::<String>("x@refs").unwrap();
        eventually("replica to apply the write", || {
            let replica = replica.clone();
            async move { replica.get_local().await.unwrap() == Some("hello".to_string()) }
        })
        .await;
    }
    let commit = leader.status().commit_index;
    eventually("commit indexes to converge", || {
        let handles = handles.clone();
        async move { handles.iter().all(|h| h.status().commit_index == commit) }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_leader_is_replaced() {
    let cluster = Cluster::new(3, test_config());
    let group = GroupId::new("failover", 1);
    let handles = cluster.create_group(&group, Register::default);
    submit(&handles, b"before".to_vec()).await.unwrap();

    let old = wait_leader(&handles).await;
    let old_term = old.status().term;
    cluster.network.isolate(old.member_id());

    let others: Vec<RaftNodeHandle> = handles
        .iter()
        .filter(|h| h.member_id() != old.member_id())
        .cloned()
        .collect();
    eventually("a new leader among the connected members", || {
        let others = others.clone();
        async move {
            others
                .iter()
                .any(|h| h.is_leader() && h.status().term > old_term)
        }
    })
    .await;
    eventually("the isolated leader to step down", || {
        let old = old.clone();
        async move { !old.is_leader() }
    })
    .await;

    assert!(matches!(
        old.submit(b"lost".to_vec(), TIMEOUT).await,
        Err(Error::NotLeader { .. })
    ));
    submit(&others, b"after".to_vec()).await.unwrap();

    cluster.network.reconnect(old.member_id());
    eventually("the old leader to catch up", || {
        let old = old.clone();
        async move { old.query_local(Vec::new()).await.unwrap() == b"after".to_vec() }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lagging_member_catches_up_from_snapshot() {
    let config = RaftConfig {
        snapshot_entry_threshold: 10_000,
        snapshot_size_threshold: 0,
        ..test_config()
    };
    let mut cluster = Cluster::new(3, config);
    let group = GroupId::new("snapshots", 1);
    let handles = Arc::new(cluster.create_group(&group, Register::default));
    wait_leader(&handles).await;

    let mut tasks = Vec::new();
    for i in 0..9_999u32 {
        let handles = handles.clone();
        tasks.push(tokio::spawn(async move {
            submit(&handles, i.to_be_bytes().to_vec()).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    eventually("every member to snapshot at 10000", || {
        let handles = handles.clone();
        async move {
            handles.iter().all(|h| {
                let status = h.status();
                status.last_applied >= 10_000
                    && status.snapshot_index == 10_000
                    && status.first_index == 10_001
            })
        }
    })
    .await;

    let leader = wait_leader(&handles).await;
    let lagging = cluster
        .members
        .iter()
        .copied()
        .find(|m| *m != leader.member_id())
        .unwrap();
    cluster.replace(lagging).await;
    let fresh = cluster
        .member(lagging)
        .manager
        .create_group(group.clone(), cluster.members.clone(), |_| {
            Register::default()
        })
        .unwrap();

    let expected = leader.query_local(Vec::new()).await.unwrap();
    eventually("the fresh member to install the snapshot", || {
        let fresh = fresh.clone();
        let expected = expected.clone();
        async move {
            let status = fresh.status();
            status.snapshot_index == 10_000
                && fresh.query_local(Vec::new()).await.unwrap() == expected
        }
    })
    .await;

    let mut current: Vec<RaftNodeHandle> = handles
        .iter()
        .filter(|h| h.member_id() != lagging)
        .cloned()
        .collect();
    current.push(fresh.clone());
    submit(&current, b"later".to_vec()).await.unwrap();
    eventually("the fresh member to apply later entries", || {
        let fresh = fresh.clone();
        async move { fresh.query_local(Vec::new()).await.unwrap() == b"later".to_vec() }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_destroy_notifies_each_service_once() {
    let cluster = Cluster::new(3, test_config());
    let group = GroupId::new("doomed", 1);
    let handles = cluster.create_group(&group, Register::default);
    submit(&handles, b"x".to_vec()).await.unwrap();
    let leader = wait_leader(&handles).await;

    for m in &cluster.hosted {
        m.manager.destroy_group(&group).await.unwrap();
    }
    for m in &cluster.hosted {
        assert_eq!(m.service.count(&group), 1);
        assert!(m.manager.lookup(&group).is_none());
    }
    assert!(handles
        .iter()
        .all(|h| h.lifecycle() == GroupLifecycleState::Destroyed));
    assert!(matches!(
        leader.submit(b"y".to_vec(), TIMEOUT).await,
        Err(Error::GroupDestroyed(_))
    ));

    for m in &cluster.hosted {
        m.manager.destroy_group(&group).await.unwrap();
        assert_eq!(m.service.count(&group), 1);
    }
    assert!(matches!(
        cluster
            .member(1)
            .manager
            .create_group(group.clone(), cluster.members.clone(), |_| {
                Register::default()
            }),
        Err(Error::DuplicateGroup(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_destroy_interrupts_pending_submit() {
    let config = RaftConfig {
        election_tick: 100,
        ..test_config()
    };
    let cluster = Cluster::new(3, config);
    let group = GroupId::new("interrupted", 1);
    let handles = cluster.create_group(&group, Register::default);
    submit(&handles, b"committed".to_vec()).await.unwrap();
    let leader = wait_leader(&handles).await;

    // Without a quorum the next write cannot commit.
    cluster.network.isolate(leader.member_id());
    let pending = {
        let leader = leader.clone();
        tokio::spawn(async move { leader.submit(b"stuck".to_vec(), Duration::from_secs(30)).await })
    };
    sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished());

    cluster
        .member(leader.member_id())
        .manager
        .destroy_group(&group)
        .await
        .unwrap();
    let result = tokio::time::timeout(TIMEOUT, pending)
        .await
        .expect("pending submit was not interrupted")
        .unwrap();
    assert!(matches!(result, Err(Error::GroupDestroyed(_))));
    assert_eq!(cluster.member(leader.member_id()).service.count(&group), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminate_destroys_group_on_every_member() {
    let cluster = Cluster::new(3, test_config());
    let group = GroupId::new("terminated", 1);
    let handles = cluster.create_group(&group, Register::default);
    let leader = wait_leader(&handles).await;

    leader.terminate(TIMEOUT).await.unwrap();
    eventually("every member to destroy the group", || {
        let handles = handles.clone();
        async move {
            handles
                .iter()
                .all(|h| h.lifecycle() == GroupLifecycleState::Destroyed)
        }
    })
    .await;

    for m in &cluster.hosted {
        assert_eq!(m.service.count(&group), 1);
        assert!(m.manager.lookup(&group).is_none());
        assert!(m.manager.groups().is_empty());
        m.manager.destroy_group(&group).await.unwrap();
        assert_eq!(m.service.count(&group), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_backed_cluster_recovers_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = RaftConfig {
        data_dir: Some(dir.path().to_path_buf()),
        snapshot_entry_threshold: 20,
        ..test_config()
    };
    let mut cluster = Cluster::new(3, config);
    let group = GroupId::new("durable", 1);
    let handles = cluster.create_group(&group, Register::default);
    for i in 0..50u32 {
        submit(&handles, i.to_be_bytes().to_vec()).await.unwrap();
    }
    let leader = wait_leader(&handles).await;
    let (committed, term) = (leader.status().commit_index, leader.status().term);

    for m in &cluster.hosted {
        m.manager.shutdown().await;
    }
    let restarted: Vec<Member> = cluster
        .members
        .iter()
        .map(|member| cluster.start_member(*member))
        .collect();
    cluster.hosted = restarted;
    let handles = cluster.create_group(&group, Register::default);
    for handle in &handles {
        assert!(handle.status().snapshot_index >= 40);
    }

    eventually("members to replay their logs", || {
        let handles = handles.clone();
        async move { handles.iter().all(|h| h.status().last_applied >= committed) }
    })
    .await;
    for handle in &handles {
        assert_eq!(
            handle.query_local(Vec::new()).await.unwrap(),
            49u32.to_be_bytes().to_vec()
        );
    }
    assert!(wait_leader(&handles).await.status().term > term);
    submit(&handles, b"after".to_vec()).await.unwrap();
}
