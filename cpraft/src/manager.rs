//! Registry of the groups hosted by one member.

use fxhash::FxHashMap;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::RaftConfig;
use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleNotifier, RaftGroupLifecycleAwareService};
use crate::metrics::ACTIVE_GROUPS;
use crate::raft::storage::{read_file, write_file};
use crate::raft::{
    default_logger, FileSnapshotStore, FileStorage, MemSnapshotStore, MemStorage, Node, RaftCore,
    RaftNodeHandle, SnapshotStore, StateMachine, Storage,
};
use crate::transport::Transport;
use crate::types::{GroupId, GroupLifecycleState, MemberId};

const TOMBSTONES_FILE: &str = "destroyed_groups";

enum GroupSlot {
    // Reserved while the member is being built.
    Creating,
    Live(RaftNodeHandle),
    // Kept forever so the id is never reused.
    Destroyed,
}

/// Durable record of destroyed groups. Registered as a lifecycle service;
/// it also drops the group's log and snapshot.
struct Tombstones {
    member_dir: Option<PathBuf>,
    snapshots: Arc<dyn SnapshotStore>,
    destroyed: Mutex<BTreeSet<GroupId>>,
}

impl Tombstones {
    fn load(member_dir: Option<PathBuf>, snapshots: Arc<dyn SnapshotStore>) -> Result<Self> {
        let destroyed = match &member_dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(crate::error::StorageError::from)?;
                read_file::<BTreeSet<GroupId>>(&dir.join(TOMBSTONES_FILE))?.unwrap_or_default()
            }
            None => BTreeSet::new(),
        };
        Ok(Tombstones {
            member_dir,
            snapshots,
            destroyed: Mutex::new(destroyed),
        })
    }

    fn ids(&self) -> Vec<GroupId> {
        self.destroyed.lock().unwrap().iter().cloned().collect()
    }
}

impl RaftGroupLifecycleAwareService for Tombstones {
    fn on_group_destroy(&self, group_id: &GroupId) -> anyhow::Result<()> {
        let mut destroyed = self.destroyed.lock().unwrap();
        if !destroyed.insert(group_id.clone()) {
            return Ok(());
        }
        if let Some(dir) = &self.member_dir {
            write_file(&dir.join(TOMBSTONES_FILE), &*destroyed)?;
            match fs::remove_dir_all(dir.join(group_id.dir_name())) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.snapshots.remove(group_id)?;
        Ok(())
    }
}

pub struct RaftGroupManager {
    local_member: MemberId,
    config: RaftConfig,
    transport: Arc<dyn Transport>,
    notifier: Arc<LifecycleNotifier>,
    snapshots: Arc<dyn SnapshotStore>,
    logger: slog::Logger,
    groups: Mutex<FxHashMap<GroupId, GroupSlot>>,
}

impl RaftGroupManager {
    /// Groups destroyed by an earlier run on the same `data_dir` stay
    /// destroyed.
    pub fn new(
        local_member: MemberId,
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        notifier: Arc<LifecycleNotifier>,
    ) -> Result<Self> {
        config.validate()?;
        let member_dir = config
            .data_dir
            .as_ref()
            .map(|dir| dir.join(format!("member_{}", local_member)));
        let snapshots: Arc<dyn SnapshotStore> = match &member_dir {
            Some(dir) => Arc::new(FileSnapshotStore::new(dir.join("snapshots"))?),
            None => Arc::new(MemSnapshotStore::new()),
        };
        let tombstones = Arc::new(Tombstones::load(member_dir, snapshots.clone())?);
        let groups = tombstones
            .ids()
            .into_iter()
            .map(|id| (id, GroupSlot::Destroyed))
            .collect();
        notifier.register(format!("raft_group_manager_{}", local_member), tombstones);
        Ok(RaftGroupManager {
            local_member,
            config,
            transport,
            notifier,
            snapshots,
            logger: default_logger(),
            groups: Mutex::new(groups),
        })
    }

    pub fn with_logger(mut self, logger: slog::Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn local_member(&self) -> MemberId {
        self.local_member
    }

    pub fn notifier(&self) -> &Arc<LifecycleNotifier> {
        &self.notifier
    }

    /// Starts the local member of a new group. Ids are never reused, so an
    /// id that exists or was destroyed before is rejected. An empty
    /// `initial_members` starts a member that waits to be added.
    pub fn create_group<S, F>(
        &self,
        group_id: GroupId,
        initial_members: Vec<MemberId>,
        factory: F,
    ) -> Result<RaftNodeHandle>
    where
        S: StateMachine,
        F: FnOnce(&GroupId) -> S,
    {
        {
            let mut groups = self.groups.lock().unwrap();
            if groups.contains_key(&group_id) {
                return Err(Error::DuplicateGroup(group_id));
            }
            groups.insert(group_id.clone(), GroupSlot::Creating);
        }

        let handle = match self.start_member(&group_id, initial_members, factory) {
            Ok(handle) => handle,
            Err(e) => {
                self.groups.lock().unwrap().remove(&group_id);
                return Err(e);
            }
        };
        self.groups
            .lock()
            .unwrap()
            .insert(group_id.clone(), GroupSlot::Live(handle.clone()));
        ACTIVE_GROUPS.inc();
        log::info!(
            "created group {} on member {}",
            group_id,
            self.local_member
        );
        Ok(handle)
    }

    fn start_member<S, F>(
        &self,
        group_id: &GroupId,
        initial_members: Vec<MemberId>,
        factory: F,
    ) -> Result<RaftNodeHandle>
    where
        S: StateMachine,
        F: FnOnce(&GroupId) -> S,
    {
        let storage: Box<dyn Storage> = match &self.config.data_dir {
            Some(dir) => Box::new(FileStorage::open(
                dir.join(format!("member_{}", self.local_member))
                    .join(group_id.dir_name()),
            )?),
            None => Box::new(MemStorage::new()),
        };
        let state_machine = factory(group_id);
        let core = RaftCore::new(
            self.local_member,
            group_id.clone(),
            initial_members,
            self.config.clone(),
            storage,
            self.snapshots.clone(),
            state_machine,
            self.logger.clone(),
        )?;
        Ok(Node::start(
            core,
            self.transport.clone(),
            self.notifier.clone(),
            &self.config,
        ))
    }

    /// Destroys the local member of a group: pending submissions fail with
    /// `GroupDestroyed` and lifecycle services are notified once. Destroying
    /// an already destroyed group succeeds without doing anything.
    pub async fn destroy_group(&self, group_id: &GroupId) -> Result<()> {
        let handle = {
            let groups = self.groups.lock().unwrap();
            match groups.get(group_id) {
                None | Some(GroupSlot::Creating) => {
                    return Err(Error::UnknownGroup(group_id.clone()))
                }
                Some(GroupSlot::Destroyed) => return Ok(()),
                Some(GroupSlot::Live(handle)) => handle.clone(),
            }
        };
        handle.destroy().await;
        // A failed member has no task left to run the teardown.
        if handle.mark_destroyed() {
            self.notifier.notify_group_destroy(group_id);
        }
        self.retire(group_id);
        Ok(())
    }

    /// Handle of an active group.
    pub fn lookup(&self, group_id: &GroupId) -> Option<RaftNodeHandle> {
        let handle = match self.groups.lock().unwrap().get(group_id) {
            Some(GroupSlot::Live(handle)) => handle.clone(),
            _ => return None,
        };
        if handle.lifecycle() != GroupLifecycleState::Active {
            // Destroyed through the replicated log.
            self.retire(group_id);
            return None;
        }
        Some(handle)
    }

    pub fn groups(&self) -> Vec<GroupId> {
        self.groups
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(id, slot)| match slot {
                GroupSlot::Live(handle)
                    if handle.lifecycle() == GroupLifecycleState::Active =>
                {
                    Some(id.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Stops every member task without destroying the groups; their
    /// durable state is kept.
    pub async fn shutdown(&self) {
        let handles: Vec<RaftNodeHandle> = {
            let mut groups = self.groups.lock().unwrap();
            let live: Vec<GroupId> = groups
                .iter()
                .filter(|(_, slot)| matches!(slot, GroupSlot::Live(_)))
                .map(|(id, _)| id.clone())
                .collect();
            live.iter()
                .filter_map(|id| match groups.remove(id) {
                    Some(GroupSlot::Live(handle)) => Some(handle),
                    _ => None,
                })
                .collect()
        };
        for handle in handles {
            if handle.lifecycle() == GroupLifecycleState::Active {
                ACTIVE_GROUPS.dec();
            }
            handle.shutdown().await;
        }
        log::info!("raft group manager of member {} stopped", self.local_member);
    }

    fn retire(&self, group_id: &GroupId) {
        let mut groups = self.groups.lock().unwrap();
        if let Some(slot) = groups.get_mut(group_id) {
            if matches!(slot, GroupSlot::Live(_)) {
                *slot = GroupSlot::Destroyed;
                ACTIVE_GROUPS.dec();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::RaftGroupLifecycleAwareService;
    use crate::raft::discard_logger;
    use crate::transport::LocalNetwork;
    use crate::types::LogIndex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration, Instant};

    #[derive(Default)]
    struct Counter {
        value: u64,
    }

    impl StateMachine for Counter {
        fn apply(&mut self, _index: LogIndex, data: &[u8]) -> Vec<u8> {
            self.value += data.len() as u64;
            self.value.to_le_bytes().to_vec()
        }

        fn query(&self, _data: &[u8]) -> Vec<u8> {
            self.value.to_le_bytes().to_vec()
        }

        fn snapshot(&self) -> Vec<u8> {
            self.value.to_le_bytes().to_vec()
        }

        fn restore(&mut self, _: LogIndex, _: crate::types::Term, data: &[u8]) -> anyhow::Result<()> {
            let bytes: [u8; 8] = data.try_into()?;
            self.value = u64::from_le_bytes(bytes);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingService {
        destroyed: AtomicUsize,
    }

    impl RaftGroupLifecycleAwareService for CountingService {
        fn on_group_destroy(&self, _group_id: &GroupId) -> anyhow::Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_config() -> RaftConfig {
        RaftConfig {
            tick_interval_ms: 5,
            ..Default::default()
        }
    }

    fn single_member_manager() -> (RaftGroupManager, Arc<CountingService>) {
        let notifier = Arc::new(LifecycleNotifier::new());
        let service = Arc::new(CountingService::default());
        notifier.register("counting", service.clone());
        let manager =
            RaftGroupManager::new(1, fast_config(), Arc::new(LocalNetwork::new()), notifier)
                .unwrap()
                .with_logger(discard_logger());
        (manager, service)
    }

    async fn wait_for_leader(handle: &RaftNodeHandle) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_leader() {
            assert!(Instant::now() < deadline, "no leader elected");
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_create_submit_destroy() {
        let (manager, service) = single_member_manager();
        let group = GroupId::new("counter", 1);
        let handle = manager
            .create_group(group.clone(), vec![1], |_| Counter::default())
            .unwrap();
        wait_for_leader(&handle).await;

        let result = handle
            .submit(b"abc".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, 3u64.to_le_bytes().to_vec());
        assert!(manager.lookup(&group).is_some());
        assert_eq!(manager.groups(), vec![group.clone()]);

        manager.destroy_group(&group).await.unwrap();
        assert_eq!(service.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(handle.lifecycle(), GroupLifecycleState::Destroyed);
        assert!(manager.lookup(&group).is_none());
        assert!(matches!(
            handle.submit(b"x".to_vec(), Duration::from_secs(1)).await,
            Err(Error::GroupDestroyed(_))
        ));

        // Idempotent, and the id is burnt.
        manager.destroy_group(&group).await.unwrap();
        assert_eq!(service.destroyed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            manager.create_group(group.clone(), vec![1], |_| Counter::default()),
            Err(Error::DuplicateGroup(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_groups() {
        let (manager, _) = single_member_manager();
        let group = GroupId::new("counter", 2);
        manager
            .create_group(group.clone(), vec![1], |_| Counter::default())
            .unwrap();
        assert!(matches!(
            manager.create_group(group.clone(), vec![1], |_| Counter::default()),
            Err(Error::DuplicateGroup(_))
        ));
        assert!(matches!(
            manager.destroy_group(&GroupId::new("missing", 1)).await,
            Err(Error::UnknownGroup(_))
        ));
        manager.shutdown().await;
        assert!(manager.groups().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_destroy_notifies_once() {
        let (manager, service) = single_member_manager();
        let manager = Arc::new(manager);
        let group = GroupId::new("counter", 3);
        manager
            .create_group(group.clone(), vec![1], |_| Counter::default())
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            let group = group.clone();
            tasks.push(tokio::spawn(async move { manager.destroy_group(&group).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(service.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stopped_member_destroyed_concurrently_notifies_once() {
        let (manager, service) = single_member_manager();
        let manager = Arc::new(manager);
        let group = GroupId::new("counter", 4);
        let handle = manager
            .create_group(group.clone(), vec![1], |_| Counter::default())
            .unwrap();
        // Leaves the member active with no task to run the teardown, as a
        // fatal failure does.
        handle.shutdown().await;
        assert_eq!(handle.lifecycle(), GroupLifecycleState::Active);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let group = group.clone();
            tasks.push(tokio::spawn(async move { manager.destroy_group(&group).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(service.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(handle.lifecycle(), GroupLifecycleState::Destroyed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_builds_one_member() {
        let (manager, _) = single_member_manager();
        let manager = Arc::new(manager);
        let group = GroupId::new("counter", 5);
        let built = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let group = group.clone();
            let built = built.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .create_group(group, vec![1], |_| {
                        built.fetch_add(1, Ordering::SeqCst);
                        Counter::default()
                    })
                    .is_ok()
            }));
        }
        let mut created = 0;
        for task in tasks {
            if task.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(built.load(Ordering::SeqCst), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_destroyed_id_stays_burnt_after_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = RaftConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..fast_config()
        };
        let group = GroupId::new("durable", 2);
        let network: Arc<LocalNetwork> = Arc::new(LocalNetwork::new());

        let manager = RaftGroupManager::new(
            1,
            config.clone(),
            network.clone(),
            Arc::new(LifecycleNotifier::new()),
        )
        .unwrap()
        .with_logger(discard_logger());
        let handle = manager
            .create_group(group.clone(), vec![1], |_| Counter::default())
            .unwrap();
        wait_for_leader(&handle).await;
        handle
            .submit(b"secret".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        manager.destroy_group(&group).await.unwrap();
        manager.shutdown().await;

        let log_dir = dir.path().join("member_1").join(group.dir_name());
        assert!(!log_dir.exists());

        let notifier = Arc::new(LifecycleNotifier::new());
        let service = Arc::new(CountingService::default());
        notifier.register("counting", service.clone());
        let manager = RaftGroupManager::new(1, config, network, notifier)
            .unwrap()
            .with_logger(discard_logger());
        assert!(matches!(
            manager.create_group(group.clone(), vec![1], |_| Counter::default()),
            Err(Error::DuplicateGroup(_))
        ));
        assert!(!log_dir.exists());
        // Already destroyed: nothing to notify.
        manager.destroy_group(&group).await.unwrap();
        assert_eq!(service.destroyed.load(Ordering::SeqCst), 0);
        assert!(manager.lookup(&group).is_none());
    }

    #[tokio::test]
    async fn test_file_backed_member_recovers_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = RaftConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..fast_config()
        };
        let group = GroupId::new("durable", 1);
        let network: Arc<LocalNetwork> = Arc::new(LocalNetwork::new());

        let manager = RaftGroupManager::new(
            1,
            config.clone(),
            network.clone(),
            Arc::new(LifecycleNotifier::new()),
        )
        .unwrap()
        .with_logger(discard_logger());
        let handle = manager
            .create_group(group.clone(), vec![1], |_| Counter::default())
            .unwrap();
        wait_for_leader(&handle).await;
        for _ in 0..3 {
            handle
                .submit(b"ab".to_vec(), Duration::from_secs(5))
                .await
                .unwrap();
        }
        manager.shutdown().await;

        let manager =
            RaftGroupManager::new(1, config, network, Arc::new(LifecycleNotifier::new()))
                .unwrap()
                .with_logger(discard_logger());
        let handle = manager
            .create_group(group, vec![1], |_| Counter::default())
            .unwrap();
        wait_for_leader(&handle).await;
        // The new leader's no-op commits, replaying the three operations.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let value = handle.query_local(Vec::new()).await.unwrap();
            if value == 6u64.to_le_bytes().to_vec() {
                break;
            }
            assert!(Instant::now() < deadline, "state not recovered");
            sleep(Duration::from_millis(5)).await;
        }
        assert!(handle.status().term >= 2);
        manager.shutdown().await;
    }
}
