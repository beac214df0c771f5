//! Latest compacted snapshot per group.

use fxhash::FxHashMap;
use serde_derive::Deserialize;
use std::fs;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::StorageError;
use crate::raft::storage::write_file;
use crate::types::{GroupId, LogIndex, Snapshot, Term};

type Result<T> = std::result::Result<T, StorageError>;

pub trait SnapshotStore: Send + Sync {
    /// Stores `snapshot` unless a newer one is already held, in which case
    /// nothing changes and `false` is returned.
    fn save(&self, group_id: &GroupId, snapshot: &Snapshot) -> Result<bool>;

    fn load(&self, group_id: &GroupId) -> Result<Option<Snapshot>>;

    fn remove(&self, group_id: &GroupId) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemSnapshotStore {
    snapshots: Mutex<FxHashMap<GroupId, Snapshot>>,
}

impl MemSnapshotStore {
    pub fn new() -> Self {
        MemSnapshotStore::default()
    }
}

impl SnapshotStore for MemSnapshotStore {
    fn save(&self, group_id: &GroupId, snapshot: &Snapshot) -> Result<bool> {
        let mut snapshots = self.snapshots.lock().unwrap();
        if let Some(current) = snapshots.get(group_id) {
            if snapshot.last_included_index < current.last_included_index {
                return Ok(false);
            }
        }
        snapshots.insert(group_id.clone(), snapshot.clone());
        Ok(true)
    }

    fn load(&self, group_id: &GroupId) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.lock().unwrap().get(group_id).cloned())
    }

    fn remove(&self, group_id: &GroupId) -> Result<()> {
        self.snapshots.lock().unwrap().remove(group_id);
        Ok(())
    }
}

/// Leading fields of an encoded `Snapshot`, read without the payload.
#[derive(Debug, Deserialize)]
struct SnapshotHeader {
    last_included_index: LogIndex,
    #[allow(dead_code)]
    last_included_term: Term,
}

/// One file per group under `base_path/<group>/snapshot`.
#[derive(Debug)]
pub struct FileSnapshotStore {
    base_path: PathBuf,
    // serializes save against save for the compare-then-write
    write_lock: Mutex<()>,
}

impl FileSnapshotStore {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        Ok(FileSnapshotStore {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    fn snapshot_path(&self, group_id: &GroupId) -> PathBuf {
        self.base_path.join(group_id.dir_name()).join("snapshot")
    }

    fn stored_index(&self, group_id: &GroupId) -> Result<Option<LogIndex>> {
        let path = self.snapshot_path(group_id);
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let header: SnapshotHeader = bincode::deserialize_from(reader)
            .map_err(|e| StorageError::Corrupted(format!("{}: {}", path.display(), e)))?;
        Ok(Some(header.last_included_index))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, group_id: &GroupId, snapshot: &Snapshot) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap();
        if let Some(index) = self.stored_index(group_id)? {
            if snapshot.last_included_index < index {
                return Ok(false);
            }
        }
        let path = self.snapshot_path(group_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        write_file(&path, snapshot)?;
        Ok(true)
    }

    fn load(&self, group_id: &GroupId) -> Result<Option<Snapshot>> {
        let path = self.snapshot_path(group_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let snapshot = bincode::deserialize(&bytes)
            .map_err(|e| StorageError::Corrupted(format!("{}: {}", path.display(), e)))?;
        Ok(Some(snapshot))
    }

    fn remove(&self, group_id: &GroupId) -> Result<()> {
        let path = self.snapshot_path(group_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
