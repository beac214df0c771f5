//! Persistent log of a single group.
//!
//! Indices are contiguous. After a prefix truncation the log remembers the
//! `(index, term)` of the last removed entry (the offset) so the entry that
//! precedes the first retained one can still be matched.

use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::raft::segment::Segment;
use crate::types::{HardState, LogEntry, LogIndex, Term};

type Result<T> = std::result::Result<T, StorageError>;

const SEGMENT_ENTRIES: usize = 4096;
const HARD_STATE_FILE: &str = "hardstate";
const LOG_META_FILE: &str = "log_meta";

pub trait Storage: Send {
    fn hard_state(&self) -> HardState;

    fn set_hard_state(&mut self, hs: HardState) -> Result<()>;

    /// Index and term of the last entry removed by prefix truncation.
    fn offset(&self) -> (LogIndex, Term);

    fn last_index(&self) -> LogIndex;

    /// Appends `entry`, which must sit at `last_index() + 1`. Durable on return.
    fn append(&mut self, entry: LogEntry) -> Result<LogIndex>;

    fn entry_at(&self, index: LogIndex) -> Option<LogEntry>;

    /// Up to `max` entries starting at `from`.
    fn entries(&self, from: LogIndex, max: usize) -> Vec<LogEntry>;

    /// Removes `index` and everything after it.
    fn truncate_suffix_from(&mut self, index: LogIndex) -> Result<()>;

    /// Removes every entry up to and including `index`, recording `term` as
    /// the offset term. Callers never pass an index beyond their commit index.
    fn truncate_prefix_up_to(&mut self, index: LogIndex, term: Term) -> Result<()>;

    fn first_index(&self) -> LogIndex {
        self.offset().0 + 1
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        let (offset_index, offset_term) = self.offset();
        if index == offset_index {
            return Some(offset_term);
        }
        self.entry_at(index).map(|e| e.term)
    }

    fn last_term(&self) -> Term {
        self.term_at(self.last_index())
            .unwrap_or_else(|| self.offset().1)
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemStorage {
    hard_state: HardState,
    offset_index: LogIndex,
    offset_term: Term,
    entries: VecDeque<LogEntry>,
}

impl MemStorage {
    pub fn new() -> Self {
        MemStorage::default()
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        if index <= self.offset_index || index > self.last_index() {
            return None;
        }
        Some((index - self.offset_index - 1) as usize)
    }
}

impl Storage for MemStorage {
    fn hard_state(&self) -> HardState {
        self.hard_state
    }

    fn set_hard_state(&mut self, hs: HardState) -> Result<()> {
        self.hard_state = hs;
        Ok(())
    }

    fn offset(&self) -> (LogIndex, Term) {
        (self.offset_index, self.offset_term)
    }

    fn last_index(&self) -> LogIndex {
        self.offset_index + self.entries.len() as u64
    }

    fn append(&mut self, entry: LogEntry) -> Result<LogIndex> {
        let last = self.last_index();
        if entry.index != last + 1 {
            return Err(StorageError::NonContiguous {
                index: entry.index,
                last,
            });
        }
        let index = entry.index;
        self.entries.push_back(entry);
        Ok(index)
    }

    fn entry_at(&self, index: LogIndex) -> Option<LogEntry> {
        self.position(index).and_then(|p| self.entries.get(p).cloned())
    }

    fn entries(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        match self.position(from) {
            Some(p) => self.entries.iter().skip(p).take(max).cloned().collect(),
            None => Vec::new(),
        }
    }

    fn truncate_suffix_from(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.offset_index {
            return Err(StorageError::Compacted {
                index,
                offset: self.offset_index,
            });
        }
        if let Some(p) = self.position(index) {
            self.entries.truncate(p);
        }
        Ok(())
    }

    fn truncate_prefix_up_to(&mut self, index: LogIndex, term: Term) -> Result<()> {
        if index <= self.offset_index {
            return Ok(());
        }
        if index >= self.last_index() {
            self.entries.clear();
        } else {
            let removed = (index - self.offset_index) as usize;
            self.entries.drain(..removed);
        }
        self.offset_index = index;
        self.offset_term = term;
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LogMeta {
    offset_index: LogIndex,
    offset_term: Term,
}

/// File-backed log: every mutation is written to segment files and fsynced,
/// reads are served from an in-memory mirror rebuilt on open.
pub struct FileStorage {
    mem_storage: MemStorage,
    segments: BTreeMap<u64, Segment>,
    base_path: PathBuf,
}

impl FileStorage {
    pub fn open<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let mut mem_storage = MemStorage::new();
        if let Some(hs) = read_file::<HardState>(&base_path.join(HARD_STATE_FILE))? {
            mem_storage.hard_state = hs;
        }
        let meta = read_file::<LogMeta>(&base_path.join(LOG_META_FILE))?.unwrap_or_default();
        mem_storage.offset_index = meta.offset_index;
        mem_storage.offset_term = meta.offset_term;

        let mut segment_files: Vec<(u64, PathBuf)> = fs::read_dir(&base_path)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                let name = path.file_name()?.to_string_lossy().to_string();
                let start = name
                    .strip_prefix("segment_")?
                    .strip_suffix(".log")?
                    .parse::<u64>()
                    .ok()?;
                Some((start, path))
            })
            .collect();
        segment_files.sort_by_key(|(start, _)| *start);

        let mut segments = BTreeMap::new();
        for (start_index, path) in segment_files {
            let mut segment = Segment::open(&path, start_index)?;
            for index in segment.start_index()..=segment.end_index() {
                let bytes = segment.read_entry(index)?;
                let entry: LogEntry = bincode::deserialize(&bytes).map_err(|e| {
                    StorageError::Corrupted(format!("{}: entry {}: {}", path.display(), index, e))
                })?;
                if entry.index != index {
                    return Err(StorageError::Corrupted(format!(
                        "{}: slot {} holds entry {}",
                        path.display(),
                        index,
                        entry.index
                    )));
                }
                if index <= mem_storage.offset_index {
                    continue;
                }
                if index != mem_storage.last_index() + 1 {
                    return Err(StorageError::Corrupted(format!(
                        "gap before entry {} (last index {})",
                        index,
                        mem_storage.last_index()
                    )));
                }
                mem_storage.entries.push_back(entry);
            }
            segments.insert(start_index, segment);
        }

        Ok(FileStorage {
            mem_storage,
            segments,
            base_path,
        })
    }

    fn segment_path(&self, start_index: u64) -> PathBuf {
        self.base_path.join(format!("segment_{}.log", start_index))
    }

    /// Segment that accepts `index`, rolling over when the tail is full or
    /// no longer contiguous.
    fn active_segment(&mut self, index: LogIndex) -> Result<&mut Segment> {
        let reusable = match self.segments.values().next_back() {
            Some(segment) => segment.end_index() + 1 == index && segment.len() < SEGMENT_ENTRIES,
            None => false,
        };
        if !reusable {
            let path = self.segment_path(index);
            let segment = Segment::open(path, index)?;
            self.segments.insert(index, segment);
        }
        let (_, segment) = self
            .segments
            .iter_mut()
            .next_back()
            .ok_or_else(|| StorageError::Corrupted("no active segment".into()))?;
        Ok(segment)
    }

    fn write_meta(&self) -> Result<()> {
        let meta = LogMeta {
            offset_index: self.mem_storage.offset_index,
            offset_term: self.mem_storage.offset_term,
        };
        write_file(&self.base_path.join(LOG_META_FILE), &meta)
    }
}

impl Storage for FileStorage {
    fn hard_state(&self) -> HardState {
        self.mem_storage.hard_state()
    }

    fn set_hard_state(&mut self, hs: HardState) -> Result<()> {
        write_file(&self.base_path.join(HARD_STATE_FILE), &hs)?;
        self.mem_storage.set_hard_state(hs)
    }

    fn offset(&self) -> (LogIndex, Term) {
        self.mem_storage.offset()
    }

    fn last_index(&self) -> LogIndex {
        self.mem_storage.last_index()
    }

    fn append(&mut self, entry: LogEntry) -> Result<LogIndex> {
        let last = self.mem_storage.last_index();
        if entry.index != last + 1 {
            return Err(StorageError::NonContiguous {
                index: entry.index,
                last,
            });
        }
        let bytes = bincode::serialize(&entry)?;
        self.active_segment(entry.index)?.append(&[bytes])?;
        self.mem_storage.append(entry)
    }

    fn entry_at(&self, index: LogIndex) -> Option<LogEntry> {
        self.mem_storage.entry_at(index)
    }

    fn entries(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        self.mem_storage.entries(from, max)
    }

    fn truncate_suffix_from(&mut self, index: LogIndex) -> Result<()> {
        self.mem_storage.truncate_suffix_from(index)?;

        let doomed: Vec<u64> = self.segments.range(index..).map(|(s, _)| *s).collect();
        for start in doomed {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove()?;
            }
        }
        if let Some((_, segment)) = self.segments.range_mut(..index).next_back() {
            segment.truncate_from(index)?;
        }
        Ok(())
    }

    fn truncate_prefix_up_to(&mut self, index: LogIndex, term: Term) -> Result<()> {
        if index <= self.mem_storage.offset_index {
            return Ok(());
        }
        self.mem_storage.truncate_prefix_up_to(index, term)?;
        // meta first: a crash after this point only leaves stale segments,
        // which are skipped on open
        self.write_meta()?;

        let doomed: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, s)| s.end_index() <= index)
            .map(|(start, _)| *start)
            .collect();
        for start in doomed {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove()?;
            }
        }
        Ok(())
    }
}

pub(crate) fn read_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    let value = bincode::deserialize(&bytes)
        .map_err(|e| StorageError::Corrupted(format!("{}: {}", path.display(), e)))?;
    Ok(Some(value))
}

/// Writes to a temporary file first, then renames over the target.
pub(crate) fn write_file<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value)?;
    let temp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&temp_path)?;
        std::io::Write::write_all(&mut file, &bytes)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}
