use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::MemberId;

static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

/// Tuning for every Raft node hosted by a manager.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RaftConfig {
    pub tick_interval_ms: u64,
    /// Ticks without a leader before a follower campaigns; randomized in
    /// `[election_tick, 2 * election_tick)`.
    pub election_tick: u32,
    pub heartbeat_tick: u32,
    /// Leader steps down when a majority was silent for an election timeout.
    pub check_quorum: bool,
    pub max_append_entries: usize,
    /// Applied entries since the last snapshot that trigger a new one.
    pub snapshot_entry_threshold: u64,
    /// Applied payload bytes since the last snapshot that trigger a new one,
    /// 0 disables the size trigger.
    pub snapshot_size_threshold: usize,
    pub snapshot_chunk_size: usize,
    pub mailbox_size: usize,
    /// File-backed logs and snapshots live here when set.
    pub data_dir: Option<PathBuf>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            tick_interval_ms: 100,
            election_tick: 10,
            heartbeat_tick: 3,
            check_quorum: true,
            max_append_entries: 512,
            snapshot_entry_threshold: 10_000,
            snapshot_size_threshold: 64 * 1024 * 1024,
            snapshot_chunk_size: 1024 * 1024,
            mailbox_size: 4096,
            data_dir: None,
        }
    }
}

impl RaftConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be positive".into()));
        }
        if self.heartbeat_tick == 0 || self.election_tick == 0 {
            return Err(Error::Config("ticks must be positive".into()));
        }
        if self.heartbeat_tick >= self.election_tick {
            return Err(Error::Config(format!(
                "heartbeat_tick {} must be below election_tick {}",
                self.heartbeat_tick, self.election_tick
            )));
        }
        if self.max_append_entries == 0 || self.snapshot_chunk_size == 0 {
            return Err(Error::Config(
                "max_append_entries and snapshot_chunk_size must be positive".into(),
            ));
        }
        if self.mailbox_size == 0 {
            return Err(Error::Config("mailbox_size must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    pub members: Vec<MemberId>,
    pub groups: Vec<String>,
    pub metrics_addr: String,
    pub demo_interval_ms: u64,
    pub raft: RaftConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::new()
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            members: vec![1, 2, 3],
            groups: vec!["default".to_string()],
            metrics_addr: "0.0.0.0:4010".to_string(),
            demo_interval_ms: 1000,
            raft: RaftConfig::default(),
        }
    }

    pub fn from_toml(path: &str) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file {}, {:?}",
                    path, e
                );
                return RuntimeConfig::new();
            }
        };
        let config = match Self::parse(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong parsing the runtime config file {}, {}",
                    path, e
                );
                return RuntimeConfig::new();
            }
        };
        *instance().lock().unwrap() = config.clone();
        config
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: RuntimeConfig =
            toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.raft.validate()?;
        if config.members.is_empty() {
            return Err(Error::Config("members must not be empty".into()));
        }
        Ok(config)
    }
}
