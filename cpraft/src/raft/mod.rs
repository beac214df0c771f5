use slog::{o, Drain};

use crate::types::{LogIndex, Term};

pub mod messages;
pub mod node;
pub mod proposal;
pub mod raft_core;
mod segment;
pub mod snapshot;
pub mod storage;

pub use self::node::{Node, RaftNodeHandle};
pub use self::raft_core::{Applied, NodeStatus, RaftCore};
pub use self::snapshot::{FileSnapshotStore, MemSnapshotStore, SnapshotStore};
pub use self::storage::{FileStorage, MemStorage, Storage};

const LOGGER_CHANNEL_SIZE: usize = 4096; // Size of logger channel buffer

/// Replicated state owned by a single node. Every replica must reach the same
/// state and results from the same sequence of operations.
pub trait StateMachine: Send + 'static {
    /// Applies a committed operation and returns its encoded result.
    fn apply(&mut self, index: LogIndex, data: &[u8]) -> Vec<u8>;

    /// Runs a read-only operation against local state.
    fn query(&self, data: &[u8]) -> Vec<u8>;

    fn snapshot(&self) -> Vec<u8>;

    /// Replaces the whole state with the snapshot contents.
    fn restore(&mut self, last_index: LogIndex, last_term: Term, data: &[u8]) -> anyhow::Result<()>;
}

/// Root logger for protocol events: terminal output behind an async drain.
#[cfg(feature = "slog-term")]
pub fn default_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    slog::Logger::root(drain, o!())
}

#[cfg(not(feature = "slog-term"))]
pub fn default_logger() -> slog::Logger {
    let _ = LOGGER_CHANNEL_SIZE;
    discard_logger()
}

pub fn discard_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, o!())
}
