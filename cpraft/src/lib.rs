//! Multi-group Raft consensus for in-process members.
//!
//! A [`RaftGroupManager`] hosts one member of each group it creates. Members
//! of one group talk through a [`Transport`], apply committed operations to
//! a [`StateMachine`] and notify [`RaftGroupLifecycleAwareService`]s once the
//! group is destroyed.

pub mod atomic_ref;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod metrics;
pub mod raft;
pub mod transport;
pub mod types;

pub use crate::atomic_ref::{
    parse_object_name, AtomicRefProxy, AtomicRefService, AtomicRefStateMachine,
};
pub use crate::config::{RaftConfig, RuntimeConfig};
pub use crate::error::{Error, Result, StorageError};
pub use crate::lifecycle::{LifecycleNotifier, RaftGroupLifecycleAwareService};
pub use crate::manager::RaftGroupManager;
pub use crate::raft::{NodeStatus, RaftNodeHandle, StateMachine};
pub use crate::transport::{LocalNetwork, Transport};
pub use crate::types::{
    GroupId, GroupLifecycleState, LogIndex, Membership, MemberId, Role, Term,
};
