//! Atomic references replicated through a consensus group.
//!
//! Every operation is a log entry, so reads and writes through a proxy are
//! linearizable. Values are opaque bytes inside the group; the typed proxy
//! encodes them with bincode.

use fxhash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::lifecycle::RaftGroupLifecycleAwareService;
use crate::manager::RaftGroupManager;
use crate::raft::{RaftNodeHandle, StateMachine};
use crate::types::{GroupId, LogIndex, Term};

pub const DEFAULT_GROUP_NAME: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicRefOp {
    Get {
        name: String,
    },
    Set {
        name: String,
        value: Option<Vec<u8>>,
    },
    GetAndSet {
        name: String,
        value: Option<Vec<u8>>,
    },
    CompareAndSet {
        name: String,
        expected: Option<Vec<u8>>,
        update: Option<Vec<u8>>,
    },
    Contains {
        name: String,
        value: Option<Vec<u8>>,
    },
    Destroy {
        name: String,
    },
}

impl AtomicRefOp {
    fn name(&self) -> &str {
        match self {
            AtomicRefOp::Get { name }
            | AtomicRefOp::Set { name, .. }
            | AtomicRefOp::GetAndSet { name, .. }
            | AtomicRefOp::CompareAndSet { name, .. }
            | AtomicRefOp::Contains { name, .. }
            | AtomicRefOp::Destroy { name } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicRefResponse {
    Value(Option<Vec<u8>>),
    Flag(bool),
    Done,
    /// The reference was destroyed by an earlier operation.
    Destroyed,
    Invalid(String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AtomicRefs {
    values: BTreeMap<String, Vec<u8>>,
    destroyed: BTreeSet<String>,
}

/// All atomic references of one group.
#[derive(Debug, Default)]
pub struct AtomicRefStateMachine {
    refs: AtomicRefs,
}

impl AtomicRefStateMachine {
    pub fn new() -> Self {
        AtomicRefStateMachine::default()
    }

    pub fn value(&self, name: &str) -> Option<&[u8]> {
        self.refs.values.get(name).map(Vec::as_slice)
    }

    pub fn is_destroyed(&self, name: &str) -> bool {
        self.refs.destroyed.contains(name)
    }

    fn store(&mut self, name: &str, value: Option<Vec<u8>>) -> Option<Vec<u8>> {
        match value {
            Some(value) => self.refs.values.insert(name.to_string(), value),
            None => self.refs.values.remove(name),
        }
    }

    fn execute(&mut self, op: AtomicRefOp) -> AtomicRefResponse {
        if self.is_destroyed(op.name()) {
            return match op {
                AtomicRefOp::Destroy { .. } => AtomicRefResponse::Done,
                _ => AtomicRefResponse::Destroyed,
            };
        }
        match op {
            AtomicRefOp::Set { name, value } => {
                self.store(&name, value);
                AtomicRefResponse::Done
            }
            AtomicRefOp::GetAndSet { name, value } => {
                AtomicRefResponse::Value(self.store(&name, value))
            }
            AtomicRefOp::CompareAndSet {
                name,
                expected,
                update,
            } => {
                if self.refs.values.get(&name) != expected.as_ref() {
                    return AtomicRefResponse::Flag(false);
                }
                self.store(&name, update);
                AtomicRefResponse::Flag(true)
            }
            AtomicRefOp::Destroy { name } => {
                self.refs.values.remove(&name);
                self.refs.destroyed.insert(name);
                AtomicRefResponse::Done
            }
            read => self.read(&read),
        }
    }

    fn read(&self, op: &AtomicRefOp) -> AtomicRefResponse {
        if self.is_destroyed(op.name()) {
            return AtomicRefResponse::Destroyed;
        }
        match op {
            AtomicRefOp::Get { name } => AtomicRefResponse::Value(self.refs.values.get(name).cloned()),
            AtomicRefOp::Contains { name, value } => {
                AtomicRefResponse::Flag(self.refs.values.get(name) == value.as_ref())
            }
            _ => AtomicRefResponse::Invalid("only get and contains are read-only".into()),
        }
    }
}

fn encode_response(response: &AtomicRefResponse) -> Vec<u8> {
    bincode::serialize(response).unwrap_or_default()
}

impl StateMachine for AtomicRefStateMachine {
    fn apply(&mut self, _index: LogIndex, data: &[u8]) -> Vec<u8> {
        let response = match bincode::deserialize::<AtomicRefOp>(data) {
            Ok(op) => self.execute(op),
            Err(e) => AtomicRefResponse::Invalid(format!("undecodable operation: {}", e)),
        };
        encode_response(&response)
    }

    fn query(&self, data: &[u8]) -> Vec<u8> {
        let response = match bincode::deserialize::<AtomicRefOp>(data) {
            Ok(op) => self.read(&op),
            Err(e) => AtomicRefResponse::Invalid(format!("undecodable operation: {}", e)),
        };
        encode_response(&response)
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&self.refs).unwrap_or_default()
    }

    fn restore(&mut self, _last_index: LogIndex, _last_term: Term, data: &[u8]) -> anyhow::Result<()> {
        self.refs = bincode::deserialize(data)?;
        Ok(())
    }
}

/// Splits `ref@group` into the object and group names. A name without a
/// group part lives in the default group.
pub fn parse_object_name(full_name: &str) -> Result<(String, String)> {
    let full_name = full_name.trim();
    let (object, group) = match full_name.split_once('@') {
        Some((object, group)) => (object.trim(), group.trim()),
        None => (full_name, DEFAULT_GROUP_NAME),
    };
    if object.is_empty() || group.is_empty() || group.contains('@') {
        return Err(Error::InvalidOperation(format!(
            "invalid object name {:?}",
            full_name
        )));
    }
    Ok((object.to_string(), group.to_string()))
}

fn codec_error(e: bincode::Error) -> Error {
    Error::Codec(e.to_string())
}

/// Typed client of one atomic reference.
pub struct AtomicRefProxy<T> {
    name: String,
    group: RaftNodeHandle,
    timeout: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for AtomicRefProxy<T> {
    fn clone(&self) -> Self {
        AtomicRefProxy {
            name: self.name.clone(),
            group: self.group.clone(),
            timeout: self.timeout,
            _marker: PhantomData,
        }
    }
}

impl<T: serde::Serialize + DeserializeOwned> AtomicRefProxy<T> {
    pub fn new(name: impl Into<String>, group: RaftNodeHandle, timeout: Duration) -> Self {
        AtomicRefProxy {
            name: name.into(),
            group,
            timeout,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_id(&self) -> &GroupId {
        self.group.group_id()
    }

    pub async fn get(&self) -> Result<Option<T>> {
        let op = AtomicRefOp::Get {
            name: self.name.clone(),
        };
        let response = self.invoke(op).await?;
        self.value_of(response)
    }

    /// Reads this member's copy without going through the log; may be stale.
    pub async fn get_local(&self) -> Result<Option<T>> {
        let op = AtomicRefOp::Get {
            name: self.name.clone(),
        };
        let data = bincode::serialize(&op).map_err(codec_error)?;
        let bytes = self.group.query_local(data).await?;
        let response = self.check(bincode::deserialize(&bytes).map_err(codec_error)?)?;
        self.value_of(response)
    }

    pub async fn set(&self, value: &T) -> Result<()> {
        let op = AtomicRefOp::Set {
            name: self.name.clone(),
            value: Some(encode(value)?),
        };
        self.invoke(op).await.map(|_| ())
    }

    pub async fn clear(&self) -> Result<()> {
        let op = AtomicRefOp::Set {
            name: self.name.clone(),
            value: None,
        };
        self.invoke(op).await.map(|_| ())
    }

    pub async fn get_and_set(&self, value: Option<&T>) -> Result<Option<T>> {
        let op = AtomicRefOp::GetAndSet {
            name: self.name.clone(),
            value: value.map(encode).transpose()?,
        };
        let response = self.invoke(op).await?;
        self.value_of(response)
    }

    pub async fn compare_and_set(&self, expected: Option<&T>, update: Option<&T>) -> Result<bool> {
        let op = AtomicRefOp::CompareAndSet {
            name: self.name.clone(),
            expected: expected.map(encode).transpose()?,
            update: update.map(encode).transpose()?,
        };
        let response = self.invoke(op).await?;
        self.flag_of(response)
    }

    pub async fn contains(&self, value: Option<&T>) -> Result<bool> {
        let op = AtomicRefOp::Contains {
            name: self.name.clone(),
            value: value.map(encode).transpose()?,
        };
        let response = self.invoke(op).await?;
        self.flag_of(response)
    }

    pub async fn is_null(&self) -> Result<bool> {
        self.contains(None).await
    }

    /// Destroys the reference; later operations on it fail with
    /// `ObjectDestroyed`.
    pub async fn destroy(&self) -> Result<()> {
        let op = AtomicRefOp::Destroy {
            name: self.name.clone(),
        };
        self.invoke(op).await.map(|_| ())
    }

    async fn invoke(&self, op: AtomicRefOp) -> Result<AtomicRefResponse> {
        let data = bincode::serialize(&op).map_err(codec_error)?;
        let bytes = self.group.submit(data, self.timeout).await?;
        self.check(bincode::deserialize(&bytes).map_err(codec_error)?)
    }

    fn check(&self, response: AtomicRefResponse) -> Result<AtomicRefResponse> {
        match response {
            AtomicRefResponse::Destroyed => Err(Error::ObjectDestroyed(self.name.clone())),
            AtomicRefResponse::Invalid(reason) => Err(Error::InvalidOperation(reason)),
            response => Ok(response),
        }
    }

    fn value_of(&self, response: AtomicRefResponse) -> Result<Option<T>> {
        match response {
            AtomicRefResponse::Value(Some(bytes)) => {
                Ok(Some(bincode::deserialize(&bytes).map_err(codec_error)?))
            }
            AtomicRefResponse::Value(None) => Ok(None),
            other => Err(Error::Codec(format!("unexpected response {:?}", other))),
        }
    }

    fn flag_of(&self, response: AtomicRefResponse) -> Result<bool> {
        match response {
            AtomicRefResponse::Flag(flag) => Ok(flag),
            other => Err(Error::Codec(format!("unexpected response {:?}", other))),
        }
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(codec_error)
}

/// Hands out proxies by `ref@group` name and forgets a group's objects once
/// the group is destroyed.
pub struct AtomicRefService {
    manager: Weak<RaftGroupManager>,
    timeout: Duration,
    objects: Mutex<FxHashMap<GroupId, BTreeSet<String>>>,
}

impl AtomicRefService {
    /// Creates the service and registers it for destroy notifications.
    pub fn new(manager: &Arc<RaftGroupManager>, timeout: Duration) -> Arc<Self> {
        let service = Arc::new(AtomicRefService {
            manager: Arc::downgrade(manager),
            timeout,
            objects: Mutex::new(FxHashMap::default()),
        });
        manager
            .notifier()
            .register("atomic_ref_service", service.clone());
        service
    }

    pub fn atomic_ref<T: serde::Serialize + DeserializeOwned>(
        &self,
        full_name: &str,
    ) -> Result<AtomicRefProxy<T>> {
        let (object, group_name) = parse_object_name(full_name)?;
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| Error::InvalidOperation("group manager is gone".into()))?;
        let handle = manager
            .groups()
            .into_iter()
            .filter(|id| id.name() == group_name)
            .max()
            .and_then(|id| manager.lookup(&id))
            .ok_or_else(|| {
                Error::InvalidOperation(format!("no active group named {}", group_name))
            })?;
        self.objects
            .lock()
            .unwrap()
            .entry(handle.group_id().clone())
            .or_default()
            .insert(object.clone());
        Ok(AtomicRefProxy::new(object, handle, self.timeout))
    }

    pub fn objects(&self, group_id: &GroupId) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .get(group_id)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl RaftGroupLifecycleAwareService for AtomicRefService {
    fn on_group_destroy(&self, group_id: &GroupId) -> anyhow::Result<()> {
        if let Some(names) = self.objects.lock().unwrap().remove(group_id) {
            log::info!(
                "released {} atomic references of destroyed group {}",
                names.len(),
                group_id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaftConfig;
    use crate::lifecycle::LifecycleNotifier;
    use crate::raft::discard_logger;
    use crate::transport::LocalNetwork;
    use tokio::time::{sleep, Instant};

    fn apply(sm: &mut AtomicRefStateMachine, op: AtomicRefOp) -> AtomicRefResponse {
        let bytes = sm.apply(1, &bincode::serialize(&op).unwrap());
        bincode::deserialize(&bytes).unwrap()
    }

    fn set(name: &str, value: &[u8]) -> AtomicRefOp {
        AtomicRefOp::Set {
            name: name.into(),
            value: Some(value.to_vec()),
        }
    }

    #[test]
    fn test_state_machine_operations() {
        let mut sm = AtomicRefStateMachine::new();
        assert_eq!(
            apply(&mut sm, AtomicRefOp::Get { name: "a".into() }),
            AtomicRefResponse::Value(None)
        );
        assert_eq!(apply(&mut sm, set("a", b"1")), AtomicRefResponse::Done);
        assert_eq!(
            apply(
                &mut sm,
                AtomicRefOp::GetAndSet {
                    name: "a".into(),
                    value: Some(b"2".to_vec())
                }
            ),
            AtomicRefResponse::Value(Some(b"1".to_vec()))
        );
        let cas = |expected: &[u8], update: &[u8]| AtomicRefOp::CompareAndSet {
            name: "a".into(),
            expected: Some(expected.to_vec()),
            update: Some(update.to_vec()),
        };
        assert_eq!(apply(&mut sm, cas(b"1", b"3")), AtomicRefResponse::Flag(false));
        assert_eq!(apply(&mut sm, cas(b"2", b"3")), AtomicRefResponse::Flag(true));
        assert_eq!(sm.value("a"), Some(&b"3"[..]));

        assert_eq!(
            apply(
                &mut sm,
                AtomicRefOp::Contains {
                    name: "b".into(),
                    value: None
                }
            ),
            AtomicRefResponse::Flag(true)
        );
        assert_eq!(
            apply(&mut sm, AtomicRefOp::Destroy { name: "a".into() }),
            AtomicRefResponse::Done
        );
        assert_eq!(apply(&mut sm, set("a", b"4")), AtomicRefResponse::Destroyed);
        assert_eq!(
            apply(&mut sm, AtomicRefOp::Destroy { name: "a".into() }),
            AtomicRefResponse::Done
        );
        assert!(matches!(
            bincode::deserialize::<AtomicRefResponse>(&sm.apply(9, b"\xff")).unwrap(),
            AtomicRefResponse::Invalid(_)
        ));
    }

    #[test]
    fn test_query_is_read_only() {
        let mut sm = AtomicRefStateMachine::new();
        apply(&mut sm, set("a", b"1"));
        let read = |sm: &AtomicRefStateMachine, op: &AtomicRefOp| -> AtomicRefResponse {
            bincode::deserialize(&sm.query(&bincode::serialize(op).unwrap())).unwrap()
        };
        assert_eq!(
            read(&sm, &AtomicRefOp::Get { name: "a".into() }),
            AtomicRefResponse::Value(Some(b"1".to_vec()))
        );
        assert!(matches!(read(&sm, &set("a", b"2")), AtomicRefResponse::Invalid(_)));
        assert_eq!(sm.value("a"), Some(&b"1"[..]));
    }

    #[test]
    fn test_restore_replaces_state_wholesale() {
        let mut source = AtomicRefStateMachine::new();
        apply(&mut source, set("a", b"1"));
        apply(&mut source, AtomicRefOp::Destroy { name: "gone".into() });
        let snapshot = source.snapshot();

        let mut target = AtomicRefStateMachine::new();
        apply(&mut target, set("stale", b"x"));
        target.restore(2, 1, &snapshot).unwrap();
        assert_eq!(target.value("a"), Some(&b"1"[..]));
        assert_eq!(target.value("stale"), None);
        assert!(target.is_destroyed("gone"));
        assert!(target.restore(2, 1, b"\x01").is_err());
    }

    #[test]
    fn test_parse_object_name() {
        assert_eq!(
            parse_object_name("ref@group").unwrap(),
            ("ref".to_string(), "group".to_string())
        );
        assert_eq!(
            parse_object_name("ref").unwrap(),
            ("ref".to_string(), DEFAULT_GROUP_NAME.to_string())
        );
        for bad in ["", "@group", "ref@", "a@b@c"] {
            assert!(parse_object_name(bad).is_err(), "{:?}", bad);
        }
    }

    #[tokio::test]
    async fn test_proxy_through_single_member_group() {
        let config = RaftConfig {
            tick_interval_ms: 5,
            ..Default::default()
        };
        let manager = Arc::new(
            RaftGroupManager::new(
                1,
                config,
                Arc::new(LocalNetwork::new()),
                Arc::new(LifecycleNotifier::new()),
            )
            .unwrap()
            .with_logger(discard_logger()),
        );
        let service = AtomicRefService::new(&manager, Duration::from_secs(5));
        let group = GroupId::new("group", 1);
        let handle = manager
            .create_group(group.clone(), vec![1], |_| AtomicRefStateMachine::new())
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_leader() {
            assert!(Instant::now() < deadline);
            sleep(Duration::from_millis(5)).await;
        }

        let proxy = service.atomic_ref::<String>("ref@group").unwrap();
        assert!(proxy.is_null().await.unwrap());
        proxy.set(&"x".to_string()).await.unwrap();
        assert_eq!(proxy.get().await.unwrap(), Some("x".to_string()));
        assert_eq!(proxy.get_local().await.unwrap(), Some("x".to_string()));
        assert!(!proxy
            .compare_and_set(Some(&"y".to_string()), Some(&"z".to_string()))
            .await
            .unwrap());
        assert!(proxy
            .compare_and_set(Some(&"x".to_string()), Some(&"z".to_string()))
            .await
            .unwrap());
        assert_eq!(
            proxy.get_and_set(None).await.unwrap(),
            Some("z".to_string())
        );
        assert!(proxy.is_null().await.unwrap());
        assert_eq!(service.objects(&group), vec!["ref".to_string()]);
        assert!(service.atomic_ref::<String>("ref@missing").is_err());

        proxy.destroy().await.unwrap();
        assert!(matches!(proxy.get().await, Err(Error::ObjectDestroyed(_))));

        manager.destroy_group(&group).await.unwrap();
        assert!(service.objects(&group).is_empty());
    }
}
