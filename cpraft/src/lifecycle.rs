//! Destroy notifications for services that keep per-group state.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use crate::metrics::LIFECYCLE_FAILURES;
use crate::types::GroupId;

/// Implemented by services that must forget a group once it is destroyed.
pub trait RaftGroupLifecycleAwareService: Send + Sync {
    /// Called once per destroyed group, after it reached `Destroyed`, on the
    /// group's own task. Must not block.
    fn on_group_destroy(&self, group_id: &GroupId) -> anyhow::Result<()>;
}

type Registration = (String, Arc<dyn RaftGroupLifecycleAwareService>);

#[derive(Default)]
pub struct LifecycleNotifier {
    services: RwLock<Vec<Registration>>,
}

impl LifecycleNotifier {
    pub fn new() -> Self {
        LifecycleNotifier::default()
    }

    pub fn register(&self, name: impl Into<String>, service: Arc<dyn RaftGroupLifecycleAwareService>) {
        let name = name.into();
        log::info!("registered lifecycle aware service {}", name);
        self.services.write().unwrap().push((name, service));
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services
            .read()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Runs every callback in registration order. A failing or panicking
    /// callback is logged and the remaining ones still run.
    pub fn notify_group_destroy(&self, group_id: &GroupId) {
        let services = self.services.read().unwrap().clone();
        for (name, service) in services {
            match panic::catch_unwind(AssertUnwindSafe(|| service.on_group_destroy(group_id))) {
                Ok(Ok(())) => {
                    log::debug!("service {} handled destroy of group {}", name, group_id);
                }
                Ok(Err(e)) => {
                    LIFECYCLE_FAILURES.inc();
                    log::error!(
                        "service {} failed to handle destroy of group {}: {:?}",
                        name,
                        group_id,
                        e
                    );
                }
                Err(_) => {
                    LIFECYCLE_FAILURES.inc();
                    log::error!(
                        "service {} panicked handling destroy of group {}",
                        name,
                        group_id
                    );
                }
            }
        }
    }
}
