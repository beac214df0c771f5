use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use cpraft::{config, metrics};
use cpraft::{
    AtomicRefService, AtomicRefStateMachine, Error, GroupId, LifecycleNotifier, LocalNetwork,
    MemberId, RaftGroupManager, RuntimeConfig,
};

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(3);

struct Member {
    manager: Arc<RaftGroupManager>,
    atomic_refs: Arc<AtomicRefService>,
}

/// Every configured member hosted in this process, connected through a
/// local network, plus the metrics endpoint.
pub struct Server {
    config: RuntimeConfig,
    members: Arc<Vec<Member>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn builder() -> anyhow::Result<Self> {
        let config = config::instance().lock().unwrap().clone();
        let network = Arc::new(LocalNetwork::new());
        let mut members = Vec::with_capacity(config.members.len());
        for &member in &config.members {
            let manager = RaftGroupManager::new(
                member,
                config.raft.clone(),
                network.clone(),
                Arc::new(LifecycleNotifier::new()),
            )
            .with_context(|| format!("failed to start member {}", member))?;
            let manager = Arc::new(manager);
            let atomic_refs = AtomicRefService::new(&manager, SUBMIT_TIMEOUT);
            members.push(Member {
                manager,
                atomic_refs,
            });
        }
        for (i, name) in config.groups.iter().enumerate() {
            let group_id = GroupId::new(name.clone(), i as u64 + 1);
            for member in &members {
                member
                    .manager
                    .create_group(group_id.clone(), config.members.clone(), |_| {
                        AtomicRefStateMachine::new()
                    })
                    .with_context(|| format!("failed to create group {}", group_id))?;
            }
        }
        Ok(Server {
            config,
            members: Arc::new(members),
            tasks: Vec::new(),
        })
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.start_metrics_server()?;
        self.start_demo();
        log::info!(
            "server started with members {:?} and groups {:?}",
            self.config.members,
            self.config.groups
        );
        Ok(())
    }

    pub async fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for member in self.members.iter() {
            member.manager.shutdown().await;
        }
        log::info!("server stop");
    }

    fn start_metrics_server(&mut self) -> anyhow::Result<()> {
        let addr: SocketAddr = self
            .config
            .metrics_addr
            .parse()
            .with_context(|| format!("invalid metrics address {}", self.config.metrics_addr))?;
        let make_svc = make_service_fn(move |_| async move {
            Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| async move {
                let encoder = TextEncoder::new();
                let metric_families = metrics::REGISTRY_INSTANCE.gather();
                let mut buffer = Vec::new();
                let response = match encoder.encode(&metric_families, &mut buffer) {
                    Ok(()) => Response::new(Body::from(buffer)),
                    Err(e) => {
                        log::error!("failed to encode metrics: {}", e);
                        let mut response = Response::new(Body::from(e.to_string()));
                        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        response
                    }
                };
                Ok::<_, hyper::Error>(response)
            }))
        });
        metrics::init_registry();
        let server = hyper::Server::try_bind(&addr)
            .with_context(|| format!("failed to bind metrics server on {}", addr))?
            .serve(make_svc);
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server error: {}", e);
            }
        }));
        log::info!("metrics server started on {}", addr);
        Ok(())
    }

    /// Periodically writes a counter into `counter@<group>` of every group.
    fn start_demo(&mut self) {
        if self.config.demo_interval_ms == 0 {
            return;
        }
        let members = self.members.clone();
        let groups = self.config.groups.clone();
        let interval = Duration::from_millis(self.config.demo_interval_ms);
        self.tasks.push(tokio::spawn(async move {
            let mut counter = 0u64;
            loop {
                tokio::time::sleep(interval).await;
                for group in &groups {
                    match set_on_leader(&members, group, counter).await {
                        Ok(member) => {
                            log::info!("member {} set counter@{} to {}", member, group, counter)
                        }
                        Err(e) => log::warn!("demo write to group {} failed: {}", group, e),
                    }
                }
                counter += 1;
            }
        }));
    }
}

async fn set_on_leader(members: &[Member], group: &str, value: u64) -> cpraft::Result<MemberId> {
    let name = format!("counter@{}", group);
    let mut last_error = Error::NotLeader { leader: None };
    for member in members {
        let proxy = member.atomic_refs.atomic_ref::<u64>(&name)?;
        match proxy.set(&value).await {
            Ok(()) => return Ok(member.manager.local_member()),
            Err(e @ Error::NotLeader { .. }) => last_error = e,
            Err(e) => return Err(e),
        }
    }
    Err(last_error)
}
