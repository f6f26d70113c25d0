use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use parrot_utils::ParrotResult;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::cluster::{ClusterCoordinator, CoordinationBackend, Heartbeater, LeaderElector};
use crate::config::{load_processors_dir, NodeConfig};
use crate::control::ProcessorService;
use crate::lifecycle::{LifecycleManager, WorkerContext};
use crate::metrics;
use crate::model::NodeId;
use crate::sinks::SinkResolver;
use crate::sources::SourceProvider;
use crate::store::Registry;

/// One Parrot node, wired explicitly from its configuration and the
/// collaborators it talks to.
///
/// [`start`](Self::start) brings components up in this order:
///
/// 1. processor registry (opened from `registry_path`, or in memory)
/// 2. definitions seeded from `processors_dir`
/// 3. heartbeater
/// 4. leader elector
/// 5. cluster coordinator
/// 6. lifecycle manager
/// 7. metrics exporter, when `metrics_addr` is set
///
/// and [`NodeHandle::shutdown`] tears them down in reverse.
pub struct ParrotNode {
    config: NodeConfig,
    backend: Arc<dyn CoordinationBackend>,
    sources: Arc<dyn SourceProvider>,
    sinks: SinkResolver,
    registry: Option<Arc<Registry>>,
}

impl ParrotNode {
    pub fn new(
        config: NodeConfig,
        backend: Arc<dyn CoordinationBackend>,
        sources: Arc<dyn SourceProvider>,
    ) -> Self {
        Self { config, backend, sources, sinks: SinkResolver::new(), registry: None }
    }

    /// Use an already open registry instead of the configured one, so several
    /// nodes of one process share it.
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_sinks(mut self, sinks: SinkResolver) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub async fn start(self) -> ParrotResult<NodeHandle> {
        let config = self.config;
        let node = config.node_id.clone();
        tracing::info!(
            node = %node,
            zookeeper_hosts = %config.zookeeper_hosts,
            kafka_brokers = %config.kafka_brokers,
            debezium_api_url = config.debezium_api_url.as_deref().unwrap_or("-"),
            parrot_api_url = config.parrot_api_url.as_deref().unwrap_or("-"),
            "starting parrot node"
        );

        let registry = match self.registry {
            Some(registry) => registry,
            None => match &config.registry_path {
                Some(path) => Arc::new(Registry::open(path)?),
                None => Arc::new(Registry::in_memory()?),
            },
        };

        if let Some(dir) = &config.processors_dir {
            for def in load_processors_dir(dir)? {
                if registry.get(&def.id).await?.is_none() {
                    tracing::info!(processor = %def.id, desired = %def.desired_state, "seeding processor definition");
                    registry.insert_new(def).await?;
                }
            }
        }

        let mut stages = Vec::new();

        let (stop, stopped) = watch::channel(false);
        let heartbeater = Heartbeater::new(self.backend.clone(), node.clone(), config.cluster.heartbeat_interval)
            .spawn(stopped);
        stages.push(Stage { name: "heartbeater", stop, task: heartbeater });

        let elector = Arc::new(LeaderElector::new(
            self.backend.clone(),
            node.clone(),
            config.cluster.leader_ttl,
        ));
        let leader = elector.subscribe();
        let (stop, stopped) = watch::channel(false);
        stages.push(Stage { name: "leader elector", stop, task: tokio::spawn(elector.run(stopped)) });

        let coordinator = Arc::new(ClusterCoordinator::new(
            self.backend.clone(),
            registry.clone(),
            &config.cluster,
        ));
        let (stop, stopped) = watch::channel(false);
        stages.push(Stage {
            name: "coordinator",
            stop,
            task: tokio::spawn(coordinator.run(leader.clone(), stopped)),
        });

        let manager = LifecycleManager::new(WorkerContext {
            node: node.clone(),
            registry: registry.clone(),
            backend: self.backend.clone(),
            sources: self.sources,
            sinks: self.sinks,
            lifecycle: config.lifecycle.clone(),
            route: config.route.clone(),
        });
        let (stop, stopped) = watch::channel(false);
        stages.push(Stage { name: "lifecycle manager", stop, task: tokio::spawn(manager.run(stopped)) });

        let exporter = match &config.metrics_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr.as_str())?;
                let local = listener.local_addr()?;
                tracing::info!(node = %node, addr = %local, "serving metrics");
                let (task, stop) = metrics::start_exporter(listener);
                Some(Exporter { addr: local, stop, task })
            }
            None => None,
        };

        tracing::info!(node = %node, "parrot node started");
        Ok(NodeHandle { node, registry, backend: self.backend, leader, stages, exporter })
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> ParrotResult<()> {
        let shutdown = tokio::signal::ctrl_c();
        self.run_with_shutdown(async {
            let _ = shutdown.await;
        })
        .await
    }

    /// Run until `shutdown` resolves, then tear down gracefully.
    pub async fn run_with_shutdown<F: Future>(self, shutdown: F) -> ParrotResult<()> {
        let handle = self.start().await?;
        shutdown.await;
        handle.shutdown().await;
        Ok(())
    }
}

struct Stage {
    name: &'static str,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Exporter {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// A started node.
pub struct NodeHandle {
    node: NodeId,
    registry: Arc<Registry>,
    backend: Arc<dyn CoordinationBackend>,
    leader: watch::Receiver<bool>,
    /// In start order.
    stages: Vec<Stage>,
    exporter: Option<Exporter>,
}

impl NodeHandle {
    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn is_leader(&self) -> bool {
        *self.leader.borrow()
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.exporter.as_ref().map(|e| e.addr)
    }

    /// Command surface backed by this node's registry.
    pub fn control_plane(&self) -> ProcessorService {
        ProcessorService::new(self.registry.clone(), self.backend.clone())
    }

    /// Stop every component in reverse start order, waiting for each.
    /// Running processors are drained and reported STOPPED first.
    pub async fn shutdown(mut self) {
        if let Some(exporter) = self.exporter.take() {
            let _ = exporter.stop.send(());
            let _ = exporter.task.await;
        }
        while let Some(stage) = self.stages.pop() {
            let _ = stage.stop.send(true);
            if let Err(e) = stage.task.await {
                tracing::warn!(node = %self.node, stage = stage.name, error = %e, "component ended abnormally");
            }
        }
        tracing::info!(node = %self.node, "parrot node shutdown complete");
    }

    /// Abort every component without teardown, as if the process crashed.
    /// The node's heartbeat and leader lease are left to expire.
    pub fn kill(mut self) {
        if let Some(exporter) = self.exporter.take() {
            exporter.task.abort();
        }
        for stage in self.stages.drain(..).rev() {
            stage.task.abort();
        }
        tracing::warn!(node = %self.node, "parrot node killed");
    }
}
