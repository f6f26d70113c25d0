use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parrot_utils::error::Error;
use parrot_utils::ParrotResult;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::cluster::assignment::{plan, AssignmentChange, AssignmentPlan, Candidate};
use crate::cluster::backend::CoordinationBackend;
use crate::cluster::membership::Membership;
use crate::config::ClusterConfig;
use crate::metrics;
use crate::model::{now_ms, LifecycleState, NodeId, ProcessorNode};
use crate::store::Registry;

/// Leader-side control loop that keeps the assignment table in line with the
/// registry and the live node set.
pub struct ClusterCoordinator {
    backend: Arc<dyn CoordinationBackend>,
    registry: Arc<Registry>,
    membership: Mutex<Membership>,
    interval: Duration,
}

impl ClusterCoordinator {
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        registry: Arc<Registry>,
        config: &ClusterConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            membership: Mutex::new(Membership::new(
                config.heartbeat_interval,
                config.max_missed_heartbeats,
            )),
            interval: config.reconcile_interval,
        }
    }

    pub async fn live_nodes(&self) -> BTreeSet<NodeId> {
        self.membership.lock().await.live()
    }

    pub async fn reconcile(&self) -> ParrotResult<AssignmentPlan> {
        self.reconcile_at(now_ms()).await
    }

    /// One assignment pass as of `now_ms`.
    ///
    /// Revocations are stored before any new assignment, so a processor is
    /// never recorded with two owners, not even across the two writes.
    pub async fn reconcile_at(&self, now_ms: i64) -> ParrotResult<AssignmentPlan> {
        let heartbeats = self.backend.heartbeats().await?;
        let mut membership = self.membership.lock().await;
        let change = membership.observe(&heartbeats, now_ms);
        for node in &change.joined {
            info!(node = %node, "node joined");
        }
        for node in &change.departed {
            warn!(node = %node, "node departed after missed heartbeats");
            metrics::inc_node_departed();
            self.backend.remove_node(node).await?;
        }
        let live = membership.live();

        let definitions = self.registry.list().await?;
        let statuses = self.registry.all_statuses().await?;
        let candidates: Vec<Candidate> = definitions
            .iter()
            .map(|def| Candidate {
                processor_id: def.id.clone(),
                desired: def.desired_state,
                errored: statuses.iter().any(|s| {
                    s.processor_id == def.id
                        && s.state == LifecycleState::Error
                        && s.generation == def.restart_generation
                }),
            })
            .collect();

        let mut table = self.backend.load_assignments().await?;
        let pass = plan(&table, &candidates, &live);

        if !pass.revokes.is_empty() {
            for change in &pass.revokes {
                if let AssignmentChange::Revoke { processor_id, from } = change {
                    info!(processor = %processor_id, node = %from, "revoking assignment");
                    table.revoke(processor_id);
                }
            }
            table = self.backend.store_assignments(table.version, table).await?;
        }
        if !pass.assigns.is_empty() {
            for change in &pass.assigns {
                if let AssignmentChange::Assign { processor_id, to } = change {
                    let epoch = table.assign(processor_id, to.clone())?;
                    info!(processor = %processor_id, node = %to, epoch, "assigning processor");
                }
            }
            table = self.backend.store_assignments(table.version, table).await?;
        }

        membership.record_ownership(&table);
        metrics::inc_assignment_pass();
        debug!(live = live.len(), assigned = table.len(), "assignment pass complete");
        Ok(pass)
    }

    /// Run assignment passes while this node leads, on every tick and on
    /// every registry change, until `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        mut leader: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut revisions = self.registry.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = revisions.changed() => if changed.is_err() { break },
                changed = leader.changed() => if changed.is_err() { break },
                _ = shutdown.changed() => break,
            }
            if !*leader.borrow_and_update() {
                continue;
            }
            if let Err(e) = self.reconcile().await {
                warn!(error = %e, "assignment pass failed");
            }
        }
        debug!("coordinator stopped");
    }
}

/// Every node that reported status for `processor_id`, plus the recorded
/// owner if it has not reported yet.
pub async fn cluster_view(
    registry: &Registry,
    backend: &dyn CoordinationBackend,
    processor_id: &str,
) -> ParrotResult<Vec<ProcessorNode>> {
    if registry.get(processor_id).await?.is_none() {
        return Err(Error::NotFound(processor_id.to_string()));
    }
    let table = backend.load_assignments().await?;
    let owner = table.owner(processor_id).map(|a| a.node_id.clone());

    let mut nodes: Vec<ProcessorNode> = registry
        .statuses(processor_id)
        .await?
        .into_iter()
        .map(|status| ProcessorNode {
            owner: owner.as_ref() == Some(&status.node_id),
            node_id: status.node_id,
            state: status.state,
            last_error: status.last_error,
            updated_at_ms: status.updated_at_ms,
        })
        .collect();

    if let Some(owner) = owner {
        if !nodes.iter().any(|n| n.node_id == owner) {
            nodes.insert(
                0,
                ProcessorNode {
                    node_id: owner,
                    state: LifecycleState::Created,
                    last_error: None,
                    updated_at_ms: 0,
                    owner: true,
                },
            );
        }
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::backend::MemoryBackend;
    use crate::model::{
        DesiredState, DialectConfig, ProcessorDefinition, ProcessorRuntimeStatus, SinkConfig,
        SourceConfig,
    };

    fn definition(id: &str) -> ProcessorDefinition {
        ProcessorDefinition {
            id: id.to_string(),
            description: None,
            source: SourceConfig { topic: format!("cdc.{id}"), properties: Default::default() },
            sink: SinkConfig {
                database: "warehouse".into(),
                dialect: DialectConfig::Sqlite { root: "/tmp/parrot".into() },
            },
            desired_state: DesiredState::Stopped,
            restart_generation: 0,
        }
    }

    async fn setup() -> (Arc<MemoryBackend>, Arc<Registry>, ClusterCoordinator) {
        let backend = Arc::new(MemoryBackend::new());
        let registry = Arc::new(Registry::in_memory().unwrap());
        let config = ClusterConfig {
            heartbeat_interval: Duration::from_millis(100),
            max_missed_heartbeats: 3,
            ..ClusterConfig::default()
        };
        let coordinator = ClusterCoordinator::new(backend.clone(), registry.clone(), &config);
        (backend, registry, coordinator)
    }

    async fn running(registry: &Registry, id: &str) {
        registry.put(definition(id)).await.unwrap();
        registry.set_desired_state(id, DesiredState::Running).await.unwrap();
    }

    #[tokio::test]
    async fn assigns_running_processors_to_live_nodes() {
        let (backend, registry, coordinator) = setup().await;
        backend.heartbeat(&"n1".into(), 1_000).await.unwrap();
        backend.heartbeat(&"n2".into(), 1_000).await.unwrap();
        running(&registry, "a").await;
        running(&registry, "b").await;
        registry.put(definition("idle")).await.unwrap();

        coordinator.reconcile_at(1_000).await.unwrap();

        let table = backend.load_assignments().await.unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.is_owner("a", &"n1".into()));
        assert!(table.is_owner("b", &"n2".into()));
        assert!(table.owner("idle").is_none());
    }

    #[tokio::test]
    async fn departed_node_loses_processors_to_survivor() {
        let (backend, registry, coordinator) = setup().await;
        backend.heartbeat(&"n1".into(), 1_000).await.unwrap();
        running(&registry, "a").await;
        coordinator.reconcile_at(1_000).await.unwrap();
        let first_epoch = backend.load_assignments().await.unwrap().owner("a").unwrap().epoch;

        // n1 stops beating, n2 joins
        backend.heartbeat(&"n2".into(), 1_350).await.unwrap();
        let pass = coordinator.reconcile_at(1_350).await.unwrap();
        assert_eq!(pass.revokes.len(), 1);

        let table = backend.load_assignments().await.unwrap();
        let owner = table.owner("a").unwrap();
        assert_eq!(owner.node_id, NodeId::from("n2"));
        assert!(owner.epoch > first_epoch);
        assert!(!backend.heartbeats().await.unwrap().contains_key(&NodeId::from("n1")));
    }

    #[tokio::test]
    async fn stop_revokes_and_errored_processor_stays_unassigned() {
        let (backend, registry, coordinator) = setup().await;
        backend.heartbeat(&"n1".into(), 0).await.unwrap();
        running(&registry, "a").await;
        coordinator.reconcile_at(0).await.unwrap();

        registry.set_desired_state("a", DesiredState::Stopped).await.unwrap();
        coordinator.reconcile_at(10).await.unwrap();
        assert!(backend.load_assignments().await.unwrap().is_empty());

        registry.set_desired_state("a", DesiredState::Running).await.unwrap();
        registry
            .report_status(&ProcessorRuntimeStatus {
                processor_id: "a".into(),
                node_id: "n1".into(),
                state: LifecycleState::Error,
                last_error: Some("boom".into()),
                generation: 0,
                updated_at_ms: 20,
            })
            .await
            .unwrap();
        coordinator.reconcile_at(20).await.unwrap();
        assert!(backend.load_assignments().await.unwrap().is_empty());

        // a restart moves past the failed generation
        registry.request_restart("a").await.unwrap();
        coordinator.reconcile_at(30).await.unwrap();
        assert!(backend.load_assignments().await.unwrap().is_owner("a", &"n1".into()));
    }

    #[tokio::test]
    async fn unreachable_backend_fails_the_pass() {
        let (backend, _registry, coordinator) = setup().await;
        backend.set_available(false);
        let err = coordinator.reconcile_at(0).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn cluster_view_flags_the_owner() {
        let (backend, registry, coordinator) = setup().await;
        backend.heartbeat(&"n1".into(), 0).await.unwrap();
        running(&registry, "a").await;
        coordinator.reconcile_at(0).await.unwrap();

        let view = cluster_view(&registry, backend.as_ref(), "a").await.unwrap();
        assert_eq!(view.len(), 1);
        assert!(view[0].owner);
        assert_eq!(view[0].state, LifecycleState::Created);

        let err = cluster_view(&registry, backend.as_ref(), "ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
