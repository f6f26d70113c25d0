use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::lifecycle::worker::{ProcessorWorker, WorkerContext};

/// Runs one [`ProcessorWorker`] for every processor assigned to this node.
///
/// Workers are spawned when an assignment to this node appears and exit on
/// their own once the assignment is gone. On shutdown every worker drains its
/// engine and reports STOPPED before [`run`](Self::run) returns. Dropping the
/// `run` future aborts all workers without any teardown.
pub struct LifecycleManager {
    ctx: Arc<WorkerContext>,
}

impl LifecycleManager {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (stop_workers, worker_shutdown) = watch::channel(false);
        let mut workers: JoinSet<String> = JoinSet::new();
        let mut active: HashMap<String, AbortHandle> = HashMap::new();
        let mut assignments = self.ctx.backend.subscribe_assignments();
        let mut ticker = tokio::time::interval(self.ctx.lifecycle.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            active.retain(|_, handle| !handle.is_finished());

            let owned: Vec<String> = assignments
                .borrow_and_update()
                .owned_by(&self.ctx.node)
                .map(str::to_string)
                .collect();
            for processor_id in owned {
                if active.contains_key(&processor_id) {
                    continue;
                }
                match ProcessorWorker::new(&processor_id, self.ctx.clone()).await {
                    Ok(worker) => {
                        info!(processor = %processor_id, node = %self.ctx.node, "processor assigned to this node");
                        let handle = workers.spawn(worker.run(worker_shutdown.clone()));
                        active.insert(processor_id, handle);
                    }
                    Err(e) => warn!(processor = %processor_id, error = %e, "could not start worker"),
                }
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = assignments.changed() => if changed.is_err() { break },
                Some(done) = workers.join_next(), if !workers.is_empty() => match done {
                    Ok(processor_id) => debug!(processor = %processor_id, "worker finished"),
                    Err(e) => warn!(error = %e, "worker task failed"),
                },
                _ = shutdown.changed() => break,
            }
        }

        info!(node = %self.ctx.node, workers = workers.len(), "draining processors");
        let _ = stop_workers.send(true);
        while let Some(done) = workers.join_next().await {
            if let Err(e) = done {
                warn!(error = %e, "worker task failed");
            }
        }
        debug!(node = %self.ctx.node, "lifecycle manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{CoordinationBackend, MemoryBackend};
    use crate::config::{LifecycleConfig, RouteConfig};
    use crate::model::{
        DesiredState, DialectConfig, LifecycleState, ProcessorDefinition, SinkConfig, SourceConfig,
    };
    use crate::sinks::SinkResolver;
    use crate::sources::MemoryChangeLog;
    use crate::store::Registry;
    use std::time::Duration;

    async fn state_of(registry: &Registry, id: &str) -> Option<LifecycleState> {
        registry.statuses(id).await.unwrap().first().map(|s| s.state)
    }

    #[tokio::test]
    async fn spawns_workers_for_owned_processors_and_drains_on_shutdown() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let registry = Arc::new(Registry::in_memory().unwrap());
        for id in ["mine", "theirs"] {
            registry
                .put(ProcessorDefinition {
                    id: id.into(),
                    description: None,
                    source: SourceConfig { topic: id.into(), properties: Default::default() },
                    sink: SinkConfig {
                        database: "warehouse".into(),
                        dialect: DialectConfig::Sqlite { root: root.path().to_path_buf() },
                    },
                    desired_state: DesiredState::Running,
                    restart_generation: 0,
                })
                .await
                .unwrap();
        }
        let mut table = backend.load_assignments().await.unwrap();
        table.assign("mine", "n1".into()).unwrap();
        table.assign("theirs", "n2".into()).unwrap();
        backend.store_assignments(table.version, table).await.unwrap();

        let manager = LifecycleManager::new(WorkerContext {
            node: "n1".into(),
            registry: registry.clone(),
            backend: backend.clone(),
            sources: Arc::new(MemoryChangeLog::new()),
            sinks: SinkResolver::new(),
            lifecycle: LifecycleConfig {
                tick_interval: Duration::from_millis(20),
                grace_period: Duration::from_millis(30),
                ..LifecycleConfig::default()
            },
            route: RouteConfig::default(),
        });
        let (shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(manager.run(shutdown));

        tokio::time::timeout(Duration::from_secs(5), async {
            while state_of(&registry, "mine").await != Some(LifecycleState::Running) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(state_of(&registry, "theirs").await, None);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(state_of(&registry, "mine").await, Some(LifecycleState::Stopped));
    }
}
