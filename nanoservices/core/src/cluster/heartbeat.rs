use std::sync::Arc;
use std::time::Duration;

use parrot_utils::ParrotResult;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cluster::backend::CoordinationBackend;
use crate::model::{now_ms, NodeId};

/// Publishes this node's liveness to the coordination service.
pub struct Heartbeater {
    backend: Arc<dyn CoordinationBackend>,
    node: NodeId,
    interval: Duration,
}

impl Heartbeater {
    pub fn new(backend: Arc<dyn CoordinationBackend>, node: NodeId, interval: Duration) -> Self {
        Self { backend, node, interval }
    }

    pub async fn beat(&self) -> ParrotResult<()> {
        self.backend.heartbeat(&self.node, now_ms()).await
    }

    /// Beat every interval until `shutdown` fires, then leave the cluster.
    ///
    /// While the service is unreachable the node is provisionally demoted: it
    /// keeps its local processors and keeps retrying until it reconnects.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut connected = true;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                match self.beat().await {
                    Ok(()) if !connected => {
                        tracing::info!(node = %self.node, "coordination service reachable again");
                        connected = true;
                    }
                    Ok(()) => {}
                    Err(e) if connected => {
                        tracing::warn!(node = %self.node, error = %e, "heartbeat failed, node provisionally demoted");
                        connected = false;
                    }
                    Err(e) => tracing::debug!(node = %self.node, error = %e, "heartbeat retry failed"),
                }
            }
            if let Err(e) = self.backend.remove_node(&self.node).await {
                tracing::warn!(node = %self.node, error = %e, "failed to leave cluster cleanly");
            }
        })
    }
}
