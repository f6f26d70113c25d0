use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cluster::backend::CoordinationBackend;
use crate::model::NodeId;

/// Lease key every node competes for.
pub const LEADER_KEY: &str = "parrot/leader";

/// Consecutive renewal errors after which the leader steps down.
const MAX_RENEW_FAILURES: u32 = 3;

/// Competes for the leader lease and publishes leadership on a watch channel.
pub struct LeaderElector {
    backend: Arc<dyn CoordinationBackend>,
    node: NodeId,
    ttl: Duration,
    leader_signal: watch::Sender<bool>,
}

impl LeaderElector {
    pub fn new(backend: Arc<dyn CoordinationBackend>, node: NodeId, ttl: Duration) -> Self {
        let (leader_signal, _) = watch::channel(false);
        Self { backend, node, ttl, leader_signal }
    }

    pub fn is_leader(&self) -> bool {
        *self.leader_signal.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leader_signal.subscribe()
    }

    fn set_leader(&self, leader: bool) {
        let changed = self.leader_signal.send_if_modified(|current| {
            let changed = *current != leader;
            *current = leader;
            changed
        });
        if changed && leader {
            info!(node = %self.node, "acquired cluster leadership");
        } else if changed {
            info!(node = %self.node, "stepped down from cluster leadership");
        }
    }

    /// Election loop. Returns once `shutdown` fires, releasing the lease if
    /// this node holds it.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let holder = self.node.as_str();
        let ttl_ms = self.ttl.as_millis() as u64;
        let retry_wait = Duration::from_millis((ttl_ms / 10).clamp(10, 1000));

        'elect: loop {
            match self.backend.acquire_lock(LEADER_KEY, holder, self.ttl).await {
                Ok(true) => {
                    self.set_leader(true);
                    let renew_interval = Duration::from_millis((ttl_ms / 3).max(1));
                    let mut failures = 0;
                    loop {
                        let wait = if failures > 0 { retry_wait } else { renew_interval };
                        tokio::select! {
                            _ = sleep(wait + jitter(100)) => {}
                            _ = shutdown.changed() => break 'elect,
                        }
                        match self.backend.renew_lock(LEADER_KEY, holder, self.ttl).await {
                            Ok(true) => failures = 0,
                            Ok(false) => {
                                warn!(node = %self.node, "leader lease lost during renewal");
                                self.set_leader(false);
                                break;
                            }
                            Err(e) => {
                                failures += 1;
                                debug!(node = %self.node, error = %e, failures, "leader renewal failed");
                                if failures >= MAX_RENEW_FAILURES {
                                    warn!(node = %self.node, "too many renewal errors, stepping down");
                                    self.set_leader(false);
                                    break;
                                }
                            }
                        }
                    }
                }
                Ok(false) => self.set_leader(false),
                Err(e) => {
                    debug!(node = %self.node, error = %e, "leader election attempt failed");
                    self.set_leader(false);
                }
            }
            tokio::select! {
                _ = sleep(retry_wait + jitter(50)) => {}
                _ = shutdown.changed() => break,
            }
        }

        if self.is_leader() {
            if let Err(e) = self.backend.release_lock(LEADER_KEY, holder).await {
                warn!(node = %self.node, error = %e, "failed to release leader lease");
            }
        }
        self.set_leader(false);
    }
}

fn jitter(max_ms: u64) -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    Duration::from_millis(nanos % max_ms.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::backend::MemoryBackend;

    async fn wait_for(rx: &mut watch::Receiver<bool>, value: bool) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| *v == value))
            .await
            .expect("leadership did not change in time")
            .unwrap();
    }

    #[tokio::test]
    async fn single_node_becomes_leader_and_releases_on_shutdown() {
        let backend = Arc::new(MemoryBackend::new());
        let elector = Arc::new(LeaderElector::new(
            backend.clone(),
            "n1".into(),
            Duration::from_millis(300),
        ));
        let mut rx = elector.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(elector.clone().run(stop_rx));

        wait_for(&mut rx, true).await;
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        assert!(!elector.is_leader());
        assert!(backend.acquire_lock(LEADER_KEY, "n2", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn only_one_of_two_nodes_leads() {
        let backend: Arc<dyn CoordinationBackend> = Arc::new(MemoryBackend::new());
        let ttl = Duration::from_millis(300);
        let a = Arc::new(LeaderElector::new(backend.clone(), "a".into(), ttl));
        let b = Arc::new(LeaderElector::new(backend.clone(), "b".into(), ttl));
        let mut rx_a = a.subscribe();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let ta = tokio::spawn(a.clone().run(stop_rx.clone()));
        wait_for(&mut rx_a, true).await;
        let tb = tokio::spawn(b.clone().run(stop_rx));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(a.is_leader());
        assert!(!b.is_leader());
        ta.abort();
        tb.abort();
    }

    #[tokio::test]
    async fn steps_down_when_backend_is_unreachable() {
        let backend = Arc::new(MemoryBackend::new());
        let elector = Arc::new(LeaderElector::new(
            backend.clone(),
            "n1".into(),
            Duration::from_millis(150),
        ));
        let mut rx = elector.subscribe();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(elector.clone().run(stop_rx));

        wait_for(&mut rx, true).await;
        backend.set_available(false);
        wait_for(&mut rx, false).await;
        backend.set_available(true);
        wait_for(&mut rx, true).await;
        task.abort();
    }
}
