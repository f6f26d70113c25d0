//! Contract the core needs from the coordination service, plus an
//! in-process implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parrot_utils::error::Error;
use parrot_utils::ParrotResult;
use tokio::sync::watch;

use crate::cluster::assignment::AssignmentTable;
use crate::model::NodeId;

#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Take the lease `key` for `holder` if it is free or expired.
    async fn acquire_lock(&self, key: &str, holder: &str, ttl: Duration) -> ParrotResult<bool>;

    /// Extend a lease still held by `holder`. `Ok(false)` means it was lost.
    async fn renew_lock(&self, key: &str, holder: &str, ttl: Duration) -> ParrotResult<bool>;

    async fn release_lock(&self, key: &str, holder: &str) -> ParrotResult<()>;

    async fn heartbeat(&self, node: &NodeId, at_ms: i64) -> ParrotResult<()>;

    /// Last heartbeat of every node that has not been removed.
    async fn heartbeats(&self) -> ParrotResult<HashMap<NodeId, i64>>;

    async fn remove_node(&self, node: &NodeId) -> ParrotResult<()>;

    async fn load_assignments(&self) -> ParrotResult<AssignmentTable>;

    /// Store `table` if the stored version is still `expected_version`.
    /// The stored table gets version `expected_version + 1`.
    async fn store_assignments(
        &self,
        expected_version: u64,
        table: AssignmentTable,
    ) -> ParrotResult<AssignmentTable>;

    fn subscribe_assignments(&self) -> watch::Receiver<AssignmentTable>;
}

struct Lease {
    holder: String,
    expires_at: Instant,
}

/// Coordination state shared by all nodes of a single process.
pub struct MemoryBackend {
    available: AtomicBool,
    leases: Mutex<HashMap<String, Lease>>,
    heartbeats: Mutex<HashMap<NodeId, i64>>,
    assignments: watch::Sender<AssignmentTable>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (assignments, _) = watch::channel(AssignmentTable::default());
        Self {
            available: AtomicBool::new(true),
            leases: Mutex::new(HashMap::new()),
            heartbeats: Mutex::new(HashMap::new()),
            assignments,
        }
    }

    /// Simulate losing (or regaining) the connection to the service.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> ParrotResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Coordination("coordination service unreachable".into()))
        }
    }

    fn poisoned(what: &str) -> Error {
        Error::Coordination(format!("{what} lock poisoned"))
    }
}

#[async_trait]
impl CoordinationBackend for MemoryBackend {
    async fn acquire_lock(&self, key: &str, holder: &str, ttl: Duration) -> ParrotResult<bool> {
        self.check()?;
        let mut leases = self.leases.lock().map_err(|_| Self::poisoned("lease"))?;
        let now = Instant::now();
        match leases.get(key) {
            Some(lease) if lease.holder != holder && lease.expires_at > now => Ok(false),
            _ => {
                leases.insert(
                    key.to_string(),
                    Lease { holder: holder.to_string(), expires_at: now + ttl },
                );
                Ok(true)
            }
        }
    }

    async fn renew_lock(&self, key: &str, holder: &str, ttl: Duration) -> ParrotResult<bool> {
        self.check()?;
        let mut leases = self.leases.lock().map_err(|_| Self::poisoned("lease"))?;
        let now = Instant::now();
        match leases.get_mut(key) {
            Some(lease) if lease.holder == holder && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, key: &str, holder: &str) -> ParrotResult<()> {
        self.check()?;
        let mut leases = self.leases.lock().map_err(|_| Self::poisoned("lease"))?;
        if leases.get(key).is_some_and(|lease| lease.holder == holder) {
            leases.remove(key);
        }
        Ok(())
    }

    async fn heartbeat(&self, node: &NodeId, at_ms: i64) -> ParrotResult<()> {
        self.check()?;
        let mut beats = self.heartbeats.lock().map_err(|_| Self::poisoned("heartbeat"))?;
        beats.insert(node.clone(), at_ms);
        Ok(())
    }

    async fn heartbeats(&self) -> ParrotResult<HashMap<NodeId, i64>> {
        self.check()?;
        let beats = self.heartbeats.lock().map_err(|_| Self::poisoned("heartbeat"))?;
        Ok(beats.clone())
    }

    async fn remove_node(&self, node: &NodeId) -> ParrotResult<()> {
        self.check()?;
        let mut beats = self.heartbeats.lock().map_err(|_| Self::poisoned("heartbeat"))?;
        beats.remove(node);
        Ok(())
    }

    async fn load_assignments(&self) -> ParrotResult<AssignmentTable> {
        self.check()?;
        Ok(self.assignments.borrow().clone())
    }

    async fn store_assignments(
        &self,
        expected_version: u64,
        mut table: AssignmentTable,
    ) -> ParrotResult<AssignmentTable> {
        self.check()?;
        let mut outcome = Ok(());
        self.assignments.send_if_modified(|current| {
            if current.version != expected_version {
                outcome = Err(Error::Coordination(format!(
                    "assignment version moved from {expected_version} to {}",
                    current.version
                )));
                return false;
            }
            table.version = expected_version + 1;
            *current = table.clone();
            true
        });
        outcome.map(|_| table)
    }

    fn subscribe_assignments(&self) -> watch::Receiver<AssignmentTable> {
        self.assignments.subscribe()
    }
}
