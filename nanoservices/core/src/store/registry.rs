use std::path::Path;

use parrot_utils::error::Error;
use parrot_utils::{ParrotResult, SourceOffset};
use tokio::sync::{watch, Mutex};

use crate::model::{now_ms, DesiredState, ProcessorDefinition, ProcessorRuntimeStatus};
use crate::store::db::Store;

/// Source of truth for which processors exist and what state they should be
/// in.
///
/// Every operation runs under one lock, so operations on the same processor id
/// are linearizable. Definition changes bump a revision that the coordinator
/// and lifecycle loops watch to react without waiting for their next tick.
pub struct Registry {
    store: Mutex<Store>,
    revision: watch::Sender<u64>,
}

impl Registry {
    pub fn new(store: Store) -> Self {
        let (revision, _) = watch::channel(0);
        Self { store: Mutex::new(store), revision }
    }

    pub fn in_memory() -> ParrotResult<Self> {
        Ok(Self::new(Store::in_memory()?))
    }

    pub fn open(path: impl AsRef<Path>) -> ParrotResult<Self> {
        Ok(Self::new(Store::open(path)?))
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Submit a definition. An existing processor keeps its desired state and
    /// restart generation; only control commands change those.
    pub async fn put(&self, mut def: ProcessorDefinition) -> ParrotResult<ProcessorDefinition> {
        def.validate()?;
        let store = self.store.lock().await;
        if let Some(existing) = store.processor(&def.id)? {
            def.desired_state = existing.desired_state;
            def.restart_generation = existing.restart_generation;
        }
        store.upsert_processor(&def, now_ms())?;
        drop(store);
        self.bump();
        Ok(def)
    }

    /// Submit a definition that must not exist yet.
    pub async fn insert_new(&self, def: ProcessorDefinition) -> ParrotResult<ProcessorDefinition> {
        def.validate()?;
        let store = self.store.lock().await;
        if store.processor(&def.id)?.is_some() {
            return Err(Error::precondition(format!("processor '{}' already exists", def.id)));
        }
        store.upsert_processor(&def, now_ms())?;
        drop(store);
        self.bump();
        Ok(def)
    }

    pub async fn get(&self, id: &str) -> ParrotResult<Option<ProcessorDefinition>> {
        self.store.lock().await.processor(id)
    }

    pub async fn list(&self) -> ParrotResult<Vec<ProcessorDefinition>> {
        self.store.lock().await.processors()
    }

    pub async fn set_desired_state(
        &self,
        id: &str,
        state: DesiredState,
    ) -> ParrotResult<ProcessorDefinition> {
        let store = self.store.lock().await;
        let mut def = store.processor(id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;
        if def.desired_state != state {
            def.desired_state = state;
            store.upsert_processor(&def, now_ms())?;
            drop(store);
            self.bump();
        }
        Ok(def)
    }

    /// Restart command: the processor should run, and whatever instance is
    /// running now must be torn down and started again.
    pub async fn request_restart(&self, id: &str) -> ParrotResult<ProcessorDefinition> {
        let store = self.store.lock().await;
        let mut def = store.processor(id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;
        def.desired_state = DesiredState::Running;
        def.restart_generation += 1;
        store.upsert_processor(&def, now_ms())?;
        drop(store);
        self.bump();
        Ok(def)
    }

    /// Remove a processor. Its desired state must already be `ABSENT`.
    pub async fn delete(&self, id: &str) -> ParrotResult<()> {
        let store = self.store.lock().await;
        let def = store.processor(id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;
        if def.desired_state != DesiredState::Absent {
            return Err(Error::precondition(format!(
                "processor '{id}' is {}; stop it before deleting",
                def.desired_state
            )));
        }
        store.delete_processor(id)?;
        drop(store);
        self.bump();
        Ok(())
    }

    pub async fn report_status(&self, status: &ProcessorRuntimeStatus) -> ParrotResult<()> {
        self.store.lock().await.upsert_status(status)
    }

    pub async fn statuses(&self, id: &str) -> ParrotResult<Vec<ProcessorRuntimeStatus>> {
        self.store.lock().await.statuses_for(id)
    }

    pub async fn all_statuses(&self) -> ParrotResult<Vec<ProcessorRuntimeStatus>> {
        self.store.lock().await.all_statuses()
    }

    pub async fn commit_offset(&self, id: &str, offset: SourceOffset) -> ParrotResult<()> {
        self.store.lock().await.commit_offset(id, offset, now_ms())
    }

    pub async fn last_offset(&self, id: &str) -> ParrotResult<Option<SourceOffset>> {
        self.store.lock().await.last_offset(id)
    }
}
