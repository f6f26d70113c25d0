use std::sync::Arc;

use async_trait::async_trait;
use parrot_utils::error::Error;
use parrot_utils::ParrotResult;
use tracing::info;

use crate::cluster::{cluster_view, CoordinationBackend};
use crate::control::ControlPlane;
use crate::model::{DesiredState, ProcessorDefinition, ProcessorNode};
use crate::store::Registry;

/// Executes control commands against the registry. Assignments follow from
/// the coordinator reacting to the desired states written here.
pub struct ProcessorService {
    registry: Arc<Registry>,
    backend: Arc<dyn CoordinationBackend>,
}

impl ProcessorService {
    pub fn new(registry: Arc<Registry>, backend: Arc<dyn CoordinationBackend>) -> Self {
        Self { registry, backend }
    }

    async fn set_desired(&self, id: &str, state: DesiredState) -> ParrotResult<ProcessorDefinition> {
        let def = self.registry.set_desired_state(id, state).await?;
        info!(processor = %id, desired = %state, "desired state set");
        Ok(def)
    }
}

#[async_trait]
impl ControlPlane for ProcessorService {
    async fn list_processors(&self) -> ParrotResult<Vec<String>> {
        Ok(self.registry.list().await?.into_iter().map(|def| def.id).collect())
    }

    async fn get_processor(&self, id: &str) -> ParrotResult<ProcessorDefinition> {
        self.registry.get(id).await?.ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn add_processor(&self, definition: ProcessorDefinition) -> ParrotResult<ProcessorDefinition> {
        let def = self.registry.insert_new(definition).await?;
        info!(processor = %def.id, desired = %def.desired_state, "processor added");
        Ok(def)
    }

    async fn processor_cluster(&self, id: &str) -> ParrotResult<Vec<ProcessorNode>> {
        cluster_view(&self.registry, self.backend.as_ref(), id).await
    }

    async fn start_processor(&self, id: &str) -> ParrotResult<ProcessorDefinition> {
        self.set_desired(id, DesiredState::Running).await
    }

    async fn stop_processor(&self, id: &str) -> ParrotResult<ProcessorDefinition> {
        self.set_desired(id, DesiredState::Stopped).await
    }

    async fn restart_processor(&self, id: &str) -> ParrotResult<ProcessorDefinition> {
        let def = self.registry.request_restart(id).await?;
        info!(processor = %id, generation = def.restart_generation, "restart requested");
        Ok(def)
    }

    async fn delete_processor(&self, id: &str) -> ParrotResult<()> {
        let def = self.get_processor(id).await?;
        if def.desired_state == DesiredState::Running {
            return Err(Error::precondition(format!(
                "processor '{id}' is RUNNING; stop it before deleting"
            )));
        }
        // a start racing in between makes the registry reject the delete
        self.set_desired(id, DesiredState::Absent).await?;
        self.registry.delete(id).await?;
        info!(processor = %id, "processor deleted");
        Ok(())
    }
}
