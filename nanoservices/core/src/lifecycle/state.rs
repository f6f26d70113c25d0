use std::sync::Arc;

use parrot_utils::error::Error;
use parrot_utils::ParrotResult;
use tracing::{info, warn};

use crate::metrics;
use crate::model::{now_ms, LifecycleState, NodeId, ProcessorRuntimeStatus};
use crate::store::Registry;

/// This node's view of one processor's lifecycle.
///
/// Every accepted transition is written to the registry as the node's
/// runtime status row. Transitions the state machine does not allow are
/// rejected and leave the state untouched.
pub struct ProcessorStateMachine {
    processor_id: String,
    node: NodeId,
    state: LifecycleState,
    last_error: Option<String>,
    generation: u64,
    registry: Arc<Registry>,
}

impl ProcessorStateMachine {
    pub fn new(processor_id: &str, node: NodeId, generation: u64, registry: Arc<Registry>) -> Self {
        Self {
            processor_id: processor_id.to_string(),
            node,
            state: LifecycleState::Created,
            last_error: None,
            generation,
            registry,
        }
    }

    /// Pick up where this node's last status row for the processor left off,
    /// or start at `CREATED` when there is none.
    pub async fn resume(
        processor_id: &str,
        node: NodeId,
        generation: u64,
        registry: Arc<Registry>,
    ) -> ParrotResult<Self> {
        let previous = registry
            .statuses(processor_id)
            .await?
            .into_iter()
            .find(|s| s.node_id == node);
        let mut machine = Self::new(processor_id, node, generation, registry);
        match previous {
            Some(status) => {
                machine.state = status.state;
                machine.last_error = status.last_error;
                machine.generation = status.generation;
            }
            None => machine.report().await?,
        }
        Ok(machine)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub async fn transition(&mut self, to: LifecycleState) -> ParrotResult<()> {
        self.enter(to, None).await
    }

    /// Move to `ERROR`, recording `cause` as the last error.
    pub async fn fail(&mut self, cause: &Error) -> ParrotResult<()> {
        self.enter(LifecycleState::Error, Some(cause.to_string())).await
    }

    async fn enter(&mut self, to: LifecycleState, error: Option<String>) -> ParrotResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        let from = std::mem::replace(&mut self.state, to);
        // a fresh start clears the previous failure
        if to == LifecycleState::Starting || error.is_some() {
            self.last_error = error;
        }
        metrics::inc_transition(&self.processor_id, to.as_str());
        match &self.last_error {
            Some(cause) if to == LifecycleState::Error => {
                warn!(processor = %self.processor_id, node = %self.node, from = ?from, state = ?to, error = %cause, "processor failed")
            }
            _ => info!(processor = %self.processor_id, node = %self.node, from = ?from, state = ?to, "processor transition"),
        }
        self.report().await
    }

    /// Write the current state to the registry.
    pub async fn report(&self) -> ParrotResult<()> {
        self.registry
            .report_status(&ProcessorRuntimeStatus {
                processor_id: self.processor_id.clone(),
                node_id: self.node.clone(),
                state: self.state,
                last_error: self.last_error.clone(),
                generation: self.generation,
                updated_at_ms: now_ms(),
            })
            .await
    }
}
