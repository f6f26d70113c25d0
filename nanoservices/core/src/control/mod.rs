//! Operator-facing processor commands.
//!
//! [`ControlPlane`] is the command surface. [`ProcessorService`] executes it
//! against the registry and coordination state of this cluster,
//! [`ControlPlaneClient`] against a remote node over HTTP, and
//! [`server::serve_with_shutdown`] exposes any implementation over HTTP.

use async_trait::async_trait;
use parrot_utils::ParrotResult;
use serde::{Deserialize, Serialize};

use crate::model::{ProcessorDefinition, ProcessorNode};

pub mod client;
pub mod server;
pub mod service;

pub use client::ControlPlaneClient;
pub use service::ProcessorService;

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Ids of every known processor.
    async fn list_processors(&self) -> ParrotResult<Vec<String>>;

    async fn get_processor(&self, id: &str) -> ParrotResult<ProcessorDefinition>;

    /// Submit a new definition. Adding an id that already exists fails.
    async fn add_processor(&self, definition: ProcessorDefinition) -> ParrotResult<ProcessorDefinition>;

    /// Nodes that run or ran the processor, the recorded owner flagged.
    async fn processor_cluster(&self, id: &str) -> ParrotResult<Vec<ProcessorNode>>;

    async fn start_processor(&self, id: &str) -> ParrotResult<ProcessorDefinition>;

    async fn stop_processor(&self, id: &str) -> ParrotResult<ProcessorDefinition>;

    async fn restart_processor(&self, id: &str) -> ParrotResult<ProcessorDefinition>;

    /// Remove a processor that is not desired RUNNING.
    async fn delete_processor(&self, id: &str) -> ParrotResult<()>;
}

/// Body of every non-2xx control-plane response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}
