//! Per-node reconciliation of owned processors.

pub mod manager;
pub mod state;
pub mod worker;

pub use manager::LifecycleManager;
pub use state::ProcessorStateMachine;
pub use worker::{ProcessorWorker, WorkerContext};
