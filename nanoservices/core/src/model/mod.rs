//! State and wire contracts shared by the registry, the coordinator, the
//! lifecycle managers and the control plane.

pub mod cluster;
pub mod processor;

pub use cluster::{ClusterNode, NodeId, ProcessorNode};
pub use processor::{
    DesiredState, DialectConfig, LifecycleState, ProcessorDefinition, ProcessorRuntimeStatus,
    SinkConfig, SourceConfig,
};

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
