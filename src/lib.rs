pub use parrot_core as core;
pub use parrot_utils as utils;

// Convenience re-exports for common usage
pub use parrot_core::cluster::{CoordinationBackend, MemoryBackend};
pub use parrot_core::config::NodeConfig;
pub use parrot_core::control::{ControlPlane, ControlPlaneClient, ProcessorService};
pub use parrot_core::model::{DesiredState, LifecycleState, ProcessorDefinition};
pub use parrot_core::node::{NodeHandle, ParrotNode};
pub use parrot_core::sinks::SinkDialect;
pub use parrot_core::sources::SourceProvider;
pub use parrot_utils::{ChangeEvent, ChangeStream, ParrotResult};
