//! Cluster membership, leader election and processor assignment.

pub mod assignment;
pub mod backend;
pub mod coordinator;
pub mod guard;
pub mod heartbeat;
pub mod leader;
pub mod membership;

pub use assignment::{Assignment, AssignmentTable};
pub use backend::{CoordinationBackend, MemoryBackend};
pub use coordinator::{cluster_view, ClusterCoordinator};
pub use guard::OwnershipGuard;
pub use heartbeat::Heartbeater;
pub use leader::LeaderElector;
