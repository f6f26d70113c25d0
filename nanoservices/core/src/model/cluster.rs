use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::processor::LifecycleState;

/// Identifier of a worker node, as configured on that node.
///
/// Ordering is lexicographic; the coordinator uses it to break load ties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A live member of the cluster as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: NodeId,
    pub last_heartbeat_ms: i64,
    pub owned: BTreeSet<String>,
}

impl ClusterNode {
    pub fn new(id: NodeId, last_heartbeat_ms: i64) -> Self {
        Self { id, last_heartbeat_ms, owned: BTreeSet::new() }
    }
}

/// One entry of a processor's cluster view: a node that runs or ran it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorNode {
    pub node_id: NodeId,
    pub state: LifecycleState,
    pub last_error: Option<String>,
    pub updated_at_ms: i64,
    pub owner: bool,
}
