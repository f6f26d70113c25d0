use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use crate::cluster::assignment::AssignmentTable;
use crate::model::{ClusterNode, NodeId};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub joined: Vec<NodeId>,
    pub departed: Vec<NodeId>,
}

impl MembershipChange {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.departed.is_empty()
    }
}

/// Live node set derived from heartbeats.
///
/// A node is departed once `max_missed` consecutive heartbeat intervals pass
/// without a new heartbeat from it.
#[derive(Debug)]
pub struct Membership {
    nodes: BTreeMap<NodeId, ClusterNode>,
    deadline_ms: i64,
}

impl Membership {
    pub fn new(heartbeat_interval: Duration, max_missed: u32) -> Self {
        let deadline_ms = heartbeat_interval.as_millis() as i64 * i64::from(max_missed.max(1));
        Self { nodes: BTreeMap::new(), deadline_ms }
    }

    pub fn deadline_ms(&self) -> i64 {
        self.deadline_ms
    }

    /// Fold the latest heartbeat snapshot into the live set.
    pub fn observe(&mut self, heartbeats: &HashMap<NodeId, i64>, now_ms: i64) -> MembershipChange {
        let mut change = MembershipChange::default();

        for (id, &at) in heartbeats {
            if now_ms - at > self.deadline_ms {
                // never seen live by this coordinator; purge it all the same
                if !self.nodes.contains_key(id) {
                    change.departed.push(id.clone());
                }
                continue;
            }
            match self.nodes.get_mut(id) {
                Some(node) => node.last_heartbeat_ms = node.last_heartbeat_ms.max(at),
                None => {
                    self.nodes.insert(id.clone(), ClusterNode::new(id.clone(), at));
                    change.joined.push(id.clone());
                }
            }
        }

        let expired: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|node| {
                !heartbeats.contains_key(&node.id) || now_ms - node.last_heartbeat_ms > self.deadline_ms
            })
            .map(|node| node.id.clone())
            .collect();
        for id in expired {
            self.nodes.remove(&id);
            change.departed.push(id);
        }

        change.joined.sort();
        change.departed.sort();
        change
    }

    pub fn live(&self) -> BTreeSet<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    /// Refresh each node's owned set from the assignment table.
    pub fn record_ownership(&mut self, table: &AssignmentTable) {
        for node in self.nodes.values_mut() {
            node.owned = table.owned_by(&node.id).map(str::to_string).collect();
        }
    }
}
