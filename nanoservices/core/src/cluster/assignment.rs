//! Processor-to-node assignment.
//!
//! The table is written only by the coordinator. Each processor has at most
//! one owner, and every new ownership gets a fresh epoch so that an engine
//! started under an older ownership can be fenced.

use std::collections::{BTreeMap, BTreeSet};

use parrot_utils::error::Error;
use parrot_utils::ParrotResult;

use crate::model::{DesiredState, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub processor_id: String,
    pub node_id: NodeId,
    pub epoch: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentTable {
    /// Incremented on every stored change; used for optimistic writes.
    pub version: u64,
    last_epoch: u64,
    owners: BTreeMap<String, Assignment>,
}

impl AssignmentTable {
    pub fn owner(&self, processor_id: &str) -> Option<&Assignment> {
        self.owners.get(processor_id)
    }

    pub fn is_owner(&self, processor_id: &str, node: &NodeId) -> bool {
        self.owner(processor_id).is_some_and(|a| &a.node_id == node)
    }

    pub fn assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.owners.values()
    }

    pub fn owned_by<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a str> + 'a {
        self.owners
            .values()
            .filter(move |a| &a.node_id == node)
            .map(|a| a.processor_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Record a new owner. Fails if the processor is still owned; the old
    /// owner must be revoked first.
    pub fn assign(&mut self, processor_id: &str, node: NodeId) -> ParrotResult<u64> {
        if let Some(existing) = self.owners.get(processor_id) {
            return Err(Error::precondition(format!(
                "processor '{processor_id}' is still owned by {}",
                existing.node_id
            )));
        }
        self.last_epoch += 1;
        let epoch = self.last_epoch;
        self.owners.insert(
            processor_id.to_string(),
            Assignment { processor_id: processor_id.to_string(), node_id: node, epoch },
        );
        Ok(epoch)
    }

    pub fn revoke(&mut self, processor_id: &str) -> Option<Assignment> {
        self.owners.remove(processor_id)
    }
}

/// What the coordinator knows about a processor when planning.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub processor_id: String,
    pub desired: DesiredState,
    /// Failed at its current restart generation; waits for an operator restart.
    pub errored: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentChange {
    Revoke { processor_id: String, from: NodeId },
    Assign { processor_id: String, to: NodeId },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AssignmentPlan {
    pub revokes: Vec<AssignmentChange>,
    pub assigns: Vec<AssignmentChange>,
}

impl AssignmentPlan {
    pub fn is_empty(&self) -> bool {
        self.revokes.is_empty() && self.assigns.is_empty()
    }
}

/// Compute the changes that bring `table` in line with the candidates and
/// the live node set.
///
/// Revokes: owners that left, processors that no longer exist or should no
/// longer run. Assigns: every runnable processor without an owner goes to the
/// live node with the fewest processors, ties broken by the lowest node id.
pub fn plan(
    table: &AssignmentTable,
    candidates: &[Candidate],
    live: &BTreeSet<NodeId>,
) -> AssignmentPlan {
    let by_id: BTreeMap<&str, &Candidate> =
        candidates.iter().map(|c| (c.processor_id.as_str(), c)).collect();

    let mut plan = AssignmentPlan::default();
    let mut still_owned: BTreeSet<&str> = BTreeSet::new();
    let mut load: BTreeMap<&NodeId, usize> = live.iter().map(|n| (n, 0)).collect();

    for assignment in table.assignments() {
        let wanted = by_id
            .get(assignment.processor_id.as_str())
            .is_some_and(|c| c.desired == DesiredState::Running);
        if !wanted || !live.contains(&assignment.node_id) {
            plan.revokes.push(AssignmentChange::Revoke {
                processor_id: assignment.processor_id.clone(),
                from: assignment.node_id.clone(),
            });
            continue;
        }
        still_owned.insert(assignment.processor_id.as_str());
        if let Some(count) = load.get_mut(&assignment.node_id) {
            *count += 1;
        }
    }

    for candidate in candidates {
        if candidate.desired != DesiredState::Running
            || candidate.errored
            || still_owned.contains(candidate.processor_id.as_str())
        {
            continue;
        }
        let Some((&node, _)) = load.iter().min_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0))) else {
            break;
        };
        let node = node.clone();
        if let Some(count) = load.get_mut(&node) {
            *count += 1;
        }
        plan.assigns.push(AssignmentChange::Assign {
            processor_id: candidate.processor_id.clone(),
            to: node,
        });
    }

    plan
}
