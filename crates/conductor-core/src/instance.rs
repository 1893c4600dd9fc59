//! Workflow instance state, owned exclusively by the coordinator.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dag::Dag;
use crate::types::{AttemptOutcome, CompensationStatus, FailureReason, Lifecycle, Priority};

/// One execution attempt of one node. Appended, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<AttemptOutcome>,
    /// Priority the node held when the attempt was dispatched.
    pub priority: Priority,
    /// Identity of the executor that ran the attempt.
    pub executor: String,
}

/// Per-node execution state within a workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_id: Uuid,
    pub state: Lifecycle,
    /// Current class; may have been escalated above the node's declared one.
    pub priority: Priority,
    pub attempts: Vec<AttemptRecord>,
    /// Attempts spent before the last operator-approved retry; the retry
    /// budget counts from here, so an approved retry starts a fresh cycle.
    pub attempt_base: u32,
    pub failure: Option<FailureReason>,
    /// Committed output, visible to dependents.
    pub output: Option<serde_json::Value>,
    /// When the next retry attempt becomes due.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub compensation: CompensationStatus,
}

impl NodeExecution {
    pub fn new(node_id: Uuid, priority: Priority) -> Self {
        Self {
            node_id,
            state: Lifecycle::Pending,
            priority,
            attempts: Vec::new(),
            attempt_base: 0,
            failure: None,
            output: None,
            next_retry_at: None,
            compensation: CompensationStatus::NotRun,
        }
    }

    /// Number of attempts that have started.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Attempts counted against the current retry budget.
    pub fn effective_attempts(&self) -> u32 {
        self.attempt_count().saturating_sub(self.attempt_base)
    }

    /// Open a new attempt record and return its number.
    pub fn begin_attempt(&mut self, executor: impl Into<String>) -> u32 {
        let attempt = self.attempt_count() + 1;
        self.attempts.push(AttemptRecord {
            attempt,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            priority: self.priority,
            executor: executor.into(),
        });
        attempt
    }

    /// Close the most recent attempt with an outcome.
    pub fn finish_attempt(&mut self, outcome: AttemptOutcome) {
        if let Some(record) = self.attempts.last_mut() {
            record.finished_at = Some(Utc::now());
            record.outcome = Some(outcome);
        }
    }
}

/// A live workflow instance: one submitted DAG moving through the saga
/// state machine. Mutated only by the coordinator that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Opaque id of the intent this DAG was derived from.
    pub intent_id: Option<Uuid>,
    pub dag: Dag,
    pub state: Lifecycle,
    pub nodes: HashMap<Uuid, NodeExecution>,
    /// Node ids in the order they committed; compensation walks this in
    /// reverse.
    pub commit_order: Vec<Uuid>,
    /// Set when any compensation in the rollback walk failed.
    pub partially_compensated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Create a fresh instance with every execution node `Pending`.
    pub fn new(tenant_id: Uuid, intent_id: Option<Uuid>, dag: Dag) -> Self {
        let now = Utc::now();
        let nodes = dag
            .execution_nodes()
            .map(|n| (n.id, NodeExecution::new(n.id, n.priority)))
            .collect();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            intent_id,
            dag,
            state: Lifecycle::Pending,
            nodes,
            commit_order: Vec::new(),
            partially_compensated: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Ids of nodes that have committed (or were skipped), i.e. the set a
    /// dependent's readiness is computed against.
    pub fn settled(&self) -> HashSet<Uuid> {
        self.nodes
            .values()
            .filter(|n| matches!(n.state, Lifecycle::Committed | Lifecycle::Skipped))
            .map(|n| n.node_id)
            .collect()
    }

    /// Whether every execution node reached `Committed` or `Skipped`.
    pub fn all_settled(&self) -> bool {
        self.nodes
            .values()
            .all(|n| matches!(n.state, Lifecycle::Committed | Lifecycle::Skipped))
    }

    /// Derive the workflow-level state from its node states.
    ///
    /// Terminal and compensation states are set explicitly by the
    /// coordinator; this covers the live spectrum, most-severe first.
    pub fn derive_state(&self) -> Lifecycle {
        if self.state.is_terminal() || self.state == Lifecycle::Compensating {
            return self.state;
        }
        if self.all_settled() {
            return Lifecycle::Committed;
        }
        let states: Vec<Lifecycle> = self.nodes.values().map(|n| n.state).collect();
        for severe in [
            Lifecycle::Compensating,
            Lifecycle::HumanReview,
            Lifecycle::Escalated,
            Lifecycle::Failed,
            Lifecycle::Retrying,
            Lifecycle::Verifying,
            Lifecycle::Executing,
            Lifecycle::Scheduled,
        ] {
            if states.contains(&severe) {
                return severe;
            }
        }
        Lifecycle::Pending
    }

    /// Build a read-only status snapshot.
    pub fn snapshot(&self) -> WorkflowStatus {
        WorkflowStatus {
            workflow_id: self.id,
            tenant_id: self.tenant_id,
            state: self.state,
            partially_compensated: self.partially_compensated,
            nodes: self
                .nodes
                .values()
                .map(|n| NodeStatus {
                    node_id: n.node_id,
                    name: self
                        .dag
                        .node(n.node_id)
                        .map(|d| d.name.clone())
                        .unwrap_or_default(),
                    state: n.state,
                    priority: n.priority,
                    attempts: n.attempt_count(),
                    failure: n.failure.clone(),
                    uncompensated: n.compensation == CompensationStatus::Skipped,
                    compensation: n.compensation.clone(),
                })
                .collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only view of a workflow's current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub workflow_id: Uuid,
    pub tenant_id: Uuid,
    pub state: Lifecycle,
    pub partially_compensated: bool,
    pub nodes: Vec<NodeStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowStatus {
    /// Status of a single node by id.
    pub fn node(&self, node_id: Uuid) -> Option<&NodeStatus> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

/// Read-only view of a single node's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: Uuid,
    pub name: String,
    pub state: Lifecycle,
    pub priority: Priority,
    pub attempts: u32,
    pub failure: Option<FailureReason>,
    /// True when the node committed but had no compensation to run.
    pub uncompensated: bool,
    pub compensation: CompensationStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Node, NodeKind};

    fn two_node_instance() -> (WorkflowInstance, Uuid, Uuid) {
        let mut dag = Dag::new();
        let a = dag.add_node(Node::new("a", NodeKind::Tool));
        let b = dag.add_node(Node::new("b", NodeKind::Tool));
        dag.add_edge(a, b);
        (WorkflowInstance::new(Uuid::new_v4(), None, dag), a, b)
    }

    #[test]
    fn test_new_instance_is_pending() {
        let (instance, a, b) = two_node_instance();
        assert_eq!(instance.state, Lifecycle::Pending);
        assert_eq!(instance.nodes[&a].state, Lifecycle::Pending);
        assert_eq!(instance.nodes[&b].state, Lifecycle::Pending);
    }

    #[test]
    fn test_attempt_records_are_append_only() {
        let (mut instance, a, _) = two_node_instance();
        let node = instance.nodes.get_mut(&a).unwrap();
        assert_eq!(node.begin_attempt("executor-1"), 1);
        node.finish_attempt(AttemptOutcome::Failure);
        assert_eq!(node.begin_attempt("executor-1"), 2);
        assert_eq!(node.attempts.len(), 2);
        assert_eq!(node.attempts[0].outcome, Some(AttemptOutcome::Failure));
    }

    #[test]
    fn test_derive_state_prefers_most_severe() {
        let (mut instance, a, b) = two_node_instance();
        instance.nodes.get_mut(&a).unwrap().state = Lifecycle::Executing;
        instance.nodes.get_mut(&b).unwrap().state = Lifecycle::Failed;
        assert_eq!(instance.derive_state(), Lifecycle::Failed);
    }

    #[test]
    fn test_all_settled_derives_committed() {
        let (mut instance, a, b) = two_node_instance();
        instance.nodes.get_mut(&a).unwrap().state = Lifecycle::Committed;
        instance.nodes.get_mut(&b).unwrap().state = Lifecycle::Skipped;
        assert_eq!(instance.derive_state(), Lifecycle::Committed);
    }

    #[test]
    fn test_snapshot_reports_uncompensated() {
        let (mut instance, a, _) = two_node_instance();
        instance.nodes.get_mut(&a).unwrap().compensation = CompensationStatus::Skipped;
        let status = instance.snapshot();
        assert!(status.node(a).unwrap().uncompensated);
    }
}
