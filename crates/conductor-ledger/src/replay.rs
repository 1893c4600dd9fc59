//! Replay, simulation, and trace diffing.
//!
//! Replay folds a workflow's ledger entries back into its state history;
//! simulation runs the same transition vocabulary over a DAG without
//! touching the chain. Both emit [`TransitionRecord`]s so [`diff`] can
//! compare any two traces — live vs live, or live vs hypothetical.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conductor_core::{Dag, Lifecycle, Result};

use crate::chain::Ledger;
use crate::entry::{LedgerEntry, LedgerEventKind};

/// One transition in a replayed or simulated trace.
///
/// Equality deliberately ignores ids: two traces match when the same labeled
/// steps happen in the same order, even across different workflow instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Node name, or "workflow" for workflow-level transitions.
    pub label: String,
    pub node_id: Option<Uuid>,
    pub attempt: Option<u32>,
    pub kind: LedgerEventKind,
    pub state: Option<Lifecycle>,
}

impl PartialEq for TransitionRecord {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label
            && self.attempt == other.attempt
            && self.kind == other.kind
            && self.state == other.state
    }
}

/// The deterministic reconstruction of one workflow's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayedWorkflow {
    pub workflow_id: Uuid,
    pub final_state: Option<Lifecycle>,
    /// Last observed state per node.
    pub node_states: HashMap<Uuid, Lifecycle>,
    /// Nodes in the order they committed.
    pub commit_order: Vec<Uuid>,
    pub compensated: Vec<Uuid>,
    /// Committed nodes recorded as having no compensation.
    pub uncompensated: Vec<Uuid>,
    pub partially_compensated: bool,
    pub transitions: Vec<TransitionRecord>,
}

/// Fold a workflow's entries into its state history.
///
/// Tolerates at-least-once delivery: duplicate entries for the same
/// (node, attempt, kind, state) tuple are ignored, so a crash that
/// re-appended a transition does not double-count a commit or side effect.
pub fn replay_entries(workflow_id: Uuid, entries: &[LedgerEntry]) -> ReplayedWorkflow {
    let mut seen: HashSet<(Option<Uuid>, Option<u32>, LedgerEventKind, Option<String>)> =
        HashSet::new();
    let mut replayed = ReplayedWorkflow {
        workflow_id,
        final_state: None,
        node_states: HashMap::new(),
        commit_order: Vec::new(),
        compensated: Vec::new(),
        uncompensated: Vec::new(),
        partially_compensated: false,
        transitions: Vec::new(),
    };

    for entry in entries.iter().filter(|e| e.workflow_id == workflow_id) {
        let to_state: Option<Lifecycle> = entry
            .payload
            .get("to")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let state_key = to_state.map(|s| format!("{s:?}"));
        if !seen.insert((entry.node_id, entry.attempt, entry.kind, state_key)) {
            continue;
        }

        let label = entry
            .payload
            .get("node")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| "workflow".to_string());

        match entry.kind {
            LedgerEventKind::NodeStateChanged => {
                if let (Some(node_id), Some(state)) = (entry.node_id, to_state) {
                    replayed.node_states.insert(node_id, state);
                    if state == Lifecycle::Committed {
                        replayed.commit_order.push(node_id);
                    }
                }
            }
            LedgerEventKind::WorkflowStateChanged | LedgerEventKind::WorkflowSubmitted => {
                if let Some(state) = to_state {
                    replayed.final_state = Some(state);
                }
            }
            LedgerEventKind::CompensationExecuted => {
                if let Some(node_id) = entry.node_id {
                    replayed.compensated.push(node_id);
                }
            }
            LedgerEventKind::CompensationFailed => {
                replayed.partially_compensated = true;
                if let Some(node_id) = entry.node_id {
                    replayed.compensated.push(node_id);
                }
            }
            LedgerEventKind::CompensationSkipped => {
                if let Some(node_id) = entry.node_id {
                    replayed.uncompensated.push(node_id);
                }
            }
            _ => {}
        }

        replayed.transitions.push(TransitionRecord {
            label,
            node_id: entry.node_id,
            attempt: entry.attempt,
            kind: entry.kind,
            state: to_state,
        });
    }

    replayed
}

impl Ledger {
    /// Deterministically reconstruct a workflow's transition history from
    /// its ledger entries. Read-only; used for audit and crash recovery.
    pub async fn replay(&self, tenant_id: Uuid, workflow_id: Uuid) -> ReplayedWorkflow {
        let entries = self.workflow_entries(tenant_id, workflow_id).await;
        replay_entries(workflow_id, &entries)
    }
}

/// Hypothetical inputs for a simulation: which nodes would fail every
/// attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hypothetical {
    pub failing: HashSet<Uuid>,
}

impl Hypothetical {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn failing(nodes: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            failing: nodes.into_iter().collect(),
        }
    }
}

/// A would-be execution trace. Nothing was appended, nothing executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedTrace {
    pub final_state: Lifecycle,
    pub commit_order: Vec<Uuid>,
    /// Nodes whose compensations would run, in walk order.
    pub compensation_order: Vec<Uuid>,
    pub transitions: Vec<TransitionRecord>,
}

/// Run the state machine over a DAG without side effects.
///
/// Answers "what would happen": nodes commit in topological order until a
/// hypothetical failure exhausts its retry budget, then the compensation
/// walk runs in reverse commit order, exactly as the live coordinator
/// would.
///
/// # Errors
/// Returns `Validation` for an invalid DAG.
pub fn simulate(dag: &Dag, hypothetical: &Hypothetical) -> Result<SimulatedTrace> {
    dag.validate()?;

    let mut transitions = Vec::new();
    let mut commit_order: Vec<Uuid> = Vec::new();
    let mut push = |node: &conductor_core::Node, attempt: Option<u32>, state: Lifecycle| {
        transitions.push(TransitionRecord {
            label: node.name.clone(),
            node_id: Some(node.id),
            attempt,
            kind: LedgerEventKind::NodeStateChanged,
            state: Some(state),
        });
    };

    let mut failed_node = None;
    for node_id in dag.topo_order()? {
        let node = dag.node(node_id).expect("topo order yields known nodes");
        push(node, None, Lifecycle::Scheduled);

        if hypothetical.failing.contains(&node_id) {
            let max = node.retry.max_attempts.max(1);
            for attempt in 1..=max {
                push(node, Some(attempt), Lifecycle::Executing);
                push(node, Some(attempt), Lifecycle::Failed);
                if node.retry.allows_retry(attempt) {
                    push(node, Some(attempt), Lifecycle::Retrying);
                    push(node, None, Lifecycle::Scheduled);
                }
            }
            push(node, Some(max), Lifecycle::Escalated);
            failed_node = Some(node_id);
            break;
        }

        push(node, Some(1), Lifecycle::Executing);
        push(node, Some(1), Lifecycle::Verifying);
        push(node, Some(1), Lifecycle::Committed);
        commit_order.push(node_id);
    }

    if failed_node.is_some() {
        let mut compensation_order = Vec::new();
        for node_id in commit_order.iter().rev() {
            let node = dag.node(*node_id).expect("committed node exists");
            let kind = if node.compensation.is_some() {
                compensation_order.push(*node_id);
                LedgerEventKind::CompensationExecuted
            } else {
                LedgerEventKind::CompensationSkipped
            };
            transitions.push(TransitionRecord {
                label: node.name.clone(),
                node_id: Some(*node_id),
                attempt: None,
                kind,
                state: None,
            });
        }
        transitions.push(TransitionRecord {
            label: "workflow".to_string(),
            node_id: None,
            attempt: None,
            kind: LedgerEventKind::WorkflowStateChanged,
            state: Some(Lifecycle::RolledBack),
        });
        return Ok(SimulatedTrace {
            final_state: Lifecycle::RolledBack,
            commit_order,
            compensation_order,
            transitions,
        });
    }

    transitions.push(TransitionRecord {
        label: "workflow".to_string(),
        node_id: None,
        attempt: None,
        kind: LedgerEventKind::WorkflowStateChanged,
        state: Some(Lifecycle::Committed),
    });
    Ok(SimulatedTrace {
        final_state: Lifecycle::Committed,
        commit_order,
        compensation_order: Vec::new(),
        transitions,
    })
}

/// One position where two traces disagree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Divergence {
    pub index: usize,
    pub left: Option<TransitionRecord>,
    pub right: Option<TransitionRecord>,
}

/// Structural comparison of two transition traces.
///
/// Positions where the traces disagree (or where one trace has ended) are
/// reported; an empty result means the traces match step for step.
pub fn diff(left: &[TransitionRecord], right: &[TransitionRecord]) -> Vec<Divergence> {
    let len = left.len().max(right.len());
    (0..len)
        .filter_map(|index| {
            let l = left.get(index);
            let r = right.get(index);
            match (l, r) {
                (Some(a), Some(b)) if a == b => None,
                _ => Some(Divergence {
                    index,
                    left: l.cloned(),
                    right: r.cloned(),
                }),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{Node, NodeKind, RetryPolicy};

    fn task(name: &str) -> Node {
        Node::new(name, NodeKind::Tool)
    }

    fn linear_saga() -> (Dag, Uuid, Uuid, Uuid) {
        let mut dag = Dag::new();
        let undo_a = dag.add_node(Node::new("undo_a", NodeKind::Compensation));
        let undo_b = dag.add_node(Node::new("undo_b", NodeKind::Compensation));
        let a = dag.add_node(task("migrate").with_compensation(undo_a));
        let b = dag.add_node(task("deploy").with_compensation(undo_b));
        let c = dag.add_node(task("update_routing"));
        dag.add_edge(a, b);
        dag.add_edge(b, c);
        (dag, a, b, c)
    }

    #[test]
    fn test_simulate_happy_path_commits_in_topo_order() {
        let (dag, a, b, c) = linear_saga();
        let trace = simulate(&dag, &Hypothetical::none()).unwrap();
        assert_eq!(trace.final_state, Lifecycle::Committed);
        assert_eq!(trace.commit_order, vec![a, b, c]);
        assert!(trace.compensation_order.is_empty());
    }

    #[test]
    fn test_simulate_failure_compensates_in_reverse() {
        let (dag, a, b, c) = linear_saga();
        let trace = simulate(&dag, &Hypothetical::failing([c])).unwrap();
        assert_eq!(trace.final_state, Lifecycle::RolledBack);
        assert_eq!(trace.commit_order, vec![a, b]);
        assert_eq!(trace.compensation_order, vec![b, a]);
    }

    #[test]
    fn test_simulate_respects_retry_budget() {
        let mut dag = Dag::new();
        let a = dag.add_node(task("flaky").with_retry(RetryPolicy {
            max_attempts: 2,
            backoff_ms: vec![10],
            jitter_frac: 0.0,
        }));
        let trace = simulate(&dag, &Hypothetical::failing([a])).unwrap();
        let executing = trace
            .transitions
            .iter()
            .filter(|t| t.state == Some(Lifecycle::Executing))
            .count();
        assert_eq!(executing, 2);
    }

    #[test]
    fn test_simulate_rejects_invalid_dag() {
        let mut dag = Dag::new();
        let a = dag.add_node(task("a"));
        dag.add_edge(a, a);
        assert!(simulate(&dag, &Hypothetical::none()).is_err());
    }

    #[test]
    fn test_diff_matching_traces_is_empty() {
        let (dag, _, _, _) = linear_saga();
        let a = simulate(&dag, &Hypothetical::none()).unwrap();
        let b = simulate(&dag, &Hypothetical::none()).unwrap();
        assert!(diff(&a.transitions, &b.transitions).is_empty());
    }

    #[test]
    fn test_diff_reports_first_divergence() {
        let (dag, _, _, c) = linear_saga();
        let ok = simulate(&dag, &Hypothetical::none()).unwrap();
        let failed = simulate(&dag, &Hypothetical::failing([c])).unwrap();
        let divergences = diff(&ok.transitions, &failed.transitions);
        assert!(!divergences.is_empty());
        // Both traces agree until update_routing's first execution ends.
        assert!(divergences[0].index > 0);
    }
}
