//! Workflow DAG types and validation.
//!
//! A [`Dag`] is the execution plan derived from a parsed intent: a set of
//! task nodes joined by dependency edges. Validation happens once, at
//! submission; a DAG that fails validation never reaches the state machine.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConductorError, Result};
use crate::retry::RetryPolicy;
use crate::types::Priority;

/// The semantic kind of a DAG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Delegates to an agent runtime.
    Agent,
    /// Invokes a registered tool.
    Tool,
    /// Branch point; branch semantics live in the executor runtime.
    Condition,
    /// Iteration point; loop semantics live in the executor runtime.
    Loop,
    /// Parks in human review until an operator approves or rejects.
    HumanApproval,
    /// Explicit retry barrier around a flaky operation.
    Retry,
    /// Reverse action; never scheduled forward, only run during rollback.
    Compensation,
}

/// Access tier of a node, checked against the policy gate before dispatch.
///
/// Nodes above [`AccessTier::Open`] require an ALLOW decision.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AccessTier {
    /// No policy check.
    #[default]
    Open,
    /// Policy gate consulted.
    Guarded,
    /// Policy gate consulted; intended for pre-approved subjects only.
    Restricted,
    /// Policy gate consulted; intended for human-in-the-loop flows.
    Critical,
}

/// Declared shape of a node's output, checked during the verifying phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OutputContract {
    /// Top-level fields the executor output must contain.
    pub required_fields: Vec<String>,
}

impl OutputContract {
    /// Return the contract fields missing from `output`, if any.
    pub fn missing_fields(&self, output: &serde_json::Value) -> Vec<String> {
        self.required_fields
            .iter()
            .filter(|field| output.get(field.as_str()).is_none())
            .cloned()
            .collect()
    }
}

/// A single task node in a workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the DAG.
    pub id: Uuid,

    /// Human-readable name (e.g. "migrate_schema").
    pub name: String,

    /// Semantic kind.
    pub kind: NodeKind,

    /// Input/parameter payload handed to the executor.
    #[serde(default)]
    pub params: serde_json::Value,

    /// Priority class (P0 highest).
    #[serde(default)]
    pub priority: Priority,

    /// Whether re-running the node with the same attempt is side-effect safe.
    #[serde(default)]
    pub idempotent: bool,

    /// Per-attempt execution deadline.
    pub timeout_ms: u64,

    /// Retry policy applied on failure.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Id of this node's compensation node, if it has one.
    #[serde(default)]
    pub compensation: Option<Uuid>,

    /// Output verification contract, if declared.
    #[serde(default)]
    pub output_contract: Option<OutputContract>,

    /// Whether exhausted retries queue for human review instead of
    /// compensating immediately.
    #[serde(default)]
    pub review_on_exhaustion: bool,

    /// Access tier for the policy gate.
    #[serde(default)]
    pub access: AccessTier,

    /// Estimated cost handed to the budget gate at admission.
    #[serde(default)]
    pub cost_estimate: f64,
}

impl Node {
    /// Create a node with defaults (P2, 30s timeout, default retry policy).
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            params: serde_json::Value::Null,
            priority: Priority::default(),
            idempotent: false,
            timeout_ms: 30_000,
            retry: RetryPolicy::default(),
            compensation: None,
            output_contract: None,
            review_on_exhaustion: false,
            access: AccessTier::default(),
            cost_estimate: 0.0,
        }
    }

    /// Set the priority class.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the input payload.
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Attach a compensation node id.
    pub fn with_compensation(mut self, compensation_id: Uuid) -> Self {
        self.compensation = Some(compensation_id);
        self
    }

    /// Attach an output contract.
    pub fn with_output_contract(mut self, contract: OutputContract) -> Self {
        self.output_contract = Some(contract);
        self
    }

    /// Mark the node idempotent.
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// Route exhausted retries to human review.
    pub fn review_on_exhaustion(mut self) -> Self {
        self.review_on_exhaustion = true;
        self
    }

    /// Set the access tier.
    pub fn with_access(mut self, access: AccessTier) -> Self {
        self.access = access;
        self
    }

    /// Set the estimated cost.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_estimate = cost;
        self
    }
}

/// A directed acyclic graph of task nodes.
///
/// Edges run from prerequisite to dependent. Compensation nodes are carried
/// in `nodes` but excluded from the forward execution graph.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Dag {
    pub nodes: Vec<Node>,
    /// (from, to) pairs: `to` cannot start until `from` commits.
    pub edges: Vec<(Uuid, Uuid)>,
}

impl Dag {
    /// Create an empty DAG.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, returning its id.
    pub fn add_node(&mut self, node: Node) -> Uuid {
        let id = node.id;
        self.nodes.push(node);
        id
    }

    /// Add a dependency edge.
    pub fn add_edge(&mut self, from: Uuid, to: Uuid) {
        self.edges.push((from, to));
    }

    /// Look up a node by id.
    pub fn node(&self, id: Uuid) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// All nodes that participate in forward execution.
    pub fn execution_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|n| n.kind != NodeKind::Compensation)
    }

    /// Direct predecessors of a node.
    pub fn predecessors(&self, id: Uuid) -> Vec<Uuid> {
        self.edges
            .iter()
            .filter(|(_, to)| *to == id)
            .map(|(from, _)| *from)
            .collect()
    }

    /// Direct successors of a node.
    pub fn successors(&self, id: Uuid) -> Vec<Uuid> {
        self.edges
            .iter()
            .filter(|(from, _)| *from == id)
            .map(|(_, to)| *to)
            .collect()
    }

    /// Execution nodes with no predecessors.
    pub fn entry_nodes(&self) -> Vec<Uuid> {
        self.execution_nodes()
            .filter(|n| self.predecessors(n.id).is_empty())
            .map(|n| n.id)
            .collect()
    }

    /// Execution nodes whose predecessors are all in `done` and which are
    /// not themselves in `done`.
    pub fn ready_after(&self, done: &HashSet<Uuid>) -> Vec<Uuid> {
        self.execution_nodes()
            .filter(|n| !done.contains(&n.id))
            .filter(|n| self.predecessors(n.id).iter().all(|p| done.contains(p)))
            .map(|n| n.id)
            .collect()
    }

    /// Topological order over execution nodes (Kahn's algorithm).
    ///
    /// # Errors
    /// Returns `Validation` if the graph contains a cycle.
    pub fn topo_order(&self) -> Result<Vec<Uuid>> {
        let exec_ids: HashSet<Uuid> = self.execution_nodes().map(|n| n.id).collect();
        let mut in_degree: HashMap<Uuid, usize> =
            exec_ids.iter().map(|id| (*id, 0)).collect();
        for (from, to) in &self.edges {
            if exec_ids.contains(from) && exec_ids.contains(to) {
                *in_degree.entry(*to).or_insert(0) += 1;
            }
        }

        // Seed the frontier in insertion order so the result is stable.
        let mut frontier: VecDeque<Uuid> = self
            .execution_nodes()
            .filter(|n| in_degree.get(&n.id) == Some(&0))
            .map(|n| n.id)
            .collect();

        let mut order = Vec::with_capacity(exec_ids.len());
        while let Some(id) = frontier.pop_front() {
            order.push(id);
            for succ in self.successors(id) {
                if let Some(deg) = in_degree.get_mut(&succ) {
                    *deg -= 1;
                    if *deg == 0 {
                        frontier.push_back(succ);
                    }
                }
            }
        }

        if order.len() != exec_ids.len() {
            return Err(ConductorError::validation("DAG contains a cycle"));
        }
        Ok(order)
    }

    /// Validate the DAG structure.
    ///
    /// Rejects empty graphs, duplicate node ids, dangling or self-referential
    /// edges, cycles, compensation references to non-compensation nodes, and
    /// compensation nodes wired into the forward edge set.
    pub fn validate(&self) -> Result<()> {
        if self.execution_nodes().next().is_none() {
            return Err(ConductorError::validation("DAG has no executable nodes"));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id) {
                return Err(ConductorError::validation(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
            if node.timeout_ms == 0 {
                return Err(ConductorError::validation(format!(
                    "node '{}' has a zero timeout",
                    node.name
                )));
            }
        }

        let comp_ids: HashSet<Uuid> = self
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Compensation)
            .map(|n| n.id)
            .collect();

        for (from, to) in &self.edges {
            if from == to {
                return Err(ConductorError::validation(format!(
                    "self-referential edge on node {from}"
                )));
            }
            if !seen.contains(from) || !seen.contains(to) {
                return Err(ConductorError::validation(format!(
                    "edge {from} -> {to} references an unknown node"
                )));
            }
            if comp_ids.contains(from) || comp_ids.contains(to) {
                return Err(ConductorError::validation(
                    "compensation nodes cannot appear in the forward edge set",
                ));
            }
        }

        for node in self.execution_nodes() {
            if let Some(comp) = node.compensation {
                if !comp_ids.contains(&comp) {
                    return Err(ConductorError::validation(format!(
                        "node '{}' references {comp} as compensation, which is not a compensation node",
                        node.name
                    )));
                }
            }
        }

        // Cycle check.
        self.topo_order().map(|_| ())
    }

    /// SHA-256 fingerprint of the DAG structure (hex).
    ///
    /// A workflow's DAG is immutable after submission; the fingerprint is
    /// recorded in the ledger so replays can detect substitution.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for node in &self.nodes {
            hasher.update(node.id.as_bytes());
            hasher.update(node.name.as_bytes());
        }
        for (from, to) in &self.edges {
            hasher.update(from.as_bytes());
            hasher.update(to.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str) -> Node {
        Node::new(name, NodeKind::Tool)
    }

    #[test]
    fn test_linear_dag_validates() {
        let mut dag = Dag::new();
        let a = dag.add_node(task("a"));
        let b = dag.add_node(task("b"));
        dag.add_edge(a, b);
        assert!(dag.validate().is_ok());
        assert_eq!(dag.entry_nodes(), vec![a]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut dag = Dag::new();
        let a = dag.add_node(task("a"));
        let b = dag.add_node(task("b"));
        dag.add_edge(a, b);
        dag.add_edge(b, a);
        assert!(dag.validate().is_err());
    }

    #[test]
    fn test_self_loop_is_rejected() {
        let mut dag = Dag::new();
        let a = dag.add_node(task("a"));
        dag.add_edge(a, a);
        assert!(dag.validate().is_err());
    }

    #[test]
    fn test_empty_dag_is_rejected() {
        assert!(Dag::new().validate().is_err());
    }

    #[test]
    fn test_dangling_edge_is_rejected() {
        let mut dag = Dag::new();
        let a = dag.add_node(task("a"));
        dag.add_edge(a, Uuid::new_v4());
        assert!(dag.validate().is_err());
    }

    #[test]
    fn test_compensation_must_reference_compensation_node() {
        let mut dag = Dag::new();
        let b = dag.add_node(task("b"));
        dag.add_node(task("a").with_compensation(b));
        assert!(dag.validate().is_err());

        let mut dag = Dag::new();
        let undo = dag.add_node(Node::new("undo_a", NodeKind::Compensation));
        dag.add_node(task("a").with_compensation(undo));
        assert!(dag.validate().is_ok());
    }

    #[test]
    fn test_compensation_excluded_from_forward_graph() {
        let mut dag = Dag::new();
        let undo = dag.add_node(Node::new("undo", NodeKind::Compensation));
        let a = dag.add_node(task("a").with_compensation(undo));
        assert_eq!(dag.entry_nodes(), vec![a]);
        assert_eq!(dag.topo_order().unwrap(), vec![a]);
    }

    #[test]
    fn test_topo_order_respects_edges() {
        let mut dag = Dag::new();
        let a = dag.add_node(task("a"));
        let b = dag.add_node(task("b"));
        let c = dag.add_node(task("c"));
        dag.add_edge(a, c);
        dag.add_edge(b, c);
        let order = dag.topo_order().unwrap();
        let pos = |id| order.iter().position(|x| *x == id).unwrap();
        assert!(pos(a) < pos(c));
        assert!(pos(b) < pos(c));
    }

    #[test]
    fn test_ready_after_unlocks_dependents() {
        let mut dag = Dag::new();
        let a = dag.add_node(task("a"));
        let b = dag.add_node(task("b"));
        dag.add_edge(a, b);

        let mut done = HashSet::new();
        assert_eq!(dag.ready_after(&done), vec![a]);
        done.insert(a);
        assert_eq!(dag.ready_after(&done), vec![b]);
    }

    #[test]
    fn test_output_contract_missing_fields() {
        let contract = OutputContract {
            required_fields: vec!["rows".into(), "checksum".into()],
        };
        let output = serde_json::json!({ "rows": 10 });
        assert_eq!(contract.missing_fields(&output), vec!["checksum"]);
    }
}
