//! Capability interfaces consumed by the coordinator.
//!
//! The task executor, policy gate, and budget gate are external
//! collaborators. The coordinator only sees these traits; deployments plug
//! in adapters for their real runtimes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dag::{AccessTier, Node, NodeKind};
use crate::types::Priority;

/// Context handed to the executor for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub attempt: u32,
    /// True when this call is a compensation run, not forward execution.
    pub compensating: bool,
}

/// Successful executor output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorOutput {
    pub content: serde_json::Value,
    pub duration_ms: u64,
}

impl ExecutorOutput {
    pub fn new(content: serde_json::Value) -> Self {
        Self {
            content,
            duration_ms: 0,
        }
    }
}

/// Executor-side failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorFailure {
    pub message: String,
    /// Transient failures are retried per the node's policy.
    pub retryable: bool,
}

impl ExecutorFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Performs the actual work of one node.
///
/// Long-running and cancellable: the coordinator races this call against the
/// node's deadline and the workflow's cancel signal, and discards any result
/// that arrives after either fires.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute one attempt of `node`, finishing before `deadline`.
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        deadline: DateTime<Utc>,
    ) -> Result<ExecutorOutput, ExecutorFailure>;

    /// Identity recorded in attempt records and ledger entries.
    fn identity(&self) -> &str {
        "executor"
    }
}

/// Authorization request for one node dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRequest {
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: Uuid,
    pub node_kind: NodeKind,
    pub access: AccessTier,
    pub priority: Priority,
}

/// Yes/no/constrained authorization decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    pub reason: String,
    /// Constraints the caller must apply when `allow` is true.
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allow: true,
            reason: "allowed".to_string(),
            constraints: Vec::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: reason.into(),
            constraints: Vec::new(),
        }
    }
}

/// Authorization decision point, consulted before dispatching any node
/// above [`AccessTier::Open`].
#[async_trait]
pub trait PolicyGate: Send + Sync {
    async fn evaluate(&self, request: &PolicyRequest) -> PolicyDecision;
}

/// Cost-based admission decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetDecision {
    pub admit: bool,
    pub reason: String,
}

impl BudgetDecision {
    pub fn admit() -> Self {
        Self {
            admit: true,
            reason: "within budget".to_string(),
        }
    }

    pub fn refuse(reason: impl Into<String>) -> Self {
        Self {
            admit: false,
            reason: reason.into(),
        }
    }
}

/// Cost-based admission control. The asynchronous kill path is
/// `SagaCoordinator::kill_tenant`, driven by whatever watches spend.
#[async_trait]
pub trait BudgetGate: Send + Sync {
    async fn admit(&self, tenant_id: Uuid, estimated_cost: f64) -> BudgetDecision;
}

/// Policy gate that allows everything. Default for tests and local runs.
#[derive(Debug, Default)]
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyGate for AllowAllPolicy {
    async fn evaluate(&self, _request: &PolicyRequest) -> PolicyDecision {
        PolicyDecision::allow()
    }
}

/// Budget gate that admits everything. Default for tests and local runs.
#[derive(Debug, Default)]
pub struct OpenBudget;

#[async_trait]
impl BudgetGate for OpenBudget {
    async fn admit(&self, _tenant_id: Uuid, _estimated_cost: f64) -> BudgetDecision {
        BudgetDecision::admit()
    }
}
