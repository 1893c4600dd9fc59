//! Simulated task executor.
//!
//! Stands in for the external agent runtime: sleeps for a configurable
//! latency, then succeeds or fails according to the node's `simulate`
//! parameters. Real deployments replace this with an adapter that calls the
//! actual execution runtime over its request/response contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::{sleep, Duration};

use conductor_core::{ExecutionContext, ExecutorFailure, ExecutorOutput, Node, TaskExecutor};

/// Executes nodes by simulation, driven by `node.params`:
///
/// - `simulate.latency_ms` — how long the attempt takes (default 10ms).
/// - `simulate.fail_attempts` — fail transiently this many attempts before
///   succeeding; exercises the retry path.
/// - `simulate.fail` — fail every attempt (transient).
/// - `simulate.fatal` — fail every attempt, non-retryable.
/// - `simulate.fail_compensation` — fail when run as a compensation.
/// - `output` — returned as the attempt's output; defaults to a small
///   success document.
pub struct SimulatedExecutor;

impl SimulatedExecutor {
    fn sim<'a>(node: &'a Node, key: &str) -> Option<&'a serde_json::Value> {
        node.params.get("simulate").and_then(|s| s.get(key))
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _deadline: DateTime<Utc>,
    ) -> Result<ExecutorOutput, ExecutorFailure> {
        let latency = Self::sim(node, "latency_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(10);
        sleep(Duration::from_millis(latency)).await;

        if ctx.compensating {
            if Self::sim(node, "fail_compensation").and_then(|v| v.as_bool()) == Some(true) {
                return Err(ExecutorFailure::transient(format!(
                    "simulated compensation failure in {}",
                    node.name
                )));
            }
            return Ok(ExecutorOutput::new(json!({"compensated": node.name})));
        }

        if Self::sim(node, "fatal").and_then(|v| v.as_bool()) == Some(true) {
            return Err(ExecutorFailure::fatal(format!(
                "simulated fatal failure in {}",
                node.name
            )));
        }
        if Self::sim(node, "fail").and_then(|v| v.as_bool()) == Some(true) {
            return Err(ExecutorFailure::transient(format!(
                "simulated failure in {}",
                node.name
            )));
        }
        if let Some(n) = Self::sim(node, "fail_attempts").and_then(|v| v.as_u64()) {
            if u64::from(ctx.attempt) <= n {
                return Err(ExecutorFailure::transient(format!(
                    "simulated failure in {} (attempt {})",
                    node.name, ctx.attempt
                )));
            }
        }

        let content = node
            .params
            .get("output")
            .cloned()
            .unwrap_or_else(|| json!({"ok": true, "node": node.name, "attempt": ctx.attempt}));
        Ok(ExecutorOutput::new(content))
    }

    fn identity(&self) -> &str {
        "simulated-executor"
    }
}
