//! End-to-end coordinator flows: happy paths, retries, rollbacks, human
//! review, cancellation, and ledger-backed recovery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use conductor_core::{
    AccessTier, AllowAllPolicy, BudgetDecision, BudgetGate, ConductorError, Dag,
    ExecutionContext, ExecutorFailure, ExecutorOutput, FailureReason, Lifecycle, Node, NodeKind,
    OpenBudget, OutputContract, PolicyDecision, PolicyGate, PolicyRequest, RetryPolicy,
    TaskExecutor, Tenant, TenantTier, WorkflowStatus,
};
use conductor_ledger::{
    replay_entries, EntryDraft, Ledger, LedgerEntry, LedgerEventKind, LedgerSigner, LedgerStore,
    MemoryLedgerStore,
};
use conductor_review::ReviewDecision;
use conductor_saga::{CoordinatorConfig, SagaCoordinator};
use conductor_sched::{DagScheduler, SchedulerConfig};

// ---- scripted executor ----

#[derive(Clone)]
enum Behavior {
    Succeed,
    SucceedWith(serde_json::Value),
    /// Transient failure for attempts up to and including the bound.
    FailAttempts(u32),
    FailAlways {
        retryable: bool,
    },
    FailCompensation,
    /// Sleep this long before succeeding.
    Slow(u64),
}

#[derive(Debug, Clone)]
struct Call {
    name: String,
    attempt: u32,
    compensating: bool,
}

struct ScriptedExecutor {
    behaviors: HashMap<String, Behavior>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    fn new(behaviors: impl IntoIterator<Item = (&'static str, Behavior)>) -> Arc<Self> {
        Arc::new(Self {
            behaviors: behaviors
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn compensation_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.compensating)
            .map(|c| c.name)
            .collect()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _deadline: DateTime<Utc>,
    ) -> Result<ExecutorOutput, ExecutorFailure> {
        self.calls.lock().unwrap().push(Call {
            name: node.name.clone(),
            attempt: ctx.attempt,
            compensating: ctx.compensating,
        });

        let behavior = self
            .behaviors
            .get(&node.name)
            .cloned()
            .unwrap_or(Behavior::Succeed);

        if ctx.compensating {
            return match behavior {
                Behavior::FailCompensation => {
                    Err(ExecutorFailure::transient("compensation exploded"))
                }
                _ => Ok(ExecutorOutput::new(json!({"compensated": node.name}))),
            };
        }

        match behavior {
            Behavior::Succeed => Ok(ExecutorOutput::new(json!({"done": node.name}))),
            Behavior::SucceedWith(content) => Ok(ExecutorOutput::new(content)),
            Behavior::FailAttempts(bound) if ctx.attempt <= bound => Err(
                ExecutorFailure::transient(format!("attempt {} failed", ctx.attempt)),
            ),
            Behavior::FailAttempts(_) => Ok(ExecutorOutput::new(json!({"done": node.name}))),
            Behavior::FailAlways { retryable } => Err(ExecutorFailure {
                message: "scripted failure".to_string(),
                retryable,
            }),
            Behavior::FailCompensation => Ok(ExecutorOutput::new(json!({"done": node.name}))),
            Behavior::Slow(ms) => {
                sleep(Duration::from_millis(ms)).await;
                Ok(ExecutorOutput::new(json!({"done": node.name})))
            }
        }
    }

    fn identity(&self) -> &str {
        "scripted"
    }
}

// ---- gates ----

struct DenyAllPolicy;

#[async_trait]
impl PolicyGate for DenyAllPolicy {
    async fn evaluate(&self, _request: &PolicyRequest) -> PolicyDecision {
        PolicyDecision::deny("not on my watch")
    }
}

struct ClosedBudget;

#[async_trait]
impl BudgetGate for ClosedBudget {
    async fn admit(&self, _tenant_id: Uuid, _estimated_cost: f64) -> BudgetDecision {
        BudgetDecision::refuse("out of funds")
    }
}

/// Store that can be switched into a failing mode mid-run.
struct FlakyStore {
    inner: MemoryLedgerStore,
    failing: AtomicBool,
}

impl FlakyStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryLedgerStore::new(),
            failing: AtomicBool::new(false),
        })
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn append(&self, entry: &LedgerEntry) -> conductor_core::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConductorError::LedgerWriteFailure {
                message: "storage offline".to_string(),
            });
        }
        self.inner.append(entry).await
    }

    async fn load(&self) -> conductor_core::Result<Vec<LedgerEntry>> {
        self.inner.load().await
    }
}

// ---- harness ----

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff_ms: vec![1],
        jitter_frac: 0.0,
    }
}

struct Harness {
    coordinator: Arc<SagaCoordinator>,
    ledger: Arc<Ledger>,
    tenant: Tenant,
}

impl Harness {
    fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self::with_parts(executor, Arc::new(AllowAllPolicy), Arc::new(OpenBudget), None)
    }

    fn with_parts(
        executor: Arc<dyn TaskExecutor>,
        policy: Arc<dyn PolicyGate>,
        budget: Arc<dyn BudgetGate>,
        store: Option<Arc<dyn LedgerStore>>,
    ) -> Self {
        let scheduler = Arc::new(DagScheduler::new(SchedulerConfig::default()));
        let ledger = Arc::new(Ledger::new(
            LedgerSigner::generate(),
            store.unwrap_or_else(|| Arc::new(MemoryLedgerStore::new())),
        ));
        let coordinator = Arc::new(SagaCoordinator::new(
            scheduler,
            ledger.clone(),
            executor,
            policy,
            budget,
            CoordinatorConfig::default(),
        ));
        Self {
            coordinator,
            ledger,
            tenant: Tenant::new("acme", TenantTier::Pro),
        }
    }

    async fn submit(&self, dag: Dag) -> Uuid {
        self.coordinator
            .submit(dag, &self.tenant, None)
            .await
            .expect("submit")
    }

    /// Tick until the workflow satisfies `done` or the budget runs out.
    async fn drive_until(
        &self,
        workflow_id: Uuid,
        done: impl Fn(&WorkflowStatus) -> bool,
    ) -> WorkflowStatus {
        for _ in 0..300 {
            self.coordinator.tick().await.expect("tick");
            let status = self.coordinator.status(workflow_id).await.expect("status");
            if done(&status) {
                return status;
            }
            sleep(Duration::from_millis(2)).await;
        }
        panic!("workflow never reached the expected state");
    }

    async fn drive(&self, workflow_id: Uuid) -> WorkflowStatus {
        self.drive_until(workflow_id, |s| s.state.is_terminal()).await
    }

    async fn entries_of_kind(&self, workflow_id: Uuid, kind: LedgerEventKind) -> Vec<LedgerEntry> {
        self.ledger
            .workflow_entries(self.tenant.id, workflow_id)
            .await
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }
}

/// migrate -> deploy -> update_routing, compensations on the first two.
fn deployment_dag(retry: RetryPolicy) -> (Dag, [Uuid; 3]) {
    let mut dag = Dag::new();
    let undo_migrate = dag.add_node(Node::new("undo_migrate", NodeKind::Compensation));
    let undo_deploy = dag.add_node(Node::new("undo_deploy", NodeKind::Compensation));
    let migrate = dag.add_node(
        Node::new("migrate", NodeKind::Tool)
            .with_retry(retry.clone())
            .with_compensation(undo_migrate),
    );
    let deploy = dag.add_node(
        Node::new("deploy", NodeKind::Tool)
            .with_retry(retry.clone())
            .with_compensation(undo_deploy),
    );
    let update_routing = dag.add_node(Node::new("update_routing", NodeKind::Tool).with_retry(retry));
    dag.add_edge(migrate, deploy);
    dag.add_edge(deploy, update_routing);
    (dag, [migrate, deploy, update_routing])
}

// ---- flows ----

#[tokio::test]
async fn test_cyclic_dag_is_rejected_without_an_instance() {
    let harness = Harness::new(ScriptedExecutor::new([]));
    let mut dag = Dag::new();
    let a = dag.add_node(Node::new("a", NodeKind::Tool));
    let b = dag.add_node(Node::new("b", NodeKind::Tool));
    dag.add_edge(a, b);
    dag.add_edge(b, a);

    let err = harness
        .coordinator
        .submit(dag, &harness.tenant, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::Validation { .. }));
    assert!(harness.coordinator.list().await.is_empty());
    // Nothing ledgered either.
    assert!(harness.ledger.entries(harness.tenant.id, None).await.is_empty());
}

#[tokio::test]
async fn test_linear_saga_commits_in_edge_order() {
    let executor = ScriptedExecutor::new([]);
    let harness = Harness::new(executor.clone());
    let (dag, [migrate, deploy, update_routing]) = deployment_dag(fast_retry(3));

    let workflow_id = harness.submit(dag).await;
    let status = harness.drive(workflow_id).await;

    assert_eq!(status.state, Lifecycle::Committed);
    let order: Vec<String> = executor
        .calls()
        .into_iter()
        .filter(|c| !c.compensating)
        .map(|c| c.name)
        .collect();
    assert_eq!(order, ["migrate", "deploy", "update_routing"]);

    let replayed = harness.ledger.replay(harness.tenant.id, workflow_id).await;
    assert_eq!(replayed.commit_order, vec![migrate, deploy, update_routing]);
}

#[tokio::test]
async fn test_replay_matches_live_final_state() {
    let harness = Harness::new(ScriptedExecutor::new([(
        "deploy",
        Behavior::FailAttempts(1),
    )]));
    let (dag, _) = deployment_dag(fast_retry(3));

    let workflow_id = harness.submit(dag).await;
    let live = harness.drive(workflow_id).await;
    assert_eq!(live.state, Lifecycle::Committed);

    let replayed = harness.ledger.replay(harness.tenant.id, workflow_id).await;
    assert_eq!(replayed.final_state, Some(Lifecycle::Committed));
    for node in &live.nodes {
        assert_eq!(
            replayed.node_states.get(&node.node_id).copied(),
            Some(node.state),
            "replayed state for {} diverged",
            node.name
        );
    }
}

#[tokio::test]
async fn test_failure_at_third_node_compensates_in_reverse() {
    let executor = ScriptedExecutor::new([(
        "update_routing",
        Behavior::FailAlways { retryable: false },
    )]);
    let harness = Harness::new(executor.clone());
    let (dag, [_, _, update_routing]) = deployment_dag(fast_retry(3));

    let workflow_id = harness.submit(dag).await;
    let status = harness.drive(workflow_id).await;

    assert_eq!(status.state, Lifecycle::RolledBack);
    assert!(!status.partially_compensated);

    // Reverse commit order: deploy's compensation, then migrate's.
    assert_eq!(
        executor.compensation_calls(),
        vec!["undo_deploy".to_string(), "undo_migrate".to_string()]
    );
    let executed = harness
        .entries_of_kind(workflow_id, LedgerEventKind::CompensationExecuted)
        .await;
    let names: Vec<&str> = executed
        .iter()
        .filter_map(|e| e.payload["node"].as_str())
        .collect();
    assert_eq!(names, ["deploy", "migrate"]);

    // The failed node had no compensation; it is recorded as uncompensated.
    let skipped = harness
        .entries_of_kind(workflow_id, LedgerEventKind::CompensationSkipped)
        .await;
    assert!(skipped
        .iter()
        .any(|e| e.node_id == Some(update_routing)));
    let node = status.node(update_routing).expect("node status");
    assert!(node.uncompensated);
}

#[tokio::test]
async fn test_transient_failures_retry_within_budget() {
    let executor = ScriptedExecutor::new([("migrate", Behavior::FailAttempts(2))]);
    let harness = Harness::new(executor.clone());
    let (dag, [migrate, ..]) = deployment_dag(fast_retry(3));

    let workflow_id = harness.submit(dag).await;
    let status = harness.drive(workflow_id).await;

    assert_eq!(status.state, Lifecycle::Committed);
    assert_eq!(status.node(migrate).unwrap().attempts, 3);
}

#[tokio::test]
async fn test_exhausted_retries_roll_back() {
    let harness = Harness::new(ScriptedExecutor::new([(
        "deploy",
        Behavior::FailAlways { retryable: true },
    )]));
    let (dag, [_, deploy, _]) = deployment_dag(fast_retry(2));

    let workflow_id = harness.submit(dag).await;
    let status = harness.drive(workflow_id).await;

    assert_eq!(status.state, Lifecycle::RolledBack);
    let node = status.node(deploy).unwrap();
    assert_eq!(node.attempts, 2);
    assert!(matches!(
        node.failure,
        Some(FailureReason::Executor { .. })
    ));
}

#[tokio::test]
async fn test_compensation_failure_flags_partial_rollback() {
    let harness = Harness::new(ScriptedExecutor::new([
        ("update_routing", Behavior::FailAlways { retryable: false }),
        ("undo_deploy", Behavior::FailCompensation),
    ]));
    let (dag, _) = deployment_dag(fast_retry(2));

    let workflow_id = harness.submit(dag).await;
    let status = harness.drive(workflow_id).await;

    // The walk continues past the failed compensation and still terminates.
    assert_eq!(status.state, Lifecycle::RolledBack);
    assert!(status.partially_compensated);
    let failed = harness
        .entries_of_kind(workflow_id, LedgerEventKind::CompensationFailed)
        .await;
    assert_eq!(failed.len(), 1);
    let executed = harness
        .entries_of_kind(workflow_id, LedgerEventKind::CompensationExecuted)
        .await;
    assert_eq!(executed.len(), 1); // undo_migrate still ran
}

#[tokio::test]
async fn test_review_on_exhaustion_waits_then_operator_retry_succeeds() {
    let executor = ScriptedExecutor::new([("deploy", Behavior::FailAttempts(2))]);
    let harness = Harness::new(executor.clone());

    let mut dag = Dag::new();
    dag.add_node(
        Node::new("deploy", NodeKind::Tool)
            .with_retry(fast_retry(2))
            .review_on_exhaustion(),
    );

    let workflow_id = harness.submit(dag).await;
    let status = harness
        .drive_until(workflow_id, |s| s.state == Lifecycle::HumanReview)
        .await;
    assert_eq!(status.state, Lifecycle::HumanReview);

    let open = harness.coordinator.reviews().open_requests().await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].attempts_used, 2);

    // Operator approves a fresh retry cycle; attempt 3 succeeds.
    harness
        .coordinator
        .resolve_review(open[0].id, ReviewDecision::RetryApproved)
        .await
        .expect("resolve");
    let status = harness.drive(workflow_id).await;
    assert_eq!(status.state, Lifecycle::Committed);
}

#[tokio::test]
async fn test_review_compensate_decision_rolls_back() {
    let harness = Harness::new(ScriptedExecutor::new([(
        "update_routing",
        Behavior::FailAlways { retryable: true },
    )]));
    let (mut dag, [_, _, update_routing]) = deployment_dag(fast_retry(2));
    // Route the failing node through human review instead of compensating
    // immediately.
    for node in &mut dag.nodes {
        if node.id == update_routing {
            node.review_on_exhaustion = true;
        }
    }

    let workflow_id = harness.submit(dag).await;
    harness
        .drive_until(workflow_id, |s| s.state == Lifecycle::HumanReview)
        .await;

    let open = harness.coordinator.reviews().open_requests().await;
    harness
        .coordinator
        .resolve_review(open[0].id, ReviewDecision::Compensate)
        .await
        .expect("resolve");

    let status = harness.coordinator.status(workflow_id).await.unwrap();
    assert_eq!(status.state, Lifecycle::RolledBack);
}

#[tokio::test]
async fn test_human_approval_node_parks_until_approved() {
    let executor = ScriptedExecutor::new([]);
    let harness = Harness::new(executor.clone());

    let mut dag = Dag::new();
    let gate = dag.add_node(Node::new("release_gate", NodeKind::HumanApproval));
    let ship = dag.add_node(Node::new("ship", NodeKind::Tool));
    dag.add_edge(gate, ship);

    let workflow_id = harness.submit(dag).await;
    harness
        .drive_until(workflow_id, |s| s.state == Lifecycle::HumanReview)
        .await;

    // The approval node never touched the executor.
    assert!(executor.calls().is_empty());

    let open = harness.coordinator.reviews().open_requests().await;
    harness
        .coordinator
        .resolve_review(open[0].id, ReviewDecision::ApproveNode)
        .await
        .expect("resolve");

    let status = harness.drive(workflow_id).await;
    assert_eq!(status.state, Lifecycle::Committed);
    assert_eq!(status.node(gate).unwrap().state, Lifecycle::Committed);
    assert_eq!(status.node(ship).unwrap().state, Lifecycle::Committed);
}

#[tokio::test]
async fn test_human_approval_rejection_rolls_back() {
    let harness = Harness::new(ScriptedExecutor::new([]));

    let mut dag = Dag::new();
    let undo = dag.add_node(Node::new("undo_prepare", NodeKind::Compensation));
    let prepare = dag.add_node(Node::new("prepare", NodeKind::Tool).with_compensation(undo));
    let gate = dag.add_node(Node::new("release_gate", NodeKind::HumanApproval));
    dag.add_edge(prepare, gate);

    let workflow_id = harness.submit(dag).await;
    harness
        .drive_until(workflow_id, |s| s.state == Lifecycle::HumanReview)
        .await;

    let open = harness.coordinator.reviews().open_requests().await;
    harness
        .coordinator
        .resolve_review(
            open[0].id,
            ReviewDecision::RejectNode {
                reason: "not this friday".to_string(),
            },
        )
        .await
        .expect("resolve");

    let status = harness.coordinator.status(workflow_id).await.unwrap();
    assert_eq!(status.state, Lifecycle::RolledBack);
    // The committed predecessor was compensated.
    let executed = harness
        .entries_of_kind(workflow_id, LedgerEventKind::CompensationExecuted)
        .await;
    assert_eq!(executed.len(), 1);
}

#[tokio::test]
async fn test_cancel_compensates_committed_work() {
    let executor = ScriptedExecutor::new([("deploy", Behavior::Slow(300))]);
    let harness = Harness::new(executor.clone());
    let (dag, [migrate, ..]) = deployment_dag(fast_retry(2));

    let workflow_id = harness.submit(dag).await;

    // Run the pump on a separate task; it will block inside the slow node.
    let coordinator = harness.coordinator.clone();
    let pump = tokio::spawn(async move { coordinator.tick().await });
    sleep(Duration::from_millis(100)).await;

    harness.coordinator.cancel(workflow_id).await.expect("cancel");
    let _ = pump.await.expect("pump");

    let status = harness.coordinator.status(workflow_id).await.unwrap();
    assert_eq!(status.state, Lifecycle::Cancelled);
    // migrate committed before the cancel, so its compensation ran.
    assert_eq!(
        status.node(migrate).unwrap().compensation,
        conductor_core::CompensationStatus::Executed
    );
    assert!(executor
        .compensation_calls()
        .contains(&"undo_migrate".to_string()));
}

#[tokio::test]
async fn test_policy_denial_fails_without_retry() {
    let harness = Harness::with_parts(
        ScriptedExecutor::new([]),
        Arc::new(DenyAllPolicy),
        Arc::new(OpenBudget),
        None,
    );

    let mut dag = Dag::new();
    let guarded = dag.add_node(
        Node::new("guarded_step", NodeKind::Tool)
            .with_access(AccessTier::Guarded)
            .with_retry(fast_retry(3)),
    );

    let workflow_id = harness.submit(dag).await;
    let status = harness.drive(workflow_id).await;

    assert_eq!(status.state, Lifecycle::RolledBack);
    let node = status.node(guarded).unwrap();
    // A standing DENY is not retried.
    assert_eq!(node.attempts, 0);
    assert!(matches!(
        node.failure,
        Some(FailureReason::PolicyDenied { .. })
    ));
}

#[tokio::test]
async fn test_budget_refusal_fails_the_node() {
    let harness = Harness::with_parts(
        ScriptedExecutor::new([]),
        Arc::new(AllowAllPolicy),
        Arc::new(ClosedBudget),
        None,
    );

    let mut dag = Dag::new();
    let step = dag.add_node(Node::new("expensive_step", NodeKind::Agent).with_cost(100.0));

    let workflow_id = harness.submit(dag).await;
    let status = harness.drive(workflow_id).await;

    assert_eq!(status.state, Lifecycle::RolledBack);
    assert!(matches!(
        status.node(step).unwrap().failure,
        Some(FailureReason::BudgetExceeded { .. })
    ));
}

#[tokio::test]
async fn test_budget_kill_switch_fails_executing_nodes() {
    let executor = ScriptedExecutor::new([("long_call", Behavior::Slow(300))]);
    let harness = Harness::new(executor);

    let mut dag = Dag::new();
    let node = dag.add_node(Node::new("long_call", NodeKind::Agent));

    let workflow_id = harness.submit(dag).await;
    let coordinator = harness.coordinator.clone();
    let pump = tokio::spawn(async move { coordinator.tick().await });
    sleep(Duration::from_millis(100)).await;

    let killed = harness
        .coordinator
        .kill_tenant(harness.tenant.id)
        .await
        .expect("kill");
    assert_eq!(killed, 1);
    let _ = pump.await.expect("pump");

    let status = harness.coordinator.status(workflow_id).await.unwrap();
    assert_eq!(status.state, Lifecycle::RolledBack);
    assert!(matches!(
        status.node(node).unwrap().failure,
        Some(FailureReason::BudgetExceeded { .. })
    ));
}

#[tokio::test]
async fn test_timeout_is_retried_then_exhausts() {
    let executor = ScriptedExecutor::new([("slow_step", Behavior::Slow(200))]);
    let harness = Harness::new(executor);

    let mut dag = Dag::new();
    let slow = dag.add_node(
        Node::new("slow_step", NodeKind::Tool)
            .with_timeout_ms(10)
            .with_retry(fast_retry(2)),
    );

    let workflow_id = harness.submit(dag).await;
    let status = harness.drive(workflow_id).await;

    assert_eq!(status.state, Lifecycle::RolledBack);
    let node = status.node(slow).unwrap();
    assert_eq!(node.attempts, 2);
    assert!(matches!(node.failure, Some(FailureReason::Timeout)));
}

#[tokio::test]
async fn test_output_contract_violation_is_a_failure() {
    let harness = Harness::new(ScriptedExecutor::new([(
        "fetch",
        Behavior::SucceedWith(json!({"body": "ok"})),
    )]));

    let mut dag = Dag::new();
    let fetch = dag.add_node(
        Node::new("fetch", NodeKind::Tool)
            .with_retry(fast_retry(2))
            .with_output_contract(OutputContract {
                required_fields: vec!["status_code".to_string()],
            }),
    );

    let workflow_id = harness.submit(dag).await;
    let status = harness.drive(workflow_id).await;

    assert_eq!(status.state, Lifecycle::RolledBack);
    match &status.node(fetch).unwrap().failure {
        Some(FailureReason::VerificationFailed { missing }) => {
            assert_eq!(missing, &vec!["status_code".to_string()]);
        }
        other => panic!("expected verification failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ledger_outage_blocks_progress_then_recovers() {
    let store = FlakyStore::new();
    let harness = Harness::with_parts(
        ScriptedExecutor::new([]),
        Arc::new(AllowAllPolicy),
        Arc::new(OpenBudget),
        Some(store.clone()),
    );

    let mut dag = Dag::new();
    let step = dag.add_node(Node::new("step", NodeKind::Tool));
    let workflow_id = harness.submit(dag).await;

    store.set_failing(true);
    let err = harness.coordinator.tick().await.unwrap_err();
    assert!(matches!(err, ConductorError::LedgerWriteFailure { .. }));
    // The transition never happened: the node is still waiting, not lost.
    let status = harness.coordinator.status(workflow_id).await.unwrap();
    assert_eq!(status.node(step).unwrap().state, Lifecycle::Scheduled);
    assert_eq!(status.node(step).unwrap().attempts, 0);

    store.set_failing(false);
    let status = harness.drive(workflow_id).await;
    assert_eq!(status.state, Lifecycle::Committed);
}

#[tokio::test]
async fn test_duplicate_entries_replay_to_one_commit() {
    let harness = Harness::new(ScriptedExecutor::new([]));
    let mut dag = Dag::new();
    let step = dag.add_node(Node::new("step", NodeKind::Tool).idempotent());
    let workflow_id = harness.submit(dag).await;
    let status = harness.drive(workflow_id).await;
    assert_eq!(status.state, Lifecycle::Committed);

    // Simulate at-least-once delivery: the commit entry lands twice.
    let commit = harness
        .ledger
        .workflow_entries(harness.tenant.id, workflow_id)
        .await
        .into_iter()
        .find(|e| {
            e.kind == LedgerEventKind::NodeStateChanged
                && e.payload["to"] == json!("committed")
        })
        .expect("commit entry");
    harness
        .ledger
        .append(EntryDraft::node(
            commit.tenant_id,
            commit.workflow_id,
            step,
            commit.attempt,
            commit.kind,
            commit.payload.clone(),
        ))
        .await
        .expect("duplicate append");

    let entries = harness
        .ledger
        .workflow_entries(harness.tenant.id, workflow_id)
        .await;
    let replayed = replay_entries(workflow_id, &entries);
    assert_eq!(replayed.commit_order, vec![step]);
    assert_eq!(replayed.final_state, Some(Lifecycle::Committed));
}

#[tokio::test]
async fn test_restore_rebuilds_instance_from_ledger() {
    let executor = ScriptedExecutor::new([]);
    let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
    let scheduler = Arc::new(DagScheduler::new(SchedulerConfig::default()));
    let signer = LedgerSigner::from_seed([7u8; 32]);
    let ledger = Arc::new(Ledger::new(signer, store));
    let coordinator = Arc::new(SagaCoordinator::new(
        scheduler.clone(),
        ledger.clone(),
        executor.clone(),
        Arc::new(AllowAllPolicy),
        Arc::new(OpenBudget),
        CoordinatorConfig::default(),
    ));
    let tenant = Tenant::new("acme", TenantTier::Pro);
    let (dag, _) = deployment_dag(fast_retry(3));
    let workflow_id = coordinator.submit(dag, &tenant, None).await.unwrap();
    let live = loop {
        coordinator.tick().await.unwrap();
        let status = coordinator.status(workflow_id).await.unwrap();
        if status.state.is_terminal() {
            break status;
        }
        sleep(Duration::from_millis(2)).await;
    };

    // A second coordinator over the same ledger: what a restarted process
    // would do.
    let restarted = Arc::new(SagaCoordinator::new(
        Arc::new(DagScheduler::new(SchedulerConfig::default())),
        ledger,
        executor,
        Arc::new(AllowAllPolicy),
        Arc::new(OpenBudget),
        CoordinatorConfig::default(),
    ));
    let restored = restarted
        .restore(tenant.id, workflow_id)
        .await
        .expect("restore");

    assert_eq!(restored.state, live.state);
    for node in &live.nodes {
        assert_eq!(
            restored.node(node.node_id).map(|n| n.state),
            Some(node.state)
        );
    }
}
