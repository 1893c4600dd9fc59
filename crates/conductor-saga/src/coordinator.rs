//! The saga coordinator.
//!
//! Drives every workflow instance through its lifecycle: admits ready nodes
//! to the scheduler, dispatches them through the policy and budget gates to
//! the task executor, verifies and commits results, retries failures with
//! jittered backoff, hands exhausted nodes to human review, and walks
//! compensations in reverse commit order when a workflow dies. Every
//! transition is appended to the ledger before the in-memory state advances.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use conductor_core::{
    AccessTier, AttemptOutcome, BudgetGate, CompensationStatus, ConductorError, Dag,
    ExecutionContext, ExecutorFailure, ExecutorOutput, FailureReason, Lifecycle, Node, NodeKind,
    PolicyGate, PolicyRequest, Result, TaskExecutor, Tenant, WorkflowInstance, WorkflowStatus,
};
use conductor_ledger::{EntryDraft, Ledger, LedgerEventKind};
use conductor_review::{ReviewDecision, ReviewQueue, ReviewReason};
use conductor_sched::{Admission, DagScheduler, SchedEvent};

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum nodes dispatched per tick.
    pub dispatch_capacity: usize,
    /// How long review requests stay open before expiring.
    pub review_ttl_seconds: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            dispatch_capacity: 4,
            review_ttl_seconds: 3_600,
        }
    }
}

/// What one `tick` accomplished.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    pub dispatched: usize,
}

enum RunOutcome {
    Output(ExecutorOutput),
    Failed(ExecutorFailure),
    Timeout,
    Cancelled,
}

/// Coordinates workflow instances through the saga state machine.
///
/// Instance state is owned exclusively by this coordinator; the scheduler
/// queues and the ledger chains are the only structures shared with other
/// actors.
pub struct SagaCoordinator {
    scheduler: Arc<DagScheduler>,
    ledger: Arc<Ledger>,
    executor: Arc<dyn TaskExecutor>,
    policy: Arc<dyn PolicyGate>,
    budget: Arc<dyn BudgetGate>,
    reviews: ReviewQueue,
    instances: RwLock<HashMap<Uuid, WorkflowInstance>>,
    cancel_signals: RwLock<HashMap<Uuid, watch::Sender<bool>>>,
    config: CoordinatorConfig,
}

impl SagaCoordinator {
    pub fn new(
        scheduler: Arc<DagScheduler>,
        ledger: Arc<Ledger>,
        executor: Arc<dyn TaskExecutor>,
        policy: Arc<dyn PolicyGate>,
        budget: Arc<dyn BudgetGate>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            scheduler,
            ledger,
            executor,
            policy,
            budget,
            reviews: ReviewQueue::new(),
            instances: RwLock::new(HashMap::new()),
            cancel_signals: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// The review queue, shared with the API surface.
    pub fn reviews(&self) -> &ReviewQueue {
        &self.reviews
    }

    /// Accept a DAG for a tenant and create a workflow instance.
    ///
    /// # Errors
    /// `Validation` for malformed DAGs — nothing is created and nothing is
    /// ledgered. `LedgerWriteFailure` if the submission record cannot be
    /// persisted.
    pub async fn submit(
        &self,
        dag: Dag,
        tenant: &Tenant,
        intent_id: Option<Uuid>,
    ) -> Result<Uuid> {
        dag.validate()?;
        self.scheduler
            .register_tenant(tenant.id, tenant.weight, tenant.queue_limit);

        let instance = WorkflowInstance::new(tenant.id, intent_id, dag);
        let workflow_id = instance.id;
        self.ledger
            .append(EntryDraft::workflow(
                tenant.id,
                workflow_id,
                LedgerEventKind::WorkflowSubmitted,
                json!({
                    "dag": instance.dag,
                    "fingerprint": instance.dag.fingerprint(),
                    "intent": intent_id,
                }),
            ))
            .await?;
        info!(workflow = %workflow_id, tenant = %tenant.id, "workflow submitted");

        let (tx, _rx) = watch::channel(false);
        self.instances.write().await.insert(workflow_id, instance);
        self.cancel_signals.write().await.insert(workflow_id, tx);

        // Entry nodes are admitted on the first tick; admit eagerly here so
        // a submit immediately followed by a tick dispatches work.
        let mut instances = self.instances.write().await;
        if let Some(instance) = instances.get_mut(&workflow_id) {
            self.admit_ready_for(instance).await?;
            self.sync_workflow(instance).await?;
        }
        Ok(workflow_id)
    }

    /// Current status snapshot; always reflects the true state, including
    /// compensation flags.
    pub async fn status(&self, workflow_id: Uuid) -> Result<WorkflowStatus> {
        let instances = self.instances.read().await;
        instances
            .get(&workflow_id)
            .map(WorkflowInstance::snapshot)
            .ok_or_else(|| ConductorError::not_found("Workflow", workflow_id))
    }

    /// Snapshots of every known instance.
    pub async fn list(&self) -> Vec<WorkflowStatus> {
        let instances = self.instances.read().await;
        instances.values().map(WorkflowInstance::snapshot).collect()
    }

    /// Node-level status: the node's workflow must be known.
    pub async fn node_status(
        &self,
        node_id: Uuid,
    ) -> Result<(WorkflowStatus, conductor_core::NodeStatus)> {
        let instances = self.instances.read().await;
        for instance in instances.values() {
            if instance.nodes.contains_key(&node_id) {
                let status = instance.snapshot();
                let node = status
                    .node(node_id)
                    .cloned()
                    .expect("node present in snapshot");
                return Ok((status, node));
            }
        }
        Err(ConductorError::not_found("Node", node_id))
    }

    /// One pump of the dispatch loop: admit ready and due-retry nodes,
    /// ledger scheduler events, and run up to `dispatch_capacity` nodes.
    pub async fn tick(&self) -> Result<TickReport> {
        self.admit_ready().await?;
        self.apply_sched_events().await?;

        let mut report = TickReport::default();
        while report.dispatched < self.config.dispatch_capacity {
            let remaining = self.config.dispatch_capacity - report.dispatched;
            let Some(item) = self.scheduler.dequeue_next(remaining) else {
                break;
            };
            self.apply_sched_events().await?;
            self.dispatch(item).await?;
            report.dispatched += 1;
        }
        self.apply_sched_events().await?;
        Ok(report)
    }

    /// Cancel a workflow: queued nodes are removed, the executing node's
    /// result is discarded, committed nodes are compensated.
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<()> {
        // Signal first so an in-flight executor future is dropped promptly.
        if let Some(tx) = self.cancel_signals.read().await.get(&workflow_id) {
            let _ = tx.send(true);
        }

        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&workflow_id)
            .ok_or_else(|| ConductorError::not_found("Workflow", workflow_id))?;
        if instance.state.is_terminal() {
            return Ok(());
        }
        info!(workflow = %workflow_id, "cancelling workflow");

        let node_ids: Vec<Uuid> = instance.nodes.keys().copied().collect();
        for node_id in node_ids {
            let state = instance.nodes[&node_id].state;
            match state {
                Lifecycle::Scheduled => {
                    self.scheduler.cancel(node_id);
                    self.transition_node(
                        instance,
                        node_id,
                        None,
                        Lifecycle::Cancelled,
                        serde_json::Value::Null,
                    )
                    .await?;
                }
                Lifecycle::Pending
                | Lifecycle::Executing
                | Lifecycle::Verifying
                | Lifecycle::Failed
                | Lifecycle::Retrying
                | Lifecycle::Escalated
                | Lifecycle::HumanReview => {
                    self.transition_node(
                        instance,
                        node_id,
                        None,
                        Lifecycle::Cancelled,
                        serde_json::Value::Null,
                    )
                    .await?;
                }
                _ => {}
            }
        }

        self.run_compensation_walk(instance).await?;
        self.set_workflow_state(instance, Lifecycle::Cancelled, json!({"by": "caller"}))
            .await?;
        Ok(())
    }

    /// Cancel a single node. Queued nodes leave the scheduler; an executing
    /// node keeps running but its result is discarded on arrival.
    pub async fn cancel_node(&self, node_id: Uuid) -> Result<()> {
        let mut instances = self.instances.write().await;
        for instance in instances.values_mut() {
            let Some(exec) = instance.nodes.get(&node_id) else {
                continue;
            };
            if exec.state.is_terminal() {
                return Ok(());
            }
            self.scheduler.cancel(node_id);
            self.transition_node(
                instance,
                node_id,
                None,
                Lifecycle::Cancelled,
                json!({"by": "caller"}),
            )
            .await?;
            self.sync_workflow(instance).await?;
            return Ok(());
        }
        Err(ConductorError::not_found("Node", node_id))
    }

    /// Re-enter a suspended workflow from its last committed frontier.
    pub async fn resume(&self, workflow_id: Uuid) -> Result<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&workflow_id)
            .ok_or_else(|| ConductorError::not_found("Workflow", workflow_id))?;
        if instance.state.is_terminal() {
            return Err(ConductorError::Internal(format!(
                "workflow {workflow_id} is terminal and cannot resume"
            )));
        }
        self.admit_ready_for(instance).await?;
        self.sync_workflow(instance).await?;
        Ok(())
    }

    /// Apply an operator decision from the review queue.
    pub async fn resolve_review(&self, request_id: Uuid, decision: ReviewDecision) -> Result<()> {
        let request = self.reviews.resolve(request_id, decision.clone()).await?;
        self.ledger
            .append(EntryDraft::node(
                request.tenant_id,
                request.workflow_id,
                request.node_id,
                None,
                LedgerEventKind::ReviewResolved,
                json!({"request": request_id, "decision": decision}),
            ))
            .await?;

        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&request.workflow_id)
            .ok_or_else(|| ConductorError::not_found("Workflow", request.workflow_id))?;

        match decision {
            ReviewDecision::RetryApproved => {
                // Fresh cycle: both the attempt budget and the backoff clock
                // restart at the operator's decision.
                self.transition_node(
                    instance,
                    request.node_id,
                    None,
                    Lifecycle::Retrying,
                    json!({"approved_by": "operator"}),
                )
                .await?;
                let exec = instance
                    .nodes
                    .get_mut(&request.node_id)
                    .expect("reviewed node exists");
                exec.attempt_base = exec.attempt_count();
                exec.failure = None;
                exec.next_retry_at = Some(Utc::now());
            }
            ReviewDecision::Compensate => {
                self.transition_node(
                    instance,
                    request.node_id,
                    None,
                    Lifecycle::Compensating,
                    serde_json::Value::Null,
                )
                .await?;
                self.run_compensation_walk(instance).await?;
                self.set_workflow_state(
                    instance,
                    Lifecycle::RolledBack,
                    json!({"partially_compensated": instance.partially_compensated}),
                )
                .await?;
                return Ok(());
            }
            ReviewDecision::ApproveNode => {
                self.commit_node(
                    instance,
                    request.node_id,
                    None,
                    json!({"approved": true}),
                )
                .await?;
            }
            ReviewDecision::RejectNode { reason } => {
                let exec = instance
                    .nodes
                    .get_mut(&request.node_id)
                    .expect("reviewed node exists");
                exec.failure = Some(FailureReason::ReviewRejected {
                    reason: reason.clone(),
                });
                self.transition_node(
                    instance,
                    request.node_id,
                    None,
                    Lifecycle::Failed,
                    json!({"reason": {"type": "review_rejected", "reason": reason}}),
                )
                .await?;
                self.transition_node(
                    instance,
                    request.node_id,
                    None,
                    Lifecycle::Compensating,
                    serde_json::Value::Null,
                )
                .await?;
                self.run_compensation_walk(instance).await?;
                self.set_workflow_state(
                    instance,
                    Lifecycle::RolledBack,
                    json!({"partially_compensated": instance.partially_compensated}),
                )
                .await?;
                return Ok(());
            }
        }
        self.sync_workflow(instance).await?;
        Ok(())
    }

    /// Expire overdue review requests. An unanswered request is treated as
    /// a rejection: the workflow gives up and compensates.
    pub async fn sweep_reviews(&self) -> Result<usize> {
        let expired = self.reviews.sweep_expired().await;
        let count = expired.len();
        for request in expired {
            warn!(request = %request.id, workflow = %request.workflow_id, "review expired");
            self.ledger
                .append(EntryDraft::node(
                    request.tenant_id,
                    request.workflow_id,
                    request.node_id,
                    None,
                    LedgerEventKind::ReviewResolved,
                    json!({"request": request.id, "decision": "expired"}),
                ))
                .await?;

            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(&request.workflow_id) else {
                continue;
            };
            if instance.state.is_terminal() {
                continue;
            }
            if instance.nodes.get(&request.node_id).map(|n| n.state)
                == Some(Lifecycle::HumanReview)
            {
                self.transition_node(
                    instance,
                    request.node_id,
                    None,
                    Lifecycle::Compensating,
                    json!({"reason": "review_expired"}),
                )
                .await?;
                self.run_compensation_walk(instance).await?;
                self.set_workflow_state(
                    instance,
                    Lifecycle::RolledBack,
                    json!({"partially_compensated": instance.partially_compensated}),
                )
                .await?;
            }
        }
        Ok(count)
    }

    /// Budget kill switch: fail every `EXECUTING` node of a tenant with
    /// `BudgetExceeded`. Returns the number of nodes killed.
    pub async fn kill_tenant(&self, tenant_id: Uuid) -> Result<u32> {
        let workflow_ids: Vec<Uuid> = {
            let instances = self.instances.read().await;
            instances
                .values()
                .filter(|i| i.tenant_id == tenant_id && !i.state.is_terminal())
                .map(|i| i.id)
                .collect()
        };

        let mut killed = 0;
        for workflow_id in workflow_ids {
            if let Some(tx) = self.cancel_signals.read().await.get(&workflow_id) {
                let _ = tx.send(true);
            }
            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(&workflow_id) else {
                continue;
            };
            let executing: Vec<Uuid> = instance
                .nodes
                .values()
                .filter(|n| n.state == Lifecycle::Executing)
                .map(|n| n.node_id)
                .collect();
            for node_id in executing {
                warn!(workflow = %workflow_id, node = %node_id, "budget kill");
                instance
                    .nodes
                    .get_mut(&node_id)
                    .expect("listed node exists")
                    .finish_attempt(AttemptOutcome::Failure);
                self.fail_node(
                    instance,
                    node_id,
                    None,
                    FailureReason::BudgetExceeded {
                        reason: "tenant budget kill switch".to_string(),
                    },
                )
                .await?;
                killed += 1;
            }
            self.sync_workflow(instance).await?;
        }
        Ok(killed)
    }

    /// Rebuild an instance from its ledger entries after a restart.
    ///
    /// At-least-once tolerant: replay deduplicates entries, so a crash
    /// between execution and ledger write cannot double-apply a transition.
    pub async fn restore(&self, tenant_id: Uuid, workflow_id: Uuid) -> Result<WorkflowStatus> {
        let entries = self.ledger.workflow_entries(tenant_id, workflow_id).await;
        let submitted = entries
            .iter()
            .find(|e| e.kind == LedgerEventKind::WorkflowSubmitted)
            .ok_or_else(|| ConductorError::not_found("Workflow", workflow_id))?;
        let dag: Dag = serde_json::from_value(
            submitted
                .payload
                .get("dag")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        )?;

        let replayed = conductor_ledger::replay_entries(workflow_id, &entries);
        let mut instance = WorkflowInstance::new(tenant_id, None, dag);
        instance.id = workflow_id;
        for (node_id, state) in &replayed.node_states {
            if let Some(exec) = instance.nodes.get_mut(node_id) {
                exec.state = *state;
            }
        }
        for node_id in &replayed.uncompensated {
            if let Some(exec) = instance.nodes.get_mut(node_id) {
                exec.compensation = CompensationStatus::Skipped;
            }
        }
        instance.commit_order = replayed.commit_order.clone();
        instance.partially_compensated = replayed.partially_compensated;
        if let Some(state) = replayed.final_state {
            instance.state = state;
        }

        // Committed outputs ride in the transition detail; restore them so
        // dependents resumed later still see their inputs.
        for entry in &entries {
            if entry.kind != LedgerEventKind::NodeStateChanged {
                continue;
            }
            let committed = entry.payload.get("to").and_then(|v| v.as_str()) == Some("committed");
            if !committed {
                continue;
            }
            if let (Some(node_id), Some(output)) = (
                entry.node_id,
                entry.payload.pointer("/detail/output").cloned(),
            ) {
                if let Some(exec) = instance.nodes.get_mut(&node_id) {
                    exec.output = Some(output);
                }
            }
        }

        info!(workflow = %workflow_id, "restored from ledger");
        let snapshot = instance.snapshot();
        let (tx, _rx) = watch::channel(false);
        self.instances.write().await.insert(workflow_id, instance);
        self.cancel_signals.write().await.insert(workflow_id, tx);
        Ok(snapshot)
    }

    // ---- internal machinery ----

    /// Admit ready and retry-due nodes across every active workflow.
    async fn admit_ready(&self) -> Result<()> {
        let mut instances = self.instances.write().await;
        let ids: Vec<Uuid> = instances.keys().copied().collect();
        for id in ids {
            let instance = instances.get_mut(&id).expect("listed instance exists");
            if instance.state.is_terminal()
                || instance.state == Lifecycle::Compensating
                || instance.state == Lifecycle::HumanReview
            {
                continue;
            }
            self.admit_ready_for(instance).await?;
        }
        Ok(())
    }

    async fn admit_ready_for(&self, instance: &mut WorkflowInstance) -> Result<()> {
        let settled = instance.settled();
        let now = Utc::now();

        let pending_ready: Vec<Uuid> = instance
            .dag
            .ready_after(&settled)
            .into_iter()
            .filter(|id| instance.nodes.get(id).map(|n| n.state) == Some(Lifecycle::Pending))
            .collect();
        for node_id in pending_ready {
            self.enqueue_node(instance, node_id).await?;
        }

        let retry_due: Vec<Uuid> = instance
            .nodes
            .values()
            .filter(|n| {
                n.state == Lifecycle::Retrying && n.next_retry_at.map_or(false, |at| at <= now)
            })
            .map(|n| n.node_id)
            .collect();
        for node_id in retry_due {
            self.enqueue_node(instance, node_id).await?;
        }
        Ok(())
    }

    /// Submit one node to the scheduler and record `-> Scheduled`.
    ///
    /// Backpressure is not an error here: the node stays where it was and
    /// is re-admitted on a later tick.
    async fn enqueue_node(&self, instance: &mut WorkflowInstance, node_id: Uuid) -> Result<()> {
        let priority = instance
            .nodes
            .get(&node_id)
            .map(|n| n.priority)
            .unwrap_or_default();
        let admission = Admission {
            node_id,
            workflow_id: instance.id,
            tenant_id: instance.tenant_id,
            priority,
        };
        match self.scheduler.enqueue(admission) {
            Ok(()) => {}
            Err(ConductorError::CapacityExceeded { .. }) => {
                // Deferred; the node keeps its state and waits out the
                // backpressure.
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        if let Err(e) = self
            .transition_node(
                instance,
                node_id,
                None,
                Lifecycle::Scheduled,
                serde_json::Value::Null,
            )
            .await
        {
            // The transition was never durable; pull the node back out.
            self.scheduler.cancel(node_id);
            return Err(e);
        }
        if let Some(exec) = instance.nodes.get_mut(&node_id) {
            exec.next_retry_at = None;
        }
        Ok(())
    }

    /// Fold scheduler decisions (escalations, sheds) into instances and the
    /// ledger.
    async fn apply_sched_events(&self) -> Result<()> {
        let events = self.scheduler.drain_events();
        if events.is_empty() {
            return Ok(());
        }
        let mut instances = self.instances.write().await;
        for event in events {
            match event {
                SchedEvent::Escalated {
                    node_id,
                    workflow_id,
                    tenant_id,
                    from,
                    to,
                } => {
                    self.ledger
                        .append(EntryDraft::node(
                            tenant_id,
                            workflow_id,
                            node_id,
                            None,
                            LedgerEventKind::PriorityEscalated,
                            json!({"from": from, "to": to}),
                        ))
                        .await?;
                    if let Some(instance) = instances.get_mut(&workflow_id) {
                        if let Some(exec) = instance.nodes.get_mut(&node_id) {
                            exec.priority = to;
                        }
                    }
                }
                SchedEvent::LoadShed {
                    node_id,
                    workflow_id,
                    tenant_id,
                    priority,
                } => {
                    self.ledger
                        .append(EntryDraft::node(
                            tenant_id,
                            workflow_id,
                            node_id,
                            None,
                            LedgerEventKind::LoadShed,
                            json!({"priority": priority}),
                        ))
                        .await?;
                    if let Some(instance) = instances.get_mut(&workflow_id) {
                        if instance.nodes.get(&node_id).map(|n| n.state)
                            == Some(Lifecycle::Scheduled)
                        {
                            self.fail_node(instance, node_id, None, FailureReason::LoadShed)
                                .await?;
                            self.sync_workflow(instance).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Drive one dequeued node through gates, execution, verification, and
    /// commit.
    async fn dispatch(&self, item: conductor_sched::QueuedNode) -> Result<()> {
        // Phase 1: claim the node under the instance lock.
        let prep = {
            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(&item.workflow_id) else {
                return Ok(());
            };
            if instance.state.is_terminal() || instance.state == Lifecycle::Compensating {
                return Ok(());
            }
            let Some(exec) = instance.nodes.get_mut(&item.node_id) else {
                return Ok(());
            };
            if exec.state != Lifecycle::Scheduled {
                return Ok(());
            }
            exec.priority = item.priority;
            let node_def = instance
                .dag
                .node(item.node_id)
                .cloned()
                .expect("queued node exists in its dag");

            // Human-approval nodes skip the executor and park for review.
            if node_def.kind == NodeKind::HumanApproval {
                self.transition_node(
                    instance,
                    item.node_id,
                    None,
                    Lifecycle::HumanReview,
                    serde_json::Value::Null,
                )
                .await?;
                let request_id = self
                    .reviews
                    .open(
                        instance.tenant_id,
                        instance.id,
                        item.node_id,
                        ReviewReason::ApprovalRequired,
                        0,
                        self.config.review_ttl_seconds,
                    )
                    .await;
                self.ledger
                    .append(EntryDraft::node(
                        instance.tenant_id,
                        instance.id,
                        item.node_id,
                        None,
                        LedgerEventKind::ReviewRequested,
                        json!({"request": request_id, "reason": "approval_required"}),
                    ))
                    .await?;
                self.sync_workflow(instance).await?;
                return Ok(());
            }

            // Policy gate, for anything above the open tier.
            if node_def.access > AccessTier::Open {
                let decision = self
                    .policy
                    .evaluate(&PolicyRequest {
                        tenant_id: instance.tenant_id,
                        workflow_id: instance.id,
                        node_id: item.node_id,
                        node_kind: node_def.kind,
                        access: node_def.access,
                        priority: item.priority,
                    })
                    .await;
                if !decision.allow {
                    self.fail_node(
                        instance,
                        item.node_id,
                        None,
                        FailureReason::PolicyDenied {
                            reason: decision.reason,
                        },
                    )
                    .await?;
                    self.sync_workflow(instance).await?;
                    return Ok(());
                }
            }

            // Budget gate.
            let budget = self
                .budget
                .admit(instance.tenant_id, node_def.cost_estimate)
                .await;
            if !budget.admit {
                self.fail_node(
                    instance,
                    item.node_id,
                    None,
                    FailureReason::BudgetExceeded {
                        reason: budget.reason,
                    },
                )
                .await?;
                self.sync_workflow(instance).await?;
                return Ok(());
            }

            let attempt = instance
                .nodes
                .get(&item.node_id)
                .expect("claimed node exists")
                .attempt_count()
                + 1;
            if let Err(e) = self
                .transition_node(
                    instance,
                    item.node_id,
                    Some(attempt),
                    Lifecycle::Executing,
                    serde_json::Value::Null,
                )
                .await
            {
                // The transition never became durable. Re-queue the node so
                // a later tick redispatches it once the ledger recovers.
                let _ = self.scheduler.enqueue(Admission {
                    node_id: item.node_id,
                    workflow_id: item.workflow_id,
                    tenant_id: item.tenant_id,
                    priority: item.priority,
                });
                return Err(e);
            }
            instance
                .nodes
                .get_mut(&item.node_id)
                .expect("claimed node exists")
                .begin_attempt(self.executor.identity());
            self.sync_workflow(instance).await?;

            let ctx = ExecutionContext {
                tenant_id: instance.tenant_id,
                workflow_id: instance.id,
                attempt,
                compensating: false,
            };
            (node_def, ctx, attempt)
        };

        // Phase 2: run the executor without holding the instance lock, so
        // status/cancel stay responsive during long calls.
        let (node_def, ctx, attempt) = prep;
        let outcome = self.run_executor(&node_def, &ctx).await;

        // Phase 3: apply the result, unless the node moved on without us.
        let mut instances = self.instances.write().await;
        let Some(instance) = instances.get_mut(&item.workflow_id) else {
            return Ok(());
        };
        let still_executing = instance.nodes.get(&item.node_id).map(|n| n.state)
            == Some(Lifecycle::Executing)
            && !instance.state.is_terminal();
        if !still_executing {
            // Cancelled or killed mid-flight; the result is discarded.
            return Ok(());
        }

        match outcome {
            RunOutcome::Output(output) => {
                self.transition_node(
                    instance,
                    item.node_id,
                    Some(attempt),
                    Lifecycle::Verifying,
                    serde_json::Value::Null,
                )
                .await?;
                let missing = node_def
                    .output_contract
                    .as_ref()
                    .map(|c| c.missing_fields(&output.content))
                    .unwrap_or_default();
                if missing.is_empty() {
                    self.commit_node(instance, item.node_id, Some(attempt), output.content)
                        .await?;
                } else {
                    instance
                        .nodes
                        .get_mut(&item.node_id)
                        .expect("claimed node exists")
                        .finish_attempt(AttemptOutcome::Failure);
                    self.fail_node(
                        instance,
                        item.node_id,
                        Some(attempt),
                        FailureReason::VerificationFailed { missing },
                    )
                    .await?;
                }
            }
            RunOutcome::Failed(failure) => {
                instance
                    .nodes
                    .get_mut(&item.node_id)
                    .expect("claimed node exists")
                    .finish_attempt(AttemptOutcome::Failure);
                self.fail_node(
                    instance,
                    item.node_id,
                    Some(attempt),
                    FailureReason::Executor {
                        message: failure.message,
                        retryable: failure.retryable,
                    },
                )
                .await?;
            }
            RunOutcome::Timeout => {
                instance
                    .nodes
                    .get_mut(&item.node_id)
                    .expect("claimed node exists")
                    .finish_attempt(AttemptOutcome::Timeout);
                self.fail_node(instance, item.node_id, Some(attempt), FailureReason::Timeout)
                    .await?;
            }
            RunOutcome::Cancelled => {
                instance
                    .nodes
                    .get_mut(&item.node_id)
                    .expect("claimed node exists")
                    .finish_attempt(AttemptOutcome::Failure);
                self.transition_node(
                    instance,
                    item.node_id,
                    Some(attempt),
                    Lifecycle::Cancelled,
                    serde_json::Value::Null,
                )
                .await?;
            }
        }
        self.sync_workflow(instance).await?;
        Ok(())
    }

    async fn run_executor(&self, node: &Node, ctx: &ExecutionContext) -> RunOutcome {
        let timeout = Duration::from_millis(node.timeout_ms);
        let deadline = Utc::now() + chrono::Duration::milliseconds(node.timeout_ms as i64);
        let mut cancel_rx = {
            let signals = self.cancel_signals.read().await;
            match signals.get(&ctx.workflow_id) {
                Some(tx) => tx.subscribe(),
                None => return RunOutcome::Cancelled,
            }
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, self.executor.execute(node, ctx, deadline)) => {
                match result {
                    Ok(Ok(output)) => RunOutcome::Output(output),
                    Ok(Err(failure)) => RunOutcome::Failed(failure),
                    Err(_) => RunOutcome::Timeout,
                }
            }
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => RunOutcome::Cancelled,
        }
    }

    /// Record a failure and route it: retry, escalate, review, or
    /// compensate.
    async fn fail_node(
        &self,
        instance: &mut WorkflowInstance,
        node_id: Uuid,
        attempt: Option<u32>,
        reason: FailureReason,
    ) -> Result<()> {
        let node_def = instance
            .dag
            .node(node_id)
            .cloned()
            .ok_or_else(|| ConductorError::not_found("Node", node_id))?;
        if let Some(exec) = instance.nodes.get_mut(&node_id) {
            exec.failure = Some(reason.clone());
        }
        self.transition_node(
            instance,
            node_id,
            attempt,
            Lifecycle::Failed,
            json!({"reason": reason}),
        )
        .await?;

        let effective = instance
            .nodes
            .get(&node_id)
            .map(|n| n.effective_attempts())
            .unwrap_or(0);

        if reason.is_retryable() && node_def.retry.allows_retry(effective) {
            let delay = node_def.retry.delay_for(effective.max(1));
            self.transition_node(
                instance,
                node_id,
                attempt,
                Lifecycle::Retrying,
                json!({"delay_ms": delay.as_millis() as u64}),
            )
            .await?;
            if let Some(exec) = instance.nodes.get_mut(&node_id) {
                exec.next_retry_at =
                    Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
            }
            return Ok(());
        }

        self.transition_node(
            instance,
            node_id,
            attempt,
            Lifecycle::Escalated,
            serde_json::Value::Null,
        )
        .await?;

        if node_def.review_on_exhaustion {
            self.transition_node(
                instance,
                node_id,
                attempt,
                Lifecycle::HumanReview,
                serde_json::Value::Null,
            )
            .await?;
            let request_id = self
                .reviews
                .open(
                    instance.tenant_id,
                    instance.id,
                    node_id,
                    ReviewReason::RetriesExhausted,
                    effective,
                    self.config.review_ttl_seconds,
                )
                .await;
            self.ledger
                .append(EntryDraft::node(
                    instance.tenant_id,
                    instance.id,
                    node_id,
                    attempt,
                    LedgerEventKind::ReviewRequested,
                    json!({"request": request_id, "reason": "retries_exhausted"}),
                ))
                .await?;
            return Ok(());
        }

        self.transition_node(
            instance,
            node_id,
            attempt,
            Lifecycle::Compensating,
            serde_json::Value::Null,
        )
        .await?;
        self.run_compensation_walk(instance).await?;
        self.set_workflow_state(
            instance,
            Lifecycle::RolledBack,
            json!({"partially_compensated": instance.partially_compensated}),
        )
        .await?;
        Ok(())
    }

    /// Walk committed nodes in strict reverse commit order, running each
    /// one's compensation. Failures are recorded and the walk continues.
    async fn run_compensation_walk(&self, instance: &mut WorkflowInstance) -> Result<()> {
        if instance.state != Lifecycle::Compensating {
            self.set_workflow_state(instance, Lifecycle::Compensating, serde_json::Value::Null)
                .await?;
        }

        // A failed node that never committed has nothing to undo; if it
        // also has no compensation defined, record it as uncompensated.
        let failed_without_comp: Vec<Uuid> = instance
            .nodes
            .values()
            .filter(|n| {
                matches!(n.state, Lifecycle::Compensating | Lifecycle::Failed)
                    && instance
                        .dag
                        .node(n.node_id)
                        .map_or(false, |d| d.compensation.is_none())
            })
            .map(|n| n.node_id)
            .collect();
        for node_id in failed_without_comp {
            self.record_uncompensated(instance, node_id).await?;
        }

        let walk: Vec<Uuid> = instance.commit_order.iter().rev().copied().collect();
        for node_id in walk {
            let node_def = instance
                .dag
                .node(node_id)
                .cloned()
                .ok_or_else(|| ConductorError::not_found("Node", node_id))?;
            match node_def.compensation {
                None => {
                    self.record_uncompensated(instance, node_id).await?;
                }
                Some(comp_id) => {
                    let comp_def = instance
                        .dag
                        .node(comp_id)
                        .cloned()
                        .ok_or_else(|| ConductorError::not_found("Node", comp_id))?;
                    let ctx = ExecutionContext {
                        tenant_id: instance.tenant_id,
                        workflow_id: instance.id,
                        attempt: 1,
                        compensating: true,
                    };
                    let deadline =
                        Utc::now() + chrono::Duration::milliseconds(comp_def.timeout_ms as i64);
                    let result = tokio::time::timeout(
                        Duration::from_millis(comp_def.timeout_ms),
                        self.executor.execute(&comp_def, &ctx, deadline),
                    )
                    .await;

                    match result {
                        Ok(Ok(_)) => {
                            self.ledger
                                .append(EntryDraft::node(
                                    instance.tenant_id,
                                    instance.id,
                                    node_id,
                                    None,
                                    LedgerEventKind::CompensationExecuted,
                                    json!({"node": node_def.name, "compensation": comp_def.name}),
                                ))
                                .await?;
                            if let Some(exec) = instance.nodes.get_mut(&node_id) {
                                exec.compensation = CompensationStatus::Executed;
                            }
                        }
                        Ok(Err(failure)) => {
                            self.record_compensation_failure(
                                instance,
                                node_id,
                                &node_def.name,
                                failure.message,
                            )
                            .await?;
                        }
                        Err(_) => {
                            self.record_compensation_failure(
                                instance,
                                node_id,
                                &node_def.name,
                                format!("compensation timed out after {}ms", comp_def.timeout_ms),
                            )
                            .await?;
                        }
                    }
                }
            }
        }

        // Anything still live is unreachable now.
        let leftovers: Vec<Uuid> = instance
            .nodes
            .values()
            .filter(|n| !n.state.is_terminal() && n.state != Lifecycle::Compensating)
            .map(|n| n.node_id)
            .collect();
        for node_id in leftovers {
            self.scheduler.cancel(node_id);
            self.transition_node(
                instance,
                node_id,
                None,
                Lifecycle::Cancelled,
                serde_json::Value::Null,
            )
            .await?;
        }
        let compensating: Vec<Uuid> = instance
            .nodes
            .values()
            .filter(|n| n.state == Lifecycle::Compensating)
            .map(|n| n.node_id)
            .collect();
        for node_id in compensating {
            self.transition_node(
                instance,
                node_id,
                None,
                Lifecycle::RolledBack,
                serde_json::Value::Null,
            )
            .await?;
        }
        Ok(())
    }

    async fn record_uncompensated(
        &self,
        instance: &mut WorkflowInstance,
        node_id: Uuid,
    ) -> Result<()> {
        let name = instance
            .dag
            .node(node_id)
            .map(|n| n.name.clone())
            .unwrap_or_default();
        self.ledger
            .append(EntryDraft::node(
                instance.tenant_id,
                instance.id,
                node_id,
                None,
                LedgerEventKind::CompensationSkipped,
                json!({"node": name}),
            ))
            .await?;
        if let Some(exec) = instance.nodes.get_mut(&node_id) {
            exec.compensation = CompensationStatus::Skipped;
        }
        Ok(())
    }

    async fn record_compensation_failure(
        &self,
        instance: &mut WorkflowInstance,
        node_id: Uuid,
        name: &str,
        message: String,
    ) -> Result<()> {
        warn!(node = %node_id, %message, "compensation failed");
        self.ledger
            .append(EntryDraft::node(
                instance.tenant_id,
                instance.id,
                node_id,
                None,
                LedgerEventKind::CompensationFailed,
                json!({"node": name, "message": message}),
            ))
            .await?;
        if let Some(exec) = instance.nodes.get_mut(&node_id) {
            exec.compensation = CompensationStatus::Failed { message };
        }
        instance.partially_compensated = true;
        Ok(())
    }

    /// Commit a node: output becomes visible, dependents become ready.
    async fn commit_node(
        &self,
        instance: &mut WorkflowInstance,
        node_id: Uuid,
        attempt: Option<u32>,
        output: serde_json::Value,
    ) -> Result<()> {
        self.transition_node(
            instance,
            node_id,
            attempt,
            Lifecycle::Committed,
            json!({"output": output}),
        )
        .await?;
        let exec = instance
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| ConductorError::not_found("Node", node_id))?;
        exec.output = Some(output);
        exec.finish_attempt(AttemptOutcome::Success);
        instance.commit_order.push(node_id);

        // Newly ready dependents are admitted immediately rather than on
        // the next tick.
        self.admit_ready_for(instance).await?;
        Ok(())
    }

    /// Append a node transition to the ledger, then apply it in memory.
    async fn transition_node(
        &self,
        instance: &mut WorkflowInstance,
        node_id: Uuid,
        attempt: Option<u32>,
        to: Lifecycle,
        detail: serde_json::Value,
    ) -> Result<()> {
        let from = instance
            .nodes
            .get(&node_id)
            .ok_or_else(|| ConductorError::not_found("Node", node_id))?
            .state;
        if !from.can_transition(to) {
            return Err(ConductorError::IllegalTransition {
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            });
        }
        let name = instance
            .dag
            .node(node_id)
            .map(|n| n.name.clone())
            .unwrap_or_default();
        let mut payload = json!({"node": name, "from": from, "to": to});
        if !detail.is_null() {
            payload["detail"] = detail;
        }
        self.ledger
            .append(EntryDraft::node(
                instance.tenant_id,
                instance.id,
                node_id,
                attempt,
                LedgerEventKind::NodeStateChanged,
                payload,
            ))
            .await?;
        instance
            .nodes
            .get_mut(&node_id)
            .expect("checked above")
            .state = to;
        instance.updated_at = Utc::now();
        Ok(())
    }

    /// Explicit workflow-level transition, ledger first.
    async fn set_workflow_state(
        &self,
        instance: &mut WorkflowInstance,
        to: Lifecycle,
        detail: serde_json::Value,
    ) -> Result<()> {
        if instance.state == to {
            return Ok(());
        }
        let mut payload = json!({"from": instance.state, "to": to});
        if !detail.is_null() {
            payload["detail"] = detail;
        }
        self.ledger
            .append(EntryDraft::workflow(
                instance.tenant_id,
                instance.id,
                LedgerEventKind::WorkflowStateChanged,
                payload,
            ))
            .await?;
        instance.state = to;
        instance.updated_at = Utc::now();
        Ok(())
    }

    /// Re-derive the workflow state from node states and record a change.
    async fn sync_workflow(&self, instance: &mut WorkflowInstance) -> Result<()> {
        let derived = instance.derive_state();
        if derived != instance.state {
            self.set_workflow_state(instance, derived, serde_json::Value::Null)
                .await?;
        }
        Ok(())
    }
}
