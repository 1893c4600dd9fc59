//! Workflow and intent endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use conductor_core::{
    AccessTier, Dag, Node, NodeKind, OutputContract, Priority, RetryPolicy, WorkflowStatus,
};

use crate::api::error_response;
use crate::state::AppState;

/// Wire shape of a submitted DAG: nodes are declared by name and edges and
/// compensations reference those names. Ids are assigned server-side.
#[derive(Debug, Deserialize)]
pub struct DagInput {
    pub nodes: Vec<NodeInput>,

    #[serde(default)]
    pub edges: Vec<EdgeInput>,
}

#[derive(Debug, Deserialize)]
pub struct EdgeInput {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Deserialize)]
pub struct NodeInput {
    pub name: String,
    pub kind: NodeKind,

    #[serde(default)]
    pub params: serde_json::Value,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub idempotent: bool,

    /// Per-attempt deadline; defaults to the engine's standard timeout.
    pub timeout_ms: Option<u64>,

    pub retry: Option<RetryPolicy>,

    /// Name of this node's compensation node, if any.
    pub compensation: Option<String>,

    pub output_contract: Option<OutputContract>,

    #[serde(default)]
    pub review_on_exhaustion: bool,

    #[serde(default)]
    pub access: AccessTier,

    #[serde(default)]
    pub cost_estimate: f64,
}

impl DagInput {
    /// Resolve name references into a domain [`Dag`].
    ///
    /// Structural validation (cycles, dangling compensations) happens at
    /// submission; this only resolves names.
    pub fn into_dag(self) -> Result<Dag, String> {
        let mut dag = Dag::new();
        let mut ids: HashMap<String, Uuid> = HashMap::new();

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for input in self.nodes {
            let mut node = Node::new(&input.name, input.kind)
                .with_params(input.params)
                .with_priority(input.priority)
                .with_access(input.access)
                .with_cost(input.cost_estimate);
            if input.idempotent {
                node = node.idempotent();
            }
            if input.review_on_exhaustion {
                node = node.review_on_exhaustion();
            }
            if let Some(timeout_ms) = input.timeout_ms {
                node = node.with_timeout_ms(timeout_ms);
            }
            if let Some(retry) = input.retry {
                node = node.with_retry(retry);
            }
            if let Some(contract) = input.output_contract {
                node = node.with_output_contract(contract);
            }
            if ids.insert(input.name.clone(), node.id).is_some() {
                return Err(format!("duplicate node name: {}", input.name));
            }
            nodes.push((node, input.compensation));
        }

        for (mut node, compensation) in nodes {
            if let Some(comp_name) = compensation {
                let comp_id = ids
                    .get(&comp_name)
                    .copied()
                    .ok_or_else(|| format!("unknown compensation node: {comp_name}"))?;
                node = node.with_compensation(comp_id);
            }
            dag.add_node(node);
        }

        for edge in self.edges {
            let from = ids
                .get(&edge.from)
                .copied()
                .ok_or_else(|| format!("unknown edge endpoint: {}", edge.from))?;
            let to = ids
                .get(&edge.to)
                .copied()
                .ok_or_else(|| format!("unknown edge endpoint: {}", edge.to))?;
            dag.add_edge(from, to);
        }
        Ok(dag)
    }
}

/// Request to create a workflow from an intent-derived DAG.
#[derive(Debug, Deserialize)]
pub struct SubmitWorkflowRequest {
    /// Opaque id of the parsed intent this DAG came from.
    pub intent_id: Option<Uuid>,

    pub tenant_id: Uuid,

    pub dag: DagInput,
}

/// Response after creating a workflow instance.
#[derive(Debug, Serialize)]
pub struct SubmitWorkflowResponse {
    pub workflow_id: Uuid,
    pub status: String,
}

/// Create a workflow from an intent submission.
pub async fn submit_intent(
    State(state): State<AppState>,
    Json(req): Json<SubmitWorkflowRequest>,
) -> Result<(StatusCode, Json<SubmitWorkflowResponse>), (StatusCode, String)> {
    submit(state, req).await
}

/// Create a workflow directly from a DAG.
pub async fn submit_workflow(
    State(state): State<AppState>,
    Json(req): Json<SubmitWorkflowRequest>,
) -> Result<(StatusCode, Json<SubmitWorkflowResponse>), (StatusCode, String)> {
    submit(state, req).await
}

async fn submit(
    state: AppState,
    req: SubmitWorkflowRequest,
) -> Result<(StatusCode, Json<SubmitWorkflowResponse>), (StatusCode, String)> {
    let tenant = state.tenants.get(req.tenant_id).map_err(error_response)?;
    let dag = req
        .dag
        .into_dag()
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    let workflow_id = state
        .coordinator
        .submit(dag, &tenant, req.intent_id)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitWorkflowResponse {
            workflow_id,
            status: "pending".to_string(),
        }),
    ))
}

/// Get a workflow's status snapshot.
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowStatus>, (StatusCode, String)> {
    let status = state.coordinator.status(id).await.map_err(error_response)?;
    Ok(Json(status))
}

/// List all known workflows.
pub async fn list_workflows(State(state): State<AppState>) -> Json<Vec<WorkflowStatus>> {
    Json(state.coordinator.list().await)
}

/// Kick a workflow: admit its ready frontier and pump the dispatch loop
/// once. The background engine does this continuously; the endpoint exists
/// for callers that want synchronous progress.
pub async fn run_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowStatus>, (StatusCode, String)> {
    let status = state.coordinator.status(id).await.map_err(error_response)?;
    if status.state.is_terminal() {
        return Ok(Json(status));
    }
    state.coordinator.resume(id).await.map_err(error_response)?;
    state.coordinator.tick().await.map_err(error_response)?;
    let status = state.coordinator.status(id).await.map_err(error_response)?;
    Ok(Json(status))
}

/// Cancel a workflow per the cooperative cancellation contract.
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowStatus>, (StatusCode, String)> {
    state.coordinator.cancel(id).await.map_err(error_response)?;
    let status = state.coordinator.status(id).await.map_err(error_response)?;
    Ok(Json(status))
}

/// Resume a suspended workflow from its last committed frontier.
pub async fn resume_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowStatus>, (StatusCode, String)> {
    state.coordinator.resume(id).await.map_err(error_response)?;
    let status = state.coordinator.status(id).await.map_err(error_response)?;
    Ok(Json(status))
}
