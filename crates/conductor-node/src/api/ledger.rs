//! Ledger endpoints: audit, verification, replay, simulation, diff.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use conductor_ledger::{
    diff, replay_entries, simulate, ChainStatus, Divergence, EntryDraft, Hypothetical,
    LedgerEntry, LedgerEventKind, ReplayedWorkflow,
};

use crate::api::error_response;
use crate::api::workflow::DagInput;
use crate::state::AppState;

/// Locate a workflow's entries, searching every shard when the tenant is
/// not given. Per-tenant sharding means a global lookup is a scan; callers
/// that know the tenant should say so.
async fn find_workflow_entries(
    state: &AppState,
    tenant_id: Option<Uuid>,
    workflow_id: Uuid,
) -> Result<Vec<LedgerEntry>, (StatusCode, String)> {
    let shards = match tenant_id {
        Some(t) => vec![t],
        None => state.ledger.tenants().await,
    };
    for shard in shards {
        let entries = state.ledger.workflow_entries(shard, workflow_id).await;
        if !entries.is_empty() {
            return Ok(entries);
        }
    }
    Err((
        StatusCode::NOT_FOUND,
        format!("not found: Workflow with id {workflow_id}"),
    ))
}

#[derive(Debug, Deserialize)]
pub struct EntriesQuery {
    pub tenant_id: Uuid,
    pub from: Option<u64>,
    pub to: Option<u64>,
}

/// List a tenant shard's entries, optionally restricted to a sequence range.
pub async fn list_entries(
    State(state): State<AppState>,
    Query(query): Query<EntriesQuery>,
) -> Json<Vec<LedgerEntry>> {
    let range = match (query.from, query.to) {
        (Some(from), Some(to)) => Some((from, to)),
        _ => None,
    };
    Json(state.ledger.entries(query.tenant_id, range).await)
}

/// Request to append an operator annotation.
#[derive(Debug, Deserialize)]
pub struct AnnotateRequest {
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub note: String,
}

/// Append a free-form annotation entry to a workflow's history.
pub async fn append_annotation(
    State(state): State<AppState>,
    Json(req): Json<AnnotateRequest>,
) -> Result<(StatusCode, Json<LedgerEntry>), (StatusCode, String)> {
    let entry = state
        .ledger
        .append(EntryDraft::workflow(
            req.tenant_id,
            req.workflow_id,
            LedgerEventKind::Annotation,
            json!({"note": req.note}),
        ))
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    /// Verify one tenant's shard; omit to audit every shard.
    pub tenant_id: Option<Uuid>,
    pub from: Option<u64>,
    pub to: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct VerifyReport {
    pub tenant_id: Uuid,
    #[serde(flatten)]
    pub status: ChainStatus,
}

/// Recompute hash chains and signatures over a range of entries.
///
/// Shards verify independently; the all-shard form is the cross-tenant
/// audit pass. No ordering across shards is implied by the report order.
pub async fn verify(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> Json<Vec<VerifyReport>> {
    let range = match (req.from, req.to) {
        (Some(from), Some(to)) => Some((from, to)),
        _ => None,
    };
    let reports = match req.tenant_id {
        Some(tenant_id) => vec![VerifyReport {
            tenant_id,
            status: state.ledger.verify(tenant_id, range).await,
        }],
        None => state
            .ledger
            .verify_all()
            .await
            .into_iter()
            .map(|(tenant_id, status)| VerifyReport { tenant_id, status })
            .collect(),
    };
    Json(reports)
}

#[derive(Debug, Deserialize)]
pub struct ReplayRequest {
    pub tenant_id: Option<Uuid>,
    pub workflow_id: Uuid,
}

/// Reconstruct a workflow's transition history from its ledger entries.
pub async fn replay(
    State(state): State<AppState>,
    Json(req): Json<ReplayRequest>,
) -> Result<Json<ReplayedWorkflow>, (StatusCode, String)> {
    let entries = find_workflow_entries(&state, req.tenant_id, req.workflow_id).await?;
    Ok(Json(replay_entries(req.workflow_id, &entries)))
}

#[derive(Debug, Deserialize)]
pub struct SimulateRequest {
    pub dag: DagInput,

    /// Names of nodes that hypothetically fail every attempt.
    #[serde(default)]
    pub failing: Vec<String>,
}

/// Response from simulation: the would-be trace, nothing appended.
#[derive(Debug, Serialize)]
pub struct SimulateResponse {
    pub simulation_id: Uuid,
    pub trace: conductor_ledger::SimulatedTrace,
}

/// Run the state machine over a DAG without executing or appending.
pub async fn simulate_dag(
    State(_state): State<AppState>,
    Json(req): Json<SimulateRequest>,
) -> Result<Json<SimulateResponse>, (StatusCode, String)> {
    let dag = req
        .dag
        .into_dag()
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    let failing: Vec<Uuid> = dag
        .nodes
        .iter()
        .filter(|n| req.failing.iter().any(|name| name == &n.name))
        .map(|n| n.id)
        .collect();
    let trace =
        simulate(&dag, &Hypothetical::failing(failing)).map_err(error_response)?;
    Ok(Json(SimulateResponse {
        simulation_id: Uuid::new_v4(),
        trace,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    pub tenant_a: Option<Uuid>,
    pub tenant_b: Option<Uuid>,
}

/// Structurally compare two workflows' replayed transition traces.
pub async fn diff_traces(
    State(state): State<AppState>,
    Path((a, b)): Path<(Uuid, Uuid)>,
    Query(query): Query<DiffQuery>,
) -> Result<Json<Vec<Divergence>>, (StatusCode, String)> {
    let left = find_workflow_entries(&state, query.tenant_a, a).await?;
    let right = find_workflow_entries(&state, query.tenant_b, b).await?;
    let left = replay_entries(a, &left);
    let right = replay_entries(b, &right);
    Ok(Json(diff(&left.transitions, &right.transitions)))
}
