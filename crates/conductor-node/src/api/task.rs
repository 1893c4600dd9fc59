//! Task (node-level) endpoints.
//!
//! A task is one DAG node's execution within its workflow.

use axum::{
    extract::{Path, State},
    Json,
};
use axum::http::StatusCode;
use serde::Serialize;
use uuid::Uuid;

use conductor_core::{Lifecycle, NodeStatus};

use crate::api::error_response;
use crate::state::AppState;

/// Node status plus the workflow it belongs to.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub workflow_id: Uuid,
    pub workflow_state: Lifecycle,
    pub node: NodeStatus,
}

/// Get one node's status snapshot.
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskResponse>, (StatusCode, String)> {
    let (workflow, node) = state
        .coordinator
        .node_status(id)
        .await
        .map_err(error_response)?;
    Ok(Json(TaskResponse {
        workflow_id: workflow.workflow_id,
        workflow_state: workflow.state,
        node,
    }))
}

/// Cancel one node. Queued nodes are removed without penalty; an executing
/// node's result is discarded when it arrives.
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .coordinator
        .cancel_node(id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}
