//! Tenant endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conductor_core::{Tenant, TenantTier};

use crate::api::error_response;
use crate::state::AppState;

/// Request to register a tenant.
#[derive(Debug, Deserialize)]
pub struct RegisterTenantRequest {
    pub name: String,

    #[serde(default)]
    pub tier: TenantTier,

    /// Override the tier's default fairness weight.
    pub weight: Option<u32>,

    /// Override the tier's default backpressure depth.
    pub queue_limit: Option<usize>,
}

/// Register a tenant and give it a scheduler share.
pub async fn register_tenant(
    State(state): State<AppState>,
    Json(req): Json<RegisterTenantRequest>,
) -> (StatusCode, Json<Tenant>) {
    let mut tenant = Tenant::new(req.name, req.tier);
    if let Some(weight) = req.weight {
        tenant = tenant.with_weight(weight);
    }
    if let Some(limit) = req.queue_limit {
        tenant = tenant.with_queue_limit(limit);
    }
    state
        .scheduler
        .register_tenant(tenant.id, tenant.weight, tenant.queue_limit);
    state.tenants.register(tenant.clone());
    (StatusCode::CREATED, Json(tenant))
}

/// List registered tenants.
pub async fn list_tenants(State(state): State<AppState>) -> Json<Vec<Tenant>> {
    Json(state.tenants.list())
}

/// Response to a budget kill.
#[derive(Debug, Serialize)]
pub struct KillResponse {
    pub tenant_id: Uuid,
    pub nodes_killed: u32,
}

/// Budget kill switch: fail every executing node of a tenant.
pub async fn kill_tenant(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<KillResponse>, (StatusCode, String)> {
    state.tenants.get(id).map_err(error_response)?;
    let nodes_killed = state
        .coordinator
        .kill_tenant(id)
        .await
        .map_err(error_response)?;
    Ok(Json(KillResponse {
        tenant_id: id,
        nodes_killed,
    }))
}
