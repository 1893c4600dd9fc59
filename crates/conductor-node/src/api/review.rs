//! Human-review endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use conductor_review::{ReviewDecision, ReviewRequest};

use crate::api::error_response;
use crate::state::AppState;

/// List open review requests awaiting an operator.
pub async fn list_reviews(State(state): State<AppState>) -> Json<Vec<ReviewRequest>> {
    Json(state.coordinator.reviews().open_requests().await)
}

/// Get one review request.
pub async fn get_review(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReviewRequest>, (StatusCode, String)> {
    let request = state
        .coordinator
        .reviews()
        .get(id)
        .await
        .map_err(error_response)?;
    Ok(Json(request))
}

/// Apply an operator decision to an open request.
pub async fn resolve_review(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(decision): Json<ReviewDecision>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .coordinator
        .resolve_review(id, decision)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}
