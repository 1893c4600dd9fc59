//! HTTP API handlers.

pub mod health;
pub mod ledger;
pub mod review;
pub mod task;
pub mod tenant;
pub mod workflow;

use axum::http::StatusCode;
use conductor_core::ConductorError;

/// Map engine errors onto HTTP status codes.
pub(crate) fn error_response(err: ConductorError) -> (StatusCode, String) {
    let status = match &err {
        ConductorError::Validation { .. } => StatusCode::BAD_REQUEST,
        ConductorError::NotFound { .. } => StatusCode::NOT_FOUND,
        ConductorError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        ConductorError::PolicyDenied { .. } => StatusCode::FORBIDDEN,
        ConductorError::BudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
        ConductorError::IllegalTransition { .. } => StatusCode::CONFLICT,
        ConductorError::LedgerWriteFailure { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}
