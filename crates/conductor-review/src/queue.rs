//! Review request queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use conductor_core::{ConductorError, Result};

/// State of a review request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    /// Waiting for an operator decision.
    Open,
    /// An operator resolved it.
    Resolved,
    /// The decision deadline passed with no resolution.
    Expired,
}

/// Why a node entered human review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    /// Retries exhausted on a node marked for review on exhaustion.
    RetriesExhausted,
    /// A human-approval node reached the front of its workflow.
    ApprovalRequired,
}

/// The operator's decision on an open request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Grant the failed node a fresh retry cycle.
    RetryApproved,
    /// Give up on the workflow and start the compensation walk.
    Compensate,
    /// Approve a human-approval node; it commits.
    ApproveNode,
    /// Reject a human-approval node; it fails.
    RejectNode { reason: String },
}

/// A pending request for an operator decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: Uuid,
    pub reason: ReviewReason,
    /// Attempts consumed before the request was opened.
    pub attempts_used: u32,
    pub state: ReviewState,
    pub decision: Option<ReviewDecision>,
    pub requested_at: DateTime<Utc>,
    /// After this instant the request expires and is treated as rejected.
    pub expires_at: DateTime<Utc>,
}

impl ReviewRequest {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Queue of review requests, shared between the coordinator and the API.
#[derive(Debug, Clone, Default)]
pub struct ReviewQueue {
    requests: Arc<RwLock<HashMap<Uuid, ReviewRequest>>>,
}

impl ReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a request; returns its id.
    pub async fn open(
        &self,
        tenant_id: Uuid,
        workflow_id: Uuid,
        node_id: Uuid,
        reason: ReviewReason,
        attempts_used: u32,
        ttl_seconds: i64,
    ) -> Uuid {
        let request = ReviewRequest {
            id: Uuid::new_v4(),
            tenant_id,
            workflow_id,
            node_id,
            reason,
            attempts_used,
            state: ReviewState::Open,
            decision: None,
            requested_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_seconds),
        };
        let id = request.id;
        tracing::info!(request = %id, workflow = %workflow_id, node = %node_id, "review requested");
        self.requests.write().await.insert(id, request);
        id
    }

    /// Fetch a request by id.
    pub async fn get(&self, id: Uuid) -> Result<ReviewRequest> {
        self.requests
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ConductorError::not_found("ReviewRequest", id))
    }

    /// The open request for a workflow, if one exists.
    pub async fn open_for_workflow(&self, workflow_id: Uuid) -> Option<ReviewRequest> {
        self.requests
            .read()
            .await
            .values()
            .find(|r| r.workflow_id == workflow_id && r.state == ReviewState::Open)
            .cloned()
    }

    /// All open requests.
    pub async fn open_requests(&self) -> Vec<ReviewRequest> {
        self.requests
            .read()
            .await
            .values()
            .filter(|r| r.state == ReviewState::Open)
            .cloned()
            .collect()
    }

    /// Record an operator decision.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown requests and `Internal` when the
    /// request is no longer open.
    pub async fn resolve(&self, id: Uuid, decision: ReviewDecision) -> Result<ReviewRequest> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&id)
            .ok_or_else(|| ConductorError::not_found("ReviewRequest", id))?;
        if request.state != ReviewState::Open {
            return Err(ConductorError::Internal(format!(
                "review request {id} is not open"
            )));
        }
        if request.is_expired() {
            request.state = ReviewState::Expired;
            return Err(ConductorError::Internal(format!(
                "review request {id} expired before resolution"
            )));
        }
        request.state = ReviewState::Resolved;
        request.decision = Some(decision);
        tracing::info!(request = %id, decision = ?request.decision, "review resolved");
        Ok(request.clone())
    }

    /// Mark overdue open requests expired; returns the newly expired set.
    pub async fn sweep_expired(&self) -> Vec<ReviewRequest> {
        let mut requests = self.requests.write().await;
        let mut expired = Vec::new();
        for request in requests.values_mut() {
            if request.state == ReviewState::Open && request.is_expired() {
                request.state = ReviewState::Expired;
                expired.push(request.clone());
            }
        }
        expired
    }
}
