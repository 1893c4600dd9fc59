//! Error types for the Conductor engine.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for Conductor operations.
#[derive(Error, Debug, Clone)]
pub enum ConductorError {
    /// DAG validation failed at submission; no workflow instance is created.
    #[error("DAG validation failed: {message}")]
    Validation { message: String },

    /// The policy gate refused to authorize a node.
    #[error("policy denied for node {node_id}: {reason}")]
    PolicyDenied { node_id: Uuid, reason: String },

    /// The budget gate refused admission or fired its kill switch.
    #[error("budget exceeded for tenant {tenant_id}: {reason}")]
    BudgetExceeded { tenant_id: Uuid, reason: String },

    /// The task executor reported a failure.
    #[error("executor failed at node {node_id}: {message}")]
    Executor {
        node_id: Uuid,
        message: String,
        retryable: bool,
    },

    /// A node exceeded its configured timeout.
    #[error("node {node_id} timed out after {timeout_ms}ms")]
    Timeout { node_id: Uuid, timeout_ms: u64 },

    /// A compensation action failed; recorded, non-fatal to the rollback walk.
    #[error("compensation failed for node {node_id}: {message}")]
    CompensationFailure { node_id: Uuid, message: String },

    /// The ledger refused an append; workflow progress halts until resolved.
    #[error("ledger write failed: {message}")]
    LedgerWriteFailure { message: String },

    /// Chain verification found a broken entry; the affected range is untrusted.
    #[error("ledger corruption detected at sequence {sequence}: {reason}")]
    CorruptionDetected { sequence: u64, reason: String },

    /// An illegal lifecycle transition was attempted.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    /// The tenant's queue is at its configured depth limit.
    #[error("capacity exceeded for tenant {tenant_id}: depth {depth} at limit {limit}")]
    CapacityExceeded {
        tenant_id: Uuid,
        depth: usize,
        limit: usize,
    },

    /// Resource not found.
    #[error("not found: {resource} with id {id}")]
    NotFound { resource: &'static str, id: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed.
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl ConductorError {
    /// Returns true if the coordinator may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConductorError::Executor { retryable, .. } => *retryable,
            ConductorError::Timeout { .. } => true,
            // Policy and budget denials are standing decisions, not faults.
            ConductorError::PolicyDenied { .. } | ConductorError::BudgetExceeded { .. } => false,
            _ => false,
        }
    }

    /// Convenience constructor for missing resources.
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        ConductorError::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Convenience constructor for validation failures.
    pub fn validation(message: impl Into<String>) -> Self {
        ConductorError::Validation {
            message: message.into(),
        }
    }
}

/// Convenience Result type for Conductor operations.
pub type Result<T> = std::result::Result<T, ConductorError>;

impl From<serde_json::Error> for ConductorError {
    fn from(err: serde_json::Error) -> Self {
        ConductorError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_error_retryable_flag() {
        let err = ConductorError::Executor {
            node_id: Uuid::new_v4(),
            message: "connection reset".to_string(),
            retryable: true,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = ConductorError::Timeout {
            node_id: Uuid::new_v4(),
            timeout_ms: 5_000,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_policy_denied_is_not_retryable() {
        let err = ConductorError::PolicyDenied {
            node_id: Uuid::new_v4(),
            reason: "restricted tier".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_found_message() {
        let err = ConductorError::not_found("Workflow", "abc");
        assert!(err.to_string().contains("abc"));
    }
}
