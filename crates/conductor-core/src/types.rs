//! Common types shared by the scheduler, coordinator, and ledger.

use serde::{Deserialize, Serialize};

/// Priority class of a node. `P0` is strictly highest.
///
/// Within a tenant's scheduling turn, `P0` always dispatches before `P1`,
/// `P1` before `P2`, and so on. The derived ordering makes `P0` the minimum,
/// so "higher priority" compares as `<`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Interactive / latency-critical. Never load-shed.
    P0,
    /// High.
    P1,
    /// Normal (default).
    #[default]
    P2,
    /// Background / best-effort.
    P3,
}

impl Priority {
    /// All classes in dispatch order.
    pub const ALL: [Priority; 4] = [Priority::P0, Priority::P1, Priority::P2, Priority::P3];

    /// Index into per-class structures (0 = P0).
    pub fn index(self) -> usize {
        match self {
            Priority::P0 => 0,
            Priority::P1 => 1,
            Priority::P2 => 2,
            Priority::P3 => 3,
        }
    }

    /// One class up, for starvation escalation. `None` at the top.
    pub fn escalate(self) -> Option<Priority> {
        match self {
            Priority::P0 => None,
            Priority::P1 => Some(Priority::P0),
            Priority::P2 => Some(Priority::P1),
            Priority::P3 => Some(Priority::P2),
        }
    }
}

/// Lifecycle state, shared by workflow instances and individual nodes.
///
/// The happy path is `Pending → Scheduled → Executing → Verifying →
/// Committed`. Failures branch into `Failed → Retrying` (bounded) →
/// `Escalated → HumanReview → Compensating → RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Created, not yet submitted to the scheduler.
    #[default]
    Pending,
    /// Admitted to a scheduler queue.
    Scheduled,
    /// Dispatched to the task executor.
    Executing,
    /// Executor returned; output under verification, not yet committed.
    Verifying,
    /// Terminal success; output visible to dependents.
    Committed,
    /// Executor error, timeout, or verification failure.
    Failed,
    /// Waiting out a backoff delay before the next attempt.
    Retrying,
    /// Retries exhausted.
    Escalated,
    /// Suspended pending an operator decision.
    HumanReview,
    /// Rollback walk in progress.
    Compensating,
    /// Terminal failure after compensation.
    RolledBack,
    /// Cancelled before reaching a terminal state.
    Cancelled,
    /// Never ran; an upstream failure or condition made it unreachable.
    Skipped,
}

impl Lifecycle {
    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Lifecycle::Committed
                | Lifecycle::RolledBack
                | Lifecycle::Cancelled
                | Lifecycle::Skipped
        )
    }

    /// Whether `self → to` is a legal transition.
    ///
    /// Any non-terminal state may move to `Failed` or `Cancelled`; the
    /// remaining edges follow the saga state machine exactly.
    pub fn can_transition(&self, to: Lifecycle) -> bool {
        use Lifecycle::*;
        if self.is_terminal() {
            return false;
        }
        if to == Failed || to == Cancelled {
            return true;
        }
        matches!(
            (self, to),
            (Pending, Scheduled)
                | (Pending, Skipped)
                | (Scheduled, Executing)
                | (Scheduled, HumanReview)
                | (Executing, Verifying)
                | (Verifying, Committed)
                | (Failed, Retrying)
                | (Failed, Escalated)
                | (Failed, Compensating)
                | (Retrying, Scheduled)
                | (Retrying, Executing)
                | (Escalated, HumanReview)
                | (Escalated, Compensating)
                | (HumanReview, Retrying)
                | (HumanReview, Compensating)
                | (HumanReview, Committed)
                | (Compensating, RolledBack)
        )
    }
}

/// Why a node (or workflow) failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    /// The policy gate returned DENY.
    PolicyDenied { reason: String },
    /// The budget gate refused admission or killed the tenant's work.
    BudgetExceeded { reason: String },
    /// The task executor reported an error.
    Executor { message: String, retryable: bool },
    /// The node's deadline elapsed before the executor returned.
    Timeout,
    /// Output failed schema/postcondition verification.
    VerificationFailed { missing: Vec<String> },
    /// Dropped by the scheduler under sustained overload.
    LoadShed,
    /// The workflow was cancelled while this node was in flight.
    Cancelled,
    /// An operator rejected the node in human review.
    ReviewRejected { reason: String },
}

impl FailureReason {
    /// Whether the coordinator's retry logic applies to this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureReason::Executor { retryable, .. } => *retryable,
            FailureReason::Timeout
            | FailureReason::VerificationFailed { .. }
            | FailureReason::LoadShed => true,
            FailureReason::PolicyDenied { .. }
            | FailureReason::BudgetExceeded { .. }
            | FailureReason::Cancelled
            | FailureReason::ReviewRejected { .. } => false,
        }
    }
}

/// Compensation status of a committed node after a rollback walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompensationStatus {
    /// No rollback has touched this node.
    #[default]
    NotRun,
    /// Its compensation node executed successfully.
    Executed,
    /// Its compensation node ran and failed; the walk continued.
    Failed { message: String },
    /// Committed without a compensation node; recorded as uncompensated.
    Skipped,
}

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
}
