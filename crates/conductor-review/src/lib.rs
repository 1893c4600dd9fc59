//! # Conductor Review
//!
//! Human-in-the-loop decision queue. Nodes land here when their retries
//! exhaust (if marked for review) or when a human-approval node reaches the
//! front of its workflow; operators resolve requests with retry, approve,
//! reject, or compensate decisions.

pub mod queue;

pub use queue::{ReviewDecision, ReviewQueue, ReviewReason, ReviewRequest, ReviewState};
