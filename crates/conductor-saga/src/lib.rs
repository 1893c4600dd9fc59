//! # Conductor Saga
//!
//! The workflow coordinator: lifecycle state machine, gate-checked
//! dispatch, bounded retries with jittered backoff, human-review hand-off,
//! and reverse-order compensation walks. Every transition is ledgered
//! before it takes effect.

pub mod coordinator;

pub use coordinator::{CoordinatorConfig, SagaCoordinator, TickReport};
