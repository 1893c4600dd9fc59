//! # Conductor Scheduler
//!
//! Multi-tenant scheduling for ready DAG nodes: weighted round-robin across
//! tenants, strict priority classes within a tenant, FIFO tie-breaks,
//! backpressure, starvation escalation, and sustained-overload shedding.

pub mod config;
pub mod queue;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use queue::QueuedNode;
pub use scheduler::{Admission, DagScheduler, SchedEvent};
