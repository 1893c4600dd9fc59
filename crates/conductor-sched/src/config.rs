//! Scheduler configuration.

use std::time::Duration;

use conductor_core::Priority;

/// Configuration for the DAG scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Fairness weight assigned to tenants not explicitly registered.
    pub default_weight: u32,

    /// Backpressure depth for tenants not explicitly registered.
    pub default_queue_limit: usize,

    /// Total queued-node ceiling across all tenants; above this, sustained
    /// overload triggers load shedding.
    pub shed_ceiling: usize,

    /// How long the ceiling must be exceeded before shedding starts.
    pub shed_sustain: Duration,

    /// Wait threshold after which a P1 item is escalated to P0.
    pub p1_sla: Duration,

    /// Wait threshold after which a P2 item is escalated to P1.
    pub p2_sla: Duration,

    /// Wait threshold after which a P3 item is escalated to P2.
    pub p3_sla: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_weight: 1,
            default_queue_limit: 256,
            shed_ceiling: 10_000,
            shed_sustain: Duration::from_secs(5),
            p1_sla: Duration::from_secs(5),
            p2_sla: Duration::from_secs(15),
            p3_sla: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Starvation SLA for a class; `None` for P0, which never escalates.
    pub fn sla_for(&self, priority: Priority) -> Option<Duration> {
        match priority {
            Priority::P0 => None,
            Priority::P1 => Some(self.p1_sla),
            Priority::P2 => Some(self.p2_sla),
            Priority::P3 => Some(self.p3_sla),
        }
    }
}
