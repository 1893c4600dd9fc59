//! The multi-tenant DAG scheduler.
//!
//! Selection is deterministic: tenants rotate in stable id order, each
//! non-empty tenant's turn lasts `weight` dequeues, classes are strictly
//! ordered within a turn, and ties within a class break by insertion
//! sequence. Empty tenants contribute no turns.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, warn};
use uuid::Uuid;

use conductor_core::{ConductorError, Priority, Result};

use crate::config::SchedulerConfig;
use crate::queue::{QueuedNode, TenantQueue};

/// Admission request for one ready node.
#[derive(Debug, Clone)]
pub struct Admission {
    pub node_id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: Uuid,
    pub priority: Priority,
}

/// Scheduling decisions the coordinator records in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedEvent {
    /// Starvation escalation promoted a queued node one class.
    Escalated {
        node_id: Uuid,
        workflow_id: Uuid,
        tenant_id: Uuid,
        from: Priority,
        to: Priority,
    },
    /// Sustained overload dropped a queued node.
    LoadShed {
        node_id: Uuid,
        workflow_id: Uuid,
        tenant_id: Uuid,
        priority: Priority,
    },
}

#[derive(Debug)]
struct Inner {
    tenants: BTreeMap<Uuid, TenantQueue>,
    /// Tenant currently being served.
    cursor: Option<Uuid>,
    /// Dequeues left in the current tenant's turn.
    turn_left: u32,
    next_seq: u64,
    overload_since: Option<Instant>,
    events: Vec<SchedEvent>,
}

/// Decides which ready node a free execution slot is given to next.
#[derive(Debug)]
pub struct DagScheduler {
    config: SchedulerConfig,
    inner: Mutex<Inner>,
}

impl DagScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                tenants: BTreeMap::new(),
                cursor: None,
                turn_left: 0,
                next_seq: 0,
                overload_since: None,
                events: Vec::new(),
            }),
        }
    }

    /// Register a tenant's fairness weight and backpressure limit.
    ///
    /// Unregistered tenants are admitted with the config defaults on first
    /// enqueue.
    pub fn register_tenant(&self, tenant_id: Uuid, weight: u32, queue_limit: usize) {
        let mut inner = self.lock();
        let queue = inner
            .tenants
            .entry(tenant_id)
            .or_insert_with(|| TenantQueue::new(weight, queue_limit));
        queue.weight = weight.max(1);
        queue.limit = queue_limit;
    }

    /// Admit a ready node.
    ///
    /// # Errors
    /// Returns `CapacityExceeded` when the tenant's queue is at its limit;
    /// the caller must defer or shed.
    pub fn enqueue(&self, admission: Admission) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.lock();

        let default_weight = self.config.default_weight;
        let default_limit = self.config.default_queue_limit;
        let queue = inner
            .tenants
            .entry(admission.tenant_id)
            .or_insert_with(|| TenantQueue::new(default_weight, default_limit));

        if queue.depth() >= queue.limit {
            return Err(ConductorError::CapacityExceeded {
                tenant_id: admission.tenant_id,
                depth: queue.depth(),
                limit: queue.limit,
            });
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let item = QueuedNode {
            node_id: admission.node_id,
            workflow_id: admission.workflow_id,
            tenant_id: admission.tenant_id,
            priority: admission.priority,
            declared_priority: admission.priority,
            seq,
            enqueued_at: now,
            wait_since: now,
        };
        inner
            .tenants
            .get_mut(&admission.tenant_id)
            .expect("queue just inserted")
            .push(item);

        self.maybe_shed(&mut inner, now);
        Ok(())
    }

    /// Return the next node to dispatch, or `None` when nothing is eligible
    /// or `available_capacity` is zero.
    pub fn dequeue_next(&self, available_capacity: usize) -> Option<QueuedNode> {
        if available_capacity == 0 {
            return None;
        }
        let now = Instant::now();
        let mut inner = self.lock();

        self.escalate_starved(&mut inner, now);
        self.maybe_shed(&mut inner, now);

        let occupied: Vec<Uuid> = inner
            .tenants
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if occupied.is_empty() {
            return None;
        }

        let serving = match inner.cursor {
            Some(id) if inner.turn_left > 0 && occupied.contains(&id) => id,
            _ => {
                let next = Self::next_occupied(inner.cursor, &occupied);
                let weight = inner.tenants[&next].weight;
                inner.turn_left = weight;
                inner.cursor = Some(next);
                next
            }
        };

        inner.turn_left -= 1;
        let item = inner
            .tenants
            .get_mut(&serving)
            .and_then(TenantQueue::pop_next);
        if let Some(ref node) = item {
            debug!(
                tenant = %node.tenant_id,
                node = %node.node_id,
                priority = ?node.priority,
                "dispatching node"
            );
        }
        item
    }

    /// Remove a queued node; returns whether it was found. Nodes already
    /// dispatched are unaffected.
    pub fn cancel(&self, node_id: Uuid) -> bool {
        let mut inner = self.lock();
        inner
            .tenants
            .values_mut()
            .any(|q| q.remove(node_id).is_some())
    }

    /// Total queued nodes across all tenants.
    pub fn depth(&self) -> usize {
        self.lock().tenants.values().map(TenantQueue::depth).sum()
    }

    /// Queued nodes for one tenant.
    pub fn tenant_depth(&self, tenant_id: Uuid) -> usize {
        self.lock()
            .tenants
            .get(&tenant_id)
            .map_or(0, TenantQueue::depth)
    }

    /// Drain buffered escalation/shed events for ledgering.
    pub fn drain_events(&self) -> Vec<SchedEvent> {
        std::mem::take(&mut self.lock().events)
    }

    fn next_occupied(cursor: Option<Uuid>, occupied: &[Uuid]) -> Uuid {
        match cursor {
            Some(cur) => occupied
                .iter()
                .find(|id| **id > cur)
                .copied()
                .unwrap_or(occupied[0]),
            None => occupied[0],
        }
    }

    fn escalate_starved(&self, inner: &mut Inner, now: Instant) {
        let mut events = Vec::new();
        for queue in inner.tenants.values_mut() {
            for (item, from, to) in queue.escalate_starved(now, |p| self.config.sla_for(p)) {
                warn!(
                    node = %item.node_id,
                    ?from,
                    ?to,
                    "starvation escalation"
                );
                events.push(SchedEvent::Escalated {
                    node_id: item.node_id,
                    workflow_id: item.workflow_id,
                    tenant_id: item.tenant_id,
                    from,
                    to,
                });
            }
        }
        inner.events.extend(events);
    }

    fn maybe_shed(&self, inner: &mut Inner, now: Instant) {
        let depth: usize = inner.tenants.values().map(TenantQueue::depth).sum();
        if depth <= self.config.shed_ceiling {
            inner.overload_since = None;
            return;
        }
        let since = *inner.overload_since.get_or_insert(now);
        if now.duration_since(since) < self.config.shed_sustain {
            return;
        }

        let mut excess = depth - self.config.shed_ceiling;
        let tenant_ids: Vec<Uuid> = inner.tenants.keys().copied().collect();
        let mut events = Vec::new();
        for tenant_id in tenant_ids {
            if excess == 0 {
                break;
            }
            let queue = inner.tenants.get_mut(&tenant_id).expect("known tenant");
            for item in queue.shed(excess) {
                warn!(node = %item.node_id, priority = ?item.priority, "load shed");
                events.push(SchedEvent::LoadShed {
                    node_id: item.node_id,
                    workflow_id: item.workflow_id,
                    tenant_id: item.tenant_id,
                    priority: item.priority,
                });
                excess -= 1;
            }
        }
        inner.events.extend(events);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("scheduler lock poisoned")
    }
}

impl Default for DagScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}
