//! Per-tenant priority queues.

use std::collections::VecDeque;
use std::time::Instant;

use uuid::Uuid;

use conductor_core::Priority;

/// A ready node admitted to the scheduler.
#[derive(Debug, Clone)]
pub struct QueuedNode {
    pub node_id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: Uuid,
    /// Current class, possibly escalated above the declared one.
    pub priority: Priority,
    /// Class the node was enqueued with.
    pub declared_priority: Priority,
    /// Global insertion sequence; the FIFO tie-break within a class.
    pub seq: u64,
    pub enqueued_at: Instant,
    /// Wait clock for starvation escalation; restarts on each promotion.
    pub wait_since: Instant,
}

/// One tenant's queue: four FIFO rings, one per priority class.
#[derive(Debug)]
pub struct TenantQueue {
    pub weight: u32,
    pub limit: usize,
    rings: [VecDeque<QueuedNode>; 4],
}

impl TenantQueue {
    pub fn new(weight: u32, limit: usize) -> Self {
        Self {
            weight: weight.max(1),
            limit,
            rings: Default::default(),
        }
    }

    /// Total queued nodes across all classes.
    pub fn depth(&self) -> usize {
        self.rings.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.iter().all(VecDeque::is_empty)
    }

    /// Append to the item's class ring.
    pub fn push(&mut self, item: QueuedNode) {
        self.rings[item.priority.index()].push_back(item);
    }

    /// Pop the front of the highest non-empty class.
    pub fn pop_next(&mut self) -> Option<QueuedNode> {
        self.rings.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Remove a queued node by id; returns it if present.
    pub fn remove(&mut self, node_id: Uuid) -> Option<QueuedNode> {
        for ring in &mut self.rings {
            if let Some(pos) = ring.iter().position(|n| n.node_id == node_id) {
                return ring.remove(pos);
            }
        }
        None
    }

    /// Promote items that waited past their class SLA one class up.
    ///
    /// Promotion is one-directional and restarts the wait clock. Promoted
    /// items join the back of the higher ring. Returns (node, from, to) per
    /// promotion.
    pub fn escalate_starved(
        &mut self,
        now: Instant,
        sla_for: impl Fn(Priority) -> Option<std::time::Duration>,
    ) -> Vec<(QueuedNode, Priority, Priority)> {
        let mut promoted = Vec::new();
        // Walk P1..P3; P0 never escalates.
        for class in [Priority::P1, Priority::P2, Priority::P3] {
            let Some(sla) = sla_for(class) else { continue };
            let ring = &mut self.rings[class.index()];
            let mut keep = VecDeque::with_capacity(ring.len());
            while let Some(mut item) = ring.pop_front() {
                if now.duration_since(item.wait_since) > sla {
                    let from = item.priority;
                    // escalate() is Some for every class except P0.
                    let to = from.escalate().expect("P0 excluded above");
                    item.priority = to;
                    item.wait_since = now;
                    promoted.push((item, from, to));
                } else {
                    keep.push_back(item);
                }
            }
            *ring = keep;
        }
        for (item, _, _) in &promoted {
            self.rings[item.priority.index()].push_back(item.clone());
        }
        promoted
    }

    /// Drop queued nodes from the lowest class upward until `target` are
    /// removed; P0 items are never shed. Most recently enqueued go first.
    pub fn shed(&mut self, target: usize) -> Vec<QueuedNode> {
        let mut dropped = Vec::new();
        for class in [Priority::P3, Priority::P2, Priority::P1] {
            let ring = &mut self.rings[class.index()];
            while dropped.len() < target {
                match ring.pop_back() {
                    Some(item) => dropped.push(item),
                    None => break,
                }
            }
            if dropped.len() >= target {
                break;
            }
        }
        dropped
    }
}
