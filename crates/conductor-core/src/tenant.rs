//! Tenant model and registry.
//!
//! Every workflow, node, and ledger entry is scoped to exactly one tenant.
//! Nothing crosses a tenant boundary implicitly; the registry is injected
//! state, not an ambient singleton.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConductorError, Result};

/// Tenant service tier, supplying default fairness weight and queue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TenantTier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl TenantTier {
    /// Default weighted-round-robin share for the tier.
    pub fn default_weight(self) -> u32 {
        match self {
            TenantTier::Free => 1,
            TenantTier::Pro => 2,
            TenantTier::Enterprise => 4,
        }
    }

    /// Default backpressure depth for the tier.
    pub fn default_queue_limit(self) -> usize {
        match self {
            TenantTier::Free => 64,
            TenantTier::Pro => 256,
            TenantTier::Enterprise => 1_024,
        }
    }
}

/// A tenant: the isolation boundary for all scheduling and ledger state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub tier: TenantTier,
    /// Weighted-round-robin share; a weight of 2 gets twice the turns of 1.
    pub weight: u32,
    /// Maximum queued nodes before enqueue returns `CapacityExceeded`.
    pub queue_limit: usize,
    pub active: bool,
}

impl Tenant {
    /// Create a tenant with its tier's default weight and queue limit.
    pub fn new(name: impl Into<String>, tier: TenantTier) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            tier,
            weight: tier.default_weight(),
            queue_limit: tier.default_queue_limit(),
            active: true,
        }
    }

    /// Override the fairness weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    /// Override the queue limit.
    pub fn with_queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }
}

/// In-memory tenant registry.
#[derive(Debug, Default)]
pub struct TenantRegistry {
    tenants: RwLock<HashMap<Uuid, Tenant>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tenant, replacing any previous entry with the same id.
    pub fn register(&self, tenant: Tenant) {
        let mut map = self.tenants.write().expect("tenant registry poisoned");
        map.insert(tenant.id, tenant);
    }

    /// Fetch a tenant by id.
    pub fn get(&self, id: Uuid) -> Result<Tenant> {
        let map = self.tenants.read().expect("tenant registry poisoned");
        map.get(&id)
            .cloned()
            .ok_or_else(|| ConductorError::not_found("Tenant", id))
    }

    /// All registered tenants.
    pub fn list(&self) -> Vec<Tenant> {
        let map = self.tenants.read().expect("tenant registry poisoned");
        map.values().cloned().collect()
    }
}
