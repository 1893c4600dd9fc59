//! Application state.
//!
//! Everything the API and engine touch is injected here: no ambient
//! singletons, so handlers stay testable against a fresh state.

use std::sync::Arc;

use conductor_core::{AllowAllPolicy, OpenBudget, TaskExecutor, TenantRegistry};
use conductor_ledger::{Ledger, LedgerSigner, MemoryLedgerStore};
use conductor_saga::{CoordinatorConfig, SagaCoordinator};
use conductor_sched::{DagScheduler, SchedulerConfig};

use crate::executor::SimulatedExecutor;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Registered tenants.
    pub tenants: Arc<TenantRegistry>,

    /// The multi-tenant node scheduler.
    pub scheduler: Arc<DagScheduler>,

    /// The hash-chained transition ledger.
    pub ledger: Arc<Ledger>,

    /// The saga coordinator driving every workflow instance.
    pub coordinator: Arc<SagaCoordinator>,
}

impl AppState {
    /// State wired with the simulated executor and open gates.
    pub fn new() -> Self {
        Self::with_executor(Arc::new(SimulatedExecutor))
    }

    /// State wired with a caller-supplied executor.
    pub fn with_executor(executor: Arc<dyn TaskExecutor>) -> Self {
        let scheduler = Arc::new(DagScheduler::new(SchedulerConfig::default()));
        let ledger = Arc::new(Ledger::new(
            LedgerSigner::generate(),
            Arc::new(MemoryLedgerStore::new()),
        ));
        let coordinator = Arc::new(SagaCoordinator::new(
            scheduler.clone(),
            ledger.clone(),
            executor,
            Arc::new(AllowAllPolicy),
            Arc::new(OpenBudget),
            CoordinatorConfig::default(),
        ));

        Self {
            tenants: Arc::new(TenantRegistry::new()),
            scheduler,
            ledger,
            coordinator,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
