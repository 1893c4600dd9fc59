//! Background dispatch engine.

use std::sync::Arc;

use tokio::time::{sleep, Duration};
use tracing::{error, info};

use crate::state::AppState;

/// Drives the coordinator's dispatch pump and the review-expiry sweep.
pub struct Engine {
    state: AppState,
    /// Delay between pump cycles when nothing was dispatched.
    idle: Duration,
}

impl Engine {
    /// Create a new engine.
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            idle: Duration::from_millis(50),
        }
    }

    /// Run the engine's main loop.
    pub async fn run(self: Arc<Self>) {
        info!("🔧 Engine started");

        loop {
            match self.state.coordinator.tick().await {
                Ok(report) => {
                    if report.dispatched == 0 {
                        sleep(self.idle).await;
                    }
                }
                Err(e) => {
                    // Ledger write failures halt progress but must stay
                    // visible; the loop keeps retrying.
                    error!("engine tick failed: {}", e);
                    sleep(self.idle).await;
                }
            }

            if let Err(e) = self.state.coordinator.sweep_reviews().await {
                error!("review sweep failed: {}", e);
            }
        }
    }
}
