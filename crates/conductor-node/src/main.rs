//! # Conductor Node
//!
//! Main Conductor node binary: the orchestration kernel facade and its
//! HTTP API, with the dispatch engine running as a background task.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod engine;
mod executor;
mod state;

use engine::Engine;
use state::AppState;

/// Run the Conductor node server.
pub async fn run_server(addr: SocketAddr) -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("🚀 Conductor node starting...");

    // Create shared application state
    let state = AppState::new();

    // Start the dispatch engine background task
    let engine = Arc::new(Engine::new(state.clone()));
    tokio::spawn(async move {
        engine.run().await;
    });

    // Build the router
    let app = create_router(state);

    info!("🌐 Listening on http://{}", addr);

    // Start the server
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the API router.
fn create_router(state: AppState) -> Router {
    // CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(api::health::health_check))
        // Intent entry point: the parser hands us a DAG
        .route("/api/v1/intents", post(api::workflow::submit_intent))
        // Workflow lifecycle
        .route(
            "/api/v1/workflows",
            post(api::workflow::submit_workflow).get(api::workflow::list_workflows),
        )
        .route("/api/v1/workflows/:id", get(api::workflow::get_workflow))
        .route("/api/v1/workflows/:id/run", post(api::workflow::run_workflow))
        .route(
            "/api/v1/workflows/:id/cancel",
            post(api::workflow::cancel_workflow),
        )
        .route(
            "/api/v1/workflows/:id/resume",
            post(api::workflow::resume_workflow),
        )
        // Task (node-level) status and cancellation
        .route("/api/v1/tasks/:id", get(api::task::get_task))
        .route("/api/v1/tasks/:id/cancel", post(api::task::cancel_task))
        // Ledger operations
        .route(
            "/api/v1/ledger/entries",
            get(api::ledger::list_entries).post(api::ledger::append_annotation),
        )
        .route("/api/v1/ledger/verify", post(api::ledger::verify))
        .route("/api/v1/ledger/replay", post(api::ledger::replay))
        .route("/api/v1/ledger/simulate", post(api::ledger::simulate_dag))
        .route("/api/v1/ledger/diff/:a/:b", get(api::ledger::diff_traces))
        // Human review
        .route("/api/v1/reviews", get(api::review::list_reviews))
        .route("/api/v1/reviews/:id", get(api::review::get_review))
        .route(
            "/api/v1/reviews/:id/resolve",
            post(api::review::resolve_review),
        )
        // Tenants
        .route(
            "/api/v1/tenants",
            post(api::tenant::register_tenant).get(api::tenant::list_tenants),
        )
        .route("/api/v1/tenants/:id/kill", post(api::tenant::kill_tenant))
        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], 3000));
    run_server(addr).await
}
