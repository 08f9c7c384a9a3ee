pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use std::path::PathBuf;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Providers
        .route("/api/providers", get(routes::providers::list_providers))
        .route(
            "/api/providers/{provider}",
            get(routes::providers::get_provider),
        )
        .route(
            "/api/providers/{provider}/circuit/reset",
            post(routes::providers::reset_circuit),
        )
        // Batches
        .route(
            "/api/batches",
            get(routes::batches::list_batches).post(routes::batches::submit_batch),
        )
        .route("/api/batches/{id}", get(routes::batches::get_batch))
        .route(
            "/api/batches/{id}/checkpoint",
            get(routes::batches::get_checkpoint),
        )
        .route(
            "/api/batches/{id}/cancel",
            post(routes::batches::cancel_batch),
        )
        // Ledger
        .route("/api/runs", get(routes::ledger::list_runs))
        .route(
            "/api/runs/{run_id}/ledger",
            get(routes::ledger::get_run_ledger),
        )
        .route(
            "/api/runs/{run_id}/rollback",
            post(routes::ledger::rollback_run),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Start the operations API on `port`.
pub async fn serve(root: PathBuf, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    serve_on(root, listener).await
}

/// Start the operations API on a pre-bound listener.
///
/// Unlike `serve`, this accepts a `TcpListener` that was already bound so the
/// caller can read the actual port before starting (useful when `port = 0` and
/// the OS picks a free port).
pub async fn serve_on(root: PathBuf, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app_state = tokio::task::spawn_blocking(move || AppState::open(root)).await??;
    let app = build_router(app_state);

    tracing::info!("dnp API listening on http://localhost:{actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}
