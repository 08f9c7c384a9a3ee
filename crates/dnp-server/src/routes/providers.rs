use axum::extract::{Path, State};
use axum::Json;
use dnp_core::circuit::CircuitBreakerState;
use dnp_core::status::ProviderStatus;
use tracing::info;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/providers: limiter and circuit state for every known provider.
pub async fn list_providers(
    State(app): State<AppState>,
) -> Result<Json<Vec<ProviderStatus>>, AppError> {
    let statuses = app
        .blocking(|db, config| db.provider_statuses(config))
        .await?;
    Ok(Json(statuses))
}

/// GET /api/providers/{provider}
pub async fn get_provider(
    State(app): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<ProviderStatus>, AppError> {
    let status = app
        .blocking(move |db, config| db.provider_status(config, &provider))
        .await?;
    Ok(Json(status))
}

/// POST /api/providers/{provider}/circuit/reset: operator override that
/// closes the circuit and clears its failure history.
pub async fn reset_circuit(
    State(app): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<CircuitBreakerState>, AppError> {
    let state = app
        .blocking(move |db, _| {
            dnp_core::paths::validate_provider(&provider)?;
            db.reset_circuit(&provider)
        })
        .await?;
    info!(provider = %state.provider, "circuit reset by operator");
    Ok(Json(state))
}
