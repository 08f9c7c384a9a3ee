use axum::extract::{Path, Query, State};
use axum::Json;
use dnp_core::ledger::{EnforcementAction, LedgerRun};
use dnp_core::orchestrator::{RollbackItemStatus, RollbackReport, RollbackScope};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct LedgerQuery {
    #[serde(default)]
    archived: bool,
}

/// GET /api/runs: ledger runs, newest activity first.
pub async fn list_runs(State(app): State<AppState>) -> Result<Json<Vec<LedgerRun>>, AppError> {
    let runs = app.blocking(|db, _| db.ledger_runs()).await?;
    Ok(Json(runs))
}

/// GET /api/runs/{run_id}/ledger: entries of one run in sequence order.
/// `?archived=true` reads the archive. An archived run asked for without
/// the flag is `410 Gone`.
pub async fn get_run_ledger(
    State(app): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<Vec<EnforcementAction>>, AppError> {
    let entries = app
        .blocking(move |db, _| {
            if query.archived {
                return db.archived_entries(run_id);
            }
            let entries = db.ledger_entries(run_id)?;
            if entries.is_empty() {
                if db.is_run_archived(run_id)? {
                    return Err(dnp_core::EnforceError::RollbackExpired(run_id.to_string()));
                }
                return Err(dnp_core::EnforceError::RunNotFound(run_id.to_string()));
            }
            Ok(entries)
        })
        .await?;
    Ok(Json(entries))
}

/// POST /api/runs/{run_id}/rollback: reverse a run newest first. The body
/// is `{"scope": "full"}` or `{"scope": "partial", "resource_ids": [...]}`.
/// Per-resource outcomes are in the report; an archived run is `410`, a
/// run still being driven is `409`.
pub async fn rollback_run(
    State(app): State<AppState>,
    Path(run_id): Path<Uuid>,
    Json(scope): Json<RollbackScope>,
) -> Result<Json<RollbackReport>, AppError> {
    let report = app.orchestrator.rollback(run_id, scope).await?;
    info!(
        %run_id,
        reversed = report.count(RollbackItemStatus::Reversed),
        failed = report.count(RollbackItemStatus::Failed),
        "rollback requested"
    );
    Ok(Json(report))
}
