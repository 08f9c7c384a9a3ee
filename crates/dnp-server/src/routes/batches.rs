use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use dnp_core::batch::{ActionBatch, BatchSubmission, SubmitOutcome};
use dnp_core::checkpoint::BatchCheckpoint;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct BatchQuery {
    key: Option<String>,
}

/// GET /api/batches: every batch, newest first. `?key=` narrows the list
/// to the batch submitted under that idempotency key, if any.
pub async fn list_batches(
    State(app): State<AppState>,
    Query(query): Query<BatchQuery>,
) -> Result<Json<Vec<ActionBatch>>, AppError> {
    let batches = app
        .blocking(move |db, _| match query.key {
            Some(key) => Ok(db.find_batch_by_key(&key)?.into_iter().collect()),
            None => db.list_batches(),
        })
        .await?;
    Ok(Json(batches))
}

/// POST /api/batches: submit a batch. `201` when it was created, `200`
/// when the idempotency key matched an existing batch.
pub async fn submit_batch(
    State(app): State<AppState>,
    Json(submission): Json<BatchSubmission>,
) -> Result<(StatusCode, Json<SubmitOutcome>), AppError> {
    let outcome = app
        .blocking(move |db, _| db.submit_batch(&submission, Utc::now()))
        .await?;
    let status = if outcome.created {
        info!(batch_id = %outcome.batch.id, provider = %outcome.batch.provider, "batch submitted");
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

/// GET /api/batches/{id}: batch with its items.
pub async fn get_batch(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (batch, items) = app
        .blocking(move |db, _| Ok((db.get_batch(id)?, db.items(id)?)))
        .await?;
    Ok(Json(serde_json::json!({ "batch": batch, "items": items })))
}

/// GET /api/batches/{id}/checkpoint
pub async fn get_checkpoint(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BatchCheckpoint>, AppError> {
    let checkpoint = app
        .blocking(move |db, _| {
            db.get_batch(id)?;
            db.require_checkpoint(id)
        })
        .await?;
    Ok(Json(checkpoint))
}

/// POST /api/batches/{id}/cancel: cancel a batch no process is driving.
pub async fn cancel_batch(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let outcome = app
        .blocking(move |db, _| db.cancel_idle_batch(id, Utc::now()))
        .await?;
    Ok(Json(serde_json::json!({ "batch_id": id, "outcome": outcome })))
}
