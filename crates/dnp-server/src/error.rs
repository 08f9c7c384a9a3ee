use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dnp_core::error::EnforceError;

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

fn status_for(e: &EnforceError) -> StatusCode {
    match e {
        EnforceError::NotInitialized => StatusCode::BAD_REQUEST,
        EnforceError::BatchNotFound(_)
        | EnforceError::RunNotFound(_)
        | EnforceError::CheckpointNotFound(_)
        | EnforceError::AdapterNotFound(_) => StatusCode::NOT_FOUND,
        EnforceError::BatchAlreadyRunning(_) | EnforceError::BatchTerminal(_) => {
            StatusCode::CONFLICT
        }
        EnforceError::InvalidProvider(_)
        | EnforceError::InvalidSubmission(_)
        | EnforceError::InvalidValue { .. } => StatusCode::BAD_REQUEST,
        EnforceError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EnforceError::RollbackExpired(_) => StatusCode::GONE,
        EnforceError::Store(_)
        | EnforceError::Worker(_)
        | EnforceError::Io(_)
        | EnforceError::Yaml(_)
        | EnforceError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self
            .0
            .downcast_ref::<EnforceError>()
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %format!("{:#}", self.0), "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
