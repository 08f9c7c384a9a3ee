use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnforceError {
    #[error("not initialized: run 'dnp init'")]
    NotInitialized,

    #[error("batch not found: {0}")]
    BatchNotFound(String),

    #[error("run not found in ledger: {0}")]
    RunNotFound(String),

    #[error("checkpoint not found for batch: {0}")]
    CheckpointNotFound(String),

    #[error("no adapter registered for provider '{0}'")]
    AdapterNotFound(String),

    #[error("batch {0} is already running")]
    BatchAlreadyRunning(String),

    #[error("batch {0} is terminal and cannot be run again")]
    BatchTerminal(String),

    #[error("invalid provider name '{0}': must be lowercase alphanumeric with hyphens or underscores")]
    InvalidProvider(String),

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("invalid value '{value}' for {field}")]
    InvalidValue { field: &'static str, value: String },

    #[error("rollback window expired for run {0}: ledger entries were archived")]
    RollbackExpired(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EnforceError>;
