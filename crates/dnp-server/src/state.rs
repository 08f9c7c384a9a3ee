use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use dnp_core::adapter::AdapterRegistry;
use dnp_core::config::Config;
use dnp_core::{paths, EnforcementDb, Orchestrator};

use crate::error::AppError;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub root: PathBuf,
    pub config: Arc<Config>,
    pub db: Arc<EnforcementDb>,
    /// Drives rollbacks through whatever adapters the embedding binary
    /// linked in. Without any, rollback requests fail with `404`.
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Load the config and open the state database under `root`.
    pub fn open(root: PathBuf) -> anyhow::Result<Self> {
        let config = Config::load(&root).context("failed to load config")?;
        let db_path = paths::db_path(&root);
        let db = EnforcementDb::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        let config = Arc::new(config);
        let db = Arc::new(db);
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            config.clone(),
            AdapterRegistry::new(),
        ));
        Ok(Self {
            root,
            config,
            db,
            orchestrator,
        })
    }

    /// Replace the orchestrator with one that uses `adapters`.
    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.orchestrator = Arc::new(Orchestrator::new(
            self.db.clone(),
            self.config.clone(),
            adapters,
        ));
        self
    }

    /// Run a store operation on the blocking pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&EnforcementDb, &Config) -> dnp_core::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let config = Arc::clone(&self.config);
        let result = tokio::task::spawn_blocking(move || f(&db, &config))
            .await
            .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
        Ok(result)
    }
}
