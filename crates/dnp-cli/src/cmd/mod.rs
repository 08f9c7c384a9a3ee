pub mod batch;
pub mod circuit;
pub mod config;
pub mod init;
pub mod ledger;
pub mod provider;
pub mod serve;

use anyhow::Context;
use dnp_core::{config::Config, paths, EnforcementDb};
use std::path::Path;

/// Load the config and open the state database under `root`.
pub fn open(root: &Path) -> anyhow::Result<(Config, EnforcementDb)> {
    let config = Config::load(root).context("failed to load config")?;
    let db_path = paths::db_path(root);
    let db = EnforcementDb::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    Ok((config, db))
}
