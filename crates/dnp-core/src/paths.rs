use crate::error::{EnforceError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const DNP_DIR: &str = ".dnp";
pub const PREVIEWS_DIR: &str = ".dnp/previews";

pub const CONFIG_FILE: &str = ".dnp/config.yaml";
pub const DB_FILE: &str = ".dnp/enforcement.db";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn dnp_dir(root: &Path) -> PathBuf {
    root.join(DNP_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join(DB_FILE)
}

pub fn preview_path(root: &Path, batch_id: &str) -> PathBuf {
    root.join(PREVIEWS_DIR).join(format!("{batch_id}.json"))
}

// ---------------------------------------------------------------------------
// Provider name validation
// ---------------------------------------------------------------------------

static PROVIDER_RE: OnceLock<Regex> = OnceLock::new();

fn provider_re() -> &'static Regex {
    PROVIDER_RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9_\-]*[a-z0-9]$|^[a-z0-9]$").expect("static regex")
    })
}

/// Provider names are store keys and URL path segments.
pub fn validate_provider(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 || !provider_re().is_match(name) {
        return Err(EnforceError::InvalidProvider(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
