use std::path::{Path, PathBuf};

/// Resolve the enforcement root directory.
///
/// Priority:
/// 1. `--root` flag / `DNP_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.dnp/`
/// 3. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_marked_ancestor(&cwd).unwrap_or(cwd)
}

fn find_marked_ancestor(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(dnp_core::paths::DNP_DIR).is_dir())
        .map(Path::to_path_buf)
}
