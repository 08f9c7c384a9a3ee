use crate::output::print_json;
use anyhow::Context;
use dnp_core::{
    config::{Config, ProviderConfig},
    io, paths, EnforcementDb,
};
use std::path::Path;

pub fn run(root: &Path, providers: &[String], json: bool) -> anyhow::Result<()> {
    for name in providers {
        paths::validate_provider(name)?;
    }
    if !json {
        println!("Initializing dnp in: {}", root.display());
    }

    for dir in [paths::DNP_DIR, paths::PREVIEWS_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let config_path = paths::config_path(root);
    let created_config = !config_path.exists();
    let mut config = if created_config {
        Config::new()
    } else {
        Config::load(root).context("failed to load existing config")?
    };
    let mut added = Vec::new();
    for name in providers {
        if !config.providers.contains_key(name) {
            config
                .providers
                .insert(name.clone(), ProviderConfig::default());
            added.push(name.clone());
        }
    }
    if created_config || !added.is_empty() {
        config.save(root).context("failed to write config.yaml")?;
    }

    let db_path = paths::db_path(root);
    let created_db = !db_path.exists();
    EnforcementDb::open(&db_path)
        .with_context(|| format!("failed to create {}", db_path.display()))?;

    if json {
        return print_json(&serde_json::json!({
            "root": root,
            "created_config": created_config,
            "created_db": created_db,
            "providers_added": added,
        }));
    }

    let verb = |created: bool| if created { "created:" } else { "exists: " };
    println!("  {} {}", verb(created_config), paths::CONFIG_FILE);
    println!("  {} {}", verb(created_db), paths::DB_FILE);
    for name in &added {
        println!("  added provider: {name}");
    }
    Ok(())
}
