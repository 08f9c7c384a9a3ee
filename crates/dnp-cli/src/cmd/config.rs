use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use dnp_core::config::{Config, WarnLevel};
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration
    Show,

    /// Validate the config for common mistakes
    Validate,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(root, json),
        ConfigSubcommand::Validate => validate(root, json),
    }
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    if json {
        return print_json(&config);
    }

    let rows = config
        .providers
        .iter()
        .map(|(name, p)| {
            vec![
                name.clone(),
                format!(
                    "{}/{}s",
                    p.rate_limit.requests_per_window, p.rate_limit.window_duration_seconds
                ),
                p.rate_limit.burst_allowance.to_string(),
                format!("{}s", p.rate_limit.max_backoff_seconds),
                p.batch.max_batch_size.to_string(),
                if p.circuit_breaker.is_some() {
                    "override".to_string()
                } else {
                    "global".to_string()
                },
            ]
        })
        .collect();
    print_table(
        &["PROVIDER", "RATE", "BURST", "MAX BACKOFF", "BATCH", "CIRCUIT"],
        rows,
    );

    let cb = &config.circuit_breaker;
    println!();
    println!(
        "circuit: {} failures in {}s opens for {}s (x{}, max {}s), {} half-open successes to close",
        cb.failure_threshold,
        cb.lookback_seconds,
        cb.cooldown_seconds,
        cb.cooldown_multiplier,
        cb.max_cooldown_seconds,
        cb.half_open_success_threshold
    );
    let orch = &config.orchestrator;
    println!(
        "orchestrator: timeout {}s, {} item retries, {} rate-limit retries, fail at ratio {}",
        orch.call_timeout_seconds,
        orch.max_item_retries,
        orch.max_rate_limit_retries,
        orch.failure_ratio_threshold
    );
    println!(
        "ledger: rollback window {} days",
        config.ledger.rollback_window_days
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
