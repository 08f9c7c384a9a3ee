use crate::output::{fmt_time, print_json, print_table};
use clap::Subcommand;
use dnp_core::status::ProviderStatus;
use std::path::Path;

#[derive(Subcommand)]
pub enum ProviderSubcommand {
    /// Rate limit and circuit state for one provider, or all of them
    Status { provider: Option<String> },
}

pub fn run(root: &Path, subcmd: ProviderSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ProviderSubcommand::Status { provider } => status(root, provider.as_deref(), json),
    }
}

fn status(root: &Path, provider: Option<&str>, json: bool) -> anyhow::Result<()> {
    let (config, db) = super::open(root)?;
    let statuses = match provider {
        Some(name) => vec![db.provider_status(&config, name)?],
        None => db.provider_statuses(&config)?,
    };

    if json {
        return match (provider, statuses.as_slice()) {
            (Some(_), [one]) => print_json(one),
            _ => print_json(&statuses),
        };
    }
    if statuses.is_empty() {
        println!("No providers configured.");
        return Ok(());
    }
    print_table(
        &[
            "PROVIDER",
            "REMAINING",
            "BURST",
            "BACKOFF",
            "FAILURES",
            "CIRCUIT",
            "NEXT ATTEMPT",
        ],
        statuses.iter().map(row).collect(),
    );
    Ok(())
}

fn row(s: &ProviderStatus) -> Vec<String> {
    let name = if s.configured {
        s.provider.clone()
    } else {
        format!("{} (unconfigured)", s.provider)
    };
    vec![
        name,
        s.rate_limit.requests_remaining.to_string(),
        s.rate_limit.burst_remaining.to_string(),
        format!("{}s", s.rate_limit.current_backoff_seconds),
        s.rate_limit.consecutive_failures.to_string(),
        s.circuit.state.to_string(),
        fmt_time(s.circuit.next_attempt_at),
    ]
}
