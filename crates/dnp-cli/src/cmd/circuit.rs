use crate::output::print_json;
use clap::Subcommand;
use dnp_core::paths;
use std::path::Path;
use tracing::info;

#[derive(Subcommand)]
pub enum CircuitSubcommand {
    /// Force a provider's circuit closed and clear its failure history
    Reset { provider: String },
}

pub fn run(root: &Path, subcmd: CircuitSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        CircuitSubcommand::Reset { provider } => reset(root, &provider, json),
    }
}

fn reset(root: &Path, provider: &str, json: bool) -> anyhow::Result<()> {
    paths::validate_provider(provider)?;
    let (_, db) = super::open(root)?;
    let state = db.reset_circuit(provider)?;
    info!(provider, "circuit reset by operator");

    if json {
        return print_json(&state);
    }
    println!("Circuit for '{provider}' is {}.", state.state);
    Ok(())
}
