mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    batch::BatchSubcommand, circuit::CircuitSubcommand, config::ConfigSubcommand,
    ledger::LedgerSubcommand, provider::ProviderSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "dnp",
    about = "Enforce do-not-play lists against streaming providers: batches, rate limits, circuits and rollback",
    version,
    propagate_version = true
)]
struct Cli {
    /// Enforcement root (default: auto-detect from .dnp/)
    #[arg(long, global = true, env = "DNP_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .dnp/ with a default config and state database
    Init {
        /// Providers to add to the config with default limits
        #[arg(long = "provider", value_name = "NAME")]
        providers: Vec<String>,
    },

    /// Show or validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Submit, inspect, preview and cancel enforcement batches
    Batch {
        #[command(subcommand)]
        subcommand: BatchSubcommand,
    },

    /// Inspect per-provider rate limit and circuit state
    Provider {
        #[command(subcommand)]
        subcommand: ProviderSubcommand,
    },

    /// Operate circuit breakers
    Circuit {
        #[command(subcommand)]
        subcommand: CircuitSubcommand,
    },

    /// Inspect and prune the enforcement ledger
    Ledger {
        #[command(subcommand)]
        subcommand: LedgerSubcommand,
    },

    /// Serve the HTTP operations API
    Serve {
        /// Port to listen on (0 = OS-assigned)
        #[arg(long, default_value = "7431")]
        port: u16,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { providers } => cmd::init::run(&root, &providers, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Batch { subcommand } => cmd::batch::run(&root, subcommand, cli.json),
        Commands::Provider { subcommand } => cmd::provider::run(&root, subcommand, cli.json),
        Commands::Circuit { subcommand } => cmd::circuit::run(&root, subcommand, cli.json),
        Commands::Ledger { subcommand } => cmd::ledger::run(&root, subcommand, cli.json),
        Commands::Serve { port } => cmd::serve::run(&root, port),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
