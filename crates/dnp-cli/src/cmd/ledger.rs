use crate::output::{fmt_time, print_json, print_table};
use chrono::Utc;
use clap::Subcommand;
use dnp_core::ledger::EnforcementAction;
use std::path::Path;
use uuid::Uuid;

#[derive(Subcommand)]
pub enum LedgerSubcommand {
    /// List ledger runs, or the entries of one run
    List {
        /// Show the entries of this run
        #[arg(long)]
        run: Option<Uuid>,
        /// Read the run from the archive instead of the active ledger
        #[arg(long, requires = "run")]
        archived: bool,
    },

    /// Archive runs older than the rollback window
    Prune,
}

pub fn run(root: &Path, subcmd: LedgerSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        LedgerSubcommand::List { run: None, .. } => list_runs(root, json),
        LedgerSubcommand::List {
            run: Some(run_id),
            archived,
        } => list_entries(root, run_id, archived, json),
        LedgerSubcommand::Prune => prune(root, json),
    }
}

fn list_runs(root: &Path, json: bool) -> anyhow::Result<()> {
    let (_, db) = super::open(root)?;
    let runs = db.ledger_runs()?;
    if json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("Ledger is empty.");
        return Ok(());
    }
    let rows = runs
        .iter()
        .map(|r| {
            vec![
                r.run_id.to_string(),
                r.provider.clone(),
                r.user.clone(),
                r.entries.to_string(),
                r.reversals.to_string(),
                fmt_time(Some(r.last_at)),
            ]
        })
        .collect();
    print_table(
        &["RUN", "PROVIDER", "USER", "ENTRIES", "REVERSALS", "LAST"],
        rows,
    );
    Ok(())
}

fn list_entries(root: &Path, run_id: Uuid, archived: bool, json: bool) -> anyhow::Result<()> {
    let (_, db) = super::open(root)?;
    let entries = if archived {
        db.archived_entries(run_id)?
    } else {
        db.ledger_entries(run_id)?
    };
    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        if !archived && db.is_run_archived(run_id)? {
            println!("Run {run_id} has been archived; use --archived to see it.");
        } else {
            println!("No entries for run {run_id}.");
        }
        return Ok(());
    }
    print_table(
        &["SEQ", "ACTION", "TYPE", "RESOURCE", "REVERSES", "AT"],
        entries.iter().map(entry_row).collect(),
    );
    Ok(())
}

fn entry_row(e: &EnforcementAction) -> Vec<String> {
    vec![
        e.sequence.to_string(),
        e.action.to_string(),
        e.resource_type.to_string(),
        e.resource_name
            .clone()
            .unwrap_or_else(|| e.resource_id.clone()),
        e.reverses.map(|id| id.to_string()).unwrap_or_default(),
        fmt_time(Some(e.created_at)),
    ]
}

fn prune(root: &Path, json: bool) -> anyhow::Result<()> {
    let (config, db) = super::open(root)?;
    let now = Utc::now();
    let cutoff = now - config.ledger.rollback_window();
    let report = db.prune_ledger(cutoff, now)?;

    if json {
        return print_json(&report);
    }
    println!(
        "Archived {} runs ({} entries) older than {}.",
        report.runs_archived.len(),
        report.entries_archived,
        fmt_time(Some(cutoff))
    );
    Ok(())
}
