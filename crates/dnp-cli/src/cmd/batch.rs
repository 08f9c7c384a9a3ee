use crate::output::{fmt_time, print_json, print_table};
use anyhow::Context;
use chrono::Utc;
use clap::Subcommand;
use dnp_core::{
    adapter::SimulatedAdapter,
    batch::BatchSubmission,
    io,
    orchestrator::{CancelOutcome, RunSummary},
    paths, Orchestrator,
};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum BatchSubcommand {
    /// Submit a batch from a JSON or YAML file ("-" reads stdin)
    Submit { file: PathBuf },

    /// List batches, newest first
    List,

    /// Show a batch with its items and checkpoint
    Show { id: Uuid },

    /// Run a dry-run batch through the simulated adapter and save the preview
    Preview { id: Uuid },

    /// Cancel a batch that is not running; its checkpoint is kept
    Cancel { id: Uuid },
}

pub fn run(root: &Path, subcmd: BatchSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        BatchSubcommand::Submit { file } => submit(root, &file, json),
        BatchSubcommand::List => list(root, json),
        BatchSubcommand::Show { id } => show(root, id, json),
        BatchSubcommand::Preview { id } => preview(root, id, json),
        BatchSubcommand::Cancel { id } => cancel(root, id, json),
    }
}

// ---------------------------------------------------------------------------
// submit
// ---------------------------------------------------------------------------

fn read_submission(file: &Path) -> anyhow::Result<BatchSubmission> {
    let data = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read submission from stdin")?;
        buf
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?
    };
    // YAML is a superset of JSON, so one parser covers both.
    serde_yaml::from_str(&data).context("submission is not valid JSON or YAML")
}

fn submit(root: &Path, file: &Path, json: bool) -> anyhow::Result<()> {
    let submission = read_submission(file)?;
    let (_, db) = super::open(root)?;
    let outcome = db.submit_batch(&submission, Utc::now())?;

    if json {
        return print_json(&outcome);
    }
    let batch = &outcome.batch;
    if outcome.created {
        println!(
            "Submitted batch {} ({} items for {})",
            batch.id, batch.summary.total, batch.provider
        );
    } else {
        println!(
            "Batch {} already exists for key '{}' (status: {})",
            batch.id, batch.idempotency_key, batch.status
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// list / show
// ---------------------------------------------------------------------------

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let (_, db) = super::open(root)?;
    let batches = db.list_batches()?;
    if json {
        return print_json(&batches);
    }
    if batches.is_empty() {
        println!("No batches.");
        return Ok(());
    }
    let rows = batches
        .iter()
        .map(|b| {
            vec![
                b.id.to_string(),
                b.provider.clone(),
                b.status.to_string(),
                b.halt_reason.map(|h| h.to_string()).unwrap_or_default(),
                format!("{}/{}", b.summary.scanned(), b.summary.total),
                if b.dry_run { "yes" } else { "" }.to_string(),
                fmt_time(Some(b.created_at)),
            ]
        })
        .collect();
    print_table(
        &["ID", "PROVIDER", "STATUS", "HALT", "DONE", "DRY RUN", "CREATED"],
        rows,
    );
    Ok(())
}

fn show(root: &Path, id: Uuid, json: bool) -> anyhow::Result<()> {
    let (_, db) = super::open(root)?;
    let batch = db.get_batch(id)?;
    let items = db.items(id)?;
    let checkpoint = db.checkpoint(id)?;

    if json {
        return print_json(&serde_json::json!({
            "batch": batch,
            "items": items,
            "checkpoint": checkpoint,
        }));
    }

    println!("Batch:    {}", batch.id);
    println!("User:     {}", batch.user);
    println!("Provider: {}", batch.provider);
    println!("Key:      {}", batch.idempotency_key);
    match batch.halt_reason {
        Some(reason) => println!("Status:   {} ({reason})", batch.status),
        None => println!("Status:   {}", batch.status),
    }
    if batch.dry_run {
        println!("Dry run:  yes");
    }
    println!("Started:  {}", fmt_time(batch.started_at));
    println!("Finished: {}", fmt_time(batch.completed_at));
    if let Some(cp) = &checkpoint {
        println!(
            "Checkpoint: position {} ({} processed, {} failed)",
            cp.current_position, cp.processed_items, cp.failed_items
        );
    }
    println!();

    let rows = items
        .iter()
        .map(|i| {
            vec![
                i.position.to_string(),
                i.entity_type.to_string(),
                i.entity_id.clone(),
                i.action.to_string(),
                i.status.to_string(),
                i.error_message.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["#", "TYPE", "ENTITY", "ACTION", "STATUS", "NOTE"], rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// preview
// ---------------------------------------------------------------------------

fn preview(root: &Path, id: Uuid, json: bool) -> anyhow::Result<()> {
    let (config, db) = super::open(root)?;
    let batch = db.get_batch(id)?;
    if !batch.dry_run {
        anyhow::bail!(
            "batch {id} is not a dry run; previews only execute against the simulated adapter"
        );
    }

    let registry = SimulatedAdapter::registry_from_config(&config);
    let orch = Orchestrator::new(Arc::new(db), Arc::new(config), registry);
    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(orch.run(id))?;

    let path = paths::preview_path(root, &id.to_string());
    let data = serde_json::to_vec_pretty(&summary)?;
    io::atomic_write(&path, &data)
        .with_context(|| format!("failed to write {}", path.display()))?;

    if json {
        return print_json(&summary);
    }
    print_preview(&summary);
    println!();
    println!("Preview saved to {}", path.display());
    Ok(())
}

fn print_preview(summary: &RunSummary) {
    println!(
        "{} on {}: {} would change, {} skipped, {} failed, {} pending",
        summary.status,
        summary.provider,
        summary.succeeded,
        summary.skipped,
        summary.failed,
        summary.pending
    );
    let rows = summary
        .preview
        .iter()
        .map(|p| {
            vec![
                p.position.to_string(),
                p.entity_type.to_string(),
                p.entity_id.clone(),
                p.action.to_string(),
                p.status.to_string(),
            ]
        })
        .collect();
    print_table(&["#", "TYPE", "ENTITY", "ACTION", "STATUS"], rows);
    if let Some(message) = &summary.message {
        println!("{message}");
    }
}

// ---------------------------------------------------------------------------
// cancel
// ---------------------------------------------------------------------------

fn cancel(root: &Path, id: Uuid, json: bool) -> anyhow::Result<()> {
    let (_, db) = super::open(root)?;
    let outcome = db.cancel_idle_batch(id, Utc::now())?;
    if json {
        return print_json(&serde_json::json!({ "batch_id": id, "outcome": outcome }));
    }
    match outcome {
        CancelOutcome::AlreadyCancelled => println!("Batch {id} was already cancelled."),
        _ => println!("Cancelled batch {id}. Its checkpoint is kept for resume."),
    }
    Ok(())
}

