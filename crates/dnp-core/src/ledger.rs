//! Append-only record of applied mutations.
//!
//! One run per batch (`run_id` = batch id). Forward entries come from the
//! orchestrator; rollback appends reversal entries to the same run, each
//! pointing at the entry it undid through `reverses`. Nothing is ever
//! rewritten in place. `prune` moves whole runs into the archive table once
//! their newest entry falls outside the rollback window.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapter::MutationOutcome;
use crate::batch::{item_key, ActionBatch, ActionItem};
use crate::checkpoint::{self, BatchCheckpoint};
use crate::error::{EnforceError, Result};
use crate::store::{
    db_err, get_index, get_json, prefix_bounds, put_index, put_json, scan_all, scan_prefix,
    EnforcementDb, ARCHIVED_RUNS, ITEMS, LEDGER, LEDGER_ARCHIVE, LEDGER_KEYS,
};
use crate::types::{ActionKind, EntityType};

// ---------------------------------------------------------------------------
// EnforcementAction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementAction {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Assigned on append; 1-based and strictly increasing within a run.
    pub sequence: u64,
    pub user: String,
    pub provider: String,
    pub item_id: Uuid,
    pub resource_type: EntityType,
    pub resource_id: String,
    #[serde(default)]
    pub resource_name: Option<String>,
    pub action: ActionKind,
    pub previous_state: serde_json::Value,
    #[serde(default)]
    pub resulting_state: serde_json::Value,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverses: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl EnforcementAction {
    /// Forward entry for an item the provider just applied.
    pub fn for_item(
        batch: &ActionBatch,
        item: &ActionItem,
        outcome: &MutationOutcome,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: batch.id,
            sequence: 0,
            user: batch.user.clone(),
            provider: batch.provider.clone(),
            item_id: item.id,
            resource_type: item.entity_type,
            resource_id: item.entity_id.clone(),
            resource_name: item.entity_name.clone(),
            action: item.action,
            previous_state: outcome.before_state.clone(),
            resulting_state: outcome.after_state.clone(),
            idempotency_key: item.idempotency_key.clone(),
            reverses: None,
            created_at: now,
        }
    }

    /// Entry recording that `forward` was undone.
    pub fn reversal_of(forward: &EnforcementAction, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: forward.run_id,
            sequence: 0,
            user: forward.user.clone(),
            provider: forward.provider.clone(),
            item_id: forward.item_id,
            resource_type: forward.resource_type,
            resource_id: forward.resource_id.clone(),
            resource_name: forward.resource_name.clone(),
            action: forward.action.inverse(),
            previous_state: forward.resulting_state.clone(),
            resulting_state: forward.previous_state.clone(),
            idempotency_key: format!("rollback:{}", forward.id),
            reverses: Some(forward.id),
            created_at: now,
        }
    }

    pub fn is_reversal(&self) -> bool {
        self.reverses.is_some()
    }
}

fn ledger_key(run_id: Uuid, sequence: u64) -> String {
    format!("{run_id}:{sequence:010}")
}

/// Append `entry` unless its idempotency key is already recorded, in which
/// case the stored entry is returned and nothing is written.
pub(crate) fn append_in(
    wt: &WriteTransaction,
    mut entry: EnforcementAction,
) -> Result<EnforcementAction> {
    let mut keys = wt.open_table(LEDGER_KEYS).map_err(db_err)?;
    let mut ledger = wt.open_table(LEDGER).map_err(db_err)?;

    if let Some(existing_key) = get_index(&keys, &entry.idempotency_key)? {
        if let Some(existing) = get_json(&ledger, &existing_key)? {
            debug!(key = %entry.idempotency_key, "ledger entry already recorded");
            return Ok(existing);
        }
    }

    let run = entry.run_id.to_string();
    let last_sequence = {
        let (lo, hi) = prefix_bounds(&run);
        let mut range = ledger.range(lo.as_str()..hi.as_str()).map_err(db_err)?;
        match range.next_back() {
            Some(row) => {
                let (_, v) = row.map_err(db_err)?;
                let last: EnforcementAction = serde_json::from_slice(v.value())?;
                last.sequence
            }
            None => 0,
        }
    };
    entry.sequence = last_sequence + 1;

    let key = ledger_key(entry.run_id, entry.sequence);
    put_json(&mut ledger, &key, &entry)?;
    put_index(&mut keys, &entry.idempotency_key, &key)?;
    Ok(entry)
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// One run as seen from the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerRun {
    pub run_id: Uuid,
    pub provider: String,
    pub user: String,
    pub entries: usize,
    pub reversals: usize,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub runs_archived: Vec<Uuid>,
    pub entries_archived: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArchivedRun {
    archived_at: DateTime<Utc>,
    entries: usize,
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

impl EnforcementDb {
    pub fn append_ledger(&self, entry: EnforcementAction) -> Result<EnforcementAction> {
        self.write(|wt| append_in(wt, entry))
    }

    /// Persist one item outcome: the item, the advanced checkpoint and, for
    /// applied mutations, the ledger entry. All or nothing.
    pub(crate) fn commit_item(
        &self,
        item: &ActionItem,
        checkpoint: &BatchCheckpoint,
        entry: Option<EnforcementAction>,
    ) -> Result<Option<EnforcementAction>> {
        self.write(|wt| {
            let recorded = match entry {
                Some(entry) => Some(append_in(wt, entry)?),
                None => None,
            };
            {
                let mut items = wt.open_table(ITEMS).map_err(db_err)?;
                put_json(&mut items, &item_key(item.batch_id, item.position), item)?;
            }
            checkpoint::save_in(wt, checkpoint)?;
            Ok(recorded)
        })
    }

    /// Active entries of a run in sequence order.
    pub fn ledger_entries(&self, run_id: Uuid) -> Result<Vec<EnforcementAction>> {
        self.read(|rt| {
            let table = rt.open_table(LEDGER).map_err(db_err)?;
            Ok(scan_prefix(&table, &run_id.to_string())?
                .into_iter()
                .map(|(_, e)| e)
                .collect())
        })
    }

    pub fn archived_entries(&self, run_id: Uuid) -> Result<Vec<EnforcementAction>> {
        self.read(|rt| {
            let table = rt.open_table(LEDGER_ARCHIVE).map_err(db_err)?;
            Ok(scan_prefix(&table, &run_id.to_string())?
                .into_iter()
                .map(|(_, e)| e)
                .collect())
        })
    }

    pub fn is_run_archived(&self, run_id: Uuid) -> Result<bool> {
        self.read(|rt| {
            let table = rt.open_table(ARCHIVED_RUNS).map_err(db_err)?;
            Ok(table
                .get(run_id.to_string().as_str())
                .map_err(db_err)?
                .is_some())
        })
    }

    /// Runs with active ledger entries, newest activity first.
    pub fn ledger_runs(&self) -> Result<Vec<LedgerRun>> {
        let entries: Vec<EnforcementAction> = self.read(|rt| {
            let table = rt.open_table(LEDGER).map_err(db_err)?;
            Ok(scan_all(&table)?.into_iter().map(|(_, e)| e).collect())
        })?;

        let mut runs: BTreeMap<Uuid, LedgerRun> = BTreeMap::new();
        for e in entries {
            let run = runs.entry(e.run_id).or_insert_with(|| LedgerRun {
                run_id: e.run_id,
                provider: e.provider.clone(),
                user: e.user.clone(),
                entries: 0,
                reversals: 0,
                first_at: e.created_at,
                last_at: e.created_at,
            });
            run.entries += 1;
            if e.is_reversal() {
                run.reversals += 1;
            }
            run.first_at = run.first_at.min(e.created_at);
            run.last_at = run.last_at.max(e.created_at);
        }
        let mut out: Vec<LedgerRun> = runs.into_values().collect();
        out.sort_by(|a, b| b.last_at.cmp(&a.last_at));
        Ok(out)
    }

    /// Archive every run whose newest entry is older than `cutoff`.
    pub fn prune_ledger(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<PruneReport> {
        let report = self.write(|wt| {
            let mut ledger = wt.open_table(LEDGER).map_err(db_err)?;
            let mut archive = wt.open_table(LEDGER_ARCHIVE).map_err(db_err)?;
            let mut keys = wt.open_table(LEDGER_KEYS).map_err(db_err)?;
            let mut archived_runs = wt.open_table(ARCHIVED_RUNS).map_err(db_err)?;

            let rows: Vec<(String, EnforcementAction)> = scan_all(&ledger)?;
            let mut newest: BTreeMap<Uuid, DateTime<Utc>> = BTreeMap::new();
            for (_, e) in &rows {
                let at = newest.entry(e.run_id).or_insert(e.created_at);
                *at = (*at).max(e.created_at);
            }

            let mut report = PruneReport::default();
            for (run_id, last_at) in newest {
                if last_at >= cutoff {
                    continue;
                }
                let mut count = 0;
                for (key, entry) in rows.iter().filter(|(_, e)| e.run_id == run_id) {
                    put_json(&mut archive, key, entry)?;
                    ledger.remove(key.as_str()).map_err(db_err)?;
                    keys.remove(entry.idempotency_key.as_str())
                        .map_err(db_err)?;
                    count += 1;
                }
                put_json(
                    &mut archived_runs,
                    &run_id.to_string(),
                    &ArchivedRun {
                        archived_at: now,
                        entries: count,
                    },
                )?;
                report.entries_archived += count;
                report.runs_archived.push(run_id);
            }
            Ok(report)
        })?;

        if !report.runs_archived.is_empty() {
            info!(
                runs = report.runs_archived.len(),
                entries = report.entries_archived,
                "ledger pruned"
            );
        }
        Ok(report)
    }

    /// Fail with the matching error when a run cannot be rolled back at all.
    pub(crate) fn check_run_rollbackable(&self, run_id: Uuid) -> Result<Vec<EnforcementAction>> {
        let entries = self.ledger_entries(run_id)?;
        if !entries.is_empty() {
            return Ok(entries);
        }
        if self.is_run_archived(run_id)? {
            return Err(EnforceError::RollbackExpired(run_id.to_string()));
        }
        Err(EnforceError::RunNotFound(run_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
