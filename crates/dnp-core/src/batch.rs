//! Action batches and their items.
//!
//! A batch is submitted once, with every item materialized up front, so a
//! resumed run only needs the checkpoint position to know where to continue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EnforceError, Result};
use crate::paths;
use crate::store::{
    db_err, get_index, get_json, put_index, put_json, scan_all, scan_prefix, EnforcementDb,
    BATCHES, BATCH_KEYS, CHECKPOINTS, ITEMS, ITEM_KEYS,
};
use crate::types::{ActionKind, BatchStatus, EntityType, HaltReason, ItemStatus};

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Enforcement policy chosen by the planner. Carried, never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggressiveness: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collaboration_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSubmission {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    #[serde(default)]
    pub collaborative: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSubmission {
    pub user: String,
    pub provider: String,
    pub idempotency_key: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub options: BatchOptions,
    pub action_items: Vec<ItemSubmission>,
}

impl BatchSubmission {
    pub fn validate(&self) -> Result<()> {
        paths::validate_provider(&self.provider)?;
        if self.user.trim().is_empty() {
            return Err(EnforceError::InvalidSubmission("user is empty".into()));
        }
        if self.idempotency_key.trim().is_empty() {
            return Err(EnforceError::InvalidSubmission(
                "idempotency_key is empty".into(),
            ));
        }
        for (i, item) in self.action_items.iter().enumerate() {
            if item.entity_id.trim().is_empty() {
                return Err(EnforceError::InvalidSubmission(format!(
                    "action_items[{i}] has an empty entity_id"
                )));
            }
            if !item.action.is_forward() {
                return Err(EnforceError::InvalidSubmission(format!(
                    "action_items[{i}] uses '{}', which is only valid as a rollback",
                    item.action
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BatchSummary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    pub pending: u32,
}

impl BatchSummary {
    pub fn from_items(items: &[ActionItem]) -> Self {
        let mut summary = Self {
            total: items.len() as u32,
            ..Self::default()
        };
        for item in items {
            match item.status {
                ItemStatus::Succeeded => summary.succeeded += 1,
                ItemStatus::Failed => summary.failed += 1,
                ItemStatus::Skipped => summary.skipped += 1,
                ItemStatus::Pending => summary.pending += 1,
            }
        }
        summary
    }

    /// Items that reached an outcome.
    pub fn scanned(&self) -> u32 {
        self.succeeded + self.failed + self.skipped
    }
}

// ---------------------------------------------------------------------------
// ActionBatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionBatch {
    pub id: Uuid,
    pub user: String,
    pub provider: String,
    pub idempotency_key: String,
    pub dry_run: bool,
    #[serde(default)]
    pub options: BatchOptions,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<HaltReason>,
    #[serde(default)]
    pub summary: BatchSummary,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ActionBatch {
    /// Apply a status change, enforcing forward-only movement.
    pub(crate) fn transition(
        &mut self,
        next: BatchStatus,
        halt_reason: Option<HaltReason>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EnforceError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
                reason: "batch status only moves forward".into(),
            });
        }
        if next == BatchStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() && next != BatchStatus::Cancelled {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.halt_reason = halt_reason;
        self.updated_at = now;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ActionItem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: Uuid,
    pub batch_id: Uuid,
    /// 0-based submission index; the only thing a checkpoint refers to.
    pub position: u32,
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(default)]
    pub entity_name: Option<String>,
    #[serde(default)]
    pub collaborative: bool,
    pub action: ActionKind,
    pub idempotency_key: String,
    #[serde(default)]
    pub before_state: Option<serde_json::Value>,
    #[serde(default)]
    pub after_state: Option<serde_json::Value>,
    pub status: ItemStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    /// `ProviderError::kind` of the last failure, or `"unsupported"`.
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl ActionItem {
    pub(crate) fn succeed(
        &mut self,
        before: serde_json::Value,
        after: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        self.status = ItemStatus::Succeeded;
        self.before_state = Some(before);
        self.after_state = Some(after);
        self.error_message = None;
        self.error_kind = None;
        self.updated_at = now;
    }

    pub(crate) fn fail(&mut self, kind: &str, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = ItemStatus::Failed;
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(message.into());
        self.updated_at = now;
    }

    pub(crate) fn skip(&mut self, kind: &str, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = ItemStatus::Skipped;
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(reason.into());
        self.updated_at = now;
    }
}

pub(crate) fn item_key(batch_id: Uuid, position: u32) -> String {
    format!("{batch_id}:{position:08}")
}

fn item_unique_key(batch_id: Uuid, item: &ItemSubmission, idempotency_key: &str) -> String {
    format!(
        "{batch_id}|{}|{}|{}|{idempotency_key}",
        item.entity_type, item.entity_id, item.action
    )
}

// ---------------------------------------------------------------------------
// SubmitOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub batch: ActionBatch,
    /// `false` when the idempotency key matched an existing batch.
    pub created: bool,
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

impl EnforcementDb {
    /// Create a batch and all its items, or return the batch that already
    /// owns `submission.idempotency_key`.
    ///
    /// Items that repeat the same (entity_type, entity_id, action) collapse
    /// into the first occurrence.
    pub fn submit_batch(
        &self,
        submission: &BatchSubmission,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        submission.validate()?;

        self.write(|wt| {
            let mut keys = wt.open_table(BATCH_KEYS).map_err(db_err)?;
            let mut batches = wt.open_table(BATCHES).map_err(db_err)?;

            if let Some(existing_id) = get_index(&keys, &submission.idempotency_key)? {
                let batch: ActionBatch = get_json(&batches, &existing_id)?
                    .ok_or_else(|| EnforceError::BatchNotFound(existing_id.clone()))?;
                debug!(batch_id = %batch.id, key = %submission.idempotency_key, "duplicate submission");
                return Ok(SubmitOutcome {
                    batch,
                    created: false,
                });
            }

            let batch_id = Uuid::new_v4();
            let mut items = wt.open_table(ITEMS).map_err(db_err)?;
            let mut item_keys = wt.open_table(ITEM_KEYS).map_err(db_err)?;

            let mut position = 0u32;
            for sub in &submission.action_items {
                let idempotency_key = format!(
                    "{}:{}:{}:{}",
                    submission.idempotency_key, sub.entity_type, sub.entity_id, sub.action
                );
                let unique = item_unique_key(batch_id, sub, &idempotency_key);
                if get_index(&item_keys, &unique)?.is_some() {
                    debug!(%batch_id, entity_id = %sub.entity_id, action = %sub.action, "duplicate item dropped");
                    continue;
                }
                let item = ActionItem {
                    id: Uuid::new_v4(),
                    batch_id,
                    position,
                    entity_type: sub.entity_type,
                    entity_id: sub.entity_id.clone(),
                    entity_name: sub.entity_name.clone(),
                    collaborative: sub.collaborative,
                    action: sub.action,
                    idempotency_key,
                    before_state: None,
                    after_state: None,
                    status: ItemStatus::Pending,
                    error_message: None,
                    error_kind: None,
                    attempts: 0,
                    updated_at: now,
                };
                let key = item_key(batch_id, position);
                put_json(&mut items, &key, &item)?;
                put_index(&mut item_keys, &unique, &key)?;
                position += 1;
            }

            let batch = ActionBatch {
                id: batch_id,
                user: submission.user.clone(),
                provider: submission.provider.clone(),
                idempotency_key: submission.idempotency_key.clone(),
                dry_run: submission.dry_run,
                options: submission.options.clone(),
                status: BatchStatus::Pending,
                halt_reason: None,
                summary: BatchSummary {
                    total: position,
                    pending: position,
                    ..BatchSummary::default()
                },
                created_at: now,
                started_at: None,
                completed_at: None,
                updated_at: now,
            };
            let id = batch_id.to_string();
            put_json(&mut batches, &id, &batch)?;
            put_index(&mut keys, &submission.idempotency_key, &id)?;

            info!(%batch_id, provider = %batch.provider, items = position, dry_run = batch.dry_run, "batch submitted");
            Ok(SubmitOutcome {
                batch,
                created: true,
            })
        })
    }

    pub fn get_batch(&self, batch_id: Uuid) -> Result<ActionBatch> {
        self.read(|rt| {
            let batches = rt.open_table(BATCHES).map_err(db_err)?;
            get_json(&batches, &batch_id.to_string())?
                .ok_or_else(|| EnforceError::BatchNotFound(batch_id.to_string()))
        })
    }

    pub fn find_batch_by_key(&self, idempotency_key: &str) -> Result<Option<ActionBatch>> {
        self.read(|rt| {
            let keys = rt.open_table(BATCH_KEYS).map_err(db_err)?;
            let Some(id) = get_index(&keys, idempotency_key)? else {
                return Ok(None);
            };
            let batches = rt.open_table(BATCHES).map_err(db_err)?;
            get_json(&batches, &id)
        })
    }

    /// All batches, newest first.
    pub fn list_batches(&self) -> Result<Vec<ActionBatch>> {
        let mut batches: Vec<ActionBatch> = self.read(|rt| {
            let table = rt.open_table(BATCHES).map_err(db_err)?;
            Ok(scan_all(&table)?.into_iter().map(|(_, b)| b).collect())
        })?;
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(batches)
    }

    /// Items of a batch in submission order.
    pub fn items(&self, batch_id: Uuid) -> Result<Vec<ActionItem>> {
        self.read(|rt| {
            let table = rt.open_table(ITEMS).map_err(db_err)?;
            Ok(scan_prefix(&table, &batch_id.to_string())?
                .into_iter()
                .map(|(_, item)| item)
                .collect())
        })
    }

    pub fn put_item(&self, item: &ActionItem) -> Result<()> {
        self.write(|wt| {
            let mut table = wt.open_table(ITEMS).map_err(db_err)?;
            put_json(&mut table, &item_key(item.batch_id, item.position), item)
        })
    }

    /// Move a batch to `next`, rejecting regressions.
    pub fn transition_batch(
        &self,
        batch_id: Uuid,
        next: BatchStatus,
        halt_reason: Option<HaltReason>,
        now: DateTime<Utc>,
    ) -> Result<ActionBatch> {
        self.write(|wt| {
            let mut batches = wt.open_table(BATCHES).map_err(db_err)?;
            let id = batch_id.to_string();
            let mut batch: ActionBatch = get_json(&batches, &id)?
                .ok_or_else(|| EnforceError::BatchNotFound(id.clone()))?;
            batch.transition(next, halt_reason, now)?;
            put_json(&mut batches, &id, &batch)?;
            Ok(batch)
        })
    }

    /// Store status, halt reason and counts for a batch that stopped short
    /// of its last item. The checkpoint is left in place.
    pub(crate) fn halt_batch(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        halt_reason: HaltReason,
        summary: BatchSummary,
        now: DateTime<Utc>,
    ) -> Result<ActionBatch> {
        self.write(|wt| {
            let mut batches = wt.open_table(BATCHES).map_err(db_err)?;
            let id = batch_id.to_string();
            let mut batch: ActionBatch = get_json(&batches, &id)?
                .ok_or_else(|| EnforceError::BatchNotFound(id.clone()))?;
            batch.transition(status, Some(halt_reason), now)?;
            batch.summary = summary;
            put_json(&mut batches, &id, &batch)?;
            Ok(batch)
        })
    }

    /// Record the final status and counts and drop the checkpoint, in one
    /// transaction.
    pub(crate) fn finish_batch(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        summary: BatchSummary,
        now: DateTime<Utc>,
    ) -> Result<ActionBatch> {
        self.write(|wt| {
            let mut batches = wt.open_table(BATCHES).map_err(db_err)?;
            let id = batch_id.to_string();
            let mut batch: ActionBatch = get_json(&batches, &id)?
                .ok_or_else(|| EnforceError::BatchNotFound(id.clone()))?;
            batch.transition(status, None, now)?;
            batch.summary = summary;
            put_json(&mut batches, &id, &batch)?;

            let mut checkpoints = wt.open_table(CHECKPOINTS).map_err(db_err)?;
            checkpoints.remove(id.as_str()).map_err(db_err)?;
            Ok(batch)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
