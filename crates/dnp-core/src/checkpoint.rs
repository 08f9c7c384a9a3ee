//! Durable progress markers for resumable batches.

use chrono::{DateTime, Utc};
use redb::WriteTransaction;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EnforceError, Result};
use crate::store::{db_err, get_json, put_json, scan_all, EnforcementDb, CHECKPOINTS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCheckpoint {
    pub batch_id: Uuid,
    pub total_items: u32,
    pub processed_items: u32,
    pub failed_items: u32,
    /// Position of the next item to process.
    pub current_position: u32,
    #[serde(default)]
    pub last_successful_item_id: Option<Uuid>,
    /// Opaque adapter resume token.
    #[serde(default)]
    pub checkpoint_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchCheckpoint {
    pub fn new(batch_id: Uuid, total_items: u32, now: DateTime<Utc>) -> Self {
        Self {
            batch_id,
            total_items,
            processed_items: 0,
            failed_items: 0,
            current_position: 0,
            last_successful_item_id: None,
            checkpoint_data: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move past the item at `position` after it reached an outcome.
    pub fn advance(
        &mut self,
        position: u32,
        succeeded_item: Option<Uuid>,
        failed: bool,
        resume_token: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) {
        self.current_position = self.current_position.max(position + 1);
        self.processed_items += 1;
        if failed {
            self.failed_items += 1;
        }
        if let Some(id) = succeeded_item {
            self.last_successful_item_id = Some(id);
        }
        if resume_token.is_some() {
            self.checkpoint_data = resume_token;
        }
        self.updated_at = now;
    }

    /// Step over an item that was already processed in an earlier attempt.
    pub fn skip_past(&mut self, position: u32, now: DateTime<Utc>) {
        if position >= self.current_position {
            self.current_position = position + 1;
            self.updated_at = now;
        }
    }
}

pub(crate) fn save_in(wt: &WriteTransaction, checkpoint: &BatchCheckpoint) -> Result<()> {
    let mut table = wt.open_table(CHECKPOINTS).map_err(db_err)?;
    put_json(&mut table, &checkpoint.batch_id.to_string(), checkpoint)
}

impl EnforcementDb {
    pub fn checkpoint(&self, batch_id: Uuid) -> Result<Option<BatchCheckpoint>> {
        self.read(|rt| {
            let table = rt.open_table(CHECKPOINTS).map_err(db_err)?;
            get_json(&table, &batch_id.to_string())
        })
    }

    pub fn require_checkpoint(&self, batch_id: Uuid) -> Result<BatchCheckpoint> {
        self.checkpoint(batch_id)?
            .ok_or_else(|| EnforceError::CheckpointNotFound(batch_id.to_string()))
    }

    /// Existing checkpoint for the batch, or a fresh one at position 0.
    pub fn checkpoint_or_create(
        &self,
        batch_id: Uuid,
        total_items: u32,
        now: DateTime<Utc>,
    ) -> Result<BatchCheckpoint> {
        self.write(|wt| {
            let mut table = wt.open_table(CHECKPOINTS).map_err(db_err)?;
            let key = batch_id.to_string();
            if let Some(existing) = get_json(&table, &key)? {
                return Ok(existing);
            }
            let checkpoint = BatchCheckpoint::new(batch_id, total_items, now);
            put_json(&mut table, &key, &checkpoint)?;
            Ok(checkpoint)
        })
    }

    pub fn save_checkpoint(&self, checkpoint: &BatchCheckpoint) -> Result<()> {
        self.write(|wt| save_in(wt, checkpoint))
    }

    pub fn delete_checkpoint(&self, batch_id: Uuid) -> Result<bool> {
        self.write(|wt| {
            let mut table = wt.open_table(CHECKPOINTS).map_err(db_err)?;
            let removed = table
                .remove(batch_id.to_string().as_str())
                .map_err(db_err)?
                .is_some();
            Ok(removed)
        })
    }

    pub fn list_checkpoints(&self) -> Result<Vec<BatchCheckpoint>> {
        self.read(|rt| {
            let table = rt.open_table(CHECKPOINTS).map_err(db_err)?;
            Ok(scan_all(&table)?.into_iter().map(|(_, c)| c).collect())
        })
    }
}
