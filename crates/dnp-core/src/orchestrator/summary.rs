use serde::Serialize;
use uuid::Uuid;

use crate::batch::{ActionItem, BatchSummary};
use crate::types::{ActionKind, EntityType, ItemStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    Completed,
    CompletedWithErrors,
    Failed,
    /// Stopped by an open circuit; resumable.
    Paused,
    /// Provider credentials expired; the user must reconnect before resuming.
    ReconnectRequired,
    Cancelled,
}

impl SummaryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SummaryStatus::Completed => "completed",
            SummaryStatus::CompletedWithErrors => "completed_with_errors",
            SummaryStatus::Failed => "failed",
            SummaryStatus::Paused => "paused",
            SummaryStatus::ReconnectRequired => "reconnect_required",
            SummaryStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SummaryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemError {
    pub item_id: Uuid,
    pub entity_id: String,
    pub kind: String,
    pub message: String,
}

/// What a dry run would do to one item.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewEntry {
    pub item_id: Uuid,
    pub position: u32,
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    pub action: ActionKind,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_state: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_state: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&ActionItem> for PreviewEntry {
    fn from(item: &ActionItem) -> Self {
        Self {
            item_id: item.id,
            position: item.position,
            entity_type: item.entity_type,
            entity_id: item.entity_id.clone(),
            entity_name: item.entity_name.clone(),
            action: item.action,
            status: item.status,
            before_state: item.before_state.clone(),
            after_state: item.after_state.clone(),
            reason: item.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub batch_id: Uuid,
    pub provider: String,
    pub status: SummaryStatus,
    pub dry_run: bool,
    pub scanned: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    pub pending: u32,
    pub errors: Vec<ItemError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub preview: Vec<PreviewEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RunSummary {
    pub(crate) fn build(
        batch_id: Uuid,
        provider: &str,
        dry_run: bool,
        status: SummaryStatus,
        items: &[ActionItem],
        message: Option<String>,
    ) -> Self {
        let counts = BatchSummary::from_items(items);
        let errors = items
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .map(|i| ItemError {
                item_id: i.id,
                entity_id: i.entity_id.clone(),
                kind: i.error_kind.clone().unwrap_or_else(|| "unknown".into()),
                message: i.error_message.clone().unwrap_or_default(),
            })
            .collect();
        let preview = if dry_run {
            items.iter().map(PreviewEntry::from).collect()
        } else {
            Vec::new()
        };
        Self {
            batch_id,
            provider: provider.to_string(),
            status,
            dry_run,
            scanned: counts.scanned(),
            succeeded: counts.succeeded,
            failed: counts.failed,
            skipped: counts.skipped,
            pending: counts.pending,
            errors,
            preview,
            message,
        }
    }
}
