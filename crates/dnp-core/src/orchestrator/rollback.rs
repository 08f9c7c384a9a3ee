use std::collections::HashSet;
use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::Orchestrator;
use crate::adapter::{ProviderAdapter, ProviderError};
use crate::error::{EnforceError, Result};
use crate::ledger::EnforcementAction;
use crate::rate_limit::Acquire;
use crate::types::ActionKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "resource_ids", rename_all = "snake_case")]
pub enum RollbackScope {
    Full,
    /// Only entries whose `resource_id` is listed.
    Partial(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackItemStatus {
    Reversed,
    Expired,
    AlreadyRolledBack,
    NotFound,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackItem {
    pub resource_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionKind>,
    pub status: RollbackItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub run_id: Uuid,
    pub provider: String,
    pub items: Vec<RollbackItem>,
}

impl RollbackReport {
    pub fn count(&self, status: RollbackItemStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }
}

impl Orchestrator {
    /// Undo the forward entries of a run, newest first.
    ///
    /// Outcomes are reported per resource. Only an unknown or archived run,
    /// or one this process is still driving, fails the whole call. A halted
    /// run may be rolled back; the batch stays claimed until the rollback
    /// ends. A cancel request stops it before the next entry, and entries
    /// not reached are left out of the report.
    pub async fn rollback(&self, run_id: Uuid, scope: RollbackScope) -> Result<RollbackReport> {
        let (cancel, _guard) = self.claim(run_id)?;
        let entries = self.db.check_run_rollbackable(run_id)?;
        let reversed: HashSet<Uuid> = entries.iter().filter_map(|e| e.reverses).collect();
        let mut forwards: Vec<&EnforcementAction> =
            entries.iter().filter(|e| !e.is_reversal()).collect();
        forwards.sort_by(|a, b| b.sequence.cmp(&a.sequence));

        let provider = entries
            .first()
            .map(|e| e.provider.clone())
            .ok_or_else(|| EnforceError::RunNotFound(run_id.to_string()))?;
        let mut report = RollbackReport {
            run_id,
            provider: provider.clone(),
            items: Vec::new(),
        };

        if let RollbackScope::Partial(ids) = &scope {
            let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
            for id in ids {
                if !forwards.iter().any(|e| &e.resource_id == id) {
                    report.items.push(RollbackItem {
                        resource_id: id.clone(),
                        entry_id: None,
                        action: None,
                        status: RollbackItemStatus::NotFound,
                        message: None,
                    });
                }
            }
            forwards.retain(|e| wanted.contains(e.resource_id.as_str()));
        }

        let adapter = self.adapters.get(&provider)?;
        let window = self.config.ledger.rollback_window();

        for entry in forwards {
            if cancel.load(Ordering::SeqCst) {
                warn!(%run_id, "rollback cancelled");
                break;
            }
            let mut item = RollbackItem {
                resource_id: entry.resource_id.clone(),
                entry_id: Some(entry.id),
                action: Some(entry.action.inverse()),
                status: RollbackItemStatus::Reversed,
                message: None,
            };
            if reversed.contains(&entry.id) {
                item.status = RollbackItemStatus::AlreadyRolledBack;
            } else if self.clock.now() - entry.created_at > window {
                item.status = RollbackItemStatus::Expired;
            } else if let Err(message) = self.reverse_entry(adapter.as_ref(), entry).await? {
                item.status = RollbackItemStatus::Failed;
                item.message = Some(message);
            }
            report.items.push(item);
        }

        info!(
            %run_id,
            provider = %provider,
            reversed = report.count(RollbackItemStatus::Reversed),
            failed = report.count(RollbackItemStatus::Failed),
            "rollback finished"
        );
        Ok(report)
    }

    /// Issue the inverse call for one entry and record the reversal.
    /// The inner `Err` is a per-item failure message.
    async fn reverse_entry(
        &self,
        adapter: &dyn ProviderAdapter,
        entry: &EnforcementAction,
    ) -> Result<std::result::Result<(), String>> {
        let provider = entry.provider.as_str();
        let settings = self.config.orchestrator;
        let mut transient_retries = 0u32;
        let mut rate_limit_retries = 0u32;

        loop {
            if !self.breaker.allow(provider)? {
                return Ok(Err(format!("circuit open for {provider}")));
            }
            if let Acquire::RetryAfter(wait) = self.limiter.acquire(provider)? {
                self.clock.sleep(wait).await;
                continue;
            }

            let result = {
                let slots = self.slots_for(provider);
                let _permit = slots
                    .acquire_owned()
                    .await
                    .map_err(|e| EnforceError::Worker(e.to_string()))?;
                let timeout = settings.call_timeout();
                match tokio::time::timeout(timeout, adapter.execute_inverse(entry)).await {
                    Ok(r) => r,
                    Err(_) => Err(ProviderError::Transient(format!(
                        "call timed out after {}s",
                        timeout.as_secs()
                    ))),
                }
            };

            let error = match result {
                Ok(()) => {
                    self.db
                        .append_ledger(EnforcementAction::reversal_of(entry, self.clock.now()))?;
                    self.limiter.record_success(provider)?;
                    self.breaker.record_success(provider)?;
                    return Ok(Ok(()));
                }
                Err(e) => e,
            };

            match error {
                ProviderError::RateLimited { retry_after } => {
                    self.limiter.record_failure(provider, retry_after)?;
                    rate_limit_retries += 1;
                    if rate_limit_retries > settings.max_rate_limit_retries {
                        return Ok(Err(error.to_string()));
                    }
                }
                ProviderError::Transient(_) => {
                    self.limiter.record_failure(provider, None)?;
                    self.breaker.record_failure(provider)?;
                    transient_retries += 1;
                    if transient_retries > settings.max_item_retries {
                        return Ok(Err(error.to_string()));
                    }
                    self.clock.sleep(settings.retry_delay()).await;
                }
                ProviderError::AuthExpired(_) => {
                    self.breaker.record_failure(provider)?;
                    return Ok(Err(error.to_string()));
                }
                ProviderError::PermissionDenied(_) | ProviderError::Permanent(_) => {
                    warn!(provider, resource_id = %entry.resource_id, "rollback of entry failed: {error}");
                    return Ok(Err(error.to_string()));
                }
            }
        }
    }
}
