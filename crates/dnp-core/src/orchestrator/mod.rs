//! Enforcement orchestrator.
//!
//! Drives one batch at a time through its items in submission order. Every
//! provider call is gated by the circuit breaker, the rate limiter and a
//! per-provider concurrency permit. Each item outcome is committed together
//! with its ledger entry and the advanced checkpoint, so a crashed run
//! resumes exactly where it stopped.

mod rollback;
mod summary;

pub use rollback::{RollbackItem, RollbackItemStatus, RollbackReport, RollbackScope};
pub use summary::{ItemError, PreviewEntry, RunSummary, SummaryStatus};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{AbstractAction, AdapterRegistry, MutationOutcome, ProviderAdapter, ProviderError};
use crate::batch::{ActionBatch, ActionItem, BatchSubmission, BatchSummary, SubmitOutcome};
use crate::checkpoint::BatchCheckpoint;
use crate::circuit::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{EnforceError, Result};
use crate::ledger::EnforcementAction;
use crate::rate_limit::{Acquire, RateLimiter};
use crate::store::EnforcementDb;
use crate::types::{ActionKind, BatchStatus, HaltReason, ItemStatus};

type CallResult = std::result::Result<MutationOutcome, ProviderError>;

/// Result of [`Orchestrator::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The batch is running in this process and will stop before its next item.
    Signalled,
    /// The batch was idle and is now `cancelled`.
    Cancelled,
    AlreadyCancelled,
}

enum ItemFlow {
    Done,
    Halt(HaltReason, Option<String>),
}

pub struct Orchestrator {
    db: Arc<EnforcementDb>,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    adapters: AdapterRegistry,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    active: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

/// Removes a batch from the active set when its run ends, however it ends.
pub(crate) struct ActiveGuard<'a> {
    orchestrator: &'a Orchestrator,
    batch_id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.batch_id);
    }
}

impl Orchestrator {
    pub fn new(db: Arc<EnforcementDb>, config: Arc<Config>, adapters: AdapterRegistry) -> Self {
        Self::with_clock(db, config, adapters, Arc::new(SystemClock))
    }

    pub fn with_clock(
        db: Arc<EnforcementDb>,
        config: Arc<Config>,
        adapters: AdapterRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(db.clone(), clock.clone(), config.clone()),
            breaker: CircuitBreaker::new(db.clone(), clock.clone(), config.clone()),
            db,
            config,
            clock,
            adapters,
            slots: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &EnforcementDb {
        &self.db
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn submit(&self, submission: &BatchSubmission) -> Result<SubmitOutcome> {
        self.db.submit_batch(submission, self.clock.now())
    }

    /// Whether `batch_id` is being driven by this process right now.
    pub fn is_active(&self, batch_id: Uuid) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&batch_id)
    }

    // -----------------------------------------------------------------------
    // Run / resume / cancel
    // -----------------------------------------------------------------------

    /// Process a pending or halted batch until it finishes or halts.
    pub async fn run(&self, batch_id: Uuid) -> Result<RunSummary> {
        self.drive(batch_id, false).await
    }

    /// Like [`run`](Self::run), but also picks a cancelled batch back up
    /// from its checkpoint.
    pub async fn resume(&self, batch_id: Uuid) -> Result<RunSummary> {
        self.drive(batch_id, true).await
    }

    /// Run several batches as independent tasks. Results are returned in
    /// the order of `batch_ids`.
    pub async fn run_many(
        self: &Arc<Self>,
        batch_ids: Vec<Uuid>,
    ) -> Vec<(Uuid, Result<RunSummary>)> {
        let handles = batch_ids.iter().map(|&id| {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run(id).await })
        });
        let joined = futures::future::join_all(handles).await;
        batch_ids
            .into_iter()
            .zip(joined)
            .map(|(id, res)| {
                let res = res.unwrap_or_else(|e| Err(EnforceError::Worker(e.to_string())));
                (id, res)
            })
            .collect()
    }

    /// Stop a batch. A batch running in this process finishes its in-flight
    /// item and stops; an idle one is marked cancelled directly. The
    /// checkpoint is kept either way.
    pub fn cancel(&self, batch_id: Uuid) -> Result<CancelOutcome> {
        if let Some(flag) = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&batch_id)
        {
            flag.store(true, Ordering::SeqCst);
            info!(%batch_id, "cancellation requested");
            return Ok(CancelOutcome::Signalled);
        }
        self.db.cancel_idle_batch(batch_id, self.clock.now())
    }

    /// Mark `batch_id` as driven by this process until the guard drops.
    /// Forward runs and rollbacks of the same batch exclude each other.
    pub(crate) fn claim(&self, batch_id: Uuid) -> Result<(Arc<AtomicBool>, ActiveGuard<'_>)> {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.contains_key(&batch_id) {
            return Err(EnforceError::BatchAlreadyRunning(batch_id.to_string()));
        }
        active.insert(batch_id, cancel.clone());
        Ok((
            cancel,
            ActiveGuard {
                orchestrator: self,
                batch_id,
            },
        ))
    }

    async fn drive(&self, batch_id: Uuid, allow_cancelled: bool) -> Result<RunSummary> {
        let batch = self.db.get_batch(batch_id)?;
        match batch.status {
            BatchStatus::Completed | BatchStatus::Failed => {
                return Err(EnforceError::BatchTerminal(batch_id.to_string()))
            }
            BatchStatus::Cancelled if !allow_cancelled => {
                return Err(EnforceError::BatchTerminal(batch_id.to_string()))
            }
            _ => {}
        }
        let adapter = self.adapters.get(&batch.provider)?;
        let (cancel, _guard) = self.claim(batch_id)?;

        let mut items = self.db.items(batch_id)?;
        let now = self.clock.now();
        let mut checkpoint = self
            .db
            .checkpoint_or_create(batch_id, items.len() as u32, now)?;
        let batch = self
            .db
            .transition_batch(batch_id, BatchStatus::Running, None, now)?;
        info!(
            %batch_id,
            provider = %batch.provider,
            position = checkpoint.current_position,
            total = items.len(),
            dry_run = batch.dry_run,
            "batch started"
        );

        let halt = self
            .process_items(&batch, adapter, &mut items, &mut checkpoint, &cancel)
            .await?;
        self.conclude(&batch, &items, &checkpoint, halt)
    }

    async fn process_items(
        &self,
        batch: &ActionBatch,
        adapter: Arc<dyn ProviderAdapter>,
        items: &mut [ActionItem],
        checkpoint: &mut BatchCheckpoint,
        cancel: &AtomicBool,
    ) -> Result<Option<(HaltReason, Option<String>)>> {
        let capabilities = adapter.capabilities().clone();
        let mut applied: HashMap<ActionKind, usize> = HashMap::new();
        let start = checkpoint.current_position as usize;

        for item in items.iter_mut().skip(start) {
            if cancel.load(Ordering::SeqCst) {
                return Ok(Some((HaltReason::Cancelled, None)));
            }
            if item.status != ItemStatus::Pending {
                checkpoint.skip_past(item.position, self.clock.now());
                continue;
            }

            if let Some(reason) = capabilities.unsupported_reason(item) {
                let now = self.clock.now();
                debug!(batch_id = %batch.id, position = item.position, %reason, "item skipped");
                item.skip("unsupported", reason, now);
                checkpoint.advance(item.position, None, false, None, now);
                self.db.commit_item(item, checkpoint, None)?;
                continue;
            }

            match self
                .process_item(batch, adapter.as_ref(), item, checkpoint, cancel)
                .await?
            {
                ItemFlow::Done => {}
                ItemFlow::Halt(reason, message) => return Ok(Some((reason, message))),
            }

            if item.status == ItemStatus::Succeeded {
                let tuning = self.config.tuning_for(&batch.provider, item.action);
                let size = tuning.max_batch_size.min(capabilities.max_batch_size).max(1);
                let count = applied.entry(item.action).or_insert(0);
                *count += 1;
                if *count % size == 0 && tuning.delay_ms > 0 {
                    debug!(batch_id = %batch.id, delay_ms = tuning.delay_ms, "pacing pause");
                    self.clock
                        .sleep(std::time::Duration::from_millis(tuning.delay_ms))
                        .await;
                }
            }
        }
        Ok(None)
    }

    /// Drive one item to an outcome, retrying as its failures allow.
    async fn process_item(
        &self,
        batch: &ActionBatch,
        adapter: &dyn ProviderAdapter,
        item: &mut ActionItem,
        checkpoint: &mut BatchCheckpoint,
        cancel: &AtomicBool,
    ) -> Result<ItemFlow> {
        let provider = batch.provider.as_str();
        let settings = self.config.orchestrator;
        let dry_run = batch.dry_run;
        let mut transient_retries = 0u32;
        let mut rate_limit_retries = 0u32;

        loop {
            // A dry run reads the live gates but never moves them.
            let allowed = if dry_run {
                self.breaker.peek_allow(provider)?
            } else {
                self.breaker.allow(provider)?
            };
            if !allowed {
                self.db.save_checkpoint(checkpoint)?;
                warn!(batch_id = %batch.id, provider, position = item.position, "circuit open, pausing batch");
                return Ok(ItemFlow::Halt(HaltReason::CircuitOpen, None));
            }
            let permit = if dry_run {
                self.limiter.peek(provider)?
            } else {
                self.limiter.acquire(provider)?
            };
            if let Acquire::RetryAfter(wait) = permit {
                self.clock.sleep(wait).await;
                if cancel.load(Ordering::SeqCst) {
                    return Ok(ItemFlow::Halt(HaltReason::Cancelled, None));
                }
                continue;
            }

            item.attempts += 1;
            let action =
                AbstractAction::from_item(batch, item, checkpoint.checkpoint_data.clone());
            let result = self.call(adapter, &action, dry_run).await?;
            let now = self.clock.now();

            let error = match result {
                Ok(outcome) => {
                    item.succeed(outcome.before_state.clone(), outcome.after_state.clone(), now);
                    let entry = (!dry_run)
                        .then(|| EnforcementAction::for_item(batch, item, &outcome, now));
                    checkpoint.advance(
                        item.position,
                        Some(item.id),
                        false,
                        outcome.resume_token.clone(),
                        now,
                    );
                    self.db.commit_item(item, checkpoint, entry)?;
                    if !dry_run {
                        self.limiter.record_success(provider)?;
                        self.breaker.record_success(provider)?;
                    }
                    debug!(batch_id = %batch.id, position = item.position, entity_id = %item.entity_id, "item applied");
                    return Ok(ItemFlow::Done);
                }
                Err(e) => e,
            };

            debug!(
                batch_id = %batch.id,
                position = item.position,
                kind = error.kind(),
                attempt = item.attempts,
                "provider call failed: {error}"
            );
            match error {
                ProviderError::RateLimited { retry_after } => {
                    if !dry_run {
                        self.limiter.record_failure(provider, retry_after)?;
                    }
                    rate_limit_retries += 1;
                    if rate_limit_retries > settings.max_rate_limit_retries {
                        self.fail_item(item, checkpoint, &error)?;
                        return Ok(ItemFlow::Done);
                    }
                    if dry_run {
                        // no stored backoff to wait on
                        self.clock
                            .sleep(retry_after.unwrap_or_else(|| settings.retry_delay()))
                            .await;
                    }
                }
                ProviderError::Transient(_) => {
                    if !dry_run {
                        self.limiter.record_failure(provider, None)?;
                        self.breaker.record_failure(provider)?;
                    }
                    transient_retries += 1;
                    if transient_retries > settings.max_item_retries {
                        self.fail_item(item, checkpoint, &error)?;
                        return Ok(ItemFlow::Done);
                    }
                    self.clock.sleep(settings.retry_delay()).await;
                    if cancel.load(Ordering::SeqCst) {
                        self.db.put_item(item)?;
                        return Ok(ItemFlow::Halt(HaltReason::Cancelled, None));
                    }
                }
                ProviderError::AuthExpired(ref message) => {
                    if !dry_run {
                        self.breaker.record_failure(provider)?;
                    }
                    item.error_kind = Some(error.kind().to_string());
                    item.error_message = Some(message.clone());
                    item.updated_at = now;
                    self.db.commit_item(item, checkpoint, None)?;
                    warn!(batch_id = %batch.id, provider, "provider credentials expired");
                    return Ok(ItemFlow::Halt(
                        HaltReason::ReconnectRequired,
                        Some(format!(
                            "{provider} authorization expired; reconnect the account and resume batch {}",
                            batch.id
                        )),
                    ));
                }
                ProviderError::PermissionDenied(ref reason) => {
                    item.skip(error.kind(), reason.clone(), now);
                    checkpoint.advance(item.position, None, false, None, now);
                    self.db.commit_item(item, checkpoint, None)?;
                    return Ok(ItemFlow::Done);
                }
                ProviderError::Permanent(_) => {
                    self.fail_item(item, checkpoint, &error)?;
                    return Ok(ItemFlow::Done);
                }
            }
        }
    }

    fn fail_item(
        &self,
        item: &mut ActionItem,
        checkpoint: &mut BatchCheckpoint,
        error: &ProviderError,
    ) -> Result<()> {
        let now = self.clock.now();
        warn!(
            batch_id = %item.batch_id,
            position = item.position,
            entity_id = %item.entity_id,
            kind = error.kind(),
            "item failed"
        );
        item.fail(error.kind(), error.to_string(), now);
        checkpoint.advance(item.position, None, true, None, now);
        self.db.commit_item(item, checkpoint, None)?;
        Ok(())
    }

    /// One provider call under the concurrency permit and timeout. A timeout
    /// is reported as a transient failure.
    async fn call(
        &self,
        adapter: &dyn ProviderAdapter,
        action: &AbstractAction,
        dry_run: bool,
    ) -> Result<CallResult> {
        let slots = self.slots_for(adapter.provider());
        let _permit = slots
            .acquire_owned()
            .await
            .map_err(|e| EnforceError::Worker(e.to_string()))?;
        let timeout = self.config.orchestrator.call_timeout();
        let call = if dry_run {
            adapter.preview(action)
        } else {
            adapter.execute(action)
        };
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => Ok(result),
            Err(_) => Ok(Err(ProviderError::Transient(format!(
                "call timed out after {}s",
                timeout.as_secs()
            )))),
        }
    }

    pub(crate) fn slots_for(&self, provider: &str) -> Arc<Semaphore> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(Semaphore::new(
                    self.config.orchestrator.provider_concurrency.max(1),
                ))
            })
            .clone()
    }

    fn conclude(
        &self,
        batch: &ActionBatch,
        items: &[ActionItem],
        checkpoint: &BatchCheckpoint,
        halt: Option<(HaltReason, Option<String>)>,
    ) -> Result<RunSummary> {
        let now = self.clock.now();
        let counts = BatchSummary::from_items(items);
        let summary = |status, message| {
            RunSummary::build(batch.id, &batch.provider, batch.dry_run, status, items, message)
        };

        if let Some((reason, message)) = halt {
            self.db.save_checkpoint(checkpoint)?;
            let (status, summary_status) = match reason {
                HaltReason::Cancelled => (BatchStatus::Cancelled, SummaryStatus::Cancelled),
                HaltReason::CircuitOpen => (BatchStatus::Running, SummaryStatus::Paused),
                HaltReason::ReconnectRequired => {
                    (BatchStatus::Running, SummaryStatus::ReconnectRequired)
                }
            };
            self.db
                .halt_batch(batch.id, status, reason, counts, now)?;
            info!(
                batch_id = %batch.id,
                halt = %reason,
                position = checkpoint.current_position,
                pending = counts.pending,
                "batch halted"
            );
            let message = message.or_else(|| match reason {
                HaltReason::CircuitOpen => Some(format!(
                    "{} is failing; batch paused until the circuit recovers",
                    batch.provider
                )),
                _ => None,
            });
            return Ok(summary(summary_status, message));
        }

        let ratio = if counts.total == 0 {
            0.0
        } else {
            f64::from(counts.failed) / f64::from(counts.total)
        };
        let threshold = self.config.orchestrator.failure_ratio_threshold;
        let (status, summary_status) = if counts.failed > 0 && ratio >= threshold {
            (BatchStatus::Failed, SummaryStatus::Failed)
        } else if counts.failed > 0 {
            (BatchStatus::Completed, SummaryStatus::CompletedWithErrors)
        } else {
            (BatchStatus::Completed, SummaryStatus::Completed)
        };
        self.db.finish_batch(batch.id, status, counts, now)?;
        info!(
            batch_id = %batch.id,
            status = %status,
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            "batch finished"
        );
        Ok(summary(summary_status, None))
    }
}

impl EnforcementDb {
    /// Mark a batch that is not running anywhere as cancelled.
    pub fn cancel_idle_batch(
        &self,
        batch_id: Uuid,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<CancelOutcome> {
        let batch = self.get_batch(batch_id)?;
        match batch.status {
            BatchStatus::Cancelled => Ok(CancelOutcome::AlreadyCancelled),
            BatchStatus::Completed | BatchStatus::Failed => {
                Err(EnforceError::BatchTerminal(batch_id.to_string()))
            }
            BatchStatus::Pending | BatchStatus::Running => {
                self.transition_batch(
                    batch_id,
                    BatchStatus::Cancelled,
                    Some(HaltReason::Cancelled),
                    now,
                )?;
                info!(%batch_id, "batch cancelled");
                Ok(CancelOutcome::Cancelled)
            }
        }
    }
}
