#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dnp_core::adapter::{
    AbstractAction, AdapterRegistry, Capabilities, MutationOutcome, ProviderAdapter,
    ProviderError,
};
use dnp_core::batch::{BatchOptions, BatchSubmission, ItemSubmission};
use dnp_core::clock::ManualClock;
use dnp_core::config::{Config, OrchestratorConfig, ProviderConfig, RateLimitConfig};
use dnp_core::ledger::EnforcementAction;
use dnp_core::types::{ActionKind, EntityType};
use dnp_core::{EnforcementDb, Orchestrator};
use tempfile::TempDir;
use tokio::sync::Notify;
use uuid::Uuid;

pub const PROVIDER: &str = "spotify";

// ---------------------------------------------------------------------------
// ScriptedAdapter
// ---------------------------------------------------------------------------

/// Stops a call on `entity_id` until released.
struct Pause {
    entity_id: String,
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

/// Adapter whose responses are queued per entity by the test.
pub struct ScriptedAdapter {
    provider: String,
    capabilities: Capabilities,
    failures: Mutex<HashMap<String, VecDeque<ProviderError>>>,
    always: Mutex<Option<ProviderError>>,
    crashes: Mutex<HashSet<String>>,
    hangs: Mutex<HashMap<String, Duration>>,
    pause: Mutex<Option<Pause>>,
    latency: Mutex<Duration>,
    calls: Mutex<Vec<String>>,
    previews: Mutex<Vec<String>>,
    inverse_calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(provider: &str) -> Self {
        Self::with_capabilities(provider, Capabilities::default())
    }

    pub fn with_capabilities(provider: &str, capabilities: Capabilities) -> Self {
        Self {
            provider: provider.to_string(),
            capabilities,
            failures: Mutex::default(),
            always: Mutex::default(),
            crashes: Mutex::default(),
            hangs: Mutex::default(),
            pause: Mutex::default(),
            latency: Mutex::new(Duration::ZERO),
            calls: Mutex::default(),
            previews: Mutex::default(),
            inverse_calls: Mutex::default(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Queue `error` for the next call on `entity_id`.
    pub fn fail_next(&self, entity_id: &str, error: ProviderError) {
        self.failures
            .lock()
            .unwrap()
            .entry(entity_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Fail every call with `error` until cleared with `None`.
    pub fn fail_always(&self, error: Option<ProviderError>) {
        *self.always.lock().unwrap() = error;
    }

    /// Panic once when `entity_id` is executed, as if the process died.
    pub fn crash_at(&self, entity_id: &str) {
        self.crashes.lock().unwrap().insert(entity_id.to_string());
    }

    /// Hang the next call on `entity_id` for `duration` of tokio time.
    pub fn hang_once(&self, entity_id: &str, duration: Duration) {
        self.hangs
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), duration);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Returns `(reached, release)`: `reached` fires when the call on
    /// `entity_id` starts, which then waits for `release`.
    pub fn pause_at(&self, entity_id: &str) -> (Arc<Notify>, Arc<Notify>) {
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.pause.lock().unwrap() = Some(Pause {
            entity_id: entity_id.to_string(),
            reached: reached.clone(),
            release: release.clone(),
        });
        (reached, release)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn previews(&self) -> Vec<String> {
        self.previews.lock().unwrap().clone()
    }

    pub fn inverse_calls(&self) -> Vec<String> {
        self.inverse_calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn respond(
        &self,
        action: &AbstractAction,
    ) -> Result<MutationOutcome, ProviderError> {
        let id = action.entity_id.as_str();
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let hang = self.hangs.lock().unwrap().remove(id);
        let pause = {
            let mut slot = self.pause.lock().unwrap();
            match slot.as_ref() {
                Some(p) if p.entity_id == id => slot
                    .take()
                    .map(|p| (p.reached, p.release)),
                _ => None,
            }
        };
        let latency = *self.latency.lock().unwrap();

        if let Some(d) = hang {
            tokio::time::sleep(d).await;
        }
        if let Some((reached, release)) = pause {
            reached.notify_one();
            release.notified().await;
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.crashes.lock().unwrap().remove(id) {
            panic!("simulated crash while applying {id}");
        }
        let queued = self
            .failures
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(|q| q.pop_front());
        if let Some(err) = queued.or_else(|| self.always.lock().unwrap().clone()) {
            return Err(err);
        }
        Ok(MutationOutcome::planned(action))
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn execute(&self, action: &AbstractAction) -> Result<MutationOutcome, ProviderError> {
        self.calls.lock().unwrap().push(action.entity_id.clone());
        self.respond(action).await
    }

    async fn execute_inverse(&self, entry: &EnforcementAction) -> Result<(), ProviderError> {
        self.inverse_calls
            .lock()
            .unwrap()
            .push(entry.resource_id.clone());
        let queued = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&entry.resource_id)
            .and_then(|q| q.pop_front());
        match queued {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn preview(&self, action: &AbstractAction) -> Result<MutationOutcome, ProviderError> {
        self.previews.lock().unwrap().push(action.entity_id.clone());
        let queued = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&action.entity_id)
            .and_then(|q| q.pop_front());
        match queued {
            Some(err) => Err(err),
            None => Ok(MutationOutcome::planned(action)),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Limits generous enough that only the scenario under test throttles.
pub fn config() -> Config {
    let mut config = Config::new().with_provider(
        PROVIDER,
        ProviderConfig {
            rate_limit: RateLimitConfig {
                requests_per_window: 10_000,
                ..RateLimitConfig::default()
            },
            ..ProviderConfig::default()
        },
    );
    config.orchestrator = OrchestratorConfig {
        retry_delay_ms: 10,
        ..OrchestratorConfig::default()
    };
    config
}

pub struct Harness {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub config: Arc<Config>,
    pub adapter: Arc<ScriptedAdapter>,
    pub orch: Arc<Orchestrator>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        Self::with_adapter(config, ScriptedAdapter::new(PROVIDER))
    }

    pub fn with_adapter(config: Config, adapter: ScriptedAdapter) -> Self {
        let dir = TempDir::new().unwrap();
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        Self::build(
            dir,
            Arc::new(ManualClock::new(start)),
            Arc::new(config),
            Arc::new(adapter),
        )
    }

    fn build(
        dir: TempDir,
        clock: Arc<ManualClock>,
        config: Arc<Config>,
        adapter: Arc<ScriptedAdapter>,
    ) -> Self {
        let db = Arc::new(EnforcementDb::open(&dir.path().join("enforcement.db")).unwrap());
        let registry = AdapterRegistry::new().with(adapter.clone());
        let orch = Arc::new(Orchestrator::with_clock(
            db,
            config.clone(),
            registry,
            clock.clone(),
        ));
        Self {
            dir,
            clock,
            config,
            adapter,
            orch,
        }
    }

    /// Close the database and open it again with a fresh orchestrator, as
    /// a restarted process would.
    pub fn restart(self) -> Self {
        let Harness {
            dir,
            clock,
            config,
            adapter,
            orch,
        } = self;
        drop(orch);
        Self::build(dir, clock, config, adapter)
    }

    pub fn db(&self) -> &EnforcementDb {
        self.orch.db()
    }

    pub fn submit(&self, key: &str, items: Vec<ItemSubmission>) -> Uuid {
        self.submit_with(key, items, false)
    }

    pub fn submit_with(&self, key: &str, items: Vec<ItemSubmission>, dry_run: bool) -> Uuid {
        self.orch
            .submit(&submission(key, items, dry_run))
            .unwrap()
            .batch
            .id
    }
}

pub fn submission(key: &str, items: Vec<ItemSubmission>, dry_run: bool) -> BatchSubmission {
    BatchSubmission {
        user: "user-1".into(),
        provider: PROVIDER.into(),
        idempotency_key: key.into(),
        dry_run,
        options: BatchOptions::default(),
        action_items: items,
    }
}

pub fn item(entity_id: &str, action: ActionKind) -> ItemSubmission {
    ItemSubmission {
        entity_type: EntityType::Track,
        entity_id: entity_id.into(),
        action,
        entity_name: None,
        collaborative: false,
    }
}

/// `count` tracks named `{prefix}-0`, `{prefix}-1`, ... all with `action`.
pub fn tracks(prefix: &str, count: usize, action: ActionKind) -> Vec<ItemSubmission> {
    (0..count)
        .map(|i| item(&format!("{prefix}-{i}"), action))
        .collect()
}

/// Ledger content that must not depend on how a run was interrupted.
pub fn ledger_shape(entries: &[EnforcementAction]) -> Vec<(u64, String, ActionKind)> {
    entries
        .iter()
        .map(|e| (e.sequence, e.resource_id.clone(), e.action))
        .collect()
}
