use crate::adapter::Capabilities;
use crate::error::{EnforceError, Result};
use crate::paths;
use crate::types::ActionKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// RateLimitConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    #[serde(default = "default_window_duration")]
    pub window_duration_seconds: u64,
    #[serde(default)]
    pub burst_allowance: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_seconds: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: f64,
}

fn default_requests_per_window() -> u32 {
    100
}

fn default_window_duration() -> u64 {
    60
}

fn default_initial_backoff() -> f64 {
    1.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff() -> f64 {
    300.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_duration_seconds: default_window_duration(),
            burst_allowance: 0,
            initial_backoff_seconds: default_initial_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_seconds: default_max_backoff(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_duration_seconds)
    }
}

// ---------------------------------------------------------------------------
// BatchTuning
// ---------------------------------------------------------------------------

/// Pacing for one kind of operation: after `max_batch_size` mutations the
/// orchestrator pauses for `delay_ms` before continuing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperationTuning {
    pub max_batch_size: usize,
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTuning {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub operations: HashMap<ActionKind, OperationTuning>,
}

fn default_max_batch_size() -> usize {
    50
}

impl Default for BatchTuning {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            delay_ms: 0,
            operations: HashMap::new(),
        }
    }
}

impl BatchTuning {
    pub fn for_action(&self, action: ActionKind) -> OperationTuning {
        self.operations
            .get(&action)
            .copied()
            .unwrap_or(OperationTuning {
                max_batch_size: self.max_batch_size,
                delay_ms: self.delay_ms,
            })
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_lookback")]
    pub lookback_seconds: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_cooldown_multiplier")]
    pub cooldown_multiplier: f64,
    #[serde(default = "default_max_cooldown")]
    pub max_cooldown_seconds: u64,
    #[serde(default = "default_half_open_successes")]
    pub half_open_success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_lookback() -> u64 {
    60
}

fn default_cooldown() -> u64 {
    30
}

fn default_cooldown_multiplier() -> f64 {
    2.0
}

fn default_max_cooldown() -> u64 {
    900
}

fn default_half_open_successes() -> u32 {
    2
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            lookback_seconds: default_lookback(),
            cooldown_seconds: default_cooldown(),
            cooldown_multiplier: default_cooldown_multiplier(),
            max_cooldown_seconds: default_max_cooldown(),
            half_open_success_threshold: default_half_open_successes(),
        }
    }
}

// ---------------------------------------------------------------------------
// OrchestratorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_item_retries")]
    pub max_item_retries: u32,
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Batch is `failed` when `failed / total` reaches this ratio.
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio_threshold: f64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,
    #[serde(default = "default_provider_concurrency")]
    pub provider_concurrency: usize,
}

fn default_max_item_retries() -> u32 {
    3
}

fn default_max_rate_limit_retries() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_failure_ratio() -> f64 {
    0.5
}

fn default_call_timeout() -> u64 {
    30
}

fn default_provider_concurrency() -> usize {
    4
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_item_retries: default_max_item_retries(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            failure_ratio_threshold: default_failure_ratio(),
            call_timeout_seconds: default_call_timeout(),
            provider_concurrency: default_provider_concurrency(),
        }
    }
}

impl OrchestratorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// LedgerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_rollback_window_days")]
    pub rollback_window_days: u32,
}

fn default_rollback_window_days() -> u32 {
    7
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rollback_window_days: default_rollback_window_days(),
        }
    }
}

impl LedgerConfig {
    pub fn rollback_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.rollback_window_days))
    }
}

// ---------------------------------------------------------------------------
// ProviderConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub batch: BatchTuning,
    /// Declared capabilities, used by the simulated adapter and dry runs.
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Overrides the global breaker settings for this provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            version: 1,
            providers: BTreeMap::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }

    pub fn with_provider(mut self, name: impl Into<String>, provider: ProviderConfig) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    pub fn rate_limit_for(&self, provider: &str) -> RateLimitConfig {
        self.providers
            .get(provider)
            .map(|p| p.rate_limit)
            .unwrap_or_default()
    }

    pub fn circuit_for(&self, provider: &str) -> CircuitBreakerConfig {
        self.providers
            .get(provider)
            .and_then(|p| p.circuit_breaker)
            .unwrap_or(self.circuit_breaker)
    }

    pub fn tuning_for(&self, provider: &str, action: ActionKind) -> OperationTuning {
        self.providers
            .get(provider)
            .map(|p| p.batch.for_action(action))
            .unwrap_or_else(|| BatchTuning::default().for_action(action))
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(EnforceError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut push = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message })
        };

        for (name, provider) in &self.providers {
            if paths::validate_provider(name).is_err() {
                push(
                    WarnLevel::Error,
                    format!("provider name '{name}' is not a valid key"),
                );
            }

            let rl = &provider.rate_limit;
            if rl.requests_per_window == 0 {
                push(
                    WarnLevel::Error,
                    format!("provider '{name}' has requests_per_window=0; no call could ever be made"),
                );
            }
            if rl.window_duration_seconds == 0 {
                push(
                    WarnLevel::Error,
                    format!("provider '{name}' has window_duration_seconds=0"),
                );
            }
            if rl.backoff_multiplier < 1.0 {
                push(
                    WarnLevel::Warning,
                    format!(
                        "provider '{name}' has backoff_multiplier={} (<1 shrinks backoff on repeated failures)",
                        rl.backoff_multiplier
                    ),
                );
            }
            if rl.max_backoff_seconds < rl.initial_backoff_seconds {
                push(
                    WarnLevel::Warning,
                    format!("provider '{name}' has max_backoff_seconds below initial_backoff_seconds"),
                );
            }

            if provider.batch.max_batch_size == 0 {
                push(
                    WarnLevel::Error,
                    format!("provider '{name}' has batch.max_batch_size=0"),
                );
            }
            for (action, tuning) in &provider.batch.operations {
                if tuning.max_batch_size == 0 {
                    push(
                        WarnLevel::Error,
                        format!("provider '{name}' operation '{action}' has max_batch_size=0"),
                    );
                }
            }

            for action in &provider.capabilities.supported_actions {
                if !action.is_forward() {
                    push(
                        WarnLevel::Warning,
                        format!(
                            "provider '{name}' lists '{action}' as a supported action; only remove, unfollow and dislike are submitted"
                        ),
                    );
                }
            }

            if let Some(cb) = &provider.circuit_breaker {
                check_circuit(&mut push, &format!("provider '{name}' circuit_breaker"), cb);
            }
        }

        check_circuit(&mut push, "circuit_breaker", &self.circuit_breaker);

        let orch = &self.orchestrator;
        if !(orch.failure_ratio_threshold > 0.0 && orch.failure_ratio_threshold <= 1.0) {
            push(
                WarnLevel::Error,
                format!(
                    "orchestrator.failure_ratio_threshold={} must be in (0, 1]",
                    orch.failure_ratio_threshold
                ),
            );
        }
        if orch.provider_concurrency == 0 {
            push(
                WarnLevel::Error,
                "orchestrator.provider_concurrency=0 would block every call".to_string(),
            );
        }
        if orch.call_timeout_seconds == 0 {
            push(
                WarnLevel::Error,
                "orchestrator.call_timeout_seconds=0 times out every call".to_string(),
            );
        }
        if orch.max_item_retries > 10 {
            push(
                WarnLevel::Warning,
                format!(
                    "orchestrator.max_item_retries={} (>10 is unusual)",
                    orch.max_item_retries
                ),
            );
        }

        if self.ledger.rollback_window_days == 0 {
            push(
                WarnLevel::Warning,
                "ledger.rollback_window_days=0 disables rollback".to_string(),
            );
        }

        warnings
    }
}

fn check_circuit(
    push: &mut impl FnMut(WarnLevel, String),
    label: &str,
    cb: &CircuitBreakerConfig,
) {
    if cb.failure_threshold == 0 {
        push(
            WarnLevel::Error,
            format!("{label}.failure_threshold=0 would open the circuit immediately"),
        );
    }
    if cb.half_open_success_threshold == 0 {
        push(
            WarnLevel::Error,
            format!("{label}.half_open_success_threshold must be at least 1"),
        );
    }
    if cb.max_cooldown_seconds < cb.cooldown_seconds {
        push(
            WarnLevel::Warning,
            format!("{label}.max_cooldown_seconds is below cooldown_seconds"),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
