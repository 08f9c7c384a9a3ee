//! Per-provider circuit breaker.
//!
//! ```text
//! closed ──(failure_count ≥ threshold)──▶ open
//! open ──(now ≥ next_attempt_at, checked in allow)──▶ half_open
//! half_open ──(successes ≥ half_open_success_threshold)──▶ closed
//! half_open ──(any failure, trips += 1)──▶ open
//! ```
//!
//! The cooldown before a probe grows with consecutive re-openings:
//! `cooldown_seconds * cooldown_multiplier^(trips - 1)`, capped at
//! `max_cooldown_seconds`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{self, Clock};
use crate::config::{CircuitBreakerConfig, Config};
use crate::error::Result;
use crate::store::{db_err, get_json, put_json, scan_all, EnforcementDb, CIRCUIT_STATE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub provider: String,
    pub state: CircuitState,
    pub failure_count: u32,
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub success_count_in_half_open: u32,
    #[serde(default)]
    pub trips: u32,
}

impl CircuitBreakerState {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            opened_at: None,
            next_attempt_at: None,
            success_count_in_half_open: 0,
            trips: 0,
        }
    }

    /// Whether a call may go out now. Moves open to half_open once the
    /// cooldown has elapsed.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let due = self.next_attempt_at.map_or(true, |at| now >= at);
                if due {
                    self.state = CircuitState::HalfOpen;
                    self.success_count_in_half_open = 0;
                }
                due
            }
        }
    }

    pub fn record_success(&mut self, config: &CircuitBreakerConfig) {
        match self.state {
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::HalfOpen => {
                self.success_count_in_half_open += 1;
                if self.success_count_in_half_open >= config.half_open_success_threshold {
                    self.close();
                }
            }
            // a call admitted before the breaker opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, config: &CircuitBreakerConfig, now: DateTime<Utc>) {
        match self.state {
            CircuitState::Closed => {
                let lookback = clock::to_chrono(Duration::from_secs(config.lookback_seconds));
                if self.last_failure_at.is_some_and(|last| now - last > lookback) {
                    self.failure_count = 0;
                }
                self.failure_count += 1;
                self.last_failure_at = Some(now);
                if self.failure_count >= config.failure_threshold {
                    self.trips = 1;
                    self.open(config, now);
                }
            }
            CircuitState::HalfOpen => {
                self.last_failure_at = Some(now);
                self.trips += 1;
                self.open(config, now);
            }
            CircuitState::Open => self.last_failure_at = Some(now),
        }
    }

    /// Cooldown for the current number of trips.
    pub fn cooldown(&self, config: &CircuitBreakerConfig) -> Duration {
        let exponent = self.trips.saturating_sub(1).min(64) as i32;
        let secs = config.cooldown_seconds as f64 * config.cooldown_multiplier.powi(exponent);
        let capped = secs.min(config.max_cooldown_seconds as f64);
        Duration::try_from_secs_f64(capped).unwrap_or(Duration::from_secs(config.max_cooldown_seconds))
    }

    fn open(&mut self, config: &CircuitBreakerConfig, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.next_attempt_at = Some(now + clock::to_chrono(self.cooldown(config)));
        self.success_count_in_half_open = 0;
    }

    fn close(&mut self) {
        let provider = std::mem::take(&mut self.provider);
        *self = Self::new(provider);
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

pub struct CircuitBreaker {
    db: Arc<EnforcementDb>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl CircuitBreaker {
    pub fn new(db: Arc<EnforcementDb>, clock: Arc<dyn Clock>, config: Arc<Config>) -> Self {
        Self { db, clock, config }
    }

    /// Apply `f` to the stored state in one write transaction and log any
    /// state change.
    fn update<T>(
        &self,
        provider: &str,
        f: impl FnOnce(&mut CircuitBreakerState, &CircuitBreakerConfig, DateTime<Utc>) -> T,
    ) -> Result<T> {
        let config = self.config.circuit_for(provider);
        let now = self.clock.now();
        let (before, after, out) = self.db.write(|wt| {
            let mut table = wt.open_table(CIRCUIT_STATE).map_err(db_err)?;
            let mut state: CircuitBreakerState = get_json(&table, provider)?
                .unwrap_or_else(|| CircuitBreakerState::new(provider));
            let before = state.state;
            let out = f(&mut state, &config, now);
            put_json(&mut table, provider, &state)?;
            Ok((before, state, out))
        })?;

        if before != after.state {
            match after.state {
                CircuitState::Open => warn!(
                    provider,
                    trips = after.trips,
                    next_attempt_at = ?after.next_attempt_at,
                    "circuit opened"
                ),
                _ => info!(provider, from = %before, to = %after.state, "circuit state changed"),
            }
        }
        Ok(out)
    }

    pub fn allow(&self, provider: &str) -> Result<bool> {
        self.update(provider, |s, _, now| s.allow(now))
    }

    /// Like [`allow`](Self::allow), but a due open circuit stays open.
    pub fn peek_allow(&self, provider: &str) -> Result<bool> {
        let mut state = self.state(provider)?;
        Ok(state.allow(self.clock.now()))
    }

    pub fn record_success(&self, provider: &str) -> Result<()> {
        self.update(provider, |s, c, _| s.record_success(c))
    }

    pub fn record_failure(&self, provider: &str) -> Result<()> {
        self.update(provider, |s, c, now| s.record_failure(c, now))
    }

    /// Force the breaker closed.
    pub fn reset(&self, provider: &str) -> Result<CircuitBreakerState> {
        self.update(provider, |s, _, _| {
            s.close();
            s.clone()
        })
    }

    pub fn state(&self, provider: &str) -> Result<CircuitBreakerState> {
        Ok(self
            .db
            .circuit_state(provider)?
            .unwrap_or_else(|| CircuitBreakerState::new(provider)))
    }

    pub fn states(&self) -> Result<Vec<CircuitBreakerState>> {
        self.db.circuit_states()
    }
}

impl EnforcementDb {
    pub fn circuit_state(&self, provider: &str) -> Result<Option<CircuitBreakerState>> {
        self.read(|rt| {
            let table = rt.open_table(CIRCUIT_STATE).map_err(db_err)?;
            get_json(&table, provider)
        })
    }

    pub fn circuit_states(&self) -> Result<Vec<CircuitBreakerState>> {
        self.read(|rt| {
            let table = rt.open_table(CIRCUIT_STATE).map_err(db_err)?;
            Ok(scan_all(&table)?.into_iter().map(|(_, s)| s).collect())
        })
    }

    /// Operator reset without a running orchestrator.
    pub fn reset_circuit(&self, provider: &str) -> Result<CircuitBreakerState> {
        let state = CircuitBreakerState::new(provider);
        self.write(|wt| {
            let mut table = wt.open_table(CIRCUIT_STATE).map_err(db_err)?;
            put_json(&mut table, provider, &state)
        })?;
        info!(provider, "circuit reset");
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
