//! Per-provider request budget with fixed windows, burst permits and
//! exponential backoff after provider failures.
//!
//! State lives in the `rate_state` table. Every acquire or feedback call is
//! one write transaction, so concurrent workers sharing the database never
//! hand out more permits than a window allows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{self, Clock};
use crate::config::{Config, RateLimitConfig};
use crate::error::Result;
use crate::store::{db_err, get_json, put_json, scan_all, EnforcementDb, RATE_STATE};

// ---------------------------------------------------------------------------
// Acquire
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Permit,
    /// No permit now; ask again after the duration. Never blocks.
    RetryAfter(Duration),
}

// ---------------------------------------------------------------------------
// ProviderRateState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRateState {
    pub provider: String,
    pub requests_remaining: u32,
    pub burst_remaining: u32,
    #[serde(default)]
    pub window_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub window_reset_at: Option<DateTime<Utc>>,
    /// Permits handed out in the current window.
    #[serde(default)]
    pub granted_in_window: u32,
    #[serde(default)]
    pub current_backoff_seconds: f64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_request_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl ProviderRateState {
    pub fn new(provider: impl Into<String>, config: &RateLimitConfig) -> Self {
        Self {
            provider: provider.into(),
            requests_remaining: config.requests_per_window,
            burst_remaining: config.burst_allowance,
            window_started_at: None,
            window_reset_at: None,
            granted_in_window: 0,
            current_backoff_seconds: 0.0,
            consecutive_failures: 0,
            last_request_at: None,
            last_failure_at: None,
        }
    }

    /// End of the current backoff period, if one is in force at `now`.
    pub fn backoff_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let last = self.last_failure_at?;
        if self.current_backoff_seconds <= 0.0 {
            return None;
        }
        let backoff =
            Duration::try_from_secs_f64(self.current_backoff_seconds).unwrap_or(Duration::MAX);
        let until = last + clock::to_chrono(backoff);
        (until > now).then_some(until)
    }

    pub fn acquire(&mut self, config: &RateLimitConfig, now: DateTime<Utc>) -> Acquire {
        if let Some(until) = self.backoff_until(now) {
            return Acquire::RetryAfter(clock::until(now, until));
        }

        let expired = self.window_reset_at.map_or(true, |reset| now >= reset);
        if expired {
            self.window_started_at = Some(now);
            self.window_reset_at = Some(now + clock::to_chrono(config.window()));
            self.requests_remaining = config.requests_per_window;
            self.burst_remaining = config.burst_allowance;
            self.granted_in_window = 0;
        }

        if self.burst_remaining > 0 {
            self.burst_remaining -= 1;
        } else if self.requests_remaining > 0 {
            self.requests_remaining -= 1;
        } else {
            let reset = self.window_reset_at.unwrap_or(now);
            return Acquire::RetryAfter(clock::until(now, reset));
        }
        self.granted_in_window += 1;
        self.last_request_at = Some(now);
        Acquire::Permit
    }

    pub fn record_failure(
        &mut self,
        config: &RateLimitConfig,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        let next = if self.current_backoff_seconds <= 0.0 {
            config.initial_backoff_seconds
        } else {
            self.current_backoff_seconds * config.backoff_multiplier
        };
        let mut backoff = next.min(config.max_backoff_seconds);
        if let Some(hint) = retry_after {
            backoff = backoff.max(hint.as_secs_f64());
        }
        self.current_backoff_seconds = backoff;
        self.consecutive_failures += 1;
        self.last_failure_at = Some(now);
    }

    pub fn record_success(&mut self) {
        self.current_backoff_seconds = 0.0;
        self.consecutive_failures = 0;
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

pub struct RateLimiter {
    db: Arc<EnforcementDb>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl RateLimiter {
    pub fn new(db: Arc<EnforcementDb>, clock: Arc<dyn Clock>, config: Arc<Config>) -> Self {
        Self { db, clock, config }
    }

    fn update<T>(
        &self,
        provider: &str,
        f: impl FnOnce(&mut ProviderRateState, &RateLimitConfig, DateTime<Utc>) -> T,
    ) -> Result<T> {
        let config = self.config.rate_limit_for(provider);
        let now = self.clock.now();
        self.db.write(|wt| {
            let mut table = wt.open_table(RATE_STATE).map_err(db_err)?;
            let mut state = get_json(&table, provider)?
                .unwrap_or_else(|| ProviderRateState::new(provider, &config));
            let out = f(&mut state, &config, now);
            put_json(&mut table, provider, &state)?;
            Ok(out)
        })
    }

    pub fn acquire(&self, provider: &str) -> Result<Acquire> {
        let decision = self.update(provider, |s, c, now| s.acquire(c, now))?;
        if let Acquire::RetryAfter(wait) = decision {
            debug!(provider, wait_ms = wait.as_millis() as u64, "rate limit: retry after");
        }
        Ok(decision)
    }

    /// What [`acquire`](Self::acquire) would answer now, without spending
    /// a permit or storing anything.
    pub fn peek(&self, provider: &str) -> Result<Acquire> {
        let config = self.config.rate_limit_for(provider);
        let mut state = self.state(provider)?;
        Ok(state.acquire(&config, self.clock.now()))
    }

    pub fn record_failure(&self, provider: &str, retry_after: Option<Duration>) -> Result<()> {
        let backoff = self.update(provider, |s, c, now| {
            s.record_failure(c, retry_after, now);
            s.current_backoff_seconds
        })?;
        debug!(provider, backoff_seconds = backoff, "rate limit: backing off");
        Ok(())
    }

    pub fn record_success(&self, provider: &str) -> Result<()> {
        self.update(provider, |s, _, _| s.record_success())
    }

    /// Stored state, or the state a first request would start from.
    pub fn state(&self, provider: &str) -> Result<ProviderRateState> {
        let config = self.config.rate_limit_for(provider);
        let stored = self.db.read(|rt| {
            let table = rt.open_table(RATE_STATE).map_err(db_err)?;
            get_json(&table, provider)
        })?;
        Ok(stored.unwrap_or_else(|| ProviderRateState::new(provider, &config)))
    }

    pub fn states(&self) -> Result<Vec<ProviderRateState>> {
        self.db.rate_states()
    }
}

impl EnforcementDb {
    /// Every stored limiter state, ordered by provider.
    pub fn rate_states(&self) -> Result<Vec<ProviderRateState>> {
        self.read(|rt| {
            let table = rt.open_table(RATE_STATE).map_err(db_err)?;
            Ok(scan_all(&table)?.into_iter().map(|(_, s)| s).collect())
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ProviderConfig;
    use tempfile::TempDir;

    fn cfg(requests: u32, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_window: requests,
            window_duration_seconds: 60,
            burst_allowance: burst,
            ..RateLimitConfig::default()
        }
    }

    fn secs(n: u64) -> chrono::Duration {
        chrono::Duration::seconds(n as i64)
    }

    #[test]
    fn burst_is_spent_before_steady_permits() {
        let c = cfg(2, 1);
        let now = Utc::now();
        let mut s = ProviderRateState::new("p", &c);
        assert_eq!(s.acquire(&c, now), Acquire::Permit);
        assert_eq!(s.burst_remaining, 0);
        assert_eq!(s.requests_remaining, 2);
        assert_eq!(s.acquire(&c, now), Acquire::Permit);
        assert_eq!(s.acquire(&c, now), Acquire::Permit);
        assert_eq!(
            s.acquire(&c, now + secs(15)),
            Acquire::RetryAfter(Duration::from_secs(45))
        );
    }

    #[test]
    fn window_resets_after_duration() {
        let c = cfg(1, 0);
        let t0 = Utc::now();
        let mut s = ProviderRateState::new("p", &c);
        assert_eq!(s.acquire(&c, t0), Acquire::Permit);
        assert!(matches!(s.acquire(&c, t0 + secs(59)), Acquire::RetryAfter(_)));
        assert_eq!(s.acquire(&c, t0 + secs(60)), Acquire::Permit);
        assert_eq!(s.window_started_at, Some(t0 + secs(60)));
    }

    #[test]
    fn grants_never_exceed_window_budget() {
        let c = cfg(7, 3);
        let t0 = Utc::now();
        let mut s = ProviderRateState::new("p", &c);
        let mut granted_per_window = std::collections::BTreeMap::new();
        // one request every 2 seconds for 10 minutes
        for i in 0..300u64 {
            let now = t0 + secs(i * 2);
            if s.acquire(&c, now) == Acquire::Permit {
                *granted_per_window
                    .entry(s.window_started_at.unwrap())
                    .or_insert(0u32) += 1;
            }
        }
        assert!(granted_per_window.len() >= 10);
        assert!(granted_per_window.values().all(|&n| n <= 10));
    }

    #[test]
    fn backoff_gate_blocks_even_with_quota() {
        let c = cfg(100, 0);
        let t0 = Utc::now();
        let mut s = ProviderRateState::new("p", &c);
        s.record_failure(&c, None, t0);
        assert_eq!(
            s.acquire(&c, t0),
            Acquire::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(s.acquire(&c, t0 + secs(1)), Acquire::Permit);
    }

    #[test]
    fn backoff_grows_caps_and_honours_hint() {
        let c = RateLimitConfig {
            initial_backoff_seconds: 1.0,
            backoff_multiplier: 2.0,
            max_backoff_seconds: 5.0,
            ..RateLimitConfig::default()
        };
        let now = Utc::now();
        let mut s = ProviderRateState::new("p", &c);
        let mut seen = Vec::new();
        for _ in 0..5 {
            s.record_failure(&c, None, now);
            seen.push(s.current_backoff_seconds);
        }
        assert_eq!(seen, vec![1.0, 2.0, 4.0, 5.0, 5.0]);
        assert_eq!(s.consecutive_failures, 5);

        s.record_failure(&c, Some(Duration::from_secs(30)), now);
        assert_eq!(s.current_backoff_seconds, 30.0);

        s.record_success();
        assert_eq!(s.current_backoff_seconds, 0.0);
        assert_eq!(s.consecutive_failures, 0);
        assert!(s.backoff_until(now).is_none());
    }

    #[test]
    fn limiter_persists_state_across_handles() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(EnforcementDb::open(&dir.path().join("t.db")).unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = Arc::new(Config::new().with_provider(
            "spotify",
            ProviderConfig {
                rate_limit: cfg(2, 0),
                ..ProviderConfig::default()
            },
        ));

        let a = RateLimiter::new(db.clone(), clock.clone(), config.clone());
        let b = RateLimiter::new(db.clone(), clock.clone(), config);
        assert_eq!(a.acquire("spotify").unwrap(), Acquire::Permit);
        assert_eq!(b.acquire("spotify").unwrap(), Acquire::Permit);
        assert_eq!(
            a.acquire("spotify").unwrap(),
            Acquire::RetryAfter(Duration::from_secs(60))
        );

        let state = b.state("spotify").unwrap();
        assert_eq!(state.granted_in_window, 2);
        assert_eq!(b.states().unwrap().len(), 1);

        clock.advance(Duration::from_secs(60));
        assert_eq!(a.acquire("spotify").unwrap(), Acquire::Permit);
    }

    #[test]
    fn peek_never_spends_a_permit() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(EnforcementDb::open(&dir.path().join("t.db")).unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = Arc::new(Config::new().with_provider(
            "spotify",
            ProviderConfig {
                rate_limit: cfg(1, 0),
                ..ProviderConfig::default()
            },
        ));
        let limiter = RateLimiter::new(db.clone(), clock, config);

        for _ in 0..3 {
            assert_eq!(limiter.peek("spotify").unwrap(), Acquire::Permit);
        }
        assert!(db.rate_states().unwrap().is_empty());

        assert_eq!(limiter.acquire("spotify").unwrap(), Acquire::Permit);
        assert_eq!(
            limiter.peek("spotify").unwrap(),
            Acquire::RetryAfter(Duration::from_secs(60))
        );
        assert_eq!(limiter.state("spotify").unwrap().granted_in_window, 1);
    }
}
