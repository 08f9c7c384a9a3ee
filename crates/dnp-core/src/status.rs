//! Read-only view of per-provider limiter and breaker state for tooling.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::circuit::CircuitBreakerState;
use crate::config::Config;
use crate::error::Result;
use crate::paths;
use crate::rate_limit::ProviderRateState;
use crate::store::EnforcementDb;

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider: String,
    /// Whether the provider has a section in the config file.
    pub configured: bool,
    pub rate_limit: ProviderRateState,
    pub circuit: CircuitBreakerState,
}

impl EnforcementDb {
    /// Stored state for `provider`, or the initial state when none is stored.
    pub fn provider_status(&self, config: &Config, provider: &str) -> Result<ProviderStatus> {
        paths::validate_provider(provider)?;
        let rate_limit = self
            .rate_states()?
            .into_iter()
            .find(|s| s.provider == provider)
            .unwrap_or_else(|| {
                ProviderRateState::new(provider, &config.rate_limit_for(provider))
            });
        let circuit = self
            .circuit_state(provider)?
            .unwrap_or_else(|| CircuitBreakerState::new(provider));
        Ok(ProviderStatus {
            provider: provider.to_string(),
            configured: config.providers.contains_key(provider),
            rate_limit,
            circuit,
        })
    }

    /// Every provider that is configured or has stored state.
    pub fn provider_statuses(&self, config: &Config) -> Result<Vec<ProviderStatus>> {
        let mut names: BTreeSet<String> = config.providers.keys().cloned().collect();
        names.extend(self.rate_states()?.into_iter().map(|s| s.provider));
        names.extend(self.circuit_states()?.into_iter().map(|s| s.provider));
        names
            .iter()
            .map(|name| self.provider_status(config, name))
            .collect()
    }
}
