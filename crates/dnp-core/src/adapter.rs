//! Provider adapter contract.
//!
//! An adapter turns one [`AbstractAction`] into the provider-specific API
//! calls that apply it, and knows how to reverse a recorded ledger entry.
//! The orchestrator only talks to adapters through [`ProviderAdapter`] and
//! looks them up by provider name in an [`AdapterRegistry`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::batch::{ActionBatch, ActionItem};
use crate::error::{EnforceError, Result};
use crate::ledger::EnforcementAction;
use crate::types::{ActionKind, EntityType};

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub supports_collaborative_resources: bool,
    #[serde(default = "default_supported_actions")]
    pub supported_actions: BTreeSet<ActionKind>,
}

fn default_max_batch_size() -> usize {
    50
}

fn default_supported_actions() -> BTreeSet<ActionKind> {
    ActionKind::forward().iter().copied().collect()
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            supports_collaborative_resources: false,
            supported_actions: default_supported_actions(),
        }
    }
}

impl Capabilities {
    /// Reason the provider cannot apply `item`, if any. Such items are
    /// skipped, never failed.
    pub fn unsupported_reason(&self, item: &ActionItem) -> Option<String> {
        if !self.supported_actions.contains(&item.action) {
            return Some(format!(
                "provider does not support '{}' on {}",
                item.action, item.entity_type
            ));
        }
        if item.collaborative && !self.supports_collaborative_resources {
            return Some(format!(
                "provider cannot mutate collaborative {} '{}'",
                item.entity_type, item.entity_id
            ));
        }
        None
    }
}

// ---------------------------------------------------------------------------
// AbstractAction / MutationOutcome
// ---------------------------------------------------------------------------

/// Provider-neutral description of one mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbstractAction {
    pub batch_id: Uuid,
    pub item_id: Uuid,
    pub user: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub collaborative: bool,
    pub action: ActionKind,
    pub idempotency_key: String,
    /// Adapter resume token persisted in the batch checkpoint.
    pub resume_token: Option<serde_json::Value>,
}

impl AbstractAction {
    pub fn from_item(
        batch: &ActionBatch,
        item: &ActionItem,
        resume_token: Option<serde_json::Value>,
    ) -> Self {
        Self {
            batch_id: batch.id,
            item_id: item.id,
            user: batch.user.clone(),
            entity_type: item.entity_type,
            entity_id: item.entity_id.clone(),
            entity_name: item.entity_name.clone(),
            collaborative: item.collaborative,
            action: item.action,
            idempotency_key: item.idempotency_key.clone(),
            resume_token,
        }
    }
}

/// What the provider looked like before and after a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationOutcome {
    pub before_state: serde_json::Value,
    pub after_state: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<serde_json::Value>,
}

impl MutationOutcome {
    /// The outcome a mutation would have, without asking the provider what
    /// the prior state was.
    pub fn planned(action: &AbstractAction) -> Self {
        let (field, before, after) = match action.action {
            ActionKind::Remove | ActionKind::Restore => ("in_library", json!(true), json!(false)),
            ActionKind::Unfollow | ActionKind::Follow => ("following", json!(true), json!(false)),
            ActionKind::Dislike | ActionKind::RemoveRating => {
                ("rating", json!(null), json!("disliked"))
            }
        };
        Self {
            before_state: json!({ field: before }),
            after_state: json!({ field: after }),
            resume_token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderError
// ---------------------------------------------------------------------------

/// Typed result of a failed provider call; the variant decides how the
/// orchestrator reacts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("provider credentials expired: {0}")]
    AuthExpired(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("permanent provider failure: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Transient(_) => "transient",
            ProviderError::AuthExpired(_) => "auth_expired",
            ProviderError::PermissionDenied(_) => "permission_denied",
            ProviderError::Permanent(_) => "permanent",
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderAdapter
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Registry key, e.g. `"spotify"`.
    fn provider(&self) -> &str;

    fn capabilities(&self) -> &Capabilities;

    /// Apply the mutation. Must be idempotent: repeating an applied action
    /// is a no-op success.
    async fn execute(
        &self,
        action: &AbstractAction,
    ) -> std::result::Result<MutationOutcome, ProviderError>;

    /// Undo a previously applied ledger entry using its `previous_state`.
    async fn execute_inverse(
        &self,
        entry: &EnforcementAction,
    ) -> std::result::Result<(), ProviderError>;

    /// Describe what `execute` would do without mutating anything.
    async fn preview(
        &self,
        action: &AbstractAction,
    ) -> std::result::Result<MutationOutcome, ProviderError> {
        Ok(MutationOutcome::planned(action))
    }
}

// ---------------------------------------------------------------------------
// AdapterRegistry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) -> &mut Self {
        self.adapters
            .insert(adapter.provider().to_string(), adapter);
        self
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, provider: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(provider)
            .cloned()
            .ok_or_else(|| EnforceError::AdapterNotFound(provider.to_string()))
    }

    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SimulatedAdapter
// ---------------------------------------------------------------------------

/// Adapter that never talks to a provider. Every action succeeds with its
/// planned outcome. Used for dry runs from tooling, where no live adapter is
/// linked in.
#[derive(Debug, Clone)]
pub struct SimulatedAdapter {
    provider: String,
    capabilities: Capabilities,
}

impl SimulatedAdapter {
    pub fn new(provider: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            provider: provider.into(),
            capabilities,
        }
    }

    /// One simulated adapter per configured provider.
    pub fn registry_from_config(config: &crate::config::Config) -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        for (name, provider) in &config.providers {
            registry.register(Arc::new(SimulatedAdapter::new(
                name.clone(),
                provider.capabilities.clone(),
            )));
        }
        registry
    }
}

#[async_trait]
impl ProviderAdapter for SimulatedAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn execute(
        &self,
        action: &AbstractAction,
    ) -> std::result::Result<MutationOutcome, ProviderError> {
        Ok(MutationOutcome::planned(action))
    }

    async fn execute_inverse(
        &self,
        _entry: &EnforcementAction,
    ) -> std::result::Result<(), ProviderError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
