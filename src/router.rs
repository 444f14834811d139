//! Request routing — resolves a client-facing alias to an ordered candidate
//! set, and owns the shared state every request handler reads from.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::config::{Config, Dialect, ModelEntry, Priority, ProviderConfig};
use crate::cooldown::CooldownManager;
use crate::error::GatewayError;
use crate::inspector::DebugManager;
use crate::quota::QuotaEnforcer;
use crate::store::Store;
use crate::usage::UsageTracker;

/// One routable `(provider, model)` pair produced by [`resolve`].
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider_id: String,
    pub model: String,
    pub canonical_alias: String,
    pub account_id: Option<String>,
}

impl Candidate {
    pub fn provider_config<'a>(&self, config: &'a Config) -> &'a ProviderConfig {
        config.providers.get(&self.provider_id).expect("candidate provider vanished mid-request")
    }

    pub fn model_entry(&self, config: &Config) -> ModelEntry {
        self.provider_config(config)
            .models
            .entry(&self.model)
            .unwrap_or(ModelEntry { pricing: None, access_via: Vec::new(), model_type: None })
    }
}

/// Dialects a provider can be spoken to through — the model's own `accessVia`
/// if non-empty, otherwise every dialect key present on its `apiBaseUrl` map
/// (or, for a single string URL, `incoming_dialect` always counts as a match
/// since there is no map to consult).
fn supports_dialect(provider: &ProviderConfig, entry: &ModelEntry, dialect: Dialect) -> bool {
    if !entry.access_via.is_empty() {
        return entry.access_via.contains(&dialect);
    }
    match &provider.api_base_url {
        crate::config::BaseUrl::Single(_) => true,
        crate::config::BaseUrl::ByDialect(map) => {
            map.contains_key(dialect.as_str()) || map.contains_key("default")
        }
    }
}

/// Resolves `alias` (canonical or additional) to an ordered list of healthy
/// candidates, reordering for `priority: api_match`.
pub fn resolve(
    config: &Config,
    alias_id: &str,
    incoming_dialect: Dialect,
) -> Result<Vec<Candidate>, GatewayError> {
    let alias = config
        .resolve_alias(alias_id)
        .ok_or_else(|| GatewayError::AliasUnknown(alias_id.to_string()))?;

    let mut candidates: Vec<Candidate> = alias
        .targets
        .iter()
        .filter(|t| t.enabled)
        .filter_map(|t| {
            let provider = config.providers.get(&t.provider)?;
            if !provider.enabled {
                return None;
            }
            if !provider.models.contains(&t.model) {
                return None;
            }
            let account_id = provider.oauth_account.clone();
            Some(Candidate {
                provider_id: t.provider.clone(),
                model: t.model.clone(),
                canonical_alias: alias.id.clone(),
                account_id,
            })
        })
        .collect();

    if candidates.is_empty() {
        return Err(GatewayError::NoTargets(alias_id.to_string()));
    }

    if alias.priority == Priority::ApiMatch {
        let (matching, rest): (Vec<_>, Vec<_>) = candidates.into_iter().partition(|c| {
            let provider = c.provider_config(config);
            let entry = c.model_entry(config);
            supports_dialect(provider, &entry, incoming_dialect)
        });
        candidates = matching.into_iter().chain(rest).collect();
    }

    Ok(candidates)
}

/// Shared application state injected into every request handler.
pub struct RouterState {
    config_lock: Arc<RwLock<Arc<Config>>>,
    pub config_path: PathBuf,
    pub cooldown: Arc<CooldownManager>,
    pub quota: Arc<QuotaEnforcer>,
    pub store: Arc<dyn Store>,
    pub usage: Arc<UsageTracker>,
    pub debug: Arc<DebugManager>,
    pub started_at: std::time::Instant,
    pub http_client: reqwest::Client,
}

impl RouterState {
    pub fn new(config: Arc<Config>, config_path: PathBuf, store: Arc<dyn Store>) -> Self {
        let cooldown =
            Arc::new(CooldownManager::new(Arc::clone(&store), config.gateway.provider_cooldown_minutes));
        let quota = Arc::new(QuotaEnforcer::new(Arc::clone(&store)));
        let usage = Arc::new(UsageTracker::new(config.gateway.debug_log_capacity));
        let debug = DebugManager::new(Arc::clone(&store));
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.gateway.request_timeout_ms))
            .build()
            .expect("building shared HTTP client");

        Self {
            config_lock: Arc::new(RwLock::new(config)),
            config_path,
            cooldown,
            quota,
            store,
            usage,
            debug,
            started_at: std::time::Instant::now(),
            http_client,
        }
    }

    /// Snapshot of the live config; the lock is held only for the `Arc::clone`.
    pub fn config(&self) -> Arc<Config> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    /// Atomically replaces the live config. Called only by the hot-reload task.
    pub fn replace_config(&self, new: Arc<Config>) {
        *self.config_lock.write().expect("config lock poisoned") = new;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AliasTarget, ModelAlias, ModelsField, SelectorKind};
    use std::collections::HashMap;

    fn provider(enabled: bool) -> ProviderConfig {
        ProviderConfig {
            api_base_url: crate::config::BaseUrl::Single("https://example.com".into()),
            api_key: Some("sk-1".into()),
            oauth_provider: None,
            oauth_account: None,
            enabled,
            models: ModelsField::List(vec!["m1".into()]),
            headers: HashMap::new(),
            extra_body: serde_json::Map::new(),
            discount: 0.0,
            estimate_tokens: false,
            quota_checker: None,
        }
    }

    fn config_with_alias(targets: Vec<AliasTarget>) -> Config {
        let mut providers = HashMap::new();
        providers.insert("p1".to_string(), provider(true));
        Config {
            gateway: Default::default(),
            providers,
            models: vec![ModelAlias {
                id: "alias1".into(),
                targets,
                selector: SelectorKind::InOrder,
                priority: Priority::Selector,
                alias_type: None,
                additional_aliases: vec![],
                behaviors: vec![],
            }],
            keys: vec![],
            admin_key: None,
            user_quotas: HashMap::new(),
            performance_exploration_rate: 0.05,
            latency_exploration_rate: None,
        }
    }

    #[test]
    fn resolve_returns_enabled_targets_in_order() {
        let config = config_with_alias(vec![AliasTarget {
            provider: "p1".into(),
            model: "m1".into(),
            enabled: true,
        }]);
        let candidates = resolve(&config, "alias1", Dialect::Chat).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].provider_id, "p1");
    }

    #[test]
    fn resolve_fails_for_unknown_alias() {
        let config = config_with_alias(vec![]);
        assert!(matches!(resolve(&config, "nope", Dialect::Chat), Err(GatewayError::AliasUnknown(_))));
    }

    #[test]
    fn resolve_fails_when_no_targets_enabled() {
        let config = config_with_alias(vec![AliasTarget {
            provider: "p1".into(),
            model: "m1".into(),
            enabled: false,
        }]);
        assert!(matches!(resolve(&config, "alias1", Dialect::Chat), Err(GatewayError::NoTargets(_))));
    }

    #[test]
    fn resolve_excludes_disabled_provider() {
        let mut config = config_with_alias(vec![AliasTarget {
            provider: "p1".into(),
            model: "m1".into(),
            enabled: true,
        }]);
        config.providers.get_mut("p1").unwrap().enabled = false;
        assert!(matches!(resolve(&config, "alias1", Dialect::Chat), Err(GatewayError::NoTargets(_))));
    }

    #[test]
    fn resolve_follows_additional_alias() {
        let mut config = config_with_alias(vec![AliasTarget {
            provider: "p1".into(),
            model: "m1".into(),
            enabled: true,
        }]);
        config.models[0].additional_aliases.push("alt".into());
        let candidates = resolve(&config, "alt", Dialect::Chat).unwrap();
        assert_eq!(candidates[0].canonical_alias, "alias1");
    }
}
