//! CooldownManager — persistent key-scoped quarantine for `(provider, model, account)`
//! tuples that failed recently.

use std::sync::Arc;

use dashmap::DashMap;

use crate::store::{CooldownRow, Store};

#[derive(Clone, PartialEq, Eq, Hash)]
struct CooldownKey {
    provider: String,
    model: String,
    account_id: Option<String>,
}

/// HTTP statuses that trigger a cooldown mark.
pub fn is_transient_status(status: u16) -> bool {
    status >= 500 || matches!(status, 401 | 408 | 429)
}

pub struct CooldownManager {
    map: DashMap<CooldownKey, i64>,
    store: Arc<dyn Store>,
    default_duration_ms: i64,
}

impl CooldownManager {
    pub fn new(store: Arc<dyn Store>, default_cooldown_minutes: u64) -> Self {
        let manager = Self {
            map: DashMap::new(),
            store,
            default_duration_ms: (default_cooldown_minutes * 60 * 1000) as i64,
        };
        manager.load_from_storage();
        manager
    }

    /// Startup: drop expired rows, load the rest into the in-memory map.
    fn load_from_storage(&self) {
        let now = now_millis();
        for row in self.store.load_cooldowns() {
            if row.expiry < now {
                self.store.delete_cooldown(&row.provider, &row.model, row.account_id.as_deref());
            } else {
                self.map.insert(
                    CooldownKey { provider: row.provider, model: row.model, account_id: row.account_id },
                    row.expiry,
                );
            }
        }
    }

    pub fn mark_failure(
        &self,
        provider: &str,
        model: &str,
        account_id: Option<&str>,
        duration_ms: Option<i64>,
    ) {
        let expiry = now_millis() + duration_ms.unwrap_or(self.default_duration_ms);
        let key = CooldownKey {
            provider: provider.to_string(),
            model: model.to_string(),
            account_id: account_id.map(str::to_string),
        };
        self.map.insert(key.clone(), expiry);
        self.store.upsert_cooldown(CooldownRow {
            provider: key.provider,
            model: key.model,
            account_id: key.account_id,
            expiry,
            created_at: chrono::Utc::now(),
        });
        tracing::warn!(provider, model, ?account_id, expiry, "provider marked for cooldown");
    }

    /// `true` when no entry exists or the stored expiry has passed; expired
    /// entries are deleted eagerly from both the map and the store.
    pub fn is_healthy(&self, provider: &str, model: &str, account_id: Option<&str>) -> bool {
        let key = CooldownKey {
            provider: provider.to_string(),
            model: model.to_string(),
            account_id: account_id.map(str::to_string),
        };
        let expired = match self.map.get(&key) {
            None => return true,
            Some(entry) => *entry <= now_millis(),
        };
        if expired {
            self.map.remove(&key);
            self.store.delete_cooldown(provider, model, account_id);
            true
        } else {
            false
        }
    }

    /// Filters `targets` to those currently healthy, preserving order.
    pub fn filter_healthy<'a, T>(
        &self,
        targets: &'a [T],
        provider_of: impl Fn(&T) -> &str,
        model_of: impl Fn(&T) -> &str,
        account_of: impl Fn(&T) -> Option<&str>,
    ) -> Vec<&'a T> {
        targets
            .iter()
            .filter(|t| self.is_healthy(provider_of(t), model_of(t), account_of(t)))
            .collect()
    }

    /// Wildcard clear from the right: absence of a scope means "all below it".
    pub fn clear(&self, provider: Option<&str>, model: Option<&str>, account_id: Option<&str>) {
        self.map.retain(|key, _| {
            let provider_match = provider.map(|p| key.provider == p).unwrap_or(true);
            let model_match = model.map(|m| key.model == m).unwrap_or(true);
            let account_match = account_id.map(|a| key.account_id.as_deref() == Some(a)).unwrap_or(true);
            !(provider_match && model_match && account_match)
        });
        self.store.clear_cooldowns(provider, model, account_id);
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonFileStore;

    fn temp_store() -> Arc<dyn Store> {
        let path = std::env::temp_dir().join(format!("plexus-cooldown-test-{}.json", uuid::Uuid::new_v4()));
        Arc::new(JsonFileStore::open(path, 100).unwrap())
    }

    #[test]
    fn healthy_by_default() {
        let mgr = CooldownManager::new(temp_store(), 10);
        assert!(mgr.is_healthy("a", "m", None));
    }

    #[test]
    fn mark_failure_makes_target_unhealthy_until_duration_elapses() {
        let mgr = CooldownManager::new(temp_store(), 10);
        mgr.mark_failure("a", "m", None, Some(60_000));
        assert!(!mgr.is_healthy("a", "m", None));
    }

    #[test]
    fn expired_entry_heals_and_is_evicted() {
        let mgr = CooldownManager::new(temp_store(), 10);
        mgr.mark_failure("a", "m", None, Some(-1));
        assert!(mgr.is_healthy("a", "m", None));
        assert!(mgr.map.is_empty());
    }

    #[test]
    fn clear_with_no_scope_removes_everything() {
        let mgr = CooldownManager::new(temp_store(), 10);
        mgr.mark_failure("a", "m1", None, Some(60_000));
        mgr.mark_failure("b", "m2", None, Some(60_000));
        mgr.clear(None, None, None);
        assert!(mgr.is_healthy("a", "m1", None));
        assert!(mgr.is_healthy("b", "m2", None));
    }

    #[test]
    fn clear_scoped_to_provider_only_affects_that_provider() {
        let mgr = CooldownManager::new(temp_store(), 10);
        mgr.mark_failure("a", "m1", None, Some(60_000));
        mgr.mark_failure("b", "m2", None, Some(60_000));
        mgr.clear(Some("a"), None, None);
        assert!(mgr.is_healthy("a", "m1", None));
        assert!(!mgr.is_healthy("b", "m2", None));
    }

    #[test]
    fn filter_healthy_preserves_order_and_drops_cooling_down() {
        let mgr = CooldownManager::new(temp_store(), 10);
        mgr.mark_failure("a", "m1", None, Some(60_000));
        let targets = vec![("a", "m1"), ("b", "m2"), ("c", "m3")];
        let healthy = mgr.filter_healthy(&targets, |t| t.0, |t| t.1, |_| None);
        assert_eq!(healthy, vec![&("b", "m2"), &("c", "m3")]);
    }

    #[test]
    fn cooldown_survives_reload_from_store() {
        let store = temp_store();
        {
            let mgr = CooldownManager::new(Arc::clone(&store), 10);
            mgr.mark_failure("a", "m", None, Some(60_000));
        }
        let reloaded = CooldownManager::new(store, 10);
        assert!(!reloaded.is_healthy("a", "m", None));
    }
}
