//! Persistence adapter for cooldowns, quota state, usage records, and debug logs.
//!
//! Per-operation interfaces only — the backing engine is an external
//! collaborator. This crate ships one concrete adapter: a single JSON
//! document guarded by a mutex, flushed to disk on every mutation. A real
//! deployment would swap in a SQL-backed [`Store`]; the trait boundary is
//! exactly the one a migration would need.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LimitType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownRow {
    pub provider: String,
    pub model: String,
    pub account_id: Option<String>,
    pub expiry: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStateRow {
    pub key_name: String,
    pub quota_name: String,
    pub limit_type: LimitType,
    pub current_usage: f64,
    pub last_updated: DateTime<Utc>,
    pub window_start: Option<DateTime<Utc>>,
}

impl QuotaStateRow {
    pub fn fresh(key_name: &str, quota_name: &str, limit_type: LimitType, now: DateTime<Utc>) -> Self {
        Self {
            key_name: key_name.to_string(),
            quota_name: quota_name.to_string(),
            limit_type,
            current_usage: 0.0,
            last_updated: now,
            window_start: None,
        }
    }

    pub fn matches_schema(&self, quota_name: &str, limit_type: LimitType) -> bool {
        self.quota_name == quota_name && self.limit_type == limit_type
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub date: DateTime<Utc>,
    pub source_ip: Option<String>,
    pub api_key: String,
    pub incoming_api_type: String,
    pub provider: String,
    pub incoming_model_alias: String,
    pub selected_model_name: String,
    pub outgoing_api_type: String,
    pub tokens_input: f64,
    pub tokens_output: f64,
    pub tokens_reasoning: f64,
    pub tokens_cached: f64,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub is_streamed: bool,
    pub response_status: String,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugLogRow {
    pub request_id: String,
    pub raw_request: serde_json::Value,
    pub transformed_request: serde_json::Value,
    pub raw_response: serde_json::Value,
    pub transformed_response: serde_json::Value,
    pub raw_response_snapshot: serde_json::Value,
    pub transformed_response_snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// The operations the rest of the gateway needs from a persistence backend.
pub trait Store: Send + Sync {
    fn load_cooldowns(&self) -> Vec<CooldownRow>;
    fn upsert_cooldown(&self, row: CooldownRow);
    fn delete_cooldown(&self, provider: &str, model: &str, account_id: Option<&str>);
    /// Wildcard clear: `None` scopes match everything below that level.
    fn clear_cooldowns(&self, provider: Option<&str>, model: Option<&str>, account_id: Option<&str>);

    fn load_quota_state(&self, key_name: &str) -> Option<QuotaStateRow>;
    fn save_quota_state(&self, row: QuotaStateRow);
    fn clear_quota_state(&self, key_name: &str);

    fn save_usage(&self, record: UsageRecord);
    fn recent_usage(&self, limit: usize) -> Vec<UsageRecord>;

    fn save_debug_log(&self, row: DebugLogRow);
}

#[derive(Default, Serialize, Deserialize)]
struct Document {
    cooldowns: Vec<CooldownRow>,
    quota_state: HashMap<String, QuotaStateRow>,
    #[serde(default)]
    usage: Vec<UsageRecord>,
    #[serde(default)]
    debug_logs: Vec<DebugLogRow>,
}

/// JSON-file-backed [`Store`]. Adequate for single-process deployments; every
/// mutation rewrites the whole file under a mutex, which is the deliberate
/// simplification this crate makes in place of a SQL adapter (see DESIGN.md).
pub struct JsonFileStore {
    path: PathBuf,
    doc: Mutex<Document>,
    /// Caps the in-memory/on-disk usage log so it doesn't grow unbounded.
    usage_capacity: usize,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>, usage_capacity: usize) -> anyhow::Result<Self> {
        let path = path.into();
        let doc = Self::read(&path)?;
        Ok(Self {
            path,
            doc: Mutex::new(doc),
            usage_capacity,
        })
    }

    fn read(path: &Path) -> anyhow::Result<Document> {
        match std::fs::read_to_string(path) {
            Ok(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
            _ => Ok(Document::default()),
        }
    }

    fn flush(&self, doc: &Document) {
        if let Some(parent) = self.path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                tracing::warn!(error = %err, "failed to create store directory");
                return;
            }
        }
        match serde_json::to_string(doc) {
            Ok(json) => {
                if let Err(err) = std::fs::write(&self.path, json) {
                    tracing::warn!(error = %err, path = %self.path.display(), "failed to flush store");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to serialize store document"),
        }
    }
}

impl Store for JsonFileStore {
    fn load_cooldowns(&self) -> Vec<CooldownRow> {
        self.doc.lock().expect("store lock poisoned").cooldowns.clone()
    }

    fn upsert_cooldown(&self, row: CooldownRow) {
        let mut doc = self.doc.lock().expect("store lock poisoned");
        doc.cooldowns.retain(|r| {
            !(r.provider == row.provider && r.model == row.model && r.account_id == row.account_id)
        });
        doc.cooldowns.push(row);
        self.flush(&doc);
    }

    fn delete_cooldown(&self, provider: &str, model: &str, account_id: Option<&str>) {
        let mut doc = self.doc.lock().expect("store lock poisoned");
        doc.cooldowns.retain(|r| {
            !(r.provider == provider && r.model == model && r.account_id.as_deref() == account_id)
        });
        self.flush(&doc);
    }

    fn clear_cooldowns(&self, provider: Option<&str>, model: Option<&str>, account_id: Option<&str>) {
        let mut doc = self.doc.lock().expect("store lock poisoned");
        doc.cooldowns.retain(|r| {
            let provider_match = provider.map(|p| r.provider == p).unwrap_or(true);
            let model_match = model.map(|m| r.model == m).unwrap_or(true);
            let account_match = account_id.map(|a| r.account_id.as_deref() == Some(a)).unwrap_or(true);
            !(provider_match && model_match && account_match)
        });
        self.flush(&doc);
    }

    fn load_quota_state(&self, key_name: &str) -> Option<QuotaStateRow> {
        self.doc.lock().expect("store lock poisoned").quota_state.get(key_name).cloned()
    }

    fn save_quota_state(&self, row: QuotaStateRow) {
        let mut doc = self.doc.lock().expect("store lock poisoned");
        doc.quota_state.insert(row.key_name.clone(), row);
        self.flush(&doc);
    }

    fn clear_quota_state(&self, key_name: &str) {
        let mut doc = self.doc.lock().expect("store lock poisoned");
        doc.quota_state.remove(key_name);
        self.flush(&doc);
    }

    fn save_usage(&self, record: UsageRecord) {
        let mut doc = self.doc.lock().expect("store lock poisoned");
        doc.usage.push(record);
        if doc.usage.len() > self.usage_capacity {
            let overflow = doc.usage.len() - self.usage_capacity;
            doc.usage.drain(0..overflow);
        }
        self.flush(&doc);
    }

    fn recent_usage(&self, limit: usize) -> Vec<UsageRecord> {
        let doc = self.doc.lock().expect("store lock poisoned");
        doc.usage.iter().rev().take(limit).cloned().collect()
    }

    fn save_debug_log(&self, row: DebugLogRow) {
        let mut doc = self.doc.lock().expect("store lock poisoned");
        doc.debug_logs.push(row);
        self.flush(&doc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> JsonFileStore {
        let path = std::env::temp_dir().join(format!("plexus-store-test-{}.json", uuid::Uuid::new_v4()));
        JsonFileStore::open(path, 500).unwrap()
    }

    #[test]
    fn upsert_cooldown_replaces_existing_row_for_same_key() {
        let store = temp_store();
        let row = |expiry| CooldownRow {
            provider: "a".into(),
            model: "m".into(),
            account_id: None,
            expiry,
            created_at: Utc::now(),
        };
        store.upsert_cooldown(row(100));
        store.upsert_cooldown(row(200));
        let rows = store.load_cooldowns();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].expiry, 200);
    }

    #[test]
    fn quota_state_round_trips() {
        let store = temp_store();
        let row = QuotaStateRow::fresh("k1", "q1", LimitType::Requests, Utc::now());
        store.save_quota_state(row.clone());
        let loaded = store.load_quota_state("k1").unwrap();
        assert_eq!(loaded.quota_name, "q1");
        store.clear_quota_state("k1");
        assert!(store.load_quota_state("k1").is_none());
    }

    #[test]
    fn usage_capacity_trims_oldest_entries() {
        let path = std::env::temp_dir().join(format!("plexus-store-test-{}.json", uuid::Uuid::new_v4()));
        let store = JsonFileStore::open(path, 2).unwrap();
        for i in 0..5 {
            store.save_usage(UsageRecord {
                request_id: i.to_string(),
                date: Utc::now(),
                source_ip: None,
                api_key: "k".into(),
                incoming_api_type: "chat".into(),
                provider: "a".into(),
                incoming_model_alias: "m".into(),
                selected_model_name: "m".into(),
                outgoing_api_type: "chat".into(),
                tokens_input: 0.0,
                tokens_output: 0.0,
                tokens_reasoning: 0.0,
                tokens_cached: 0.0,
                start_time: Utc::now(),
                duration_ms: 0,
                is_streamed: false,
                response_status: "success".into(),
                cost: 0.0,
            });
        }
        let recent = store.recent_usage(10);
        assert_eq!(recent.len(), 2);
    }
}
