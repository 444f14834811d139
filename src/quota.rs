//! QuotaEnforcer — key-level usage counters with rolling, daily, and weekly
//! policies, persisted and serialized per key.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{LimitType, QuotaDefinition, QuotaType};
use crate::store::{QuotaStateRow, Store};

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageCost {
    pub input: f64,
    pub output: f64,
    pub reasoning: f64,
    pub cached: f64,
    pub cache_write: f64,
}

impl UsageCost {
    fn requests(self) -> f64 {
        1.0
    }

    fn tokens(self) -> f64 {
        self.input + self.output + self.reasoning + self.cached + self.cache_write
    }

    fn for_limit_type(self, limit_type: LimitType) -> f64 {
        match limit_type {
            LimitType::Requests => self.requests(),
            LimitType::Tokens => self.tokens(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub allowed: bool,
    pub current_usage: f64,
    pub limit: f64,
    pub remaining: f64,
    pub resets_at: DateTime<Utc>,
}

pub struct QuotaEnforcer {
    store: Arc<dyn Store>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, locks: DashMap::new() }
    }

    fn lock_for(&self, key_name: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(key_name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Returns `None` when the key has no quota assigned, or the quota's
    /// `duration` fails to parse (fail-open, never blocks a key on a config typo).
    pub async fn check(
        &self,
        key_name: &str,
        quota_name: &str,
        quota: Option<&QuotaDefinition>,
    ) -> Option<CheckResult> {
        let quota = quota?;
        let lock = self.lock_for(key_name);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut row = self.load_or_reset(key_name, quota_name, quota.limit_type, now);

        if !apply_window(&mut row, quota, now) {
            return None;
        }

        let allowed = row.current_usage < quota.limit;
        let remaining = (quota.limit - row.current_usage).max(0.0);
        let resets_at = resets_at(&row, quota, now);

        self.store.save_quota_state(row.clone());

        Some(CheckResult { allowed, current_usage: row.current_usage, limit: quota.limit, remaining, resets_at })
    }

    pub async fn record(
        &self,
        key_name: &str,
        quota_name: &str,
        quota: Option<&QuotaDefinition>,
        usage: UsageCost,
    ) {
        let Some(quota) = quota else { return };
        let lock = self.lock_for(key_name);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut row = self.load_or_reset(key_name, quota_name, quota.limit_type, now);
        apply_window(&mut row, quota, now);

        row.current_usage += usage.for_limit_type(quota.limit_type);
        row.last_updated = now;
        self.store.save_quota_state(row);
    }

    pub fn clear(&self, key_name: &str) {
        self.store.clear_quota_state(key_name);
    }

    fn load_or_reset(
        &self,
        key_name: &str,
        quota_name: &str,
        limit_type: LimitType,
        now: DateTime<Utc>,
    ) -> QuotaStateRow {
        match self.store.load_quota_state(key_name) {
            Some(row) if row.matches_schema(quota_name, limit_type) => row,
            _ => QuotaStateRow::fresh(key_name, quota_name, limit_type, now),
        }
    }
}

/// Advances the window (leak for rolling, boundary reset for calendar).
/// Returns `false` when a rolling duration fails to parse.
fn apply_window(row: &mut QuotaStateRow, quota: &QuotaDefinition, now: DateTime<Utc>) -> bool {
    match quota.quota_type {
        QuotaType::Rolling => {
            let Some(duration_ms) = quota.duration.as_deref().and_then(parse_human_duration) else {
                tracing::warn!(quota_name = %row.quota_name, "rolling quota has unparseable duration");
                return false;
            };
            let elapsed_ms = (now - row.last_updated).num_milliseconds().max(0) as f64;
            let leak_rate = quota.limit / duration_ms as f64;
            let leaked = leak_rate * elapsed_ms;
            row.current_usage = (row.current_usage - leaked).max(0.0);
            true
        }
        QuotaType::Daily | QuotaType::Weekly => {
            let boundary = start_of_current_window(quota.quota_type, now);
            if row.window_start != Some(boundary) {
                row.current_usage = 0.0;
                row.window_start = Some(boundary);
            }
            true
        }
    }
}

fn resets_at(row: &QuotaStateRow, quota: &QuotaDefinition, now: DateTime<Utc>) -> DateTime<Utc> {
    match quota.quota_type {
        QuotaType::Rolling => {
            let duration_ms = quota.duration.as_deref().and_then(parse_human_duration).unwrap_or(0);
            let fraction = if quota.limit > 0.0 { row.current_usage / quota.limit } else { 0.0 };
            now + ChronoDuration::milliseconds((fraction * duration_ms as f64) as i64)
        }
        QuotaType::Daily => next_utc_midnight(now),
        QuotaType::Weekly => next_utc_sunday_midnight(now),
    }
}

fn start_of_current_window(quota_type: QuotaType, now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now.date_naive().and_hms_opt(0, 0, 0).expect("valid time");
    match quota_type {
        QuotaType::Daily => Utc.from_utc_datetime(&midnight),
        QuotaType::Weekly => {
            let days_since_sunday = now.weekday().num_days_from_sunday();
            let sunday = midnight - ChronoDuration::days(days_since_sunday as i64);
            Utc.from_utc_datetime(&sunday)
        }
        QuotaType::Rolling => unreachable!("rolling quotas have no calendar boundary"),
    }
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let today_midnight = Utc.from_utc_datetime(&now.date_naive().and_hms_opt(0, 0, 0).expect("valid time"));
    if now.hour() == 0 && now.minute() == 0 && now.second() == 0 {
        today_midnight
    } else {
        today_midnight + ChronoDuration::days(1)
    }
}

fn next_utc_sunday_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let today_midnight = Utc.from_utc_datetime(&now.date_naive().and_hms_opt(0, 0, 0).expect("valid time"));
    let days_until_sunday = (7 - now.weekday().num_days_from_sunday()) % 7;
    if days_until_sunday == 0 && now == today_midnight {
        today_midnight
    } else if days_until_sunday == 0 {
        today_midnight + ChronoDuration::days(7)
    } else {
        today_midnight + ChronoDuration::days(days_until_sunday as i64)
    }
}

/// Parses simple human durations like `1h`, `30m`, `1d` into milliseconds.
fn parse_human_duration(input: &str) -> Option<i64> {
    let input = input.trim();
    let (digits, unit) = input.split_at(input.find(|c: char| !c.is_ascii_digit())?);
    let value: i64 = digits.parse().ok()?;
    let multiplier = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return None,
    };
    Some(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonFileStore;

    fn temp_enforcer() -> QuotaEnforcer {
        let path = std::env::temp_dir().join(format!("plexus-quota-test-{}.json", uuid::Uuid::new_v4()));
        QuotaEnforcer::new(Arc::new(JsonFileStore::open(path, 100).unwrap()))
    }

    fn rolling_quota() -> QuotaDefinition {
        QuotaDefinition {
            quota_type: QuotaType::Rolling,
            limit_type: LimitType::Requests,
            limit: 5.0,
            duration: Some("1m".into()),
        }
    }

    #[tokio::test]
    async fn no_quota_configured_always_allows() {
        let enforcer = temp_enforcer();
        assert!(enforcer.check("k", "q", None).await.is_none());
    }

    #[tokio::test]
    async fn allows_until_limit_then_rejects() {
        let enforcer = temp_enforcer();
        let quota = rolling_quota();
        // record past the limit (not exactly at it) so real-time leak between
        // calls can't flip the comparison under slow/loaded test runs
        for _ in 0..7 {
            enforcer.record("k", "q", Some(&quota), UsageCost::default()).await;
        }
        let result = enforcer.check("k", "q", Some(&quota)).await.unwrap();
        assert!(!result.allowed);
        assert!((result.current_usage - 7.0).abs() < 0.1, "usage was {}", result.current_usage);
    }

    #[tokio::test]
    async fn schema_change_resets_usage() {
        let enforcer = temp_enforcer();
        let quota_a = rolling_quota();
        enforcer.record("k", "q", Some(&quota_a), UsageCost::default()).await;
        enforcer.record("k", "q", Some(&quota_a), UsageCost::default()).await;

        let quota_b = QuotaDefinition {
            quota_type: QuotaType::Rolling,
            limit_type: LimitType::Tokens,
            limit: 1000.0,
            duration: Some("1m".into()),
        };
        let result = enforcer.check("k", "q", Some(&quota_b)).await.unwrap();
        assert_eq!(result.current_usage, 0.0);
    }

    #[tokio::test]
    async fn unparseable_duration_fails_open() {
        let enforcer = temp_enforcer();
        let bad = QuotaDefinition {
            quota_type: QuotaType::Rolling,
            limit_type: LimitType::Requests,
            limit: 1.0,
            duration: Some("not-a-duration".into()),
        };
        assert!(enforcer.check("k", "q", Some(&bad)).await.is_none());
    }

    #[test]
    fn parses_known_duration_units() {
        assert_eq!(parse_human_duration("30m"), Some(30 * 60_000));
        assert_eq!(parse_human_duration("1h"), Some(3_600_000));
        assert_eq!(parse_human_duration("1d"), Some(86_400_000));
        assert_eq!(parse_human_duration("garbage"), None);
    }

    #[tokio::test]
    async fn clear_resets_persisted_state() {
        let enforcer = temp_enforcer();
        let quota = rolling_quota();
        enforcer.record("k", "q", Some(&quota), UsageCost::default()).await;
        enforcer.clear("k");
        let result = enforcer.check("k", "q", Some(&quota)).await.unwrap();
        assert_eq!(result.current_usage, 0.0);
    }
}
