//! In-memory usage ring buffer — backs the `performance`/`latency`/`usage`
//! selectors and the admin traffic view and `/metrics` endpoint.
//!
//! A fixed-capacity ring buffer, same shape as the base gateway's
//! `TrafficLog`, generalized from a single `(tier, backend)` pair to
//! arbitrary `(provider, model)` pairs.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::selector::SelectorStats;

#[derive(Debug, Clone, Serialize)]
pub struct UsageSample {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    pub ttft_ms: Option<u64>,
    pub tokens: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Fixed-capacity ring-buffer of recent [`UsageSample`] records.
pub struct UsageTracker {
    capacity: usize,
    entries: Mutex<VecDeque<UsageSample>>,
}

impl UsageTracker {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Best-effort non-blocking push — drop on lock contention rather than
    /// delaying the request path.
    pub fn push(&self, sample: UsageSample) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(sample);
        }
    }

    pub async fn recent(&self, limit: usize) -> Vec<UsageSample> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub async fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };
        let error_count = entries.iter().filter(|e| !e.success).count();
        TrafficStats { total_requests: total, error_count, avg_latency_ms }
    }
}

#[derive(Debug, Serialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    pub error_count: usize,
    pub avg_latency_ms: f64,
}

impl UsageSample {
    pub fn new(provider: &str, model: &str, latency_ms: u64, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            provider: provider.to_string(),
            model: model.to_string(),
            latency_ms,
            ttft_ms: None,
            tokens: 0,
            success,
            error: None,
        }
    }

    pub fn with_ttft(mut self, ttft_ms: u64) -> Self {
        self.ttft_ms = Some(ttft_ms);
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_error(mut self, err: &str) -> Self {
        self.error = Some(err.to_string());
        self
    }
}

/// Synchronous snapshot of the tracker used by the selector family — selector
/// calls happen inline in the dispatch hot path, so stats are read from a
/// point-in-time clone rather than re-locking per lookup.
pub struct TrackerSnapshot {
    samples: Vec<UsageSample>,
}

impl TrackerSnapshot {
    pub async fn capture(tracker: &UsageTracker) -> Self {
        Self { samples: tracker.recent(usize::MAX).await }
    }
}

impl SelectorStats for TrackerSnapshot {
    fn throughput_tokens_per_sec(&self, provider: &str, model: &str) -> Option<f64> {
        let matching: Vec<&UsageSample> = self
            .samples
            .iter()
            .filter(|s| s.provider == provider && s.model == model && s.success && s.tokens > 0)
            .collect();
        if matching.is_empty() {
            return None;
        }
        let total_tokens: u64 = matching.iter().map(|s| s.tokens).sum();
        let total_secs: f64 = matching.iter().map(|s| s.latency_ms as f64 / 1000.0).sum();
        if total_secs <= 0.0 {
            return None;
        }
        Some(total_tokens as f64 / total_secs)
    }

    fn avg_ttft_ms(&self, provider: &str, model: &str) -> Option<f64> {
        let matching: Vec<u64> = self
            .samples
            .iter()
            .filter(|s| s.provider == provider && s.model == model)
            .filter_map(|s| s.ttft_ms)
            .collect();
        if matching.is_empty() {
            return None;
        }
        Some(matching.iter().sum::<u64>() as f64 / matching.len() as f64)
    }

    fn request_count_24h(&self, provider: &str, model: &str) -> Option<u64> {
        let cutoff = Utc::now() - Duration::hours(24);
        let count = self
            .samples
            .iter()
            .filter(|s| s.provider == provider && s.model == model && s.timestamp >= cutoff)
            .count();
        Some(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oldest_entry_evicted_when_capacity_exceeded() {
        let tracker = UsageTracker::new(2);
        tracker.push(UsageSample::new("a", "m", 1, true));
        tracker.push(UsageSample::new("a", "m", 2, true));
        tracker.push(UsageSample::new("a", "m", 3, true));
        let all = tracker.recent(10).await;
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn throughput_averages_tokens_per_second() {
        let tracker = UsageTracker::new(10);
        tracker.push(UsageSample::new("a", "m", 1000, true).with_tokens(100));
        let snapshot = TrackerSnapshot::capture(&tracker).await;
        assert_eq!(snapshot.throughput_tokens_per_sec("a", "m"), Some(100.0));
    }

    #[tokio::test]
    async fn missing_model_has_no_stats() {
        let tracker = UsageTracker::new(10);
        let snapshot = TrackerSnapshot::capture(&tracker).await;
        assert_eq!(snapshot.throughput_tokens_per_sec("a", "m"), None);
        assert_eq!(snapshot.avg_ttft_ms("a", "m"), None);
    }
}
