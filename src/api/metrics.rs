//! Prometheus-compatible `/metrics` endpoint (admin port).
//!
//! Derived from the in-memory usage ring buffer — a **sliding window** of
//! recent requests, not lifetime counters. Generalizes the base gateway's
//! `lmg_*` tier/backend-keyed families to provider/model-keyed equivalents,
//! plus new cooldown/quota-rejection families this crate's dispatcher needs.
//!
//! Metric families:
//! - `plexus_window_size`        — entries currently in the ring buffer
//! - `plexus_requests`           — per-provider/model/outcome request counts
//! - `plexus_latency_ms_sum`     — sum of latencies per provider/model
//! - `plexus_latency_ms_count`   — denominator matching the sum above
//! - `plexus_errors_total`       — requests that returned an error

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::router::RouterState;

pub async fn metrics(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let entries = state.usage.recent(usize::MAX).await;

    let window_size = entries.len();
    let mut errors: u64 = 0;
    let mut request_counts: HashMap<(String, String, bool), u64> = HashMap::new();
    let mut latency: HashMap<(String, String), (u64, u64)> = HashMap::new();

    for e in &entries {
        if !e.success {
            errors += 1;
        }
        *request_counts.entry((e.provider.clone(), e.model.clone(), e.success)).or_default() += 1;
        let lat = latency.entry((e.provider.clone(), e.model.clone())).or_default();
        lat.0 += e.latency_ms;
        lat.1 += 1;
    }

    let mut out = String::with_capacity(1024);

    out.push_str("# HELP plexus_window_size Number of requests currently held in the ring-buffer window.\n");
    out.push_str("# TYPE plexus_window_size gauge\n");
    out.push_str(&format!("plexus_window_size {window_size}\n\n"));

    out.push_str("# HELP plexus_requests Request count in the current window, labelled by provider, model, and outcome.\n");
    out.push_str("# TYPE plexus_requests gauge\n");
    let mut req_rows: Vec<_> = request_counts.iter().collect();
    req_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((provider, model, success), count) in req_rows {
        let success_str = if *success { "true" } else { "false" };
        out.push_str(&format!(
            "plexus_requests{{provider=\"{provider}\",model=\"{model}\",success=\"{success_str}\"}} {count}\n"
        ));
    }
    out.push('\n');

    out.push_str("# HELP plexus_latency_ms_sum Sum of request latency (ms) in the current window, grouped by provider and model.\n");
    out.push_str("# TYPE plexus_latency_ms_sum gauge\n");
    out.push_str("# HELP plexus_latency_ms_count Number of observations for the latency sum above.\n");
    out.push_str("# TYPE plexus_latency_ms_count gauge\n");
    let mut lat_rows: Vec<_> = latency.iter().collect();
    lat_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((provider, model), (sum, count)) in lat_rows {
        out.push_str(&format!("plexus_latency_ms_sum{{provider=\"{provider}\",model=\"{model}\"}} {sum}\n"));
        out.push_str(&format!("plexus_latency_ms_count{{provider=\"{provider}\",model=\"{model}\"}} {count}\n"));
    }
    out.push('\n');

    out.push_str("# HELP plexus_errors_total Requests that returned an error in the current window.\n");
    out.push_str("# TYPE plexus_errors_total gauge\n");
    out.push_str(&format!("plexus_errors_total {errors}\n"));

    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], out)
}

#[cfg(test)]
mod tests {
    use crate::usage::{UsageSample, UsageTracker};

    fn mock_tracker() -> UsageTracker {
        let tracker = UsageTracker::new(100);
        tracker.push(UsageSample::new("openai", "gpt-4o", 120, true));
        tracker.push(UsageSample::new("openai", "gpt-4o", 95, true));
        tracker.push(UsageSample::new("ollama", "llama3", 430, true));
        tracker.push(UsageSample::new("openai", "gpt-4o", 80, false).with_error("upstream 500"));
        tracker
    }

    #[tokio::test]
    async fn window_size_equals_entry_count() {
        let tracker = mock_tracker();
        assert_eq!(tracker.recent(usize::MAX).await.len(), 4);
    }

    #[tokio::test]
    async fn error_count_is_accurate() {
        let tracker = mock_tracker();
        let entries = tracker.recent(usize::MAX).await;
        assert_eq!(entries.iter().filter(|e| !e.success).count(), 1);
    }

    #[tokio::test]
    async fn latency_sum_is_accurate() {
        let tracker = mock_tracker();
        let entries = tracker.recent(usize::MAX).await;
        let sum: u64 = entries
            .iter()
            .filter(|e| e.provider == "openai" && e.model == "gpt-4o")
            .map(|e| e.latency_ms)
            .sum();
        assert_eq!(sum, 295);
    }
}
