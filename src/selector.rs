//! Selector family — picks one candidate from a healthy candidate set.

use rand::Rng;

use crate::config::{Pricing, SelectorKind};

/// Aggregation source the `performance`/`latency`/`usage` selectors read
/// from. Substitutable in tests; backed in production by the usage store.
pub trait SelectorStats: Send + Sync {
    fn throughput_tokens_per_sec(&self, provider: &str, model: &str) -> Option<f64>;
    fn avg_ttft_ms(&self, provider: &str, model: &str) -> Option<f64>;
    fn request_count_24h(&self, provider: &str, model: &str) -> Option<u64>;
}

/// Looks up live per-token rates for `source=openrouter` pricing. The real
/// lookup service is an external collaborator — this crate ships only the
/// interface plus a null implementation that always misses (cost 0).
pub trait PricingLookup: Send + Sync {
    fn rate_per_token(&self, slug: &str) -> Option<(f64, f64)>;
}

pub struct NullPricingLookup;

impl PricingLookup for NullPricingLookup {
    fn rate_per_token(&self, _slug: &str) -> Option<(f64, f64)> {
        None
    }
}

const SYNTHETIC_INPUT_TOKENS: f64 = 1000.0;
const SYNTHETIC_OUTPUT_TOKENS: f64 = 500.0;

/// Selects one candidate by index using the given policy. Returns `None` for
/// an empty candidate list.
#[allow(clippy::too_many_arguments)]
pub fn select<T>(
    candidates: &[T],
    kind: SelectorKind,
    provider_of: impl Fn(&T) -> &str,
    model_of: impl Fn(&T) -> &str,
    pricing_of: impl Fn(&T) -> Option<&Pricing>,
    discount_of: impl Fn(&T) -> f64,
    stats: &dyn SelectorStats,
    lookup: &dyn PricingLookup,
    performance_exploration_rate: f64,
    latency_exploration_rate: Option<f64>,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return Some(0);
    }

    match kind {
        SelectorKind::InOrder => Some(0),
        SelectorKind::Random => Some(rand::thread_rng().gen_range(0..candidates.len())),
        SelectorKind::Cost => {
            let costs: Vec<f64> = candidates
                .iter()
                .map(|c| {
                    calculate_cost(
                        pricing_of(c),
                        discount_of(c),
                        SYNTHETIC_INPUT_TOKENS,
                        SYNTHETIC_OUTPUT_TOKENS,
                        0.0,
                        0.0,
                        lookup,
                    )
                })
                .collect();
            argmin(&costs)
        }
        SelectorKind::Performance => {
            let scores: Vec<f64> = candidates
                .iter()
                .map(|c| stats.throughput_tokens_per_sec(provider_of(c), model_of(c)).unwrap_or(0.0))
                .collect();
            epsilon_greedy_max(&scores, performance_exploration_rate)
        }
        SelectorKind::Latency => {
            let scores: Vec<Option<f64>> =
                candidates.iter().map(|c| stats.avg_ttft_ms(provider_of(c), model_of(c))).collect();
            let rate = latency_exploration_rate.unwrap_or(performance_exploration_rate);
            epsilon_greedy_min_missing_last(&scores, rate)
        }
        SelectorKind::Usage => {
            let counts: Vec<u64> = candidates
                .iter()
                .map(|c| stats.request_count_24h(provider_of(c), model_of(c)).unwrap_or(0))
                .collect();
            argmin(&counts.iter().map(|&c| c as f64).collect::<Vec<_>>())
        }
    }
}

fn argmin(scores: &[f64]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
}

fn argmax(scores: &[f64]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
}

fn epsilon_greedy_max(scores: &[f64], exploration_rate: f64) -> Option<usize> {
    let best = argmax(scores)?;
    if rand::thread_rng().gen_bool(exploration_rate.clamp(0.0, 1.0)) {
        let others: Vec<usize> = (0..scores.len()).filter(|&i| i != best).collect();
        if !others.is_empty() {
            return Some(others[rand::thread_rng().gen_range(0..others.len())]);
        }
    }
    Some(best)
}

/// Missing data sorts last — candidates with `None` score are treated as
/// worse than any present value.
fn epsilon_greedy_min_missing_last(scores: &[Option<f64>], exploration_rate: f64) -> Option<usize> {
    let best = scores
        .iter()
        .enumerate()
        .min_by(|a, b| match (a.1, b.1) {
            (Some(x), Some(y)) => x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        })
        .map(|(i, _)| i)?;
    if rand::thread_rng().gen_bool(exploration_rate.clamp(0.0, 1.0)) {
        let others: Vec<usize> = (0..scores.len()).filter(|&i| i != best).collect();
        if !others.is_empty() {
            return Some(others[rand::thread_rng().gen_range(0..others.len())]);
        }
    }
    Some(best)
}

/// Computes cost for `(inTokens, outTokens, cached, cacheWrite)` under the
/// given pricing source. Missing pricing yields 0.
pub fn calculate_cost(
    pricing: Option<&Pricing>,
    provider_discount: f64,
    in_tokens: f64,
    out_tokens: f64,
    cached: f64,
    cache_write: f64,
    lookup: &dyn PricingLookup,
) -> f64 {
    let Some(pricing) = pricing else { return 0.0 };
    match pricing {
        Pricing::Simple { input, output, cached: cached_rate, cache_write: cache_write_rate } => {
            (in_tokens / 1e6) * input
                + (out_tokens / 1e6) * output
                + (cached / 1e6) * cached_rate
                + (cache_write / 1e6) * cache_write_rate
        }
        Pricing::Defined { ranges } => {
            let Some(range) = ranges.iter().find(|r| {
                in_tokens >= r.lower_bound && r.upper_bound.map(|u| in_tokens <= u).unwrap_or(true)
            }) else {
                return 0.0;
            };
            (in_tokens / 1e6) * range.input + (out_tokens / 1e6) * range.output
        }
        Pricing::Openrouter { slug, discount } => {
            let Some((input_rate, output_rate)) = lookup.rate_per_token(slug) else { return 0.0 };
            let effective_discount = discount.unwrap_or(provider_discount);
            let raw = in_tokens * input_rate + out_tokens * output_rate;
            raw * (1.0 - effective_discount)
        }
        Pricing::PerRequest { amount } => *amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PricingRange;

    struct FixedStats {
        throughput: Option<f64>,
        ttft: Option<f64>,
        count: Option<u64>,
    }

    impl SelectorStats for FixedStats {
        fn throughput_tokens_per_sec(&self, _p: &str, _m: &str) -> Option<f64> {
            self.throughput
        }
        fn avg_ttft_ms(&self, _p: &str, _m: &str) -> Option<f64> {
            self.ttft
        }
        fn request_count_24h(&self, _p: &str, _m: &str) -> Option<u64> {
            self.count
        }
    }

    #[test]
    fn simple_pricing_computes_per_million_cost() {
        let pricing = Pricing::Simple { input: 3.0, output: 15.0, cached: 0.0, cache_write: 0.0 };
        let cost = calculate_cost(Some(&pricing), 0.0, 1_000_000.0, 1_000_000.0, 0.0, 0.0, &NullPricingLookup);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn missing_pricing_costs_zero() {
        let cost = calculate_cost(None, 0.0, 1000.0, 500.0, 0.0, 0.0, &NullPricingLookup);
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn defined_pricing_picks_matching_range() {
        let pricing = Pricing::Defined {
            ranges: vec![
                PricingRange { lower_bound: 0.0, upper_bound: Some(128_000.0), input: 1.0, output: 2.0 },
                PricingRange { lower_bound: 128_000.0, upper_bound: None, input: 3.0, output: 6.0 },
            ],
        };
        let small = calculate_cost(Some(&pricing), 0.0, 50_000.0, 10_000.0, 0.0, 0.0, &NullPricingLookup);
        assert!((small - (50_000.0 / 1e6 * 1.0 + 10_000.0 / 1e6 * 2.0)).abs() < 1e-9);

        let large = calculate_cost(Some(&pricing), 0.0, 200_000.0, 1_000_000.0, 0.0, 0.0, &NullPricingLookup);
        assert!((large - (200_000.0 / 1e6 * 3.0 + 1_000_000.0 / 1e6 * 6.0)).abs() < 1e-9);
    }

    #[test]
    fn per_request_pricing_is_flat() {
        let pricing = Pricing::PerRequest { amount: 0.04 };
        assert_eq!(calculate_cost(Some(&pricing), 0.0, 1.0, 1.0, 0.0, 0.0, &NullPricingLookup), 0.04);
    }

    #[test]
    fn cost_is_deterministic_for_identical_inputs() {
        let pricing = Pricing::Simple { input: 1.0, output: 2.0, cached: 0.1, cache_write: 0.2 };
        let a = calculate_cost(Some(&pricing), 0.1, 500.0, 100.0, 10.0, 5.0, &NullPricingLookup);
        let b = calculate_cost(Some(&pricing), 0.1, 500.0, 100.0, 10.0, 5.0, &NullPricingLookup);
        assert_eq!(a, b);
    }

    #[test]
    fn in_order_always_picks_first() {
        let candidates = vec!["a", "b", "c"];
        let idx = select(
            &candidates, SelectorKind::InOrder, |c| c, |c| c, |_| None, |_| 0.0,
            &FixedStats { throughput: None, ttft: None, count: None }, &NullPricingLookup, 0.0, None,
        );
        assert_eq!(idx, Some(0));
    }

    #[test]
    fn single_candidate_always_selected() {
        let candidates = vec!["only"];
        let idx = select(
            &candidates, SelectorKind::Random, |c| c, |c| c, |_| None, |_| 0.0,
            &FixedStats { throughput: None, ttft: None, count: None }, &NullPricingLookup, 0.0, None,
        );
        assert_eq!(idx, Some(0));
    }

    #[test]
    fn empty_candidates_returns_none() {
        let candidates: Vec<&str> = vec![];
        let idx = select(
            &candidates, SelectorKind::Random, |c| c, |c| c, |_| None, |_| 0.0,
            &FixedStats { throughput: None, ttft: None, count: None }, &NullPricingLookup, 0.0, None,
        );
        assert_eq!(idx, None);
    }

    #[test]
    fn performance_selector_without_exploration_always_picks_best() {
        struct PerProvider;
        impl SelectorStats for PerProvider {
            fn throughput_tokens_per_sec(&self, p: &str, _m: &str) -> Option<f64> {
                Some(if p == "fast" { 100.0 } else { 10.0 })
            }
            fn avg_ttft_ms(&self, _p: &str, _m: &str) -> Option<f64> {
                None
            }
            fn request_count_24h(&self, _p: &str, _m: &str) -> Option<u64> {
                None
            }
        }
        let candidates = vec!["slow", "fast"];
        let idx = select(
            &candidates, SelectorKind::Performance, |c| c, |_| "m", |_| None, |_| 0.0,
            &PerProvider, &NullPricingLookup, 0.0, None,
        );
        assert_eq!(idx, Some(1));
    }

    #[test]
    fn latency_selector_sorts_missing_data_last() {
        struct PerProvider;
        impl SelectorStats for PerProvider {
            fn throughput_tokens_per_sec(&self, _p: &str, _m: &str) -> Option<f64> {
                None
            }
            fn avg_ttft_ms(&self, p: &str, _m: &str) -> Option<f64> {
                if p == "known" { Some(50.0) } else { None }
            }
            fn request_count_24h(&self, _p: &str, _m: &str) -> Option<u64> {
                None
            }
        }
        let candidates = vec!["unknown", "known"];
        let idx = select(
            &candidates, SelectorKind::Latency, |c| c, |_| "m", |_| None, |_| 0.0,
            &PerProvider, &NullPricingLookup, 0.0, None,
        );
        assert_eq!(idx, Some(1));
    }
}
