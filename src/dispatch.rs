//! Dispatcher — the outer failover loop that turns a resolved candidate set
//! into an upstream HTTP call, with cooldown marking and pass-through.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};

use crate::config::{AliasBehavior, Config, Dialect, ModelAlias, Pricing, ProviderConfig};
use crate::cooldown;
use crate::error::GatewayError;
use crate::router::{self, Candidate, RouterState};
use crate::selector::{self, NullPricingLookup, SelectorStats};
use crate::transform::{self, Transformer};

/// Routing metadata attached to a successful dispatch, surfaced to clients
/// and to usage accounting.
#[derive(Debug, Clone)]
pub struct RouteInfo {
    pub provider: String,
    pub model: String,
    pub dialect: Dialect,
    pub canonical_alias: String,
    pub pricing: Option<Pricing>,
    pub discount: f64,
}

pub struct DispatchOutcome {
    pub status: u16,
    pub body: Value,
    pub bypass_transformation: bool,
    /// Present only when transformation occurred — the untransformed upstream body.
    pub raw_body: Option<Value>,
    /// The outgoing payload actually sent upstream, for debug capture.
    pub outgoing_body: Value,
    pub route_info: RouteInfo,
}

struct ScoredCandidate<'a> {
    candidate: &'a Candidate,
    pricing: Option<Pricing>,
    discount: f64,
}

/// Runs the full resolve → filter → select → failover pipeline for a
/// non-streaming request. `original_body` is the raw JSON the client sent,
/// already parsed but not yet dialect-translated.
pub async fn dispatch(
    state: &RouterState,
    config: &Config,
    alias_id: &str,
    incoming_dialect: Dialect,
    original_body: Value,
    stats: &dyn SelectorStats,
) -> Result<DispatchOutcome, GatewayError> {
    let alias = config.resolve_alias(alias_id).ok_or_else(|| GatewayError::AliasUnknown(alias_id.to_string()))?;
    let candidates = router::resolve(config, alias_id, incoming_dialect)?;

    let healthy: Vec<&Candidate> = state.cooldown.filter_healthy(
        &candidates,
        |c| c.provider_id.as_str(),
        |c| c.model.as_str(),
        |c| c.account_id.as_deref(),
    );
    if healthy.is_empty() {
        return Err(GatewayError::AllTargetsCoolingDown(alias_id.to_string()));
    }

    let scored: Vec<ScoredCandidate> = healthy
        .iter()
        .map(|&candidate| {
            let provider = candidate.provider_config(config);
            let entry = candidate.model_entry(config);
            ScoredCandidate { candidate, pricing: entry.pricing, discount: provider.discount }
        })
        .collect();

    let ordered = order_by_selector(scored, alias, config, stats);

    let mut last_err: Option<GatewayError> = None;
    for candidate in ordered {
        match try_candidate(state, config, alias, incoming_dialect, &original_body, candidate).await {
            Ok(outcome) => return Ok(outcome),
            Err(TryError::Fatal(err)) => return Err(err),
            Err(TryError::Transient(err)) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| GatewayError::AllTargetsCoolingDown(alias_id.to_string())))
}

enum TryError {
    Transient(GatewayError),
    Fatal(GatewayError),
}

/// Everything the request-preparation steps produce before the HTTP call is
/// issued — shared between the buffered and streaming send paths.
struct PreparedRequest {
    url: String,
    headers: HeaderMap,
    outgoing: Value,
    bypass: bool,
    target_dialect: Dialect,
    transformer: Box<dyn Transformer>,
}

fn prepare_request(
    config: &Config,
    alias: &ModelAlias,
    incoming_dialect: Dialect,
    original_body: &Value,
    candidate: &Candidate,
) -> Result<PreparedRequest, TryError> {
    let provider = candidate.provider_config(config);
    let entry = candidate.model_entry(config);
    let target_dialect = choose_target_dialect(provider, &entry, incoming_dialect);
    let transformer = transform::transformer_for(incoming_dialect, target_dialect);

    let bypass = incoming_dialect == target_dialect;
    let mut outgoing = if bypass {
        let mut body = original_body.clone();
        set_model(&mut body, &candidate.model);
        body
    } else {
        let mut unified = original_body.clone();
        set_model(&mut unified, &candidate.model);
        transformer
            .transform_request(unified)
            .map_err(|e| TryError::Fatal(GatewayError::TransformFailed(e.to_string())))?
    };

    merge_extra_body(provider, &mut outgoing);
    apply_behaviors(alias, target_dialect, &mut outgoing);

    let base = provider.api_base_url.resolve(target_dialect).ok_or_else(|| {
        TryError::Fatal(GatewayError::ConfigInvalid(format!(
            "provider `{}` has no base URL for dialect `{}`",
            candidate.provider_id, target_dialect
        )))
    })?;
    let url = format!("{base}{}", transformer.endpoint(&outgoing));
    let headers = auth_headers(target_dialect, provider);

    Ok(PreparedRequest { url, headers, outgoing, bypass, target_dialect, transformer })
}

async fn try_candidate(
    state: &RouterState,
    config: &Config,
    alias: &ModelAlias,
    incoming_dialect: Dialect,
    original_body: &Value,
    candidate: &Candidate,
) -> Result<DispatchOutcome, TryError> {
    let entry = candidate.model_entry(config);
    let provider = candidate.provider_config(config);
    let prepared = prepare_request(config, alias, incoming_dialect, original_body, candidate)?;

    let result = state.http_client.post(&prepared.url).headers(prepared.headers).json(&prepared.outgoing).send().await;

    let response = match result {
        Ok(resp) => resp,
        Err(err) => {
            state.cooldown.mark_failure(&candidate.provider_id, &candidate.model, candidate.account_id.as_deref(), None);
            return Err(TryError::Transient(GatewayError::ProviderTransient {
                provider: candidate.provider_id.clone(),
                detail: err.to_string(),
            }));
        }
    };

    let status = response.status();
    if status.is_success() {
        let raw: Value = response.json().await.unwrap_or(Value::Null);
        let transformed = if prepared.bypass {
            raw.clone()
        } else {
            prepared
                .transformer
                .transform_response(raw.clone())
                .map_err(|e| TryError::Fatal(GatewayError::TransformFailed(e.to_string())))?
        };
        return Ok(DispatchOutcome {
            status: status.as_u16(),
            body: transformed,
            bypass_transformation: prepared.bypass,
            raw_body: if prepared.bypass { None } else { Some(raw) },
            outgoing_body: prepared.outgoing,
            route_info: RouteInfo {
                provider: candidate.provider_id.clone(),
                model: candidate.model.clone(),
                dialect: prepared.target_dialect,
                canonical_alias: candidate.canonical_alias.clone(),
                pricing: entry.pricing,
                discount: provider.discount,
            },
        });
    }

    let status_num = status.as_u16();
    if cooldown::is_transient_status(status_num) {
        state.cooldown.mark_failure(&candidate.provider_id, &candidate.model, candidate.account_id.as_deref(), None);
        Err(TryError::Transient(GatewayError::ProviderTransient {
            provider: candidate.provider_id.clone(),
            detail: format!("HTTP {status_num}"),
        }))
    } else {
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Err(TryError::Fatal(GatewayError::ProviderFatal { provider: candidate.provider_id.clone(), status, body }))
    }
}

/// Metadata returned alongside a still-open upstream body for the streaming
/// path — the caller tees `response` through an [`crate::inspector::StreamInspector`]
/// while forwarding bytes to the client as they arrive.
pub struct StreamOutcome {
    pub response: reqwest::Response,
    pub bypass_transformation: bool,
    pub outgoing_body: Value,
    pub route_info: RouteInfo,
}

/// Same resolve → filter → select → failover pipeline as [`dispatch`], but
/// leaves the response body unconsumed for the caller to tee through the
/// stream inspector instead of buffering it into a single `Value`.
pub async fn dispatch_stream(
    state: &RouterState,
    config: &Config,
    alias_id: &str,
    incoming_dialect: Dialect,
    original_body: Value,
    stats: &dyn SelectorStats,
) -> Result<StreamOutcome, GatewayError> {
    let alias = config.resolve_alias(alias_id).ok_or_else(|| GatewayError::AliasUnknown(alias_id.to_string()))?;
    let candidates = router::resolve(config, alias_id, incoming_dialect)?;

    let healthy: Vec<&Candidate> = state.cooldown.filter_healthy(
        &candidates,
        |c| c.provider_id.as_str(),
        |c| c.model.as_str(),
        |c| c.account_id.as_deref(),
    );
    if healthy.is_empty() {
        return Err(GatewayError::AllTargetsCoolingDown(alias_id.to_string()));
    }

    let scored: Vec<ScoredCandidate> = healthy
        .iter()
        .map(|&candidate| {
            let provider = candidate.provider_config(config);
            let entry = candidate.model_entry(config);
            ScoredCandidate { candidate, pricing: entry.pricing, discount: provider.discount }
        })
        .collect();
    let ordered = order_by_selector(scored, alias, config, stats);

    let mut last_err: Option<GatewayError> = None;
    for candidate in ordered {
        match try_candidate_stream(state, config, alias, incoming_dialect, &original_body, candidate).await {
            Ok(outcome) => return Ok(outcome),
            Err(TryError::Fatal(err)) => return Err(err),
            Err(TryError::Transient(err)) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| GatewayError::AllTargetsCoolingDown(alias_id.to_string())))
}

async fn try_candidate_stream(
    state: &RouterState,
    config: &Config,
    alias: &ModelAlias,
    incoming_dialect: Dialect,
    original_body: &Value,
    candidate: &Candidate,
) -> Result<StreamOutcome, TryError> {
    let entry = candidate.model_entry(config);
    let provider = candidate.provider_config(config);
    let prepared = prepare_request(config, alias, incoming_dialect, original_body, candidate)?;

    let result = state.http_client.post(&prepared.url).headers(prepared.headers).json(&prepared.outgoing).send().await;

    let response = match result {
        Ok(resp) => resp,
        Err(err) => {
            state.cooldown.mark_failure(&candidate.provider_id, &candidate.model, candidate.account_id.as_deref(), None);
            return Err(TryError::Transient(GatewayError::ProviderTransient {
                provider: candidate.provider_id.clone(),
                detail: err.to_string(),
            }));
        }
    };

    let status = response.status();
    if status.is_success() {
        return Ok(StreamOutcome {
            response,
            bypass_transformation: prepared.bypass,
            outgoing_body: prepared.outgoing,
            route_info: RouteInfo {
                provider: candidate.provider_id.clone(),
                model: candidate.model.clone(),
                dialect: prepared.target_dialect,
                canonical_alias: candidate.canonical_alias.clone(),
                pricing: entry.pricing,
                discount: provider.discount,
            },
        });
    }

    let status_num = status.as_u16();
    if cooldown::is_transient_status(status_num) {
        state.cooldown.mark_failure(&candidate.provider_id, &candidate.model, candidate.account_id.as_deref(), None);
        Err(TryError::Transient(GatewayError::ProviderTransient {
            provider: candidate.provider_id.clone(),
            detail: format!("HTTP {status_num}"),
        }))
    } else {
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Err(TryError::Fatal(GatewayError::ProviderFatal { provider: candidate.provider_id.clone(), status, body }))
    }
}

/// Picks the selector's preferred candidate and moves it to the front,
/// leaving the rest in their original (cooldown-filtered) order as the
/// failover sequence.
fn order_by_selector<'a>(
    scored: Vec<ScoredCandidate<'a>>,
    alias: &ModelAlias,
    config: &Config,
    stats: &dyn SelectorStats,
) -> Vec<&'a Candidate> {
    let idx = selector::select(
        &scored,
        alias.selector,
        |c| c.candidate.provider_id.as_str(),
        |c| c.candidate.model.as_str(),
        |c| c.pricing.as_ref(),
        |c| c.discount,
        stats,
        &NullPricingLookup,
        config.performance_exploration_rate,
        config.latency_exploration_rate,
    );

    let mut ordered: Vec<&Candidate> = scored.iter().map(|c| c.candidate).collect();
    if let Some(i) = idx {
        ordered.swap(0, i);
    }
    ordered
}

fn choose_target_dialect(provider: &ProviderConfig, entry: &crate::config::ModelEntry, incoming: Dialect) -> Dialect {
    let options: Vec<Dialect> = if !entry.access_via.is_empty() {
        entry.access_via.clone()
    } else {
        match &provider.api_base_url {
            crate::config::BaseUrl::Single(_) => vec![incoming],
            crate::config::BaseUrl::ByDialect(map) => {
                let mut tags: Vec<Dialect> = map
                    .keys()
                    .filter_map(|k| all_dialects().into_iter().find(|d| d.as_str() == k))
                    .collect();
                if tags.is_empty() {
                    tags.push(incoming);
                }
                tags
            }
        }
    };

    if options.contains(&incoming) {
        incoming
    } else {
        options[0]
    }
}

fn all_dialects() -> [Dialect; 9] {
    [
        Dialect::Chat,
        Dialect::Messages,
        Dialect::Gemini,
        Dialect::Responses,
        Dialect::Embeddings,
        Dialect::Speech,
        Dialect::Images,
        Dialect::Transcriptions,
        Dialect::Oauth,
    ]
}

fn set_model(body: &mut Value, model: &str) {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), json!(model));
    }
}

/// Shallow overlay of `providerConfig.extraBody` onto the outgoing payload.
fn merge_extra_body(provider: &ProviderConfig, body: &mut Value) {
    if provider.extra_body.is_empty() {
        return;
    }
    if let Some(obj) = body.as_object_mut() {
        for (k, v) in &provider.extra_body {
            obj.insert(k.clone(), v.clone());
        }
    }
}

/// Currently-defined alias behaviors. Unknown tagged variants are
/// logged and skipped rather than aborting the request.
fn apply_behaviors(alias: &ModelAlias, dialect: Dialect, body: &mut Value) {
    for behavior in &alias.behaviors {
        match behavior {
            AliasBehavior::StripAdaptiveThinking => {
                if dialect != Dialect::Messages {
                    continue;
                }
                let is_adaptive = body.get("thinking").and_then(|t| t.get("type")).and_then(|t| t.as_str())
                    == Some("adaptive");
                if is_adaptive {
                    if let Some(obj) = body.as_object_mut() {
                        obj.remove("thinking");
                    }
                }
            }
            AliasBehavior::Unknown => {
                tracing::warn!(alias = %alias.id, "unknown alias behavior — skipped");
            }
        }
    }
}

/// Per-dialect auth header assembly. OAuth bearer refresh is out of
/// scope (token acquisition is an external collaborator); this crate
/// falls back to the configured `apiKey` even for OAuth-bound providers,
/// which in a real deployment would be backed by a token-store lookup.
fn auth_headers(dialect: Dialect, provider: &ProviderConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (k, v) in &provider.headers {
        insert(&mut headers, k, v);
    }

    let key = provider.api_key.as_deref().unwrap_or("");
    match dialect {
        Dialect::Messages => {
            insert(&mut headers, "x-api-key", key);
            insert(&mut headers, "anthropic-version", transform::ANTHROPIC_VERSION);
        }
        Dialect::Gemini => {
            insert(&mut headers, "x-goog-api-key", key);
        }
        _ => {
            insert(&mut headers, "Authorization", &format!("Bearer {key}"));
        }
    }
    headers
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) {
    let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(value)) else {
        tracing::warn!(header = name, "skipping header with invalid characters");
        return;
    };
    headers.insert(name, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BaseUrl, ModelEntry, ModelsField};
    use std::collections::HashMap;

    fn provider() -> ProviderConfig {
        ProviderConfig {
            api_base_url: BaseUrl::Single("https://api.example.com".into()),
            api_key: Some("sk-123".into()),
            oauth_provider: None,
            oauth_account: None,
            enabled: true,
            models: ModelsField::List(vec!["m".into()]),
            headers: HashMap::new(),
            extra_body: serde_json::Map::new(),
            discount: 0.0,
            estimate_tokens: false,
            quota_checker: None,
        }
    }

    #[test]
    fn choose_target_dialect_defaults_when_incoming_unsupported() {
        let p = provider();
        let entry = ModelEntry { pricing: None, access_via: vec![Dialect::Messages], model_type: None };
        assert_eq!(choose_target_dialect(&p, &entry, Dialect::Chat), Dialect::Messages);
    }

    #[test]
    fn choose_target_dialect_prefers_incoming_when_supported() {
        let p = provider();
        let entry = ModelEntry { pricing: None, access_via: vec![Dialect::Chat, Dialect::Messages], model_type: None };
        assert_eq!(choose_target_dialect(&p, &entry, Dialect::Messages), Dialect::Messages);
    }

    #[test]
    fn messages_auth_headers_use_x_api_key() {
        let p = provider();
        let headers = auth_headers(Dialect::Messages, &p);
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-123");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
    }

    #[test]
    fn gemini_auth_headers_use_x_goog_api_key() {
        let p = provider();
        let headers = auth_headers(Dialect::Gemini, &p);
        assert_eq!(headers.get("x-goog-api-key").unwrap(), "sk-123");
    }

    #[test]
    fn default_auth_headers_use_bearer() {
        let p = provider();
        let headers = auth_headers(Dialect::Chat, &p);
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer sk-123");
    }

    #[test]
    fn dialect_auth_header_wins_over_provider_header_of_same_name() {
        let mut p = provider();
        p.headers.insert("Authorization".into(), "Bearer stale".into());
        let headers = auth_headers(Dialect::Chat, &p);
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer sk-123");
    }

    #[test]
    fn provider_header_passes_through_when_not_shadowed_by_dialect_auth() {
        let mut p = provider();
        p.headers.insert("x-custom-org".into(), "org-42".into());
        let headers = auth_headers(Dialect::Chat, &p);
        assert_eq!(headers.get("x-custom-org").unwrap(), "org-42");
    }

    #[test]
    fn strip_adaptive_thinking_removes_adaptive_block() {
        let alias = ModelAlias {
            id: "a".into(),
            targets: vec![],
            selector: Default::default(),
            priority: Default::default(),
            alias_type: None,
            additional_aliases: vec![],
            behaviors: vec![AliasBehavior::StripAdaptiveThinking],
        };
        let mut body = json!({ "thinking": { "type": "adaptive" }, "messages": [] });
        apply_behaviors(&alias, Dialect::Messages, &mut body);
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn strip_adaptive_thinking_leaves_non_adaptive_block() {
        let alias = ModelAlias {
            id: "a".into(),
            targets: vec![],
            selector: Default::default(),
            priority: Default::default(),
            alias_type: None,
            additional_aliases: vec![],
            behaviors: vec![AliasBehavior::StripAdaptiveThinking],
        };
        let mut body = json!({ "thinking": { "type": "enabled" } });
        apply_behaviors(&alias, Dialect::Messages, &mut body);
        assert!(body.get("thinking").is_some());
    }

    #[test]
    fn merge_extra_body_overlays_onto_outgoing_payload() {
        let mut p = provider();
        p.extra_body.insert("safe_mode".into(), json!(true));
        let mut body = json!({ "model": "m" });
        merge_extra_body(&p, &mut body);
        assert_eq!(body["safe_mode"], json!(true));
    }
}
