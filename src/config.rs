//! Configuration model for the Plexus gateway.
//!
//! The whole document is loaded once at startup from a YAML file (and
//! re-loaded atomically on every subsequent hot-reload tick — see
//! `router::config_watcher`). `${VAR}` references anywhere in the document
//! text are substituted from the process environment *before* YAML parsing,
//! so secrets never have to sit in the file itself.
//!
//! Invalid configs are rejected with a readable error rather than silently
//! falling back to defaults — both at startup (fatal, non-zero exit) and on
//! a management-API `POST` (400 with field-level detail).

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// The wire grammar spoken at a particular hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Chat,
    Messages,
    Gemini,
    Responses,
    Embeddings,
    Speech,
    Images,
    Transcriptions,
    Oauth,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Messages => "messages",
            Self::Gemini => "gemini",
            Self::Responses => "responses",
            Self::Embeddings => "embeddings",
            Self::Speech => "speech",
            Self::Images => "images",
            Self::Transcriptions => "transcriptions",
            Self::Oauth => "oauth",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OAuth account-acquisition backends a provider can be bound to.
///
/// Token acquisition itself is out of scope — the dispatcher only ever
/// consumes a cached bearer token looked up by `(oauth_provider, oauth_account)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OauthProvider {
    Anthropic,
    OpenaiCodex,
    GithubCopilot,
    GoogleGeminiCli,
    GoogleAntigravity,
}

/// A single upstream model's pricing + routing hints, when `models` is given
/// as a map rather than a bare list of names.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelEntry {
    #[serde(default)]
    pub pricing: Option<Pricing>,
    /// Dialects this model may be *spoken to* through, overriding the
    /// provider-level dialect set for this model specifically.
    #[serde(rename = "accessVia", default)]
    pub access_via: Vec<Dialect>,
    #[serde(rename = "type", default)]
    pub model_type: Option<Dialect>,
}

/// `models` may be given either as a flat list of names, or as a map from
/// model name to its entry (pricing / access_via / type).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ModelsField {
    List(Vec<String>),
    Map(HashMap<String, ModelEntry>),
}

impl ModelsField {
    pub fn contains(&self, model: &str) -> bool {
        match self {
            Self::List(names) => names.iter().any(|n| n == model),
            Self::Map(map) => map.contains_key(model),
        }
    }

    pub fn entry(&self, model: &str) -> Option<ModelEntry> {
        match self {
            Self::List(names) => names.iter().find(|n| n.as_str() == model).map(|_| ModelEntry {
                pricing: None,
                access_via: Vec::new(),
                model_type: None,
            }),
            Self::Map(map) => map.get(model).cloned(),
        }
    }
}

/// Either a single base URL for all dialects, or a per-dialect mapping.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum BaseUrl {
    Single(String),
    ByDialect(HashMap<String, String>),
}

impl BaseUrl {
    /// Resolve the base URL to use for `dialect`.
    ///
    /// For a map: exact dialect tag, then `default`, then the first entry
    /// (with a warning — an ambiguous fallback the operator should fix).
    pub fn resolve(&self, dialect: Dialect) -> Option<String> {
        match self {
            Self::Single(url) => Some(url.trim_end_matches('/').to_string()),
            Self::ByDialect(map) => {
                if let Some(url) = map.get(dialect.as_str()) {
                    return Some(url.trim_end_matches('/').to_string());
                }
                if let Some(url) = map.get("default") {
                    return Some(url.trim_end_matches('/').to_string());
                }
                if let Some((tag, url)) = map.iter().next() {
                    tracing::warn!(
                        dialect = %dialect,
                        fallback_tag = %tag,
                        "no base URL for dialect and no `default` entry — using first map entry"
                    );
                    return Some(url.trim_end_matches('/').to_string());
                }
                None
            }
        }
    }
}

/// Periodic out-of-band quota polling for a provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaChecker {
    #[serde(rename = "type")]
    pub checker_type: String,
    #[serde(rename = "intervalMinutes")]
    pub interval_minutes: u64,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// Identifies an upstream.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(rename = "apiBaseUrl")]
    pub api_base_url: BaseUrl,
    #[serde(rename = "apiKey", default)]
    pub api_key: Option<String>,
    #[serde(rename = "oauthProvider", default)]
    pub oauth_provider: Option<OauthProvider>,
    #[serde(rename = "oauthAccount", default)]
    pub oauth_account: Option<String>,
    #[serde(default = "defaults::t")]
    pub enabled: bool,
    pub models: ModelsField,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(rename = "extraBody", default)]
    pub extra_body: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub discount: f64,
    #[serde(rename = "estimateTokens", default)]
    pub estimate_tokens: bool,
    #[serde(rename = "quotaChecker", default)]
    pub quota_checker: Option<QuotaChecker>,
}

impl ProviderConfig {
    /// Exactly one of `{apiKey}` or `{oauthProvider + oauthAccount}` must be set.
    fn uses_oauth_url(&self) -> bool {
        match &self.api_base_url {
            BaseUrl::Single(u) => u.starts_with("oauth://"),
            BaseUrl::ByDialect(m) => m.values().any(|u| u.starts_with("oauth://")),
        }
    }

    fn validate(&self, id: &str) -> anyhow::Result<()> {
        let has_key = self.api_key.is_some();
        let has_oauth = self.oauth_provider.is_some() && self.oauth_account.is_some();

        anyhow::ensure!(
            has_key ^ has_oauth,
            "provider `{id}`: exactly one of apiKey or (oauthProvider + oauthAccount) must be set"
        );

        if self.uses_oauth_url() {
            anyhow::ensure!(
                has_oauth,
                "provider `{id}`: an `oauth://` base URL requires oauthProvider + oauthAccount"
            );
        }

        anyhow::ensure!(
            (0.0..=1.0).contains(&self.discount),
            "provider `{id}`: discount must be in [0, 1], got {}",
            self.discount
        );

        Ok(())
    }
}

/// `{provider, model, enabled?}` — one target of a [`ModelAlias`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AliasTarget {
    pub provider: String,
    pub model: String,
    #[serde(default = "defaults::t")]
    pub enabled: bool,
}

/// The pluggable policy used to choose among healthy candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    #[default]
    Random,
    InOrder,
    Cost,
    Latency,
    Usage,
    Performance,
}

/// Whether candidate ordering is dictated by dialect match or left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Selector,
    ApiMatch,
}

/// The client-facing model name.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelAlias {
    pub id: String,
    pub targets: Vec<AliasTarget>,
    #[serde(default)]
    pub selector: SelectorKind,
    #[serde(default)]
    pub priority: Priority,
    #[serde(rename = "type", default)]
    pub alias_type: Option<Dialect>,
    #[serde(rename = "additionalAliases", default)]
    pub additional_aliases: Vec<String>,
    /// Alias-level behaviors, e.g. `strip_adaptive_thinking`.
    #[serde(default)]
    pub behaviors: Vec<AliasBehavior>,
}

/// A closed tagged-variant set of alias-level request-mutation behaviors.
/// Unknown variants deserialize into `Unknown` and are logged-and-skipped
/// by the dispatcher rather than aborting.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AliasBehavior {
    StripAdaptiveThinking,
    #[serde(other)]
    Unknown,
}

/// Named quota policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    Rolling,
    Daily,
    Weekly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    Requests,
    Tokens,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaDefinition {
    #[serde(rename = "type")]
    pub quota_type: QuotaType,
    #[serde(rename = "limitType")]
    pub limit_type: LimitType,
    pub limit: f64,
    /// Required (and only meaningful) for `type: rolling`; a human duration
    /// like `1h`, `30m`, `1d`.
    #[serde(default)]
    pub duration: Option<String>,
}

/// Inbound API credential.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeyConfig {
    pub name: String,
    pub secret: String,
    #[serde(default)]
    pub quota: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Top-level gateway configuration — the validated, hot-reloaded document
/// every subsystem reads from.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub models: Vec<ModelAlias>,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
    #[serde(rename = "adminKey")]
    pub admin_key: Option<String>,
    #[serde(rename = "userQuotas", default)]
    pub user_quotas: HashMap<String, QuotaDefinition>,
    #[serde(rename = "performanceExplorationRate", default = "defaults::exploration_rate")]
    pub performance_exploration_rate: f64,
    #[serde(rename = "latencyExplorationRate", default)]
    pub latency_exploration_rate: Option<f64>,
}

/// Gateway-wide network/runtime settings. Not part of the upstream `spec.md`
/// data model proper, but every config document needs a home for ports,
/// timeouts, and the ambient logging/debug knobs the base gateway exposes
/// under `[gateway]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,
    #[serde(default = "defaults::timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "defaults::cooldown_minutes")]
    pub provider_cooldown_minutes: u64,
    #[serde(default = "defaults::debug_capacity")]
    pub debug_log_capacity: usize,
    /// Gates persistence of raw/transformed bodies to the `debug_logs` table.
    /// The in-memory snapshot used for usage extraction is captured
    /// regardless — this only controls the durable copy.
    #[serde(default, rename = "debugEnabled")]
    pub debug_enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            client_port: defaults::client_port(),
            admin_port: defaults::admin_port(),
            request_timeout_ms: defaults::timeout_ms(),
            provider_cooldown_minutes: defaults::cooldown_minutes(),
            debug_log_capacity: defaults::debug_capacity(),
            debug_enabled: false,
        }
    }
}

mod defaults {
    pub fn t() -> bool {
        true
    }
    pub fn client_port() -> u16 {
        8080
    }
    pub fn admin_port() -> u16 {
        8081
    }
    pub fn timeout_ms() -> u64 {
        120_000
    }
    pub fn cooldown_minutes() -> u64 {
        10
    }
    pub fn debug_capacity() -> usize {
        500
    }
    pub fn exploration_rate() -> f64 {
        0.05
    }
}

/// A range in a `source: defined` pricing table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PricingRange {
    #[serde(rename = "lowerBound")]
    pub lower_bound: f64,
    /// `None` means unbounded (`+∞`).
    #[serde(rename = "upperBound")]
    pub upper_bound: Option<f64>,
    pub input: f64,
    pub output: f64,
}

/// Per-model pricing, tagged by `source`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Pricing {
    Simple {
        input: f64,
        output: f64,
        #[serde(default)]
        cached: f64,
        #[serde(rename = "cacheWrite", default)]
        cache_write: f64,
    },
    Defined {
        ranges: Vec<PricingRange>,
    },
    Openrouter {
        slug: String,
        #[serde(default)]
        discount: Option<f64>,
    },
    PerRequest {
        amount: f64,
    },
}

impl Config {
    /// Load, substitute `${VAR}` references, parse as YAML, and validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let substituted = substitute_env(&raw);
        let config: Self =
            serde_yaml::from_str(&substituted).context("parsing config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates alias uniqueness, target closure, and OAuth exclusivity.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (id, provider) in &self.providers {
            provider.validate(id)?;
        }

        let mut seen_alias_ids: HashSet<&str> = HashSet::new();
        for alias in &self.models {
            anyhow::ensure!(
                seen_alias_ids.insert(alias.id.as_str()),
                "duplicate alias id `{}`",
                alias.id
            );
            for additional in &alias.additional_aliases {
                anyhow::ensure!(
                    seen_alias_ids.insert(additional.as_str()),
                    "duplicate alias id `{}` (as additionalAlias of `{}`)",
                    additional,
                    alias.id
                );
            }

            for target in &alias.targets {
                let provider = self.providers.get(&target.provider).with_context(|| {
                    format!(
                        "alias `{}` targets unknown provider `{}`",
                        alias.id, target.provider
                    )
                })?;
                anyhow::ensure!(
                    provider.models.contains(&target.model),
                    "alias `{}` targets model `{}` not declared under provider `{}`",
                    alias.id,
                    target.model,
                    target.provider
                );
            }
        }

        for key in &self.keys {
            if let Some(quota_name) = &key.quota {
                anyhow::ensure!(
                    self.user_quotas.contains_key(quota_name),
                    "key `{}` references unknown quota `{}`",
                    key.name,
                    quota_name
                );
            }
        }

        for (name, quota) in &self.user_quotas {
            if quota.quota_type == QuotaType::Rolling {
                anyhow::ensure!(
                    quota.duration.is_some(),
                    "quota `{name}` is type rolling but has no duration"
                );
            }
        }

        Ok(())
    }

    /// Map an incoming alias id (canonical or additional) to its canonical
    /// [`ModelAlias`].
    pub fn resolve_alias(&self, id: &str) -> Option<&ModelAlias> {
        self.models
            .iter()
            .find(|a| a.id == id || a.additional_aliases.iter().any(|add| add == id))
    }

    pub fn key_by_secret(&self, secret: &str) -> Option<&KeyConfig> {
        self.keys.iter().find(|k| k.secret == secret)
    }
}

/// Replace every `${VAR}` occurrence with the value of the environment
/// variable `VAR`. References to unset variables are left untouched so a
/// missing-secret mistake surfaces as a YAML/validation error rather than
/// silently becoming an empty string.
fn substitute_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            out.push_str(rest);
            return out;
        };
        let end = start + end;
        out.push_str(&rest[..start]);
        let var_name = &rest[start + 2..end];
        match std::env::var(var_name) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(&rest[start..=end]),
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
gateway:
  client_port: 8080
  admin_port: 8081

providers:
  openai:
    apiBaseUrl: "https://api.openai.com"
    apiKey: "sk-test"
    models:
      - gpt-4o

models:
  - id: gpt-4
    targets:
      - provider: openai
        model: gpt-4o

keys:
  - name: k1
    secret: sk-client-1
"#
    }

    #[test]
    fn parses_and_validates_minimal_config() {
        let cfg: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_duplicate_alias_ids() {
        let mut cfg: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        let dup = cfg.models[0].clone();
        cfg.models.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_target_with_unknown_provider() {
        let mut cfg: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.models[0].targets[0].provider = "nonexistent".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_target_with_undeclared_model() {
        let mut cfg: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.models[0].targets[0].model = "gpt-5-doesnt-exist".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_provider_with_both_api_key_and_oauth() {
        let mut cfg: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        let p = cfg.providers.get_mut("openai").unwrap();
        p.oauth_provider = Some(OauthProvider::Anthropic);
        p.oauth_account = Some("acct".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_provider_with_neither_api_key_nor_oauth() {
        let mut cfg: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.providers.get_mut("openai").unwrap().api_key = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn resolve_alias_follows_additional_alias() {
        let mut cfg: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.models[0].additional_aliases.push("gpt-4-turbo".into());
        let resolved = cfg.resolve_alias("gpt-4-turbo").unwrap();
        assert_eq!(resolved.id, "gpt-4");
    }

    #[test]
    fn substitute_env_replaces_known_var() {
        std::env::set_var("PLEXUS_TEST_SUBST_VAR", "hello");
        let out = substitute_env("key: ${PLEXUS_TEST_SUBST_VAR}");
        assert_eq!(out, "key: hello");
        std::env::remove_var("PLEXUS_TEST_SUBST_VAR");
    }

    #[test]
    fn substitute_env_leaves_unknown_var_untouched() {
        let out = substitute_env("key: ${PLEXUS_TEST_DEFINITELY_UNSET_XYZ}");
        assert_eq!(out, "key: ${PLEXUS_TEST_DEFINITELY_UNSET_XYZ}");
    }

    #[test]
    fn models_field_list_variant_contains_by_name() {
        let field = ModelsField::List(vec!["a".into(), "b".into()]);
        assert!(field.contains("a"));
        assert!(!field.contains("c"));
    }

    #[test]
    fn base_url_resolves_exact_dialect_then_default_then_first() {
        let mut map = HashMap::new();
        map.insert("default".into(), "https://default.example".into());
        map.insert("messages".into(), "https://messages.example".into());
        let url = BaseUrl::ByDialect(map);

        assert_eq!(
            url.resolve(Dialect::Messages).unwrap(),
            "https://messages.example"
        );
        assert_eq!(url.resolve(Dialect::Chat).unwrap(), "https://default.example");
    }
}
