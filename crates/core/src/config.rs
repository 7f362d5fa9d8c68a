use crate::payload::PayloadConfig;
use arc_swap::ArcSwap;
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ─── Config ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    // Server
    pub host: String,
    pub port: u16,
    pub tls: TlsConfig,

    // Client auth
    pub api_keys: Vec<String>,
    #[serde(skip)]
    pub api_keys_set: HashSet<String>,

    // Global proxy
    pub proxy_url: Option<String>,

    // Debug & logging
    pub debug: bool,
    pub logging_to_file: bool,
    pub log_dir: Option<String>,

    // Routing
    pub routing: RoutingConfig,
    pub request_retry: u32,
    pub max_retry_interval: u64,

    // Timeouts (seconds)
    pub connect_timeout: u64,
    pub request_timeout: u64,

    // Streaming
    pub streaming: StreamingConfig,

    // Request body size limit (MB)
    pub body_limit_mb: usize,

    // Retry
    pub retry: RetryConfig,

    // Ingress rate limiting (global + per API key RPM)
    pub rate_limit: RateLimitConfig,

    // Daemon lifecycle (PID file, graceful shutdown)
    pub daemon: DaemonConfig,

    // Dashboard (JWT-protected admin UI/API)
    pub dashboard: DashboardConfig,

    // Per-model cost overrides (USD per 1M tokens), merged over the built-in price table.
    pub model_prices: HashMap<String, crate::cost::ModelPrice>,

    // Payload manipulation
    pub payload: PayloadConfig,

    // Upstream response headers to forward to clients
    pub passthrough_headers: Vec<String>,

    // Claude header defaults (injected when cloaking is active)
    pub claude_header_defaults: HashMap<String, String>,

    // Reject requests without model prefix when true
    pub force_model_prefix: bool,

    // Non-stream keepalive interval in seconds (0 = disabled).
    // When enabled, sends periodic whitespace to prevent intermediate proxy timeouts.
    pub non_stream_keepalive_secs: u64,

    /// How long captured upstream request/response headers+bodies are kept
    /// on `ProxyUpstreamAttempt` records: `-1` forever, `0` drop immediately
    /// (cleared before the attempt is ever saved), `>0` retain for that many
    /// seconds from the attempt's end time before a later sweep clears them.
    pub request_detail_retention_secs: i64,

    // Provider credentials
    pub claude_api_key: Vec<ProviderKeyEntry>,
    pub openai_api_key: Vec<ProviderKeyEntry>,
    pub gemini_api_key: Vec<ProviderKeyEntry>,
    pub openai_compatibility: Vec<ProviderKeyEntry>,
    // Codex/ChatGPT OAuth credentials (refresh-token based, no static api-key)
    pub codex_oauth: Vec<CodexOAuthEntry>,

    /// Scoped model-name rewrite rules, checked ahead of a credential's own
    /// `models[].alias` table. Lets an operator redirect a requested model to
    /// a different upstream model name for a subset of traffic (e.g. route
    /// `claude-3-5-sonnet*` to `claude-sonnet-4-5` only for the `claude`
    /// client type) without touching every credential entry individually.
    pub model_mapping: Vec<ModelMappingRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8317,
            tls: TlsConfig::default(),
            api_keys: Vec::new(),
            api_keys_set: HashSet::new(),
            proxy_url: None,
            debug: false,
            logging_to_file: false,
            log_dir: None,
            routing: RoutingConfig::default(),
            request_retry: 3,
            max_retry_interval: 30,
            connect_timeout: 30,
            request_timeout: 300,
            streaming: StreamingConfig::default(),
            body_limit_mb: 10,
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            daemon: DaemonConfig::default(),
            dashboard: DashboardConfig::default(),
            model_prices: HashMap::new(),
            payload: PayloadConfig::default(),
            passthrough_headers: Vec::new(),
            claude_header_defaults: HashMap::new(),
            force_model_prefix: false,
            non_stream_keepalive_secs: 0,
            request_detail_retention_secs: -1,
            claude_api_key: Vec::new(),
            openai_api_key: Vec::new(),
            gemini_api_key: Vec::new(),
            openai_compatibility: Vec::new(),
            codex_oauth: Vec::new(),
            model_mapping: Vec::new(),
        }
    }
}

impl Config {
    /// Load config from a YAML file, sanitize, and validate.
    pub fn load(path: &str) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml_ng::from_str(&contents)?;
        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.tls.enable {
            anyhow::ensure!(self.tls.cert.is_some(), "TLS enabled but cert path missing");
            anyhow::ensure!(self.tls.key.is_some(), "TLS enabled but key path missing");
        }
        for entry in self.all_provider_keys() {
            if let Some(ref proxy) = entry.proxy_url {
                crate::proxy::validate_proxy_url(proxy)?;
            }
        }
        for entry in &self.codex_oauth {
            if let Some(ref proxy) = entry.proxy_url {
                crate::proxy::validate_proxy_url(proxy)?;
            }
        }
        if let Some(ref proxy) = self.proxy_url {
            crate::proxy::validate_proxy_url(proxy)?;
        }
        Ok(())
    }

    /// Sanitize and normalize configuration.
    fn sanitize(&mut self) {
        sanitize_entries(&mut self.claude_api_key);
        sanitize_entries(&mut self.openai_api_key);
        sanitize_entries(&mut self.gemini_api_key);
        sanitize_entries(&mut self.openai_compatibility);
        sanitize_codex_oauth(&mut self.codex_oauth);
        // Highest priority first; stable sort keeps config-file order as the
        // tie-break so two rules of equal priority behave predictably.
        self.model_mapping
            .sort_by(|a, b| b.priority.cmp(&a.priority));

        // Build HashSet for O(1) API key lookups
        self.api_keys_set = self.api_keys.iter().cloned().collect();
    }

    /// Returns an iterator over all provider key entries.
    pub fn all_provider_keys(&self) -> impl Iterator<Item = &ProviderKeyEntry> {
        self.claude_api_key
            .iter()
            .chain(self.openai_api_key.iter())
            .chain(self.gemini_api_key.iter())
            .chain(self.openai_compatibility.iter())
    }
}

/// Remove entries with empty api_key, deduplicate, normalize base_url.
fn sanitize_entries(entries: &mut Vec<ProviderKeyEntry>) {
    // Remove entries with empty API keys
    entries.retain(|e| !e.api_key.is_empty());

    // Deduplicate by api_key
    let mut seen = HashSet::new();
    entries.retain(|e| seen.insert(e.api_key.clone()));

    // Normalize entries
    for entry in entries.iter_mut() {
        // Strip trailing slash from base_url
        if let Some(ref mut url) = entry.base_url {
            while url.ends_with('/') {
                url.pop();
            }
        }
        // Normalize header keys to lowercase
        let headers: HashMap<String, String> = entry
            .headers
            .drain()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        entry.headers = headers;
    }
}

/// Remove entries with empty refresh tokens, deduplicate, normalize base_url/headers.
fn sanitize_codex_oauth(entries: &mut Vec<CodexOAuthEntry>) {
    entries.retain(|e| !e.refresh_token.is_empty());

    let mut seen = HashSet::new();
    entries.retain(|e| seen.insert(e.refresh_token.clone()));

    for entry in entries.iter_mut() {
        if let Some(ref mut url) = entry.base_url {
            while url.ends_with('/') {
                url.pop();
            }
        }
        let headers: HashMap<String, String> = entry
            .headers
            .drain()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        entry.headers = headers;
        if entry.client_id.is_empty() {
            entry.client_id = default_codex_client_id();
        }
        if entry.issuer.is_empty() {
            entry.issuer = default_codex_issuer();
        }
    }
}

// ─── Sub-configs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct TlsConfig {
    pub enable: bool,
    pub cert: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RoutingConfig {
    pub strategy: RoutingStrategy,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::RoundRobin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    RoundRobin,
    FillFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StreamingConfig {
    pub keepalive_seconds: u64,
    /// Max retries before first byte is sent to client (streaming bootstrap retry).
    pub bootstrap_retries: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            keepalive_seconds: 15,
            bootstrap_retries: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub cooldown_429_secs: u64,
    pub cooldown_5xx_secs: u64,
    pub cooldown_network_secs: u64,
    /// Initial inter-attempt wait (milliseconds) for the deterministic
    /// backoff formula `delay(i) = min(initial_interval_ms * backoff_rate^i, max_interval_ms)`.
    pub initial_interval_ms: u64,
    /// Multiplicative growth rate applied per attempt.
    pub backoff_rate: f64,
    /// Ceiling for the deterministic inter-attempt wait (milliseconds).
    pub max_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            cooldown_429_secs: 60,
            cooldown_5xx_secs: 15,
            cooldown_network_secs: 10,
            initial_interval_ms: 100,
            backoff_rate: 2.0,
            max_interval_ms: 10_000,
        }
    }
}

impl RetryConfig {
    /// Deterministic (non-jittered) inter-attempt delay for attempt `i` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let millis = (self.initial_interval_ms as f64) * self.backoff_rate.powi(attempt as i32);
        let capped = millis.min(self.max_interval_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

// ─── Rate limiting ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Global requests-per-minute limit across all clients (0 = unlimited).
    pub global_rpm: u32,
    /// Per API key requests-per-minute limit (0 = unlimited).
    pub per_key_rpm: u32,
}

// ─── Daemon lifecycle ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DaemonConfig {
    pub pid_file: String,
    /// Seconds to wait for in-flight connections to drain on shutdown.
    pub shutdown_timeout: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: "./ai-proxy.pid".to_string(),
            shutdown_timeout: 30,
        }
    }
}

// ─── Dashboard ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub username: String,
    /// Bcrypt hash of the dashboard password. Empty disables password login.
    pub password_hash: String,
    /// Explicit JWT signing secret. Falls back to `AI_PROXY_JWT_SECRET` when unset.
    pub jwt_secret: Option<String>,
    pub jwt_ttl_secs: u64,
    /// Ring buffer capacity for the in-memory request log store.
    pub request_log_capacity: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: "admin".to_string(),
            password_hash: String::new(),
            jwt_secret: None,
            jwt_ttl_secs: 3600,
            request_log_capacity: 1000,
        }
    }
}

impl DashboardConfig {
    /// Resolve the JWT signing secret: explicit config value, else the
    /// `AI_PROXY_JWT_SECRET` environment variable, else `None`.
    pub fn resolve_jwt_secret(&self) -> Option<String> {
        self.jwt_secret
            .clone()
            .or_else(|| std::env::var("AI_PROXY_JWT_SECRET").ok())
    }
}

// ─── Scoped model mapping ──────────────────────────────────────────────────

/// A pattern-rewrite rule: when `pattern` matches the requested model and
/// every populated scope filter matches the in-flight request, the model
/// name sent upstream becomes `target` instead of the original. See
/// [`crate::modelmatch::resolve_mapped_model`] for the matching algorithm.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct ModelMappingRule {
    /// `exact`, `prefix*`, `*suffix`, or `*infix*` — see [`crate::modelmatch`].
    pub pattern: String,
    pub target: String,
    /// Rules are tried highest priority first; equal-priority rules keep
    /// config-file order. Unrelated to `ProviderKeyEntry::sort_hint`, which
    /// orders credentials rather than rewrite rules.
    pub priority: i64,
    /// Restrict this rule to one client-facing wire format (`claude`,
    /// `openai`, `codex`, `gemini`, `openai-compatible`). `None` = any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    /// Restrict this rule to one upstream provider format. `None` = any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<String>,
    /// Restrict this rule to one credential id (`AuthRecord::id`). `None` = any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

// ─── Provider key entry ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelMapping {
    /// Original model name from the provider.
    pub id: String,
    /// Alias to expose through the proxy.
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProviderKeyEntry {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelMapping>,
    #[serde(default)]
    pub excluded_models: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
    /// Human-readable name for this key entry (used for logging/identification).
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cloak: crate::cloak::CloakConfig,
    /// Wire API format for OpenAI-compatible providers.
    #[serde(default)]
    pub wire_api: crate::provider::WireApi,
    /// Routing weight for weighted round-robin selection; higher picks more often.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Optional external ordering hint (lower sorts first), applied ahead of
    /// the provider-id tie-break under `fill-first` routing. Not computed
    /// internally — set by whatever policy (e.g. an admin UI's drag-to-reorder)
    /// the deployment wants to express as a priority.
    #[serde(default)]
    pub sort_hint: Option<i64>,
}

fn default_weight() -> u32 {
    1
}

// ─── Codex OAuth entry ─────────────────────────────────────────────────────

/// A ChatGPT-backed Codex credential. Unlike [`ProviderKeyEntry`] there is no
/// static API key: the proxy holds a long-lived OAuth refresh token and
/// mints short-lived access tokens from it on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CodexOAuthEntry {
    pub refresh_token: String,
    /// ChatGPT workspace/account ID, sent as the `chatgpt-account-id` header.
    /// Recovered from the ID token on first refresh if left unset.
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default = "default_codex_client_id")]
    pub client_id: String,
    #[serde(default = "default_codex_issuer")]
    pub issuer: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelMapping>,
    #[serde(default)]
    pub excluded_models: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub sort_hint: Option<i64>,
}

/// Codex CLI's own registered OAuth client ID (public, not a secret).
pub fn default_codex_client_id() -> String {
    "app_EMoamEEZ73f0CkXaXp7hrann".to_string()
}

pub fn default_codex_issuer() -> String {
    "https://auth.openai.com".to_string()
}

// ─── Config Watcher ────────────────────────────────────────────────────────

pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching a config file. On changes (debounced 150ms, SHA256 dedup),
    /// reload the config and atomically swap it in via ArcSwap.
    pub fn start(
        path: String,
        config: Arc<ArcSwap<Config>>,
        on_reload: impl Fn(&Config) + Send + Sync + 'static,
    ) -> Result<Self, anyhow::Error> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(16);

        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, _>| {
            if let Ok(event) = res
                && (event.kind.is_modify() || event.kind.is_create())
            {
                let _ = tx.blocking_send(());
            }
        })?;
        watcher.watch(Path::new(&path), RecursiveMode::NonRecursive)?;

        let path_clone = path.clone();
        tokio::spawn(async move {
            let mut last_hash: Option<[u8; 32]> = None;
            let mut debounce: Option<tokio::time::Instant> = None;

            loop {
                tokio::select! {
                    Some(()) = rx.recv() => {
                        debounce = Some(tokio::time::Instant::now() + Duration::from_millis(150));
                    }
                    _ = async {
                        match debounce {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        debounce = None;
                        match std::fs::read(&path_clone) {
                            Ok(contents) => {
                                let hash: [u8; 32] = sha2::Sha256::digest(&contents).into();
                                if last_hash.as_ref() == Some(&hash) {
                                    continue;
                                }
                                last_hash = Some(hash);

                                match Config::load(&path_clone) {
                                    Ok(new_cfg) => {
                                        tracing::info!("Configuration reloaded successfully");
                                        on_reload(&new_cfg);
                                        config.store(Arc::new(new_cfg));
                                    }
                                    Err(e) => {
                                        tracing::error!("Config reload failed: {e}");
                                    }
                                }
                            }
                            Err(e) => tracing::error!("Config file read failed: {e}"),
                        }
                    }
                }
            }
        });

        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8317);
        assert!(!cfg.tls.enable);
        assert_eq!(cfg.request_retry, 3);
        assert_eq!(cfg.max_retry_interval, 30);
        assert_eq!(cfg.connect_timeout, 30);
        assert_eq!(cfg.request_timeout, 300);
        assert_eq!(cfg.streaming.keepalive_seconds, 15);
        assert_eq!(cfg.body_limit_mb, 10);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.cooldown_429_secs, 60);
        assert_eq!(cfg.retry.cooldown_5xx_secs, 15);
        assert_eq!(cfg.retry.cooldown_network_secs, 10);
    }

    #[test]
    fn test_sanitize_entries() {
        let mut entries = vec![
            ProviderKeyEntry {
                api_key: "key1".into(),
                base_url: Some("https://api.example.com/".into()),
                proxy_url: None,
                prefix: None,
                models: vec![],
                excluded_models: vec![],
                headers: HashMap::from([("X-Custom".into(), "val".into())]),
                disabled: false,
                name: None,
                cloak: Default::default(),
                wire_api: crate::provider::WireApi::default(),
                weight: 1,
                sort_hint: None,
            },
            ProviderKeyEntry {
                api_key: "".into(),
                base_url: None,
                proxy_url: None,
                prefix: None,
                models: vec![],
                excluded_models: vec![],
                headers: HashMap::new(),
                disabled: false,
                name: None,
                cloak: Default::default(),
                wire_api: crate::provider::WireApi::default(),
                weight: 1,
                sort_hint: None,
            },
            ProviderKeyEntry {
                api_key: "key1".into(), // duplicate
                base_url: None,
                proxy_url: None,
                prefix: None,
                models: vec![],
                excluded_models: vec![],
                headers: HashMap::new(),
                disabled: false,
                name: None,
                cloak: Default::default(),
                wire_api: crate::provider::WireApi::default(),
                weight: 1,
                sort_hint: None,
            },
        ];
        sanitize_entries(&mut entries);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].base_url.as_deref(),
            Some("https://api.example.com")
        );
        assert!(entries[0].headers.contains_key("x-custom"));
    }

    #[test]
    fn test_yaml_deserialization() {
        let yaml = r#"
host: "127.0.0.1"
port: 9000
api-keys:
  - "test-key"
routing:
  strategy: fill-first
claude-api-key:
  - api-key: "sk-ant-xxx"
    base-url: "https://api.anthropic.com"
    models:
      - id: "claude-sonnet-4-20250514"
        alias: "sonnet"
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.api_keys, vec!["test-key"]);
        assert_eq!(config.routing.strategy, RoutingStrategy::FillFirst);
        assert_eq!(config.claude_api_key.len(), 1);
        assert_eq!(config.claude_api_key[0].models.len(), 1);
    }
}
