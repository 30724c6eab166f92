//! Gateway configuration: deserialization, environment overrides, and validation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "TOOLGATE_";

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env reference pattern is valid")
});

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` if the value is not a
/// valid env-var reference.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Resolve a map of env-var references to their actual values.
///
/// Each value must be `${VAR}`. Unknown variables resolve to the empty string
/// (same as shell `${UNSET-}`).
pub fn resolve_env_vars(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let resolved = match parse_env_ref(v) {
                Some(var_name) => std::env::var(var_name).unwrap_or_default(),
                None => v.clone(), // caught by validate(), but handle gracefully
            };
            (k.clone(), resolved)
        })
        .collect()
}

/// Expand every `${VAR}` occurrence embedded in `value`.
///
/// Unlike [`parse_env_ref`], references may appear anywhere in the string
/// (`https://${HOST}/mcp`). Unknown variables expand to the empty string.
pub fn expand_env_refs(value: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    ENV_REF
        .replace_all(value, |caps: &regex::Captures<'_>| {
            lookup(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Name of the env var that overrides the base URL of source `id`.
///
/// `aux-tools` -> `TOOLGATE_SOURCE_AUX_TOOLS_URL`
pub fn source_url_var(id: &str) -> String {
    format!(
        "{}SOURCE_{}_URL",
        ENV_PREFIX,
        id.to_ascii_uppercase().replace('-', "_")
    )
}

/// Top-level gateway configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub auth: AuthSettings,
    /// Sources in registration order; order decides first-wins collisions.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub bridges: BridgesConfig,
}

/// Listener, probing, and shutdown settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub host: String,
    pub primary_port: u16,
    pub fallback_port: u16,
    pub enable_primary: bool,
    pub enable_fallback: bool,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub call_timeout_secs: u64,
    /// Consecutive failures before a source is demoted to unreachable.
    pub failure_threshold: u32,
    /// Cap for the re-probe backoff of unreachable sources.
    pub max_backoff_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub collision_policy: CollisionPolicy,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            primary_port: 3000,
            fallback_port: 3001,
            enable_primary: true,
            enable_fallback: false,
            probe_interval_secs: 30,
            probe_timeout_secs: 5,
            call_timeout_secs: 30,
            failure_threshold: 3,
            max_backoff_secs: 300,
            shutdown_timeout_secs: 10,
            collision_policy: CollisionPolicy::FirstWins,
        }
    }
}

impl GatewaySettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// How tool-name collisions between sources are resolved.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionPolicy {
    /// First-registered source keeps the name, later duplicates are dropped.
    #[default]
    FirstWins,
    /// Every tool is exposed as `{source_id}__{tool}`.
    Namespaced,
}

/// Master key handling for privileged endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub master_api_key: Option<String>,
    /// Require the master key on `/mcp` as well as on admin endpoints.
    pub protect_rpc: bool,
}

/// Configuration for a single tool source.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub display_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub categories: Vec<String>,
    pub tool_count_hint: Option<u32>,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

/// Transport-specific settings; the `transport` key selects the variant.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum TransportConfig {
    Stdio(StdioSettings),
    Http(HttpSettings),
    Websocket(WebSocketSettings),
    BridgeInternal(BridgeSettings),
}

/// Discriminant of [`TransportConfig`], for logging and health output.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    Http,
    Websocket,
    BridgeInternal,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::Websocket => "websocket",
            TransportKind::BridgeInternal => "bridge-internal",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Stdio(_) => TransportKind::Stdio,
            TransportConfig::Http(_) => TransportKind::Http,
            TransportConfig::Websocket(_) => TransportKind::Websocket,
            TransportConfig::BridgeInternal(_) => TransportKind::BridgeInternal,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct StdioSettings {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Env var references (`${VAR}`), resolved at spawn time.
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HttpSettings {
    pub url: String,
    #[serde(default = "default_rpc_path")]
    pub rpc_path: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Sent as `X-API-Key` on every request.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct WebSocketSettings {
    pub url: String,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Identifier of an in-process bridge in the bridge catalog.
    pub bridge: String,
}

/// Built-in internal bridges.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgesConfig {
    pub memory: Option<MemoryBridgeConfig>,
}

/// The memory service, consumed as an opaque REST API with its own key.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryBridgeConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_rpc_path() -> String {
    "/mcp".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_env_number<T: std::str::FromStr>(var: &str, raw: &str) -> crate::Result<T> {
    raw.trim().parse().map_err(|_| {
        GatewayError::InvalidConfig(var.to_string(), format!("'{}' is not a number", raw))
    })
}

impl GatewayConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| GatewayError::InvalidConfig("config".into(), e.to_string()))
    }

    /// Read and parse a TOML config file.
    pub async fn load(path: &Path) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::InvalidConfig(path.display().to_string(), e.to_string())
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `TOOLGATE_*` overrides and expand `${VAR}` references.
    ///
    /// `lookup` is the environment; pass `|k| std::env::var(k).ok()` in
    /// production and a map-backed closure in tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> crate::Result<()> {
        let var = |name: &str| format!("{}{}", ENV_PREFIX, name);
        let g = &mut self.gateway;

        if let Some(raw) = lookup(&var("PRIMARY_PORT")) {
            g.primary_port = parse_env_number(&var("PRIMARY_PORT"), &raw)?;
        }
        if let Some(raw) = lookup(&var("FALLBACK_PORT")) {
            g.fallback_port = parse_env_number(&var("FALLBACK_PORT"), &raw)?;
        }
        for (name, slot) in [
            ("ENABLE_PRIMARY", &mut g.enable_primary),
            ("ENABLE_FALLBACK", &mut g.enable_fallback),
        ] {
            if let Some(raw) = lookup(&var(name)) {
                *slot = parse_flag(&raw).ok_or_else(|| {
                    GatewayError::InvalidConfig(var(name), format!("'{}' is not a boolean", raw))
                })?;
            }
        }
        if let Some(raw) = lookup(&var("PROBE_INTERVAL_SECS")) {
            g.probe_interval_secs = parse_env_number(&var("PROBE_INTERVAL_SECS"), &raw)?;
        }
        if let Some(raw) = lookup(&var("SHUTDOWN_TIMEOUT_SECS")) {
            g.shutdown_timeout_secs = parse_env_number(&var("SHUTDOWN_TIMEOUT_SECS"), &raw)?;
        }
        if let Some(key) = lookup(&var("MASTER_API_KEY")) {
            self.auth.master_api_key = Some(key);
        }

        for source in &mut self.sources {
            let url_override = lookup(&source_url_var(&source.id));
            match &mut source.transport {
                TransportConfig::Http(http) => {
                    if let Some(url) = url_override {
                        http.url = url;
                    }
                    http.url = expand_env_refs(&http.url, &lookup);
                    http.api_key = http.api_key.as_deref().map(|k| expand_env_refs(k, &lookup));
                }
                TransportConfig::Websocket(ws) => {
                    if let Some(url) = url_override {
                        ws.url = url;
                    }
                    ws.url = expand_env_refs(&ws.url, &lookup);
                }
                TransportConfig::Stdio(_) | TransportConfig::BridgeInternal(_) => {}
            }
        }

        if let Some(memory) = self.bridges.memory.as_mut() {
            memory.base_url = expand_env_refs(&memory.base_url, &lookup);
            memory.api_key = memory.api_key.as_deref().map(|k| expand_env_refs(k, &lookup));
        }
        self.auth.master_api_key = self
            .auth
            .master_api_key
            .as_deref()
            .map(|k| expand_env_refs(k, &lookup))
            .filter(|k| !k.is_empty());

        Ok(())
    }

    /// Enabled sources, in registration order.
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Validate the config, failing fast on misconfigurations before any source is contacted.
    pub fn validate(&self) -> crate::Result<()> {
        let g = &self.gateway;

        // 1. Listener sanity
        if !g.enable_primary && !g.enable_fallback {
            return Err(GatewayError::InvalidConfig(
                "gateway".into(),
                "at least one of enable_primary / enable_fallback must be true".into(),
            ));
        }
        if g.enable_primary && g.enable_fallback && g.primary_port != 0 && g.primary_port == g.fallback_port {
            return Err(GatewayError::InvalidConfig(
                "gateway".into(),
                format!("primary and fallback share port {}", g.primary_port),
            ));
        }
        if g.probe_interval_secs == 0 {
            return Err(GatewayError::InvalidConfig(
                "gateway".into(),
                "probe_interval_secs must be > 0".into(),
            ));
        }
        if g.failure_threshold == 0 {
            return Err(GatewayError::InvalidConfig(
                "gateway".into(),
                "failure_threshold must be >= 1".into(),
            ));
        }

        // 2. Duplicate ids
        let mut seen: HashSet<&str> = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.id.as_str()) {
                return Err(GatewayError::DuplicateSourceId(source.id.clone()));
            }
        }

        // 3. Per-source checks, enabled sources only
        for source in self.enabled_sources() {
            let id = &source.id;

            if id.is_empty()
                || id.contains("__")
                || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(GatewayError::InvalidConfig(
                    id.clone(),
                    "id must be non-empty alphanumeric with hyphens or underscores, no double underscores"
                        .to_string(),
                ));
            }

            match &source.transport {
                TransportConfig::Stdio(stdio) => {
                    if stdio.command.trim().is_empty() {
                        return Err(GatewayError::InvalidConfig(
                            id.clone(),
                            "stdio transport requires a non-empty 'command'".to_string(),
                        ));
                    }
                    for (key, value) in &stdio.env {
                        if parse_env_ref(value).is_none() {
                            return Err(GatewayError::InvalidConfig(
                                id.clone(),
                                format!(
                                    "env value for key '{}' must be a ${{VAR}} reference, got '{}'",
                                    key, value
                                ),
                            ));
                        }
                    }
                }
                TransportConfig::Http(http) => {
                    if !(http.url.starts_with("http://") || http.url.starts_with("https://")) {
                        return Err(GatewayError::InvalidConfig(
                            id.clone(),
                            format!("http transport requires an http(s) 'url', got '{}'", http.url),
                        ));
                    }
                    for (field, path) in [("rpc_path", &http.rpc_path), ("health_path", &http.health_path)] {
                        if !path.starts_with('/') {
                            return Err(GatewayError::InvalidConfig(
                                id.clone(),
                                format!("'{}' must start with '/'", field),
                            ));
                        }
                    }
                }
                TransportConfig::Websocket(ws) => {
                    if !(ws.url.starts_with("ws://") || ws.url.starts_with("wss://")) {
                        return Err(GatewayError::InvalidConfig(
                            id.clone(),
                            format!("websocket transport requires a ws(s) 'url', got '{}'", ws.url),
                        ));
                    }
                }
                TransportConfig::BridgeInternal(bridge) => {
                    if bridge.bridge.trim().is_empty() {
                        return Err(GatewayError::InvalidConfig(
                            id.clone(),
                            "bridge-internal transport requires a 'bridge' identifier".to_string(),
                        ));
                    }
                }
            }
        }

        // 4. Built-in bridges
        if let Some(memory) = &self.bridges.memory {
            if !(memory.base_url.starts_with("http://") || memory.base_url.starts_with("https://")) {
                return Err(GatewayError::InvalidConfig(
                    "bridges.memory".into(),
                    format!("base_url must be http(s), got '{}'", memory.base_url),
                ));
            }
        }

        Ok(())
    }
}
