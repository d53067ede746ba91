//! Daemon configuration.
//!
//! One TOML config file describes the gateway, providers, sandbox, and
//! session policy; provider credentials live in a separate secrets file
//! outside the data directory. Everything has a sensible default so a
//! bare `mentord serve` works with a single provider key.

use crate::selector::SelectorTuning;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default loopback port for the gateway.
pub const DEFAULT_PORT: u16 = 7432;

// ── Sections ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Refuse to start on a non-loopback host unless explicitly allowed.
    pub allow_public_bind: bool,
    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,
    /// Whole-request timeout in seconds.
    pub request_timeout_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            allow_public_bind: false,
            max_body_bytes: 1_048_576,
            request_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// Wire dialect: "openai" (default, covers compatible endpoints) or
    /// "anthropic".
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    pub base_url: String,
    pub model: String,
}

fn default_provider_kind() -> String {
    "openai".into()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub rate_per_second: f64,
    pub bulkhead_permits: usize,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_seconds: u64,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub retry_max_attempts: u32,
    pub call_timeout_seconds: u64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            rate_per_second: 2.0,
            bulkhead_permits: 5,
            breaker_failure_threshold: 3,
            breaker_cooldown_seconds: 60,
            retry_initial_ms: 2_000,
            retry_max_ms: 60_000,
            retry_max_attempts: 3,
            call_timeout_seconds: 120,
        }
    }
}

/// How sandbox steps are isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Container when a runtime is available, local otherwise.
    Auto,
    /// Container required; its absence is an infrastructure error.
    Container,
    /// Local process sandbox only.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub isolation: IsolationMode,
    /// Image used for containerized runs.
    pub container_image: String,
    pub container_cpus: f32,
    pub container_memory_mb: u32,
    /// Parent directory for per-run scratch directories; system temp when
    /// empty.
    pub scratch_root: String,
    /// Grace between SIGTERM and SIGKILL on deadline expiry, milliseconds.
    pub kill_grace_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            isolation: IsolationMode::Auto,
            container_image: "mentord-toolchains:latest".into(),
            container_cpus: 1.0,
            container_memory_mb: 1024,
            scratch_root: String::new(),
            kill_grace_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Track preset used when a request names none.
    pub default_track: String,
    /// Active sessions idle longer than this are abandoned.
    pub inactivity_timeout_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_track: "balanced".into(),
            inactivity_timeout_seconds: 4 * 60 * 60,
            sweep_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 1_024,
        }
    }
}

// ── Top-level config ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: String,
    pub exercises_dir: String,
    /// Secrets file path; must live outside the data directory.
    pub secrets_path: String,
    pub default_provider: Option<String>,
    pub gateway: GatewayConfig,
    pub providers: Vec<ProviderConfig>,
    pub reliability: ReliabilityConfig,
    pub sandbox: SandboxSettings,
    pub session: SessionSettings,
    pub llm: LlmSettings,
    pub selector: SelectorTuning,
}

impl Default for Config {
    fn default() -> Self {
        let dirs = directories::ProjectDirs::from("dev", "mentord", "mentord");
        let data_dir = dirs
            .as_ref()
            .map(|d| d.data_dir().to_string_lossy().into_owned())
            .unwrap_or_else(|| "~/.mentord/data".into());
        let config_dir = dirs
            .as_ref()
            .map(|d| d.config_dir().to_string_lossy().into_owned())
            .unwrap_or_else(|| "~/.mentord".into());
        Self {
            exercises_dir: format!("{data_dir}/../exercises"),
            secrets_path: format!("{config_dir}/secrets.toml"),
            data_dir,
            default_provider: None,
            gateway: GatewayConfig::default(),
            providers: vec![ProviderConfig {
                name: "openrouter".into(),
                kind: "openai".into(),
                base_url: "https://openrouter.ai/api/v1".into(),
                model: "anthropic/claude-sonnet-4.5".into(),
            }],
            reliability: ReliabilityConfig::default(),
            sandbox: SandboxSettings::default(),
            session: SessionSettings::default(),
            llm: LlmSettings::default(),
            selector: SelectorTuning::default(),
        }
    }
}

impl Config {
    /// Load from an explicit path, `$MENTORD_CONFIG`, or the default
    /// config directory; missing files yield the default config.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => std::env::var("MENTORD_CONFIG")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    directories::ProjectDirs::from("dev", "mentord", "mentord")
                        .map(|d| d.config_dir().join("config.toml"))
                }),
        };

        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        expand(&self.data_dir)
    }

    pub fn exercises_dir(&self) -> PathBuf {
        expand(&self.exercises_dir)
    }

    pub fn secrets_path(&self) -> PathBuf {
        expand(&self.secrets_path)
    }

    /// Render a commented starter config.
    pub fn starter_toml() -> String {
        let config = Self::default();
        let body = toml::to_string_pretty(&config).unwrap_or_default();
        format!(
            "# mentord configuration\n\
             # Provider credentials go in the secrets file (see secrets_path),\n\
             # never in this file.\n\n{body}"
        )
    }
}

fn expand(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

// ── Secrets ──────────────────────────────────────────────────────

/// Credentials, loaded from a TOML file outside the data directory:
///
/// ```toml
/// api_token = "local-plugin-token"   # optional gateway bearer token
///
/// [providers]
/// openrouter = "sk-or-..."
/// anthropic = "sk-ant-..."
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    /// Optional bearer token required on every gateway request.
    pub api_token: Option<String>,
    #[serde(default)]
    providers: HashMap<String, String>,
}

impl Secrets {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "secrets file missing; no providers will register");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read secrets: {}", path.display()))?;
        let secrets: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse secrets: {}", path.display()))?;
        Ok(secrets)
    }

    pub fn provider_key(&self, name: &str) -> Option<&str> {
        self.providers
            .get(name)
            .map(String::as_str)
            .filter(|k| !k.trim().is_empty())
    }

    #[cfg(test)]
    pub fn with_provider_key(name: &str, key: &str) -> Self {
        let mut providers = HashMap::new();
        providers.insert(name.to_string(), key.to_string());
        Self {
            api_token: None,
            providers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_loopback_on_contract_port() {
        let config = Config::default();
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 7432);
        assert!(!config.gateway.allow_public_bind);
    }

    #[test]
    fn reliability_defaults_match_contract() {
        let r = ReliabilityConfig::default();
        assert_eq!(r.rate_per_second, 2.0);
        assert_eq!(r.bulkhead_permits, 5);
        assert_eq!(r.breaker_failure_threshold, 3);
        assert_eq!(r.breaker_cooldown_seconds, 60);
        assert_eq!(r.retry_initial_ms, 2_000);
        assert_eq!(r.retry_max_ms, 60_000);
        assert_eq!(r.call_timeout_seconds, 120);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/tmp/mentord-test"

            [gateway]
            port = 9999
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.port, 9999);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.data_dir, "/tmp/mentord-test");
        assert_eq!(config.reliability.bulkhead_permits, 5);
        assert_eq!(config.session.default_track, "balanced");
    }

    #[test]
    fn secrets_parse_and_filter_empty_keys() {
        let secrets: Secrets = toml::from_str(
            r#"
            api_token = "tok"

            [providers]
            openrouter = "sk-or-abc"
            anthropic = "   "
            "#,
        )
        .unwrap();
        assert_eq!(secrets.api_token.as_deref(), Some("tok"));
        assert_eq!(secrets.provider_key("openrouter"), Some("sk-or-abc"));
        assert_eq!(secrets.provider_key("anthropic"), None);
        assert_eq!(secrets.provider_key("missing"), None);
    }

    #[test]
    fn missing_secrets_file_is_empty_not_fatal() {
        let secrets = Secrets::load(Path::new("/nonexistent/secrets.toml")).unwrap();
        assert!(secrets.api_token.is_none());
        assert_eq!(secrets.provider_key("openrouter"), None);
    }

    #[test]
    fn tilde_paths_expand() {
        let config = Config {
            data_dir: "~/mentord-data".into(),
            ..Config::default()
        };
        assert!(!config.data_dir().to_string_lossy().starts_with('~'));
    }

    #[test]
    fn starter_toml_mentions_secrets() {
        let toml = Config::starter_toml();
        assert!(toml.contains("secrets"));
        assert!(toml.contains("[gateway]"));
    }

    #[test]
    fn isolation_mode_serde() {
        let s: SandboxSettings = toml::from_str("isolation = \"container\"").unwrap();
        assert_eq!(s.isolation, IsolationMode::Container);
    }
}
