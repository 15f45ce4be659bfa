//! Configuration loading, defaults and validation.
//!
//! Both roles read the same kind of file. Configuration is resolved in order
//! of precedence (highest wins):
//!
//! 1. **Environment variables**: `CMDER_SECURITY_KEY`, `CMDER_LISTEN`
//! 2. **Config file**: path via `--config <path>`, otherwise `cmder.toml` or
//!    `config.yaml` in CWD. `.yaml`/`.yml` files are parsed as YAML, anything
//!    else as TOML.
//! 3. **Compiled defaults**: see each field's default value below
//!
//! Agent file:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:5544"
//! read_timeout_secs = 3600
//!
//! [auth]
//! security_key = "your-secret-key"
//! whitelist = ["127.0.0.1", "10.0.0.0/8"]
//! access_window = { start = "09:00", end = "18:00" }   # optional
//!
//! [tasks]
//! capacity = 8
//! unit_multiplier = 2
//! forbidden = ["rm -rf /", "mkfs"]
//!
//! [shell]
//! shell = "bash"
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Proxy file:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:5533"
//! write_timeout_secs = 3600
//!
//! [auth]
//! security_key = "your-secret-key"
//! whitelist = ["192.168.1.0/24"]
//!
//! [relay]
//! max_sessions = 8
//! handshake_timeout_secs = 30
//!
//! [[targets]]
//! name = "build-01"
//! address = "http://10.0.0.11:5544"
//! ```
//!
//! Loading never panics; [`load`] returns a [`ConfigError`] and the binary
//! decides to abort before serving traffic.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use axum::http::Uri;
use chrono::{NaiveTime, Timelike};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Header carrying the shared secret between proxy, agent and clients.
pub const SECURITY_KEY_HEADER: &str = "x-security-key";

/// Errors produced while loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Implemented by every role configuration; run once after deserialization.
pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Env-var overrides shared by both roles.
pub trait EnvOverrides {
    fn apply_env(&mut self);
}

/// Agent role configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Proxy (gateway) role configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_server")]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (agent default `127.0.0.1:5544`, proxy `127.0.0.1:5533`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Upper bound on handling one plain HTTP request, in seconds (default 3600).
    /// WebSocket sessions are not bounded once upgraded.
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Proxy only: upper bound on waiting for an upstream response, in seconds
    /// (default 3600). The agent ignores it.
    #[serde(default = "default_timeout_secs")]
    pub write_timeout_secs: u64,
}

/// Access control settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Shared secret sent in `X-Security-Key`. Override with `CMDER_SECURITY_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_security_key")]
    pub security_key: String,
    /// Literal IPs or CIDR ranges allowed to call the service.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Optional daily window outside of which requests are refused.
    #[serde(default)]
    pub access_window: Option<AccessWindow>,
}

/// Half-open daily window `[start, end)` in local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AccessWindow {
    #[serde(deserialize_with = "deserialize_time_of_day")]
    pub start: Duration,
    #[serde(deserialize_with = "deserialize_time_of_day")]
    pub end: Duration,
}

/// Task engine limits.
#[derive(Debug, Clone, Deserialize)]
pub struct TasksConfig {
    /// Maximum number of outstanding tasks (default 8).
    #[serde(default = "default_task_capacity")]
    pub capacity: usize,
    /// Background units allowed per task slot (default 2, one per output pipe).
    #[serde(default = "default_unit_multiplier")]
    pub unit_multiplier: usize,
    /// Commands containing any of these substrings are refused.
    #[serde(default)]
    pub forbidden: Vec<String>,
}

/// Shell used to run commands and scripts.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Shell binary name or path (default `bash`).
    #[serde(default = "default_shell")]
    pub shell: String,
}

/// Proxy relay limits.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Maximum concurrently relayed WebSocket sessions (default 8).
    #[serde(default = "default_max_relay_sessions")]
    pub max_sessions: usize,
    /// Seconds allowed for the backend WebSocket handshake (default 30).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

/// A named upstream agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:5544".to_string()
}
fn default_proxy_listen() -> String {
    "127.0.0.1:5533".to_string()
}
fn default_timeout_secs() -> u64 {
    3600
}
fn default_security_key() -> String {
    "change-me".to_string()
}
fn default_task_capacity() -> usize {
    8
}
fn default_unit_multiplier() -> usize {
    2
}
fn default_shell() -> String {
    "bash".to_string()
}
fn default_max_relay_sessions() -> usize {
    8
}
fn default_handshake_timeout() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_proxy_server() -> ServerConfig {
    ServerConfig {
        listen: default_proxy_listen(),
        ..ServerConfig::default()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            read_timeout_secs: default_timeout_secs(),
            write_timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            security_key: default_security_key(),
            whitelist: Vec::new(),
            access_window: None,
        }
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            capacity: default_task_capacity(),
            unit_multiplier: default_unit_multiplier(),
            forbidden: Vec::new(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_relay_sessions(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server: default_proxy_server(),
            auth: AuthConfig::default(),
            relay: RelayConfig::default(),
            targets: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl AgentConfig {
    /// Total background units admitted at once (readers, script units).
    pub fn unit_limit(&self) -> usize {
        self.tasks.capacity.saturating_mul(self.tasks.unit_multiplier).max(1)
    }
}

impl ProxyConfig {
    /// Two relay loops per relayed session.
    pub fn unit_limit(&self) -> usize {
        self.relay.max_sessions.saturating_mul(2).max(1)
    }
}

impl AccessWindow {
    pub fn contains(&self, elapsed: Duration) -> bool {
        crate::auth::authorize_time_window(elapsed, self.start, self.end)
    }
}

/// Parse `HH:MM` or `HH:MM:SS` into an offset from midnight.
pub fn parse_time_of_day(s: &str) -> Option<Duration> {
    let s = s.trim();
    let time = NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()?;
    Some(Duration::from_secs(u64::from(time.num_seconds_from_midnight())))
}

fn deserialize_time_of_day<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_time_of_day(&raw).ok_or_else(|| {
        serde::de::Error::custom(format!("invalid time of day {raw:?}, expected HH:MM[:SS]"))
    })
}

fn validate_common(server: &ServerConfig, auth: &AuthConfig) -> Result<(), ConfigError> {
    if server.listen.trim().is_empty() {
        return Err(ConfigError::Invalid("server.listen must not be empty".into()));
    }
    if auth.whitelist.iter().all(|entry| entry.trim().is_empty()) {
        return Err(ConfigError::Invalid("auth.whitelist must not be empty".into()));
    }
    if let Some(window) = auth.access_window {
        if window.start >= window.end {
            return Err(ConfigError::Invalid(
                "auth.access_window.start must be earlier than end".into(),
            ));
        }
    }
    Ok(())
}

impl Validate for AgentConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        validate_common(&self.server, &self.auth)?;
        if self.tasks.capacity == 0 {
            return Err(ConfigError::Invalid("tasks.capacity must be at least 1".into()));
        }
        if self.tasks.unit_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "tasks.unit_multiplier must be at least 1".into(),
            ));
        }
        if self.shell.shell.trim().is_empty() {
            return Err(ConfigError::Invalid("shell.shell must not be empty".into()));
        }
        Ok(())
    }
}

impl Validate for ProxyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        validate_common(&self.server, &self.auth)?;
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid("targets must not be empty".into()));
        }
        if self.relay.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "relay.max_sessions must be at least 1".into(),
            ));
        }
        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.name.is_empty() {
                return Err(ConfigError::Invalid("target name must not be empty".into()));
            }
            if !seen.insert(target.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate target name {:?}",
                    target.name
                )));
            }
            let uri: Uri = target.address.parse().map_err(|e| {
                ConfigError::Invalid(format!("target {:?}: invalid address: {e}", target.name))
            })?;
            match uri.scheme_str() {
                Some("http" | "https" | "ws" | "wss") if uri.authority().is_some() => {}
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "target {:?}: address must be an absolute http(s) or ws(s) URI",
                        target.name
                    )))
                }
            }
        }
        Ok(())
    }
}

impl EnvOverrides for AgentConfig {
    fn apply_env(&mut self) {
        apply_common_env(&mut self.server, &mut self.auth);
    }
}

impl EnvOverrides for ProxyConfig {
    fn apply_env(&mut self) {
        apply_common_env(&mut self.server, &mut self.auth);
    }
}

fn apply_common_env(server: &mut ServerConfig, auth: &mut AuthConfig) {
    if let Ok(key) = std::env::var("CMDER_SECURITY_KEY") {
        auth.security_key = key;
    }
    if let Ok(listen) = std::env::var("CMDER_LISTEN") {
        server.listen = listen;
    }
}

/// Parse configuration text, picking the format from the file name.
pub fn parse<T: DeserializeOwned>(path: &str, content: &str) -> Result<T, ConfigError> {
    let is_yaml = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
    if is_yaml {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            message: e.to_string(),
        })
    } else {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            message: e.to_string(),
        })
    }
}

/// Load configuration with the precedence chain: env vars > file > defaults,
/// then validate it.
pub fn load<T>(path: Option<&str>) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default + Validate + EnvOverrides,
{
    let candidate = match path {
        Some(p) => Some(p.to_string()),
        None => ["cmder.toml", "config.yaml"]
            .iter()
            .find(|p| Path::new(p).exists())
            .map(|p| (*p).to_string()),
    };

    let mut config: T = match candidate {
        Some(p) => {
            let content = std::fs::read_to_string(&p).map_err(|source| ConfigError::Read {
                path: p.clone(),
                source,
            })?;
            parse(&p, &content)?
        }
        None => T::default(),
    };

    config.apply_env();
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_defaults_fill_missing_sections() {
        let cfg: AgentConfig = parse(
            "agent.toml",
            "[auth]\nsecurity_key = \"k\"\nwhitelist = [\"127.0.0.1\"]\n",
        )
        .unwrap();
        assert_eq!(cfg.server.listen, "127.0.0.1:5544");
        assert_eq!(cfg.tasks.capacity, 8);
        assert_eq!(cfg.unit_limit(), 16);
        assert_eq!(cfg.shell.shell, "bash");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_proxy_yaml_with_targets_and_window() {
        let yaml = r#"
auth:
  security_key: secret
  whitelist: ["10.0.0.0/8"]
  access_window:
    start: "09:00"
    end: "18:30:15"
targets:
  - name: build-01
    address: http://10.0.0.11:5544
"#;
        let cfg: ProxyConfig = parse("config.yaml", yaml).unwrap();
        assert_eq!(cfg.server.listen, "127.0.0.1:5533");
        assert_eq!(cfg.targets.len(), 1);
        let window = cfg.auth.access_window.unwrap();
        assert_eq!(window.start, Duration::from_secs(9 * 3600));
        assert_eq!(window.end, Duration::from_secs(18 * 3600 + 30 * 60 + 15));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_empty_whitelist_is_rejected() {
        let cfg = AgentConfig::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_proxy_requires_targets_and_unique_names() {
        let mut cfg = ProxyConfig::default();
        cfg.auth.whitelist = vec!["127.0.0.1".into()];
        assert!(cfg.validate().is_err());

        let target = TargetConfig {
            name: "a".into(),
            address: "http://127.0.0.1:1".into(),
        };
        cfg.targets = vec![target.clone(), target];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_proxy_rejects_relative_target_address() {
        let mut cfg = ProxyConfig::default();
        cfg.auth.whitelist = vec!["127.0.0.1".into()];
        cfg.targets = vec![TargetConfig {
            name: "a".into(),
            address: "/just/a/path".into(),
        }];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_inverted_window_is_rejected() {
        let mut cfg = AgentConfig::default();
        cfg.auth.whitelist = vec!["127.0.0.1".into()];
        cfg.auth.access_window = Some(AccessWindow {
            start: Duration::from_secs(18 * 3600),
            end: Duration::from_secs(9 * 3600),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_time_of_day_fails_parse() {
        let toml = "[auth]\nwhitelist = [\"127.0.0.1\"]\naccess_window = { start = \"9am\", end = \"18:00\" }\n";
        let err = parse::<AgentConfig>("agent.toml", toml).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("00:00"), Some(Duration::ZERO));
        assert_eq!(parse_time_of_day("23:59:59"), Some(Duration::from_secs(86399)));
        assert_eq!(parse_time_of_day("24:00"), None);
    }
}
