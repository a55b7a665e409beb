//! Relay Configuration
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then environment overrides. Durations are expressed in milliseconds so the
//! file format stays flat.
//!
//! # Environment Variables
//!
//! - `RELAY_ACTIVE_INTERACTION_TTL_MS`: interaction lock TTL (default 600000)
//! - `RELAY_CLIENT_MESSAGE_ACTIVE_TTL_MS`: in-flight message id TTL (default 300000)
//! - `RELAY_CLIENT_MESSAGE_COMPLETED_TTL_MS`: finished message id TTL (default 3600000)
//! - `RELAY_IDLE_TIMEOUT_MS`: max silence between upstream events (default 120000)
//! - `RELAY_FIRST_TOKEN_TIMEOUT_MS`: first-token watchdog (default 35000)
//! - `RELAY_HEARTBEAT_INTERVAL_MS`: heartbeat comment interval (default 15000)
//! - `RELAY_HEARTBEAT`: `0`/`false` disables heartbeats
//! - `RELAY_LISTEN_ADDR`: daemon listen address (default `127.0.0.1:8787`)
//! - `RELAY_PROVIDER`: `ollama` or `echo`
//! - `OLLAMA_HOST` / `OLLAMA_PORT` / `RELAY_MODEL`: provider connection
//!
//! Millisecond values that fail to parse or are not positive are ignored and
//! the previous value is kept.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// The configuration file is not valid TOML for [`RelayConfig`]
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: toml::de::Error,
    },
    /// A value is out of range
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

// ============================================================================
// Sections
// ============================================================================

/// HTTP surface settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the daemon binds to
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8787".to_string(),
        }
    }
}

/// Reservation registry TTLs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// TTL of an active interaction lock
    pub active_interaction_ttl_ms: u64,
    /// TTL of an in-flight client message id
    pub client_message_active_ttl_ms: u64,
    /// TTL of a completed client message id
    pub client_message_completed_ttl_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            active_interaction_ttl_ms: 10 * 60 * 1000,
            client_message_active_ttl_ms: 5 * 60 * 1000,
            client_message_completed_ttl_ms: 60 * 60 * 1000,
        }
    }
}

/// Per-session streaming policy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Whether heartbeat comments are written before the first chunk
    pub heartbeat_enabled: bool,
    /// Heartbeat comment interval
    pub heartbeat_interval_ms: u64,
    /// Deadline for the first chunk once the prompt is ready
    pub first_token_timeout_ms: u64,
    /// Maximum silence between upstream events
    pub idle_timeout_ms: u64,
    /// How long finalization waits for the interaction bootstrap
    pub bootstrap_wait_ms: u64,
    /// How long finalization waits for queued telemetry
    pub telemetry_flush_timeout_ms: u64,
    /// Outbound frame buffer per session
    pub channel_capacity: usize,
    /// How long one frame may wait for room in the outbound buffer
    pub write_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_enabled: true,
            heartbeat_interval_ms: 15_000,
            first_token_timeout_ms: 35_000,
            idle_timeout_ms: 120_000,
            bootstrap_wait_ms: 2_000,
            telemetry_flush_timeout_ms: 5_000,
            channel_capacity: 64,
            write_timeout_ms: 10_000,
        }
    }
}

impl StreamConfig {
    /// Heartbeat interval as a [`Duration`]
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// First-token watchdog as a [`Duration`]
    #[must_use]
    pub fn first_token_timeout(&self) -> Duration {
        Duration::from_millis(self.first_token_timeout_ms)
    }

    /// Idle timeout as a [`Duration`]
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Bootstrap wait as a [`Duration`]
    #[must_use]
    pub fn bootstrap_wait(&self) -> Duration {
        Duration::from_millis(self.bootstrap_wait_ms)
    }

    /// Telemetry flush timeout as a [`Duration`]
    #[must_use]
    pub fn telemetry_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.telemetry_flush_timeout_ms)
    }

    /// Outbound write timeout as a [`Duration`]
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Set the outbound write timeout
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the first-token watchdog
    #[must_use]
    pub fn with_first_token_timeout(mut self, timeout: Duration) -> Self {
        self.first_token_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the idle timeout
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the heartbeat interval and enable heartbeats
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_enabled = true;
        self.heartbeat_interval_ms = duration_ms(interval);
        self
    }

    /// Disable heartbeats
    #[must_use]
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat_enabled = false;
        self
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Which generation provider the daemon talks to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local Ollama server
    #[default]
    Ollama,
    /// Echoes the prompt back word by word
    Echo,
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "echo" => Ok(Self::Echo),
            other => Err(ConfigError::InvalidValue {
                field: "provider.kind",
                reason: format!("unknown provider '{other}'"),
            }),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ollama => write!(f, "ollama"),
            Self::Echo => write!(f, "echo"),
        }
    }
}

/// Generation provider connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider implementation
    pub kind: ProviderKind,
    /// Ollama host
    pub ollama_host: String,
    /// Ollama port
    pub ollama_port: u16,
    /// Model name passed to the provider
    pub model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Ollama,
            ollama_host: "localhost".to_string(),
            ollama_port: 11434,
            model: "llama3.2".to_string(),
        }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Complete relay configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// HTTP surface
    pub server: ServerConfig,
    /// Reservation registries
    pub dedup: DedupConfig,
    /// Streaming policy
    pub stream: StreamConfig,
    /// Generation provider
    pub provider: ProviderConfig,
}

impl RelayConfig {
    /// Load defaults, the config file and environment overrides
    ///
    /// An explicit `path` must exist. Without one the default location is
    /// used when a file is present there.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or a
    /// value fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => load_config(p)?,
            None => match default_config_path() {
                Some(p) if p.exists() => load_config(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let ms = |key: &str, current: u64| -> u64 {
            match lookup(key) {
                Some(raw) => positive_ms(key, &raw).unwrap_or(current),
                None => current,
            }
        };

        self.dedup.active_interaction_ttl_ms = ms(
            "RELAY_ACTIVE_INTERACTION_TTL_MS",
            self.dedup.active_interaction_ttl_ms,
        );
        self.dedup.client_message_active_ttl_ms = ms(
            "RELAY_CLIENT_MESSAGE_ACTIVE_TTL_MS",
            self.dedup.client_message_active_ttl_ms,
        );
        self.dedup.client_message_completed_ttl_ms = ms(
            "RELAY_CLIENT_MESSAGE_COMPLETED_TTL_MS",
            self.dedup.client_message_completed_ttl_ms,
        );
        self.stream.idle_timeout_ms = ms("RELAY_IDLE_TIMEOUT_MS", self.stream.idle_timeout_ms);
        self.stream.first_token_timeout_ms = ms(
            "RELAY_FIRST_TOKEN_TIMEOUT_MS",
            self.stream.first_token_timeout_ms,
        );
        self.stream.heartbeat_interval_ms = ms(
            "RELAY_HEARTBEAT_INTERVAL_MS",
            self.stream.heartbeat_interval_ms,
        );

        if let Some(raw) = lookup("RELAY_HEARTBEAT") {
            self.stream.heartbeat_enabled = !matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "off" | "no"
            );
        }
        if let Some(addr) = lookup("RELAY_LISTEN_ADDR").filter(|v| !v.trim().is_empty()) {
            self.server.listen_addr = addr.trim().to_string();
        }
        if let Some(raw) = lookup("RELAY_PROVIDER") {
            match raw.parse() {
                Ok(kind) => self.provider.kind = kind,
                Err(e) => tracing::warn!(error = %e, "Ignoring RELAY_PROVIDER"),
            }
        }
        if let Some(host) = lookup("OLLAMA_HOST").filter(|v| !v.trim().is_empty()) {
            self.provider.ollama_host = host.trim().to_string();
        }
        if let Some(port) = lookup("OLLAMA_PORT").and_then(|v| v.trim().parse().ok()) {
            self.provider.ollama_port = port;
        }
        if let Some(model) = lookup("RELAY_MODEL").filter(|v| !v.trim().is_empty()) {
            self.provider.model = model.trim().to_string();
        }
    }

    /// Reject values the session loop cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, u64); 7] = [
            ("dedup.active_interaction_ttl_ms", self.dedup.active_interaction_ttl_ms),
            ("dedup.client_message_active_ttl_ms", self.dedup.client_message_active_ttl_ms),
            (
                "dedup.client_message_completed_ttl_ms",
                self.dedup.client_message_completed_ttl_ms,
            ),
            ("stream.first_token_timeout_ms", self.stream.first_token_timeout_ms),
            ("stream.idle_timeout_ms", self.stream.idle_timeout_ms),
            ("stream.heartbeat_interval_ms", self.stream.heartbeat_interval_ms),
            ("stream.write_timeout_ms", self.stream.write_timeout_ms),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.stream.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "stream.channel_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

fn positive_ms(key: &str, raw: &str) -> Option<u64> {
    match raw.trim().parse::<i64>() {
        Ok(v) if v > 0 => u64::try_from(v).ok(),
        _ => {
            tracing::warn!(key = key, value = raw, "Ignoring non-positive or invalid duration");
            None
        }
    }
}

/// Default config file location (`$XDG_CONFIG_HOME/sse-relay/relay.toml`)
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("sse-relay").join("relay.toml"))
}

/// Read a TOML config file
///
/// # Errors
///
/// Returns [`ConfigError::Io`] or [`ConfigError::Parse`].
pub fn load_config(path: &Path) -> Result<RelayConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    use pretty_assertions::assert_eq;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.dedup.active_interaction_ttl_ms, 600_000);
        assert_eq!(config.dedup.client_message_active_ttl_ms, 300_000);
        assert_eq!(config.dedup.client_message_completed_ttl_ms, 3_600_000);
        assert_eq!(config.stream.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.stream.first_token_timeout(), Duration::from_secs(35));
        assert_eq!(config.stream.idle_timeout(), Duration::from_secs(120));
        assert_eq!(config.stream.write_timeout(), Duration::from_secs(10));
        assert!(config.stream.heartbeat_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_apply() {
        let mut config = RelayConfig::default();
        config.apply_overrides_from(lookup(&[
            ("RELAY_CLIENT_MESSAGE_ACTIVE_TTL_MS", "1000"),
            ("RELAY_FIRST_TOKEN_TIMEOUT_MS", "500"),
            ("RELAY_HEARTBEAT", "false"),
            ("RELAY_PROVIDER", "echo"),
            ("OLLAMA_PORT", "9999"),
        ]));
        assert_eq!(config.dedup.client_message_active_ttl_ms, 1000);
        assert_eq!(config.stream.first_token_timeout_ms, 500);
        assert!(!config.stream.heartbeat_enabled);
        assert_eq!(config.provider.kind, ProviderKind::Echo);
        assert_eq!(config.provider.ollama_port, 9999);
    }

    #[test]
    fn test_env_invalid_values_fall_back() {
        let mut config = RelayConfig::default();
        config.apply_overrides_from(lookup(&[
            ("RELAY_ACTIVE_INTERACTION_TTL_MS", "-5"),
            ("RELAY_CLIENT_MESSAGE_COMPLETED_TTL_MS", "0"),
            ("RELAY_IDLE_TIMEOUT_MS", "soon"),
            ("RELAY_PROVIDER", "mystery"),
        ]));
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[stream]\nfirst_token_timeout_ms = 1234\n\n[provider]\nkind = \"echo\"\n"
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.stream.first_token_timeout_ms, 1234);
        assert_eq!(config.stream.idle_timeout_ms, 120_000);
        assert_eq!(config.provider.kind, ProviderKind::Echo);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[stream\nbroken").unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            RelayConfig::load(Some(&missing)),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let mut config = RelayConfig::default();
        config.stream.idle_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "stream.idle_timeout_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("Ollama".parse::<ProviderKind>().unwrap(), ProviderKind::Ollama);
        assert_eq!(" echo ".parse::<ProviderKind>().unwrap(), ProviderKind::Echo);
        assert!("gpt".parse::<ProviderKind>().is_err());
    }
}
