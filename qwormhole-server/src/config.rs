//! Daemon configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via QWORMHOLE_CONFIG)
//! 3. Environment variables

use qwormhole_protocol::{
    FramingMode, TagValue, Tags, DEFAULT_MAX_BACKPRESSURE_BYTES, DEFAULT_MAX_FRAME_LENGTH,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub framing: FramingConfig,
    pub handshake: HandshakeConfig,
    pub tls: TlsConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("QWORMHOLE_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.framing.apply_env_overrides();
        self.handshake.apply_env_overrides();
        self.tls.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.framing.validate()?;
        self.tls.validate()?;
        if self.network.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "network.max_connections must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    /// Idle connection timeout in seconds (0 = never).
    pub idle_timeout_secs: u64,
    pub read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7420)),
            max_connections: 1024,
            idle_timeout_secs: 0,
            read_buffer_size: 64 * 1024,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_parse("QWORMHOLE_BIND") {
            self.bind_addr = addr;
        }
        if let Some(n) = env_parse("QWORMHOLE_MAX_CONNECTIONS") {
            self.max_connections = n;
        }
        if let Some(secs) = env_parse("QWORMHOLE_IDLE_TIMEOUT") {
            self.idle_timeout_secs = secs;
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Framing and backpressure limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    pub mode: FramingMode,
    pub max_frame_length: u32,
    pub max_backpressure_bytes: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            mode: FramingMode::LengthPrefixed,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            max_backpressure_bytes: DEFAULT_MAX_BACKPRESSURE_BYTES,
        }
    }
}

impl FramingConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("QWORMHOLE_FRAMING") {
            match mode.to_lowercase().as_str() {
                "raw" => self.mode = FramingMode::Raw,
                "length_prefixed" | "length-prefixed" => self.mode = FramingMode::LengthPrefixed,
                other => tracing::warn!("Ignoring unknown QWORMHOLE_FRAMING value '{}'", other),
            }
        }
        if let Some(n) = env_parse("QWORMHOLE_MAX_FRAME_LENGTH") {
            self.max_frame_length = n;
        }
        if let Some(n) = env_parse("QWORMHOLE_MAX_BACKPRESSURE_BYTES") {
            self.max_backpressure_bytes = n;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_length == 0 {
            return Err(ConfigError::ValidationError(
                "framing.max_frame_length must be > 0".into(),
            ));
        }
        if self.max_backpressure_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "framing.max_backpressure_bytes must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Handshake policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Version sent to clients and required from them when set.
    pub protocol_version: Option<String>,
    pub tags: Tags,
    /// File holding a base64 ed25519 seed; the server signs its handshake with it.
    pub signing_key_file: Option<PathBuf>,
    /// Reject clients that do not send a signed handshake.
    pub require_signed: bool,
    /// SHA-256 hex hashes of accepted client public keys (empty = any key).
    pub allowed_key_hashes: Vec<String>,
    /// Optional file with one accepted key hash per line.
    pub allowed_keys_file: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
}

impl HandshakeConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(version) = std::env::var("QWORMHOLE_PROTOCOL_VERSION") {
            self.protocol_version = (!version.is_empty()).then_some(version);
        }
        if let Ok(path) = std::env::var("QWORMHOLE_SIGNING_KEY_FILE") {
            self.signing_key_file = Some(PathBuf::from(path));
        }
        if let Some(require) = env_flag("QWORMHOLE_REQUIRE_SIGNED") {
            self.require_signed = require;
        }
        if let Ok(hash) = std::env::var("QWORMHOLE_ALLOWED_KEY_HASH") {
            if !hash.is_empty() {
                self.allowed_key_hashes.push(hash);
            }
        }
        if let Ok(path) = std::env::var("QWORMHOLE_ALLOWED_KEYS_FILE") {
            self.allowed_keys_file = Some(PathBuf::from(path));
        }
        if let Ok(tags) = std::env::var("QWORMHOLE_HANDSHAKE_TAGS") {
            // key=value,key=value
            for pair in tags.split(',').filter(|p| !p.is_empty()) {
                if let Some((k, v)) = pair.split_once('=') {
                    let value = match v.trim().parse::<i64>() {
                        Ok(n) => TagValue::from(n),
                        Err(_) => TagValue::from(v.trim()),
                    };
                    self.tags.insert(k.trim().to_string(), value);
                }
            }
        }
    }

    /// Returns whether clients must open with a handshake.
    pub fn is_enabled(&self) -> bool {
        self.protocol_version.is_some()
            || self.require_signed
            || self.signing_key_file.is_some()
            || !self.allowed_key_hashes.is_empty()
            || self.allowed_keys_file.is_some()
    }

    /// Reads key hashes from `allowed_keys_file` into `allowed_key_hashes`.
    pub fn load_allowed_keys(&mut self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.allowed_keys_file {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
            for line in content.lines().map(str::trim) {
                if !line.is_empty() && !line.starts_with('#') {
                    self.allowed_key_hashes.push(line.to_string());
                }
            }
        }
        Ok(())
    }

    /// Reads the signing seed file, if configured.
    pub fn read_signing_seed(&self) -> Result<Option<String>, ConfigError> {
        match self.signing_key_file {
            Some(ref path) => std::fs::read_to_string(path)
                .map(|s| Some(s.trim().to_string()))
                .map_err(|e| ConfigError::IoError(path.clone(), e)),
            None => Ok(None),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// PEM-encoded server certificate chain.
    pub cert_path: Option<PathBuf>,
    /// PEM-encoded private key.
    pub key_path: Option<PathBuf>,
    /// Require client certificate authentication (mTLS).
    pub require_client_cert: bool,
    /// PEM-encoded CA certificate(s) for verifying client certs.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("QWORMHOLE_TLS_ENABLED") {
            self.enabled = enabled;
        }
        if let Ok(path) = std::env::var("QWORMHOLE_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("QWORMHOLE_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Some(require) = env_flag("QWORMHOLE_TLS_REQUIRE_CLIENT_CERT") {
            self.require_client_cert = require;
        }
        if let Ok(path) = std::env::var("QWORMHOLE_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.cert_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but cert_path not set".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but key_path not set".to_string(),
            ));
        }
        if self.require_client_cert && self.client_ca_path.is_none() {
            return Err(ConfigError::ValidationError(
                "mTLS enabled but client_ca_path not set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9420)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("QWORMHOLE_METRICS_ENABLED") {
            self.enabled = enabled;
        }
        if let Some(addr) = env_parse("QWORMHOLE_METRICS_BIND") {
            self.bind_addr = addr;
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde helpers for SocketAddr (a string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
