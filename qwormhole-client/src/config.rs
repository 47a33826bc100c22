//! Client configuration.

use crate::error::ClientError;
use qwormhole_core::{RateLimitConfig, ReconnectConfig};
use qwormhole_protocol::{
    FramingMode, HandshakeIdentity, HandshakeVerifier, TagValue, Tags, DEFAULT_MAX_FRAME_LENGTH,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default read size for socket reads (64 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Minimum read size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read size (4 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// TLS configuration for client connections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsClientConfig {
    /// Enable TLS for the connection.
    pub enabled: bool,
    /// PEM CA bundle for server verification. System roots when unset.
    pub ca_cert_path: Option<PathBuf>,
    /// PEM client certificate (mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// PEM client private key (mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification. Development only.
    pub insecure: bool,
    /// SNI name, defaults to the configured host.
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self.enabled = true;
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self.enabled = true;
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self.enabled = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Options for one client connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub framing: FramingMode,
    pub max_frame_length: u32,
    pub reconnect: ReconnectConfig,
    /// Enables outbound rate limiting.
    pub rate_limit_bytes_per_sec: Option<u64>,
    /// Defaults to one second of `rate_limit_bytes_per_sec`.
    pub rate_limit_burst_bytes: Option<u64>,
    /// Enables the handshake and is checked against the server's reply.
    pub protocol_version: Option<String>,
    pub handshake_tags: Tags,
    /// Reject server replies that are not signed.
    pub require_signed_handshake: bool,
    pub heartbeat_interval_ms: Option<u64>,
    /// Bounds connect plus handshake.
    pub connect_timeout_ms: u64,
    /// Silence while ready that forces a reconnect.
    pub idle_timeout_ms: Option<u64>,
    /// Bind to a named local interface (Linux only).
    pub interface_name: Option<String>,
    pub local_address: Option<IpAddr>,
    pub local_port: Option<u16>,
    pub tls: Option<TlsClientConfig>,
    pub read_buffer_size: usize,
    /// Signs the outbound handshake. Implies a handshake.
    #[serde(skip)]
    pub identity: Option<Arc<HandshakeIdentity>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            framing: FramingMode::LengthPrefixed,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            reconnect: ReconnectConfig::default(),
            rate_limit_bytes_per_sec: None,
            rate_limit_burst_bytes: None,
            protocol_version: None,
            handshake_tags: Tags::new(),
            require_signed_handshake: false,
            heartbeat_interval_ms: None,
            connect_timeout_ms: 10_000,
            idle_timeout_ms: None,
            interface_name: None,
            local_address: None,
            local_port: None,
            tls: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            identity: None,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_framing(mut self, framing: FramingMode) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_max_frame_length(mut self, max: u32) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_rate_limit(mut self, bytes_per_sec: u64, burst_bytes: Option<u64>) -> Self {
        self.rate_limit_bytes_per_sec = Some(bytes_per_sec);
        self.rate_limit_burst_bytes = burst_bytes;
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = Some(version.into());
        self
    }

    pub fn with_handshake_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.handshake_tags.insert(key.into(), value.into());
        self
    }

    pub fn with_identity(mut self, identity: Arc<HandshakeIdentity>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_interface(mut self, name: impl Into<String>) -> Self {
        self.interface_name = Some(name.into());
        self
    }

    pub fn with_local_address(mut self, addr: IpAddr, port: Option<u16>) -> Self {
        self.local_address = Some(addr);
        self.local_port = port;
        self
    }

    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    /// Returns whether connections open with a handshake exchange.
    pub fn handshake_enabled(&self) -> bool {
        self.protocol_version.is_some() || self.identity.is_some()
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().map(|t| t.enabled).unwrap_or(false)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    pub fn rate_limit(&self) -> Option<RateLimitConfig> {
        self.rate_limit_bytes_per_sec.map(|rate| RateLimitConfig {
            bytes_per_sec: rate,
            burst_bytes: self.rate_limit_burst_bytes.unwrap_or(rate),
        })
    }

    pub fn verifier(&self) -> HandshakeVerifier {
        HandshakeVerifier::new(self.protocol_version.clone())
            .require_signed(self.require_signed_handshake)
    }

    /// Checks option consistency before any socket is opened.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.host.is_empty() {
            return Err(ClientError::Configuration("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ClientError::Configuration("port must not be 0".into()));
        }
        if self.max_frame_length == 0 {
            return Err(ClientError::Configuration(
                "max_frame_length must be > 0".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ClientError::Configuration(
                "connect_timeout_ms must be > 0".into(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(ClientError::Configuration(
                "read_buffer_size must be > 0".into(),
            ));
        }
        if let Some(tls) = &self.tls {
            if tls.client_cert_path.is_some() != tls.client_key_path.is_some() {
                return Err(ClientError::Configuration(
                    "client_cert_path and client_key_path must be set together".into(),
                ));
            }
        }
        if let Some(limit) = self.rate_limit() {
            limit.validate()?;
        }
        self.reconnect.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("localhost", 9000);
        assert_eq!(config.framing, FramingMode::LengthPrefixed);
        assert_eq!(config.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert!(!config.handshake_enabled());
        assert!(config.rate_limit().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_handshake_enabled() {
        let config = ClientConfig::new("localhost", 9000).with_protocol_version("1.0");
        assert!(config.handshake_enabled());

        let identity = Arc::new(HandshakeIdentity::from_seed([1u8; 32]));
        let config = ClientConfig::new("localhost", 9000).with_identity(identity);
        assert!(config.handshake_enabled());
    }

    #[test]
    fn test_rate_limit_burst_defaults_to_rate() {
        let config = ClientConfig::new("localhost", 9000).with_rate_limit(2048, None);
        let limit = config.rate_limit().unwrap();
        assert_eq!(limit.burst_bytes, 2048);

        let config = ClientConfig::new("localhost", 9000).with_rate_limit(2048, Some(64));
        assert_eq!(config.rate_limit().unwrap().burst_bytes, 64);
    }

    #[test]
    fn test_validate_rejects() {
        assert!(ClientConfig::new("", 9000).validate().is_err());
        assert!(ClientConfig::new("localhost", 0).validate().is_err());
        assert!(ClientConfig::new("localhost", 9000)
            .with_rate_limit(0, None)
            .validate()
            .is_err());

        let mut config = ClientConfig::new("localhost", 9000);
        config.reconnect.multiplier = 0.1;
        assert!(matches!(config.validate(), Err(ClientError::Core(_))));

        let mut tls = TlsClientConfig::new();
        tls.client_cert_path = Some("cert.pem".into());
        let config = ClientConfig::new("localhost", 9000).with_tls(tls);
        assert!(matches!(
            config.validate(),
            Err(ClientError::Configuration(_))
        ));
    }

    #[test]
    fn test_buffer_clamping() {
        let config = ClientConfig::new("localhost", 9000).with_read_buffer_size(10);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);
        let config = ClientConfig::new("localhost", 9000).with_read_buffer_size(usize::MAX);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_zero_intervals_disable() {
        let mut config = ClientConfig::new("localhost", 9000);
        config.heartbeat_interval_ms = Some(0);
        config.idle_timeout_ms = Some(0);
        assert!(config.heartbeat_interval().is_none());
        assert!(config.idle_timeout().is_none());
    }

    #[test]
    fn test_deserialize() {
        let config: ClientConfig = serde_json::from_str(
            r#"{
                "host": "10.0.0.1",
                "port": 7000,
                "framing": "raw",
                "reconnect": {"initial_delay_ms": 10, "multiplier": 2.0, "max_attempts": 3},
                "handshake_tags": {"role": "edge", "weight": 2}
            }"#,
        )
        .unwrap();
        assert_eq!(config.framing, FramingMode::Raw);
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert_eq!(config.handshake_tags.len(), 2);
        assert!(config.identity.is_none());
    }
}
