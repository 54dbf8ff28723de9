//! TOML configuration for the tunable parts of the protocol stack.
//!
//! ```toml
//! [discovery]
//! port = 5555
//! probe_interval_ms = 1000
//! receive_timeout_ms = 500
//! peer_expiry_ms = 5000
//! broadcast_addr = "255.255.255.255"
//!
//! [realtime]
//! port = 7777
//! keepalive_interval_ms = 1000
//!
//! [http]
//! request_timeout_ms = 5000
//!
//! [auth]
//! integrity_policy = "warn"
//! auto_refresh = true
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Intervals and timeouts must be non-zero; `peer_expiry_ms = 0` disables
//! expiry instead.
//! The vendor secrets are compiled in and cannot be configured.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::discovery::{DiscoveryOptions, DISCOVERY_PORT};
use crate::session::{IntegrityPolicy, SessionOptions};
use crate::stream::REALTIME_PORT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config value {field} must be greater than zero")]
    Zero { field: &'static str },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct XledConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Bounds one receive wait and therefore stop latency.
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// `0` disables expiry.
    #[serde(default = "default_peer_expiry_ms")]
    pub peer_expiry_ms: u64,
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealtimeConfig {
    #[serde(default = "default_realtime_port")]
    pub port: u16,
    /// How long the stream may stay silent before the last frame is resent.
    /// Tune against the device; its fallback timeout is undocumented.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    #[serde(default)]
    pub integrity_policy: IntegrityPolicy,
    #[serde(default = "default_true")]
    pub auto_refresh: bool,
}

fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}
fn default_probe_interval_ms() -> u64 {
    1_000
}
fn default_receive_timeout_ms() -> u64 {
    500
}
fn default_peer_expiry_ms() -> u64 {
    5_000
}
fn default_broadcast_addr() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}
fn default_realtime_port() -> u16 {
    REALTIME_PORT
}
fn default_keepalive_interval_ms() -> u64 {
    1_000
}
fn default_request_timeout_ms() -> u64 {
    5_000
}
fn default_true() -> bool {
    true
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: default_discovery_port(),
            probe_interval_ms: default_probe_interval_ms(),
            receive_timeout_ms: default_receive_timeout_ms(),
            peer_expiry_ms: default_peer_expiry_ms(),
            broadcast_addr: default_broadcast_addr(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            port: default_realtime_port(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            integrity_policy: IntegrityPolicy::default(),
            auto_refresh: default_true(),
        }
    }
}

impl XledConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero periods, which would spin or stall the runtime tasks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("discovery.probe_interval_ms", self.discovery.probe_interval_ms),
            ("discovery.receive_timeout_ms", self.discovery.receive_timeout_ms),
            ("realtime.keepalive_interval_ms", self.realtime.keepalive_interval_ms),
            ("http.request_timeout_ms", self.http.request_timeout_ms),
        ];
        match periods.into_iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ConfigError::Zero { field }),
            None => Ok(()),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        let d = &self.discovery;
        DiscoveryOptions {
            destination: SocketAddr::from((d.broadcast_addr, d.port)),
            probe_interval: Duration::from_millis(d.probe_interval_ms),
            receive_timeout: Duration::from_millis(d.receive_timeout_ms),
            peer_expiry: (d.peer_expiry_ms > 0).then(|| Duration::from_millis(d.peer_expiry_ms)),
            ..DiscoveryOptions::default()
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            integrity_policy: self.auth.integrity_policy,
            auto_refresh: self.auth.auto_refresh,
            hardware_address: None,
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.realtime.keepalive_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.http.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = XledConfig::from_toml_str("").unwrap();
        assert_eq!(config, XledConfig::default());
        assert_eq!(config.discovery.port, 5555);
        assert_eq!(config.realtime.port, 7777);
        assert_eq!(config.auth.integrity_policy, IntegrityPolicy::Warn);
        assert!(config.auth.auto_refresh);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = XledConfig::from_toml_str(
            r#"
            [discovery]
            probe_interval_ms = 250
            broadcast_addr = "192.168.1.255"

            [auth]
            integrity_policy = "reject"
            "#,
        )
        .unwrap();
        assert_eq!(config.discovery.probe_interval_ms, 250);
        assert_eq!(config.discovery.receive_timeout_ms, 500);
        assert_eq!(config.auth.integrity_policy, IntegrityPolicy::Reject);

        let options = config.discovery_options();
        assert_eq!(options.destination, "192.168.1.255:5555".parse().unwrap());
        assert_eq!(options.probe_interval, Duration::from_millis(250));
        assert_eq!(
            config.session_options().integrity_policy,
            IntegrityPolicy::Reject
        );
    }

    #[test]
    fn zero_expiry_disables_reaping() {
        let config = XledConfig::from_toml_str("[discovery]\npeer_expiry_ms = 0\n").unwrap();
        assert_eq!(config.discovery_options().peer_expiry, None);
    }

    #[test]
    fn zero_periods_are_rejected() {
        for (text, field) in [
            ("[discovery]\nprobe_interval_ms = 0\n", "discovery.probe_interval_ms"),
            ("[discovery]\nreceive_timeout_ms = 0\n", "discovery.receive_timeout_ms"),
            ("[realtime]\nkeepalive_interval_ms = 0\n", "realtime.keepalive_interval_ms"),
            ("[http]\nrequest_timeout_ms = 0\n", "http.request_timeout_ms"),
        ] {
            match XledConfig::from_toml_str(text) {
                Err(ConfigError::Zero { field: got }) => assert_eq!(got, field),
                other => panic!("{text}: expected zero-value error, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let err = XledConfig::from_toml_str("[auth]\nintegrity_policy = \"ignore\"\n");
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = XledConfig::load("/nonexistent/xled.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/xled.toml"));
    }
}
