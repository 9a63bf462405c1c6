//! Server and session configuration.
//!
//! Plain structs with sensible defaults; [`ServerConfig::from_env`] overlays
//! `FOLIO_*` environment variables for deployment.

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::BridgeConfig;
use crate::persistence::{RetentionPolicy, StoreConfig, WriterConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Lifecycle timings of document sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Snapshot cadence for documents with connections. Default: 5s.
    pub snapshot_interval: Duration,
    /// Idle sweep cadence. Default: 5 min.
    pub sweep_interval: Duration,
    /// How long a session with no connections survives. Default: 15 min.
    pub idle_threshold: Duration,
    /// Upper bound on the initial load from persistence. Default: 10s.
    pub load_timeout: Duration,
    /// Frames buffered per connection before it counts as a slow consumer.
    pub outbox_capacity: usize,
    pub writer: WriterConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5 * 60),
            idle_threshold: Duration::from_secs(15 * 60),
            load_timeout: Duration::from_secs(10),
            outbox_capacity: 256,
            writer: WriterConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Short timings for tests.
    pub fn for_testing() -> Self {
        Self {
            snapshot_interval: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(100),
            idle_threshold: Duration::from_millis(200),
            load_timeout: Duration::from_secs(2),
            outbox_capacity: 256,
            writer: WriterConfig::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket listen address.
    pub bind_addr: String,
    /// Health endpoint listen address (None = disabled).
    pub health_addr: Option<String>,
    /// RocksDB directory (None = in-memory store).
    pub storage: Option<StoreConfig>,
    /// Relay hub URL (None = in-process fan-out only).
    pub relay_url: Option<String>,
    /// Relay hub that hosts the shared store. Takes precedence over
    /// `storage`, which then only applies to the `relay` command.
    pub store_url: Option<String>,
    /// Standard-base64 ed25519 verifying key for bearer tokens.
    pub auth_public_key: Option<String>,
    pub session: SessionConfig,
    pub retention: RetentionPolicy,
    pub bridge: BridgeConfig,
    /// Server ping cadence.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Protocol errors tolerated before the connection is closed.
    pub max_protocol_errors: u32,
    /// Largest accepted inbound frame.
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            health_addr: Some("127.0.0.1:9091".to_string()),
            storage: None,
            relay_url: None,
            store_url: None,
            auth_public_key: None,
            session: SessionConfig::default(),
            retention: RetentionPolicy::default(),
            bridge: BridgeConfig::default(),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            max_protocol_errors: 16,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, no health endpoint, short timings.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            health_addr: None,
            session: SessionConfig::for_testing(),
            heartbeat_interval: Duration::from_millis(200),
            heartbeat_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `FOLIO_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values looked up through `lookup`. Absent keys keep their
    /// current value; unparsable ones are an error.
    pub fn overlay(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(bind) = lookup("FOLIO_BIND") {
            self.bind_addr = bind;
        }
        if let Some(health) = lookup("FOLIO_HEALTH_BIND") {
            self.health_addr = match health.as_str() {
                "" | "off" => None,
                _ => Some(health),
            };
        }
        if let Some(path) = lookup("FOLIO_STORAGE_PATH") {
            if !path.is_empty() {
                self.storage = Some(StoreConfig {
                    path: PathBuf::from(path),
                    ..StoreConfig::default()
                });
            }
        }
        if let Some(url) = lookup("FOLIO_RELAY_URL") {
            if !url.is_empty() {
                self.relay_url = Some(url);
            }
        }
        if let Some(url) = lookup("FOLIO_STORE_URL") {
            if !url.is_empty() {
                self.store_url = Some(url);
            }
        }
        if let Some(key) = lookup("FOLIO_AUTH_PUBLIC_KEY") {
            self.auth_public_key = Some(key);
        }
        if let Some(secs) = lookup("FOLIO_SNAPSHOT_SECS") {
            self.session.snapshot_interval = parse_secs("FOLIO_SNAPSHOT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("FOLIO_IDLE_SECS") {
            self.session.idle_threshold = parse_secs("FOLIO_IDLE_SECS", &secs)?;
        }
        Ok(self)
    }
}

fn parse_secs(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be positive".into(),
        }),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(e) => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let map: HashMap<&'static str, String> =
            pairs.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.session.snapshot_interval, Duration::from_secs(5));
        assert_eq!(config.session.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.session.idle_threshold, Duration::from_secs(900));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(45));
        assert_eq!(config.max_protocol_errors, 16);
        assert!(config.storage.is_none());
        assert!(config.store_url.is_none());
    }

    #[test]
    fn test_shared_store_url() {
        let config = ServerConfig::default()
            .overlay(env(&[
                ("FOLIO_RELAY_URL", "ws://hub:9190"),
                ("FOLIO_STORE_URL", "ws://hub:9190"),
            ]))
            .unwrap();
        assert_eq!(config.relay_url.as_deref(), Some("ws://hub:9190"));
        assert_eq!(config.store_url.as_deref(), Some("ws://hub:9190"));

        let config = ServerConfig::default()
            .overlay(env(&[("FOLIO_STORE_URL", "")]))
            .unwrap();
        assert!(config.store_url.is_none());
    }

    #[test]
    fn test_overlay_from_env() {
        let config = ServerConfig::default()
            .overlay(env(&[
                ("FOLIO_BIND", "0.0.0.0:7000"),
                ("FOLIO_HEALTH_BIND", "off"),
                ("FOLIO_STORAGE_PATH", "/var/lib/folio"),
                ("FOLIO_SNAPSHOT_SECS", "10"),
            ]))
            .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert!(config.health_addr.is_none());
        assert_eq!(
            config.storage.unwrap().path,
            PathBuf::from("/var/lib/folio")
        );
        assert_eq!(config.session.snapshot_interval, Duration::from_secs(10));
        assert_eq!(config.session.idle_threshold, Duration::from_secs(900));
    }

    #[test]
    fn test_bad_number_is_error() {
        let err = ServerConfig::default()
            .overlay(env(&[("FOLIO_IDLE_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("FOLIO_IDLE_SECS"));
        assert!(ServerConfig::default()
            .overlay(env(&[("FOLIO_SNAPSHOT_SECS", "0")]))
            .is_err());
    }
}
