//! Node configuration.
//!
//! Plain serde structs with defaults, loadable from a YAML file and
//! `MESHBUS`-prefixed environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "meshbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MESHBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MESHBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MESHBUS_LOG";

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid socket address '{value}' for {field}")]
    InvalidAddress { field: &'static str, value: String },
}

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node-level settings.
    pub node: NodeConfig,
    /// Transport settings.
    pub transport: TransportConfig,
    /// Discovery settings.
    pub discovery: DiscoveryConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources (later overrides earlier):
    /// 1. `meshbus.yaml` in the current directory (if present)
    /// 2. File given by `path` (if provided)
    /// 3. File named by `MESHBUS_CONFIG` (if set)
    /// 4. Environment variables with the `MESHBUS` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing: ephemeral ports, static discovery.
    pub fn for_test() -> Self {
        Self {
            discovery: DiscoveryConfig {
                mode: DiscoveryMode::Static,
                ..DiscoveryConfig::default()
            },
            ..Self::default()
        }
    }
}

/// Node-level settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Per-subscription inbound queue high-water mark. `None` means
    /// unbounded; when set, overflow drops the oldest pending message.
    pub queue_high_water: Option<usize>,
    /// When true, publishing on a topic with no known subscribers is an
    /// `UnknownTopic` error instead of a silent no-op.
    pub strict_topics: bool,
    /// How long one `spin` iteration waits for inbound traffic before
    /// re-checking the shutdown flag.
    pub idle_poll_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            queue_high_water: None,
            strict_topics: false,
            idle_poll_ms: 100,
        }
    }
}

impl NodeConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

/// Transport settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Listen address for inbound channels. Port 0 picks an ephemeral
    /// port, announced to peers through discovery.
    pub listen: String,
    /// Bound on establishing an outbound channel.
    pub connect_timeout_ms: u64,
    /// Upper bound on a single wire frame.
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:0".to_string(),
            connect_timeout_ms: 1_000,
            max_frame_bytes: crate::message::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl TransportConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::InvalidAddress {
                field: "transport.listen",
                value: self.listen.clone(),
            })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Discovery type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// UDP multicast announcements (broker-free default).
    #[default]
    Multicast,
    /// Peers listed in configuration; no announcements on the wire.
    Static,
}

/// Discovery settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Discovery type discriminator.
    pub mode: DiscoveryMode,
    /// Multicast group for announcements.
    pub group: String,
    /// UDP port for the discovery channel.
    pub port: u16,
    /// Interval between presence announcements.
    pub heartbeat_ms: u64,
    /// A peer with no heartbeat for this long becomes Stale.
    pub liveness_timeout_ms: u64,
    /// A Stale peer is removed after this additional grace period.
    pub grace_ms: u64,
    /// Peers for static mode.
    pub static_peers: Vec<StaticPeer>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::default(),
            group: "239.255.70.70".to_string(),
            port: 7070,
            heartbeat_ms: 1_000,
            liveness_timeout_ms: 5_000,
            grace_ms: 2_000,
            static_peers: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn group_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.group, self.port)
            .parse()
            .map_err(|_| ConfigError::InvalidAddress {
                field: "discovery.group",
                value: self.group.clone(),
            })
    }
}

/// A statically configured peer.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticPeer {
    /// Peer node identity.
    pub name: String,
    /// Transport endpoint, e.g. `10.0.0.5:7071`.
    pub endpoint: String,
    /// Topics the peer subscribes to. Empty means every topic.
    #[serde(default)]
    pub topics: Vec<String>,
}

impl StaticPeer {
    pub fn endpoint_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.endpoint
            .parse()
            .map_err(|_| ConfigError::InvalidAddress {
                field: "discovery.static_peers.endpoint",
                value: self.endpoint.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.discovery.mode, DiscoveryMode::Multicast);
        assert_eq!(config.discovery.heartbeat_ms, 1_000);
        assert_eq!(config.discovery.liveness_timeout_ms, 5_000);
        assert!(config.node.queue_high_water.is_none());
        assert!(!config.node.strict_topics);
    }

    #[test]
    fn test_config_for_test_uses_static_discovery() {
        let config = Config::for_test();
        assert_eq!(config.discovery.mode, DiscoveryMode::Static);
        assert!(config.discovery.static_peers.is_empty());
    }

    #[test]
    fn test_listen_addr_parses() {
        let transport = TransportConfig::default();
        let addr = transport.listen_addr().unwrap();
        assert_eq!(addr.port(), 0);
    }

    #[test]
    fn test_invalid_listen_addr_rejected() {
        let transport = TransportConfig {
            listen: "not-an-address".to_string(),
            ..TransportConfig::default()
        };
        assert!(matches!(
            transport.listen_addr(),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_group_addr_combines_group_and_port() {
        let discovery = DiscoveryConfig::default();
        let addr = discovery.group_addr().unwrap();
        assert_eq!(addr.port(), 7070);
        assert!(addr.ip().is_multicast());
    }
}
