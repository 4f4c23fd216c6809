//! Broker configuration.
//!
//! The TOML file is deserialized into [`BrokerConfigFile`] and validated
//! into a [`BrokerConfig`] through `TryFrom`. Every URI and filter is
//! parsed there, so a broker with a bad configuration never starts.
//!
//! ```toml
//! name = "broker-a"
//! negotiation_timeout_ms = 15000
//! inactivity_safety_factor = 1.0
//!
//! [wire_format]
//! max_inactivity_ms = 30000
//!
//! [[connectors]]
//! name = "openwire"
//! uri = "tcp://broker-a:61616"
//! rebalance_clients = true
//! update_clients = true
//! update_clients_on_remove = true
//!
//! [[bridges]]
//! name = "a-to-b"
//! uri = "tcp://broker-b:61616"
//! duplex = true
//! destination_filter = "orders.>"
//! ```

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tessera_core::{
    backoff::BackoffPolicy,
    bridge::BridgeConfig,
    connection::{ConnectionConfig, DEFAULT_NEGOTIATION_TIMEOUT},
    connector::ConnectorConfig,
    destination::{DestinationFilter, FilterError},
    inactivity::{MAX_SAFETY_FACTOR, MIN_SAFETY_FACTOR},
    uri::{BrokerUri, UriError},
    wire_format::WireFormatCapabilities,
};
use thiserror::Error;

/// Configuration errors, all detected before the broker starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A URI does not parse or carries invalid options
    #[error("{field}: {source}")]
    Uri {
        /// Where the URI came from
        field: String,
        /// Parse error
        source: UriError,
    },

    /// A destination filter does not parse
    #[error("bridge {bridge}: invalid destination filter: {source}")]
    Filter {
        /// Bridge name
        bridge: String,
        /// Parse error
        source: FilterError,
    },

    /// Any other rule violation
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// On-disk configuration, as written by operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfigFile {
    /// Broker name, unique within the cluster
    pub name: String,
    /// Negotiation window in milliseconds
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,
    /// Read deadline multiplier, 1.0 to 1.5
    #[serde(default = "default_safety_factor")]
    pub inactivity_safety_factor: f64,
    /// Preferred wire format
    #[serde(default)]
    pub wire_format: WireFormatSection,
    /// Client listeners
    #[serde(default)]
    pub connectors: Vec<ConnectorSection>,
    /// Outbound bridges
    #[serde(default)]
    pub bridges: Vec<BridgeSection>,
}

/// `[wire_format]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WireFormatSection {
    /// Highest protocol version offered
    pub version: u32,
    /// Include stack traces in error responses
    pub stack_trace_enabled: bool,
    /// Disable Nagle
    pub tcp_no_delay_enabled: bool,
    /// Marshaling cache
    pub cache_enabled: bool,
    /// Variable-length encoding
    pub tight_encoding_enabled: bool,
    /// Omit size prefixes
    pub size_prefix_disabled: bool,
    /// Max inactivity in milliseconds, 0 disables monitoring
    pub max_inactivity_ms: u64,
}

impl Default for WireFormatSection {
    fn default() -> Self {
        let defaults = WireFormatCapabilities::default();
        Self {
            version: defaults.version,
            stack_trace_enabled: defaults.stack_trace_enabled,
            tcp_no_delay_enabled: defaults.tcp_no_delay_enabled,
            cache_enabled: defaults.cache_enabled,
            tight_encoding_enabled: defaults.tight_encoding_enabled,
            size_prefix_disabled: defaults.size_prefix_disabled,
            max_inactivity_ms: u64::try_from(defaults.max_inactivity.as_millis())
                .unwrap_or(u64::MAX),
        }
    }
}

impl From<&WireFormatSection> for WireFormatCapabilities {
    fn from(section: &WireFormatSection) -> Self {
        Self {
            version: section.version,
            stack_trace_enabled: section.stack_trace_enabled,
            tcp_no_delay_enabled: section.tcp_no_delay_enabled,
            cache_enabled: section.cache_enabled,
            tight_encoding_enabled: section.tight_encoding_enabled,
            size_prefix_disabled: section.size_prefix_disabled,
            max_inactivity: Duration::from_millis(section.max_inactivity_ms),
        }
    }
}

/// `[[connectors]]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorSection {
    /// Connector name
    pub name: String,
    /// Listen URI, also advertised to clients
    pub uri: String,
    /// Send migrate directives when membership changes
    #[serde(default)]
    pub rebalance_clients: bool,
    /// Push the broker list when members join
    #[serde(default)]
    pub update_clients: bool,
    /// Push the broker list when members leave
    #[serde(default)]
    pub update_clients_on_remove: bool,
}

/// `[[bridges]]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeSection {
    /// Bridge name
    pub name: String,
    /// Remote broker URI
    pub uri: String,
    /// Carry both directions
    #[serde(default = "default_true")]
    pub duplex: bool,
    /// Only forward matching destinations
    #[serde(default)]
    pub destination_filter: Option<String>,
    /// First reconnect delay in milliseconds
    #[serde(default = "default_bridge_initial_ms")]
    pub initial_reconnect_delay_ms: u64,
    /// Reconnect delay cap in milliseconds
    #[serde(default = "default_bridge_max_ms")]
    pub max_reconnect_delay_ms: u64,
    /// Bound on one connect in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_negotiation_timeout_ms() -> u64 {
    u64::try_from(DEFAULT_NEGOTIATION_TIMEOUT.as_millis()).unwrap_or(u64::MAX)
}

fn default_safety_factor() -> f64 {
    MIN_SAFETY_FACTOR
}

fn default_true() -> bool {
    true
}

fn default_bridge_initial_ms() -> u64 {
    1_000
}

fn default_bridge_max_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

/// Validated broker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    /// Broker name
    pub name: String,
    /// Client listeners
    pub connectors: Vec<ConnectorConfig>,
    /// Outbound bridges
    pub bridges: Vec<BridgeConfig>,
}

impl BrokerConfig {
    /// Broker with no connectors or bridges.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), connectors: Vec::new(), bridges: Vec::new() }
    }

    /// Add a connector.
    #[must_use]
    pub fn with_connector(mut self, connector: ConnectorConfig) -> Self {
        self.connectors.push(connector);
        self
    }

    /// Add a bridge.
    #[must_use]
    pub fn with_bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridges.push(bridge);
        self
    }

    /// Parse and validate TOML text.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for syntax errors and every validation rule.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let file: BrokerConfigFile = toml::from_str(text)?;
        Self::try_from(file)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Read` if the file cannot be read, otherwise as
    /// [`from_toml`](Self::from_toml).
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml(&text)
    }

    /// Check cross-field rules on an already resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for an empty broker name, duplicate
    /// connector or bridge names, or invalid connector URI options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("broker name must not be empty".into()));
        }

        let mut names = BTreeSet::new();
        for connector in &self.connectors {
            if !names.insert(connector.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate connector name {:?}",
                    connector.name
                )));
            }
            connector.connection.wire_format.apply_options(connector.uri.options()).map_err(
                |source| ConfigError::Uri { field: format!("connector {}", connector.name), source },
            )?;
        }

        let mut names = BTreeSet::new();
        for bridge in &self.bridges {
            if !names.insert(bridge.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate bridge name {:?}", bridge.name)));
            }
        }
        Ok(())
    }
}

impl TryFrom<BrokerConfigFile> for BrokerConfig {
    type Error = ConfigError;

    fn try_from(file: BrokerConfigFile) -> Result<Self, Self::Error> {
        if !(MIN_SAFETY_FACTOR..=MAX_SAFETY_FACTOR).contains(&file.inactivity_safety_factor) {
            return Err(ConfigError::Invalid(format!(
                "inactivity_safety_factor {} outside {MIN_SAFETY_FACTOR}..={MAX_SAFETY_FACTOR}",
                file.inactivity_safety_factor
            )));
        }
        if file.negotiation_timeout_ms == 0 {
            return Err(ConfigError::Invalid("negotiation_timeout_ms must be positive".into()));
        }
        if file.wire_format.version == 0 {
            return Err(ConfigError::Invalid("wire_format.version must be at least 1".into()));
        }

        let connection = ConnectionConfig {
            wire_format: WireFormatCapabilities::from(&file.wire_format),
            negotiation_timeout: Duration::from_millis(file.negotiation_timeout_ms),
            inactivity_safety_factor: file.inactivity_safety_factor,
        };

        let connectors = file
            .connectors
            .into_iter()
            .map(|section| {
                let uri = BrokerUri::parse(&section.uri).map_err(|source| ConfigError::Uri {
                    field: format!("connector {}", section.name),
                    source,
                })?;
                Ok(ConnectorConfig {
                    name: section.name,
                    uri,
                    rebalance_clients: section.rebalance_clients,
                    update_clients: section.update_clients,
                    update_clients_on_remove: section.update_clients_on_remove,
                    connection: connection.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let bridges = file
            .bridges
            .into_iter()
            .map(|section| {
                let remote = BrokerUri::parse(&section.uri).map_err(|source| ConfigError::Uri {
                    field: format!("bridge {}", section.name),
                    source,
                })?;
                let destination_filter = section
                    .destination_filter
                    .as_deref()
                    .map(DestinationFilter::parse)
                    .transpose()
                    .map_err(|source| ConfigError::Filter { bridge: section.name.clone(), source })?;
                if section.initial_reconnect_delay_ms > section.max_reconnect_delay_ms {
                    return Err(ConfigError::Invalid(format!(
                        "bridge {}: initial_reconnect_delay_ms exceeds max_reconnect_delay_ms",
                        section.name
                    )));
                }

                let mut bridge = BridgeConfig::new(section.name, remote);
                bridge.duplex = section.duplex;
                bridge.destination_filter = destination_filter;
                bridge.backoff = BackoffPolicy::new(
                    Duration::from_millis(section.initial_reconnect_delay_ms),
                    Duration::from_millis(section.max_reconnect_delay_ms),
                );
                bridge.connect_timeout = Duration::from_millis(section.connect_timeout_ms);
                bridge.connection = connection.clone();
                Ok(bridge)
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let config = Self { name: file.name, connectors, bridges };
        config.validate()?;
        Ok(config)
    }
}
