//! Broker and failover URI parsing.
//!
//! ```text
//! tcp://broker-a:61616?wireFormat.maxInactivityDuration=0
//! failover:(tcp://broker-a:61616,tcp://broker-b:61616)?randomize=false
//! ```
//!
//! A URI that does not parse is a configuration error and is reported at
//! startup, never retried.

use std::{collections::BTreeMap, fmt, str::FromStr};

use thiserror::Error;

/// URI parsing and option errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    /// Empty input or empty candidate list
    #[error("empty uri")]
    Empty,

    /// No `scheme://`
    #[error("missing scheme in {0:?}")]
    MissingScheme(String),

    /// No `:port` after the host
    #[error("missing port in {0:?}")]
    MissingPort(String),

    /// Port is not a u16
    #[error("invalid port {port:?} in {uri:?}")]
    InvalidPort {
        /// Offending uri
        uri: String,
        /// Port text
        port: String,
    },

    /// Host part is empty
    #[error("missing host in {0:?}")]
    MissingHost(String),

    /// Unbalanced parentheses or stray characters
    #[error("malformed uri {0:?}")]
    Malformed(String),

    /// Option key not recognised by the layer that consumes it
    #[error("unknown option {0:?}")]
    UnknownOption(String),

    /// Option value does not parse
    #[error("invalid value {value:?} for option {key:?}")]
    InvalidOption {
        /// Option key
        key: String,
        /// Option value
        value: String,
    },
}

/// A single broker endpoint: `scheme://host:port?key=value&...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrokerUri {
    scheme: String,
    host: String,
    port: u16,
    options: BTreeMap<String, String>,
}

impl BrokerUri {
    /// Build a URI without options.
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self { scheme: scheme.into(), host: host.into(), port, options: BTreeMap::new() }
    }

    /// Parse `scheme://host:port[?query]`.
    ///
    /// # Errors
    ///
    /// Returns a [`UriError`] describing the first problem found.
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(UriError::Empty);
        }

        let (scheme, rest) =
            input.split_once("://").ok_or_else(|| UriError::MissingScheme(input.to_string()))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
            return Err(UriError::MissingScheme(input.to_string()));
        }

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };
        let authority = authority.trim_end_matches('/');

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) =
                bracketed.split_once(']').ok_or_else(|| UriError::Malformed(input.to_string()))?;
            let port =
                after.strip_prefix(':').ok_or_else(|| UriError::MissingPort(input.to_string()))?;
            (host, port)
        } else {
            authority.rsplit_once(':').ok_or_else(|| UriError::MissingPort(input.to_string()))?
        };

        if host.is_empty() {
            return Err(UriError::MissingHost(input.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| UriError::InvalidPort { uri: input.to_string(), port: port.to_string() })?;

        let options = match query {
            Some(query) => parse_query(query)?,
            None => BTreeMap::new(),
        };

        Ok(Self { scheme: scheme.to_ascii_lowercase(), host: host.to_string(), port, options })
    }

    /// URI scheme, lower case.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for socket connect calls.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Query options.
    #[must_use]
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// Same URI with the port replaced, e.g. after binding port 0.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `scheme://host:port` with options dropped.
    ///
    /// Two URIs naming the same endpoint compare equal here even if their
    /// options differ.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}://{}", self.scheme, self.authority())
    }

    /// True if both URIs name the same endpoint.
    #[must_use]
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.scheme == other.scheme && self.host == other.host && self.port == other.port
    }
}

impl fmt::Display for BrokerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint())?;
        let mut separator = '?';
        for (key, value) in &self.options {
            write!(f, "{separator}{key}={value}")?;
            separator = '&';
        }
        Ok(())
    }
}

impl FromStr for BrokerUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_query(query: &str) -> Result<BTreeMap<String, String>, UriError> {
    let mut options = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| UriError::InvalidOption {
            key: pair.to_string(),
            value: String::new(),
        })?;
        options.insert(key.to_string(), value.to_string());
    }
    Ok(options)
}

/// A failover URI: candidate list plus failover options.
///
/// Accepted forms:
///
/// - `failover:(uri1,uri2)?options`
/// - `failover://(uri1,uri2)?options`
/// - `failover:uri1,uri2` (no failover options)
/// - `uri1,uri2` (plain list)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverUri {
    /// Candidate brokers in configured order
    pub uris: Vec<BrokerUri>,
    /// Failover-level options (outside the parentheses)
    pub options: BTreeMap<String, String>,
}

impl FailoverUri {
    /// Parse a failover URI.
    ///
    /// # Errors
    ///
    /// Returns a [`UriError`] for an empty list, unbalanced parentheses or
    /// any candidate that fails [`BrokerUri::parse`].
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let input = input.trim();
        let body = match input.strip_prefix("failover:") {
            Some(rest) => rest.strip_prefix("//").unwrap_or(rest),
            None => input,
        };

        let (list, options) = if let Some(inner) = body.strip_prefix('(') {
            let (list, after) =
                inner.rsplit_once(')').ok_or_else(|| UriError::Malformed(input.to_string()))?;
            let options = match after {
                "" => BTreeMap::new(),
                _ => {
                    let query = after
                        .strip_prefix('?')
                        .ok_or_else(|| UriError::Malformed(input.to_string()))?;
                    parse_query(query)?
                },
            };
            (list, options)
        } else {
            (body, BTreeMap::new())
        };

        let uris = list
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(BrokerUri::parse)
            .collect::<Result<Vec<_>, _>>()?;

        if uris.is_empty() {
            return Err(UriError::Empty);
        }

        Ok(Self { uris, options })
    }
}

impl FromStr for FailoverUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
