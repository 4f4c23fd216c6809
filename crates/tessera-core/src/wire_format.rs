//! Wire-format capability negotiation.
//!
//! Both peers send their preferred [`WireFormatInfo`] as the first frame on
//! a connection. Each side then computes the agreed capabilities locally
//! with [`negotiate`]:
//!
//! - version: the lower of the two advertised versions
//! - boolean features: enabled only if both sides enable them
//! - max inactivity: the lower of the two durations (`0` disables
//!   monitoring and therefore always wins)
//!
//! The rules are symmetric, so the responder's result always equals the
//! initiator's. The responder never has to send a corrected set back, and
//! an identical pair of preferred sets is accepted unchanged.

use std::{collections::BTreeMap, time::Duration};

use tessera_proto::payloads::wire_format::WireFormatInfo;

use crate::{error::TransportError, uri::UriError};

/// Lowest protocol version this implementation speaks.
pub const MIN_VERSION: u32 = 1;

/// Default max inactivity (30 s).
pub const DEFAULT_MAX_INACTIVITY: Duration = Duration::from_secs(30);

/// URI option prefix for wire-format settings.
pub const URI_OPTION_PREFIX: &str = "wireFormat.";

/// Negotiable wire-format parameters of one connection.
///
/// As a local template this is what a side *prefers*; after [`negotiate`]
/// it is what both sides *use*, and it never changes for the lifetime of
/// the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WireFormatCapabilities {
    /// Protocol version
    pub version: u32,
    /// Include stack traces in error responses
    pub stack_trace_enabled: bool,
    /// Disable Nagle on the socket
    pub tcp_no_delay_enabled: bool,
    /// Marshaling cache
    pub cache_enabled: bool,
    /// Variable-length encoding
    pub tight_encoding_enabled: bool,
    /// Omit size prefixes
    pub size_prefix_disabled: bool,
    /// Max inactivity; zero disables the inactivity monitor
    pub max_inactivity: Duration,
}

impl Default for WireFormatCapabilities {
    fn default() -> Self {
        Self {
            version: 1,
            stack_trace_enabled: true,
            tcp_no_delay_enabled: true,
            cache_enabled: true,
            tight_encoding_enabled: true,
            size_prefix_disabled: false,
            max_inactivity: DEFAULT_MAX_INACTIVITY,
        }
    }
}

impl WireFormatCapabilities {
    /// Template with a different max inactivity.
    #[must_use]
    pub fn with_max_inactivity(mut self, max_inactivity: Duration) -> Self {
        self.max_inactivity = max_inactivity;
        self
    }

    /// True unless max inactivity is zero.
    #[must_use]
    pub fn monitoring_enabled(&self) -> bool {
        !self.max_inactivity.is_zero()
    }

    /// Encode as the negotiation frame payload.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_info(&self) -> WireFormatInfo {
        WireFormatInfo {
            version: self.version,
            stack_trace_enabled: self.stack_trace_enabled,
            cache_enabled: self.cache_enabled,
            tcp_no_delay_enabled: self.tcp_no_delay_enabled,
            tight_encoding_enabled: self.tight_encoding_enabled,
            size_prefix_disabled: self.size_prefix_disabled,
            max_inactivity_duration: self.max_inactivity.as_millis() as u64,
        }
    }

    /// Decode from a peer's negotiation frame payload.
    #[must_use]
    pub fn from_info(info: &WireFormatInfo) -> Self {
        Self {
            version: info.version,
            stack_trace_enabled: info.stack_trace_enabled,
            tcp_no_delay_enabled: info.tcp_no_delay_enabled,
            cache_enabled: info.cache_enabled,
            tight_encoding_enabled: info.tight_encoding_enabled,
            size_prefix_disabled: info.size_prefix_disabled,
            max_inactivity: Duration::from_millis(info.max_inactivity_duration),
        }
    }

    /// Apply `wireFormat.*` URI options on top of this template.
    ///
    /// Options without the prefix are ignored; they belong to other layers.
    ///
    /// # Errors
    ///
    /// Returns [`UriError::UnknownOption`] for an unrecognised
    /// `wireFormat.*` key and [`UriError::InvalidOption`] for a value that
    /// does not parse.
    pub fn apply_options(mut self, options: &BTreeMap<String, String>) -> Result<Self, UriError> {
        for (key, value) in options {
            let Some(name) = key.strip_prefix(URI_OPTION_PREFIX) else {
                continue;
            };
            match name {
                "version" => self.version = parse_option(key, value)?,
                "stackTraceEnabled" => self.stack_trace_enabled = parse_option(key, value)?,
                "tcpNoDelayEnabled" => self.tcp_no_delay_enabled = parse_option(key, value)?,
                "cacheEnabled" => self.cache_enabled = parse_option(key, value)?,
                "tightEncodingEnabled" => self.tight_encoding_enabled = parse_option(key, value)?,
                "sizePrefixDisabled" => self.size_prefix_disabled = parse_option(key, value)?,
                "maxInactivityDuration" => {
                    self.max_inactivity = Duration::from_millis(parse_option(key, value)?);
                },
                _ => return Err(UriError::UnknownOption(key.clone())),
            }
        }
        Ok(self)
    }
}

fn parse_option<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, UriError> {
    value
        .parse()
        .map_err(|_| UriError::InvalidOption { key: key.to_string(), value: value.to_string() })
}

/// Compute the capabilities both sides will use.
///
/// # Errors
///
/// Returns [`TransportError::NegotiationMismatch`] if the peer advertises a
/// version below [`MIN_VERSION`].
pub fn negotiate(
    local: &WireFormatCapabilities,
    remote: &WireFormatInfo,
) -> Result<WireFormatCapabilities, TransportError> {
    if remote.version < MIN_VERSION {
        return Err(TransportError::NegotiationMismatch(format!(
            "peer advertised version {}, minimum supported is {MIN_VERSION}",
            remote.version
        )));
    }

    let remote = WireFormatCapabilities::from_info(remote);
    if remote == *local {
        return Ok(*local);
    }

    Ok(WireFormatCapabilities {
        version: local.version.min(remote.version),
        stack_trace_enabled: local.stack_trace_enabled && remote.stack_trace_enabled,
        tcp_no_delay_enabled: local.tcp_no_delay_enabled && remote.tcp_no_delay_enabled,
        cache_enabled: local.cache_enabled && remote.cache_enabled,
        tight_encoding_enabled: local.tight_encoding_enabled && remote.tight_encoding_enabled,
        size_prefix_disabled: local.size_prefix_disabled && remote.size_prefix_disabled,
        max_inactivity: local.max_inactivity.min(remote.max_inactivity),
    })
}
