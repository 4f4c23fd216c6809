//! Negotiation frame payload.

use serde::{Deserialize, Serialize};

/// A peer's preferred wire-format parameters.
///
/// Sent by both sides immediately on connect, before any other frame.
/// Only field semantics live here; deciding the agreed values is the job of
/// the negotiator in `tessera-core`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFormatInfo {
    /// Highest protocol version the sender speaks
    pub version: u32,
    /// Include stack traces in error responses
    pub stack_trace_enabled: bool,
    /// Marshaling cache enabled
    pub cache_enabled: bool,
    /// Disable Nagle on the socket
    pub tcp_no_delay_enabled: bool,
    /// Variable-length (tight) encoding
    pub tight_encoding_enabled: bool,
    /// Omit the size prefix on marshaled commands
    pub size_prefix_disabled: bool,
    /// Max inactivity in milliseconds, `0` disables monitoring
    pub max_inactivity_duration: u64,
}
