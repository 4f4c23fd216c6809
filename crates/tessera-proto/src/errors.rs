//! Error types for the Tessera wire format.

use thiserror::Error;

/// Why a frame or payload was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer bytes than a header
    #[error("frame too short: {actual} bytes, header needs {expected}")]
    FrameTooShort {
        /// Header size
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Not a Tessera frame
    #[error("invalid magic number: expected 0x54535241 (\"TSRA\")")]
    InvalidMagic,

    /// Header layout version this build does not read
    #[error("unsupported frame version: {0}")]
    UnsupportedVersion(u8),

    /// Declared or actual payload above the 16 MiB cap
    #[error("payload of {size} bytes exceeds the {max} byte cap")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Cap
        max: usize,
    },

    /// Header declares more payload than the buffer holds
    #[error("frame truncated: {actual} of {expected} payload bytes present")]
    FrameTruncated {
        /// Declared payload size
        expected: usize,
        /// Payload bytes present
        actual: usize,
    },

    /// Payload struct could not be serialized
    #[error("cannot encode payload: {0}")]
    CborEncode(String),

    /// Payload bytes do not match the opcode's struct
    #[error("cannot decode payload: {0}")]
    CborDecode(String),

    /// Opcode outside the known set
    #[error("unknown opcode {0:#06x}")]
    InvalidOpcode(u16),

    /// Zero-length frame carried a payload
    #[error("opcode {opcode:#06x} carries no payload, got {size} bytes")]
    UnexpectedPayload {
        /// Opcode of the frame
        opcode: u16,
        /// Number of payload bytes received
        size: usize,
    },
}

/// Result alias for framing and payload codecs
pub type Result<T> = std::result::Result<T, ProtocolError>;
