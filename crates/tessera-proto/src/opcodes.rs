//! Operation codes for Tessera frames.
//!
//! # Opcode Ranges
//!
//! - `0x0000-0x000F`: Connection lifecycle (negotiation, keep-alive, shutdown)
//! - `0x0010-0x00FE`: Cluster control (broker lists, broker identity)
//! - `0x00FF`: Error
//! - `0x0100-0x01FF`: Application traffic

use serde_repr::{Deserialize_repr, Serialize_repr};

/// Frame operation codes
///
/// Opcodes are serialized as Big Endian `u16` values in the frame header.
/// Unknown values are rejected with
/// [`ProtocolError::InvalidOpcode`](crate::ProtocolError::InvalidOpcode)
/// by the payload decoder; they never fall through to a default handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u16)]
pub enum Opcode {
    /// Preferred wire-format capabilities, first frame on every connection
    WireFormatInfo = 0x0001,
    /// Keep-alive marker, zero-length payload
    KeepAlive = 0x0002,
    /// Graceful close
    Shutdown = 0x0003,

    /// Broker-URI list update pushed to clients
    ConnectionControl = 0x0010,
    /// Broker identity and known peers
    BrokerInfo = 0x0020,

    /// Error frame
    Error = 0x00FF,

    /// Application message
    Message = 0x0100,
}

impl Opcode {
    /// Convert to raw u16 value
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Convert from raw u16 value
    ///
    /// Returns `None` if the value doesn't correspond to a known opcode.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::WireFormatInfo),
            0x0002 => Some(Self::KeepAlive),
            0x0003 => Some(Self::Shutdown),
            0x0010 => Some(Self::ConnectionControl),
            0x0020 => Some(Self::BrokerInfo),
            0x00FF => Some(Self::Error),
            0x0100 => Some(Self::Message),
            _ => None,
        }
    }

    /// True for frames that only exist to keep a connection alive or manage
    /// its lifecycle, as opposed to cluster control or application traffic.
    #[must_use]
    pub const fn is_lifecycle(self) -> bool {
        matches!(self, Self::WireFormatInfo | Self::KeepAlive | Self::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const ALL: [Opcode; 7] = [
        Opcode::WireFormatInfo,
        Opcode::KeepAlive,
        Opcode::Shutdown,
        Opcode::ConnectionControl,
        Opcode::BrokerInfo,
        Opcode::Error,
        Opcode::Message,
    ];

    #[test]
    fn known_opcodes_convert_both_ways() {
        for opcode in ALL {
            assert_eq!(Opcode::from_u16(opcode.to_u16()), Some(opcode));
        }
    }

    #[test]
    fn lifecycle_opcodes() {
        assert!(Opcode::KeepAlive.is_lifecycle());
        assert!(Opcode::WireFormatInfo.is_lifecycle());
        assert!(!Opcode::Message.is_lifecycle());
        assert!(!Opcode::ConnectionControl.is_lifecycle());
    }

    proptest! {
        #[test]
        fn from_u16_never_invents_opcodes(value in any::<u16>()) {
            if let Some(opcode) = Opcode::from_u16(value) {
                prop_assert_eq!(opcode.to_u16(), value);
            } else {
                prop_assert!(ALL.iter().all(|op| op.to_u16() != value));
            }
        }
    }
}
