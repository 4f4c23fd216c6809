//! CBOR-encoded frame payloads.
//!
//! Each opcode has a corresponding payload type. The payload type is implied
//! by the header's opcode, so only the inner struct is serialized; there is
//! no variant tag in the CBOR.

pub mod control;
pub mod message;
pub mod wire_format;

use bytes::BufMut;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    Frame, FrameHeader, Opcode,
    errors::{ProtocolError, Result},
};

/// All possible frame payloads
///
/// # Invariants
///
/// - **Opcode Uniqueness**: Each variant corresponds to exactly one
///   [`Opcode`], and every opcode has exactly one variant.
///
/// - **Exhaustive Matching**: `encode()`, `decode()` and `opcode()` match
///   exhaustively, so a new variant cannot be left unhandled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Preferred wire-format capabilities
    WireFormatInfo(wire_format::WireFormatInfo),
    /// Keep-alive marker (zero bytes)
    KeepAlive,
    /// Graceful close
    Shutdown(control::ShutdownInfo),
    /// Broker-URI list update
    ConnectionControl(control::ConnectionControl),
    /// Broker identity and known peers
    BrokerInfo(control::BrokerInfo),
    /// Application message
    Message(message::Message),
    /// Error response
    Error(ErrorPayload),
}

/// Error payload for error frames
///
/// Sent just before a peer closes a connection it cannot continue, so the
/// other side can log a reason instead of a bare socket error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code
    pub code: u16,
    /// Human-readable error message
    pub message: String,
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

impl Payload {
    /// Get the opcode for this payload variant
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::WireFormatInfo(_) => Opcode::WireFormatInfo,
            Self::KeepAlive => Opcode::KeepAlive,
            Self::Shutdown(_) => Opcode::Shutdown,
            Self::ConnectionControl(_) => Opcode::ConnectionControl,
            Self::BrokerInfo(_) => Opcode::BrokerInfo,
            Self::Message(_) => Opcode::Message,
            Self::Error(_) => Opcode::Error,
        }
    }

    /// Encode payload to buffer
    ///
    /// Serializes only the inner struct, NOT the variant tag. The size limit
    /// is enforced later by [`Frame::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::CborEncode`] if serialization fails.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::WireFormatInfo(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::KeepAlive => Ok(()),
            Self::Shutdown(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ConnectionControl(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::BrokerInfo(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Message(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Error(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Decode payload from bytes based on opcode
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `bytes.len() > MAX_PAYLOAD_SIZE` (16 MB)
    /// - a keep-alive carries payload bytes
    /// - CBOR deserialization fails
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        let payload = match opcode {
            Opcode::WireFormatInfo => Self::WireFormatInfo(from_cbor(bytes)?),
            Opcode::KeepAlive => {
                if !bytes.is_empty() {
                    return Err(ProtocolError::UnexpectedPayload {
                        opcode: opcode.to_u16(),
                        size: bytes.len(),
                    });
                }
                Self::KeepAlive
            },
            Opcode::Shutdown => Self::Shutdown(from_cbor(bytes)?),
            Opcode::ConnectionControl => Self::ConnectionControl(from_cbor(bytes)?),
            Opcode::BrokerInfo => Self::BrokerInfo(from_cbor(bytes)?),
            Opcode::Message => Self::Message(from_cbor(bytes)?),
            Opcode::Error => Self::Error(from_cbor(bytes)?),
        };

        Ok(payload)
    }

    /// Convert payload into a transport frame
    ///
    /// Encodes the payload, stamps the matching opcode into `header` and
    /// sets the payload size.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::CborEncode` if serialization fails
    pub fn into_frame(self, mut header: FrameHeader) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        header.opcode = self.opcode().to_u16().to_be_bytes();
        Ok(Frame::new(header, buf))
    }

    /// Convert payload into a frame with a fresh header.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::CborEncode` if serialization fails
    pub fn to_frame(self) -> Result<Frame> {
        let opcode = self.opcode();
        self.into_frame(FrameHeader::new(opcode))
    }

    /// Parse payload from a raw transport frame
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Opcode is unknown
    /// - CBOR deserialization fails
    /// - Payload exceeds maximum size
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame
            .header
            .opcode_enum()
            .ok_or(ProtocolError::InvalidOpcode(frame.header.opcode()))?;
        Self::decode(opcode, &frame.payload)
    }
}
