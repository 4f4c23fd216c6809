//! Header plus opaque payload bytes.
//!
//! Typed payloads convert through [`Payload::to_frame`](crate::Payload::to_frame)
//! and [`Payload::from_frame`](crate::Payload::from_frame).

use bytes::{BufMut, Bytes};

use crate::{
    FrameHeader, Opcode,
    errors::{ProtocolError, Result},
};

/// One unit on the wire: `[header: 24 bytes][payload]`.
///
/// The header's size field always equals `payload.len()`; [`Frame::new`]
/// sets it and [`Frame::decode`] reads exactly that many bytes. Payloads
/// above [`FrameHeader::MAX_PAYLOAD_SIZE`] are refused by [`Frame::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,

    /// Encoded payload; empty for keep-alives
    pub payload: Bytes,
}

impl Frame {
    /// Frame carrying `payload`, with the header size field filled in
    ///
    /// Oversized payloads are not rejected here; [`Frame::encode`] is the
    /// enforcement point.
    #[must_use]
    pub fn new(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();

        #[allow(clippy::cast_possible_truncation)]
        {
            header.payload_size = (payload.len() as u32).to_be_bytes();
        }

        Self { header, payload }
    }

    /// Zero-payload keep-alive frame.
    #[must_use]
    pub fn keep_alive() -> Self {
        Self::new(FrameHeader::new(Opcode::KeepAlive), Bytes::new())
    }

    /// True if this is a keep-alive marker.
    #[must_use]
    pub fn is_keep_alive(&self) -> bool {
        self.header.opcode_enum() == Some(Opcode::KeepAlive)
    }

    /// Total encoded length (header plus payload).
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FrameHeader::SIZE + self.payload.len()
    }

    /// Encode frame into buffer
    ///
    /// Writes: `[header (24 bytes)] + [payload (variable)]`
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] if payload exceeds
    /// [`FrameHeader::MAX_PAYLOAD_SIZE`] (16 MB).
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.payload.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Parse one frame from the start of `bytes`
    ///
    /// Returns a Frame with raw bytes (does NOT deserialize the payload).
    /// Trailing bytes after the declared payload are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - any header error from [`FrameHeader::from_bytes`]
    /// - `FrameTruncated` when fewer payload bytes follow than declared
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(bytes)?;

        let payload_size = header.payload_size() as usize;
        let total_size = FrameHeader::SIZE + payload_size;

        if bytes.len() < total_size {
            return Err(ProtocolError::FrameTruncated {
                expected: payload_size,
                actual: bytes.len().saturating_sub(FrameHeader::SIZE),
            });
        }

        let payload = Bytes::copy_from_slice(&bytes[FrameHeader::SIZE..total_size]);

        Ok(Self { header: *header, payload })
    }
}
