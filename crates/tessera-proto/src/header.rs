//! Fixed-size frame header.
//!
//! The `FrameHeader` is a fixed 24-byte structure serialized as raw binary
//! (Big Endian). The framing layer reads exactly this many bytes, learns the
//! opcode and payload size, and only then reads the payload.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    FrameFlags, Opcode,
    errors::{ProtocolError, Result},
};

/// Fixed 24-byte frame header (Big Endian network byte order)
///
/// Fields are stored as raw byte arrays to avoid alignment issues with
/// `#[repr(C, packed)]`. Every 24-byte pattern is a valid value, so casting
/// untrusted network bytes cannot produce undefined behavior; semantic
/// validation happens in [`FrameHeader::from_bytes`].
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    // bytes 0-7: identification and dispatch
    magic: [u8; 4],             // 0x54535241 ("TSRA" in ASCII)
    version: u8,                // 0x01
    flags: u8,                  // FrameFlags bitfield
    pub(crate) opcode: [u8; 2], // u16 operation code

    // bytes 8-15: payload length, command counter
    pub(crate) payload_size: [u8; 4], // u32 payload length
    command_id: [u8; 4],              // u32 per-connection command counter

    // bytes 16-23: correlation
    correlation_id: [u8; 8], // u64 request/response correlation
}

impl FrameHeader {
    /// Size of the serialized header (24 bytes)
    pub const SIZE: usize = 24;

    /// Magic number: "TSRA" in ASCII (0x54535241)
    pub const MAGIC: u32 = 0x5453_5241;

    /// Current frame format version
    ///
    /// Distinct from the negotiated wire-format version: this one only
    /// changes if the header layout itself changes.
    pub const VERSION: u8 = 0x01;

    /// Payload cap, 16 MiB
    pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

    /// Header for `opcode` with zero flags, size and ids.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self {
            magic: Self::MAGIC.to_be_bytes(),
            version: Self::VERSION,
            flags: 0,
            opcode: opcode.to_u16().to_be_bytes(),
            payload_size: [0; 4],
            command_id: [0; 4],
            correlation_id: [0; 8],
        }
    }

    /// Borrow a header from the front of `bytes` without copying.
    ///
    /// # Errors
    ///
    /// - `FrameTooShort` below 24 bytes
    /// - `InvalidMagic` for foreign traffic
    /// - `UnsupportedVersion` for another header layout
    /// - `PayloadTooLarge` above [`Self::MAX_PAYLOAD_SIZE`]
    ///
    /// Cheapest checks run first so garbage input fails fast.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if u32::from_be_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        let payload_size = u32::from_be_bytes(header.payload_size);
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Wire bytes of the header
    #[must_use]
    #[allow(clippy::wrong_self_convention)]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(IntoBytes::as_bytes(self));
        out
    }

    /// Get the magic number
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_be_bytes(self.magic)
    }

    /// Get the frame format version
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Get the frame flags
    #[must_use]
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_byte(self.flags)
    }

    /// Replace the frame flags
    pub fn set_flags(&mut self, flags: FrameFlags) {
        self.flags = flags.to_byte();
    }

    /// Get the opcode
    #[must_use]
    pub fn opcode(&self) -> u16 {
        u16::from_be_bytes(self.opcode)
    }

    /// Known opcode, or `None`
    #[must_use]
    pub fn opcode_enum(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode())
    }

    /// Get the payload size
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_be_bytes(self.payload_size)
    }

    /// Get the command id
    #[must_use]
    pub fn command_id(&self) -> u32 {
        u32::from_be_bytes(self.command_id)
    }

    /// Set the command id
    pub fn set_command_id(&mut self, command_id: u32) {
        self.command_id = command_id.to_be_bytes();
    }

    /// Get the correlation id
    #[must_use]
    pub fn correlation_id(&self) -> u64 {
        u64::from_be_bytes(self.correlation_id)
    }

    /// Set the correlation id
    pub fn set_correlation_id(&mut self, correlation_id: u64) {
        self.correlation_id = correlation_id.to_be_bytes();
    }
}

// packed fields cannot be borrowed by derived impls
impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHeader")
            .field("magic", &format!("{:#010x}", self.magic()))
            .field("version", &self.version())
            .field("flags", &self.flags())
            .field("opcode", &format!("{:#06x}", self.opcode()))
            .field("payload_size", &self.payload_size())
            .field("command_id", &self.command_id())
            .field("correlation_id", &self.correlation_id())
            .finish()
    }
}

impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FrameHeader {}
