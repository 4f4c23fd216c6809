//! Frame flags.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Frame feature flags (8 bits)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct FrameFlags: u8 {
        /// Forwarded by a network bridge rather than produced by a local client
        const BRIDGED = 0b0000_0001;

        /// Sender expects a reply frame carrying the same correlation id
        const RESPONSE_REQUIRED = 0b0000_0010;
    }
}

impl FrameFlags {
    /// Create flags from raw byte value
    ///
    /// Infallible: unknown bits are retained but never checked, so a newer
    /// peer can define flags an older one simply ignores.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self::from_bits_retain(byte)
    }

    /// Convert to raw byte value
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self.bits()
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::empty()
    }
}
