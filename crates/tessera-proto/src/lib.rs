//! # Tessera Protocol: Wire Format
//!
//! Binary framing for the Tessera broker transport.
//!
//! ## Protocol Design
//!
//! Every frame is a fixed header followed by a payload:
//! - **FrameHeader**: 24 bytes of raw binary (Big Endian), parsed zero-copy
//! - **Payload**: Variable-length CBOR-encoded structured data
//!
//! The header carries the opcode, so the framing layer can recognise
//! keep-alive and negotiation frames without touching the payload.
//!
//! ## Implementation Notes
//!
//! - **Zero-Copy Parsing**: [`zerocopy`](https://docs.rs/zerocopy) casts
//!   network bytes directly to [`FrameHeader`] references.
//!
//! - **CBOR for Payloads**: Payloads use CBOR so optional fields can be added
//!   without another round of wire-format negotiation.
//!
//! - **Size Limits**: The protocol enforces a 16 MB maximum payload size.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod flags;
pub mod frame;
pub mod header;
pub mod opcodes;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use flags::FrameFlags;
pub use frame::Frame;
pub use header::FrameHeader;
pub use opcodes::Opcode;
pub use payloads::Payload;
