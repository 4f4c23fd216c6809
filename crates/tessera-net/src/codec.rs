//! Frame reader and writer over async byte streams.
//!
//! A frame is read in two steps: the fixed header, validated before any
//! payload memory is allocated, then exactly `payload_size` bytes. A clean
//! end of stream on a frame boundary is `Ok(None)`; anything else short is
//! an error.

use std::io;

use bytes::BytesMut;
use tessera_core::TransportError;
use tessera_proto::{Frame, FrameHeader};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read the next frame.
///
/// Returns `Ok(None)` when the peer closed the stream between frames.
///
/// # Errors
///
/// - `TransportError::Protocol` if the header is invalid (bad magic,
///   version, or oversized payload)
/// - `TransportError::Socket` if the stream fails or ends mid-frame
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header_buf = [0u8; FrameHeader::SIZE];
    let mut filled = 0;
    while filled < FrameHeader::SIZE {
        match reader.read(&mut header_buf[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {filled} of {} header bytes", FrameHeader::SIZE),
                )
                .into());
            },
            n => filled += n,
        }
    }

    let header = *FrameHeader::from_bytes(&header_buf)?;

    let mut payload = BytesMut::zeroed(header.payload_size() as usize);
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame::new(header, payload.freeze())))
}

/// Write one frame and flush.
///
/// # Errors
///
/// - `TransportError::Protocol` if the payload exceeds the frame limit
/// - `TransportError::Socket` if the write fails
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    frame.encode(&mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
