//! Stream framing for the Server-Manager link.
//!
//! TCP is a stream protocol: one `read()` may return part of a frame or
//! several frames at once.  [`FrameReader`] keeps an accumulation buffer and
//! drains complete frames from it with [`gsm_core::decode_frame`].
//!
//! The buffer lives in the reader rather than on the stack of
//! `next_frame`, so dropping a pending `next_frame()` future (for example
//! when a read timeout fires inside `tokio::select!`) loses no bytes.

use gsm_core::{decode_frame, Frame, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 4096;

/// Errors raised while pulling frames off a stream.
#[derive(Debug, Error)]
pub enum FrameReadError {
    /// The peer closed the stream, possibly in the middle of a frame.
    #[error("connection closed by peer ({buffered} bytes of a partial frame pending)")]
    ConnectionClosed { buffered: usize },

    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The bytes on the wire cannot be a frame.
    #[error("frame decode error: {0}")]
    Decode(#[from] ProtocolError),
}

/// Buffered, cancel-safe frame reader.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    scratch: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame.
    ///
    /// # Errors
    ///
    /// - [`FrameReadError::ConnectionClosed`] on EOF, including EOF after only
    ///   one byte of the two-byte length prefix.
    /// - [`FrameReadError::Decode`] if the length prefix is too small to hold
    ///   a command code.
    /// - [`FrameReadError::Io`] for socket errors.
    pub async fn next_frame(&mut self) -> Result<Frame, FrameReadError> {
        loop {
            match decode_frame(&self.buf) {
                Ok((frame, consumed)) => {
                    self.buf.drain(..consumed);
                    return Ok(frame);
                }
                Err(ProtocolError::InsufficientData { .. }) => {}
                Err(e) => return Err(FrameReadError::Decode(e)),
            }

            let n = self.inner.read(&mut self.scratch).await?;
            if n == 0 {
                return Err(FrameReadError::ConnectionClosed {
                    buffered: self.buf.len(),
                });
            }
            self.buf.extend_from_slice(&self.scratch[..n]);
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes one pre-encoded frame and flushes it.
///
/// # Errors
///
/// Propagates the underlying write error.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsm_core::protocol::messages::CommandCode;
    use gsm_core::{encode_message, ServerManagerMessage};
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_single_length_byte_then_eof_is_connection_closed() {
        // Arrange: half of the length prefix, then the peer goes away
        let mock = Builder::new().read(&[0x02]).build();
        let mut reader = FrameReader::new(mock);

        // Act
        let result = reader.next_frame().await;

        // Assert
        assert!(
            matches!(result, Err(FrameReadError::ConnectionClosed { buffered: 1 })),
            "got {result:?}"
        );
    }

    #[tokio::test]
    async fn test_eof_mid_body_is_connection_closed() {
        let mock = Builder::new().read(&[0x06, 0x00, 0x00, 0x2A, 0x01]).build();
        let mut reader = FrameReader::new(mock);

        let result = reader.next_frame().await;

        assert!(matches!(result, Err(FrameReadError::ConnectionClosed { buffered: 5 })));
    }

    #[tokio::test]
    async fn test_clean_eof_between_frames_is_connection_closed() {
        let mock = Builder::new().build();
        let mut reader = FrameReader::new(mock);

        let result = reader.next_frame().await;

        assert!(matches!(result, Err(FrameReadError::ConnectionClosed { buffered: 0 })));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads_is_reassembled() {
        // Arrange: a 2-byte payload frame delivered in three pieces
        let mock = Builder::new()
            .read(&[0x04])
            .read(&[0x00, 0x00, 0x17])
            .read(&[0xAA, 0xBB])
            .build();
        let mut reader = FrameReader::new(mock);

        // Act
        let frame = reader.next_frame().await.unwrap();

        // Assert
        assert_eq!(frame.command, CommandCode::HandshakeAccepted as u16);
        assert_eq!(frame.payload, vec![0xAA, 0xBB]);
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_coalesced_frames_are_returned_one_at_a_time() {
        // Arrange
        let mut bytes = encode_message(&ServerManagerMessage::Ping).unwrap();
        bytes.extend(encode_message(&ServerManagerMessage::ShutdownNotice).unwrap());
        let mock = Builder::new().read(&bytes).build();
        let mut reader = FrameReader::new(mock);

        // Act
        let first = reader.next_frame().await.unwrap();
        let second = reader.next_frame().await.unwrap();

        // Assert
        assert_eq!(first.command, CommandCode::Ping as u16);
        assert_eq!(second.command, CommandCode::ShutdownNotice as u16);
    }

    #[tokio::test]
    async fn test_length_below_command_size_is_decode_error() {
        let mock = Builder::new().read(&[0x01, 0x00, 0xFF]).build();
        let mut reader = FrameReader::new(mock);

        let result = reader.next_frame().await;

        assert!(matches!(result, Err(FrameReadError::Decode(_))));
    }

    #[tokio::test]
    async fn test_write_frame_writes_exact_bytes() {
        let bytes = encode_message(&ServerManagerMessage::Termination).unwrap();
        let mut mock = Builder::new().write(&[0x02, 0x00, 0x03, 0x00]).build();

        write_frame(&mut mock, &bytes).await.unwrap();
    }
}
