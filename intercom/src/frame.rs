//! Intercom2 wire framing (§4.A, §6): a length-prefixed binary message
//! format carried over a plain or TLS-wrapped TCP stream.
//!
//! ```text
//! senderId:      u32 (big-endian)
//! messageId:     u16 (big-endian)
//! correlationId: u64 (big-endian)
//! payloadLen:    u32 (big-endian)
//! payload:       [u8; payloadLen]
//! ```

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Frame header size in bytes: 4 (senderId) + 2 (messageId) + 8
/// (correlationId) + 4 (payloadLen).
const HEADER_LEN: usize = 4 + 2 + 8 + 4;

/// A safe default for the largest payload this process will accept.
/// Implementation-defined per §4.A; must be at least 1 MiB.
pub const DEFAULT_MAX_FRAME: u32 = 16 * 1024 * 1024;

/// One Intercom2 message, fully decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sender_id: u32,
    pub message_id: u16,
    /// Nonzero for requests; echoed on the corresponding reply. Zero is
    /// reserved for fire-and-forget / unsolicited messages (NOTIFY,
    /// HEARTBEAT).
    pub correlation_id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(
        sender_id: u32,
        message_id: u16,
        correlation_id: u64,
        payload: Bytes,
    ) -> Self {
        Self { sender_id, message_id, correlation_id, payload }
    }
}

/// Writes one frame to `writer`, returning once the full frame (header and
/// payload) has reached the OS. Does not flush; callers that need the
/// bytes to leave the process immediately should flush after a batch of
/// writes.
pub async fn write_frame<W>(
    writer: &mut W,
    frame: &Frame,
    max_frame: u32,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let payload_len = u32::try_from(frame.payload.len())
        .map_err(|_| TransportError::FrameTooLarge {
            len: u32::MAX,
            max: max_frame,
        })?;
    if payload_len > max_frame {
        return Err(TransportError::FrameTooLarge {
            len: payload_len,
            max: max_frame,
        });
    }

    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&frame.sender_id.to_be_bytes());
    header[4..6].copy_from_slice(&frame.message_id.to_be_bytes());
    header[6..14].copy_from_slice(&frame.correlation_id.to_be_bytes());
    header[14..18].copy_from_slice(&payload_len.to_be_bytes());

    writer.write_all(&header).await?;
    writer.write_all(&frame.payload).await?;
    Ok(())
}

/// Reads one frame from `reader`. Returns
/// [`TransportError::ConnectionClosed`] if the peer closes the stream
/// cleanly before a complete header arrives (this is the normal
/// end-of-connection signal, not a protocol violation).
pub async fn read_frame<R>(
    reader: &mut R,
    max_frame: u32,
) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(()) => (),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::ConnectionClosed);
        }
        Err(e) => return Err(TransportError::Io(e)),
    }

    let sender_id = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let message_id = u16::from_be_bytes(header[4..6].try_into().unwrap());
    let correlation_id =
        u64::from_be_bytes(header[6..14].try_into().unwrap());
    let payload_len = u32::from_be_bytes(header[14..18].try_into().unwrap());

    if payload_len > max_frame {
        return Err(TransportError::FrameTooLarge {
            len: payload_len,
            max: max_frame,
        });
    }

    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        sender_id,
        message_id,
        correlation_id,
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod test {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn roundtrips_a_frame() {
        let (mut a, mut b) = duplex(4096);

        let frame = Frame::new(1, 100, 0, Bytes::from_static(b"hello"));
        write_frame(&mut a, &frame, DEFAULT_MAX_FRAME).await.unwrap();

        let decoded = read_frame(&mut b, DEFAULT_MAX_FRAME).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn roundtrips_an_empty_payload() {
        let (mut a, mut b) = duplex(4096);

        let frame = Frame::new(7, 101, 42, Bytes::new());
        write_frame(&mut a, &frame, DEFAULT_MAX_FRAME).await.unwrap();

        let decoded = read_frame(&mut b, DEFAULT_MAX_FRAME).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn rejects_oversized_payload_on_write() {
        let (mut a, _b) = duplex(4096);

        let frame = Frame::new(1, 100, 0, Bytes::from(vec![0u8; 100]));
        let result = write_frame(&mut a, &frame, 10).await;
        assert!(matches!(result, Err(TransportError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn rejects_oversized_payload_on_read() {
        let (mut a, mut b) = duplex(8192);

        // Hand-craft a header claiming a payload larger than max_frame, but
        // never send that much data; read_frame must reject before trying
        // to allocate or read the (nonexistent) payload.
        let mut header = [0u8; HEADER_LEN];
        header[14..18].copy_from_slice(&1_000u32.to_be_bytes());
        a.write_all(&header).await.unwrap();

        let result = read_frame(&mut b, 10).await;
        assert!(matches!(result, Err(TransportError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn closed_stream_before_header_is_connection_closed() {
        let (a, mut b) = duplex(4096);
        drop(a);

        let result = read_frame(&mut b, DEFAULT_MAX_FRAME).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }
}
