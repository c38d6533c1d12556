use std::io;

/// Errors raised by the framing / socket layer (§4.A, §7).
///
/// Logged and used to trigger endpoint reconnect with backoff; never
/// propagated back to a caller that doesn't already expect an I/O failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("tls handshake failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to load tls material: {0}")]
    TlsSetup(String),

    #[error("frame payload length {len} exceeds max frame size {max}")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("connection closed before a full frame was read")]
    ConnectionClosed,
}

/// A request timed out waiting for a reply (§4.B, §7). Delivered to the
/// outbound continuation; never retried automatically by the Session.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("request {correlation_id} timed out after {timeout_secs}s")]
pub struct TimeoutError {
    pub correlation_id: u64,
    pub timeout_secs: u64,
}

/// The endpoint owning this pending request was closed before a reply
/// arrived (§4.B, §7). Delivered to the outbound continuation.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("request {correlation_id} cancelled: endpoint closed")]
pub struct CancelledError {
    pub correlation_id: u64,
}

/// The outcome handed to an outbound request's continuation.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
}

/// A frame's header or payload could not be decoded into the shape a
/// handler expects (§4.C, §7). Logged and the frame is dropped; the
/// connection is left open.
#[derive(Debug, thiserror::Error)]
#[error("failed to decode frame payload for message id {message_id}: {reason}")]
pub struct FrameDecodeError {
    pub message_id: u16,
    pub reason: String,
}

/// A dispatcher's one-shot `reply` closure was invoked more than once
/// by a handler (§4.C).
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("handler for message id {message_id} replied more than once")]
pub struct DoubleReplyError {
    pub message_id: u16,
}
