//! Intercom2: the point-to-point messaging substrate between the broker
//! and a remote wallet process. Provides length-framed transport with
//! optional mutual TLS, endpoint identity, request/reply correlation with
//! timeout and cancellation, and per-message-id handler dispatch.
//!
//! This crate knows nothing about wallets, transactions, or balances — it
//! only moves framed byte payloads between two numbered endpoints and
//! routes them to whoever is listening for a given message id.

/// Handler registration and one-shot reply plumbing (§4.C).
pub mod dispatcher;
/// Error types for the transport and session layers (§7).
pub mod error;
/// Wire framing: header layout, read/write primitives (§4.A, §6).
pub mod frame;
/// Endpoint identity, request/reply correlation, reconnection (§4.B).
pub mod session;
/// Mutual TLS config construction (§4.A mode 2).
pub mod tls;

pub use dispatcher::{Dispatcher, DispatcherBuilder, Handler, Reply};
pub use error::{
    CancelledError, DoubleReplyError, FrameDecodeError, SessionError,
    TimeoutError, TransportError,
};
pub use frame::{Frame, DEFAULT_MAX_FRAME};
pub use session::{
    EndpointHandle, RemoteEndpointConfig, Session, SessionConfig,
    TransportMode,
};
pub use tls::TlsMaterial;
