//! wallet-broker: the custodial-wallet integration broker described in the
//! system overview. Implements the inbound event-processing pipeline
//! (NOTIFY, HEARTBEAT) and the outbound command façade, independent of how
//! the process is bootstrapped, configured, or logged (see
//! `wallet-broker-bin` for that ambient stack).

/// Public command surface (§4.D) plus the uniform reply-parsing rule.
pub mod broker;
/// Environment-sourced configuration, injected rather than read ambiently (§9).
pub mod config;
/// Error types raised by the persistence gateway and broker façade (§7).
pub mod error;
/// Persistence gateway (§4.G): the narrow interface over the five tables.
pub mod gateway;
/// Dispatcher-facing handlers for the two inbound message ids.
pub mod inbound;
/// Ingestion state machine (§4.E): the NOTIFY handler.
pub mod ingestion;
/// The five persistent entities plus the NOTIFY/HEARTBEAT wire payloads (§3).
pub mod model;
/// Status updater (§4.F): the HEARTBEAT handler.
pub mod status;
