//! Dispatcher-facing handlers for the two inbound `messageId`s (§4.C,
//! §4.E, §4.F): NOTIFY and HEARTBEAT. These are the only message ids the
//! broker registers with the [`intercom::Dispatcher`] — everything else
//! flows the other direction, broker → wallet, through
//! [`crate::broker::Broker`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use intercom::{FrameDecodeError, Handler, Reply};
use tracing::{error, warn};

use crate::{
    broker::message_id,
    gateway::PersistenceGateway,
    ingestion::{self, NotifyOutcome},
    model::{HeartbeatPayload, NotifyPayload},
    status,
};

/// Wraps the ingestion state machine (§4.E) as a Dispatcher [`Handler`] for
/// `messageId` NOTIFY (100).
pub struct NotifyHandler {
    gateway: Arc<dyn PersistenceGateway>,
    confirm_threshold: i32,
    decimal_precision: u32,
}

impl NotifyHandler {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        confirm_threshold: i32,
        decimal_precision: u32,
    ) -> Self {
        Self { gateway, confirm_threshold, decimal_precision }
    }
}

#[async_trait]
impl Handler for NotifyHandler {
    async fn handle(&self, _sender_id: u32, payload: Bytes, reply: Reply) {
        let raw_payload = match std::str::from_utf8(&payload) {
            Ok(s) => s,
            Err(e) => {
                let decode_err = FrameDecodeError {
                    message_id: message_id::NOTIFY,
                    reason: e.to_string(),
                };
                warn!(error = %decode_err, "dropping frame");
                return;
            }
        };
        let parsed: NotifyPayload = match serde_json::from_str(raw_payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                let decode_err = FrameDecodeError {
                    message_id: message_id::NOTIFY,
                    reason: e.to_string(),
                };
                warn!(error = %decode_err, "dropping frame");
                return;
            }
        };

        let outcome = ingestion::handle_notify(
            self.gateway.as_ref(),
            &parsed,
            raw_payload,
            self.confirm_threshold,
            self.decimal_precision,
        )
        .await;

        // §7: a duplicate-credit abort still replies normally so the wallet
        // doesn't retry indefinitely; only a genuine DB failure surfaces as
        // a failure string the wallet may choose to retransmit against.
        match outcome {
            Ok(NotifyOutcome::Applied)
            | Ok(NotifyOutcome::DuplicateCreditAborted { .. }) => {
                let _ = reply
                    .send(Bytes::from_static(ingestion::NOTIFY_REPLY.as_bytes()));
            }
            Err(e) => {
                error!(
                    error = %e,
                    txid = %parsed.txid,
                    "failed to apply NOTIFY; wallet may retransmit",
                );
                let _ = reply.send(Bytes::from_static(b"NOTIFY failed"));
            }
        }
    }
}

/// Wraps the status updater (§4.F) as a Dispatcher [`Handler`] for
/// `messageId` HEARTBEAT (101).
pub struct HeartbeatHandler {
    gateway: Arc<dyn PersistenceGateway>,
}

impl HeartbeatHandler {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Handler for HeartbeatHandler {
    async fn handle(&self, _sender_id: u32, payload: Bytes, reply: Reply) {
        let parsed: HeartbeatPayload = match serde_json::from_slice(&payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                let decode_err = FrameDecodeError {
                    message_id: message_id::HEARTBEAT,
                    reason: e.to_string(),
                };
                warn!(error = %decode_err, "dropping frame");
                return;
            }
        };

        match status::handle_heartbeat(self.gateway.as_ref(), &parsed).await {
            Ok(message) => {
                let _ = reply.send(Bytes::from_static(message.as_bytes()));
            }
            Err(e) => {
                error!(error = %e, coin = %parsed.coin, "failed to apply HEARTBEAT");
                let _ = reply.send(Bytes::from_static(b"HEARTBEAT failed"));
            }
        }
    }
}
