//! Broker façade (§4.D): the public command surface that goes broker →
//! wallet, plus the uniform reply-parsing rule shared by every command.

use bytes::Bytes;
use intercom::{Session, SessionError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `messageId` constants for the outbound command surface (§6). Exact
/// numeric assignments are an external wire contract with the installed
/// wallet peer and must not be renumbered.
pub mod message_id {
    pub const START: u16 = 1;
    pub const STOP: u16 = 2;
    pub const RESTART: u16 = 3;
    pub const REINDEX: u16 = 4;
    pub const RESYNC: u16 = 5;
    pub const RESCAN: u16 = 6;
    pub const NEW_ADDRESS: u16 = 10;
    pub const ADDRESSES: u16 = 11;
    pub const ADDRESS_BALANCE: u16 = 12;
    pub const ID_BALANCE: u16 = 13;
    pub const BEST_BLOCK_HASH: u16 = 14;
    pub const INFO: u16 = 15;
    pub const SEND_FUNDS: u16 = 20;
    pub const REPLAY: u16 = 21;
    pub const CRAWL: u16 = 22;

    /// The two inbound message ids (§6), handled by
    /// [`crate::inbound::NotifyHandler`] and
    /// [`crate::inbound::HeartbeatHandler`] rather than by `Broker`.
    pub const NOTIFY: u16 = 100;
    pub const HEARTBEAT: u16 = 101;
}

/// The payload shape for [`message_id::SEND_FUNDS`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub account_id: String,
    pub to_address: String,
    /// The send amount as an integer string in the coin's smallest unit,
    /// mirroring how balances are reported on NOTIFY (§4.E.1).
    pub amount: String,
    pub coin: String,
}

/// The wire shape of every reply payload (§6): `{isError, message}`.
#[derive(Debug, Deserialize)]
struct RawReply {
    #[serde(rename = "isError")]
    is_error: bool,
    message: Value,
}

/// The decoded outcome of any outbound command (§4.D reply parsing rule).
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    /// Parsed, `isError: false`. Carries `message`.
    Ok(Value),
    /// Parsed, `isError: true`. Carries `message` as the failure detail.
    Err(Value),
    /// Didn't parse as `{isError, message}` at all; delivered as-is,
    /// treated as informational (§7 `ReplyParseError` disposition).
    Raw(Bytes),
}

impl CommandReply {
    /// Applies the reply-parsing rule uniformly (§4.D): attempt to decode
    /// as `{isError, message}`; if it parses, branch on `isError`; if it
    /// doesn't parse, hand back the raw bytes.
    pub fn parse(payload: &[u8]) -> Self {
        match serde_json::from_slice::<RawReply>(payload) {
            Ok(raw) if raw.is_error => CommandReply::Err(raw.message),
            Ok(raw) => CommandReply::Ok(raw.message),
            Err(_) => CommandReply::Raw(Bytes::copy_from_slice(payload)),
        }
    }

    /// `true` if this is a successfully-parsed, non-error reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandReply::Ok(_))
    }
}

/// The public command surface (§4.D). One [`Broker`] is bound to a single
/// remote wallet endpoint, identified by `wallet_id`.
pub struct Broker {
    session: std::sync::Arc<Session>,
    wallet_id: u32,
}

impl Broker {
    pub fn new(session: std::sync::Arc<Session>, wallet_id: u32) -> Self {
        Self { session, wallet_id }
    }

    async fn call(
        &self,
        message_id: u16,
        payload: Bytes,
    ) -> Result<CommandReply, SessionError> {
        let reply = self.session.send(self.wallet_id, message_id, payload).await?;
        Ok(CommandReply::parse(&reply))
    }

    async fn call_empty(&self, message_id: u16) -> Result<CommandReply, SessionError> {
        self.call(message_id, Bytes::new()).await
    }

    async fn call_text(
        &self,
        message_id: u16,
        text: &str,
    ) -> Result<CommandReply, SessionError> {
        self.call(message_id, Bytes::copy_from_slice(text.as_bytes())).await
    }

    pub async fn start(&self) -> Result<CommandReply, SessionError> {
        self.call_empty(message_id::START).await
    }

    pub async fn stop(&self) -> Result<CommandReply, SessionError> {
        self.call_empty(message_id::STOP).await
    }

    pub async fn restart(&self) -> Result<CommandReply, SessionError> {
        self.call_empty(message_id::RESTART).await
    }

    pub async fn reindex(&self) -> Result<CommandReply, SessionError> {
        self.call_empty(message_id::REINDEX).await
    }

    pub async fn resync(&self) -> Result<CommandReply, SessionError> {
        self.call_empty(message_id::RESYNC).await
    }

    pub async fn rescan(&self) -> Result<CommandReply, SessionError> {
        self.call_empty(message_id::RESCAN).await
    }

    pub async fn info(&self) -> Result<CommandReply, SessionError> {
        self.call_empty(message_id::INFO).await
    }

    pub async fn best_block_hash(&self) -> Result<CommandReply, SessionError> {
        self.call_empty(message_id::BEST_BLOCK_HASH).await
    }

    pub async fn new_address(
        &self,
        account_id: &str,
    ) -> Result<CommandReply, SessionError> {
        self.call_text(message_id::NEW_ADDRESS, account_id).await
    }

    pub async fn addresses(
        &self,
        account_id: &str,
    ) -> Result<CommandReply, SessionError> {
        self.call_text(message_id::ADDRESSES, account_id).await
    }

    pub async fn address_balance(
        &self,
        address: &str,
    ) -> Result<CommandReply, SessionError> {
        self.call_text(message_id::ADDRESS_BALANCE, address).await
    }

    pub async fn id_balance(
        &self,
        account_id: &str,
    ) -> Result<CommandReply, SessionError> {
        self.call_text(message_id::ID_BALANCE, account_id).await
    }

    pub async fn send_funds(
        &self,
        request: &TransactionRequest,
    ) -> Result<CommandReply, SessionError> {
        let payload = serde_json::to_vec(request)
            .expect("TransactionRequest is always serializable");
        self.call(message_id::SEND_FUNDS, Bytes::from(payload)).await
    }

    pub async fn replay(&self, txid: &str) -> Result<CommandReply, SessionError> {
        self.call_text(message_id::REPLAY, txid).await
    }

    /// `target` is a blockhash or a height formatted as a string (§4.D).
    pub async fn crawl(&self, target: &str) -> Result<CommandReply, SessionError> {
        self.call_text(message_id::CRAWL, target).await
    }
}
