//! The five persistent entities the ingestion and status pipelines read
//! and write (§3). These are plain data rows; all invariants about how
//! they may be created or mutated live in [`crate::gateway`] and
//! [`crate::ingestion`].

use rust_decimal::Decimal;

/// `txType` discriminant for [`WalletTransaction`]: a raw on-chain
/// observation, not yet attributed to any user.
pub const TX_TYPE_OBSERVATION: i16 = 1;
/// `txType` discriminant for [`WalletTransaction`]: a per-user credit
/// entry, one per `(txid, userId)` pair ever credited.
pub const TX_TYPE_CREDIT: i16 = 3;

/// `state` discriminant for [`WalletJob`]: observed, not yet attributable
/// to a user.
pub const JOB_STATE_OBSERVED: i16 = 0;
/// `state` discriminant for [`WalletJob`]: attributed and processed.
pub const JOB_STATE_PROCESSED: i16 = 3;

/// An observed on-chain transaction, or one user's credit entry against
/// it (§3 WalletTransaction).
#[derive(Debug, Clone, PartialEq)]
pub struct WalletTransaction {
    pub txid: String,
    pub blockhash: String,
    pub coin_type: i32,
    pub tx_type: i16,
    pub confirms: i32,
    pub complete: bool,
    pub processed: bool,
    pub user_id: Option<String>,
    pub amount: Option<Decimal>,
}

/// The credit-workflow bookkeeping row for one txid (§3 WalletJob).
#[derive(Debug, Clone, PartialEq)]
pub struct WalletJob {
    pub job: String,
    pub state: i16,
    pub job_type: String,
    pub data: String,
    pub user_id: Option<String>,
    pub result: Option<String>,
}

/// A wallet-issued address mapped to the site user who owns it (§3
/// WalletAddress). Read-only in this core; populated by the new-address
/// command flow, which is out of core scope.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletAddress {
    pub address: String,
    pub user_id: String,
}

/// A user's cached spendable balance (§3 WalletBalance). Must always equal
/// the sum of `amount` over that user's type-3 [`WalletTransaction`] rows;
/// mutated only by additive credit (§3 invariant 5).
#[derive(Debug, Clone, PartialEq)]
pub struct WalletBalance {
    pub user_id: String,
    pub balance: Decimal,
}

/// The latest heartbeat snapshot for one coin (§3 WalletStatus, §4.F).
#[derive(Debug, Clone, PartialEq)]
pub struct WalletStatus {
    pub coin_type: String,
    pub online: bool,
    pub synced: bool,
    pub crawling: bool,
    pub blockheight: i64,
    pub blockhash: String,
    pub blocktime: i64,
    pub updated_at: i64,
}

/// One `{address, balance}` entry from a NOTIFY payload's `balances` list
/// (§4.E). `balance` is an integer string in the coin's smallest unit.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct NotifyBalanceEntry {
    pub address: String,
    pub balance: String,
}

/// The NOTIFY payload (§4.E).
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct NotifyPayload {
    pub txid: String,
    pub coin: String,
    pub confirmations: i32,
    #[serde(default)]
    pub blockhash: Option<String>,
    pub balances: Vec<NotifyBalanceEntry>,
}

/// The HEARTBEAT payload (§4.F).
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct HeartbeatPayload {
    pub coin: String,
    pub online: bool,
    pub synced: bool,
    pub crawling: bool,
    pub blockheight: i64,
    #[serde(rename = "bestBlockHash")]
    pub best_block_hash: String,
    pub blocktime: i64,
}
