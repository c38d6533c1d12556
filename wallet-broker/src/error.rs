//! Error types raised by the persistence gateway and the broker façade
//! (§7).

/// A type-3 credit row already existed for `(txid, userId)`: this NOTIFY
/// is a replay of a credit that was already applied, and must not be
/// applied again (§4.E step 5a, §4.E.1 design note on the duplicate-credit
/// hazard).
///
/// Raised by the persistence gateway; the ingestion state machine aborts
/// the enclosing transaction and logs at error level, but still replies
/// normally so the wallet does not retry indefinitely (§7).
#[derive(Debug, Clone, thiserror::Error)]
#[error("duplicate credit for txid={txid} user_id={user_id}")]
pub struct DuplicateCreditError {
    pub txid: String,
    pub user_id: String,
}

/// Any other persistence failure: connection loss, constraint violation
/// unrelated to credit dedup, query error. Aborts the enclosing
/// transaction; the wallet may retransmit (§7).
#[derive(Debug, thiserror::Error)]
#[error("database error: {0}")]
pub struct DbError(#[from] pub sqlx::Error);

/// Everything the persistence gateway can fail with.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    DuplicateCredit(#[from] DuplicateCreditError),
    #[error(transparent)]
    Db(#[from] DbError),
    /// An integer-string balance failed to parse (§4.E.1). This can only
    /// happen if the wallet peer sends a malformed balance string; it is
    /// folded into the same transaction-abort disposition as a DB error.
    #[error("failed to parse balance: {0}")]
    Decimal(#[from] common::decimal::Error),
}

/// A command reply's payload didn't parse as the structured
/// `{isError, message}` object the broker façade expects (§4.D). Per §7
/// this is downgraded: the raw payload is delivered to the caller as
/// informational rather than treated as a failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("reply payload did not parse as a structured command reply")]
pub struct ReplyParseError;
