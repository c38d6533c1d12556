//! Persistence gateway (§4.G): the narrow interface over the five tables
//! that the ingestion state machine and status updater are allowed to
//! touch. The database is the ledger of record; no in-memory caching of
//! balances or status is permitted in the core (§5 Shared-resource
//! policy).

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Row};

use crate::{
    error::{DbError, DuplicateCreditError, GatewayError},
    model::{
        WalletAddress, WalletStatus, JOB_STATE_OBSERVED, JOB_STATE_PROCESSED,
        TX_TYPE_CREDIT, TX_TYPE_OBSERVATION,
    },
};

/// What [`NotifyTxn::upsert_tx_row`] reports about the row's state
/// immediately before this NOTIFY's finalize step runs — specifically
/// whether it was already `complete`, which gates attribution and
/// crediting (§4.E steps 3 and 5, the "not yet complete" guard).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRowSnapshot {
    pub was_complete: bool,
}

/// An open, per-txid-locked transaction driving one NOTIFY through the
/// five tables (§4.E, §4.G). Every method here runs inside the same
/// database transaction; [`NotifyTxn::commit`] or [`NotifyTxn::rollback`]
/// ends it.
#[async_trait]
pub trait NotifyTxn: Send {
    /// §4.E step 1: insert a `txType=1` row if absent, else
    /// `confirms = max(existing, confirmations)`. The underlying SQL
    /// (`INSERT ... ON CONFLICT ... DO UPDATE`) takes and holds the
    /// per-txid row lock for the rest of the transaction, which is what
    /// serializes concurrent NOTIFYs for the same txid (§5).
    async fn upsert_tx_row(
        &mut self,
        txid: &str,
        confirmations: i32,
    ) -> Result<TxRowSnapshot, GatewayError>;

    /// §4.E step 2: insert a job row in state 0 if one doesn't already
    /// exist for this txid. No-op if it does.
    async fn insert_job_if_absent(
        &mut self,
        txid: &str,
        coin: &str,
        raw_payload: &str,
    ) -> Result<(), GatewayError>;

    /// §4.E step 3a: look up the site user who owns `address`, if any.
    async fn find_address(
        &mut self,
        address: &str,
    ) -> Result<Option<WalletAddress>, GatewayError>;

    /// §4.E step 4: transition the job to state 3 and record `user_id` and
    /// `result`, but only if it's still in state 0. Returns whether the
    /// promotion actually happened (it won't on a replay after the job
    /// already reached state 3).
    async fn promote_job(
        &mut self,
        txid: &str,
        user_id: &str,
    ) -> Result<bool, GatewayError>;

    /// §4.E step 5a: insert a `txType=3` row keyed by `(txid, userId)`.
    /// Returns [`GatewayError::DuplicateCredit`] if that row already
    /// exists — the caller must abort the transaction in that case.
    async fn insert_credit_row(
        &mut self,
        txid: &str,
        user_id: &str,
        amount: Decimal,
    ) -> Result<(), GatewayError>;

    /// §4.E step 5c: add `amount` to `user_id`'s balance, creating the
    /// balance row initialized to zero first if it doesn't exist.
    async fn add_to_balance(
        &mut self,
        user_id: &str,
        amount: Decimal,
    ) -> Result<(), GatewayError>;

    /// §4.E step 6: set the `txType=1` row's final `confirms`/`complete`/
    /// `processed` fields. `confirms` is `max(existing, confirmations)` and
    /// `complete` is `existing || (confirmations >= confirm_threshold)` —
    /// both sticky, per §3 invariants 3 and 4, matching `upsert_tx_row`'s
    /// own `max` so a lower out-of-order `confirmations` here can never
    /// regress either field (§8 scenario 5).
    async fn finalize_tx_row(
        &mut self,
        txid: &str,
        confirmations: i32,
        confirm_threshold: i32,
    ) -> Result<(), GatewayError>;

    async fn commit(self: Box<Self>) -> Result<(), GatewayError>;
    async fn rollback(self: Box<Self>) -> Result<(), GatewayError>;
}

/// Entry point used by the ingestion state machine (E) and status updater
/// (F); the only thing in the core allowed to write the five tables.
#[async_trait]
pub trait PersistenceGateway: Send + Sync + 'static {
    /// Opens a transaction scoped to one NOTIFY for `txid` (§4.E, §4.G
    /// `withTxn`).
    async fn begin_notify_txn(
        &self,
        txid: &str,
    ) -> Result<Box<dyn NotifyTxn>, GatewayError>;

    /// §4.F: upsert `status` keyed by coin type. A plain read-modify-write
    /// under the `type` uniqueness constraint; concurrent heartbeats for
    /// the same coin may race, and last-writer-wins is acceptable (§5).
    async fn upsert_status(
        &self,
        status: &WalletStatus,
    ) -> Result<(), GatewayError>;
}

/// The production gateway, backed by a Postgres connection pool.
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub async fn connect(database_url: &str) -> Result<Self, GatewayError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .map_err(DbError)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn begin_notify_txn(
        &self,
        _txid: &str,
    ) -> Result<Box<dyn NotifyTxn>, GatewayError> {
        let txn = self.pool.begin().await.map_err(DbError)?;
        Ok(Box::new(PgNotifyTxn { txn }))
    }

    async fn upsert_status(
        &self,
        status: &WalletStatus,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO user_wallet_status \
                (type, online, synced, crawling, blockheight, blockhash, blocktime, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (type) DO UPDATE SET \
                online = EXCLUDED.online, \
                synced = EXCLUDED.synced, \
                crawling = EXCLUDED.crawling, \
                blockheight = EXCLUDED.blockheight, \
                blockhash = EXCLUDED.blockhash, \
                blocktime = EXCLUDED.blocktime, \
                updated_at = EXCLUDED.updated_at",
        )
        .bind(status.coin_type.as_str())
        .bind(status.online)
        .bind(status.synced)
        .bind(status.crawling)
        .bind(status.blockheight)
        .bind(status.blockhash.as_str())
        .bind(status.blocktime)
        .bind(status.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError)?;
        Ok(())
    }
}

struct PgNotifyTxn {
    txn: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl NotifyTxn for PgNotifyTxn {
    async fn upsert_tx_row(
        &mut self,
        txid: &str,
        confirmations: i32,
    ) -> Result<TxRowSnapshot, GatewayError> {
        // Relies on `user_wallet_tx(txid, "txType", "userId")` being declared
        // `UNIQUE NULLS NOT DISTINCT` (§6); a plain unique index would let two
        // concurrent type-1 inserts (both with `userId = NULL`) both succeed,
        // breaking invariant 1 and the per-txid row lock this upsert exists
        // to take.
        let row = sqlx::query(
            "INSERT INTO user_wallet_tx \
                (txid, blockhash, \"coinType\", \"txType\", confirms, complete, processed, \"userId\") \
             VALUES ($1, '', 0, $2, $3, false, false, NULL) \
             ON CONFLICT (txid, \"txType\", \"userId\") DO UPDATE SET \
                confirms = GREATEST(user_wallet_tx.confirms, EXCLUDED.confirms) \
             RETURNING complete",
        )
        .bind(txid)
        .bind(TX_TYPE_OBSERVATION)
        .bind(confirmations)
        .fetch_one(&mut *self.txn)
        .await
        .map_err(DbError)?;

        let was_complete: bool = row.try_get("complete").map_err(DbError)?;
        Ok(TxRowSnapshot { was_complete })
    }

    async fn insert_job_if_absent(
        &mut self,
        txid: &str,
        coin: &str,
        raw_payload: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO user_wallet_job (job, state, type, data) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (job) DO NOTHING",
        )
        .bind(txid)
        .bind(JOB_STATE_OBSERVED)
        .bind(coin)
        .bind(raw_payload)
        .execute(&mut *self.txn)
        .await
        .map_err(DbError)?;
        Ok(())
    }

    async fn find_address(
        &mut self,
        address: &str,
    ) -> Result<Option<WalletAddress>, GatewayError> {
        let row = sqlx::query(
            "SELECT address, \"userId\" FROM user_wallet_address WHERE address = $1",
        )
        .bind(address)
        .fetch_optional(&mut *self.txn)
        .await
        .map_err(DbError)?;

        Ok(match row {
            Some(row) => Some(WalletAddress {
                address: row.try_get("address").map_err(DbError)?,
                user_id: row.try_get("userId").map_err(DbError)?,
            }),
            None => None,
        })
    }

    async fn promote_job(
        &mut self,
        txid: &str,
        user_id: &str,
    ) -> Result<bool, GatewayError> {
        let result = sqlx::query(
            "UPDATE user_wallet_job \
             SET state = $1, \"userId\" = $2, result = 'okay' \
             WHERE job = $3 AND state = $4",
        )
        .bind(JOB_STATE_PROCESSED)
        .bind(user_id)
        .bind(txid)
        .bind(JOB_STATE_OBSERVED)
        .execute(&mut *self.txn)
        .await
        .map_err(DbError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_credit_row(
        &mut self,
        txid: &str,
        user_id: &str,
        amount: Decimal,
    ) -> Result<(), GatewayError> {
        let result = sqlx::query(
            "INSERT INTO user_wallet_tx \
                (txid, blockhash, \"coinType\", \"txType\", confirms, complete, processed, \"userId\", amount) \
             VALUES ($1, '', 0, $2, 0, true, true, $3, $4)",
        )
        .bind(txid)
        .bind(TX_TYPE_CREDIT)
        .bind(user_id)
        .bind(amount)
        .execute(&mut *self.txn)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if db_err.is_unique_violation() =>
            {
                Err(GatewayError::DuplicateCredit(DuplicateCreditError {
                    txid: txid.to_owned(),
                    user_id: user_id.to_owned(),
                }))
            }
            Err(e) => Err(GatewayError::Db(DbError(e))),
        }
    }

    async fn add_to_balance(
        &mut self,
        user_id: &str,
        amount: Decimal,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO user_wallet_balance (\"userId\", balance) \
             VALUES ($1, $2) \
             ON CONFLICT (\"userId\") DO UPDATE SET \
                balance = user_wallet_balance.balance + EXCLUDED.balance",
        )
        .bind(user_id)
        .bind(amount)
        .execute(&mut *self.txn)
        .await
        .map_err(DbError)?;
        Ok(())
    }

    async fn finalize_tx_row(
        &mut self,
        txid: &str,
        confirmations: i32,
        confirm_threshold: i32,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE user_wallet_tx \
             SET confirms = GREATEST(confirms, $1), \
                complete = complete OR ($1 >= $2), \
                processed = true \
             WHERE txid = $3 AND \"txType\" = $4",
        )
        .bind(confirmations)
        .bind(confirm_threshold)
        .bind(txid)
        .bind(TX_TYPE_OBSERVATION)
        .execute(&mut *self.txn)
        .await
        .map_err(DbError)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), GatewayError> {
        self.txn.commit().await.map_err(DbError)?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), GatewayError> {
        self.txn.rollback().await.map_err(DbError)?;
        Ok(())
    }
}
