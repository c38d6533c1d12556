//! Status updater (§4.F): the HEARTBEAT handler. A pure upsert with no
//! cross-row invariants — concurrent heartbeats for the same coin may
//! race, and last-writer-wins is acceptable (§5).

use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    error::GatewayError,
    gateway::PersistenceGateway,
    model::{HeartbeatPayload, WalletStatus},
};

/// Applies one HEARTBEAT: upserts [`WalletStatus`] keyed by coin type,
/// setting every field plus `updatedAt = now` (§4.F). Returns the literal
/// reply string, `"Received HEARTBEAT"`.
pub async fn handle_heartbeat(
    gateway: &dyn PersistenceGateway,
    heartbeat: &HeartbeatPayload,
) -> Result<&'static str, GatewayError> {
    let updated_at = now_unix();
    let status = WalletStatus {
        coin_type: heartbeat.coin.clone(),
        online: heartbeat.online,
        synced: heartbeat.synced,
        crawling: heartbeat.crawling,
        blockheight: heartbeat.blockheight,
        blockhash: heartbeat.best_block_hash.clone(),
        blocktime: heartbeat.blocktime,
        updated_at,
    };
    gateway.upsert_status(&status).await?;
    Ok("Received HEARTBEAT")
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gateway::mock::MockGateway;

    fn heartbeat(blockheight: i64) -> HeartbeatPayload {
        HeartbeatPayload {
            coin: "X".to_owned(),
            online: true,
            synced: true,
            crawling: false,
            blockheight,
            best_block_hash: "H".to_owned(),
            blocktime: 1_700_000_000,
        }
    }

    /// §8 scenario 6: two heartbeats with differing blockheights leave one
    /// row per coin, reflecting the second heartbeat's values.
    #[tokio::test]
    async fn second_heartbeat_overwrites_the_first() {
        let gateway = MockGateway::new();

        handle_heartbeat(&gateway, &heartbeat(900)).await.unwrap();
        handle_heartbeat(&gateway, &heartbeat(901)).await.unwrap();

        let status = gateway.status_of("X").unwrap();
        assert_eq!(status.blockheight, 901);
        assert_eq!(status.coin_type, "X");
    }
}
