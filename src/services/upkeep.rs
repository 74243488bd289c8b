//! Periodic database and storage upkeep.
//!
//! One task runs both batches shortly after start and then on two
//! schedules: a short one for expiring tokens and bans and reclaiming
//! unreferenced assets, and a long one for scrubbing sessions, identity
//! data and stale reactions. A batch never overlaps itself, and a failing
//! step is logged without stopping the rest of its batch.

use crate::services::{media_store::MediaStore, tokens::TokenIssuer};
use chrono::Utc;
use std::{future::Future, time::Duration};
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior, interval_at, sleep},
};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug)]
pub struct UpkeepSchedule {
    pub startup_delay: Duration,
    pub short_period: Duration,
    pub long_period: Duration,
}

impl Default for UpkeepSchedule {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(60),
            short_period: Duration::from_secs(5 * 60),
            long_period: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Clone)]
pub struct Upkeep {
    store: MediaStore,
    tokens: TokenIssuer,
    identity_retention: Duration,
}

impl Upkeep {
    pub fn new(store: MediaStore, tokens: TokenIssuer, identity_retention: Duration) -> Self {
        Self {
            store,
            tokens,
            identity_retention,
        }
    }

    /// Run until `shutdown` changes or its sender is dropped.
    pub async fn run(self, schedule: UpkeepSchedule, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = sleep(schedule.startup_delay) => {}
            _ = shutdown.changed() => return,
        }
        self.run_short_batch().await;
        self.run_long_batch().await;

        let mut short = interval_at(
            Instant::now() + schedule.short_period,
            schedule.short_period,
        );
        short.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut long = interval_at(Instant::now() + schedule.long_period, schedule.long_period);
        long.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = short.tick() => self.run_short_batch().await,
                _ = long.tick() => self.run_long_batch().await,
                _ = shutdown.changed() => break,
            }
        }
        info!("upkeep stopped");
    }

    pub async fn run_short_batch(&self) {
        debug!("running short upkeep batch");
        step("expire post tokens", self.expire_post_tokens()).await;
        step("expire claim tokens", async {
            self.tokens.expire().await.map_err(anyhow::Error::from)
        })
        .await;
        step("expire bans", self.expire_bans()).await;
        step("file cleanup", self.delete_unused_files()).await;
    }

    pub async fn run_long_batch(&self) {
        debug!("running long upkeep batch");
        step("expire user sessions", self.expire_sessions()).await;
        step("remove identity info", self.remove_identity_info()).await;
        step("remove unique ids", self.remove_unique_ids()).await;
        step("reactions cleanup", self.delete_orphaned_reactions()).await;
    }

    /// Delete every stored digest no post and no live claim token refers to.
    ///
    /// A digest that cannot be removed is logged and skipped.
    pub async fn delete_unused_files(&self) -> anyhow::Result<u64> {
        let unused = self.store.list_unreferenced().await?;
        let mut deleted = 0;
        for asset in &unused {
            match self.store.delete_asset(asset).await {
                Ok(true) => deleted += 1,
                Ok(false) => debug!(digest = %asset.sha1, "digest referenced again, kept"),
                Err(err) => warn!(digest = %asset.sha1, error = %err, "could not reclaim digest"),
            }
        }
        Ok(deleted)
    }

    async fn expire_post_tokens(&self) -> anyhow::Result<u64> {
        self.delete_expired("DELETE FROM post_tokens WHERE expires <= ?")
            .await
    }

    async fn expire_bans(&self) -> anyhow::Result<u64> {
        self.delete_expired("DELETE FROM bans WHERE expires <= ?").await
    }

    async fn expire_sessions(&self) -> anyhow::Result<u64> {
        self.delete_expired("DELETE FROM sessions WHERE expires <= ?")
            .await
    }

    async fn delete_expired(&self, sql: &str) -> anyhow::Result<u64> {
        let result = sqlx::query(sql)
            .bind(Utc::now().timestamp())
            .execute(&self.store.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn remove_identity_info(&self) -> anyhow::Result<u64> {
        let result = sqlx::query("UPDATE posts SET ip = NULL WHERE ip IS NOT NULL AND time < ?")
            .bind(self.identity_cutoff())
            .execute(&self.store.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn remove_unique_ids(&self) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE posts SET unique_id = NULL WHERE unique_id IS NOT NULL AND time < ?",
        )
        .bind(self.identity_cutoff())
        .execute(&self.store.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_orphaned_reactions(&self) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM post_reacts WHERE smile_id IN (SELECT id FROM smiles WHERE deleted = 1)",
        )
        .execute(&self.store.db)
        .await?;
        Ok(result.rows_affected())
    }

    fn identity_cutoff(&self) -> i64 {
        let retention = i64::try_from(self.identity_retention.as_secs()).unwrap_or(i64::MAX);
        Utc::now().timestamp().saturating_sub(retention)
    }
}

async fn step<F>(name: &str, fut: F)
where
    F: Future<Output = anyhow::Result<u64>>,
{
    match fut.await {
        Ok(0) => {}
        Ok(affected) => info!(step = name, affected, "upkeep step done"),
        Err(err) => error!(step = name, error = ?err, "upkeep step failed"),
    }
}
