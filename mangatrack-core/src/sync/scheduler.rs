//! Periodic sweep: a leader-elected ticker that funnels due sources through
//! the gatekeeper.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gatekeeper::{AdmissionReason, CrawlGatekeeper};
use crate::Result;

use super::persistence::SyncRepository;

#[derive(Clone, Copy, Debug)]
pub struct SweepConfig {
    pub interval: Duration,
    pub batch_limit: i64,
    pub leadership_ttl: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_limit: 500,
            leadership_ttl: Duration::from_secs(90),
        }
    }
}

/// Redis-leased leadership so only one node runs the sweep at a time.
pub struct SweepLeadership {
    redis: ConnectionManager,
    key: String,
    holder: String,
    ttl: Duration,
}

impl fmt::Debug for SweepLeadership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SweepLeadership")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl SweepLeadership {
    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self {
            redis,
            key: "mangatrack:sweep:leader".to_string(),
            holder: Uuid::now_v7().to_string(),
            ttl,
        }
    }

    /// Acquire or refresh the lease. Refresh is compare-and-expire so a
    /// node never extends a lease another node has since taken over.
    pub async fn try_acquire(&mut self) -> Result<bool> {
        let ttl_ms = self.ttl.as_millis() as i64;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut self.redis)
            .await?;
        if acquired.is_some() {
            return Ok(true);
        }

        let refreshed: i64 = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('PEXPIRE', KEYS[1], ARGV[2])
            end
            return 0
            "#,
        )
        .key(&self.key)
        .arg(&self.holder)
        .arg(ttl_ms)
        .invoke_async(&mut self.redis)
        .await?;
        Ok(refreshed == 1)
    }

    pub async fn release(&mut self) -> Result<()> {
        let _: i64 = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        )
        .key(&self.key)
        .arg(&self.holder)
        .invoke_async(&mut self.redis)
        .await?;
        Ok(())
    }
}

/// Scans sources whose `next_check_at` has elapsed and asks the gatekeeper
/// to enqueue each with reason `PERIODIC`.
pub struct PeriodicSweep {
    repo: Arc<dyn SyncRepository>,
    gatekeeper: Arc<CrawlGatekeeper>,
    /// `None` runs unelected (single-node and test setups).
    leadership: Option<SweepLeadership>,
    config: SweepConfig,
}

impl fmt::Debug for PeriodicSweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicSweep")
            .field("config", &self.config)
            .field("elected", &self.leadership.is_some())
            .finish_non_exhaustive()
    }
}

impl PeriodicSweep {
    pub fn new(
        repo: Arc<dyn SyncRepository>,
        gatekeeper: Arc<CrawlGatekeeper>,
        leadership: Option<SweepLeadership>,
        config: SweepConfig,
    ) -> Self {
        Self {
            repo,
            gatekeeper,
            leadership,
            config,
        }
    }

    /// One sweep pass. Returns how many sources were admitted.
    pub async fn sweep_once(&self) -> Result<usize> {
        let due = self.repo.due_sources(self.config.batch_limit).await?;
        let mut admitted = 0usize;
        for source in &due {
            match self
                .gatekeeper
                .enqueue_if_allowed(source.id, source.tier, AdmissionReason::Periodic, None)
                .await
            {
                Ok(true) => admitted += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(source = %source.id, error = %err, "periodic enqueue failed");
                }
            }
        }
        debug!(due = due.len(), admitted, "periodic sweep pass complete");
        Ok(admitted)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval = ?self.config.interval, "periodic sweep started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Some(leadership) = self.leadership.as_mut() {
                match leadership.try_acquire().await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("sweep leadership held elsewhere, skipping tick");
                        continue;
                    }
                    Err(err) => {
                        warn!(error = %err, "sweep leadership check failed, skipping tick");
                        continue;
                    }
                }
            }

            if let Err(err) = self.sweep_once().await {
                warn!(error = %err, "periodic sweep pass failed");
            }
        }

        if let Some(leadership) = self.leadership.as_mut() {
            if let Err(err) = leadership.release().await {
                warn!(error = %err, "sweep leadership release failed");
            }
        }
        info!("periodic sweep stopped");
    }
}
