//! The fan-out chain: an event waits out the coalesce window, selects the
//! unread subscribers, and hands fixed-size batches to the delivery lanes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::queue::{
    DeliveryBatchJob, EnqueueOptions, JobId, JobPayload, JobPriority, QueueName, QueueService,
};
use crate::ratelimit::FixedWindowLimiter;
use crate::Result;
use crate::types::{CatalogTier, ChapterId, SeriesId};

use super::health::{HealthThresholds, NotificationHealth};
use super::persistence::FanoutRepository;

#[derive(Clone, Copy, Debug)]
pub struct FanoutConfig {
    /// Delay before fan-out during which duplicate events for the same
    /// (series, chapter) merge.
    pub coalesce_window: Duration,
    pub batch_size: usize,
    pub health: HealthThresholds,
    /// Per-user notification cap within the throttle window.
    pub per_user_cap: u32,
    pub per_user_window: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_secs(15),
            batch_size: 100,
            health: HealthThresholds::default(),
            per_user_cap: 50,
            per_user_window: Duration::from_secs(24 * 3_600),
        }
    }
}

/// Per-(series, chapter) slot claimed by the event that will run the
/// fan-out; later duplicates inside the window lose the claim and return.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CoalesceSlot: Send + Sync {
    async fn try_claim(
        &self,
        series_id: SeriesId,
        chapter_id: ChapterId,
        ttl: Duration,
    ) -> Result<bool>;
}

pub struct RedisCoalesceSlot {
    redis: ConnectionManager,
}

impl fmt::Debug for RedisCoalesceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCoalesceSlot").finish_non_exhaustive()
    }
}

impl RedisCoalesceSlot {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl CoalesceSlot for RedisCoalesceSlot {
    async fn try_claim(
        &self,
        series_id: SeriesId,
        chapter_id: ChapterId,
        ttl: Duration,
    ) -> Result<bool> {
        let mut redis = self.redis.clone();
        let key = format!("fanout:{series_id}:{chapter_id}");
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as i64)
            .query_async(&mut redis)
            .await?;
        Ok(claimed.is_some())
    }
}

/// Process-local slot for tests and single-node runs.
#[derive(Debug, Default)]
pub struct MemoryCoalesceSlot {
    claims: DashMap<(SeriesId, ChapterId), std::time::Instant>,
}

#[async_trait]
impl CoalesceSlot for MemoryCoalesceSlot {
    async fn try_claim(
        &self,
        series_id: SeriesId,
        chapter_id: ChapterId,
        ttl: Duration,
    ) -> Result<bool> {
        let key = (series_id, chapter_id);
        let now = std::time::Instant::now();
        if let Some(expiry) = self.claims.get(&key) {
            if *expiry > now {
                return Ok(false);
            }
        }
        self.claims.insert(key, now + ttl);
        Ok(true)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FanoutOutcome {
    /// Batches enqueued for delivery.
    Delivered { batches: usize, users: usize },
    /// Another event holds the coalesce slot for this chapter.
    Coalesced,
    /// Shed by the health gate; not retried.
    Dropped { reason: String },
}

pub struct FanoutPipeline {
    repo: Arc<dyn FanoutRepository>,
    queue: Arc<dyn QueueService>,
    slot: Arc<dyn CoalesceSlot>,
    limiter: Arc<FixedWindowLimiter>,
    config: FanoutConfig,
}

impl fmt::Debug for FanoutPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FanoutPipeline {
    pub fn new(
        repo: Arc<dyn FanoutRepository>,
        queue: Arc<dyn QueueService>,
        slot: Arc<dyn CoalesceSlot>,
        limiter: Arc<FixedWindowLimiter>,
        config: FanoutConfig,
    ) -> Self {
        Self {
            repo,
            queue,
            slot,
            limiter,
            config,
        }
    }

    async fn delivery_depth(&self) -> u64 {
        let mut depth = 0;
        for queue in [
            QueueName::Notification,
            QueueName::NotificationDelivery,
            QueueName::NotificationDeliveryPremium,
        ] {
            match self.queue.counts(queue).await {
                Ok(counts) => depth += counts.total_queued(),
                Err(err) => {
                    warn!(error = %err, queue = %queue, "delivery depth lookup failed");
                }
            }
        }
        depth
    }

    /// Handle one chapter-detected event end to end.
    pub async fn handle_event(
        &self,
        series_id: SeriesId,
        chapter_id: ChapterId,
    ) -> Result<FanoutOutcome> {
        let health =
            NotificationHealth::from_depth(self.delivery_depth().await, self.config.health);

        if health.is_rejected() {
            info!(series = %series_id, chapter = %chapter_id, "fan-out rejected under load");
            return Ok(FanoutOutcome::Dropped {
                reason: "notification system rejecting new events".to_string(),
            });
        }
        if health.is_overloaded() {
            let tier = self.repo.series_tier(series_id).await.unwrap_or(None);
            if !matches!(tier, Some(CatalogTier::A) | Some(CatalogTier::B)) {
                info!(series = %series_id, chapter = %chapter_id, "tier-c fan-out shed under load");
                return Ok(FanoutOutcome::Dropped {
                    reason: "tier-c series shed while overloaded".to_string(),
                });
            }
        }

        // The slot TTL outlives the window so a worker restart mid-sleep
        // cannot let a duplicate through early.
        let slot_ttl = self.config.coalesce_window * 2 + Duration::from_secs(1);
        if !self
            .slot
            .try_claim(series_id, chapter_id, slot_ttl)
            .await?
        {
            debug!(series = %series_id, chapter = %chapter_id, "event coalesced into open window");
            return Ok(FanoutOutcome::Coalesced);
        }

        tokio::time::sleep(self.config.coalesce_window).await;

        let mut subscribers = self.repo.subscribers_for(series_id, chapter_id).await?;
        if health.is_critical() {
            subscribers.retain(|subscriber| subscriber.premium);
        }

        // Per-user caps decide whether a user gets this notification at all;
        // they do not affect the read-filter semantics above.
        let mut kept = Vec::with_capacity(subscribers.len());
        for subscriber in subscribers {
            let decision = self
                .limiter
                .check(
                    &format!("notify:{}", subscriber.user_id),
                    self.config.per_user_cap,
                    self.config.per_user_window,
                )
                .await;
            if decision.allowed {
                kept.push(subscriber);
            }
        }

        let users = kept.len();
        let mut batches = 0usize;
        for premium in [false, true] {
            let group: Vec<_> = kept
                .iter()
                .filter(|subscriber| subscriber.premium == premium)
                .map(|subscriber| subscriber.user_id)
                .collect();
            for (index, chunk) in group.chunks(self.config.batch_size.max(1)).enumerate() {
                self.queue
                    .enqueue(
                        JobId::delivery_batch(series_id, chapter_id, batches * 1_000 + index),
                        JobPayload::DeliverBatch(DeliveryBatchJob {
                            series_id,
                            chapter_id,
                            user_ids: chunk.to_vec(),
                            premium,
                        }),
                        EnqueueOptions {
                            priority: Some(JobPriority::P2),
                            ..Default::default()
                        },
                    )
                    .await?;
                batches += 1;
            }
        }

        debug!(series = %series_id, chapter = %chapter_id, users, batches, "fan-out batches enqueued");
        Ok(FanoutOutcome::Delivered { batches, users })
    }
}

/// Drains the `notification` queue into the pipeline.
pub struct FanoutWorker {
    pipeline: Arc<FanoutPipeline>,
    queue: Arc<dyn QueueService>,
    worker_id: String,
    idle_backoff: Duration,
}

impl fmt::Debug for FanoutWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutWorker")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl FanoutWorker {
    pub fn new(
        pipeline: Arc<FanoutPipeline>,
        queue: Arc<dyn QueueService>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            pipeline,
            queue,
            worker_id: worker_id.into(),
            idle_backoff: Duration::from_secs(1),
        }
    }

    pub async fn tick(&self) -> Result<bool> {
        let Some(job) = self
            .queue
            .dequeue(QueueName::Notification, &self.worker_id)
            .await?
        else {
            return Ok(false);
        };

        let JobPayload::ChapterDetected(event) = &job.payload else {
            self.queue
                .fail(QueueName::Notification, &job.id, "unexpected payload kind", false)
                .await?;
            return Ok(true);
        };

        match self
            .pipeline
            .handle_event(event.series_id, event.chapter_id)
            .await
        {
            // Dropped and coalesced events complete: they are deliberately
            // not retried.
            Ok(_) => {
                self.queue.complete(QueueName::Notification, &job.id).await?;
            }
            Err(err) => {
                self.queue
                    .fail(
                        QueueName::Notification,
                        &job.id,
                        &err.to_string(),
                        err.is_retryable(),
                    )
                    .await?;
            }
        }
        Ok(true)
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(worker = %self.worker_id, "fan-out worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.idle_backoff) => {}
                    }
                }
                Err(err) => {
                    warn!(worker = %self.worker_id, error = %err, "fan-out worker tick failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.idle_backoff) => {}
                    }
                }
            }
        }
        info!(worker = %self.worker_id, "fan-out worker stopped");
    }
}

/// Drains one delivery queue, inserting notifications with duplicates
/// skipped.
pub struct DeliveryWorker {
    repo: Arc<dyn FanoutRepository>,
    queue: Arc<dyn QueueService>,
    queue_name: QueueName,
    worker_id: String,
    idle_backoff: Duration,
}

impl fmt::Debug for DeliveryWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryWorker")
            .field("queue", &self.queue_name)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl DeliveryWorker {
    pub fn new(
        repo: Arc<dyn FanoutRepository>,
        queue: Arc<dyn QueueService>,
        queue_name: QueueName,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            queue,
            queue_name,
            worker_id: worker_id.into(),
            idle_backoff: Duration::from_secs(1),
        }
    }

    pub async fn tick(&self) -> Result<bool> {
        let Some(job) = self.queue.dequeue(self.queue_name, &self.worker_id).await? else {
            return Ok(false);
        };

        let JobPayload::DeliverBatch(batch) = &job.payload else {
            self.queue
                .fail(self.queue_name, &job.id, "unexpected payload kind", false)
                .await?;
            return Ok(true);
        };

        match self
            .repo
            .insert_notifications(batch.series_id, batch.chapter_id, &batch.user_ids)
            .await
        {
            Ok(inserted) => {
                debug!(
                    chapter = %batch.chapter_id,
                    batch = batch.user_ids.len(),
                    inserted,
                    "notification batch delivered"
                );
                self.queue.complete(self.queue_name, &job.id).await?;
            }
            Err(err) => {
                self.queue
                    .fail(self.queue_name, &job.id, &err.to_string(), err.is_retryable())
                    .await?;
            }
        }
        Ok(true)
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(worker = %self.worker_id, queue = %self.queue_name, "delivery worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.tick().await {
                Ok(true) => {}
                _ => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.idle_backoff) => {}
                    }
                }
            }
        }
        info!(worker = %self.worker_id, queue = %self.queue_name, "delivery worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::persistence::{MockFanoutRepository, Subscriber};
    use crate::queue::InMemoryQueue;
    use crate::types::UserId;

    fn fast_config() -> FanoutConfig {
        FanoutConfig {
            coalesce_window: Duration::from_millis(0),
            batch_size: 2,
            ..FanoutConfig::default()
        }
    }

    fn pipeline_with(
        repo: MockFanoutRepository,
        queue: Arc<InMemoryQueue>,
        config: FanoutConfig,
    ) -> FanoutPipeline {
        FanoutPipeline::new(
            Arc::new(repo),
            queue,
            Arc::new(MemoryCoalesceSlot::default()),
            Arc::new(FixedWindowLimiter::in_memory()),
            config,
        )
    }

    #[tokio::test]
    async fn survivors_are_batched_per_subscription_tier() {
        let queue = Arc::new(InMemoryQueue::default());
        let mut repo = MockFanoutRepository::new();
        let standard: Vec<UserId> = (0..3).map(|_| UserId::new()).collect();
        let premium = UserId::new();
        let mut everyone: Vec<Subscriber> = standard
            .iter()
            .map(|&user_id| Subscriber {
                user_id,
                premium: false,
            })
            .collect();
        everyone.push(Subscriber {
            user_id: premium,
            premium: true,
        });
        repo.expect_subscribers_for()
            .returning(move |_, _| Ok(everyone.clone()));

        let pipeline = pipeline_with(repo, queue.clone(), fast_config());
        let outcome = pipeline
            .handle_event(SeriesId::new(), ChapterId::new())
            .await
            .unwrap();

        // 3 standard users at batch size 2 -> 2 batches, 1 premium batch.
        assert_eq!(
            outcome,
            FanoutOutcome::Delivered {
                batches: 3,
                users: 4
            }
        );
        assert_eq!(
            queue
                .counts(QueueName::NotificationDelivery)
                .await
                .unwrap()
                .waiting,
            2
        );
        assert_eq!(
            queue
                .counts(QueueName::NotificationDeliveryPremium)
                .await
                .unwrap()
                .waiting,
            1
        );
    }

    #[tokio::test]
    async fn duplicate_event_inside_window_coalesces() {
        let queue = Arc::new(InMemoryQueue::default());
        let mut repo = MockFanoutRepository::new();
        repo.expect_subscribers_for().returning(|_, _| Ok(vec![]));

        let pipeline = pipeline_with(repo, queue, fast_config());
        let series = SeriesId::new();
        let chapter = ChapterId::new();

        let first = pipeline.handle_event(series, chapter).await.unwrap();
        assert!(matches!(first, FanoutOutcome::Delivered { .. }));

        let second = pipeline.handle_event(series, chapter).await.unwrap();
        assert_eq!(second, FanoutOutcome::Coalesced);
    }

    #[tokio::test]
    async fn rejected_health_drops_without_selection() {
        let queue = Arc::new(InMemoryQueue::default());
        let mut repo = MockFanoutRepository::new();
        // Selection must not run at all when rejected.
        repo.expect_subscribers_for().never();

        let config = FanoutConfig {
            health: HealthThresholds {
                overloaded: 0,
                critical: 0,
                rejected: 0,
            },
            ..fast_config()
        };
        let pipeline = pipeline_with(repo, queue, config);
        let outcome = pipeline
            .handle_event(SeriesId::new(), ChapterId::new())
            .await
            .unwrap();
        assert!(matches!(outcome, FanoutOutcome::Dropped { .. }));
    }

    #[tokio::test]
    async fn critical_health_keeps_premium_only() {
        let queue = Arc::new(InMemoryQueue::default());
        queue.seed_depth(
            QueueName::NotificationDelivery,
            JobPayload::DeliverBatch(DeliveryBatchJob {
                series_id: SeriesId::new(),
                chapter_id: ChapterId::new(),
                user_ids: vec![],
                premium: false,
            }),
            5,
        );

        let mut repo = MockFanoutRepository::new();
        let premium = UserId::new();
        repo.expect_subscribers_for().returning(move |_, _| {
            Ok(vec![
                Subscriber {
                    user_id: UserId::new(),
                    premium: false,
                },
                Subscriber {
                    user_id: premium,
                    premium: true,
                },
            ])
        });
        repo.expect_series_tier()
            .returning(|_| Ok(Some(CatalogTier::A)));

        let config = FanoutConfig {
            health: HealthThresholds {
                overloaded: 1,
                critical: 2,
                rejected: 1_000,
            },
            ..fast_config()
        };
        let pipeline = pipeline_with(repo, queue.clone(), config);
        let outcome = pipeline
            .handle_event(SeriesId::new(), ChapterId::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FanoutOutcome::Delivered {
                batches: 1,
                users: 1
            }
        );
        assert_eq!(
            queue
                .counts(QueueName::NotificationDeliveryPremium)
                .await
                .unwrap()
                .waiting,
            1
        );
    }

    #[tokio::test]
    async fn delivery_worker_inserts_batch_and_completes() {
        let queue = Arc::new(InMemoryQueue::default());
        let series = SeriesId::new();
        let chapter = ChapterId::new();
        let users = vec![UserId::new(), UserId::new()];
        queue
            .enqueue(
                JobId::delivery_batch(series, chapter, 0),
                JobPayload::DeliverBatch(DeliveryBatchJob {
                    series_id: series,
                    chapter_id: chapter,
                    user_ids: users.clone(),
                    premium: false,
                }),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let mut repo = MockFanoutRepository::new();
        repo.expect_insert_notifications()
            .withf(move |_, _, ids| ids.len() == 2)
            .times(1)
            .returning(|_, _, ids| Ok(ids.len() as u64));

        let worker = DeliveryWorker::new(
            Arc::new(repo),
            queue.clone(),
            QueueName::NotificationDelivery,
            "delivery-test",
        );
        assert!(worker.tick().await.unwrap());
        assert_eq!(
            queue
                .counts(QueueName::NotificationDelivery)
                .await
                .unwrap()
                .waiting,
            0
        );
    }
}
