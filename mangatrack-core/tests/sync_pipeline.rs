//! End-to-end exercise of the crawl pipeline over in-memory components,
//! from admission through the sync worker to delivery batches.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use mangatrack_core::fanout::{
    DeliveryWorker, FanoutConfig, FanoutPipeline, FanoutRepository, FanoutWorker,
    MemoryCoalesceSlot, Subscriber,
};
use mangatrack_core::gatekeeper::{AdmissionReason, CrawlGatekeeper, SourceInfoProvider};
use mangatrack_core::queue::{InMemoryQueue, QueueName, QueueService};
use mangatrack_core::ratelimit::FixedWindowLimiter;
use mangatrack_core::sync::{
    AdapterError, AdapterRegistry, DueSource, NewChapter, RemoteChapter, SourceAdapter,
    SyncOutcome, SyncRepository, SyncScheduleConfig, SyncWorker, SyncWorkerConfig,
};
use mangatrack_core::types::{
    CatalogTier, ChapterId, SeriesId, SeriesSource, SeriesSourceId, SourceStatus, UserId,
};

struct StubSources;

#[async_trait]
impl SourceInfoProvider for StubSources {
    async fn last_success_at(
        &self,
        _id: SeriesSourceId,
    ) -> mangatrack_core::Result<Option<DateTime<Utc>>> {
        Ok(None)
    }
}

/// Upstream with a fixed chapter listing.
struct StubAdapter {
    chapters: Vec<RemoteChapter>,
}

#[async_trait]
impl SourceAdapter for StubAdapter {
    fn source_name(&self) -> &str {
        "paperback"
    }

    async fn list_chapters(
        &self,
        _source: &SeriesSource,
        _cancel: CancellationToken,
    ) -> Result<Vec<RemoteChapter>, AdapterError> {
        Ok(self.chapters.clone())
    }
}

/// Sync store that reports every listed chapter as a first appearance.
struct StubSyncRepo {
    source: SeriesSource,
    new_chapters: Vec<NewChapter>,
}

#[async_trait]
impl SyncRepository for StubSyncRepo {
    async fn due_sources(&self, _limit: i64) -> mangatrack_core::Result<Vec<DueSource>> {
        Ok(vec![DueSource {
            id: self.source.id,
            series_id: self.source.series_id,
            tier: Some(CatalogTier::B),
            last_success_at: None,
        }])
    }

    async fn load_source(
        &self,
        _id: SeriesSourceId,
    ) -> mangatrack_core::Result<Option<SeriesSource>> {
        Ok(Some(self.source.clone()))
    }

    async fn series_tier(&self, _series_id: SeriesId) -> mangatrack_core::Result<Option<CatalogTier>> {
        Ok(Some(CatalogTier::B))
    }

    async fn apply_sync(
        &self,
        _source_id: SeriesSourceId,
        chapters: &[RemoteChapter],
        _next_check_at: DateTime<Utc>,
    ) -> mangatrack_core::Result<SyncOutcome> {
        Ok(SyncOutcome {
            new_chapters: self.new_chapters.clone(),
            chapters_seen: chapters.len(),
        })
    }

    async fn record_permanent_failure(
        &self,
        _source_id: SeriesSourceId,
    ) -> mangatrack_core::Result<SourceStatus> {
        Ok(SourceStatus::Active)
    }
}

/// Fan-out store capturing inserted notifications; one subscriber has
/// already read the chapter and must never be selected.
struct StubFanoutRepo {
    unread_subscribers: Vec<Subscriber>,
    inserted: Mutex<Vec<(ChapterId, Vec<UserId>)>>,
}

#[async_trait]
impl FanoutRepository for StubFanoutRepo {
    async fn subscribers_for(
        &self,
        _series_id: SeriesId,
        _chapter_id: ChapterId,
    ) -> mangatrack_core::Result<Vec<Subscriber>> {
        Ok(self.unread_subscribers.clone())
    }

    async fn insert_notifications(
        &self,
        _series_id: SeriesId,
        chapter_id: ChapterId,
        user_ids: &[UserId],
    ) -> mangatrack_core::Result<u64> {
        self.inserted
            .lock()
            .unwrap()
            .push((chapter_id, user_ids.to_vec()));
        Ok(user_ids.len() as u64)
    }

    async fn series_tier(
        &self,
        _series_id: SeriesId,
    ) -> mangatrack_core::Result<Option<CatalogTier>> {
        Ok(Some(CatalogTier::B))
    }
}

#[tokio::test]
async fn detected_chapter_flows_from_admission_to_delivery() {
    let queue: Arc<InMemoryQueue> = Arc::new(InMemoryQueue::default());
    let series_id = SeriesId::new();
    let source_id = SeriesSourceId::new();
    let chapter_id = ChapterId::new();

    let source = SeriesSource {
        id: source_id,
        series_id,
        source_name: "paperback".to_string(),
        external_id: "wire-1".to_string(),
        source_status: SourceStatus::Active,
        last_success_at: None,
        next_check_at: None,
        consecutive_failures: 0,
        is_primary_cover: true,
    };

    // 1. Admission: a user-requested crawl always lands at P0.
    let gatekeeper = CrawlGatekeeper::new(queue.clone(), Arc::new(StubSources));
    let admitted = gatekeeper
        .enqueue_if_allowed(source_id, Some(CatalogTier::B), AdmissionReason::UserRequest, None)
        .await
        .unwrap();
    assert!(admitted);

    // 2. Sync: the worker fetches, diffs, and emits one fan-out event.
    let sync_repo = Arc::new(StubSyncRepo {
        source,
        new_chapters: vec![NewChapter {
            chapter_id,
            number: 101.0,
        }],
    });
    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(StubAdapter {
        chapters: vec![RemoteChapter {
            source_chapter_id: "ch-101".to_string(),
            chapter_number: 101.0,
            url: "https://paperback.example/ch-101".to_string(),
            detected_at: None,
        }],
    }));
    let sync_worker = SyncWorker::new(
        queue.clone(),
        sync_repo,
        adapters,
        SyncScheduleConfig::default(),
        SyncWorkerConfig::default(),
        "sync-it",
    );
    assert!(sync_worker.tick(&CancellationToken::new()).await.unwrap());
    assert_eq!(queue.counts(QueueName::Notification).await.unwrap().waiting, 1);

    // 3. Fan-out: the read filter already excluded one subscriber; the two
    //    unread ones split across the tier lanes.
    let standard_user = UserId::new();
    let premium_user = UserId::new();
    let fanout_repo = Arc::new(StubFanoutRepo {
        unread_subscribers: vec![
            Subscriber {
                user_id: standard_user,
                premium: false,
            },
            Subscriber {
                user_id: premium_user,
                premium: true,
            },
        ],
        inserted: Mutex::new(Vec::new()),
    });
    let pipeline = Arc::new(FanoutPipeline::new(
        fanout_repo.clone(),
        queue.clone(),
        Arc::new(MemoryCoalesceSlot::default()),
        Arc::new(FixedWindowLimiter::in_memory()),
        FanoutConfig {
            coalesce_window: Duration::from_millis(0),
            ..FanoutConfig::default()
        },
    ));
    let fanout_worker = FanoutWorker::new(pipeline, queue.clone(), "fanout-it");
    assert!(fanout_worker.tick().await.unwrap());
    assert_eq!(
        queue
            .counts(QueueName::NotificationDelivery)
            .await
            .unwrap()
            .waiting,
        1
    );
    assert_eq!(
        queue
            .counts(QueueName::NotificationDeliveryPremium)
            .await
            .unwrap()
            .waiting,
        1
    );

    // 4. Delivery: both lanes insert, duplicates skipped at the store.
    for (queue_name, worker_id) in [
        (QueueName::NotificationDelivery, "delivery-it"),
        (QueueName::NotificationDeliveryPremium, "delivery-premium-it"),
    ] {
        let worker = DeliveryWorker::new(fanout_repo.clone(), queue.clone(), queue_name, worker_id);
        assert!(worker.tick().await.unwrap());
    }

    let inserted = fanout_repo.inserted.lock().unwrap();
    let delivered: Vec<UserId> = inserted
        .iter()
        .flat_map(|(_, users)| users.iter().copied())
        .collect();
    assert_eq!(delivered.len(), 2);
    assert!(delivered.contains(&standard_user));
    assert!(delivered.contains(&premium_user));
    assert!(inserted.iter().all(|(chapter, _)| *chapter == chapter_id));

    // Everything drained.
    for queue_name in [
        QueueName::SyncSource,
        QueueName::Notification,
        QueueName::NotificationDelivery,
        QueueName::NotificationDeliveryPremium,
    ] {
        let counts = queue.counts(queue_name).await.unwrap();
        assert_eq!(counts.waiting + counts.active + counts.delayed, 0);
    }
}
