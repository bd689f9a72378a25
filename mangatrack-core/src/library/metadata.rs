//! Metadata retry orchestration for a library entry.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::error::{map_contention, CoreError};
use crate::queue::{
    EnqueueOptions, ImportEntry, JobId, JobPayload, JobPriority, JobState, QueueName,
    QueueService, SeriesResolutionJob,
};
use crate::Result;
use crate::types::{EntryId, MetadataStatus, UserId};

/// Metadata source recorded on an entry; user overrides are never retried
/// automatically.
pub const METADATA_SOURCE_USER_OVERRIDE: &str = "USER_OVERRIDE";

#[derive(Clone, Debug)]
pub struct MetadataState {
    pub status: MetadataStatus,
    pub source: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait LibraryStore: Send + Sync {
    async fn metadata_state(
        &self,
        user_id: UserId,
        entry_id: EntryId,
    ) -> Result<Option<MetadataState>>;

    /// Reset the entry back to `pending` and stamp the attempt, under
    /// `FOR UPDATE NOWAIT` so two concurrent retries conflict instead of
    /// double-resetting.
    async fn reset_metadata_status(&self, entry_id: EntryId) -> Result<()>;

    /// Create a pending entry from an import row. `None` when the user
    /// already tracks that source URL.
    async fn create_pending_entry(
        &self,
        user_id: UserId,
        entry: &ImportEntry,
    ) -> Result<Option<EntryId>>;
}

#[derive(Clone, Copy, Debug)]
pub struct MetadataRetryConfig {
    /// Minimum spacing between attempts for one entry.
    pub min_interval: Duration,
}

impl Default for MetadataRetryConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(120),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryOutcome {
    Enqueued,
    /// A live job already covers this entry; nothing was enqueued.
    AlreadyQueued,
}

pub struct MetadataRetry {
    store: Arc<dyn LibraryStore>,
    queue: Arc<dyn QueueService>,
    config: MetadataRetryConfig,
}

impl fmt::Debug for MetadataRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataRetry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MetadataRetry {
    pub fn new(
        store: Arc<dyn LibraryStore>,
        queue: Arc<dyn QueueService>,
        config: MetadataRetryConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    pub async fn retry(&self, user_id: UserId, entry_id: EntryId) -> Result<RetryOutcome> {
        let state = self
            .store
            .metadata_state(user_id, entry_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("library entry {entry_id}")))?;

        if state.status == MetadataStatus::Enriched {
            return Err(CoreError::BadRequest("entry is already enriched".into()));
        }
        if state.source.as_deref() == Some(METADATA_SOURCE_USER_OVERRIDE) {
            return Err(CoreError::BadRequest(
                "entry metadata is user-overridden".into(),
            ));
        }
        if let Some(last) = state.last_attempt_at {
            let min_interval = ChronoDuration::from_std(self.config.min_interval)
                .unwrap_or_else(|_| ChronoDuration::minutes(2));
            let eligible_at = last + min_interval;
            let now = Utc::now();
            if now < eligible_at {
                let remaining = (eligible_at - now).to_std().unwrap_or_default();
                return Err(CoreError::rate_limited(
                    "metadata retry attempted too soon",
                    remaining,
                ));
            }
        }

        self.store.reset_metadata_status(entry_id).await?;

        let job_id = JobId::series_resolution(entry_id);
        match self
            .queue
            .find_state(QueueName::SeriesResolution, &job_id)
            .await?
        {
            Some(JobState::Waiting) | Some(JobState::Delayed) | Some(JobState::Active) => {
                // An open job will pick up the reset row; enqueuing again
                // would only churn the queue.
                return Ok(RetryOutcome::AlreadyQueued);
            }
            Some(JobState::Completed) | Some(JobState::Failed) => {
                self.queue
                    .remove(QueueName::SeriesResolution, &job_id)
                    .await?;
            }
            None => {}
        }

        self.queue
            .enqueue(
                job_id,
                JobPayload::SeriesResolution(SeriesResolutionJob { entry_id, user_id }),
                EnqueueOptions {
                    priority: Some(JobPriority::P0),
                    ..Default::default()
                },
            )
            .await?;
        Ok(RetryOutcome::Enqueued)
    }
}

#[derive(Clone, Debug)]
pub struct PostgresLibraryStore {
    pool: PgPool,
}

impl PostgresLibraryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LibraryStore for PostgresLibraryStore {
    async fn metadata_state(
        &self,
        user_id: UserId,
        entry_id: EntryId,
    ) -> Result<Option<MetadataState>> {
        let row = sqlx::query(
            r#"
            SELECT metadata_status, metadata_source, metadata_attempted_at
            FROM library_entries
            WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(entry_id.as_uuid())
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let status: String = row.try_get("metadata_status")?;
                Ok(Some(MetadataState {
                    status: status.parse()?,
                    source: row.try_get("metadata_source")?,
                    last_attempt_at: row.try_get("metadata_attempted_at")?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn reset_metadata_status(&self, entry_id: EntryId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT id FROM library_entries WHERE id = $1 FOR UPDATE NOWAIT")
            .bind(entry_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_contention(e, "lock entry for metadata reset"))?
            .ok_or_else(|| CoreError::NotFound(format!("library entry {entry_id}")))?;

        sqlx::query(
            r#"
            UPDATE library_entries
            SET metadata_status = 'pending', metadata_attempted_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(entry_id.as_uuid())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_pending_entry(
        &self,
        user_id: UserId,
        entry: &ImportEntry,
    ) -> Result<Option<EntryId>> {
        let source_url = entry.source_url.as_deref().unwrap_or_default();
        let exists: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT 1
            FROM library_entries
            WHERE user_id = $1 AND source_url = $2 AND deleted_at IS NULL
            LIMIT 1
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(source_url)
        .fetch_optional(&self.pool)
        .await?;
        if exists.is_some() {
            return Ok(None);
        }

        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO import_candidates
                (id, user_id, title, source_url, source_name, external_id,
                 last_read_chapter, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(user_id.as_uuid())
        .bind(&entry.title)
        .bind(source_url)
        .bind(entry.source_name.as_deref().unwrap_or("import"))
        .bind(&entry.external_id)
        .bind(entry.last_read_chapter)
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(EntryId(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;

    fn state(
        status: MetadataStatus,
        source: Option<&str>,
        last_attempt_at: Option<DateTime<Utc>>,
    ) -> MetadataState {
        MetadataState {
            status,
            source: source.map(str::to_owned),
            last_attempt_at,
        }
    }

    fn retry_with(store: MockLibraryStore, queue: Arc<InMemoryQueue>) -> MetadataRetry {
        MetadataRetry::new(Arc::new(store), queue, MetadataRetryConfig::default())
    }

    #[tokio::test]
    async fn enriched_entry_is_a_bad_request() {
        let mut store = MockLibraryStore::new();
        store
            .expect_metadata_state()
            .returning(|_, _| Ok(Some(state(MetadataStatus::Enriched, None, None))));
        let retry = retry_with(store, Arc::new(InMemoryQueue::default()));
        let err = retry.retry(UserId::new(), EntryId::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::BadRequest(_)));
    }

    #[tokio::test]
    async fn user_override_is_a_bad_request() {
        let mut store = MockLibraryStore::new();
        store.expect_metadata_state().returning(|_, _| {
            Ok(Some(state(
                MetadataStatus::Failed,
                Some(METADATA_SOURCE_USER_OVERRIDE),
                None,
            )))
        });
        let retry = retry_with(store, Arc::new(InMemoryQueue::default()));
        let err = retry.retry(UserId::new(), EntryId::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::BadRequest(_)));
    }

    #[tokio::test]
    async fn recent_attempt_rate_limits() {
        let mut store = MockLibraryStore::new();
        store.expect_metadata_state().returning(|_, _| {
            Ok(Some(state(
                MetadataStatus::Failed,
                None,
                Some(Utc::now() - ChronoDuration::seconds(30)),
            )))
        });
        let retry = retry_with(store, Arc::new(InMemoryQueue::default()));
        let err = retry.retry(UserId::new(), EntryId::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn eligible_entry_resets_and_enqueues_idempotently() {
        let entry_id = EntryId::new();
        let queue = Arc::new(InMemoryQueue::default());

        let mut store = MockLibraryStore::new();
        store.expect_metadata_state().returning(|_, _| {
            Ok(Some(state(
                MetadataStatus::Failed,
                None,
                Some(Utc::now() - ChronoDuration::minutes(10)),
            )))
        });
        store
            .expect_reset_metadata_status()
            .times(2)
            .returning(|_| Ok(()));

        let retry = retry_with(store, queue.clone());
        let first = retry.retry(UserId::new(), entry_id).await.unwrap();
        assert_eq!(first, RetryOutcome::Enqueued);

        // The job is waiting, so a second request reports success without
        // enqueuing again.
        let second = retry.retry(UserId::new(), entry_id).await.unwrap();
        assert_eq!(second, RetryOutcome::AlreadyQueued);
        assert_eq!(
            queue
                .counts(QueueName::SeriesResolution)
                .await
                .unwrap()
                .waiting,
            1
        );
    }
}
