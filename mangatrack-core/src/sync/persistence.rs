//! Sync-side storage: the due-source sweep query and the serializable
//! diff-and-persist transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::error::{map_contention, CoreError};
use crate::gatekeeper::SourceInfoProvider;
use crate::Result;
use crate::types::{
    CatalogTier, ChapterId, SeriesId, SeriesSource, SeriesSourceId, SourceStatus,
};

use super::adapter::RemoteChapter;

/// Row shape returned by the periodic sweep scan.
#[derive(Clone, Debug)]
pub struct DueSource {
    pub id: SeriesSourceId,
    pub series_id: SeriesId,
    pub tier: Option<CatalogTier>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// A chapter whose number appeared for the first time anywhere in this sync.
#[derive(Clone, Copy, Debug)]
pub struct NewChapter {
    pub chapter_id: ChapterId,
    pub number: f64,
}

#[derive(Clone, Debug, Default)]
pub struct SyncOutcome {
    pub new_chapters: Vec<NewChapter>,
    pub chapters_seen: usize,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SyncRepository: Send + Sync {
    /// Sources whose `next_check_at` has elapsed, excluding broken ones.
    async fn due_sources(&self, limit: i64) -> Result<Vec<DueSource>>;

    async fn load_source(&self, id: SeriesSourceId) -> Result<Option<SeriesSource>>;

    async fn series_tier(&self, series_id: SeriesId) -> Result<Option<CatalogTier>>;

    /// Diff the remote listing against stored chapter sources and persist,
    /// all inside one per-source serialized transaction.
    async fn apply_sync(
        &self,
        source_id: SeriesSourceId,
        chapters: &[RemoteChapter],
        next_check_at: DateTime<Utc>,
    ) -> Result<SyncOutcome>;

    /// Record a permanent upstream failure. Returns the resulting source
    /// status so the worker can log the broken transition.
    async fn record_permanent_failure(&self, source_id: SeriesSourceId) -> Result<SourceStatus>;
}

#[derive(Clone, Debug)]
pub struct PostgresSyncStore {
    pool: PgPool,
    /// Consecutive permanent failures before a source flips to broken.
    broken_threshold: i32,
}

impl PostgresSyncStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            broken_threshold: 3,
        }
    }

    pub fn with_broken_threshold(mut self, threshold: i32) -> Self {
        self.broken_threshold = threshold.max(1);
        self
    }

    fn source_from_row(row: &sqlx::postgres::PgRow) -> Result<SeriesSource> {
        let status: String = row.try_get("source_status")?;
        Ok(SeriesSource {
            id: SeriesSourceId(row.try_get::<Uuid, _>("id")?),
            series_id: SeriesId(row.try_get::<Uuid, _>("series_id")?),
            source_name: row.try_get("source_name")?,
            external_id: row.try_get("external_id")?,
            source_status: status.parse()?,
            last_success_at: row.try_get("last_success_at")?,
            next_check_at: row.try_get("next_check_at")?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            is_primary_cover: row.try_get("is_primary_cover")?,
        })
    }
}

#[async_trait]
impl SyncRepository for PostgresSyncStore {
    async fn due_sources(&self, limit: i64) -> Result<Vec<DueSource>> {
        // Shape matches the partial index over (next_check_at) WHERE
        // source_status <> 'broken'.
        let rows = sqlx::query(
            r#"
            SELECT ss.id, ss.series_id, s.tier, ss.last_success_at
            FROM series_sources ss
            JOIN series s ON s.id = ss.series_id
            WHERE ss.next_check_at <= NOW()
              AND ss.source_status <> 'broken'
              AND s.deleted_at IS NULL
            ORDER BY ss.next_check_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut due = Vec::with_capacity(rows.len());
        for row in rows {
            let tier: Option<String> = row.try_get("tier")?;
            due.push(DueSource {
                id: SeriesSourceId(row.try_get::<Uuid, _>("id")?),
                series_id: SeriesId(row.try_get::<Uuid, _>("series_id")?),
                tier: tier.as_deref().map(str::parse).transpose()?,
                last_success_at: row.try_get("last_success_at")?,
            });
        }
        Ok(due)
    }

    async fn load_source(&self, id: SeriesSourceId) -> Result<Option<SeriesSource>> {
        let row = sqlx::query(
            r#"
            SELECT id, series_id, source_name, external_id, source_status,
                   last_success_at, next_check_at, consecutive_failures, is_primary_cover
            FROM series_sources
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::source_from_row).transpose()
    }

    async fn series_tier(&self, series_id: SeriesId) -> Result<Option<CatalogTier>> {
        let tier: Option<Option<String>> =
            sqlx::query_scalar("SELECT tier FROM series WHERE id = $1 AND deleted_at IS NULL")
                .bind(series_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        tier.flatten().as_deref().map(str::parse).transpose()
    }

    async fn apply_sync(
        &self,
        source_id: SeriesSourceId,
        chapters: &[RemoteChapter],
        next_check_at: DateTime<Utc>,
    ) -> Result<SyncOutcome> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET LOCAL statement_timeout = 15000")
            .execute(&mut *tx)
            .await?;

        // Per-source advisory lock guards against split enqueues that
        // somehow survived job-id coalescing. Contention is a 409-class
        // condition; the job re-queues with backoff.
        let locked: bool =
            sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(source_id.to_string())
                .fetch_one(&mut *tx)
                .await?;
        if !locked {
            return Err(CoreError::Conflict(format!(
                "sync already in flight for source {source_id}"
            )));
        }

        let series_id: Uuid = sqlx::query_scalar(
            "SELECT series_id FROM series_sources WHERE id = $1 FOR UPDATE NOWAIT",
        )
        .bind(source_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_contention(e, "lock series source"))?
        .ok_or_else(|| CoreError::NotFound(format!("series source {source_id}")))?;

        let mut outcome = SyncOutcome {
            chapters_seen: chapters.len(),
            ..SyncOutcome::default()
        };

        for chapter in chapters {
            // Upsert the logical chapter; on a numbering collision the
            // existing chapter id wins.
            let inserted_chapter: Option<Uuid> = sqlx::query_scalar(
                r#"
                INSERT INTO chapters (id, series_id, number, created_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (series_id, number) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(series_id)
            .bind(chapter.chapter_number)
            .fetch_optional(&mut *tx)
            .await?;

            let chapter_is_new = inserted_chapter.is_some();
            let chapter_id = match inserted_chapter {
                Some(id) => id,
                None => {
                    sqlx::query_scalar("SELECT id FROM chapters WHERE series_id = $1 AND number = $2")
                        .bind(series_id)
                        .bind(chapter.chapter_number)
                        .fetch_one(&mut *tx)
                        .await?
                }
            };

            // The bare ON CONFLICT DO NOTHING also absorbs the compound
            // (series_source_id, source_chapter_id) uniqueness, which is how
            // reuploads are rejected silently.
            let result = sqlx::query(
                r#"
                INSERT INTO chapter_sources
                    (id, series_source_id, chapter_id, source_chapter_id,
                     chapter_url, is_available, detected_at)
                VALUES ($1, $2, $3, $4, $5, TRUE, COALESCE($6, NOW()))
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(source_id.as_uuid())
            .bind(chapter_id)
            .bind(&chapter.source_chapter_id)
            .bind(&chapter.url)
            .bind(chapter.detected_at)
            .execute(&mut *tx)
            .await?;

            if chapter_is_new && result.rows_affected() > 0 {
                outcome.new_chapters.push(NewChapter {
                    chapter_id: ChapterId(chapter_id),
                    number: chapter.chapter_number,
                });
            }
        }

        sqlx::query(
            r#"
            UPDATE series_sources
            SET last_success_at = NOW(),
                next_check_at = $2,
                consecutive_failures = 0,
                source_status = 'active'
            WHERE id = $1
            "#,
        )
        .bind(source_id.as_uuid())
        .bind(next_check_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE library_entries
            SET sync_status = 'healthy'
            WHERE preferred_source_id = $1 AND sync_status <> 'healthy'
            "#,
        )
        .bind(source_id.as_uuid())
        .execute(&mut *tx)
        .await?;

        if !outcome.new_chapters.is_empty() {
            sqlx::query(
                r#"
                UPDATE series
                SET last_chapter_at = NOW(), last_activity_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(series_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            source = %source_id,
            seen = outcome.chapters_seen,
            new = outcome.new_chapters.len(),
            "sync applied"
        );
        Ok(outcome)
    }

    async fn record_permanent_failure(&self, source_id: SeriesSourceId) -> Result<SourceStatus> {
        let mut tx = self.pool.begin().await?;
        let status: String = sqlx::query_scalar(
            r#"
            UPDATE series_sources
            SET consecutive_failures = consecutive_failures + 1,
                source_status = CASE
                    WHEN consecutive_failures + 1 >= $2 THEN 'broken'
                    ELSE source_status
                END
            WHERE id = $1
            RETURNING source_status
            "#,
        )
        .bind(source_id.as_uuid())
        .bind(self.broken_threshold)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("series source {source_id}")))?;
        let status: SourceStatus = status.parse()?;

        // Entry-visible health only degrades after repeated failures; the
        // user never sees a single upstream hiccup.
        let entry_health = match status {
            SourceStatus::Broken => "failed",
            SourceStatus::Active => "degraded",
        };
        sqlx::query(
            r#"
            UPDATE library_entries
            SET sync_status = $2
            WHERE preferred_source_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(source_id.as_uuid())
        .bind(entry_health)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(status)
    }
}

#[async_trait]
impl SourceInfoProvider for PostgresSyncStore {
    async fn last_success_at(&self, id: SeriesSourceId) -> Result<Option<DateTime<Utc>>> {
        let row: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT last_success_at FROM series_sources WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        // A missing row is not an error for admission.
        Ok(row.flatten())
    }
}
