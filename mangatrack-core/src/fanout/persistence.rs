//! Fan-out storage: subscriber selection with the pre-emptive read filter,
//! and the skip-duplicates notification insert.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::Result;
use crate::types::{CatalogTier, ChapterId, SeriesId, UserId};

/// A library subscriber that survived the read filter.
#[derive(Clone, Copy, Debug)]
pub struct Subscriber {
    pub user_id: UserId,
    pub premium: bool,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait FanoutRepository: Send + Sync {
    /// Subscribed users (status reading/planning, not soft-deleted) who have
    /// not already read the chapter. One round trip; the read filter is a
    /// NOT-EXISTS subquery.
    async fn subscribers_for(
        &self,
        series_id: SeriesId,
        chapter_id: ChapterId,
    ) -> Result<Vec<Subscriber>>;

    /// Insert notifications for a batch, skipping (user, chapter) duplicates
    /// silently. Returns rows actually inserted.
    async fn insert_notifications(
        &self,
        series_id: SeriesId,
        chapter_id: ChapterId,
        user_ids: &[UserId],
    ) -> Result<u64>;

    async fn series_tier(&self, series_id: SeriesId) -> Result<Option<CatalogTier>>;
}

#[derive(Clone, Debug)]
pub struct PostgresFanoutStore {
    pool: PgPool,
}

impl PostgresFanoutStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FanoutRepository for PostgresFanoutStore {
    async fn subscribers_for(
        &self,
        series_id: SeriesId,
        chapter_id: ChapterId,
    ) -> Result<Vec<Subscriber>> {
        let rows = sqlx::query(
            r#"
            SELECT le.user_id, u.is_premium
            FROM library_entries le
            JOIN users u ON u.id = le.user_id
            WHERE le.series_id = $1
              AND le.deleted_at IS NULL
              AND le.status IN ('reading', 'planning')
              AND NOT EXISTS (
                  SELECT 1
                  FROM user_chapter_reads r
                  WHERE r.user_id = le.user_id
                    AND r.chapter_id = $2
                    AND r.is_read
              )
            "#,
        )
        .bind(series_id.as_uuid())
        .bind(chapter_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let mut subscribers = Vec::with_capacity(rows.len());
        for row in rows {
            subscribers.push(Subscriber {
                user_id: UserId(row.try_get::<Uuid, _>("user_id")?),
                premium: row.try_get("is_premium")?,
            });
        }
        Ok(subscribers)
    }

    async fn insert_notifications(
        &self,
        series_id: SeriesId,
        chapter_id: ChapterId,
        user_ids: &[UserId],
    ) -> Result<u64> {
        if user_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = user_ids.iter().map(|id| id.as_uuid()).collect();
        let result = sqlx::query(
            r#"
            INSERT INTO notifications (user_id, series_id, chapter_id, created_at)
            SELECT unnest($1::uuid[]), $2, $3, NOW()
            ON CONFLICT (user_id, chapter_id) DO NOTHING
            "#,
        )
        .bind(&ids)
        .bind(series_id.as_uuid())
        .bind(chapter_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn series_tier(&self, series_id: SeriesId) -> Result<Option<CatalogTier>> {
        let tier: Option<Option<String>> =
            sqlx::query_scalar("SELECT tier FROM series WHERE id = $1 AND deleted_at IS NULL")
                .bind(series_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        tier.flatten().as_deref().map(str::parse).transpose()
    }
}
