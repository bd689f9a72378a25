//! Postgres progress store: the atomic transaction envelope behind every
//! progress write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::error::{map_contention, CoreError};
use crate::Result;
use crate::types::{
    EntryId, LibraryEntry, SeriesId, SeriesSourceId, UserId,
};

use super::achievements::{chapters_read_unlocks, ACHIEVEMENT_XP};
use super::engine::{ProgressCommand, ProgressOutcome, ProgressStore};
use super::trust::ViolationKind;
use super::xp::{add_xp, level_for_xp, MAX_XP};

#[derive(Clone, Debug)]
pub struct PostgresProgressStore {
    pool: PgPool,
}

impl PostgresProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Bulk form of the counter reconciliation, run by the periodic
    /// maintenance task. Returns how many users drifted.
    pub async fn reconcile_all_chapters_read(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE users u
            SET chapters_read = counted.total
            FROM (
                SELECT user_id, COUNT(*)::bigint AS total
                FROM user_chapter_reads
                WHERE is_read
                GROUP BY user_id
            ) counted
            WHERE counted.user_id = u.id
              AND u.chapters_read <> counted.total
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub(crate) fn entry_from_row(row: &PgRow) -> Result<LibraryEntry> {
        let status: String = row.try_get("status")?;
        let metadata_status: String = row.try_get("metadata_status")?;
        let sync_status: String = row.try_get("sync_status")?;
        Ok(LibraryEntry {
            id: EntryId(row.try_get::<Uuid, _>("id")?),
            user_id: UserId(row.try_get::<Uuid, _>("user_id")?),
            series_id: SeriesId(row.try_get::<Uuid, _>("series_id")?),
            source_url: row.try_get("source_url")?,
            source_name: row.try_get("source_name")?,
            status: status.parse()?,
            last_read_chapter: row.try_get("last_read_chapter")?,
            metadata_status: metadata_status.parse()?,
            sync_status: sync_status.parse()?,
            sync_priority: row.try_get("sync_priority")?,
            preferred_source_id: row
                .try_get::<Option<Uuid>, _>("preferred_source_id")?
                .map(SeriesSourceId),
            deleted_at: row.try_get("deleted_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Achievement pass inside the progress transaction. Runs under a
    /// savepoint so a failure here rolls back only itself; the primary
    /// progress write must never be lost to a bonus computation.
    async fn check_achievements(
        tx: &mut Transaction<'_, Postgres>,
        user_id: UserId,
        chapters_read_total: i64,
    ) -> Result<()> {
        sqlx::query("SAVEPOINT achievements")
            .execute(&mut **tx)
            .await?;

        let result: Result<()> = async {
            let mut inserted = 0i64;
            for achievement_id in chapters_read_unlocks(chapters_read_total) {
                let row: Option<String> = sqlx::query_scalar(
                    r#"
                    INSERT INTO user_achievements (user_id, achievement_id, season_id, unlocked_at)
                    VALUES ($1, $2, '', NOW())
                    ON CONFLICT (user_id, achievement_id, season_id) DO NOTHING
                    RETURNING achievement_id
                    "#,
                )
                .bind(user_id.as_uuid())
                .bind(achievement_id)
                .fetch_optional(&mut **tx)
                .await?;
                if row.is_some() {
                    inserted += 1;
                }
            }
            if inserted > 0 {
                sqlx::query("UPDATE users SET xp = LEAST(xp + $2, $3) WHERE id = $1")
                    .bind(user_id.as_uuid())
                    .bind(inserted * ACHIEVEMENT_XP)
                    .bind(MAX_XP)
                    .execute(&mut **tx)
                    .await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("RELEASE SAVEPOINT achievements")
                    .execute(&mut **tx)
                    .await?;
            }
            Err(err) => {
                warn!(user = %user_id, error = %err, "achievement check failed, contained");
                sqlx::query("ROLLBACK TO SAVEPOINT achievements")
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for PostgresProgressStore {
    async fn apply_progress(
        &self,
        cmd: &ProgressCommand,
        xp_if_new: i64,
        season: &str,
    ) -> Result<ProgressOutcome> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET LOCAL statement_timeout = 15000")
            .execute(&mut *tx)
            .await?;

        let entry_row = sqlx::query(
            r#"
            SELECT id, user_id, series_id, source_url, source_name, status,
                   last_read_chapter, metadata_status, sync_status, sync_priority,
                   preferred_source_id, deleted_at, updated_at
            FROM library_entries
            WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
            FOR UPDATE NOWAIT
            "#,
        )
        .bind(cmd.entry_id.as_uuid())
        .bind(cmd.user_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_contention(e, "lock library entry"))?
        .ok_or_else(|| CoreError::NotFound(format!("library entry {}", cmd.entry_id)))?;

        let mut entry = Self::entry_from_row(&entry_row)?;
        let new_progress = cmd.chapter_number > entry.last_read_chapter;

        // Mark chapters 1..=N read in one statement; LWW keeps concurrent
        // writers from regressing a newer mark.
        let marked_rows = sqlx::query(
            r#"
            INSERT INTO user_chapter_reads (user_id, chapter_id, is_read, updated_at)
            SELECT $1, c.id, TRUE, $2
            FROM chapters c
            WHERE c.series_id = $3 AND c.number <= $4
            ON CONFLICT (user_id, chapter_id) DO UPDATE
                SET is_read = TRUE, updated_at = EXCLUDED.updated_at
                WHERE user_chapter_reads.updated_at <= EXCLUDED.updated_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(cmd.user_id.as_uuid())
        .bind(cmd.updated_at)
        .bind(entry.series_id.as_uuid())
        .bind(cmd.chapter_number)
        .fetch_all(&mut *tx)
        .await?;

        let chapters_marked = marked_rows.len() as u64;
        let mut reads_inserted = 0u64;
        for row in &marked_rows {
            if row.try_get::<bool, _>("inserted")? {
                reads_inserted += 1;
            }
        }

        if new_progress {
            sqlx::query(
                r#"
                UPDATE library_entries
                SET last_read_chapter = $2, updated_at = GREATEST(updated_at, $3)
                WHERE id = $1
                "#,
            )
            .bind(cmd.entry_id.as_uuid())
            .bind(cmd.chapter_number)
            .bind(cmd.updated_at)
            .execute(&mut *tx)
            .await?;
            entry.last_read_chapter = cmd.chapter_number;
            entry.updated_at = entry.updated_at.max(cmd.updated_at);
        }

        let user_row = sqlx::query(
            "SELECT xp, season_xp, current_season, chapters_read FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(cmd.user_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("user {}", cmd.user_id)))?;

        let xp_before: i64 = user_row.try_get("xp")?;
        let season_xp_before: i64 = user_row.try_get("season_xp")?;
        let current_season: Option<String> = user_row.try_get("current_season")?;
        let chapters_read_before: i64 = user_row.try_get("chapters_read")?;

        let xp_after = if new_progress {
            add_xp(xp_before, xp_if_new)
        } else {
            xp_before
        };
        let applied_delta = xp_after - xp_before;
        let (season_xp_after, season_after) = if applied_delta > 0 {
            if current_season.as_deref() == Some(season) {
                (add_xp(season_xp_before, applied_delta), season.to_string())
            } else {
                (applied_delta, season.to_string())
            }
        } else {
            (
                season_xp_before,
                current_season.unwrap_or_else(|| season.to_string()),
            )
        };
        let chapters_read_after = chapters_read_before + reads_inserted as i64;

        sqlx::query(
            r#"
            UPDATE users
            SET xp = $2, season_xp = $3, current_season = $4, chapters_read = $5
            WHERE id = $1
            "#,
        )
        .bind(cmd.user_id.as_uuid())
        .bind(xp_after)
        .bind(season_xp_after)
        .bind(&season_after)
        .bind(chapters_read_after)
        .execute(&mut *tx)
        .await?;

        if applied_delta > 0 {
            sqlx::query(
                r#"
                INSERT INTO audit_logs (event, status, user_id, metadata, created_at)
                VALUES ('progress.read', 'ok', $1, $2, NOW())
                "#,
            )
            .bind(cmd.user_id.as_uuid())
            .bind(serde_json::json!({
                "entry_id": cmd.entry_id,
                "chapter_number": cmd.chapter_number,
                "xp_delta": applied_delta,
                "device_id": cmd.device_id,
            }))
            .execute(&mut *tx)
            .await?;
        }

        Self::check_achievements(&mut tx, cmd.user_id, chapters_read_after).await?;

        // Achievement XP may have moved the total; read it back for the
        // response payload.
        let xp_total: i64 = sqlx::query_scalar("SELECT xp FROM users WHERE id = $1")
            .bind(cmd.user_id.as_uuid())
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(ProgressOutcome {
            entry,
            new_progress,
            chapters_marked,
            reads_inserted,
            xp_delta: applied_delta,
            xp_total,
            previous_level: level_for_xp(xp_before),
            level: level_for_xp(xp_total),
            season: season_after,
            season_xp: season_xp_after,
        })
    }

    async fn streak_days(&self, user_id: UserId) -> Result<u32> {
        let days: Option<i32> = sqlx::query_scalar("SELECT streak_days FROM users WHERE id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(days.unwrap_or(0).max(0) as u32)
    }

    async fn recent_reads(&self, user_id: UserId, limit: i64) -> Result<Vec<DateTime<Utc>>> {
        let stamps = sqlx::query_scalar(
            r#"
            SELECT updated_at
            FROM user_chapter_reads
            WHERE user_id = $1 AND is_read
            ORDER BY updated_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(stamps)
    }

    async fn recent_speed_violations(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)::bigint
            FROM trust_violations
            WHERE user_id = $1
              AND kind IN ('speed_read', 'bulk_speed_read')
              AND created_at >= $2
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn record_violation(
        &self,
        user_id: UserId,
        kind: ViolationKind,
        at: DateTime<Utc>,
    ) -> Result<f64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO trust_violations (user_id, kind, created_at) VALUES ($1, $2, $3)")
            .bind(user_id.as_uuid())
            .bind(kind.as_str())
            .bind(at)
            .execute(&mut *tx)
            .await?;
        let trust: f64 = sqlx::query_scalar(
            r#"
            UPDATE users
            SET trust_score = GREATEST(0.5, LEAST(1.0, trust_score) - $2)
            WHERE id = $1
            RETURNING trust_score
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(kind.penalty())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(trust)
    }

    async fn grant_migration_bonus(&self, user_id: UserId, amount: i64) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;
        // Concurrent requests collapse to at most one grant.
        let granted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO xp_transactions (user_id, source, amount, created_at)
            SELECT $1, 'migration_bonus', $2, NOW()
            WHERE NOT EXISTS (
                SELECT 1 FROM xp_transactions
                WHERE user_id = $1 AND source = 'migration_bonus'
            )
            RETURNING amount
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(granted) = granted {
            sqlx::query("UPDATE users SET xp = LEAST(xp + $2, $3) WHERE id = $1")
                .bind(user_id.as_uuid())
                .bind(granted)
                .bind(MAX_XP)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(granted)
    }

    async fn reconcile_chapters_read(&self, user_id: UserId) -> Result<i64> {
        // Counted from the read rows, never summed from last_read_chapter.
        let total: i64 = sqlx::query_scalar(
            r#"
            UPDATE users
            SET chapters_read = (
                SELECT COUNT(*)::bigint
                FROM user_chapter_reads
                WHERE user_id = $1 AND is_read
            )
            WHERE id = $1
            RETURNING chapters_read
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }
}
