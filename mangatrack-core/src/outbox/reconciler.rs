//! Server-side replay reconciliation: actions arrive sorted by client
//! timestamp and each returns an individual verdict.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::progress::{
    resolve_entry_update, IncomingEntryState, ProgressCommand, ProgressEngine, StoredEntryState,
};
use crate::progress::achievements::series_completed_unlocks;
use crate::progress::xp::{MAX_XP, XP_SERIES_COMPLETED};
use crate::Result;
use crate::types::{EntryId, LibraryEntry, LibraryStatus, UserId};

use super::action::{ActionPayload, LibraryAddPayload, OutboxAction};
use super::client::{ActionResult, ReplayStatus};

/// Storage seam for the non-progress reconciliation writes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReconcilerStore: Send + Sync {
    async fn load_entry(
        &self,
        user_id: UserId,
        entry_id: EntryId,
        include_deleted: bool,
    ) -> Result<Option<LibraryEntry>>;

    /// Upsert by (user, series). An existing soft-deleted row is revived,
    /// not reset.
    async fn upsert_entry(
        &self,
        user_id: UserId,
        payload: &LibraryAddPayload,
        timestamp: DateTime<Utc>,
    ) -> Result<EntryId>;

    async fn write_entry_state(
        &self,
        entry_id: EntryId,
        status: LibraryStatus,
        progress: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;

    /// Idempotent soft delete; `false` when no row existed.
    async fn soft_delete_entry(&self, user_id: UserId, entry_id: EntryId) -> Result<bool>;

    /// Last-writer-wins settings blob.
    async fn update_settings(
        &self,
        user_id: UserId,
        settings: &serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;

    /// Completion bonus + finisher achievements on a transition into
    /// `completed`.
    async fn award_series_completed(&self, user_id: UserId) -> Result<()>;
}

pub struct Reconciler {
    store: Arc<dyn ReconcilerStore>,
    progress: Arc<ProgressEngine>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(store: Arc<dyn ReconcilerStore>, progress: Arc<ProgressEngine>) -> Self {
        Self { store, progress }
    }

    /// Apply a replay batch for one authenticated user. Actions run in
    /// client-timestamp order with the action id as tiebreak; each yields
    /// its own status so one poisoned action cannot wedge the queue.
    pub async fn apply(&self, user_id: UserId, mut actions: Vec<OutboxAction>) -> Vec<ActionResult> {
        actions.sort_by(|a, b| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut results = Vec::with_capacity(actions.len());
        for action in &actions {
            let status = self.apply_one(user_id, action).await;
            debug!(action = %action.id, ?status, "replay action reconciled");
            results.push(ActionResult {
                id: action.id,
                status,
            });
        }
        results
    }

    async fn apply_one(&self, user_id: UserId, action: &OutboxAction) -> ReplayStatus {
        match &action.payload {
            ActionPayload::ChapterRead(read) => {
                let command = ProgressCommand {
                    user_id,
                    entry_id: read.entry_id,
                    chapter_number: read.chapter_number,
                    updated_at: action.timestamp(),
                    device_id: Some(action.device_id.clone()),
                    read_time_seconds: read.read_time_seconds,
                    pages: read.pages,
                };
                match self.progress.mark_progress(command).await {
                    Ok(_) => ReplayStatus::Success,
                    Err(err) => self.verdict(err, "chapter read"),
                }
            }
            ActionPayload::LibraryUpdate(update) => {
                let entry = match self
                    .store
                    .load_entry(user_id, update.entry_id, false)
                    .await
                {
                    Ok(Some(entry)) => entry,
                    Ok(None) => return ReplayStatus::Permanent,
                    Err(err) => return self.verdict(err, "load entry"),
                };

                let resolved = resolve_entry_update(
                    StoredEntryState {
                        status: entry.status,
                        progress: entry.last_read_chapter,
                        updated_at: entry.updated_at,
                    },
                    IncomingEntryState {
                        status: update.status,
                        progress: update.progress,
                        last_updated: action.timestamp(),
                    },
                );

                if let Err(err) = self
                    .store
                    .write_entry_state(
                        entry.id,
                        resolved.status,
                        resolved.progress,
                        action.timestamp(),
                    )
                    .await
                {
                    return self.verdict(err, "write entry");
                }

                if entry.status != LibraryStatus::Completed
                    && resolved.status == LibraryStatus::Completed
                {
                    if let Err(err) = self.store.award_series_completed(user_id).await {
                        // Bonus failures never fail the primary write.
                        warn!(user = %user_id, error = %err, "completion bonus failed");
                    }
                }
                ReplayStatus::Success
            }
            ActionPayload::LibraryAdd(add) => {
                match self.store.upsert_entry(user_id, add, action.timestamp()).await {
                    Ok(_) => ReplayStatus::Success,
                    Err(err) => self.verdict(err, "library add"),
                }
            }
            ActionPayload::LibraryDelete(delete) => {
                match self.store.soft_delete_entry(user_id, delete.entry_id).await {
                    // A missing row means the delete already happened.
                    Ok(_) => ReplayStatus::Success,
                    Err(err) => self.verdict(err, "library delete"),
                }
            }
            ActionPayload::SettingUpdate(settings) => {
                match self
                    .store
                    .update_settings(user_id, &settings.settings, action.timestamp())
                    .await
                {
                    Ok(()) => ReplayStatus::Success,
                    Err(err) => self.verdict(err, "settings update"),
                }
            }
        }
    }

    fn verdict(&self, err: crate::error::CoreError, what: &str) -> ReplayStatus {
        let status = ReplayStatus::from(err);
        if status == ReplayStatus::Permanent {
            debug!(what, "replay action permanently rejected");
        }
        status
    }
}

#[derive(Clone, Debug)]
pub struct PostgresReconcilerStore {
    pool: PgPool,
}

impl PostgresReconcilerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReconcilerStore for PostgresReconcilerStore {
    async fn load_entry(
        &self,
        user_id: UserId,
        entry_id: EntryId,
        include_deleted: bool,
    ) -> Result<Option<LibraryEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, series_id, source_url, source_name, status,
                   last_read_chapter, metadata_status, sync_status, sync_priority,
                   preferred_source_id, deleted_at, updated_at
            FROM library_entries
            WHERE id = $1 AND user_id = $2
              AND ($3 OR deleted_at IS NULL)
            "#,
        )
        .bind(entry_id.as_uuid())
        .bind(user_id.as_uuid())
        .bind(include_deleted)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(crate::progress::PostgresProgressStore::entry_from_row)
            .transpose()
    }

    async fn upsert_entry(
        &self,
        user_id: UserId,
        payload: &LibraryAddPayload,
        timestamp: DateTime<Utc>,
    ) -> Result<EntryId> {
        let status = payload.status.unwrap_or(LibraryStatus::Reading);
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO library_entries
                (id, user_id, series_id, source_url, source_name, status,
                 last_read_chapter, metadata_status, sync_status, sync_priority,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 0, 'pending', 'healthy', 0, $7, $7)
            ON CONFLICT (user_id, series_id) DO UPDATE
                SET deleted_at = NULL,
                    source_url = EXCLUDED.source_url,
                    source_name = EXCLUDED.source_name,
                    updated_at = GREATEST(library_entries.updated_at, EXCLUDED.updated_at)
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(user_id.as_uuid())
        .bind(payload.series_id.as_uuid())
        .bind(&payload.source_url)
        .bind(&payload.source_name)
        .bind(status.as_str())
        .bind(timestamp)
        .fetch_one(&self.pool)
        .await?;
        Ok(EntryId(id))
    }

    async fn write_entry_state(
        &self,
        entry_id: EntryId,
        status: LibraryStatus,
        progress: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE library_entries
            SET status = $2, last_read_chapter = $3,
                updated_at = GREATEST(updated_at, $4)
            WHERE id = $1
            "#,
        )
        .bind(entry_id.as_uuid())
        .bind(status.as_str())
        .bind(progress)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn soft_delete_entry(&self, user_id: UserId, entry_id: EntryId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE library_entries
            SET deleted_at = COALESCE(deleted_at, NOW())
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(entry_id.as_uuid())
        .bind(user_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_settings(
        &self,
        user_id: UserId,
        settings: &serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_settings (user_id, settings, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
                SET settings = EXCLUDED.settings, updated_at = EXCLUDED.updated_at
                WHERE user_settings.updated_at <= EXCLUDED.updated_at
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(settings)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn award_series_completed(&self, user_id: UserId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let completed: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)::bigint
            FROM library_entries
            WHERE user_id = $1 AND status = 'completed' AND deleted_at IS NULL
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE users SET xp = LEAST(xp + $2, $3) WHERE id = $1")
            .bind(user_id.as_uuid())
            .bind(XP_SERIES_COMPLETED)
            .bind(MAX_XP)
            .execute(&mut *tx)
            .await?;

        for achievement_id in series_completed_unlocks(completed) {
            sqlx::query(
                r#"
                INSERT INTO user_achievements (user_id, achievement_id, season_id, unlocked_at)
                VALUES ($1, $2, '', NOW())
                ON CONFLICT (user_id, achievement_id, season_id) DO NOTHING
                "#,
            )
            .bind(user_id.as_uuid())
            .bind(achievement_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::action::{ChapterReadPayload, LibraryDeletePayload, LibraryUpdatePayload};
    use crate::progress::{InMemoryProgressStore, TrustConfig};
    use crate::types::{ChapterId, SeriesId};
    use mockall::predicate::eq;

    fn engine_with(store: Arc<InMemoryProgressStore>) -> Arc<ProgressEngine> {
        Arc::new(ProgressEngine::new(store, TrustConfig::default()))
    }

    fn read_action(entry_id: EntryId, chapter: f64, ts_ms: i64) -> OutboxAction {
        OutboxAction::new(
            ActionPayload::ChapterRead(ChapterReadPayload {
                entry_id,
                chapter_number: chapter,
                read_time_seconds: None,
                pages: None,
            }),
            ts_ms,
            "device-a",
        )
    }

    #[tokio::test]
    async fn stale_chapter_read_is_an_idempotent_success() {
        let progress = Arc::new(InMemoryProgressStore::default());
        let user_id = UserId::new();
        let series_id = SeriesId::new();
        let entry_id = progress.seed_entry(user_id, series_id, LibraryStatus::Reading);
        let chapter_id = ChapterId::new();
        progress.seed_chapters(series_id, [(chapter_id, 1.0)]);

        let reconciler = Reconciler::new(
            Arc::new(MockReconcilerStore::new()),
            engine_with(progress.clone()),
        );

        let t2 = 2_000_000;
        let results = reconciler
            .apply(user_id, vec![read_action(entry_id, 1.0, t2)])
            .await;
        assert_eq!(results[0].status, ReplayStatus::Success);
        let stored = progress.read_mark(user_id, chapter_id).unwrap();
        let stored_at = stored.updated_at;

        // Replay an older mark for the same chapter: success, no change.
        let t1 = 1_000_000;
        let results = reconciler
            .apply(user_id, vec![read_action(entry_id, 1.0, t1)])
            .await;
        assert_eq!(results[0].status, ReplayStatus::Success);
        let unchanged = progress.read_mark(user_id, chapter_id).unwrap();
        assert_eq!(unchanged.updated_at, stored_at);
    }

    #[tokio::test]
    async fn applying_the_same_action_twice_is_idempotent() {
        let progress = Arc::new(InMemoryProgressStore::default());
        let user_id = UserId::new();
        let series_id = SeriesId::new();
        let entry_id = progress.seed_entry(user_id, series_id, LibraryStatus::Reading);
        progress.seed_chapters(series_id, (1..=5).map(|n| (ChapterId::new(), n as f64)));

        let reconciler = Reconciler::new(
            Arc::new(MockReconcilerStore::new()),
            engine_with(progress.clone()),
        );

        let action = read_action(entry_id, 5.0, 1_000_000);
        reconciler.apply(user_id, vec![action.clone()]).await;
        let after_first = progress.chapters_read(user_id);

        reconciler.apply(user_id, vec![action]).await;
        assert_eq!(progress.chapters_read(user_id), after_first);
    }

    #[tokio::test]
    async fn foreign_entry_read_is_permanent() {
        let progress = Arc::new(InMemoryProgressStore::default());
        let owner = UserId::new();
        let attacker = UserId::new();
        let series_id = SeriesId::new();
        let entry_id = progress.seed_entry(owner, series_id, LibraryStatus::Reading);

        let reconciler = Reconciler::new(
            Arc::new(MockReconcilerStore::new()),
            engine_with(progress),
        );
        let results = reconciler
            .apply(attacker, vec![read_action(entry_id, 1.0, 1_000)])
            .await;
        assert_eq!(results[0].status, ReplayStatus::Permanent);
    }

    #[tokio::test]
    async fn delete_of_missing_entry_is_success() {
        let mut store = MockReconcilerStore::new();
        let entry_id = EntryId::new();
        store
            .expect_soft_delete_entry()
            .with(mockall::predicate::always(), eq(entry_id))
            .returning(|_, _| Ok(false));

        let reconciler = Reconciler::new(
            Arc::new(store),
            engine_with(Arc::new(InMemoryProgressStore::default())),
        );
        let action = OutboxAction::new(
            ActionPayload::LibraryDelete(LibraryDeletePayload { entry_id }),
            1_000,
            "device-a",
        );
        let results = reconciler.apply(UserId::new(), vec![action]).await;
        assert_eq!(results[0].status, ReplayStatus::Success);
    }

    #[tokio::test]
    async fn completed_status_survives_stale_downgrade() {
        let mut store = MockReconcilerStore::new();
        let user_id = UserId::new();
        let entry_id = EntryId::new();
        let entry = LibraryEntry {
            id: entry_id,
            user_id,
            series_id: SeriesId::new(),
            source_url: "https://example.test/series/9".into(),
            source_name: "paperback".into(),
            status: LibraryStatus::Completed,
            last_read_chapter: 120.0,
            metadata_status: crate::types::MetadataStatus::Enriched,
            sync_status: crate::types::SyncHealth::Healthy,
            sync_priority: 0,
            preferred_source_id: None,
            deleted_at: None,
            updated_at: Utc::now(),
        };
        store
            .expect_load_entry()
            .returning(move |_, _, _| Ok(Some(entry.clone())));
        store
            .expect_write_entry_state()
            .withf(|_, status, progress, _| {
                *status == LibraryStatus::Completed && *progress == 120.0
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let reconciler = Reconciler::new(
            Arc::new(store),
            engine_with(Arc::new(InMemoryProgressStore::default())),
        );
        let action = OutboxAction::new(
            ActionPayload::LibraryUpdate(LibraryUpdatePayload {
                entry_id,
                status: Some(LibraryStatus::Reading),
                progress: Some(120.0),
            }),
            1_000,
            "device-a",
        );
        let results = reconciler.apply(user_id, vec![action]).await;
        assert_eq!(results[0].status, ReplayStatus::Success);
    }
}
