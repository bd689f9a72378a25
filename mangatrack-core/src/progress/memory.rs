//! In-memory progress store mirroring the Postgres transaction envelope.
//! Backs engine and reconciler tests and single-node development runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::Result;
use crate::types::{
    ChapterId, EntryId, LibraryEntry, LibraryStatus, MetadataStatus, SeriesId, SyncHealth,
    UserChapterRead, UserId,
};

use super::achievements::{chapters_read_unlocks, ACHIEVEMENT_XP};
use super::engine::{ProgressCommand, ProgressOutcome, ProgressStore};
use super::trust::{apply_penalty, ViolationKind, TRUST_MAX};
use super::xp::{add_xp, level_for_xp};

#[derive(Clone, Debug, Default)]
struct UserAccount {
    xp: i64,
    season_xp: i64,
    current_season: Option<String>,
    chapters_read: i64,
    streak_days: u32,
    trust_score: Option<f64>,
    achievements: Vec<String>,
    migration_bonus_granted: bool,
    violations: Vec<(ViolationKind, DateTime<Utc>)>,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<EntryId, LibraryEntry>,
    chapters: HashMap<SeriesId, Vec<(ChapterId, f64)>>,
    reads: HashMap<(UserId, ChapterId), UserChapterRead>,
    accounts: HashMap<UserId, UserAccount>,
}

#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    state: Mutex<StoreState>,
}

impl InMemoryProgressStore {
    pub fn seed_entry(
        &self,
        user_id: UserId,
        series_id: SeriesId,
        status: LibraryStatus,
    ) -> EntryId {
        let entry_id = EntryId::new();
        let entry = LibraryEntry {
            id: entry_id,
            user_id,
            series_id,
            source_url: "https://example.test/series".to_string(),
            source_name: "paperback".to_string(),
            status,
            last_read_chapter: 0.0,
            metadata_status: MetadataStatus::Enriched,
            sync_status: SyncHealth::Healthy,
            sync_priority: 0,
            preferred_source_id: None,
            deleted_at: None,
            updated_at: Utc::now(),
        };
        self.state
            .lock()
            .expect("store poisoned")
            .entries
            .insert(entry_id, entry);
        entry_id
    }

    pub fn seed_chapters(
        &self,
        series_id: SeriesId,
        chapters: impl IntoIterator<Item = (ChapterId, f64)>,
    ) {
        self.state
            .lock()
            .expect("store poisoned")
            .chapters
            .entry(series_id)
            .or_default()
            .extend(chapters);
    }

    pub fn set_streak_days(&self, user_id: UserId, days: u32) {
        self.state
            .lock()
            .expect("store poisoned")
            .accounts
            .entry(user_id)
            .or_default()
            .streak_days = days;
    }

    pub fn soft_delete_entry(&self, entry_id: EntryId) {
        if let Some(entry) = self
            .state
            .lock()
            .expect("store poisoned")
            .entries
            .get_mut(&entry_id)
        {
            entry.deleted_at = Some(Utc::now());
        }
    }

    pub fn chapters_read(&self, user_id: UserId) -> i64 {
        self.state
            .lock()
            .expect("store poisoned")
            .accounts
            .get(&user_id)
            .map(|account| account.chapters_read)
            .unwrap_or(0)
    }

    pub fn trust_score(&self, user_id: UserId) -> f64 {
        self.state
            .lock()
            .expect("store poisoned")
            .accounts
            .get(&user_id)
            .and_then(|account| account.trust_score)
            .unwrap_or(TRUST_MAX)
    }

    pub fn read_mark(&self, user_id: UserId, chapter_id: ChapterId) -> Option<UserChapterRead> {
        self.state
            .lock()
            .expect("store poisoned")
            .reads
            .get(&(user_id, chapter_id))
            .cloned()
    }

    pub fn unlocked_achievements(&self, user_id: UserId) -> Vec<String> {
        self.state
            .lock()
            .expect("store poisoned")
            .accounts
            .get(&user_id)
            .map(|account| account.achievements.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn apply_progress(
        &self,
        cmd: &ProgressCommand,
        xp_if_new: i64,
        season: &str,
    ) -> Result<ProgressOutcome> {
        let mut state = self.state.lock().expect("store poisoned");

        let entry = state
            .entries
            .get(&cmd.entry_id)
            .filter(|entry| entry.user_id == cmd.user_id && entry.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("library entry {}", cmd.entry_id)))?;

        let new_progress = cmd.chapter_number > entry.last_read_chapter;

        let targets: Vec<(ChapterId, f64)> = state
            .chapters
            .get(&entry.series_id)
            .map(|chapters| {
                chapters
                    .iter()
                    .filter(|(_, number)| *number <= cmd.chapter_number)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut chapters_marked = 0u64;
        let mut reads_inserted = 0u64;
        for (chapter_id, _) in &targets {
            let key = (cmd.user_id, *chapter_id);
            match state.reads.get_mut(&key) {
                Some(stored) => {
                    // LWW: an incoming update applies only when its
                    // timestamp is not older than the stored one.
                    if cmd.updated_at >= stored.updated_at {
                        stored.is_read = true;
                        stored.updated_at = cmd.updated_at;
                        chapters_marked += 1;
                    }
                }
                None => {
                    state.reads.insert(
                        key,
                        UserChapterRead {
                            user_id: cmd.user_id,
                            chapter_id: *chapter_id,
                            is_read: true,
                            updated_at: cmd.updated_at,
                        },
                    );
                    chapters_marked += 1;
                    reads_inserted += 1;
                }
            }
        }

        let entry = {
            let stored = state
                .entries
                .get_mut(&cmd.entry_id)
                .expect("entry checked above");
            if new_progress {
                stored.last_read_chapter = cmd.chapter_number;
                stored.updated_at = cmd.updated_at;
            }
            stored.clone()
        };

        let account = state.accounts.entry(cmd.user_id).or_default();
        let xp_before = account.xp;
        let xp_delta = if new_progress { xp_if_new } else { 0 };
        account.xp = add_xp(account.xp, xp_delta);
        let applied_delta = account.xp - xp_before;

        if applied_delta > 0 {
            if account.current_season.as_deref() == Some(season) {
                account.season_xp = add_xp(account.season_xp, applied_delta);
            } else {
                account.season_xp = applied_delta;
                account.current_season = Some(season.to_string());
            }
        }
        account.chapters_read += reads_inserted as i64;

        // Achievement pass: idempotent unlocks, XP only for fresh rows.
        for id in chapters_read_unlocks(account.chapters_read) {
            if !account.achievements.iter().any(|existing| existing == id) {
                account.achievements.push(id.to_string());
                account.xp = add_xp(account.xp, ACHIEVEMENT_XP);
            }
        }

        Ok(ProgressOutcome {
            entry,
            new_progress,
            chapters_marked,
            reads_inserted,
            xp_delta: applied_delta,
            xp_total: account.xp,
            previous_level: level_for_xp(xp_before),
            level: level_for_xp(account.xp),
            season: season.to_string(),
            season_xp: account.season_xp,
        })
    }

    async fn streak_days(&self, user_id: UserId) -> Result<u32> {
        Ok(self
            .state
            .lock()
            .expect("store poisoned")
            .accounts
            .get(&user_id)
            .map(|account| account.streak_days)
            .unwrap_or(0))
    }

    async fn recent_reads(&self, user_id: UserId, limit: i64) -> Result<Vec<DateTime<Utc>>> {
        let state = self.state.lock().expect("store poisoned");
        let mut stamps: Vec<DateTime<Utc>> = state
            .reads
            .values()
            .filter(|read| read.user_id == user_id && read.is_read)
            .map(|read| read.updated_at)
            .collect();
        stamps.sort_unstable_by(|a, b| b.cmp(a));
        stamps.truncate(limit.max(0) as usize);
        Ok(stamps)
    }

    async fn recent_speed_violations(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .expect("store poisoned")
            .accounts
            .get(&user_id)
            .map(|account| {
                account
                    .violations
                    .iter()
                    .filter(|(kind, at)| {
                        *at >= since
                            && matches!(
                                kind,
                                ViolationKind::SpeedRead | ViolationKind::BulkSpeedRead
                            )
                    })
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn record_violation(
        &self,
        user_id: UserId,
        kind: ViolationKind,
        at: DateTime<Utc>,
    ) -> Result<f64> {
        let mut state = self.state.lock().expect("store poisoned");
        let account = state.accounts.entry(user_id).or_default();
        account.violations.push((kind, at));
        let trust = apply_penalty(account.trust_score.unwrap_or(TRUST_MAX), kind);
        account.trust_score = Some(trust);
        Ok(trust)
    }

    async fn grant_migration_bonus(&self, user_id: UserId, amount: i64) -> Result<Option<i64>> {
        let mut state = self.state.lock().expect("store poisoned");
        let account = state.accounts.entry(user_id).or_default();
        if account.migration_bonus_granted {
            return Ok(None);
        }
        account.migration_bonus_granted = true;
        account.xp = add_xp(account.xp, amount);
        Ok(Some(amount))
    }

    async fn reconcile_chapters_read(&self, user_id: UserId) -> Result<i64> {
        let mut state = self.state.lock().expect("store poisoned");
        let actual = state
            .reads
            .values()
            .filter(|read| read.user_id == user_id && read.is_read)
            .count() as i64;
        state.accounts.entry(user_id).or_default().chapters_read = actual;
        Ok(actual)
    }
}
