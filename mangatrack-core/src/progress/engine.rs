//! Progress engine: validation and XP policy around the store's atomic
//! transaction envelope. Anti-abuse signals are recorded on the side and
//! never fail the primary write.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::CoreError;
use crate::Result;
use crate::types::{EntryId, LibraryEntry, UserId};

use super::trust::{
    classify_violation, is_suspicious_read, TrustConfig, ViolationCooldowns, ViolationKind,
};
use super::xp::{migration_bonus, season_for, streak_bonus, XP_PER_CHAPTER};

/// One progress write as received from the API or the replay reconciler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressCommand {
    pub user_id: UserId,
    pub entry_id: EntryId,
    pub chapter_number: f64,
    /// Client-supplied LWW timestamp.
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressOutcome {
    pub entry: LibraryEntry,
    /// Whether this call moved `last_read_chapter` forward.
    pub new_progress: bool,
    /// Read rows marked by this call (inserted or flipped).
    pub chapters_marked: u64,
    /// Read rows that did not exist before; this is what the chapters_read
    /// counter moves by.
    pub reads_inserted: u64,
    pub xp_delta: i64,
    pub xp_total: i64,
    pub previous_level: u32,
    pub level: u32,
    pub season: String,
    pub season_xp: i64,
}

/// Storage seam for the progress transaction envelope.
///
/// `apply_progress` runs the whole write atomically: lock the entry by
/// id+user (rejecting soft-deleted rows), decide newness under the lock,
/// mark chapters 1..N read in one statement, and move counters only when
/// `xp_if_new` applies. Achievement work happens inside the transaction but
/// its failure is contained, never propagated.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn apply_progress(
        &self,
        cmd: &ProgressCommand,
        xp_if_new: i64,
        season: &str,
    ) -> Result<ProgressOutcome>;

    async fn streak_days(&self, user_id: UserId) -> Result<u32>;

    /// Latest read timestamps, newest first.
    async fn recent_reads(&self, user_id: UserId, limit: i64) -> Result<Vec<DateTime<Utc>>>;

    /// Speed-class violations recorded since the cutoff.
    async fn recent_speed_violations(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<u64>;

    /// Record a violation and return the resulting trust score.
    async fn record_violation(
        &self,
        user_id: UserId,
        kind: ViolationKind,
        at: DateTime<Utc>,
    ) -> Result<f64>;

    /// Insert-where-not-exists migration bonus grant; `Some(amount)` when
    /// this call actually granted it.
    async fn grant_migration_bonus(&self, user_id: UserId, amount: i64) -> Result<Option<i64>>;

    /// Recompute `chapters_read` from the read rows, correcting drift.
    async fn reconcile_chapters_read(&self, user_id: UserId) -> Result<i64>;
}

pub struct ProgressEngine {
    store: Arc<dyn ProgressStore>,
    trust: TrustConfig,
    cooldowns: Mutex<ViolationCooldowns>,
}

impl fmt::Debug for ProgressEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressEngine")
            .field("trust", &self.trust)
            .finish_non_exhaustive()
    }
}

impl ProgressEngine {
    pub fn new(store: Arc<dyn ProgressStore>, trust: TrustConfig) -> Self {
        Self {
            store,
            trust,
            cooldowns: Mutex::new(ViolationCooldowns::default()),
        }
    }

    /// Mark progress up to `chapter_number`, awarding XP at most once per
    /// call and only for forward movement.
    pub async fn mark_progress(&self, cmd: ProgressCommand) -> Result<ProgressOutcome> {
        if !cmd.chapter_number.is_finite() || cmd.chapter_number < 0.0 {
            return Err(CoreError::Validation(format!(
                "chapter number out of range: {}",
                cmd.chapter_number
            )));
        }

        let streak = match self.store.streak_days(cmd.user_id).await {
            Ok(days) => days,
            Err(err) => {
                warn!(user = %cmd.user_id, error = %err, "streak lookup failed, no bonus this call");
                0
            }
        };
        let xp_if_new = XP_PER_CHAPTER + streak_bonus(streak);
        let season = season_for(cmd.updated_at);

        let outcome = self.store.apply_progress(&cmd, xp_if_new, &season).await?;

        if let (Some(read_time), Some(pages)) = (cmd.read_time_seconds, cmd.pages) {
            if is_suspicious_read(read_time, pages) {
                self.record_suspicious(cmd.user_id, cmd.updated_at).await;
            }
        }

        Ok(outcome)
    }

    /// Record the one-time migration bonus sized from the imported chapter
    /// count. Returns the amount granted (zero when already granted or
    /// nothing was imported).
    pub async fn grant_migration_bonus(
        &self,
        user_id: UserId,
        imported_chapters: i64,
    ) -> Result<i64> {
        let amount = migration_bonus(imported_chapters);
        if amount == 0 {
            return Ok(0);
        }
        Ok(self
            .store
            .grant_migration_bonus(user_id, amount)
            .await?
            .unwrap_or(0))
    }

    pub async fn reconcile_chapters_read(&self, user_id: UserId) -> Result<i64> {
        self.store.reconcile_chapters_read(user_id).await
    }

    /// Soft signal path. Violations never block reads or cancel XP, so
    /// every failure here is logged and swallowed.
    async fn record_suspicious(&self, user_id: UserId, now: DateTime<Utc>) {
        let reads = match self.store.recent_reads(user_id, 8).await {
            Ok(reads) => reads,
            Err(err) => {
                warn!(user = %user_id, error = %err, "recent-read lookup failed, skipping violation");
                return;
            }
        };
        let bulk_window = ChronoDuration::from_std(self.trust.bulk_window)
            .unwrap_or_else(|_| ChronoDuration::minutes(5));
        let speed_violations = match self
            .store
            .recent_speed_violations(user_id, now - bulk_window)
            .await
        {
            Ok(count) => count as usize,
            Err(err) => {
                warn!(user = %user_id, error = %err, "violation lookup failed, assuming none");
                0
            }
        };

        let kind = classify_violation(&self.trust, &reads, speed_violations);
        let should_record = self
            .cooldowns
            .lock()
            .expect("cooldown state poisoned")
            .should_record(user_id, kind, now, self.trust.cooldown);
        if !should_record {
            return;
        }

        match self.store.record_violation(user_id, kind, now).await {
            Ok(trust) => {
                debug!(user = %user_id, kind = kind.as_str(), trust, "trust violation recorded");
            }
            Err(err) => {
                warn!(user = %user_id, kind = kind.as_str(), error = %err, "violation write failed");
            }
        }
    }
}
