use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::ids::{ChapterId, EntryId, SeriesId, SeriesSourceId, UserId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryStatus {
    Reading,
    Planning,
    Completed,
    Paused,
    Dropped,
}

impl LibraryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LibraryStatus::Reading => "reading",
            LibraryStatus::Planning => "planning",
            LibraryStatus::Completed => "completed",
            LibraryStatus::Paused => "paused",
            LibraryStatus::Dropped => "dropped",
        }
    }

    /// Statuses that subscribe the user to new-chapter fan-out.
    pub fn is_subscribed(&self) -> bool {
        matches!(self, LibraryStatus::Reading | LibraryStatus::Planning)
    }
}

impl fmt::Display for LibraryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LibraryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reading" => Ok(LibraryStatus::Reading),
            "planning" => Ok(LibraryStatus::Planning),
            "completed" => Ok(LibraryStatus::Completed),
            "paused" => Ok(LibraryStatus::Paused),
            "dropped" => Ok(LibraryStatus::Dropped),
            other => Err(CoreError::Validation(format!("unknown library status: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataStatus {
    Pending,
    Enriched,
    Unavailable,
    Failed,
}

impl MetadataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataStatus::Pending => "pending",
            MetadataStatus::Enriched => "enriched",
            MetadataStatus::Unavailable => "unavailable",
            MetadataStatus::Failed => "failed",
        }
    }
}

impl FromStr for MetadataStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MetadataStatus::Pending),
            "enriched" => Ok(MetadataStatus::Enriched),
            "unavailable" => Ok(MetadataStatus::Unavailable),
            "failed" => Ok(MetadataStatus::Failed),
            other => Err(CoreError::Validation(format!("unknown metadata status: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncHealth {
    Healthy,
    Degraded,
    Failed,
}

impl SyncHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncHealth::Healthy => "healthy",
            SyncHealth::Degraded => "degraded",
            SyncHealth::Failed => "failed",
        }
    }
}

impl FromStr for SyncHealth {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(SyncHealth::Healthy),
            "degraded" => Ok(SyncHealth::Degraded),
            "failed" => Ok(SyncHealth::Failed),
            other => Err(CoreError::Validation(format!("unknown sync health: {other}"))),
        }
    }
}

/// A user's subscription to a series through a specific source.
///
/// `source_url` and `source_name` are non-empty (CHECK constraints back this
/// up). Reads filter soft-deleted rows unless they explicitly opt in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub id: EntryId,
    pub user_id: UserId,
    pub series_id: SeriesId,
    pub source_url: String,
    pub source_name: String,
    pub status: LibraryStatus,
    pub last_read_chapter: f64,
    pub metadata_status: MetadataStatus,
    pub sync_status: SyncHealth,
    pub sync_priority: i32,
    pub preferred_source_id: Option<SeriesSourceId>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Per-(user, chapter) read mark, LWW on `updated_at`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserChapterRead {
    pub user_id: UserId,
    pub chapter_id: ChapterId,
    pub is_read: bool,
    pub updated_at: DateTime<Utc>,
}

/// At most one per (user, chapter); the fan-out insert skips duplicates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: UserId,
    pub series_id: SeriesId,
    pub chapter_id: ChapterId,
    pub created_at: DateTime<Utc>,
}
