use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gatekeeper::AdmissionReason;
use crate::types::{ChapterId, EntryId, ImportJobId, SeriesId, SeriesSourceId, UserId};

/// Content-derived job identifier. Two enqueues producing the same id
/// coalesce into one queued job, which is what serializes same-resource work.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn sync_source(id: SeriesSourceId) -> Self {
        Self(format!("sync-{id}"))
    }

    pub fn series_resolution(id: EntryId) -> Self {
        Self(format!("retry-resolution-{id}"))
    }

    pub fn chapter_detected(series: SeriesId, chapter: ChapterId) -> Self {
        Self(format!("notify-{series}-{chapter}"))
    }

    pub fn delivery_batch(series: SeriesId, chapter: ChapterId, index: usize) -> Self {
        Self(format!("deliver-{series}-{chapter}-{index}"))
    }

    pub fn import(id: ImportJobId) -> Self {
        Self(format!("import-{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One durable queue per concern.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    SyncSource,
    SeriesResolution,
    Notification,
    NotificationDelivery,
    NotificationDeliveryPremium,
    Import,
}

pub const ALL_QUEUES: [QueueName; 6] = [
    QueueName::SyncSource,
    QueueName::SeriesResolution,
    QueueName::Notification,
    QueueName::NotificationDelivery,
    QueueName::NotificationDeliveryPremium,
    QueueName::Import,
];

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::SyncSource => "sync-source",
            QueueName::SeriesResolution => "series-resolution",
            QueueName::Notification => "notification",
            QueueName::NotificationDelivery => "notification-delivery",
            QueueName::NotificationDeliveryPremium => "notification-delivery-premium",
            QueueName::Import => "import",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority bands. Lower integer encodings dequeue first; P1 is reserved.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum JobPriority {
    P0 = 1,
    P1 = 2,
    P2 = 3,
    P3 = 4,
}

impl JobPriority {
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(JobPriority::P0),
            2 => Some(JobPriority::P1),
            3 => Some(JobPriority::P2),
            4 => Some(JobPriority::P3),
            _ => None,
        }
    }

    /// Keep the more urgent of two bands when duplicate enqueues coalesce.
    pub fn elevate(self, other: JobPriority) -> JobPriority {
        if other.as_i16() < self.as_i16() { other } else { self }
    }
}

/// Queue-visible job states.
///
/// `waiting -> active -> (completed | failed)`, with retryable failures passing
/// through `delayed` (backoff) before returning to the waiting pool. `failed`
/// is terminal; the worker-failure row is written at that transition only.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// States that make a duplicate enqueue coalesce instead of insert.
    pub fn is_open(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed | JobState::Active)
    }
}

/// Structured payload per queue concern.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum JobPayload {
    SyncSource(SyncSourceJob),
    SeriesResolution(SeriesResolutionJob),
    ChapterDetected(ChapterDetectedJob),
    DeliverBatch(DeliveryBatchJob),
    Import(ImportJobPayload),
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::SyncSource(_) => QueueName::SyncSource,
            JobPayload::SeriesResolution(_) => QueueName::SeriesResolution,
            JobPayload::ChapterDetected(_) => QueueName::Notification,
            JobPayload::DeliverBatch(job) if job.premium => {
                QueueName::NotificationDeliveryPremium
            }
            JobPayload::DeliverBatch(_) => QueueName::NotificationDelivery,
            JobPayload::Import(_) => QueueName::Import,
        }
    }
}

/// Crawl one series source: fetch upstream, diff, persist, emit events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncSourceJob {
    pub series_source_id: SeriesSourceId,
    pub reason: AdmissionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

/// Re-run metadata resolution for a library entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeriesResolutionJob {
    pub entry_id: EntryId,
    pub user_id: UserId,
}

/// First appearance of a chapter number anywhere; input to the fan-out
/// coalesce stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChapterDetectedJob {
    pub series_id: SeriesId,
    pub chapter_id: ChapterId,
    pub series_source_id: SeriesSourceId,
    pub chapter_number: f64,
    pub detected_at: DateTime<Utc>,
}

/// One fixed-size slice of the surviving subscribers for a chapter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliveryBatchJob {
    pub series_id: SeriesId,
    pub chapter_id: ChapterId,
    pub user_ids: Vec<UserId>,
    pub premium: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportJobPayload {
    pub job_id: ImportJobId,
    pub user_id: UserId,
    pub entries: Vec<ImportEntry>,
}

/// One validated row of a library import payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportEntry {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(default)]
    pub last_read_chapter: f64,
}

/// Envelope stored in the queue for each job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub priority: JobPriority,
    pub state: JobState,
    pub attempts: i16,
    pub max_attempts: i16,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Depth snapshot for one queue. The gatekeeper's notion of "total queued"
/// is waiting + delayed.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn total_queued(&self) -> u64 {
        self.waiting + self.delayed
    }
}
