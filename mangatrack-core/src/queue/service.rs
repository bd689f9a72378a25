use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;
use crate::types::WorkerFailure;

use super::job::{JobCounts, JobId, JobPayload, JobPriority, JobRecord, JobState, QueueName};

/// Options attached to an enqueue call.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnqueueOptions {
    pub priority: Option<JobPriority>,
    pub delay: Option<Duration>,
    pub max_attempts: Option<u16>,
}

/// Whether the enqueue created a new job or merged into an open duplicate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnqueueOutcome {
    Accepted,
    Coalesced,
}

/// What the queue did with a reported failure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailureOutcome {
    /// Re-queued with backoff; the job returns to the waiting pool.
    Retry { delay: Duration },
    /// Terminal. A worker-failure row was recorded.
    DeadLetter,
}

/// Durable priority queue shared by the sync, fan-out, and import workers.
///
/// Job ids are content-derived, so enqueueing the same logical work twice
/// coalesces; completed jobs are removed, failed jobs are kept for inspection
/// until the retention sweep prunes them.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Add a job, coalescing with an open duplicate. A duplicate keeps the
    /// more urgent priority of the two requests.
    async fn enqueue(
        &self,
        id: JobId,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome>;

    /// Depth snapshot for one queue.
    async fn counts(&self, queue: QueueName) -> Result<JobCounts>;

    /// Claim the most urgent eligible job, flipping it to `active`.
    async fn dequeue(&self, queue: QueueName, worker_id: &str) -> Result<Option<JobRecord>>;

    /// Mark an active job completed and drop it from the queue.
    async fn complete(&self, queue: QueueName, id: &JobId) -> Result<()>;

    /// Report a failed attempt. Retryable failures below the attempt cap are
    /// re-queued with backoff; anything else dead-letters.
    async fn fail(
        &self,
        queue: QueueName,
        id: &JobId,
        error: &str,
        retryable: bool,
    ) -> Result<FailureOutcome>;

    /// Remove a job in any state. Returns whether a row existed.
    async fn remove(&self, queue: QueueName, id: &JobId) -> Result<bool>;

    /// Current state of a job, if present.
    async fn find_state(&self, queue: QueueName, id: &JobId) -> Result<Option<JobState>>;

    /// Drop terminally-failed jobs older than the cutoff. Returns rows pruned.
    async fn prune_failed(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Terminal failure records, newest last. Test/observability hook.
    async fn recent_failures(&self, limit: usize) -> Result<Vec<WorkerFailure>>;
}
