use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Mutex;

use crate::error::CoreError;
use crate::Result;
use crate::types::WorkerFailure;

use super::job::{JobCounts, JobId, JobPayload, JobRecord, JobState, QueueName};
use super::retry::RetryConfig;
use super::service::{EnqueueOptions, EnqueueOutcome, FailureOutcome, QueueService};

/// In-memory queue twin used by tests and single-node development runs.
/// Mirrors the Postgres implementation's coalescing and retry semantics.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    jobs: DashMap<QueueName, Vec<JobRecord>>,
    failures: Mutex<Vec<WorkerFailure>>,
    retry: RetryConfig,
}

impl InMemoryQueue {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            jobs: DashMap::new(),
            failures: Mutex::new(Vec::new()),
            retry,
        }
    }

    /// Force a queue depth for admission tests: fills the queue with inert
    /// waiting jobs.
    #[cfg(test)]
    pub fn seed_depth(&self, queue: QueueName, payload: JobPayload, depth: usize) {
        let now = Utc::now();
        let mut rows = self.jobs.entry(queue).or_default();
        for index in 0..depth {
            rows.push(JobRecord {
                id: JobId(format!("seed-{index}")),
                queue,
                payload: payload.clone(),
                priority: super::job::JobPriority::P3,
                state: JobState::Waiting,
                attempts: 0,
                max_attempts: self.retry.max_attempts as i16,
                available_at: now,
                last_error: None,
                created_at: now,
                updated_at: now,
            });
        }
    }
}

#[async_trait]
impl QueueService for InMemoryQueue {
    async fn enqueue(
        &self,
        id: JobId,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome> {
        let queue = payload.queue();
        let now = Utc::now();
        let priority = options.priority.unwrap_or(super::job::JobPriority::P2);
        let (state, available_at) = match options.delay {
            Some(delay) => (
                JobState::Delayed,
                now + ChronoDuration::from_std(delay)
                    .map_err(|e| CoreError::Internal(format!("enqueue delay out of range: {e}")))?,
            ),
            None => (JobState::Waiting, now),
        };

        let mut rows = self.jobs.entry(queue).or_default();
        if let Some(existing) = rows.iter_mut().find(|job| job.id == id) {
            if existing.state.is_open() {
                existing.priority = existing.priority.elevate(priority);
                existing.updated_at = now;
                return Ok(EnqueueOutcome::Coalesced);
            }
            // A terminally-failed row is replaced by the fresh request.
            existing.payload = payload;
            existing.priority = priority;
            existing.state = state;
            existing.attempts = 0;
            existing.available_at = available_at;
            existing.last_error = None;
            existing.updated_at = now;
            return Ok(EnqueueOutcome::Accepted);
        }

        rows.push(JobRecord {
            id,
            queue,
            payload,
            priority,
            state,
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(self.retry.max_attempts) as i16,
            available_at,
            last_error: None,
            created_at: now,
            updated_at: now,
        });
        Ok(EnqueueOutcome::Accepted)
    }

    async fn counts(&self, queue: QueueName) -> Result<JobCounts> {
        let mut counts = JobCounts::default();
        if let Some(rows) = self.jobs.get(&queue) {
            for job in rows.iter() {
                match job.state {
                    JobState::Waiting => counts.waiting += 1,
                    JobState::Delayed => counts.delayed += 1,
                    JobState::Active => counts.active += 1,
                    JobState::Failed => counts.failed += 1,
                    JobState::Completed => {}
                }
            }
        }
        Ok(counts)
    }

    async fn dequeue(&self, queue: QueueName, _worker_id: &str) -> Result<Option<JobRecord>> {
        let now = Utc::now();
        let Some(mut rows) = self.jobs.get_mut(&queue) else {
            return Ok(None);
        };
        let candidate = rows
            .iter_mut()
            .filter(|job| {
                matches!(job.state, JobState::Waiting | JobState::Delayed)
                    && job.available_at <= now
            })
            .min_by_key(|job| (job.priority, job.available_at, job.created_at));
        match candidate {
            Some(job) => {
                job.state = JobState::Active;
                job.updated_at = now;
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, queue: QueueName, id: &JobId) -> Result<()> {
        if let Some(mut rows) = self.jobs.get_mut(&queue) {
            rows.retain(|job| &job.id != id);
        }
        Ok(())
    }

    async fn fail(
        &self,
        queue: QueueName,
        id: &JobId,
        error: &str,
        retryable: bool,
    ) -> Result<FailureOutcome> {
        let now = Utc::now();
        let mut rows = self
            .jobs
            .get_mut(&queue)
            .ok_or_else(|| CoreError::NotFound(format!("queue {queue} is empty")))?;
        let job = rows
            .iter_mut()
            .find(|job| &job.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("job {id} not found in {queue}")))?;

        job.attempts += 1;
        job.last_error = Some(error.to_string());
        job.updated_at = now;

        if retryable && job.attempts < job.max_attempts {
            let delay = self.retry.delay_for_attempt(job.attempts as u16);
            job.state = JobState::Delayed;
            job.available_at = now
                + ChronoDuration::from_std(delay)
                    .map_err(|e| CoreError::Internal(format!("backoff out of range: {e}")))?;
            return Ok(FailureOutcome::Retry { delay });
        }

        job.state = JobState::Failed;
        let failure = WorkerFailure {
            queue_name: queue.as_str().to_string(),
            job_id: job.id.as_str().to_string(),
            error_message: error.to_string(),
            attempts_made: i32::from(job.attempts),
            payload: serde_json::to_value(&job.payload)?,
        };
        self.failures
            .lock()
            .expect("failure log poisoned")
            .push(failure);
        Ok(FailureOutcome::DeadLetter)
    }

    async fn remove(&self, queue: QueueName, id: &JobId) -> Result<bool> {
        if let Some(mut rows) = self.jobs.get_mut(&queue) {
            let before = rows.len();
            rows.retain(|job| &job.id != id);
            return Ok(rows.len() != before);
        }
        Ok(false)
    }

    async fn find_state(&self, queue: QueueName, id: &JobId) -> Result<Option<JobState>> {
        Ok(self
            .jobs
            .get(&queue)
            .and_then(|rows| rows.iter().find(|job| &job.id == id).map(|job| job.state)))
    }

    async fn prune_failed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut pruned = 0u64;
        for mut entry in self.jobs.iter_mut() {
            let before = entry.len();
            entry.retain(|job| !(job.state == JobState::Failed && job.updated_at < older_than));
            pruned += (before - entry.len()) as u64;
        }
        Ok(pruned)
    }

    async fn recent_failures(&self, limit: usize) -> Result<Vec<WorkerFailure>> {
        let failures = self.failures.lock().expect("failure log poisoned");
        let start = failures.len().saturating_sub(limit);
        Ok(failures[start..].to_vec())
    }
}
