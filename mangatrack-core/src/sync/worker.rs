//! Sync worker: drains the sync queue, fetches upstream listings, and
//! persists the diff. Same-source work is serialized by the job id; the
//! advisory lock in the persistence layer backstops that.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::queue::{
    ChapterDetectedJob, EnqueueOptions, JobId, JobPayload, JobPriority, JobRecord, QueueName,
    QueueService, SyncSourceJob,
};
use crate::Result;
use crate::types::{SourceStatus, SeriesSource};

use super::adapter::{AdapterError, AdapterRegistry};
use super::persistence::SyncRepository;
use super::schedule::SyncScheduleConfig;

/// Outcome of executing a single leased job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    Success,
    Retry { error: String },
    DeadLetter { error: String },
}

#[derive(Clone, Copy, Debug)]
pub struct SyncWorkerConfig {
    pub poll_interval: Duration,
    pub idle_backoff: Duration,
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            idle_backoff: Duration::from_secs(2),
        }
    }
}

pub struct SyncWorker {
    queue: Arc<dyn QueueService>,
    repo: Arc<dyn SyncRepository>,
    adapters: AdapterRegistry,
    schedule: SyncScheduleConfig,
    config: SyncWorkerConfig,
    worker_id: String,
}

impl fmt::Debug for SyncWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncWorker")
            .field("worker_id", &self.worker_id)
            .field("adapters", &self.adapters)
            .finish_non_exhaustive()
    }
}

impl SyncWorker {
    pub fn new(
        queue: Arc<dyn QueueService>,
        repo: Arc<dyn SyncRepository>,
        adapters: AdapterRegistry,
        schedule: SyncScheduleConfig,
        config: SyncWorkerConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            repo,
            adapters,
            schedule,
            config,
            worker_id: worker_id.into(),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(worker = %self.worker_id, "sync worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.tick(&cancel).await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.idle_backoff) => {}
                    }
                }
                Err(err) => {
                    warn!(worker = %self.worker_id, error = %err, "sync worker tick failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
        info!(worker = %self.worker_id, "sync worker stopped");
    }

    /// Claim and execute at most one job. Returns whether a job was found.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<bool> {
        let Some(job) = self
            .queue
            .dequeue(QueueName::SyncSource, &self.worker_id)
            .await?
        else {
            return Ok(false);
        };

        let status = match &job.payload {
            JobPayload::SyncSource(sync) => self.process(&job, sync, cancel).await,
            other => {
                warn!(job = %job.id, "unexpected payload on sync queue: {other:?}");
                DispatchStatus::DeadLetter {
                    error: "unexpected payload kind".to_string(),
                }
            }
        };

        match status {
            DispatchStatus::Success => {
                self.queue.complete(QueueName::SyncSource, &job.id).await?;
            }
            DispatchStatus::Retry { error } => {
                self.queue
                    .fail(QueueName::SyncSource, &job.id, &error, true)
                    .await?;
            }
            DispatchStatus::DeadLetter { error } => {
                self.queue
                    .fail(QueueName::SyncSource, &job.id, &error, false)
                    .await?;
            }
        }
        Ok(true)
    }

    async fn process(
        &self,
        job: &JobRecord,
        sync: &SyncSourceJob,
        cancel: &CancellationToken,
    ) -> DispatchStatus {
        let source = match self.repo.load_source(sync.series_source_id).await {
            Ok(Some(source)) => source,
            Ok(None) => {
                // The source was unlinked while queued; nothing to do.
                debug!(job = %job.id, "series source vanished, dropping job");
                return DispatchStatus::Success;
            }
            Err(err) => return self.classify(err),
        };

        let Some(adapter) = self.adapters.get(&source.source_name) else {
            return DispatchStatus::DeadLetter {
                error: format!("no adapter registered for source {}", source.source_name),
            };
        };

        let chapters = match adapter.list_chapters(&source, cancel.clone()).await {
            Ok(chapters) => chapters,
            Err(err) => return self.handle_adapter_error(&source, err).await,
        };

        let tier = match self.repo.series_tier(source.series_id).await {
            Ok(tier) => tier,
            Err(err) => return self.classify(err),
        };
        let next_check_at = self.schedule.next_check_at(tier, chrono::Utc::now());

        let outcome = match self
            .repo
            .apply_sync(source.id, &chapters, next_check_at)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => return self.classify(err),
        };

        for chapter in &outcome.new_chapters {
            let enqueue = self
                .queue
                .enqueue(
                    JobId::chapter_detected(source.series_id, chapter.chapter_id),
                    JobPayload::ChapterDetected(ChapterDetectedJob {
                        series_id: source.series_id,
                        chapter_id: chapter.chapter_id,
                        series_source_id: source.id,
                        chapter_number: chapter.number,
                        detected_at: chrono::Utc::now(),
                    }),
                    EnqueueOptions {
                        priority: Some(JobPriority::P2),
                        ..Default::default()
                    },
                )
                .await;
            if let Err(err) = enqueue {
                // The chapter row is already persisted; a retry re-runs the
                // idempotent diff and the next sweep re-detects regardless.
                return self.classify(err);
            }
        }

        debug!(
            job = %job.id,
            seen = outcome.chapters_seen,
            new = outcome.new_chapters.len(),
            "sync job complete"
        );
        DispatchStatus::Success
    }

    async fn handle_adapter_error(
        &self,
        source: &SeriesSource,
        err: AdapterError,
    ) -> DispatchStatus {
        match err {
            AdapterError::Permanent(message) => {
                match self.repo.record_permanent_failure(source.id).await {
                    Ok(SourceStatus::Broken) => {
                        warn!(source = %source.id, "source marked broken after repeated permanent failures");
                    }
                    Ok(SourceStatus::Active) => {}
                    Err(err) => {
                        warn!(source = %source.id, error = %err, "failed to record permanent failure");
                    }
                }
                DispatchStatus::DeadLetter { error: message }
            }
            AdapterError::RateLimited { .. } => DispatchStatus::Retry {
                error: "upstream rate limited".to_string(),
            },
            AdapterError::Aborted => DispatchStatus::Retry {
                error: "fetch aborted".to_string(),
            },
            AdapterError::Transient(message) => DispatchStatus::Retry { error: message },
        }
    }

    fn classify(&self, err: CoreError) -> DispatchStatus {
        if err.is_retryable() {
            DispatchStatus::Retry {
                error: err.to_string(),
            }
        } else {
            DispatchStatus::DeadLetter {
                error: err.to_string(),
            }
        }
    }
}
