//! Durable job queue: content-derived ids, priority bands, retry with
//! backoff, and the dead-letter semantic (one worker-failure row, written on
//! the terminal attempt only).

pub mod job;
pub mod memory;
pub mod persistence;
pub mod retry;
pub mod service;

pub use job::{
    ChapterDetectedJob, DeliveryBatchJob, ImportEntry, ImportJobPayload, JobCounts, JobId,
    JobPayload, JobPriority, JobRecord, JobState, QueueName, SeriesResolutionJob, SyncSourceJob,
    ALL_QUEUES,
};
pub use memory::InMemoryQueue;
pub use persistence::PostgresQueue;
pub use retry::RetryConfig;
pub use service::{EnqueueOptions, EnqueueOutcome, FailureOutcome, QueueService};
