//! Postgres-backed durable queue.
//!
//! One `jobs` table keyed on (queue_name, job_id) holds every queue; the
//! content-derived job id is what makes duplicate enqueues coalesce.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};

use crate::error::{map_contention, CoreError};
use crate::Result;
use crate::types::WorkerFailure;

use super::job::{JobCounts, JobId, JobPayload, JobPriority, JobRecord, JobState, QueueName};
use super::retry::RetryConfig;
use super::service::{EnqueueOptions, EnqueueOutcome, FailureOutcome, QueueService};

#[derive(Clone, Debug)]
pub struct PostgresQueue {
    pool: PgPool,
    retry: RetryConfig,
}

impl PostgresQueue {
    pub async fn new(pool: PgPool) -> Result<Self> {
        Self::new_with_retry(pool, RetryConfig::default()).await
    }

    pub async fn new_with_retry(pool: PgPool, retry: RetryConfig) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| CoreError::Internal(format!("queue failed Postgres health check: {e}")))?;
        info!("queue service connected to Postgres");
        Ok(Self { pool, retry })
    }

    fn parse_state(raw: &str) -> Result<JobState> {
        match raw {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(CoreError::Internal(format!("unknown job state in storage: {other}"))),
        }
    }

    fn record_from_row(row: &PgRow) -> Result<JobRecord> {
        let queue_raw: String = row.try_get("queue_name")?;
        let queue = queue_from_str(&queue_raw)?;
        let state_raw: String = row.try_get("state")?;
        let priority_raw: i16 = row.try_get("priority")?;
        let payload_raw: serde_json::Value = row.try_get("payload")?;
        Ok(JobRecord {
            id: JobId(row.try_get("job_id")?),
            queue,
            payload: serde_json::from_value(payload_raw)?,
            priority: JobPriority::from_i16(priority_raw).ok_or_else(|| {
                CoreError::Internal(format!("unknown job priority in storage: {priority_raw}"))
            })?,
            state: Self::parse_state(&state_raw)?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            available_at: row.try_get("available_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn queue_from_str(raw: &str) -> Result<QueueName> {
    super::job::ALL_QUEUES
        .into_iter()
        .find(|queue| queue.as_str() == raw)
        .ok_or_else(|| CoreError::Internal(format!("unknown queue in storage: {raw}")))
}

#[async_trait]
impl QueueService for PostgresQueue {
    async fn enqueue(
        &self,
        id: JobId,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome> {
        let queue = payload.queue();
        let priority = options.priority.unwrap_or(JobPriority::P2);
        let max_attempts = options.max_attempts.unwrap_or(self.retry.max_attempts) as i16;
        let available_at = match options.delay {
            Some(delay) => {
                Utc::now()
                    + ChronoDuration::from_std(delay).map_err(|e| {
                        CoreError::Internal(format!("enqueue delay out of range: {e}"))
                    })?
            }
            None => Utc::now(),
        };
        let state = if options.delay.is_some() { JobState::Delayed } else { JobState::Waiting };
        let payload_json = serde_json::to_value(&payload)?;

        let mut tx = self.pool.begin().await?;
        let existing: Option<(String, i16)> = sqlx::query_as(
            r#"
            SELECT state, priority
            FROM jobs
            WHERE queue_name = $1 AND job_id = $2
            FOR UPDATE
            "#,
        )
        .bind(queue.as_str())
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO jobs
                        (queue_name, job_id, payload, priority, state, attempts,
                         max_attempts, available_at, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, 0, $6, $7, NOW(), NOW())
                    "#,
                )
                .bind(queue.as_str())
                .bind(id.as_str())
                .bind(&payload_json)
                .bind(priority.as_i16())
                .bind(state.as_str())
                .bind(max_attempts)
                .bind(available_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_contention(e, "enqueue"))?;
                EnqueueOutcome::Accepted
            }
            Some((stored_state, stored_priority)) => {
                if Self::parse_state(&stored_state)?.is_open() {
                    let elevated = JobPriority::from_i16(stored_priority)
                        .unwrap_or(priority)
                        .elevate(priority);
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET priority = $3, updated_at = NOW()
                        WHERE queue_name = $1 AND job_id = $2
                        "#,
                    )
                    .bind(queue.as_str())
                    .bind(id.as_str())
                    .bind(elevated.as_i16())
                    .execute(&mut *tx)
                    .await?;
                    debug!(queue = %queue, job = %id, "duplicate enqueue coalesced");
                    EnqueueOutcome::Coalesced
                } else {
                    // Terminal row: the fresh request replaces it.
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET payload = $3, priority = $4, state = $5, attempts = 0,
                            max_attempts = $6, available_at = $7, last_error = NULL,
                            updated_at = NOW()
                        WHERE queue_name = $1 AND job_id = $2
                        "#,
                    )
                    .bind(queue.as_str())
                    .bind(id.as_str())
                    .bind(&payload_json)
                    .bind(priority.as_i16())
                    .bind(state.as_str())
                    .bind(max_attempts)
                    .bind(available_at)
                    .execute(&mut *tx)
                    .await?;
                    EnqueueOutcome::Accepted
                }
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn counts(&self, queue: QueueName) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT state, COUNT(*)::bigint
            FROM jobs
            WHERE queue_name = $1
            GROUP BY state
            "#,
        )
        .bind(queue.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = JobCounts::default();
        for (state, count) in rows {
            let count = count.max(0) as u64;
            match Self::parse_state(&state)? {
                JobState::Waiting => counts.waiting = count,
                JobState::Delayed => counts.delayed = count,
                JobState::Active => counts.active = count,
                JobState::Failed => counts.failed = count,
                JobState::Completed => {}
            }
        }
        Ok(counts)
    }

    async fn dequeue(&self, queue: QueueName, worker_id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'active', updated_at = NOW()
            WHERE (queue_name, job_id) IN (
                SELECT queue_name, job_id
                FROM jobs
                WHERE queue_name = $1
                  AND state IN ('waiting', 'delayed')
                  AND available_at <= NOW()
                ORDER BY priority ASC, available_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING queue_name, job_id, payload, priority, state, attempts,
                      max_attempts, available_at, last_error, created_at, updated_at
            "#,
        )
        .bind(queue.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let record = Self::record_from_row(&row)?;
                debug!(queue = %queue, job = %record.id, worker = worker_id, "job leased");
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, queue: QueueName, id: &JobId) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE queue_name = $1 AND job_id = $2")
            .bind(queue.as_str())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(
        &self,
        queue: QueueName,
        id: &JobId,
        error: &str,
        retryable: bool,
    ) -> Result<FailureOutcome> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1, last_error = $3, updated_at = NOW()
            WHERE queue_name = $1 AND job_id = $2
            RETURNING attempts, max_attempts, payload
            "#,
        )
        .bind(queue.as_str())
        .bind(id.as_str())
        .bind(error)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("job {id} not found in {queue}")))?;

        let attempts: i16 = row.try_get("attempts")?;
        let max_attempts: i16 = row.try_get("max_attempts")?;
        let payload: serde_json::Value = row.try_get("payload")?;

        if retryable && attempts < max_attempts {
            let delay = self.retry.delay_for_attempt(attempts as u16);
            sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'delayed',
                    available_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond'
                WHERE queue_name = $1 AND job_id = $2
                "#,
            )
            .bind(queue.as_str())
            .bind(id.as_str())
            .bind(delay.as_millis() as i64)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(FailureOutcome::Retry { delay });
        }

        sqlx::query(
            "UPDATE jobs SET state = 'failed' WHERE queue_name = $1 AND job_id = $2",
        )
        .bind(queue.as_str())
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO worker_failures (queue_name, job_id, error_message, attempts_made, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(queue.as_str())
        .bind(id.as_str())
        .bind(error)
        .bind(i32::from(attempts))
        .bind(&payload)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        warn!(queue = %queue, job = %id, attempts, "job dead-lettered");
        Ok(FailureOutcome::DeadLetter)
    }

    async fn remove(&self, queue: QueueName, id: &JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE queue_name = $1 AND job_id = $2")
            .bind(queue.as_str())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_state(&self, queue: QueueName, id: &JobId) -> Result<Option<JobState>> {
        let state: Option<String> = sqlx::query_scalar(
            "SELECT state FROM jobs WHERE queue_name = $1 AND job_id = $2",
        )
        .bind(queue.as_str())
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        state.as_deref().map(Self::parse_state).transpose()
    }

    async fn prune_failed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE state = 'failed' AND updated_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn recent_failures(&self, limit: usize) -> Result<Vec<WorkerFailure>> {
        let rows = sqlx::query(
            r#"
            SELECT queue_name, job_id, error_message, attempts_made, payload
            FROM worker_failures
            ORDER BY id DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut failures = Vec::with_capacity(rows.len());
        for row in rows.into_iter().rev() {
            failures.push(WorkerFailure {
                queue_name: row.try_get("queue_name")?,
                job_id: row.try_get("job_id")?,
                error_message: row.try_get("error_message")?,
                attempts_made: row.try_get("attempts_made")?,
                payload: row.try_get("payload")?,
            });
        }
        Ok(failures)
    }
}
