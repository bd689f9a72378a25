//! Login lockout over the append-only attempt log.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;

#[cfg(test)]
use mockall::automock;

use crate::error::CoreError;
use crate::ratelimit::FixedWindowLimiter;
use crate::Result;
use crate::types::LoginAttempt;

#[derive(Clone, Copy, Debug)]
pub struct LockoutPolicy {
    pub max_failures: i64,
    pub window: Duration,
    pub retry_after: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window: Duration::from_secs(15 * 60),
            retry_after: Duration::from_secs(900),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoginAttemptStore: Send + Sync {
    async fn record(&self, attempt: &LoginAttempt) -> Result<()>;

    /// Failures for the email or the IP since the cutoff, with the scan
    /// bounded by `limit` so the check stays O(1).
    async fn recent_failures(
        &self,
        email: &str,
        ip: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<i64>;

    /// Drop rows past the retention horizon (24h is all the lockout needs).
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

#[derive(Clone, Debug)]
pub struct PostgresLoginAttemptStore {
    pool: PgPool,
}

impl PostgresLoginAttemptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LoginAttemptStore for PostgresLoginAttemptStore {
    async fn record(&self, attempt: &LoginAttempt) -> Result<()> {
        sqlx::query(
            "INSERT INTO login_attempts (email, ip, success, attempted_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&attempt.email)
        .bind(&attempt.ip)
        .bind(attempt.success)
        .bind(attempt.attempted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_failures(
        &self,
        email: &str,
        ip: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)::bigint FROM (
                SELECT 1
                FROM login_attempts
                WHERE (email = $1 OR ip = $2)
                  AND NOT success
                  AND attempted_at >= $3
                LIMIT $4
            ) bounded
            "#,
        )
        .bind(email)
        .bind(ip)
        .bind(since)
        .bind(limit)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM login_attempts WHERE attempted_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Lockout probes per email within the probe window. The check itself is a
/// signal an attacker can farm for account enumeration, so it gets its own
/// budget.
const PROBE_LIMIT: u32 = 30;
const PROBE_WINDOW: Duration = Duration::from_secs(60);

/// Rate-limited wrapper around [`check_lockout`] for callers exposing the
/// check directly.
pub async fn check_lockout_guarded(
    limiter: &FixedWindowLimiter,
    store: &dyn LoginAttemptStore,
    policy: LockoutPolicy,
    email: &str,
    ip: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let probe = limiter
        .check(&format!("lockout-probe:{email}"), PROBE_LIMIT, PROBE_WINDOW)
        .await;
    if !probe.allowed {
        return Err(CoreError::rate_limited(
            "too many lockout checks",
            probe.reset_after(),
        ));
    }
    check_lockout(store, policy, email, ip, now).await
}

/// Reject when the email-or-ip failure count inside the window reaches the
/// policy cap. The rejection carries Retry-After.
pub async fn check_lockout(
    store: &dyn LoginAttemptStore,
    policy: LockoutPolicy,
    email: &str,
    ip: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let window = ChronoDuration::from_std(policy.window)
        .map_err(|e| CoreError::Internal(format!("lockout window out of range: {e}")))?;
    let failures = store
        .recent_failures(email, ip, now - window, policy.max_failures)
        .await?;
    if failures >= policy.max_failures {
        return Err(CoreError::rate_limited(
            "too many failed login attempts, try again in 15 minutes",
            policy.retry_after,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Append-only in-memory attempt log with the bounded-scan contract.
    #[derive(Default)]
    struct MemoryAttemptStore {
        attempts: Mutex<Vec<LoginAttempt>>,
    }

    #[async_trait]
    impl LoginAttemptStore for MemoryAttemptStore {
        async fn record(&self, attempt: &LoginAttempt) -> Result<()> {
            self.attempts
                .lock()
                .expect("attempt log poisoned")
                .push(attempt.clone());
            Ok(())
        }

        async fn recent_failures(
            &self,
            email: &str,
            ip: &str,
            since: DateTime<Utc>,
            limit: i64,
        ) -> Result<i64> {
            Ok(self
                .attempts
                .lock()
                .expect("attempt log poisoned")
                .iter()
                .filter(|attempt| {
                    (attempt.email == email || attempt.ip == ip)
                        && !attempt.success
                        && attempt.attempted_at >= since
                })
                .take(limit.max(0) as usize)
                .count() as i64)
        }

        async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64> {
            let mut attempts = self.attempts.lock().expect("attempt log poisoned");
            let before = attempts.len();
            attempts.retain(|attempt| attempt.attempted_at >= older_than);
            Ok((before - attempts.len()) as u64)
        }
    }

    async fn fail(store: &MemoryAttemptStore, email: &str, ip: &str, at: DateTime<Utc>) {
        store
            .record(&LoginAttempt {
                email: email.to_string(),
                ip: ip.to_string(),
                success: false,
                attempted_at: at,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exactly_five_failures_in_window_locks() {
        let store = MemoryAttemptStore::default();
        let now = Utc::now();
        for minutes in 0..5 {
            fail(&store, "a@example.test", "1.2.3.4", now - ChronoDuration::minutes(minutes)).await;
        }
        let err = check_lockout(&store, LockoutPolicy::default(), "a@example.test", "1.2.3.4", now)
            .await
            .unwrap_err();
        let CoreError::RateLimited { retry_after, .. } = err else {
            panic!("expected rate-limited lockout");
        };
        assert_eq!(retry_after, Duration::from_secs(900));
    }

    #[tokio::test]
    async fn four_in_window_plus_one_outside_does_not_lock() {
        let store = MemoryAttemptStore::default();
        let now = Utc::now();
        for minutes in 0..4 {
            fail(&store, "a@example.test", "1.2.3.4", now - ChronoDuration::minutes(minutes)).await;
        }
        // Fifth failure is past the 15-minute window.
        fail(&store, "a@example.test", "1.2.3.4", now - ChronoDuration::minutes(16)).await;
        assert!(
            check_lockout(&store, LockoutPolicy::default(), "a@example.test", "1.2.3.4", now)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn lockout_probe_is_itself_rate_limited_per_email() {
        let store = MemoryAttemptStore::default();
        let limiter = FixedWindowLimiter::in_memory();
        let now = Utc::now();
        let email = format!("probe-{}@example.test", uuid::Uuid::new_v4());

        let mut rejected = 0;
        for _ in 0..40 {
            let result = check_lockout_guarded(
                &limiter,
                &store,
                LockoutPolicy::default(),
                &email,
                "8.8.8.8",
                now,
            )
            .await;
            if result.is_err() {
                rejected += 1;
            }
        }
        assert_eq!(rejected, 10, "probes past the budget are rejected");
    }

    #[tokio::test]
    async fn ip_failures_count_against_other_emails() {
        let store = MemoryAttemptStore::default();
        let now = Utc::now();
        for _ in 0..5 {
            fail(&store, "other@example.test", "9.9.9.9", now).await;
        }
        assert!(
            check_lockout(&store, LockoutPolicy::default(), "fresh@example.test", "9.9.9.9", now)
                .await
                .is_err()
        );
    }
}
