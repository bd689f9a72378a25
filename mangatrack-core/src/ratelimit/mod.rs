//! Distributed fixed-window rate limiting.
//!
//! The primary path is a shared Redis counter (`INCR` + `PEXPIRE`). When the
//! shared store is unreachable the limiter degrades to a bounded in-memory
//! window store pinned to process-global state, so a module reload never
//! resets counters. Every hit writes a fresh record rather than mutating the
//! stored one; the count survives past the limit so observers can see how
//! far over a client went.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Decision returned by the limiter.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Request count within the current window, including this hit.
    pub count: u64,
    pub remaining: u64,
    pub limit: u32,
    /// Epoch milliseconds at which the window resets.
    pub reset_at_ms: u64,
}

impl RateLimitDecision {
    pub fn reset_after(&self) -> Duration {
        let now = epoch_ms();
        Duration::from_millis(self.reset_at_ms.saturating_sub(now))
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn decision(count: u64, limit: u32, reset_at_ms: u64) -> RateLimitDecision {
    RateLimitDecision {
        allowed: count <= u64::from(limit),
        count,
        remaining: u64::from(limit).saturating_sub(count),
        limit,
        reset_at_ms,
    }
}

/// One fixed window. Replaced wholesale on every hit; never mutated in
/// place, which is what keeps the fallback correct under interleaved calls
/// (many allowed is not the same bug as one over-limit).
#[derive(Clone, Copy, Debug)]
struct WindowRecord {
    count: u64,
    reset_at_ms: u64,
}

/// Bounded in-memory fallback store.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    windows: Mutex<HashMap<String, WindowRecord>>,
}

/// Hard cap on tracked keys; beyond it the store evicts expired windows
/// first, then the window closest to reset.
const MAX_TRACKED_KEYS: usize = 10_000;

impl MemoryWindowStore {
    fn hit(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision {
        let now = epoch_ms();
        let mut windows = self.windows.lock().expect("window store poisoned");

        let fresh = match windows.get(key) {
            Some(record) if record.reset_at_ms > now => WindowRecord {
                count: record.count + 1,
                reset_at_ms: record.reset_at_ms,
            },
            _ => WindowRecord {
                count: 1,
                reset_at_ms: now + window.as_millis() as u64,
            },
        };

        if !windows.contains_key(key) && windows.len() >= MAX_TRACKED_KEYS {
            Self::evict(&mut windows, now);
        }
        windows.insert(key.to_string(), fresh);
        decision(fresh.count, limit, fresh.reset_at_ms)
    }

    fn evict(windows: &mut HashMap<String, WindowRecord>, now: u64) {
        let expired: Vec<String> = windows
            .iter()
            .filter(|(_, record)| record.reset_at_ms <= now)
            .map(|(key, _)| key.clone())
            .collect();
        if !expired.is_empty() {
            for key in expired {
                windows.remove(&key);
            }
            return;
        }
        if let Some(oldest) = windows
            .iter()
            .min_by_key(|(_, record)| record.reset_at_ms)
            .map(|(key, _)| key.clone())
        {
            windows.remove(&oldest);
        }
    }

    /// Raw stored count for a key, test/observability hook.
    pub fn stored_count(&self, key: &str) -> Option<u64> {
        self.windows
            .lock()
            .expect("window store poisoned")
            .get(key)
            .map(|record| record.count)
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().expect("window store poisoned").len()
    }
}

/// Process-global fallback store. Survives limiter reconstruction in every
/// environment, test included; lazily initialised on first use and never
/// torn down during normal operation.
pub fn global_window_store() -> &'static MemoryWindowStore {
    static STORE: OnceLock<MemoryWindowStore> = OnceLock::new();
    STORE.get_or_init(MemoryWindowStore::default)
}

/// Key-scoped fixed-window counter over Redis with the in-memory fallback.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    redis: Option<ConnectionManager>,
}

impl fmt::Debug for FixedWindowLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedWindowLimiter")
            .field("shared_store", &self.redis.is_some())
            .finish()
    }
}

impl FixedWindowLimiter {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis: Some(redis) }
    }

    /// Limiter that only ever uses the process-global fallback.
    pub fn in_memory() -> Self {
        Self { redis: None }
    }

    /// Count a hit against `key` and decide. Infallible: shared-store errors
    /// degrade to the fallback rather than failing the guarded request.
    pub async fn check(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision {
        if let Some(redis) = &self.redis {
            match Self::check_shared(redis.clone(), key, limit, window).await {
                Ok(decision) => return decision,
                Err(err) => {
                    warn!(error = %err, key, "shared rate-limit store unavailable, using local fallback");
                }
            }
        }
        global_window_store().hit(key, limit, window)
    }

    async fn check_shared(
        mut redis: ConnectionManager,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> redis::RedisResult<RateLimitDecision> {
        let storage_key = format!("ratelimit:{key}");
        let window_ms = window.as_millis() as i64;
        // INCR then set the expiry only when the key is fresh; the script
        // keeps the two steps atomic so a crash between them cannot leave an
        // immortal counter.
        let script = redis::Script::new(
            r#"
            local count = redis.call('INCR', KEYS[1])
            if count == 1 then
                redis.call('PEXPIRE', KEYS[1], ARGV[1])
            end
            local ttl = redis.call('PTTL', KEYS[1])
            return {count, ttl}
            "#,
        );
        let (count, ttl_ms): (u64, i64) = script
            .key(&storage_key)
            .arg(window_ms)
            .invoke_async(&mut redis)
            .await?;
        let ttl_ms = if ttl_ms < 0 { window_ms } else { ttl_ms };
        Ok(decision(count, limit, epoch_ms() + ttl_ms as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fallback_allows_exactly_the_limit() {
        let limiter = FixedWindowLimiter::in_memory();
        let key = format!("test:burst:{}", uuid::Uuid::new_v4());
        let mut allowed = 0;
        let mut denied = 0;
        for _ in 0..150 {
            let decision = limiter.check(&key, 100, Duration::from_secs(60)).await;
            if decision.allowed {
                allowed += 1;
            } else {
                denied += 1;
            }
        }
        assert_eq!(allowed, 100);
        assert_eq!(denied, 50);
        assert_eq!(
            global_window_store().stored_count(&format!("{key}")),
            Some(150),
            "the stored count keeps growing past the limit"
        );
    }

    #[tokio::test]
    async fn window_expiry_resets_the_count() {
        let limiter = FixedWindowLimiter::in_memory();
        let key = format!("test:expiry:{}", uuid::Uuid::new_v4());
        let first = limiter.check(&key, 1, Duration::from_millis(20)).await;
        assert!(first.allowed);
        let second = limiter.check(&key, 1, Duration::from_millis(20)).await;
        assert!(!second.allowed);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let third = limiter.check(&key, 1, Duration::from_millis(20)).await;
        assert!(third.allowed, "a fresh window starts at count 1");
    }

    #[test]
    fn eviction_prefers_expired_windows() {
        let store = MemoryWindowStore::default();
        {
            let mut windows = store.windows.lock().unwrap();
            windows.insert(
                "stale".into(),
                WindowRecord {
                    count: 3,
                    reset_at_ms: 1,
                },
            );
            windows.insert(
                "live".into(),
                WindowRecord {
                    count: 3,
                    reset_at_ms: epoch_ms() + 60_000,
                },
            );
            MemoryWindowStore::evict(&mut windows, epoch_ms());
        }
        assert!(store.stored_count("stale").is_none());
        assert!(store.stored_count("live").is_some());
    }
}
