//! Client-side outbox: a persisted FIFO of intents with bounded retries and
//! a single-flighted replay loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::error::CoreError;
use crate::Result;

use super::action::{push_deduped, OutboxAction};

/// Device-storage seam. The browser analog is synchronous storage, so this
/// trait is too.
#[cfg_attr(test, automock)]
pub trait OutboxStorage: Send + Sync {
    fn load(&self) -> Result<Vec<OutboxAction>>;
    fn save(&self, actions: &[OutboxAction]) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryOutboxStorage {
    actions: Mutex<Vec<OutboxAction>>,
}

impl OutboxStorage for MemoryOutboxStorage {
    fn load(&self) -> Result<Vec<OutboxAction>> {
        Ok(self.actions.lock().expect("storage poisoned").clone())
    }

    fn save(&self, actions: &[OutboxAction]) -> Result<()> {
        *self.actions.lock().expect("storage poisoned") = actions.to_vec();
        Ok(())
    }
}

/// Per-action verdict from the replay endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayStatus {
    /// Applied (or idempotently already applied); dequeue.
    Success,
    /// Transient server trouble; retry later.
    Retryable,
    /// Will never apply (including auth failures); drop.
    Permanent,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ActionResult {
    pub id: Uuid,
    pub status: ReplayStatus,
}

/// Transport seam for `/sync/replay`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReplayTransport: Send + Sync {
    async fn replay(&self, actions: &[OutboxAction]) -> Result<Vec<ActionResult>>;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReplaySummary {
    pub sent: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dropped: usize,
}

/// Attempts per action before it is dropped and logged. After five
/// server-mediated retries it is safe to assume obsolescence.
const MAX_ACTION_RETRIES: u32 = 5;

pub struct Outbox {
    storage: Arc<dyn OutboxStorage>,
    queue: Mutex<Vec<OutboxAction>>,
    wakeup: Notify,
    replaying: AtomicBool,
}

impl fmt::Debug for Outbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbox")
            .field("queued", &self.len())
            .finish_non_exhaustive()
    }
}

impl Outbox {
    pub fn new(storage: Arc<dyn OutboxStorage>) -> Result<Self> {
        let queue = storage.load()?;
        Ok(Self {
            storage,
            queue: Mutex::new(queue),
            wakeup: Notify::new(),
            replaying: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("outbox poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue an action, applying the dedup rules, and nudge the replay loop.
    pub fn enqueue(&self, action: OutboxAction) -> Result<()> {
        {
            let mut queue = self.queue.lock().expect("outbox poisoned");
            push_deduped(&mut queue, action);
            self.storage.save(&queue)?;
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// One replay round. Single-flighted: a second caller while a round is
    /// in progress gets `None`.
    pub async fn replay_once(
        &self,
        transport: &dyn ReplayTransport,
    ) -> Result<Option<ReplaySummary>> {
        if self
            .replaying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        let result = self.replay_locked(transport).await;
        self.replaying.store(false, Ordering::Release);
        result.map(Some)
    }

    async fn replay_locked(&self, transport: &dyn ReplayTransport) -> Result<ReplaySummary> {
        let mut batch = {
            let queue = self.queue.lock().expect("outbox poisoned");
            queue.clone()
        };
        if batch.is_empty() {
            return Ok(ReplaySummary::default());
        }
        // Server applies in timestamp order; ties break on the action id.
        batch.sort_by(|a, b| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| a.id.cmp(&b.id))
        });

        let results = transport.replay(&batch).await?;
        let mut summary = ReplaySummary {
            sent: batch.len(),
            ..ReplaySummary::default()
        };

        let mut queue = self.queue.lock().expect("outbox poisoned");
        for result in results {
            let Some(position) = queue.iter().position(|action| action.id == result.id) else {
                continue;
            };
            match result.status {
                ReplayStatus::Success => {
                    queue.remove(position);
                    summary.succeeded += 1;
                }
                ReplayStatus::Permanent => {
                    let action = queue.remove(position);
                    tracing::warn!(
                        action = %action.id,
                        "outbox action permanently rejected, dropping"
                    );
                    summary.dropped += 1;
                }
                ReplayStatus::Retryable => {
                    let action = &mut queue[position];
                    action.retry_count += 1;
                    if action.retry_count >= MAX_ACTION_RETRIES {
                        tracing::warn!(
                            action = %action.id,
                            retries = action.retry_count,
                            "outbox action exhausted retries, dropping"
                        );
                        queue.remove(position);
                        summary.dropped += 1;
                    } else {
                        summary.retried += 1;
                    }
                }
            }
        }
        self.storage.save(&queue)?;
        Ok(summary)
    }

    /// Replay loop: runs on online transitions, outbox mutations, and a
    /// five-minute heartbeat.
    pub async fn run(
        self: Arc<Self>,
        transport: Arc<dyn ReplayTransport>,
        mut online: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) {
        let heartbeat = Duration::from_secs(5 * 60);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(heartbeat) => {}
                _ = self.wakeup.notified() => {}
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*online.borrow() {
                        continue;
                    }
                }
            }
            if !*online.borrow() {
                continue;
            }
            match self.replay_once(transport.as_ref()).await {
                Ok(_) => {}
                Err(err) if err.is_retryable() => {
                    tracing::debug!(error = %err, "replay round failed, will retry");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "replay round failed");
                }
            }
        }
    }
}

impl From<CoreError> for ReplayStatus {
    /// Server-error to client-verdict mapping. Auth failures are permanent:
    /// the user must re-authenticate, retrying will never help.
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Unauthorized(_)
            | CoreError::Forbidden(_)
            | CoreError::BadRequest(_)
            | CoreError::Validation(_)
            | CoreError::Serialization(_)
            | CoreError::NotFound(_) => ReplayStatus::Permanent,
            other if other.is_retryable() => ReplayStatus::Retryable,
            _ => ReplayStatus::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::action::{ActionPayload, ChapterReadPayload};
    use crate::types::EntryId;

    fn read_action(chapter: f64, ts: i64) -> OutboxAction {
        OutboxAction::new(
            ActionPayload::ChapterRead(ChapterReadPayload {
                entry_id: EntryId::new(),
                chapter_number: chapter,
                read_time_seconds: None,
                pages: None,
            }),
            ts,
            "device-a",
        )
    }

    #[tokio::test]
    async fn successful_replay_dequeues_in_timestamp_order() {
        let outbox = Outbox::new(Arc::new(MemoryOutboxStorage::default())).unwrap();
        outbox.enqueue(read_action(2.0, 200)).unwrap();
        outbox.enqueue(read_action(1.0, 100)).unwrap();

        let mut transport = MockReplayTransport::new();
        transport.expect_replay().returning(|actions| {
            // The client must hand actions over sorted by timestamp.
            let timestamps: Vec<i64> = actions.iter().map(|a| a.timestamp_ms).collect();
            let mut sorted = timestamps.clone();
            sorted.sort_unstable();
            assert_eq!(timestamps, sorted);
            Ok(actions
                .iter()
                .map(|action| ActionResult {
                    id: action.id,
                    status: ReplayStatus::Success,
                })
                .collect())
        });

        let summary = outbox.replay_once(&transport).await.unwrap().unwrap();
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.succeeded, 2);
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn retryable_results_increment_and_eventually_drop() {
        let storage = Arc::new(MemoryOutboxStorage::default());
        let outbox = Outbox::new(storage.clone()).unwrap();
        outbox.enqueue(read_action(1.0, 100)).unwrap();

        let mut transport = MockReplayTransport::new();
        transport.expect_replay().returning(|actions| {
            Ok(actions
                .iter()
                .map(|action| ActionResult {
                    id: action.id,
                    status: ReplayStatus::Retryable,
                })
                .collect())
        });

        for round in 1..MAX_ACTION_RETRIES {
            let summary = outbox.replay_once(&transport).await.unwrap().unwrap();
            assert_eq!(summary.retried, 1, "round {round} should retry");
            assert_eq!(outbox.len(), 1);
        }
        let last = outbox.replay_once(&transport).await.unwrap().unwrap();
        assert_eq!(last.dropped, 1);
        assert!(outbox.is_empty());
        // The drop is persisted, not just in memory.
        assert!(storage.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanent_results_drop_immediately() {
        let outbox = Outbox::new(Arc::new(MemoryOutboxStorage::default())).unwrap();
        outbox.enqueue(read_action(1.0, 100)).unwrap();

        let mut transport = MockReplayTransport::new();
        transport.expect_replay().returning(|actions| {
            Ok(actions
                .iter()
                .map(|action| ActionResult {
                    id: action.id,
                    status: ReplayStatus::Permanent,
                })
                .collect())
        });

        let summary = outbox.replay_once(&transport).await.unwrap().unwrap();
        assert_eq!(summary.dropped, 1);
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn auth_errors_map_to_permanent() {
        assert_eq!(
            ReplayStatus::from(CoreError::Unauthorized("session expired".into())),
            ReplayStatus::Permanent
        );
        assert_eq!(
            ReplayStatus::from(CoreError::Forbidden("not yours".into())),
            ReplayStatus::Permanent
        );
        assert_eq!(
            ReplayStatus::from(CoreError::Timeout("tx budget".into())),
            ReplayStatus::Retryable
        );
        assert_eq!(
            ReplayStatus::from(CoreError::Conflict("locked".into())),
            ReplayStatus::Retryable
        );
    }
}
