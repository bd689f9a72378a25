//! Crawl admission control.
//!
//! Every request to crawl a series source, user-driven or periodic, passes
//! through one admission function that consults live queue depth, the
//! series' catalog tier, and the request reason. The decision is a pure
//! function of its inputs, which is what makes it testable at every
//! threshold boundary.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::queue::{
    EnqueueOptions, EnqueueOutcome, JobId, JobPayload, JobPriority, QueueName, QueueService,
    SyncSourceJob,
};
use crate::Result;
use crate::types::{CatalogTier, SeriesSourceId};

/// Why a crawl was requested.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionReason {
    UserRequest,
    GapRecovery,
    Discovery,
    Periodic,
}

impl fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdmissionReason::UserRequest => "USER_REQUEST",
            AdmissionReason::GapRecovery => "GAP_RECOVERY",
            AdmissionReason::Discovery => "DISCOVERY",
            AdmissionReason::Periodic => "PERIODIC",
        };
        f.write_str(name)
    }
}

/// Load zones derived from total queued depth (waiting + delayed).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueZone {
    Healthy,
    Elevated,
    Overloaded,
    Critical,
    Meltdown,
    Halt,
}

impl QueueZone {
    pub fn from_depth(depth: u64) -> Self {
        match depth {
            0..=2_499 => QueueZone::Healthy,
            2_500..=4_999 => QueueZone::Elevated,
            5_000..=9_999 => QueueZone::Overloaded,
            10_000..=14_999 => QueueZone::Critical,
            15_000..=20_000 => QueueZone::Meltdown,
            _ => QueueZone::Halt,
        }
    }
}

/// Outcome of the admission function.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub priority: Option<JobPriority>,
    pub zone: QueueZone,
    pub deny_reason: Option<String>,
}

impl AdmissionDecision {
    fn allow(priority: JobPriority, zone: QueueZone) -> Self {
        Self {
            allowed: true,
            priority: Some(priority),
            zone,
            deny_reason: None,
        }
    }

    fn deny(reason: impl Into<String>, zone: QueueZone) -> Self {
        Self {
            allowed: false,
            priority: None,
            zone,
            deny_reason: Some(reason.into()),
        }
    }
}

/// Priority assignment. Unknown tier gets Tier-C treatment.
pub fn assign_priority(reason: AdmissionReason, tier: Option<CatalogTier>) -> JobPriority {
    match reason {
        AdmissionReason::UserRequest | AdmissionReason::GapRecovery => JobPriority::P0,
        AdmissionReason::Discovery => JobPriority::P2,
        AdmissionReason::Periodic => match tier {
            Some(CatalogTier::A) | Some(CatalogTier::B) => JobPriority::P2,
            Some(CatalogTier::C) | None => JobPriority::P3,
        },
    }
}

/// The admission function. Pure over (depth, tier, reason, last_success_at);
/// calling it twice with the same inputs yields the same decision.
pub fn decide(
    depth: u64,
    tier: Option<CatalogTier>,
    reason: AdmissionReason,
    last_success_at: Option<DateTime<Utc>>,
) -> AdmissionDecision {
    let zone = QueueZone::from_depth(depth);

    // Tier-A sources are crawled periodically exactly once; a recorded
    // success means further periodic crawls are denied until manual
    // intervention. Discovery and user requests bypass this.
    if reason == AdmissionReason::Periodic
        && tier == Some(CatalogTier::A)
        && last_success_at.is_some()
    {
        return AdmissionDecision::deny("tier-a one-shot", zone);
    }

    let priority = assign_priority(reason, tier);
    match zone {
        QueueZone::Healthy => AdmissionDecision::allow(priority, zone),
        QueueZone::Elevated => {
            if priority == JobPriority::P3 {
                AdmissionDecision::deny("shedding p3 at elevated depth", zone)
            } else {
                AdmissionDecision::allow(priority, zone)
            }
        }
        QueueZone::Overloaded => {
            if priority == JobPriority::P3 {
                AdmissionDecision::deny("shedding p3 at overloaded depth", zone)
            } else if reason == AdmissionReason::Discovery {
                AdmissionDecision::deny("shedding discovery at overloaded depth", zone)
            } else {
                AdmissionDecision::allow(priority, zone)
            }
        }
        QueueZone::Critical => {
            if priority == JobPriority::P0 {
                AdmissionDecision::allow(priority, zone)
            } else {
                AdmissionDecision::deny("critical depth admits p0 only", zone)
            }
        }
        QueueZone::Meltdown => AdmissionDecision::deny("queue meltdown", zone),
        QueueZone::Halt => AdmissionDecision::deny("absolute halt", zone),
    }
}

/// Lookup seam for the one-shot rule. A missing source row is not an error
/// for admission; it simply has no recorded success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceInfoProvider: Send + Sync {
    async fn last_success_at(&self, id: SeriesSourceId) -> Result<Option<DateTime<Utc>>>;
}

/// Admission control plus the idempotent enqueue path.
pub struct CrawlGatekeeper {
    queue: Arc<dyn QueueService>,
    sources: Arc<dyn SourceInfoProvider>,
}

impl fmt::Debug for CrawlGatekeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrawlGatekeeper").finish_non_exhaustive()
    }
}

impl CrawlGatekeeper {
    pub fn new(queue: Arc<dyn QueueService>, sources: Arc<dyn SourceInfoProvider>) -> Self {
        Self { queue, sources }
    }

    /// Compute the admission decision for one source.
    ///
    /// A queue-depth lookup failure assumes depth 0: the gatekeeper fails
    /// open rather than deadlocking the crawl pipeline on its own telemetry.
    pub async fn admit(
        &self,
        source_id: SeriesSourceId,
        tier: Option<CatalogTier>,
        reason: AdmissionReason,
    ) -> AdmissionDecision {
        let depth = match self.queue.counts(QueueName::SyncSource).await {
            Ok(counts) => counts.total_queued(),
            Err(err) => {
                warn!(error = %err, "queue depth lookup failed, assuming empty");
                0
            }
        };

        let last_success_at = if reason == AdmissionReason::Periodic && tier == Some(CatalogTier::A)
        {
            match self.sources.last_success_at(source_id).await {
                Ok(value) => value,
                Err(err) => {
                    warn!(source = %source_id, error = %err, "source lookup failed during admission");
                    None
                }
            }
        } else {
            None
        };

        decide(depth, tier, reason, last_success_at)
    }

    /// Run admission and, when allowed, enqueue the sync job under the
    /// stable id `sync-{source_id}` so duplicates coalesce. Denials return
    /// `Ok(false)`; enqueue errors propagate.
    pub async fn enqueue_if_allowed(
        &self,
        source_id: SeriesSourceId,
        tier: Option<CatalogTier>,
        reason: AdmissionReason,
        extra: Option<Value>,
    ) -> Result<bool> {
        let decision = self.admit(source_id, tier, reason).await;
        let Some(priority) = decision.priority.filter(|_| decision.allowed) else {
            debug!(
                source = %source_id,
                reason = %reason,
                zone = ?decision.zone,
                deny = decision.deny_reason.as_deref().unwrap_or(""),
                "crawl denied"
            );
            return Ok(false);
        };

        let outcome = self
            .queue
            .enqueue(
                JobId::sync_source(source_id),
                JobPayload::SyncSource(SyncSourceJob {
                    series_source_id: source_id,
                    reason,
                    extra,
                }),
                EnqueueOptions {
                    priority: Some(priority),
                    ..Default::default()
                },
            )
            .await?;
        if outcome == EnqueueOutcome::Coalesced {
            debug!(source = %source_id, "sync already queued, coalesced");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryQueue, JobCounts, JobRecord, JobState};
    use crate::types::WorkerFailure;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    fn no_history(
    ) -> (u64, Option<CatalogTier>, AdmissionReason, Option<DateTime<Utc>>) {
        (0, Some(CatalogTier::C), AdmissionReason::Periodic, None)
    }

    #[test]
    fn priority_table_matches_reason_and_tier() {
        assert_eq!(
            assign_priority(AdmissionReason::UserRequest, Some(CatalogTier::C)),
            JobPriority::P0
        );
        assert_eq!(
            assign_priority(AdmissionReason::GapRecovery, None),
            JobPriority::P0
        );
        assert_eq!(
            assign_priority(AdmissionReason::Discovery, Some(CatalogTier::A)),
            JobPriority::P2
        );
        assert_eq!(
            assign_priority(AdmissionReason::Periodic, Some(CatalogTier::A)),
            JobPriority::P2
        );
        assert_eq!(
            assign_priority(AdmissionReason::Periodic, Some(CatalogTier::B)),
            JobPriority::P2
        );
        assert_eq!(
            assign_priority(AdmissionReason::Periodic, Some(CatalogTier::C)),
            JobPriority::P3
        );
        // Unknown tier gets Tier-C treatment.
        assert_eq!(
            assign_priority(AdmissionReason::Periodic, None),
            JobPriority::P3
        );
    }

    #[test]
    fn zone_thresholds_are_exact() {
        assert_eq!(QueueZone::from_depth(0), QueueZone::Healthy);
        assert_eq!(QueueZone::from_depth(2_499), QueueZone::Healthy);
        assert_eq!(QueueZone::from_depth(2_500), QueueZone::Elevated);
        assert_eq!(QueueZone::from_depth(4_999), QueueZone::Elevated);
        assert_eq!(QueueZone::from_depth(5_000), QueueZone::Overloaded);
        assert_eq!(QueueZone::from_depth(9_999), QueueZone::Overloaded);
        assert_eq!(QueueZone::from_depth(10_000), QueueZone::Critical);
        assert_eq!(QueueZone::from_depth(14_999), QueueZone::Critical);
        assert_eq!(QueueZone::from_depth(15_000), QueueZone::Meltdown);
        assert_eq!(QueueZone::from_depth(20_000), QueueZone::Meltdown);
        assert_eq!(QueueZone::from_depth(20_001), QueueZone::Halt);
    }

    #[test]
    fn tier_c_periodic_boundary_behaviour() {
        let admitted = decide(2_499, Some(CatalogTier::C), AdmissionReason::Periodic, None);
        assert!(admitted.allowed);
        assert_eq!(admitted.priority, Some(JobPriority::P3));

        for depth in [2_500, 5_001, 10_001, 15_001, 20_001] {
            let denied = decide(depth, Some(CatalogTier::C), AdmissionReason::Periodic, None);
            assert!(!denied.allowed, "depth {depth} should shed tier-C periodic");
        }
    }

    #[test]
    fn overloaded_keeps_ab_periodic_but_sheds_discovery() {
        let ab = decide(5_001, Some(CatalogTier::B), AdmissionReason::Periodic, None);
        assert!(ab.allowed);
        assert_eq!(ab.priority, Some(JobPriority::P2));

        let discovery = decide(5_001, Some(CatalogTier::B), AdmissionReason::Discovery, None);
        assert!(!discovery.allowed);
    }

    #[test]
    fn critical_admits_p0_only_and_meltdown_denies_everything() {
        let user = decide(14_999, Some(CatalogTier::C), AdmissionReason::UserRequest, None);
        assert!(user.allowed);
        assert_eq!(user.priority, Some(JobPriority::P0));

        let periodic = decide(10_000, Some(CatalogTier::A), AdmissionReason::Periodic, None);
        assert!(!periodic.allowed);

        let meltdown = decide(15_000, Some(CatalogTier::A), AdmissionReason::UserRequest, None);
        assert!(!meltdown.allowed);
        let halt = decide(20_001, None, AdmissionReason::UserRequest, None);
        assert!(!halt.allowed);
    }

    #[test]
    fn decision_is_pure() {
        let (depth, tier, reason, last) = no_history();
        let first = decide(depth, tier, reason, last);
        let second = decide(depth, tier, reason, last);
        assert_eq!(first.allowed, second.allowed);
        assert_eq!(first.priority, second.priority);
    }

    #[test]
    fn tier_a_one_shot_denies_periodic_after_success() {
        let fresh = decide(0, Some(CatalogTier::A), AdmissionReason::Periodic, None);
        assert!(fresh.allowed);
        assert_eq!(fresh.priority, Some(JobPriority::P2));

        let crawled = decide(0, Some(CatalogTier::A), AdmissionReason::Periodic, Some(Utc::now()));
        assert!(!crawled.allowed);
        assert!(crawled.deny_reason.as_deref().unwrap().contains("one-shot"));

        // Discovery and user requests bypass the one-shot rule.
        let discovery =
            decide(0, Some(CatalogTier::A), AdmissionReason::Discovery, Some(Utc::now()));
        assert!(discovery.allowed);
        let user =
            decide(0, Some(CatalogTier::A), AdmissionReason::UserRequest, Some(Utc::now()));
        assert!(user.allowed);
        assert_eq!(user.priority, Some(JobPriority::P0));
    }

    struct NoSources;

    #[async_trait]
    impl SourceInfoProvider for NoSources {
        async fn last_success_at(
            &self,
            _id: SeriesSourceId,
        ) -> crate::Result<Option<DateTime<Utc>>> {
            Ok(None)
        }
    }

    /// Queue whose depth lookup always fails; everything else is inert.
    struct BrokenDepthQueue;

    #[async_trait]
    impl QueueService for BrokenDepthQueue {
        async fn enqueue(
            &self,
            _id: JobId,
            _payload: JobPayload,
            _options: EnqueueOptions,
        ) -> crate::Result<EnqueueOutcome> {
            Ok(EnqueueOutcome::Accepted)
        }

        async fn counts(&self, _queue: QueueName) -> crate::Result<JobCounts> {
            Err(crate::error::CoreError::Internal("depth probe down".into()))
        }

        async fn dequeue(
            &self,
            _queue: QueueName,
            _worker_id: &str,
        ) -> crate::Result<Option<JobRecord>> {
            Ok(None)
        }

        async fn complete(&self, _queue: QueueName, _id: &JobId) -> crate::Result<()> {
            Ok(())
        }

        async fn fail(
            &self,
            _queue: QueueName,
            _id: &JobId,
            _error: &str,
            _retryable: bool,
        ) -> crate::Result<crate::queue::FailureOutcome> {
            Ok(crate::queue::FailureOutcome::DeadLetter)
        }

        async fn remove(&self, _queue: QueueName, _id: &JobId) -> crate::Result<bool> {
            Ok(false)
        }

        async fn find_state(
            &self,
            _queue: QueueName,
            _id: &JobId,
        ) -> crate::Result<Option<JobState>> {
            Ok(None)
        }

        async fn prune_failed(&self, _older_than: DateTime<Utc>) -> crate::Result<u64> {
            Ok(0)
        }

        async fn recent_failures(&self, _limit: usize) -> crate::Result<Vec<WorkerFailure>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn depth_lookup_failure_fails_open() {
        let gatekeeper =
            CrawlGatekeeper::new(Arc::new(BrokenDepthQueue), Arc::new(NoSources));
        let decision = gatekeeper
            .admit(SeriesSourceId::new(), Some(CatalogTier::C), AdmissionReason::Periodic)
            .await;
        assert!(decision.allowed, "failed depth probe must assume empty queue");
    }

    #[tokio::test]
    async fn elevated_queue_sheds_tier_c_periodic_but_admits_user_request() {
        let queue = Arc::new(InMemoryQueue::default());
        let source = SeriesSourceId::new();
        queue.seed_depth(
            QueueName::SyncSource,
            JobPayload::SyncSource(SyncSourceJob {
                series_source_id: source,
                reason: AdmissionReason::Periodic,
                extra: None,
            }),
            5_001,
        );

        let gatekeeper = CrawlGatekeeper::new(queue.clone(), Arc::new(NoSources));
        let periodic = gatekeeper
            .admit(source, Some(CatalogTier::C), AdmissionReason::Periodic)
            .await;
        assert!(!periodic.allowed);

        let user = gatekeeper
            .admit(source, Some(CatalogTier::C), AdmissionReason::UserRequest)
            .await;
        assert!(user.allowed);
        assert_eq!(user.priority.map(|p| p.as_i16()), Some(1));
    }

    #[tokio::test]
    async fn enqueue_if_allowed_coalesces_duplicates() {
        let queue = Arc::new(InMemoryQueue::default());
        let gatekeeper = CrawlGatekeeper::new(queue.clone(), Arc::new(NoSources));
        let source = SeriesSourceId::new();

        let first = gatekeeper
            .enqueue_if_allowed(source, Some(CatalogTier::B), AdmissionReason::Periodic, None)
            .await
            .unwrap();
        let second = gatekeeper
            .enqueue_if_allowed(source, Some(CatalogTier::B), AdmissionReason::UserRequest, None)
            .await
            .unwrap();
        assert!(first && second);

        let counts = queue.counts(QueueName::SyncSource).await.unwrap();
        assert_eq!(counts.waiting, 1, "duplicate enqueues collapse on job id");
    }

    #[tokio::test]
    async fn one_shot_consults_the_source_provider() {
        let queue = Arc::new(InMemoryQueue::default());
        let mut sources = MockSourceInfoProvider::new();
        sources
            .expect_last_success_at()
            .returning(|_| Ok(Some(Utc::now())));
        let gatekeeper = CrawlGatekeeper::new(queue, Arc::new(sources));

        let admitted = gatekeeper
            .enqueue_if_allowed(
                SeriesSourceId::new(),
                Some(CatalogTier::A),
                AdmissionReason::Periodic,
                None,
            )
            .await
            .unwrap();
        assert!(!admitted);
    }
}
