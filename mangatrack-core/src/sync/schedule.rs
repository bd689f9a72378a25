use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::CatalogTier;

/// Per-tier periodic crawl cadence. Unknown tier uses the Tier-C interval.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SyncScheduleConfig {
    pub tier_a_hours: i64,
    pub tier_b_hours: i64,
    pub tier_c_hours: i64,
    /// Fractional jitter spread so a tier's sources do not thundering-herd
    /// the sweep.
    pub jitter_ratio: f64,
}

impl Default for SyncScheduleConfig {
    fn default() -> Self {
        Self {
            tier_a_hours: 6,
            tier_b_hours: 12,
            tier_c_hours: 24,
            jitter_ratio: 0.1,
        }
    }
}

impl SyncScheduleConfig {
    pub fn next_check_at(&self, tier: Option<CatalogTier>, now: DateTime<Utc>) -> DateTime<Utc> {
        let hours = match tier {
            Some(CatalogTier::A) => self.tier_a_hours,
            Some(CatalogTier::B) => self.tier_b_hours,
            Some(CatalogTier::C) | None => self.tier_c_hours,
        };
        let base_secs = hours * 3_600;
        let jitter_span = ((base_secs as f64) * self.jitter_ratio) as i64;
        let jitter = if jitter_span > 0 {
            rand::rng().random_range(0..=jitter_span)
        } else {
            0
        };
        now + ChronoDuration::seconds(base_secs + jitter)
    }
}
