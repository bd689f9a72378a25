//! Anti-abuse soft signals.
//!
//! Violations never block reads and never cancel XP: they only move the
//! per-user trust score inside [0.5, 1.0], which attenuates leaderboard
//! `effective_xp`. There is deliberately no violation for large jumps;
//! binge reads are legitimate.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::UserId;

pub const TRUST_MIN: f64 = 0.5;
pub const TRUST_MAX: f64 = 1.0;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    SpeedRead,
    BulkSpeedRead,
    PatternRepetition,
}

impl ViolationKind {
    pub fn penalty(&self) -> f64 {
        match self {
            ViolationKind::SpeedRead => 0.05,
            ViolationKind::BulkSpeedRead => 0.04,
            ViolationKind::PatternRepetition => 0.08,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::SpeedRead => "speed_read",
            ViolationKind::BulkSpeedRead => "bulk_speed_read",
            ViolationKind::PatternRepetition => "pattern_repetition",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Window within which repeated speed violations escalate to bulk.
    pub bulk_window: Duration,
    pub bulk_threshold: usize,
    /// Interval-stdev floor under which reads look machine-generated.
    pub pattern_stdev_secs: f64,
    /// Number of trailing inter-read intervals inspected for repetition.
    pub pattern_samples: usize,
    /// Per-type cooldown preventing penalty stacking.
    pub cooldown: Duration,
    pub decay_per_day: f64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            bulk_window: Duration::from_secs(5 * 60),
            bulk_threshold: 3,
            pattern_stdev_secs: 2.0,
            pattern_samples: 5,
            cooldown: Duration::from_secs(60),
            decay_per_day: 0.02,
        }
    }
}

/// A read faster than `max(30, pages * 3)` seconds is suspicious.
pub fn is_suspicious_read(read_time_seconds: u32, pages: u32) -> bool {
    u64::from(read_time_seconds) < u64::from(pages.saturating_mul(3)).max(30)
}

fn stdev_seconds(intervals: &[f64]) -> f64 {
    if intervals.is_empty() {
        return f64::INFINITY;
    }
    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    let variance = intervals
        .iter()
        .map(|value| (value - mean).powi(2))
        .sum::<f64>()
        / intervals.len() as f64;
    variance.sqrt()
}

/// Pick the violation for a suspicious read.
///
/// `recent_reads` are the user's latest read timestamps, newest first;
/// `recent_speed_violations` the speed-class violations inside the bulk
/// window.
pub fn classify_violation(
    config: &TrustConfig,
    recent_reads: &[DateTime<Utc>],
    recent_speed_violations: usize,
) -> ViolationKind {
    if recent_reads.len() > config.pattern_samples {
        let intervals: Vec<f64> = recent_reads
            .windows(2)
            .take(config.pattern_samples)
            .map(|pair| (pair[0] - pair[1]).num_milliseconds().abs() as f64 / 1_000.0)
            .collect();
        if intervals.len() >= config.pattern_samples
            && stdev_seconds(&intervals) < config.pattern_stdev_secs
        {
            return ViolationKind::PatternRepetition;
        }
    }
    if recent_speed_violations >= config.bulk_threshold {
        ViolationKind::BulkSpeedRead
    } else {
        ViolationKind::SpeedRead
    }
}

pub fn apply_penalty(trust: f64, kind: ViolationKind) -> f64 {
    (trust - kind.penalty()).clamp(TRUST_MIN, TRUST_MAX)
}

/// Daily decay back toward full trust.
pub fn decay(trust: f64, days: f64, per_day: f64) -> f64 {
    (trust + days.max(0.0) * per_day).clamp(TRUST_MIN, TRUST_MAX)
}

/// Leaderboard-only attenuation; actual XP is never scaled.
pub fn effective_xp(xp: i64, trust: f64) -> i64 {
    (xp as f64 * trust.clamp(TRUST_MIN, TRUST_MAX)) as i64
}

/// Per-(user, type) cooldown gate preventing penalty stacking.
#[derive(Debug, Default)]
pub struct ViolationCooldowns {
    last_recorded: HashMap<(UserId, ViolationKind), DateTime<Utc>>,
}

impl ViolationCooldowns {
    /// Whether a violation of this type may be recorded now; records the
    /// timestamp when it may.
    pub fn should_record(
        &mut self,
        user_id: UserId,
        kind: ViolationKind,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> bool {
        let key = (user_id, kind);
        if let Some(last) = self.last_recorded.get(&key) {
            let elapsed = (now - *last).num_milliseconds();
            if elapsed >= 0 && (elapsed as u128) < cooldown.as_millis() {
                return false;
            }
        }
        self.last_recorded.insert(key, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn suspicious_read_threshold() {
        // Floor of 30 seconds for short chapters.
        assert!(is_suspicious_read(29, 5));
        assert!(!is_suspicious_read(30, 5));
        // pages * 3 beyond the floor.
        assert!(is_suspicious_read(59, 20));
        assert!(!is_suspicious_read(60, 20));
    }

    #[test]
    fn penalties_clamp_to_trust_floor() {
        let mut trust = TRUST_MAX;
        for _ in 0..20 {
            trust = apply_penalty(trust, ViolationKind::PatternRepetition);
        }
        assert_eq!(trust, TRUST_MIN);
    }

    #[test]
    fn decay_restores_toward_full_trust() {
        let config = TrustConfig::default();
        let restored = decay(0.9, 2.0, config.decay_per_day);
        assert!((restored - 0.94).abs() < 1e-9);
        assert_eq!(decay(0.99, 30.0, config.decay_per_day), TRUST_MAX);
    }

    #[test]
    fn metronomic_reads_classify_as_pattern_repetition() {
        let config = TrustConfig::default();
        let base = Utc::now();
        // Six reads exactly one second apart, newest first.
        let reads: Vec<_> = (0..6)
            .map(|index| base - ChronoDuration::seconds(index))
            .collect();
        assert_eq!(
            classify_violation(&config, &reads, 0),
            ViolationKind::PatternRepetition
        );
    }

    #[test]
    fn repeated_speed_violations_escalate_to_bulk() {
        let config = TrustConfig::default();
        let base = Utc::now();
        let reads: Vec<_> = (0..3)
            .map(|index| base - ChronoDuration::seconds(index * 120))
            .collect();
        assert_eq!(
            classify_violation(&config, &reads, 3),
            ViolationKind::BulkSpeedRead
        );
        assert_eq!(
            classify_violation(&config, &reads, 1),
            ViolationKind::SpeedRead
        );
    }

    #[test]
    fn cooldown_blocks_stacking_per_type() {
        let mut cooldowns = ViolationCooldowns::default();
        let user = UserId::new();
        let now = Utc::now();
        let window = Duration::from_secs(60);

        assert!(cooldowns.should_record(user, ViolationKind::SpeedRead, now, window));
        assert!(!cooldowns.should_record(
            user,
            ViolationKind::SpeedRead,
            now + ChronoDuration::seconds(30),
            window
        ));
        // A different type is tracked independently.
        assert!(cooldowns.should_record(
            user,
            ViolationKind::PatternRepetition,
            now + ChronoDuration::seconds(30),
            window
        ));
        // And the same type is allowed again after the window.
        assert!(cooldowns.should_record(
            user,
            ViolationKind::SpeedRead,
            now + ChronoDuration::seconds(61),
            window
        ));
    }

    #[test]
    fn effective_xp_attenuates_but_never_mutates_xp() {
        assert_eq!(effective_xp(1_000, 1.0), 1_000);
        assert_eq!(effective_xp(1_000, 0.5), 500);
        // Out-of-band trust inputs clamp instead of amplifying.
        assert_eq!(effective_xp(1_000, 2.0), 1_000);
    }
}
