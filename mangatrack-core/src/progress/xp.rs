//! XP arithmetic. All pure; the transaction envelope in the store applies
//! the results.

use chrono::{DateTime, Datelike, Utc};

/// XP per qualifying progress call. Never multiplied by jump size: marking
/// chapters 1..=569 in one call is worth the same as marking one.
pub const XP_PER_CHAPTER: i64 = 1;
pub const XP_SERIES_COMPLETED: i64 = 100;
pub const MAX_XP: i64 = 999_999_999;

pub fn clamp_xp(xp: i64) -> i64 {
    xp.clamp(0, MAX_XP)
}

/// Saturating XP addition inside the [0, MAX_XP] band.
pub fn add_xp(current: i64, delta: i64) -> i64 {
    clamp_xp(clamp_xp(current).saturating_add(delta))
}

/// `level = floor(sqrt(xp / 100)) + 1`; L1 covers [0, 100), L2 [100, 400),
/// L3 [400, 900), and so on.
pub fn level_for_xp(xp: i64) -> u32 {
    let clamped = clamp_xp(xp) as f64;
    (clamped / 100.0).sqrt().floor() as u32 + 1
}

/// Streak bonus added to the base XP on qualifying reads.
pub fn streak_bonus(streak_days: u32) -> i64 {
    i64::from(streak_days.saturating_mul(5).min(50))
}

/// One-time import bonus: a quarter point per imported chapter, banded into
/// [50, 500]. Zero imported chapters grant nothing.
pub fn migration_bonus(imported_chapters: i64) -> i64 {
    if imported_chapters <= 0 {
        return 0;
    }
    let raw = imported_chapters as f64 * 0.25;
    raw.clamp(50.0, 500.0) as i64
}

/// Quarter key for seasonal XP, e.g. `2026-Q1`.
pub fn season_for(now: DateTime<Utc>) -> String {
    let quarter = (now.month() - 1) / 3 + 1;
    format!("{}-Q{}", now.year(), quarter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn level_boundaries() {
        assert_eq!(level_for_xp(0), 1);
        assert_eq!(level_for_xp(99), 1);
        assert_eq!(level_for_xp(100), 2);
        assert_eq!(level_for_xp(399), 2);
        assert_eq!(level_for_xp(400), 3);
        assert_eq!(level_for_xp(899), 3);
        assert_eq!(level_for_xp(900), 4);
    }

    #[test]
    fn level_is_monotone_and_xp_clamped() {
        let mut previous = 0;
        for xp in [0, 1, 99, 100, 500, 10_000, MAX_XP, MAX_XP + 5] {
            let level = level_for_xp(xp);
            assert!(level >= previous);
            previous = level;
        }
        assert_eq!(clamp_xp(-5), 0);
        assert_eq!(clamp_xp(MAX_XP + 1), MAX_XP);
    }

    #[test]
    fn xp_addition_commutes_modulo_clamp() {
        let deltas = [17i64, 500_000_000, 499_999_990];
        let forward = deltas.iter().fold(0i64, |acc, &d| add_xp(acc, d));
        let backward = deltas.iter().rev().fold(0i64, |acc, &d| add_xp(acc, d));
        assert_eq!(forward, backward);
        assert_eq!(forward, MAX_XP);
    }

    #[test]
    fn streak_bonus_caps_at_fifty() {
        assert_eq!(streak_bonus(0), 0);
        assert_eq!(streak_bonus(1), 5);
        assert_eq!(streak_bonus(10), 50);
        assert_eq!(streak_bonus(400), 50);
    }

    #[test]
    fn migration_bonus_banding() {
        assert_eq!(migration_bonus(0), 0);
        assert_eq!(migration_bonus(1), 50);
        assert_eq!(migration_bonus(199), 50);
        assert_eq!(migration_bonus(200), 50);
        assert_eq!(migration_bonus(2_000), 500);
        assert_eq!(migration_bonus(2_001), 500);
    }

    #[test]
    fn season_keys_are_quarter_strings() {
        let january = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap();
        let december = Utc.with_ymd_and_hms(2026, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(season_for(january), "2026-Q1");
        assert_eq!(season_for(december), "2026-Q4");
    }
}
