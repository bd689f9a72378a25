//! Achievement catalog and unlock selection. Unlocks are idempotent at the
//! storage layer (skip-duplicates against the unique (user, achievement)
//! constraint); XP is granted only for rows actually inserted.

/// XP granted per newly unlocked achievement.
pub const ACHIEVEMENT_XP: i64 = 25;

/// Chapters-read milestones.
const READER_MILESTONES: [(i64, &str); 4] = [
    (10, "reader-10"),
    (100, "reader-100"),
    (1_000, "reader-1000"),
    (10_000, "reader-10000"),
];

/// Completed-series milestones.
const FINISHER_MILESTONES: [(i64, &str); 3] = [
    (1, "finisher-1"),
    (10, "finisher-10"),
    (50, "finisher-50"),
];

/// Achievements earned at a given lifetime chapters-read total.
pub fn chapters_read_unlocks(total_chapters_read: i64) -> Vec<&'static str> {
    READER_MILESTONES
        .iter()
        .filter(|(threshold, _)| total_chapters_read >= *threshold)
        .map(|(_, id)| *id)
        .collect()
}

/// Achievements earned at a given completed-series total.
pub fn series_completed_unlocks(total_completed: i64) -> Vec<&'static str> {
    FINISHER_MILESTONES
        .iter()
        .filter(|(threshold, _)| total_completed >= *threshold)
        .map(|(_, id)| *id)
        .collect()
}
