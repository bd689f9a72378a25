//! Library status transition rules applied by the reconciler and the import
//! path.

use chrono::{DateTime, Utc};

use crate::types::LibraryStatus;

/// Incoming view of an entry from a replayed update or an import row.
#[derive(Clone, Copy, Debug)]
pub struct IncomingEntryState {
    pub status: Option<LibraryStatus>,
    pub progress: Option<f64>,
    pub last_updated: DateTime<Utc>,
}

/// Stored view the rules compare against.
#[derive(Clone, Copy, Debug)]
pub struct StoredEntryState {
    pub status: LibraryStatus,
    pub progress: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolvedEntryState {
    pub status: LibraryStatus,
    pub progress: f64,
}

/// Resolve what an update is allowed to change.
///
/// `completed` is sticky: leaving it requires the same update to raise
/// progress. Progress regression is blocked unless the incoming state is
/// strictly newer and the statuses agree.
pub fn resolve_entry_update(
    stored: StoredEntryState,
    incoming: IncomingEntryState,
) -> ResolvedEntryState {
    let incoming_status = incoming.status.unwrap_or(stored.status);
    let incoming_progress = incoming.progress.unwrap_or(stored.progress);

    let progress = if incoming_progress < stored.progress {
        let strictly_newer = incoming.last_updated > stored.updated_at;
        let statuses_agree = incoming_status == stored.status;
        if strictly_newer && statuses_agree {
            incoming_progress
        } else {
            stored.progress
        }
    } else {
        incoming_progress
    };

    let status = if stored.status == LibraryStatus::Completed
        && incoming_status != LibraryStatus::Completed
    {
        if progress > stored.progress {
            incoming_status
        } else {
            LibraryStatus::Completed
        }
    } else {
        incoming_status
    };

    ResolvedEntryState { status, progress }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn stored(status: LibraryStatus, progress: f64) -> StoredEntryState {
        StoredEntryState {
            status,
            progress,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn completed_is_sticky_without_progress_increase() {
        let resolved = resolve_entry_update(
            stored(LibraryStatus::Completed, 100.0),
            IncomingEntryState {
                status: Some(LibraryStatus::Reading),
                progress: Some(100.0),
                last_updated: Utc::now() + Duration::hours(1),
            },
        );
        assert_eq!(resolved.status, LibraryStatus::Completed);
    }

    #[test]
    fn completed_downgrade_allowed_with_progress_increase() {
        let resolved = resolve_entry_update(
            stored(LibraryStatus::Completed, 100.0),
            IncomingEntryState {
                status: Some(LibraryStatus::Reading),
                progress: Some(120.0),
                last_updated: Utc::now() + Duration::hours(1),
            },
        );
        assert_eq!(resolved.status, LibraryStatus::Reading);
        assert_eq!(resolved.progress, 120.0);
    }

    #[test]
    fn progress_regression_blocked_when_stale() {
        let base = stored(LibraryStatus::Reading, 50.0);
        let resolved = resolve_entry_update(
            base,
            IncomingEntryState {
                status: Some(LibraryStatus::Reading),
                progress: Some(20.0),
                last_updated: base.updated_at - Duration::hours(1),
            },
        );
        assert_eq!(resolved.progress, 50.0);
    }

    #[test]
    fn progress_regression_blocked_when_statuses_differ() {
        let base = stored(LibraryStatus::Reading, 50.0);
        let resolved = resolve_entry_update(
            base,
            IncomingEntryState {
                status: Some(LibraryStatus::Paused),
                progress: Some(20.0),
                last_updated: base.updated_at + Duration::hours(1),
            },
        );
        assert_eq!(resolved.progress, 50.0);
    }

    #[test]
    fn progress_regression_allowed_when_newer_and_statuses_agree() {
        let base = stored(LibraryStatus::Reading, 50.0);
        let resolved = resolve_entry_update(
            base,
            IncomingEntryState {
                status: Some(LibraryStatus::Reading),
                progress: Some(20.0),
                last_updated: base.updated_at + Duration::hours(1),
            },
        );
        assert_eq!(resolved.progress, 20.0);
    }
}
