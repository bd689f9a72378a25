//! Domain model: identifiers, series/chapter records, library state, and the
//! append-only audit shapes shared by every subsystem.

pub mod audit;
pub mod chapter;
pub mod ids;
pub mod library;
pub mod series;

pub use audit::{AuditLogRecord, LoginAttempt, WorkerFailure};
pub use chapter::{Chapter, ChapterSource};
pub use ids::{
    ChapterId, ChapterSourceId, EntryId, ImportJobId, SeriesId, SeriesSourceId, UserId,
};
pub use library::{
    LibraryEntry, LibraryStatus, MetadataStatus, Notification, SyncHealth, UserChapterRead,
};
pub use series::{CatalogTier, Series, SeriesSource, SeriesStatus, SourceStatus};
