use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ids::{ChapterId, ChapterSourceId, SeriesId, SeriesSourceId};

/// Logical chapter of a series, keyed by (series_id, chapter_number).
/// Duplicates under equivalent numbering collapse to one row; numbers are
/// strictly ordered per series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    pub series_id: SeriesId,
    pub number: f64,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The same chapter as offered by one [`crate::types::SeriesSource`].
///
/// Unique on (series_source_id, chapter_id), and additionally on
/// (series_source_id, source_chapter_id) whenever the latter is set, which
/// rejects reuploads silently. The chapter's series must match the source's
/// series; a trigger enforces this at the database level.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChapterSource {
    pub id: ChapterSourceId,
    pub series_source_id: SeriesSourceId,
    pub chapter_id: ChapterId,
    pub source_chapter_id: Option<String>,
    pub chapter_url: String,
    pub is_available: bool,
    pub detected_at: DateTime<Utc>,
}
