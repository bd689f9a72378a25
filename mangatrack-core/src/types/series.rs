use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::ids::{SeriesId, SeriesSourceId};

/// Catalog tiers used by the discover/ranking subsystem. Only A and B are
/// discover-eligible; tier A sources are additionally crawled periodically
/// exactly once (the one-shot rule in the gatekeeper).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CatalogTier {
    A,
    B,
    C,
}

impl CatalogTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogTier::A => "A",
            CatalogTier::B => "B",
            CatalogTier::C => "C",
        }
    }
}

impl fmt::Display for CatalogTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatalogTier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "a" => Ok(CatalogTier::A),
            "B" | "b" => Ok(CatalogTier::B),
            "C" | "c" => Ok(CatalogTier::C),
            other => Err(CoreError::Validation(format!("unknown catalog tier: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesStatus {
    Ongoing,
    Completed,
    Hiatus,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Series {
    pub id: SeriesId,
    pub title: String,
    pub series_type: String,
    pub status: SeriesStatus,
    pub content_rating: String,
    pub tier: Option<CatalogTier>,
    pub total_follows: i64,
    pub total_views: i64,
    pub average_rating: Option<f64>,
    pub last_chapter_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Active,
    Broken,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Active => "active",
            SourceStatus::Broken => "broken",
        }
    }
}

impl FromStr for SourceStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SourceStatus::Active),
            "broken" => Ok(SourceStatus::Broken),
            other => Err(CoreError::Validation(format!("unknown source status: {other}"))),
        }
    }
}

/// Binding of a [`Series`] to one upstream site. Never hard-deleted while any
/// chapter source references it; flips to `broken` after repeated permanent
/// failures and leaves the periodic sweep.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeriesSource {
    pub id: SeriesSourceId,
    pub series_id: SeriesId,
    pub source_name: String,
    pub external_id: String,
    pub source_status: SourceStatus,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_check_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
    /// At most one source per series carries the primary cover.
    pub is_primary_cover: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parses_both_cases() {
        assert_eq!("A".parse::<CatalogTier>().unwrap(), CatalogTier::A);
        assert_eq!("c".parse::<CatalogTier>().unwrap(), CatalogTier::C);
        assert!("premium".parse::<CatalogTier>().is_err());
    }
}
