use serde::{Deserialize, Serialize};

/// Aggregate health of the notification system, derived from delivery queue
/// depth. Dropped events are never retried; the chapter re-surfaces at the
/// next periodic sweep, and a missed notification is acceptable where a
/// duplicate is not.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationHealth {
    Normal,
    /// Tier-C series are dropped.
    Overloaded,
    /// Only premium subscribers are kept.
    Critical,
    /// All new events are dropped.
    Rejected,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub overloaded: u64,
    pub critical: u64,
    pub rejected: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            overloaded: 5_000,
            critical: 10_000,
            rejected: 20_000,
        }
    }
}

impl NotificationHealth {
    pub fn from_depth(depth: u64, thresholds: HealthThresholds) -> Self {
        if depth >= thresholds.rejected {
            NotificationHealth::Rejected
        } else if depth >= thresholds.critical {
            NotificationHealth::Critical
        } else if depth >= thresholds.overloaded {
            NotificationHealth::Overloaded
        } else {
            NotificationHealth::Normal
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, NotificationHealth::Rejected)
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, NotificationHealth::Critical)
    }

    pub fn is_overloaded(&self) -> bool {
        matches!(self, NotificationHealth::Overloaded)
    }
}
