//! When is a source's stored corpus old enough to re-ingest?

use chrono::{DateTime, Duration, Utc};

/// Time-based staleness policy.
#[derive(Debug, Clone, Copy)]
pub struct StalenessPolicy {
    pub max_age: Duration,
}

impl StalenessPolicy {
    pub fn from_hours(hours: u64) -> Self {
        Self {
            max_age: Duration::hours(hours as i64),
        }
    }

    /// A source never reconciled is stale. Otherwise it is stale once
    /// `max_age` has elapsed since the last successful reconciliation.
    /// A clock that went backwards counts as fresh.
    pub fn is_stale(&self, last_synced: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_synced {
            None => true,
            Some(at) => now.signed_duration_since(at) >= self.max_age,
        }
    }
}
