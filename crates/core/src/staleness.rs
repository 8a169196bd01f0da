//! Staleness tracking for cached entries and buckets.
//!
//! The store stamps every bucket with the time of its last write; the
//! tracker turns those timestamps (and per-entry `stored_at`) into a
//! servable/revalidate decision.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::store::Store;

/// Whether a cached value can be served as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    /// Still servable, but should be revalidated in the background.
    Stale,
}

#[derive(Debug, Clone)]
pub struct StalenessTracker {
    store: Store,
    max_age: Option<Duration>,
}

impl StalenessTracker {
    /// `max_age = None` means entries never go stale.
    pub fn new(store: Store, max_age: Option<Duration>) -> Self {
        Self { store, max_age }
    }

    pub fn assess(&self, stored_at: DateTime<Utc>) -> Freshness {
        self.assess_at(stored_at, Utc::now())
    }

    pub fn assess_at(&self, stored_at: DateTime<Utc>, now: DateTime<Utc>) -> Freshness {
        match self.max_age {
            Some(max_age) if now - stored_at > max_age => Freshness::Stale,
            _ => Freshness::Fresh,
        }
    }

    pub async fn last_refreshed(&self, bucket: &str) -> Result<Option<DateTime<Utc>>, Error> {
        self.store.bucket_refreshed_at(bucket).await
    }
}
