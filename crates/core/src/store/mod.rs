//! SQLite-backed durable local store.
//!
//! Persistent state that must survive a restart lives here and nowhere else:
//!
//! - Versioned cache buckets of request → response entries
//! - Per-bucket refresh timestamps (read by the staleness tracker)
//! - The pending mutation queue, replayed FIFO by the sync manager
//! - Single-row value snapshots (reading position, static pages)
//!
//! Async access goes through tokio-rusqlite; the database runs in WAL mode so
//! concurrent cache writers never block readers.

pub mod buckets;
pub mod connection;
pub mod hash;
pub mod migrations;
pub mod mutations;
pub mod snapshots;

use crate::Error;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

pub use buckets::{BucketClass, BucketSet, BucketStat, CachedEntry};
pub use connection::Store;
pub use hash::request_key;
pub use mutations::{MutationKind, NewMutation, PendingMutation, UnsyncedMutations};
pub use snapshots::{ReadingPosition, StaticPageSnapshot};

/// Current time at the precision the store persists (microseconds).
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("invalid timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip_is_exact() {
        let ts = now();
        assert_eq!(parse_ts(&format_ts(&ts)).unwrap(), ts);
    }

    #[test]
    fn test_parse_ts_rejects_garbage() {
        assert!(matches!(parse_ts("yesterday"), Err(Error::Serialization(_))));
    }
}
