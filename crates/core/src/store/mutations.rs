//! Pending mutation queue.
//!
//! Writes are appended with `synced = 0` and replayed in insertion order.
//! A row flips to synced exactly once and is never handed out again; synced
//! rows can be pruned at any time.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use super::connection::Store;
use super::{format_ts, now, parse_ts};
use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

/// Rows fetched per round trip by [`UnsyncedMutations`].
const DEFAULT_BATCH_SIZE: usize = 32;

/// What a queued write does upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    Contact,
    ReadingPosition,
    Note,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Contact => "contact",
            MutationKind::ReadingPosition => "reading-position",
            MutationKind::Note => "note",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contact" => Ok(MutationKind::Contact),
            "reading-position" => Ok(MutationKind::ReadingPosition),
            "note" => Ok(MutationKind::Note),
            other => Err(Error::InvalidInput(format!("unknown mutation kind: {other}"))),
        }
    }
}

/// A write to be queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMutation {
    pub kind: MutationKind,
    /// Absolute URL the payload is POSTed to.
    pub endpoint: String,
    pub payload: serde_json::Value,
}

impl NewMutation {
    pub fn new(kind: MutationKind, endpoint: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { kind, endpoint: endpoint.into(), payload }
    }
}

/// A queued write awaiting (or past) delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Insertion sequence; defines replay order.
    pub seq: i64,
    pub id: String,
    pub kind: MutationKind,
    pub endpoint: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub synced: bool,
    pub synced_at: Option<DateTime<Utc>>,
}

type MutationRow = (i64, String, String, String, String, String, i64, Option<String>);

const MUTATION_COLUMNS: &str = "seq, id, kind, endpoint, payload_json, created_at, synced, synced_at";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MutationRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_mutation(row: MutationRow) -> Result<PendingMutation, Error> {
    let (seq, id, kind, endpoint, payload_json, created_at, synced, synced_at) = row;
    Ok(PendingMutation {
        seq,
        id,
        kind: kind.parse()?,
        endpoint,
        payload: serde_json::from_str(&payload_json)?,
        created_at: parse_ts(&created_at)?,
        synced: synced != 0,
        synced_at: synced_at.as_deref().map(parse_ts).transpose()?,
    })
}

impl Store {
    /// Append a mutation with `synced = false` and return its id.
    ///
    /// Once this returns, the write survives a crash.
    pub async fn enqueue_mutation(&self, mutation: &NewMutation) -> Result<String, Error> {
        let id = uuid::Uuid::now_v7().to_string();
        let payload_json = serde_json::to_string(&mutation.payload)?;
        let created_at = format_ts(&now());
        let kind = mutation.kind.as_str();
        let endpoint = mutation.endpoint.clone();
        let row_id = id.clone();

        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO pending_mutations (id, kind, endpoint, payload_json, created_at, synced)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                    params![row_id, kind, endpoint, payload_json, created_at],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)?;

        tracing::debug!(id = %id, kind = %mutation.kind, "queued mutation");
        Ok(id)
    }

    /// Lazy FIFO cursor over the mutations that are not yet synced.
    pub fn list_unsynced_mutations(&self) -> UnsyncedMutations {
        UnsyncedMutations::new(self.clone(), DEFAULT_BATCH_SIZE)
    }

    /// Flag a mutation as delivered.
    ///
    /// Already-synced and unknown ids are a no-op.
    pub async fn mark_mutation_synced(&self, id: &str) -> Result<(), Error> {
        let id = id.to_string();
        let synced_at = format_ts(&now());
        let changed = self
            .conn
            .call({
                let id = id.clone();
                move |conn| -> Result<usize, Error> {
                    Ok(conn.execute(
                        "UPDATE pending_mutations SET synced = 1, synced_at = ?2 WHERE id = ?1 AND synced = 0",
                        params![id, synced_at],
                    )?)
                }
            })
            .await
            .map_err(Error::from)?;

        if changed == 0 {
            tracing::debug!(id = %id, "mark synced was a no-op");
        }
        Ok(())
    }

    pub async fn get_mutation(&self, id: &str) -> Result<Option<PendingMutation>, Error> {
        let id = id.to_string();
        self.conn
            .call(move |conn| -> Result<Option<PendingMutation>, Error> {
                let sql = format!("SELECT {MUTATION_COLUMNS} FROM pending_mutations WHERE id = ?1");
                match conn.query_row(&sql, params![id], read_row) {
                    Ok(row) => Ok(Some(into_mutation(row)?)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    pub async fn count_unsynced_mutations(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| -> Result<i64, Error> {
                Ok(conn.query_row("SELECT COUNT(*) FROM pending_mutations WHERE synced = 0", [], |row| {
                    row.get(0)
                })?)
            })
            .await
            .map_err(Error::from)
            .map(|n| n as u64)
    }

    /// Remove synced rows. Returns the number deleted.
    pub async fn prune_synced_mutations(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| -> Result<u64, Error> {
                let count = conn.execute("DELETE FROM pending_mutations WHERE synced = 1", [])?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    async fn max_mutation_seq(&self) -> Result<i64, Error> {
        self.conn
            .call(|conn| -> Result<i64, Error> {
                Ok(conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM pending_mutations", [], |row| row.get(0))?)
            })
            .await
            .map_err(Error::from)
    }

    async fn unsynced_page(&self, after_seq: i64, until_seq: i64, limit: usize) -> Result<Vec<MutationRow>, Error> {
        let limit = limit as i64;
        self.conn
            .call(move |conn| -> Result<Vec<MutationRow>, Error> {
                let sql = format!(
                    "SELECT {MUTATION_COLUMNS} FROM pending_mutations
                     WHERE synced = 0 AND seq > ?1 AND seq <= ?2
                     ORDER BY seq ASC LIMIT ?3"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![after_seq, until_seq, limit], read_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(Error::from)
    }
}

/// Lazy, finite, restartable FIFO sequence of unsynced mutations.
///
/// Rows are pulled in pages keyed on `seq`. The upper bound is the highest
/// sequence present at the first pull (or the first pull after
/// [`restart`](Self::restart)), so writes enqueued mid-iteration are left
/// for the next pass and the sequence always ends.
///
/// Rows are decoded as they are handed out. One that no longer decodes
/// yields [`Error::CorruptMutation`]; the cursor is already past it, so the
/// next call continues with the following row.
#[derive(Debug)]
pub struct UnsyncedMutations {
    store: Store,
    batch_size: usize,
    after_seq: i64,
    until_seq: Option<i64>,
    buffered: VecDeque<MutationRow>,
    exhausted: bool,
}

impl UnsyncedMutations {
    fn new(store: Store, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            after_seq: 0,
            until_seq: None,
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Next unsynced mutation in creation order, or `None` at the end.
    pub async fn next(&mut self) -> Result<Option<PendingMutation>, Error> {
        if self.buffered.is_empty() && !self.exhausted {
            let until = match self.until_seq {
                Some(until) => until,
                None => {
                    let until = self.store.max_mutation_seq().await?;
                    self.until_seq = Some(until);
                    until
                }
            };

            let page = self.store.unsynced_page(self.after_seq, until, self.batch_size).await?;
            if page.len() < self.batch_size {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.after_seq = last.0;
            }
            self.buffered.extend(page);
        }

        let Some(row) = self.buffered.pop_front() else {
            return Ok(None);
        };
        let seq = row.0;
        into_mutation(row)
            .map(Some)
            .map_err(|e| Error::CorruptMutation { seq, reason: e.to_string() })
    }

    /// Rewind to the oldest unsynced mutation and drop the upper bound.
    pub fn restart(&mut self) {
        self.after_seq = 0;
        self.until_seq = None;
        self.buffered.clear();
        self.exhausted = false;
    }

    /// Drain the remaining sequence into a vector.
    pub async fn try_collect(mut self) -> Result<Vec<PendingMutation>, Error> {
        let mut out = Vec::new();
        while let Some(m) = self.next().await? {
            out.push(m);
        }
        Ok(out)
    }
}
