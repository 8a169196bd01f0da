//! Versioned cache buckets and cached response entries.
//!
//! A bucket name is `<class>-<version>`. Bumping the version token on deploy
//! produces a fresh set of names; activation then deletes every bucket whose
//! name is not in the current set, so entries written by a previous build
//! are never read again.

use super::connection::Store;
use super::{format_ts, parse_ts};
use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

/// Resource class a bucket holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BucketClass {
    /// Precached app shell: static assets and the offline page.
    StaticShell,
    /// Everything routed through the default strategy.
    DynamicApi,
    /// Content API responses (network-first).
    ContentDomain,
}

impl BucketClass {
    pub const ALL: [BucketClass; 3] = [BucketClass::StaticShell, BucketClass::DynamicApi, BucketClass::ContentDomain];

    pub fn as_str(&self) -> &'static str {
        match self {
            BucketClass::StaticShell => "static-shell",
            BucketClass::DynamicApi => "dynamic-api",
            BucketClass::ContentDomain => "content-domain",
        }
    }
}

/// The bucket names belonging to one version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSet {
    version: String,
}

impl BucketSet {
    pub fn for_version(version: impl Into<String>) -> Self {
        Self { version: version.into() }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Versioned bucket name for a class, e.g. `content-domain-v3`.
    pub fn name(&self, class: BucketClass) -> String {
        format!("{}-{}", class.as_str(), self.version)
    }

    /// Names that survive activation.
    pub fn allow_list(&self) -> Vec<String> {
        BucketClass::ALL.iter().map(|c| self.name(*c)).collect()
    }

    pub fn contains(&self, bucket: &str) -> bool {
        BucketClass::ALL.iter().any(|c| self.name(*c) == bucket)
    }
}

/// A stored response, keyed by request identity (method + URL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub method: String,
    pub url: String,
    pub status: u16,
    /// Subset of response headers needed to replay the response.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

impl CachedEntry {
    pub fn new(
        method: impl Into<String>, url: impl Into<String>, status: u16, headers: Vec<(String, String)>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            status,
            headers,
            body: body.into(),
            stored_at: super::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Cache key for this entry's request identity.
    pub fn request_key(&self) -> String {
        super::hash::request_key(&self.method, &self.url)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Per-bucket summary used by status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketStat {
    pub name: String,
    pub entries: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl Store {
    /// Look up an entry. Absence is `Ok(None)`, never an error.
    pub async fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedEntry>, Error> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<Option<CachedEntry>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT method, url, status, headers_json, body, stored_at
                     FROM cache_entries WHERE bucket = ?1 AND request_key = ?2",
                )?;

                let row = stmt.query_row(params![bucket, key], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                });

                let (method, url, status, headers_json, body, stored_at) = match row {
                    Ok(r) => r,
                    Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                    Err(e) => return Err(e.into()),
                };

                Ok(Some(CachedEntry {
                    method,
                    url,
                    status: u16::try_from(status).map_err(|e| Error::Serialization(e.to_string()))?,
                    headers: serde_json::from_str(&headers_json)?,
                    body,
                    stored_at: parse_ts(&stored_at)?,
                }))
            })
            .await
            .map_err(Error::from)
    }

    /// Insert or overwrite an entry and bump the bucket's refresh time.
    ///
    /// Only 2xx entries are accepted.
    pub async fn put(&self, bucket: &str, key: &str, entry: &CachedEntry) -> Result<(), Error> {
        if !entry.is_success() {
            return Err(Error::InvalidInput(format!("refusing to cache status {}", entry.status)));
        }

        let bucket = bucket.to_string();
        let key = key.to_string();
        let headers_json = serde_json::to_string(&entry.headers)?;
        let stored_at = format_ts(&entry.stored_at);
        let entry = entry.clone();

        self.conn
            .call(move |conn| -> Result<(), Error> {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO cache_entries (bucket, request_key, method, url, status, headers_json, body, stored_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(bucket, request_key) DO UPDATE SET
                        method = excluded.method,
                        url = excluded.url,
                        status = excluded.status,
                        headers_json = excluded.headers_json,
                        body = excluded.body,
                        stored_at = excluded.stored_at",
                    params![
                        &bucket,
                        &key,
                        &entry.method,
                        &entry.url,
                        i64::from(entry.status),
                        &headers_json,
                        &entry.body,
                        &stored_at,
                    ],
                )?;
                tx.execute(
                    "INSERT INTO buckets (name, refreshed_at) VALUES (?1, ?2)
                     ON CONFLICT(name) DO UPDATE SET refreshed_at = excluded.refreshed_at",
                    params![&bucket, &stored_at],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// All bucket names known to the store, sorted.
    pub async fn bucket_names(&self) -> Result<Vec<String>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<String>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT name FROM buckets
                     UNION
                     SELECT DISTINCT bucket FROM cache_entries
                     ORDER BY 1",
                )?;
                let names = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(names)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete one bucket and its entries. Returns the number of entries removed.
    pub async fn delete_bucket(&self, bucket: &str) -> Result<u64, Error> {
        let bucket = bucket.to_string();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let tx = conn.transaction()?;
                let removed = tx.execute("DELETE FROM cache_entries WHERE bucket = ?1", params![&bucket])?;
                tx.execute("DELETE FROM buckets WHERE name = ?1", params![&bucket])?;
                tx.commit()?;
                Ok(removed as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete every bucket that is not part of `current`.
    ///
    /// Runs during activation, before any read traffic. Returns the number
    /// of buckets deleted.
    pub async fn delete_buckets_older_than(&self, current: &BucketSet) -> Result<u64, Error> {
        let mut deleted = 0u64;
        for name in self.bucket_names().await? {
            if current.contains(&name) {
                continue;
            }
            let entries = self.delete_bucket(&name).await?;
            tracing::info!(bucket = %name, entries, version = current.version(), "deleted stale cache bucket");
            deleted += 1;
        }
        Ok(deleted)
    }

    /// When the bucket last received a write.
    pub async fn bucket_refreshed_at(&self, bucket: &str) -> Result<Option<DateTime<Utc>>, Error> {
        let bucket = bucket.to_string();
        self.conn
            .call(move |conn| -> Result<Option<DateTime<Utc>>, Error> {
                let result = conn.query_row(
                    "SELECT refreshed_at FROM buckets WHERE name = ?1",
                    params![bucket],
                    |row| row.get::<_, String>(0),
                );
                match result {
                    Ok(ts) => Ok(Some(parse_ts(&ts)?)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Entry counts and refresh times for every bucket.
    pub async fn bucket_stats(&self) -> Result<Vec<BucketStat>, Error> {
        let mut stats = Vec::new();
        for name in self.bucket_names().await? {
            let lookup = name.clone();
            let entries = self
                .conn
                .call(move |conn| -> Result<i64, Error> {
                    Ok(conn.query_row(
                        "SELECT COUNT(*) FROM cache_entries WHERE bucket = ?1",
                        params![lookup],
                        |row| row.get(0),
                    )?)
                })
                .await
                .map_err(Error::from)?;
            let refreshed_at = self.bucket_refreshed_at(&name).await?;
            stats.push(BucketStat { name, entries: entries as u64, refreshed_at });
        }
        Ok(stats)
    }
}
