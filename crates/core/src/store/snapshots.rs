//! Single-row value snapshots: the reader's last position and cached pages.
//!
//! Each key holds at most one live row; writes overwrite.

use super::connection::Store;
use super::{format_ts, parse_ts};
use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

/// Where a reader stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingPosition {
    pub user_key: String,
    pub surah: u16,
    pub ayat: u16,
    pub last_read_at: DateTime<Utc>,
}

/// Rendered HTML for a route, kept for offline display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticPageSnapshot {
    pub route: String,
    pub title: String,
    pub html: String,
    pub stored_at: DateTime<Utc>,
}

impl Store {
    pub async fn put_reading_position(&self, position: &ReadingPosition) -> Result<(), Error> {
        let position = position.clone();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO reading_positions (user_key, surah, ayat, last_read_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(user_key) DO UPDATE SET
                        surah = excluded.surah,
                        ayat = excluded.ayat,
                        last_read_at = excluded.last_read_at",
                    params![
                        &position.user_key,
                        position.surah,
                        position.ayat,
                        format_ts(&position.last_read_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    pub async fn get_reading_position(&self, user_key: &str) -> Result<Option<ReadingPosition>, Error> {
        let user_key = user_key.to_string();
        self.conn
            .call(move |conn| -> Result<Option<ReadingPosition>, Error> {
                let result = conn.query_row(
                    "SELECT surah, ayat, last_read_at FROM reading_positions WHERE user_key = ?1",
                    params![&user_key],
                    |row| Ok((row.get::<_, u16>(0)?, row.get::<_, u16>(1)?, row.get::<_, String>(2)?)),
                );

                match result {
                    Ok((surah, ayat, last_read_at)) => Ok(Some(ReadingPosition {
                        user_key,
                        surah,
                        ayat,
                        last_read_at: parse_ts(&last_read_at)?,
                    })),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    pub async fn put_page_snapshot(&self, snapshot: &StaticPageSnapshot) -> Result<(), Error> {
        let snapshot = snapshot.clone();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO page_snapshots (route, title, html, stored_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(route) DO UPDATE SET
                        title = excluded.title,
                        html = excluded.html,
                        stored_at = excluded.stored_at",
                    params![&snapshot.route, &snapshot.title, &snapshot.html, format_ts(&snapshot.stored_at)],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    pub async fn get_page_snapshot(&self, route: &str) -> Result<Option<StaticPageSnapshot>, Error> {
        let route = route.to_string();
        self.conn
            .call(move |conn| -> Result<Option<StaticPageSnapshot>, Error> {
                let result = conn.query_row(
                    "SELECT title, html, stored_at FROM page_snapshots WHERE route = ?1",
                    params![&route],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
                );

                match result {
                    Ok((title, html, stored_at)) => {
                        Ok(Some(StaticPageSnapshot { route, title, html, stored_at: parse_ts(&stored_at)? }))
                    }
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }
}
