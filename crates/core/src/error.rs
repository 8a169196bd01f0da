//! Unified error types for tilawa.
//!
//! Display strings carry a stable upper-case prefix so adapters can map
//! them onto status codes without matching on free-form text.

use tokio_rusqlite::rusqlite;

/// Unified error type shared by the store, router and sync manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., non-2xx entry handed to the cache).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Invalid URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// The request never produced a response (DNS, connect, reset, timeout).
    #[error("NETWORK_ERROR: {0}")]
    Network(String),

    /// The upstream answered with a non-success status.
    #[error("HTTP_STATUS: {0}")]
    HttpStatus(u16),

    /// No network, no cache entry and no fallback page.
    #[error("OFFLINE: {0}")]
    Offline(String),

    /// Payload or stored row could not be (de)serialized.
    #[error("SERIALIZATION: {0}")]
    Serialization(String),

    /// A queued mutation row that no longer decodes.
    #[error("SERIALIZATION: pending mutation {seq} is unreadable: {reason}")]
    CorruptMutation { seq: i64, reason: String },

    /// Store failure with no more specific variant.
    #[error("CACHE_ERROR: {0}")]
    Storage(String),
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            other => Error::Storage(other.to_string()),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Offline("/surah/2".to_string());
        assert!(err.to_string().starts_with("OFFLINE"));
        assert!(err.to_string().contains("/surah/2"));
    }

    #[test]
    fn test_call_error_unwraps_inner() {
        let inner: tokio_rusqlite::Error<Error> = tokio_rusqlite::Error::Error(Error::InvalidInput("bad kind".into()));
        assert!(matches!(Error::from(inner), Error::InvalidInput(msg) if msg == "bad kind"));

        let closed: tokio_rusqlite::Error<Error> = tokio_rusqlite::Error::ConnectionClosed;
        let err = Error::from(closed);
        assert!(matches!(err, Error::Database(tokio_rusqlite::Error::ConnectionClosed)));
        assert!(err.to_string().starts_with("CACHE_ERROR"));
    }

    #[test]
    fn test_corrupt_mutation_display() {
        let err = Error::CorruptMutation { seq: 7, reason: "unknown mutation kind: bookmark".into() };
        assert!(err.to_string().starts_with("SERIALIZATION"));
        assert!(err.to_string().contains("pending mutation 7"));
    }

    #[test]
    fn test_from_serde_json() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = parse_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
