//! Core types and shared functionality for tilawa.
//!
//! This crate provides:
//! - The durable local store (SQLite backend) for cached responses,
//!   page snapshots, reading positions and the pending mutation queue
//! - Cache bucket naming and versioning
//! - The staleness tracker
//! - Unified error types
//! - Configuration structures

pub mod config;
pub mod error;
pub mod staleness;
pub mod store;

pub use config::{AppConfig, ConfigError};
pub use error::Error;
pub use staleness::{Freshness, StalenessTracker};
pub use store::{
    BucketClass, BucketSet, CachedEntry, MutationKind, NewMutation, PendingMutation, ReadingPosition,
    StaticPageSnapshot, Store, UnsyncedMutations,
};
