//! Client side of tilawa.
//!
//! This crate provides the network seam and reqwest fetch client, the cache
//! policy router, the connectivity observer and the mutation sync manager.
//! The edge server wires them together.

pub mod connectivity;
pub mod fetch;
pub mod router;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use connectivity::{Connectivity, ConnectivityListener, ConnectivityObserver, ConnectivityState};
pub use fetch::{
    FetchClient, FetchConfig, Network, Request, RequestMode, Response, ResponseKind, ResponseSource, UrlError,
    canonicalize, resolve,
};
pub use router::{BucketReport, CacheRouter, RequestClass, RouteRules, RouterConfig};
pub use sync::{DrainReport, Endpoints, SubmitOutcome, SyncManager};
