//! Cache Policy Router.
//!
//! Every intercepted request is classified (see [`rules`]) and dispatched to
//! one caching strategy:
//!
//! | class          | strategy                                   | bucket           |
//! |----------------|--------------------------------------------|------------------|
//! | passthrough    | network only                               | none             |
//! | content domain | network first, cache then offline page     | `content-domain` |
//! | static asset   | cache first, network on miss               | `static-shell`   |
//! | default        | cache hit (revalidate when stale), network | `dynamic-api`    |
//!
//! Network failures never escape a strategy unconverted: they become a cached
//! response, the offline page (navigations only) or the original error.
//! Cache writes on the network-first and default paths are detached; call
//! [`CacheRouter::flush`] to wait for them.

pub mod rules;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Serialize;
use tilawa_core::{AppConfig, BucketClass, BucketSet, CachedEntry, Error, Freshness, StalenessTracker, Store};
use tokio::task::JoinSet;

use crate::connectivity::ConnectivityObserver;
use crate::fetch::{Network, Request, Response, ResponseKind, ResponseSource, canonicalize, resolve};

pub use rules::{RequestClass, RouteRules};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub rules: RouteRules,
    pub buckets: BucketSet,
    /// Upstream origin; precache paths and the offline page resolve against it.
    pub origin: Url,
    pub precache: Vec<String>,
    pub offline_page: String,
}

impl RouterConfig {
    pub fn from_app_config(config: &AppConfig) -> Result<Self, Error> {
        Ok(Self {
            rules: RouteRules::from_config(config),
            buckets: BucketSet::for_version(config.cache_version.clone()),
            origin: canonicalize(&config.upstream_url)?,
            precache: config.precache_paths.clone(),
            offline_page: config.offline_page.clone(),
        })
    }
}

/// Freshness report for one current bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketReport {
    pub name: String,
    pub entries: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub freshness: Option<Freshness>,
}

pub struct CacheRouter {
    store: Store,
    network: Arc<dyn Network>,
    connectivity: ConnectivityObserver,
    staleness: StalenessTracker,
    config: RouterConfig,
    background: Mutex<JoinSet<()>>,
    activated: AtomicBool,
}

impl CacheRouter {
    pub fn new(
        store: Store, network: Arc<dyn Network>, connectivity: ConnectivityObserver, staleness: StalenessTracker,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            network,
            connectivity,
            staleness,
            config,
            background: Mutex::new(JoinSet::new()),
            activated: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn connectivity(&self) -> &ConnectivityObserver {
        &self.connectivity
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    /// Precache the static shell.
    ///
    /// All-or-nothing: every path (plus the offline page) is fetched first and
    /// nothing is written unless all of them answered 2xx.
    pub async fn on_install(&self) -> Result<usize, Error> {
        let mut paths = self.config.precache.clone();
        if !paths.contains(&self.config.offline_page) {
            paths.push(self.config.offline_page.clone());
        }

        let mut fetched = Vec::with_capacity(paths.len());
        for path in &paths {
            let request = Request::get(resolve(&self.config.origin, path)?);
            let response = self.fetch_network(&request).await?;
            if !response.is_success() {
                return Err(Error::HttpStatus(response.status.as_u16()));
            }
            fetched.push((request.cache_key(), response.to_entry(&request.method)));
        }

        let bucket = self.config.buckets.name(BucketClass::StaticShell);
        for (key, entry) in &fetched {
            self.store.put(&bucket, key, entry).await?;
        }

        tracing::info!(bucket = %bucket, entries = fetched.len(), "static shell precached");
        Ok(fetched.len())
    }

    /// Drop buckets from earlier versions, then start routing through the cache.
    pub async fn on_activate(&self) -> Result<u64, Error> {
        let removed = self.store.delete_buckets_older_than(&self.config.buckets).await?;
        self.activated.store(true, Ordering::Release);
        tracing::info!(version = self.config.buckets.version(), removed, "router activated");
        Ok(removed)
    }

    /// Install, then activate whatever the install outcome.
    ///
    /// A failed precache (an offline cold start, say) leaves the current
    /// version's buckets as they were, and they keep serving. Returns the
    /// number of entries precached, or `None` when install failed.
    pub async fn start(&self) -> Result<Option<usize>, Error> {
        let installed = match self.on_install().await {
            Ok(entries) => Some(entries),
            Err(e) => {
                tracing::warn!(error = %e, "static shell precache failed, serving current buckets");
                None
            }
        };
        self.on_activate().await?;
        Ok(installed)
    }

    pub async fn on_fetch(&self, request: &Request) -> Result<Response, Error> {
        self.route(request).await
    }

    pub async fn route(&self, request: &Request) -> Result<Response, Error> {
        if !self.is_activated() {
            return self.fetch_network(request).await;
        }

        let class = self.config.rules.classify(request);
        tracing::debug!(method = %request.method, url = %request.url, ?class, "routing");

        match class {
            RequestClass::Passthrough => self.fetch_network(request).await,
            RequestClass::ContentDomain => self.network_first(request).await,
            RequestClass::StaticAsset => self.cache_first(request).await,
            RequestClass::Default => self.cache_then_network(request).await,
        }
    }

    /// Wait for every detached cache write and revalidation started so far.
    pub async fn flush(&self) {
        let mut pending = std::mem::take(&mut *self.lock_background());
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "background cache task aborted");
            }
        }
    }

    pub async fn teardown(&self) {
        self.flush().await;
        tracing::info!("router torn down");
    }

    /// One report per current bucket, written to or not.
    pub async fn bucket_status(&self) -> Result<Vec<BucketReport>, Error> {
        let stats = self.store.bucket_stats().await?;
        let mut reports = Vec::new();
        for name in self.config.buckets.allow_list() {
            let entries = stats.iter().find(|s| s.name == name).map_or(0, |s| s.entries);
            let refreshed_at = self.staleness.last_refreshed(&name).await?;
            let freshness = refreshed_at.map(|ts| self.staleness.assess(ts));
            reports.push(BucketReport { name, entries, refreshed_at, freshness });
        }
        Ok(reports)
    }

    async fn network_first(&self, request: &Request) -> Result<Response, Error> {
        let bucket = self.config.buckets.name(BucketClass::ContentDomain);

        match self.fetch_network(request).await {
            Ok(response) => {
                if response.is_success() {
                    self.spawn_put(bucket, request.cache_key(), response.to_entry(&request.method));
                }
                Ok(response)
            }
            Err(err) => {
                if let Some(hit) = self.lookup(&bucket, request).await {
                    tracing::debug!(url = %request.url, "network failed, serving cached content");
                    return Ok(hit);
                }
                self.fallback_or(request, err).await
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> Result<Response, Error> {
        let bucket = self.config.buckets.name(BucketClass::StaticShell);
        if let Some(hit) = self.lookup(&bucket, request).await {
            return Ok(hit);
        }

        let response = match self.fetch_network(request).await {
            Ok(response) => response,
            Err(err) => return self.fallback_or(request, err).await,
        };

        if response.is_success()
            && let Err(e) = self
                .store
                .put(&bucket, &request.cache_key(), &response.to_entry(&request.method))
                .await
        {
            tracing::warn!(url = %request.url, error = %e, "static asset cache write failed");
        }
        Ok(response)
    }

    async fn cache_then_network(&self, request: &Request) -> Result<Response, Error> {
        let bucket = self.config.buckets.name(BucketClass::DynamicApi);

        if let Some(hit) = self.lookup(&bucket, request).await {
            let stale = hit
                .stored_at
                .is_some_and(|ts| self.staleness.assess(ts) == Freshness::Stale);
            if stale && self.connectivity.is_online() {
                self.spawn_revalidate(bucket, request.clone());
            }
            return Ok(hit);
        }

        match self.fetch_network(request).await {
            Ok(response) => {
                if response.is_success() && response.kind == ResponseKind::Basic {
                    self.spawn_put(bucket, request.cache_key(), response.to_entry(&request.method));
                }
                Ok(response)
            }
            Err(err) => self.fallback_or(request, err).await,
        }
    }

    async fn fetch_network(&self, request: &Request) -> Result<Response, Error> {
        if !self.connectivity.is_online() {
            return Err(Error::Offline(request.url.to_string()));
        }
        self.network.fetch(request).await
    }

    /// Cached response for the request, treating store failures as a miss.
    async fn lookup(&self, bucket: &str, request: &Request) -> Option<Response> {
        let entry = match self.store.get(bucket, &request.cache_key()).await {
            Ok(entry) => entry?,
            Err(e) => {
                tracing::warn!(bucket = %bucket, url = %request.url, error = %e, "cache read failed");
                return None;
            }
        };

        match Response::from_entry(entry, ResponseSource::Cache) {
            Ok(response) => {
                tracing::debug!(bucket = %bucket, url = %request.url, "cache hit");
                Some(response)
            }
            Err(e) => {
                tracing::warn!(bucket = %bucket, url = %request.url, error = %e, "unreadable cache entry");
                None
            }
        }
    }

    /// Offline page for navigations, otherwise the original failure.
    async fn fallback_or(&self, request: &Request, err: Error) -> Result<Response, Error> {
        if !request.is_navigation() {
            return Err(err);
        }

        let Ok(offline_url) = resolve(&self.config.origin, &self.config.offline_page) else {
            return Err(err);
        };
        let bucket = self.config.buckets.name(BucketClass::StaticShell);
        match self.lookup(&bucket, &Request::get(offline_url)).await {
            Some(mut page) => {
                tracing::debug!(url = %request.url, "serving offline page");
                page.source = ResponseSource::OfflineFallback;
                Ok(page)
            }
            None => Err(err),
        }
    }

    fn lock_background(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.background.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_detached<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut background = self.lock_background();
        while let Some(done) = background.try_join_next() {
            if let Err(e) = done {
                tracing::warn!(error = %e, "background cache task aborted");
            }
        }
        background.spawn(task);
    }

    fn spawn_put(&self, bucket: String, key: String, entry: CachedEntry) {
        let store = self.store.clone();
        self.spawn_detached(async move {
            if let Err(e) = store.put(&bucket, &key, &entry).await {
                tracing::warn!(bucket = %bucket, url = %entry.url, error = %e, "background cache write failed");
            }
        });
    }

    fn spawn_revalidate(&self, bucket: String, request: Request) {
        let store = self.store.clone();
        let network = Arc::clone(&self.network);
        self.spawn_detached(async move {
            let response = match network.fetch(&request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(url = %request.url, error = %e, "revalidation skipped");
                    return;
                }
            };
            if !response.is_success() || response.kind != ResponseKind::Basic {
                return;
            }
            let entry = response.to_entry(&request.method);
            if let Err(e) = store.put(&bucket, &request.cache_key(), &entry).await {
                tracing::warn!(bucket = %bucket, url = %request.url, error = %e, "revalidation write failed");
            } else {
                tracing::debug!(bucket = %bucket, url = %request.url, "revalidated");
            }
        });
    }
}

impl std::fmt::Debug for CacheRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRouter")
            .field("config", &self.config)
            .field("activated", &self.is_activated())
            .finish_non_exhaustive()
    }
}
