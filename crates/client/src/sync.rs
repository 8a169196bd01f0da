//! Mutation queue delivery.
//!
//! Writes are persisted before anything else happens, so a crash or a dead
//! network never loses them. Delivery is at-least-once:
//!
//! - `submit` makes one immediate attempt when online; any failure leaves the
//!   row queued for the next drain.
//! - `drain` replays unsynced rows in insertion order. Only one drain runs at
//!   a time; a second trigger while one is active is a no-op.
//! - A row is re-read before delivery and skipped if it was synced meanwhile
//!   or if another attempt for the same id is in flight. A row that no longer
//!   decodes counts as failed and the drain moves past it.
//! - Synced rows are pruned at the end of every drain.
//!
//! Connectivity coming back triggers a drain through the observer listener
//! installed by [`SyncManager::start`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use reqwest::Url;
use reqwest::header::{HeaderName, HeaderValue};
use serde::Serialize;
use tilawa_core::{AppConfig, Error, MutationKind, NewMutation, PendingMutation, ReadingPosition, Store};
use tokio::task::JoinHandle;

use crate::connectivity::{ConnectivityListener, ConnectivityObserver};
use crate::fetch::{Network, Request, canonicalize, resolve};

/// Header carrying the local mutation id so the upstream can dedupe replays.
pub const MUTATION_ID_HEADER: &str = "x-mutation-id";

/// Absolute upstream URL per mutation kind.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub contact: Url,
    pub reading_position: Url,
    pub note: Url,
}

impl Endpoints {
    pub fn from_config(config: &AppConfig) -> Result<Self, Error> {
        let origin = canonicalize(&config.upstream_url)?;
        Ok(Self {
            contact: resolve(&origin, &config.contact_endpoint)?,
            reading_position: resolve(&origin, &config.reading_position_endpoint)?,
            note: resolve(&origin, &config.notes_endpoint)?,
        })
    }

    pub fn endpoint_for(&self, kind: MutationKind) -> &Url {
        match kind {
            MutationKind::Contact => &self.contact,
            MutationKind::ReadingPosition => &self.reading_position,
            MutationKind::Note => &self.note,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitOutcome {
    pub id: String,
    /// True only if the immediate attempt got a 2xx.
    pub delivered: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Another drain was already running; nothing was done.
    pub skipped: bool,
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Rows left alone because they were synced meanwhile or already in flight.
    pub deferred: usize,
    /// Connectivity dropped mid-drain; the rest waits for the next trigger.
    pub interrupted: bool,
    /// Synced rows removed once the drain finished.
    pub pruned: u64,
}

enum Delivery {
    Delivered,
    AlreadySynced,
    InFlight,
}

struct SyncInner {
    store: Store,
    network: Arc<dyn Network>,
    connectivity: ConnectivityObserver,
    endpoints: Endpoints,
    draining: AtomicBool,
    in_flight: Mutex<HashSet<String>>,
    spawned: Mutex<Vec<JoinHandle<()>>>,
}

/// Releases the drain flag however the drain ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Marks one mutation id as being delivered.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl SyncInner {
    fn claim(&self, id: &str) -> Option<Claim<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight
            .insert(id.to_string())
            .then(|| Claim { in_flight: &self.in_flight, id: id.to_string() })
    }

    async fn try_deliver(&self, id: &str) -> Result<Delivery, Error> {
        let Some(_claim) = self.claim(id) else {
            return Ok(Delivery::InFlight);
        };

        let mutation = match self.store.get_mutation(id).await? {
            Some(m) if !m.synced => m,
            _ => return Ok(Delivery::AlreadySynced),
        };

        self.deliver(&mutation).await?;
        self.store.mark_mutation_synced(id).await?;
        Ok(Delivery::Delivered)
    }

    async fn deliver(&self, mutation: &PendingMutation) -> Result<(), Error> {
        let url = Url::parse(&mutation.endpoint).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let id = HeaderValue::from_str(&mutation.id).map_err(|e| Error::InvalidInput(e.to_string()))?;
        let request =
            Request::post_json(url, &mutation.payload)?.with_header(HeaderName::from_static(MUTATION_ID_HEADER), id);

        let response = self.network.fetch(&request).await?;
        if !response.is_success() {
            return Err(Error::HttpStatus(response.status.as_u16()));
        }

        tracing::debug!(id = %mutation.id, kind = %mutation.kind, status = response.status.as_u16(), "mutation delivered");
        Ok(())
    }

    async fn drain(&self) -> Result<DrainReport, Error> {
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            tracing::debug!("drain already running");
            return Ok(DrainReport { skipped: true, ..Default::default() });
        };

        let mut report = DrainReport::default();
        let mut pending = self.store.list_unsynced_mutations();

        loop {
            let mutation = match pending.next().await {
                Ok(Some(mutation)) => mutation,
                Ok(None) => break,
                Err(Error::CorruptMutation { seq, reason }) => {
                    report.failed += 1;
                    tracing::warn!(seq, reason = %reason, "skipping unreadable mutation");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !self.connectivity.is_online() {
                report.interrupted = true;
                break;
            }

            match self.try_deliver(&mutation.id).await {
                Ok(Delivery::Delivered) => {
                    report.attempted += 1;
                    report.delivered += 1;
                }
                Ok(Delivery::AlreadySynced | Delivery::InFlight) => report.deferred += 1,
                Err(e) => {
                    report.attempted += 1;
                    report.failed += 1;
                    tracing::warn!(id = %mutation.id, kind = %mutation.kind, error = %e, "mutation delivery failed");
                }
            }
        }

        match self.store.prune_synced_mutations().await {
            Ok(pruned) => report.pruned = pruned,
            Err(e) => tracing::warn!(error = %e, "pruning synced mutations failed"),
        }

        tracing::info!(
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            deferred = report.deferred,
            interrupted = report.interrupted,
            pruned = report.pruned,
            "drain finished"
        );
        Ok(report)
    }

    fn trigger_drain(self: &Arc<Self>) -> Result<(), Error> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::InvalidInput(format!("no async runtime to drain on: {e}")))?;

        let inner = Arc::clone(self);
        let task = handle.spawn(async move {
            if let Err(e) = inner.drain().await {
                tracing::warn!(error = %e, "drain aborted");
            }
        });

        let mut spawned = self.spawned.lock().unwrap_or_else(PoisonError::into_inner);
        spawned.retain(|h| !h.is_finished());
        spawned.push(task);
        Ok(())
    }
}

/// Drains the queue when connectivity comes back.
struct DrainOnReconnect(Weak<SyncInner>);

impl ConnectivityListener for DrainOnReconnect {
    fn on_online(&self) -> Result<(), Error> {
        match self.0.upgrade() {
            Some(inner) => inner.trigger_drain(),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<SyncInner>,
}

impl SyncManager {
    pub fn new(store: Store, network: Arc<dyn Network>, connectivity: ConnectivityObserver, endpoints: Endpoints) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                store,
                network,
                connectivity,
                endpoints,
                draining: AtomicBool::new(false),
                in_flight: Mutex::new(HashSet::new()),
                spawned: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.inner.endpoints
    }

    /// Hook into the observer and drain anything left from a previous run.
    pub fn start(&self) -> Result<(), Error> {
        self.inner
            .connectivity
            .register(Arc::new(DrainOnReconnect(Arc::downgrade(&self.inner))));
        if self.inner.connectivity.is_online() {
            self.inner.trigger_drain()?;
        }
        Ok(())
    }

    /// Persist a write, then try to deliver it once if online.
    ///
    /// Errors only when the write could not be persisted.
    pub async fn submit(&self, mutation: NewMutation) -> Result<SubmitOutcome, Error> {
        let id = self.inner.store.enqueue_mutation(&mutation).await?;

        if !self.inner.connectivity.is_online() {
            tracing::debug!(id = %id, kind = %mutation.kind, "offline, mutation queued");
            return Ok(SubmitOutcome { id, delivered: false });
        }

        let delivered = match self.inner.try_deliver(&id).await {
            Ok(Delivery::Delivered) => true,
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(id = %id, kind = %mutation.kind, error = %e, "immediate delivery failed, kept queued");
                false
            }
        };
        Ok(SubmitOutcome { id, delivered })
    }

    /// Submit to the configured endpoint for `kind`.
    pub async fn submit_payload(&self, kind: MutationKind, payload: serde_json::Value) -> Result<SubmitOutcome, Error> {
        let endpoint = self.inner.endpoints.endpoint_for(kind).to_string();
        self.submit(NewMutation::new(kind, endpoint, payload)).await
    }

    /// Save the reader's position locally and queue it for upstream.
    pub async fn record_reading_position(&self, position: &ReadingPosition) -> Result<SubmitOutcome, Error> {
        self.inner.store.put_reading_position(position).await?;
        let payload = serde_json::to_value(position)?;
        self.submit_payload(MutationKind::ReadingPosition, payload).await
    }

    pub async fn drain(&self) -> Result<DrainReport, Error> {
        self.inner.drain().await
    }

    /// Spawn a drain on the current runtime.
    pub fn trigger_drain(&self) -> Result<(), Error> {
        self.inner.trigger_drain()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Wait for every spawned drain, including ones started while waiting.
    pub async fn settle(&self) {
        loop {
            let pending: Vec<_> =
                std::mem::take(&mut *self.inner.spawned.lock().unwrap_or_else(PoisonError::into_inner));
            if pending.is_empty() {
                return;
            }
            for task in pending {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "drain task aborted");
                }
            }
        }
    }

    pub async fn unsynced_count(&self) -> Result<u64, Error> {
        self.inner.store.count_unsynced_mutations().await
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("endpoints", &self.inner.endpoints)
            .field("draining", &self.is_draining())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockNetwork, ORIGIN};
    use serde_json::json;

    struct Harness {
        store: Store,
        network: Arc<MockNetwork>,
        connectivity: ConnectivityObserver,
        sync: SyncManager,
    }

    async fn harness(online: bool) -> Harness {
        let store = Store::open_in_memory().await.unwrap();
        let network = Arc::new(MockNetwork::new());
        network.respond("/api/contact", 201, "");
        network.respond("/api/notes", 200, "");
        network.respond("/api/reading-position", 204, "");

        let connectivity = ConnectivityObserver::new(online);
        let config = AppConfig { upstream_url: ORIGIN.into(), ..Default::default() };
        let sync = SyncManager::new(
            store.clone(),
            network.clone(),
            connectivity.clone(),
            Endpoints::from_config(&config).unwrap(),
        );
        Harness { store, network, connectivity, sync }
    }

    #[test]
    fn test_endpoints_resolve_against_upstream() {
        let config = AppConfig { upstream_url: "https://quran.example/".into(), ..Default::default() };
        let endpoints = Endpoints::from_config(&config).unwrap();
        assert_eq!(endpoints.endpoint_for(MutationKind::Note).as_str(), "https://quran.example/api/notes");
        assert_eq!(
            endpoints.endpoint_for(MutationKind::ReadingPosition).as_str(),
            "https://quran.example/api/reading-position"
        );
    }

    #[tokio::test]
    async fn test_submit_online_delivers_immediately() {
        let h = harness(true).await;

        let outcome = h
            .sync
            .submit_payload(MutationKind::Contact, json!({"email": "a@b.c", "message": "salam"}))
            .await
            .unwrap();

        assert!(outcome.delivered);
        assert!(h.store.get_mutation(&outcome.id).await.unwrap().unwrap().synced);
        let calls = h.network.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].path, "/api/contact");
        assert_eq!(calls[0].method, reqwest::Method::POST);
        assert_eq!(calls[0].mutation_id.as_deref(), Some(outcome.id.as_str()));
        assert_eq!(calls[0].body, Some(json!({"email": "a@b.c", "message": "salam"})));
    }

    #[tokio::test]
    async fn test_submit_non_success_stays_queued() {
        let h = harness(true).await;
        h.network.respond("/api/contact", 500, "");

        let outcome = h
            .sync
            .submit_payload(MutationKind::Contact, json!({"m": 1}))
            .await
            .unwrap();

        assert!(!outcome.delivered);
        assert_eq!(h.sync.unsynced_count().await.unwrap(), 1);
        assert_eq!(h.network.call_count(), 1);
    }

    #[tokio::test]
    async fn test_offline_submit_then_reconnect_delivers_once() {
        let h = harness(false).await;
        h.sync.start().unwrap();

        let outcome = h
            .sync
            .submit_payload(MutationKind::Note, json!({"ayah": "2:255", "text": "kursi"}))
            .await
            .unwrap();
        assert!(!outcome.delivered);
        assert_eq!(h.network.call_count(), 0);

        h.connectivity.set_online(true);
        h.sync.settle().await;

        assert_eq!(h.network.calls_to("/api/notes"), 1);
        assert!(h.store.get_mutation(&outcome.id).await.unwrap().is_none());
        assert_eq!(h.sync.unsynced_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_is_fifo() {
        let h = harness(false).await;
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(
                h.sync
                    .submit_payload(MutationKind::Note, json!({"n": n}))
                    .await
                    .unwrap()
                    .id,
            );
        }

        h.connectivity.set_online(true);
        let report = h.sync.drain().await.unwrap();

        assert_eq!(report.delivered, 5);
        let sent: Vec<_> = h
            .network
            .calls()
            .into_iter()
            .filter_map(|c| c.mutation_id)
            .collect();
        assert_eq!(sent, ids);
    }

    #[tokio::test]
    async fn test_failing_mutation_does_not_block_others() {
        let h = harness(false).await;
        h.network.respond("/api/contact", 422, "");

        h.sync.submit_payload(MutationKind::Contact, json!({})).await.unwrap();
        h.sync.submit_payload(MutationKind::Note, json!({"n": 1})).await.unwrap();

        h.connectivity.set_online(true);
        let report = h.sync.drain().await.unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(h.sync.unsynced_count().await.unwrap(), 1);

        let again = h.sync.drain().await.unwrap();
        assert_eq!(again.attempted, 1);
        assert_eq!(again.failed, 1);
    }

    #[tokio::test]
    async fn test_drain_prunes_synced_rows() {
        let h = harness(true).await;
        let immediate = h
            .sync
            .submit_payload(MutationKind::Note, json!({"n": 0}))
            .await
            .unwrap();
        assert!(immediate.delivered);

        h.connectivity.set_online(false);
        let queued = h
            .sync
            .submit_payload(MutationKind::Note, json!({"n": 1}))
            .await
            .unwrap();
        h.connectivity.set_online(true);

        let report = h.sync.drain().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.pruned, 2);
        assert!(h.store.get_mutation(&immediate.id).await.unwrap().is_none());
        assert!(h.store.get_mutation(&queued.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreadable_row_does_not_block_queue() {
        let dir = std::env::temp_dir().join(format!("tilawa-sync-{}", std::process::id()));
        let path = dir.join("queue.sqlite");
        let store = Store::open(&path).await.unwrap();

        let raw = tokio_rusqlite::Connection::open(&path).await.unwrap();
        raw.call(|conn| {
            conn.execute(
                "INSERT INTO pending_mutations (id, kind, endpoint, payload_json, created_at, synced)
                 VALUES ('legacy', 'bookmark', 'https://quran.example/api/bookmarks', '{}', '2024-01-01T00:00:00Z', 0)",
                [],
            )
        })
        .await
        .unwrap();
        raw.close().await.unwrap();

        let network = Arc::new(MockNetwork::new());
        network.respond("/api/notes", 200, "");
        let config = AppConfig { upstream_url: ORIGIN.into(), ..Default::default() };
        let connectivity = ConnectivityObserver::new(false);
        let sync = SyncManager::new(
            store.clone(),
            network.clone(),
            connectivity.clone(),
            Endpoints::from_config(&config).unwrap(),
        );
        let note = sync.submit_payload(MutationKind::Note, json!({"n": 1})).await.unwrap();
        connectivity.set_online(true);

        let report = sync.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(network.calls_to("/api/notes"), 1);
        assert!(store.get_mutation(&note.id).await.unwrap().is_none());

        let again = sync.drain().await.unwrap();
        assert_eq!(again.failed, 1);
        assert_eq!(again.delivered, 0);

        store.close().await.unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_drain_stops_when_connectivity_drops() {
        let h = harness(false).await;
        h.sync.submit_payload(MutationKind::Note, json!({"n": 1})).await.unwrap();

        let report = h.sync.drain().await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.attempted, 0);
        assert_eq!(h.network.call_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_single_flight() {
        let h = harness(false).await;
        h.sync.submit_payload(MutationKind::Note, json!({"n": 1})).await.unwrap();
        h.connectivity.set_online(true);
        h.network.pause();

        let first = {
            let sync = h.sync.clone();
            tokio::spawn(async move { sync.drain().await })
        };
        h.network.entered.notified().await;
        assert!(h.sync.is_draining());

        let second = h.sync.drain().await.unwrap();
        assert!(second.skipped);

        h.network.release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.delivered, 1);
        assert_eq!(h.network.call_count(), 1);
        assert!(!h.sync.is_draining());
    }

    #[tokio::test]
    async fn test_drain_skips_mutation_in_flight() {
        let h = harness(true).await;
        h.network.pause();

        let submit = {
            let sync = h.sync.clone();
            tokio::spawn(async move { sync.submit_payload(MutationKind::Contact, json!({"m": 1})).await })
        };
        h.network.entered.notified().await;

        let report = h.sync.drain().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.attempted, 0);

        h.network.release.notify_one();
        assert!(submit.await.unwrap().unwrap().delivered);
        assert_eq!(h.network.call_count(), 1);
    }

    #[tokio::test]
    async fn test_record_reading_position_saves_locally_and_queues() {
        let h = harness(false).await;
        let position =
            ReadingPosition { user_key: "reader-1".into(), surah: 18, ayat: 10, last_read_at: tilawa_core::store::now() };

        let outcome = h.sync.record_reading_position(&position).await.unwrap();

        assert!(!outcome.delivered);
        assert_eq!(h.store.get_reading_position("reader-1").await.unwrap(), Some(position));
        let queued = h.store.get_mutation(&outcome.id).await.unwrap().unwrap();
        assert_eq!(queued.kind, MutationKind::ReadingPosition);
        assert_eq!(queued.payload["surah"], 18);
    }

    #[tokio::test]
    async fn test_start_drains_leftovers_when_online() {
        let h = harness(false).await;
        h.sync.submit_payload(MutationKind::Note, json!({"n": 1})).await.unwrap();

        let restarted = SyncManager::new(
            h.store.clone(),
            h.network.clone(),
            ConnectivityObserver::new(true),
            h.sync.endpoints().clone(),
        );
        restarted.start().unwrap();
        restarted.settle().await;

        assert_eq!(h.network.calls_to("/api/notes"), 1);
        assert_eq!(restarted.unsynced_count().await.unwrap(), 0);
    }
}
