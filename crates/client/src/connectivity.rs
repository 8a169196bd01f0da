//! Online/offline state machine.
//!
//! The observer holds a single `Online | Offline` state seeded from the
//! platform flag at construction. Only platform events (`set_online`) move
//! it; repeating the current state is a no-op.
//!
//! On every offline → online transition the registered listeners run
//! synchronously, in registration order. A listener that errors or panics is
//! logged and the rest still run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tilawa_core::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn from_flag(online: bool) -> Self {
        if online { Connectivity::Online } else { Connectivity::Offline }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
    pub status: Connectivity,
    pub changed_at: DateTime<Utc>,
}

/// Callback fired when connectivity comes back.
pub trait ConnectivityListener: Send + Sync {
    fn on_online(&self) -> Result<(), Error>;
}

struct Inner {
    state: watch::Sender<ConnectivityState>,
    listeners: Mutex<Vec<Arc<dyn ConnectivityListener>>>,
}

/// Shared handle; clones observe the same state.
#[derive(Clone)]
pub struct ConnectivityObserver {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectivityObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityObserver")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectivityObserver {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(ConnectivityState {
            status: Connectivity::from_flag(initially_online),
            changed_at: Utc::now(),
        });
        Self { inner: Arc::new(Inner { state, listeners: Mutex::new(Vec::new()) }) }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.inner.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().status == Connectivity::Online
    }

    /// Register a listener for offline → online transitions.
    pub fn register(&self, listener: Arc<dyn ConnectivityListener>) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Watch every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state.subscribe()
    }

    /// Apply a platform connectivity signal.
    ///
    /// Returns `true` when the state actually changed.
    pub fn set_online(&self, online: bool) -> bool {
        let next = Connectivity::from_flag(online);
        let changed = self.inner.state.send_if_modified(|state| {
            if state.status == next {
                return false;
            }
            *state = ConnectivityState { status: next, changed_at: Utc::now() };
            true
        });

        if !changed {
            return false;
        }

        tracing::info!(status = ?next, "connectivity changed");
        if next == Connectivity::Online {
            self.notify_online();
        }
        true
    }

    fn notify_online(&self) {
        // Snapshot so a listener may register others without deadlocking.
        let listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (index, listener) in listeners.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| listener.on_online())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(listener = index, error = %e, "online listener failed"),
                Err(_) => tracing::warn!(listener = index, "online listener panicked"),
            }
        }
    }
}
