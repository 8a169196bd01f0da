//! In-process `Network` double for router and sync tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use tilawa_core::Error;
use tokio::sync::Notify;
use url::Position;

use crate::fetch::{Network, Request, Response, ResponseKind};

pub(crate) const ORIGIN: &str = "https://quran.example";

pub(crate) fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub method: Method,
    pub path: String,
    pub mutation_id: Option<String>,
    pub body: Option<serde_json::Value>,
}

/// Routes keyed by path + query. Unknown routes answer 404.
#[derive(Default)]
pub(crate) struct MockNetwork {
    routes: Mutex<HashMap<String, (StatusCode, String, ResponseKind)>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Call>>,
    down: AtomicBool,
    paused: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, path: &str, status: u16, body: &str) {
        self.respond_with_kind(path, status, body, ResponseKind::Basic);
    }

    pub fn respond_with_kind(&self, path: &str, status: u16, body: &str, kind: ResponseKind) {
        let status = StatusCode::from_u16(status).unwrap();
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), (status, body.to_string(), kind));
    }

    /// Transport failure for one path.
    pub fn fail(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    /// Transport failure for every request.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Block every fetch until `release` is notified; `entered` fires on arrival.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls().iter().filter(|c| c.path == path).count()
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, Error> {
        let path = request.url[Position::BeforePath..Position::AfterQuery].to_string();
        let mutation_id = request
            .headers
            .get("x-mutation-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = request
            .body
            .as_ref()
            .and_then(|b| serde_json::from_slice(b).ok());
        self.calls
            .lock()
            .unwrap()
            .push(Call { method: request.method.clone(), path: path.clone(), mutation_id, body });

        if self.paused.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }

        if self.down.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&path) {
            return Err(Error::Network(format!("connection refused: {path}")));
        }

        let route = self.routes.lock().unwrap().get(&path).cloned();
        let (status, body, kind) = route.unwrap_or((StatusCode::NOT_FOUND, String::new(), ResponseKind::Basic));
        let mut response = Response::new(request.url.clone(), status, body);
        response.kind = kind;
        Ok(response)
    }
}
