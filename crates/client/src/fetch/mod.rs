//! Network seam and the reqwest-backed fetch client.
//!
//! ### Requests
//! - Identity for caching is method + canonical URL (fragment dropped).
//! - `RequestMode::Navigate` marks page navigations; only those may fall
//!   back to the offline page.
//!
//! ### Responses
//! - Any HTTP status is a response, not an error. Only transport failures
//!   (DNS, connect, reset, client timeout) surface as `Error::Network`.
//! - `ResponseKind::Basic` means same-origin; only basic responses are
//!   cached by the default strategy.

pub mod url;

use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode, Url};
use serde::Serialize;
use tilawa_core::{CachedEntry, Error, store::request_key};

pub use self::url::{UrlError, canonicalize, resolve};

/// Response headers persisted with a cached entry and replayed on a hit.
pub const REPLAY_HEADERS: &[&str] =
    &["content-type", "cache-control", "etag", "last-modified", "content-language"];

/// Whether a request is a top-level page navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    Navigate,
    Other,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub mode: RequestMode,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self { method, url, mode: RequestMode::Other, headers: HeaderMap::new(), body: None }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// A GET navigation, as issued when the reader opens a page.
    pub fn navigate(url: Url) -> Self {
        Self { mode: RequestMode::Navigate, ..Self::get(url) }
    }

    /// A JSON POST, used for mutation delivery.
    pub fn post_json(url: Url, payload: &serde_json::Value) -> Result<Self, Error> {
        let body = serde_json::to_vec(payload)?;
        let mut request = Self::new(Method::POST, url);
        request
            .headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        request.body = Some(Bytes::from(body));
        Ok(request)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Cache key for this request's identity.
    pub fn cache_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        request_key(self.method.as_str(), url.as_str())
    }
}

/// Where the response handed back to the caller came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Network,
    Cache,
    OfflineFallback,
}

/// Response type in the fetch sense: same-origin or cross-origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Basic,
    Cors,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub kind: ResponseKind,
    pub source: ResponseSource,
    /// Set when the response was served from a bucket.
    pub stored_at: Option<DateTime<Utc>>,
}

impl Response {
    /// A network response with the given status and body.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            kind: ResponseKind::Basic,
            source: ResponseSource::Network,
            stored_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Snapshot for the cache, keeping only the replay headers.
    pub fn to_entry(&self, method: &Method) -> CachedEntry {
        let headers = REPLAY_HEADERS
            .iter()
            .filter_map(|name| {
                self.headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| ((*name).to_string(), v.to_string()))
            })
            .collect();

        let mut url = self.url.clone();
        url.set_fragment(None);
        CachedEntry::new(method.as_str(), url.as_str(), self.status.as_u16(), headers, self.body.to_vec())
    }

    /// Rebuild a response from a cached entry.
    pub fn from_entry(entry: CachedEntry, source: ResponseSource) -> Result<Self, Error> {
        let url = Url::parse(&entry.url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let status = StatusCode::from_u16(entry.status).map_err(|e| Error::Serialization(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &entry.headers {
            let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) else {
                tracing::debug!(header = %name, "dropping unreplayable cached header");
                continue;
            };
            headers.insert(name, value);
        }

        Ok(Self {
            url,
            status,
            headers,
            body: Bytes::from(entry.body),
            kind: ResponseKind::Basic,
            source,
            stored_at: Some(entry.stored_at),
        })
    }
}

/// Anything that can turn a request into a response.
///
/// Implementations must report transport failures as `Err` and hand back
/// every HTTP status, including 4xx/5xx, as `Ok`.
#[async_trait::async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, Error>;
}

/// Configuration for the fetch client.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string (default: "tilawa-edge/0.1")
    pub user_agent: String,

    /// Request timeout (default: 20s)
    pub timeout: Duration,

    /// Maximum number of redirects to follow (default: 5)
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { user_agent: "tilawa-edge/0.1".to_string(), timeout: Duration::from_millis(20000), max_redirects: 5 }
    }
}

impl From<&tilawa_core::AppConfig> for FetchConfig {
    fn from(config: &tilawa_core::AppConfig) -> Self {
        Self { user_agent: config.user_agent.clone(), timeout: config.timeout(), ..Default::default() }
    }
}

/// HTTP client used as the production `Network`.
pub struct FetchClient {
    http: Client,
}

impl FetchClient {
    /// Create a new fetch client with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl Network for FetchClient {
    async fn fetch(&self, request: &Request) -> Result<Response, Error> {
        let start = Instant::now();

        let mut builder = self.http.request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            if *name == header::HOST || *name == header::CONTENT_LENGTH {
                continue;
            }
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Network(format!("timeout fetching {}", request.url))
            } else {
                Error::Network(format!("network error: {e}"))
            }
        })?;

        let status = response.status();
        let final_url = response.url().clone();
        let headers = response.headers().clone();
        let kind = if final_url.origin() == request.url.origin() { ResponseKind::Basic } else { ResponseKind::Cors };

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("failed to read response: {e}")))?;

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            status = status.as_u16(),
            bytes = body.len(),
            fetch_ms = start.elapsed().as_millis() as u64,
            "fetched"
        );

        Ok(Response { url: final_url, status, headers, body, kind, source: ResponseSource::Network, stored_at: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_fetch_config_default() {
        let config = FetchConfig::default();
        assert_eq!(config.user_agent, "tilawa-edge/0.1");
        assert_eq!(config.timeout, Duration::from_millis(20000));
        assert_eq!(config.max_redirects, 5);
    }

    #[test]
    fn test_fetch_config_from_app_config() {
        let app = tilawa_core::AppConfig { user_agent: "reader/2".into(), timeout_ms: 1500, ..Default::default() };
        let config = FetchConfig::from(&app);
        assert_eq!(config.user_agent, "reader/2");
        assert_eq!(config.timeout, Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_fetch_client_new() {
        let client = FetchClient::new(FetchConfig::default());
        assert!(client.is_ok());
    }

    #[test]
    fn test_cache_key_ignores_fragment() {
        let a = Request::get(url("https://q.example/surah/2#ayah-255"));
        let b = Request::get(url("https://q.example/surah/2"));
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), Request::new(Method::HEAD, url("https://q.example/surah/2")).cache_key());
    }

    #[test]
    fn test_post_json_sets_body_and_type() {
        let req = Request::post_json(url("https://q.example/api/contact"), &serde_json::json!({"m": 1})).unwrap();
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(req.body.as_deref(), Some(br#"{"m":1}"#.as_slice()));
    }

    #[test]
    fn test_entry_keeps_replay_headers_only() {
        let mut response = Response::new(url("https://q.example/fonts/a.ttf"), StatusCode::OK, "bytes");
        response
            .headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("font/ttf"));
        response
            .headers
            .insert(header::SET_COOKIE, HeaderValue::from_static("session=1"));

        let entry = response.to_entry(&Method::GET);
        assert_eq!(entry.header("content-type"), Some("font/ttf"));
        assert_eq!(entry.header("set-cookie"), None);

        let replayed = Response::from_entry(entry, ResponseSource::Cache).unwrap();
        assert_eq!(replayed.body, Bytes::from_static(b"bytes"));
        assert_eq!(replayed.headers.get(header::CONTENT_TYPE).unwrap(), "font/ttf");
        assert_eq!(replayed.source, ResponseSource::Cache);
        assert!(replayed.stored_at.is_some());
    }
}
