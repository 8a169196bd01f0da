//! HTTP adapter around the cache router.
//!
//! Every request outside `/_edge/` is translated into a router `Request`,
//! resolved against the upstream origin and answered through
//! `CacheRouter::on_fetch`. The `/_edge/` routes are control endpoints (see
//! [`crate::control`]).

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{Request as HttpRequest, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::Method;
use axum::response::Response as HttpResponse;
use tilawa_client::{
    CacheRouter, ConnectivityObserver, Endpoints, Network, Request, RequestMode, Response, ResponseSource, RouterConfig,
    SyncManager,
};
use tilawa_core::{AppConfig, Error, StalenessTracker, Store};

use crate::control;
use crate::error::EdgeError;

/// Largest request body forwarded upstream.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Response header naming where the body came from.
pub const SOURCE_HEADER: &str = "x-tilawa-source";

/// Left to the edge's own client, which decodes what it negotiates.
const STRIP_REQUEST_HEADERS: [HeaderName; 1] = [header::ACCEPT_ENCODING];

/// Hop-by-hop and length headers that must not be replayed as-is.
const STRIP_RESPONSE_HEADERS: [HeaderName; 4] =
    [header::CONNECTION, header::TRANSFER_ENCODING, header::CONTENT_LENGTH, header::CONTENT_ENCODING];

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct EdgeState {
    pub store: Store,
    pub connectivity: ConnectivityObserver,
    pub router: Arc<CacheRouter>,
    pub sync: SyncManager,
}

impl EdgeState {
    /// Wire observer, router and sync manager over one store and network.
    pub fn build(config: &AppConfig, store: Store, network: Arc<dyn Network>) -> Result<Self, Error> {
        let connectivity = ConnectivityObserver::new(config.start_online);
        let staleness = StalenessTracker::new(store.clone(), config.stale_after());
        let router = CacheRouter::new(
            store.clone(),
            Arc::clone(&network),
            connectivity.clone(),
            staleness,
            RouterConfig::from_app_config(config)?,
        );
        let sync = SyncManager::new(store.clone(), network, connectivity.clone(), Endpoints::from_config(config)?);

        Ok(Self { store, connectivity, router: Arc::new(router), sync })
    }
}

pub fn app(state: EdgeState) -> Router {
    Router::new()
        .nest("/_edge", control::routes())
        .fallback(proxy)
        .with_state(state)
}

async fn proxy(State(state): State<EdgeState>, request: HttpRequest) -> Result<HttpResponse, EdgeError> {
    let request = into_router_request(&state, request).await?;
    let response = state
        .router
        .on_fetch(&request)
        .await
        .map_err(EdgeError::Upstream)?;
    Ok(into_http_response(response))
}

/// Navigation if the browser says so, or a GET asking for HTML.
pub fn is_navigation(method: &Method, headers: &HeaderMap) -> bool {
    let fetch_mode = headers
        .get("sec-fetch-mode")
        .and_then(|v| v.to_str().ok());
    if fetch_mode == Some("navigate") {
        return true;
    }

    *method == Method::GET
        && headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/html"))
}

async fn into_router_request(state: &EdgeState, request: HttpRequest) -> Result<Request, EdgeError> {
    let (parts, body) = request.into_parts();

    let origin = &state.router.config().origin;
    if let Some(authority) = parts.uri.authority()
        && Some(authority.host()) != origin.host_str()
    {
        return Err(EdgeError::InvalidInput(format!("request target names another host: {authority}")));
    }

    // Path and query only; the host always comes from the configured origin.
    let mut url = origin.clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| EdgeError::InvalidInput(format!("unreadable request body: {e}")))?;

    let mode = if is_navigation(&parts.method, &parts.headers) { RequestMode::Navigate } else { RequestMode::Other };
    let mut request = Request::new(parts.method, url);
    request.mode = mode;
    request.headers = parts.headers;
    for name in &STRIP_REQUEST_HEADERS {
        request.headers.remove(name);
    }
    request.body = (!body.is_empty()).then_some(body);
    Ok(request)
}

fn into_http_response(response: Response) -> HttpResponse {
    let mut headers = response.headers;
    for name in &STRIP_RESPONSE_HEADERS {
        headers.remove(name);
    }
    let source = match response.source {
        ResponseSource::Network => "network",
        ResponseSource::Cache => "cache",
        ResponseSource::OfflineFallback => "offline-fallback",
    };
    headers.insert(HeaderName::from_static(SOURCE_HEADER), HeaderValue::from_static(source));

    let mut out = HttpResponse::new(Body::from(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = headers;
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::sync::Mutex;
    use tower::ServiceExt;

    pub(crate) const ORIGIN: &str = "https://quran.example";

    /// Answers 200 with the request path as the body; fails when `down`.
    #[derive(Default)]
    pub(crate) struct EchoNetwork {
        pub down: std::sync::atomic::AtomicBool,
        pub seen: Mutex<Vec<(Method, String, RequestMode)>>,
    }

    #[async_trait]
    impl Network for EchoNetwork {
        async fn fetch(&self, request: &Request) -> Result<Response, Error> {
            self.seen
                .lock()
                .unwrap()
                .push((request.method.clone(), request.url.path().to_string(), request.mode));
            if self.down.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::Network("connection refused".into()));
            }
            let mut response = Response::new(request.url.clone(), StatusCode::OK, request.url.path().to_string());
            response
                .headers
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            Ok(response)
        }
    }

    pub(crate) async fn state_with(network: Arc<EchoNetwork>) -> EdgeState {
        let config = AppConfig { upstream_url: ORIGIN.into(), ..Default::default() };
        let store = Store::open_in_memory().await.unwrap();
        let state = EdgeState::build(&config, store, network).unwrap();
        state.router.on_activate().await.unwrap();
        state
    }

    fn get(uri: &str) -> HttpRequest {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_navigation_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_navigation(&Method::GET, &headers));

        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"));
        assert!(is_navigation(&Method::GET, &headers));
        assert!(!is_navigation(&Method::POST, &headers));

        let mut headers = HeaderMap::new();
        headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
        assert!(is_navigation(&Method::POST, &headers));
    }

    #[tokio::test]
    async fn test_proxy_serves_from_network_then_cache() {
        let network = Arc::new(EchoNetwork::default());
        let state = state_with(network.clone()).await;

        let first = app(state.clone()).oneshot(get("/fonts/amiri.woff2")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()[SOURCE_HEADER], "network");

        let second = app(state).oneshot(get("/fonts/amiri.woff2")).await.unwrap();
        assert_eq!(second.headers()[SOURCE_HEADER], "cache");
        let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"/fonts/amiri.woff2");
        assert_eq!(network.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_proxy_offline_without_cache_is_gateway_timeout() {
        let network = Arc::new(EchoNetwork::default());
        let state = state_with(network.clone()).await;
        state.connectivity.set_online(false);

        let response = app(state).oneshot(get("/api/quran/1/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(network.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_proxy_navigation_gets_offline_page() {
        let network = Arc::new(EchoNetwork::default());
        let state = state_with(network.clone()).await;
        state.router.on_install().await.unwrap();
        network.down.store(true, std::sync::atomic::Ordering::SeqCst);

        let request = axum::http::Request::builder()
            .uri("/surah/18")
            .header(header::ACCEPT, "text/html")
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[SOURCE_HEADER], "offline-fallback");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"/offline");

        let (_, _, mode) = network.seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!(mode, RequestMode::Navigate);
    }

    #[tokio::test]
    async fn test_proxy_forwards_query_and_method() {
        let network = Arc::new(EchoNetwork::default());
        let state = state_with(network.clone()).await;

        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/search?q=light")
            .body(Body::from("{}"))
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();

        assert_eq!(response.headers()[SOURCE_HEADER], "network");
        let seen = network.seen.lock().unwrap();
        assert_eq!(seen[0].0, Method::POST);
        assert_eq!(seen[0].1, "/api/search");
    }

    #[tokio::test]
    async fn test_request_target_stays_on_origin() {
        let state = state_with(Arc::new(EchoNetwork::default())).await;

        let routed = into_router_request(&state, get("//attacker.example/steal?x=1"))
            .await
            .unwrap();
        assert_eq!(routed.url.host_str(), Some("quran.example"));
        assert_eq!(routed.url.path(), "//attacker.example/steal");
        assert_eq!(routed.url.query(), Some("x=1"));
    }

    #[tokio::test]
    async fn test_absolute_target_for_other_host_rejected() {
        let network = Arc::new(EchoNetwork::default());
        let state = state_with(network.clone()).await;

        let response = app(state).oneshot(get("http://attacker.example/steal")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(network.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_accept_encoding_not_forwarded() {
        let state = state_with(Arc::new(EchoNetwork::default())).await;
        let request = axum::http::Request::builder()
            .uri("/api/quran/1/1")
            .header(header::ACCEPT_ENCODING, "zstd, gzip")
            .header(header::ACCEPT, "application/json")
            .body(Body::empty())
            .unwrap();

        let routed = into_router_request(&state, request).await.unwrap();
        assert!(routed.headers.get(header::ACCEPT_ENCODING).is_none());
        assert_eq!(routed.headers[header::ACCEPT], "application/json");
    }

    #[test]
    fn test_response_source_header_values() {
        let url = url::Url::parse(ORIGIN).unwrap();
        let mut response = Response::new(url, StatusCode::OK, "x");
        response.source = ResponseSource::Cache;
        response
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("999"));

        let http = into_http_response(response);
        assert_eq!(http.headers()[SOURCE_HEADER], "cache");
        assert!(http.headers().get(header::CONTENT_LENGTH).is_none());
    }
}
