//! `/_edge/*` control endpoints.
//!
//! | route                            | effect                                  |
//! |----------------------------------|-----------------------------------------|
//! | `POST /connectivity`             | platform online/offline signal          |
//! | `POST /mutations`                | queue a write, one attempt if online    |
//! | `POST /drain`                    | run a drain cycle now                   |
//! | `PUT/GET /reading-position/:user`| local snapshot (+ queued mutation)      |
//! | `PUT/GET /pages/*route`          | static page snapshots                   |
//! | `GET /status`                    | connectivity, queue depth, bucket ages  |
//! | `GET /health`                    | liveness                                |

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tilawa_client::{BucketReport, ConnectivityState, DrainReport, SubmitOutcome};
use tilawa_core::{MutationKind, ReadingPosition, StaticPageSnapshot, store};

use crate::error::EdgeError;
use crate::handler::EdgeState;

/// Highest surah number.
const SURAH_COUNT: u16 = 114;

pub fn routes() -> Router<EdgeState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/connectivity", post(set_connectivity))
        .route("/mutations", post(submit_mutation))
        .route("/drain", post(drain))
        .route("/reading-position/:user", get(get_reading_position).put(put_reading_position))
        .route("/pages/*route", get(get_page).put(put_page))
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
pub struct StatusOutput {
    pub connectivity: ConnectivityState,
    pub activated: bool,
    pub draining: bool,
    pub unsynced_mutations: u64,
    pub buckets: Vec<BucketReport>,
}

async fn status(State(state): State<EdgeState>) -> Result<Json<StatusOutput>, EdgeError> {
    Ok(Json(StatusOutput {
        connectivity: state.connectivity.state(),
        activated: state.router.is_activated(),
        draining: state.sync.is_draining(),
        unsynced_mutations: state.sync.unsynced_count().await?,
        buckets: state.router.bucket_status().await?,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ConnectivityInput {
    pub online: bool,
}

#[derive(Debug, Serialize)]
pub struct ConnectivityOutput {
    pub changed: bool,
    pub state: ConnectivityState,
}

async fn set_connectivity(
    State(state): State<EdgeState>, Json(input): Json<ConnectivityInput>,
) -> Json<ConnectivityOutput> {
    let changed = state.connectivity.set_online(input.online);
    Json(ConnectivityOutput { changed, state: state.connectivity.state() })
}

#[derive(Debug, Deserialize)]
pub struct MutationInput {
    pub kind: MutationKind,
    pub payload: serde_json::Value,
}

/// Accepted as soon as the write is durable locally.
async fn submit_mutation(
    State(state): State<EdgeState>, Json(input): Json<MutationInput>,
) -> Result<(StatusCode, Json<SubmitOutcome>), EdgeError> {
    if !input.payload.is_object() {
        return Err(EdgeError::InvalidInput("payload must be a JSON object".into()));
    }
    let outcome = state.sync.submit_payload(input.kind, input.payload).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

async fn drain(State(state): State<EdgeState>) -> Result<Json<DrainReport>, EdgeError> {
    Ok(Json(state.sync.drain().await?))
}

#[derive(Debug, Deserialize)]
pub struct PositionInput {
    pub surah: u16,
    pub ayat: u16,
}

async fn put_reading_position(
    State(state): State<EdgeState>, Path(user): Path<String>, Json(input): Json<PositionInput>,
) -> Result<(StatusCode, Json<SubmitOutcome>), EdgeError> {
    if !(1..=SURAH_COUNT).contains(&input.surah) {
        return Err(EdgeError::InvalidInput(format!("surah must be 1..={SURAH_COUNT}")));
    }
    if input.ayat == 0 {
        return Err(EdgeError::InvalidInput("ayat must be at least 1".into()));
    }

    let position = ReadingPosition { user_key: user, surah: input.surah, ayat: input.ayat, last_read_at: store::now() };
    let outcome = state.sync.record_reading_position(&position).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

async fn get_reading_position(
    State(state): State<EdgeState>, Path(user): Path<String>,
) -> Result<Json<ReadingPosition>, EdgeError> {
    state
        .store
        .get_reading_position(&user)
        .await?
        .map(Json)
        .ok_or_else(|| EdgeError::NotFound(format!("no reading position for {user}")))
}

#[derive(Debug, Deserialize)]
pub struct PageInput {
    pub title: String,
    pub html: String,
}

fn page_route(raw: &str) -> String {
    format!("/{}", raw.trim_start_matches('/'))
}

async fn put_page(
    State(state): State<EdgeState>, Path(route): Path<String>, Json(input): Json<PageInput>,
) -> Result<StatusCode, EdgeError> {
    let snapshot =
        StaticPageSnapshot { route: page_route(&route), title: input.title, html: input.html, stored_at: store::now() };
    state.store.put_page_snapshot(&snapshot).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_page(
    State(state): State<EdgeState>, Path(route): Path<String>,
) -> Result<Json<StaticPageSnapshot>, EdgeError> {
    let route = page_route(&route);
    state
        .store
        .get_page_snapshot(&route)
        .await?
        .map(Json)
        .ok_or_else(|| EdgeError::NotFound(format!("no snapshot for {route}")))
}
