//! HTTP glue: router assembly, shared application state, and graceful shutdown wiring.

pub mod api;
pub mod playlist;
pub mod stream;
pub mod xmltv;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use crate::channel::ChannelRegistry;
use crate::epg::{EpgOrchestrator, EpgStore};
use crate::error::Result;
use crate::tuner::arbiter::TunerArbiter;
use crate::tuner::session::SpawnConfig;
use crate::tuner::supervisor::{TranscodeCodec, TranscodeMode};

/// State shared by every handler. The core components (`ChannelRegistry`, `TunerArbiter`,
/// `EpgStore`, `EpgOrchestrator`) are injected already-constructed; this layer only adds the
/// HTTP-specific bits (default transcode selectors, the session id counter, shutdown signal).
pub struct AppState {
    pub channels: Arc<ChannelRegistry>,
    pub arbiter: Arc<TunerArbiter>,
    pub store: Arc<EpgStore>,
    pub orchestrator: Arc<EpgOrchestrator>,
    pub spawn_config: SpawnConfig,
    pub default_mode: TranscodeMode,
    pub default_codec: TranscodeCodec,
    pub base_url: String,
    pub next_session_id: AtomicU64,
    pub shutdown_tx: broadcast::Sender<()>,
}

#[derive(Debug, Deserialize, Default)]
struct PlaylistQuery {
    #[serde(rename = "f")]
    container: Option<String>,
    #[serde(rename = "c")]
    codec: Option<String>,
}

async fn playlist(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PlaylistQuery>,
) -> impl IntoResponse {
    let body = playlist::build(
        &state.channels,
        &state.base_url,
        query.container.as_deref(),
        query.codec.as_deref(),
    );
    (
        [(axum::http::header::CONTENT_TYPE, "application/x-mpegurl")],
        body,
    )
}

async fn xmltv_document(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let now = chrono::Utc::now().timestamp_millis();
    let programs = state.store.select_active(now).await?;
    let body = xmltv::build(&state.channels, &programs, now);
    Ok((
        [(axum::http::header::CONTENT_TYPE, "application/xml")],
        body,
    ))
}

/// Assemble the router. Serving is left to the caller so `main` can race it against the
/// shutdown signal.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/playlist.m3u", get(playlist))
        .route("/lineup.m3u", get(playlist))
        .route("/xmltv.xml", get(xmltv_document))
        .route("/stream/:num", get(stream::stream_channel))
        .route(
            "/stream/:num/:format/:codec",
            get(stream::stream_channel_with_path_selectors),
        )
        .route("/api/now-playing", get(api::now_playing))
        .route("/api/guide", get(api::guide))
        .with_state(state)
        .layer(CorsLayer::permissive())
}
