//! `/stream/:num` handler: resolves selectors, starts a session, and streams its output.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::error::{GatewayError, Result};
use crate::tuner::session::{resolve_selectors, Session};
use crate::web::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct StreamQuery {
    #[serde(rename = "f")]
    pub container: Option<String>,
    #[serde(rename = "c")]
    pub codec: Option<String>,
    pub engine: Option<String>,
}

/// `GET /stream/:num` with optional selectors from either a query string or trailing path
/// segments, per the external-interfaces contract's `/:format/:codec` alternative form.
pub async fn stream_channel(
    State(state): State<Arc<AppState>>,
    Path(num): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Response> {
    stream_with_selectors(
        state,
        num,
        query.container.as_deref(),
        query.codec.as_deref(),
        query.engine.as_deref(),
    )
    .await
}

/// `GET /stream/:num/:format/:codec` path-segment form of the same selectors.
pub async fn stream_channel_with_path_selectors(
    State(state): State<Arc<AppState>>,
    Path((num, format, codec)): Path<(String, String, String)>,
) -> Result<Response> {
    stream_with_selectors(state, num, Some(&format), Some(&codec), None).await
}

async fn stream_with_selectors(
    state: Arc<AppState>,
    num: String,
    container: Option<&str>,
    codec: Option<&str>,
    engine: Option<&str>,
) -> Result<Response> {
    state.orchestrator.wait_until_ready().await;

    let channel = state
        .channels
        .find(&num)
        .ok_or_else(|| GatewayError::ChannelNotFound(num.clone()))?;
    let selectors = resolve_selectors(
        container,
        codec,
        engine,
        state.default_mode,
        state.default_codec,
    );

    let session_id = state.next_session_id.fetch_add(1, Ordering::Relaxed);
    let mut session = Session::start(
        session_id,
        channel,
        selectors,
        state.arbiter.clone(),
        &state.spawn_config,
    )
    .await?;
    let output = session
        .take_output()
        .expect("freshly started session always has output to take");

    let shutdown_rx = state.shutdown_tx.subscribe();
    let arbiter = state.arbiter.clone();
    tokio::spawn(async move { session.run_until_closed(arbiter, shutdown_rx).await });

    let body = Body::from_stream(ReaderStream::new(output));

    Ok((
        [
            (CONTENT_TYPE, selectors.container.content_type()),
            (CONNECTION, "keep-alive"),
            (CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}
