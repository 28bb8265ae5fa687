//! `/api/now-playing` and `/api/guide` JSON snapshots.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::error::Result;
use crate::web::AppState;

/// What's airing right now on each channel, joined against the channel list so channels with
/// no current program still appear (with a `null` program).
pub async fn now_playing(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let now = chrono::Utc::now().timestamp_millis();
    let active = state.store.select_active(now).await?;

    let entries: Vec<serde_json::Value> = state
        .channels
        .all()
        .iter()
        .map(|channel| {
            let program = active
                .iter()
                .find(|p| p.channel_service_id == channel.number);
            json!({
                "number": channel.number,
                "name": channel.name,
                "icon_url": channel.icon_url,
                "program": program.map(|p| json!({
                    "title": p.title,
                    "description": p.description,
                    "start_time": p.start_time,
                    "end_time": p.end_time,
                })),
            })
        })
        .collect();

    Ok(Json(json!({ "channels": entries })))
}

#[derive(Debug, Deserialize)]
pub struct GuideQuery {
    /// Window start, unix millis. Defaults to now.
    pub start: Option<i64>,
    /// Window end, unix millis. Defaults to `start + 24h`.
    pub end: Option<i64>,
}

const DEFAULT_GUIDE_WINDOW_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Program rows within a time window, for a client-side guide grid.
pub async fn guide(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GuideQuery>,
) -> Result<impl IntoResponse> {
    let start = query
        .start
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    let end = query.end.unwrap_or(start + DEFAULT_GUIDE_WINDOW_MILLIS);

    let rows = state.store.select_window(start, end).await?;
    let programs: Vec<serde_json::Value> = rows
        .iter()
        .map(|p| {
            json!({
                "channel": p.channel_service_id,
                "title": p.title,
                "description": p.description,
                "start_time": p.start_time,
                "end_time": p.end_time,
            })
        })
        .collect();

    Ok(Json(
        json!({ "start": start, "end": end, "programs": programs }),
    ))
}
