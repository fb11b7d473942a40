//! Camera HTTP API passthrough: snapshots, connectivity, archive URLs

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::camera::{playback_stream_key, playback_url, ConnectionReport, Recording};
use crate::error::Result;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PlaybackQuery {
    pub channel: String,
    pub start: String,
    pub end: Option<String>,
    #[serde(default)]
    pub camera_ip: String,
}

#[derive(Serialize)]
pub struct PlaybackUrlResponse {
    pub url: String,
    pub stream_key: String,
}

pub async fn get_playback_url(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PlaybackQuery>,
) -> Result<Json<PlaybackUrlResponse>> {
    let camera = state.selector.resolve(&query.camera_ip);
    let url = playback_url(
        &camera.ip,
        camera.port,
        &query.channel,
        &query.start,
        query.end.as_deref(),
    )?;
    let stream_key = playback_stream_key(&url);
    Ok(Json(PlaybackUrlResponse { url, stream_key }))
}

#[derive(Debug, Deserialize)]
pub struct RecordingsQuery {
    pub channel: String,
    /// `dd.mm.yyyy`
    pub start: String,
    pub end: Option<String>,
    #[serde(default)]
    pub camera_ip: String,
}

#[derive(Serialize)]
pub struct RecordingsResponse {
    pub recordings: Vec<Recording>,
    pub camera_ip: String,
    pub start_date: String,
    pub end_date: Option<String>,
}

/// Archive search on the resolved camera
pub async fn get_recordings(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordingsQuery>,
) -> Result<Json<RecordingsResponse>> {
    let camera = state.selector.resolve(&query.camera_ip);
    let recordings = state
        .camera_api
        .search_recordings(&camera, &query.channel, &query.start, query.end.as_deref())
        .await?;
    Ok(Json(RecordingsResponse {
        recordings,
        camera_ip: camera.ip,
        start_date: query.start,
        end_date: query.end,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct CameraQuery {
    #[serde(default)]
    pub camera_ip: String,
}

pub async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<CameraQuery>,
) -> Result<Response> {
    let camera = state.selector.resolve(&query.camera_ip);
    let jpeg = state.camera_api.snapshot(&camera, &channel).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        jpeg,
    )
        .into_response())
}

pub async fn test_connection(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CameraQuery>,
) -> Result<Json<ConnectionReport>> {
    let camera = state.selector.resolve(&query.camera_ip);
    Ok(Json(state.camera_api.test_connection(&camera).await?))
}
