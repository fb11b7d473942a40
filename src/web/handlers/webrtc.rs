//! WebRTC signaling endpoints

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::ApiResponse;
use crate::camera::playback_stream_key;
use crate::discovery::CameraCredentials;
use crate::error::{AppError, Result};
use crate::rtsp::SourceInfo;
use crate::state::AppState;
use crate::webrtc::{
    AnswerResponse, CloseRequest, PlaybackOfferRequest, SdpAnswer, SdpOffer, SessionInfo,
};

#[derive(Debug, Deserialize)]
pub struct LiveOfferQuery {
    pub channel: String,
    #[serde(default)]
    pub camera_ip: String,
}

/// Live view: offer for one configured channel
pub async fn webrtc_offer(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LiveOfferQuery>,
    Json(offer): Json<SdpOffer>,
) -> Result<Json<AnswerResponse>> {
    let channel = query.channel.trim();
    if channel.is_empty() {
        return Err(AppError::BadRequest("Channel is required".to_string()));
    }

    let camera = state.selector.resolve(&query.camera_ip);
    let url = state
        .config
        .get()
        .channel_url(channel, &camera.ip, camera.port)
        .ok_or_else(|| AppError::NotFound(format!("Unknown channel: {}", channel)))?;

    let answer = relay(&state, channel, &url, &camera.credentials(), offer.sdp).await?;
    Ok(Json(answer))
}

/// Archive view: offer for a playback URL from `/api/playback-url`
pub async fn webrtc_offer_playback(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlaybackOfferRequest>,
) -> Result<Json<AnswerResponse>> {
    let parsed = url::Url::parse(req.url.trim())
        .map_err(|e| AppError::BadRequest(format!("Invalid playback URL: {}", e)))?;
    if !matches!(parsed.scheme(), "rtsp" | "rtsps") {
        return Err(AppError::BadRequest(
            "Playback URL must be an rtsp:// URL".to_string(),
        ));
    }

    // Credentials of the camera the URL points at, else the configured ones
    let credentials = parsed
        .host_str()
        .and_then(|host| state.discovery.get(host))
        .map(|camera| camera.credentials())
        .unwrap_or_else(|| state.discovery.settings().credentials());

    let key = playback_stream_key(parsed.as_str());
    let answer = relay(&state, &key, parsed.as_str(), &credentials, req.offer.sdp).await?;
    Ok(Json(answer))
}

/// acquire source -> replace session -> start pump -> answer
async fn relay(
    state: &AppState,
    key: &str,
    url: &str,
    credentials: &CameraCredentials,
    offer_sdp: String,
) -> Result<AnswerResponse> {
    let conn = match state.pool.acquire(url, credentials).await {
        Ok(conn) => conn,
        Err(e) => {
            if e.stale.is_some() {
                warn!("Source for {} is down and could not be reopened", key);
            }
            return Err(e.into());
        }
    };

    let session = state.sessions.create_session(key).await?;
    if let Err(e) = state.sessions.start_pump(&session, conn).await {
        state.sessions.close_session_if(key, session.id()).await;
        return Err(e);
    }

    let sdp = state.sessions.handle_offer(&session, offer_sdp).await?;
    info!("Answered offer for {} (session {})", key, session.id());

    Ok(AnswerResponse {
        answer: SdpAnswer::new(sdp),
        stream_key: key.to_string(),
        session_id: session.id().to_string(),
    })
}

pub async fn webrtc_close(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CloseRequest>,
) -> Result<Json<ApiResponse>> {
    if state.sessions.close_session(&req.stream_key).await {
        Ok(Json(ApiResponse::ok(format!("Session {} closed", req.stream_key))))
    } else {
        Err(AppError::NotFound(format!(
            "No session for stream {}",
            req.stream_key
        )))
    }
}

#[derive(Serialize)]
pub struct RelayStatus {
    pub sessions: Vec<SessionInfo>,
    pub connections: Vec<SourceInfo>,
}

pub async fn webrtc_sessions(State(state): State<Arc<AppState>>) -> Json<RelayStatus> {
    Json(RelayStatus {
        sessions: state.sessions.list(),
        connections: state.pool.list(),
    })
}
