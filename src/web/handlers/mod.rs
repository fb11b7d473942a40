pub mod cameras;
pub mod media;
pub mod webrtc;

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::config::ChannelConfig;
use crate::discovery::CameraStatus;
use crate::state::AppState;
use crate::utils::outbound_ipv4;

/// Generic success response
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }
}

// ============================================================================
// Health & Info
// ============================================================================

#[derive(Serialize)]
pub struct PingResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct SystemInfo {
    pub version: &'static str,
    pub build_date: &'static str,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
    pub cameras_known: usize,
    pub cameras_online: usize,
    pub sessions: usize,
    pub rtsp_connections: usize,
}

pub async fn system_info(State(state): State<Arc<AppState>>) -> Json<SystemInfo> {
    let cameras = state.discovery.cached();
    let cameras_online = cameras
        .iter()
        .filter(|c| c.status == CameraStatus::Online)
        .count();

    Json(SystemInfo {
        version: env!("CARGO_PKG_VERSION"),
        build_date: env!("BUILD_DATE"),
        uptime_secs: state.uptime().as_secs(),
        local_ip: outbound_ipv4().ok().map(|ip| ip.to_string()),
        cameras_known: cameras.len(),
        cameras_online,
        sessions: state.sessions.len(),
        rtsp_connections: state.pool.len(),
    })
}

pub async fn list_channels(State(state): State<Arc<AppState>>) -> Json<Vec<ChannelConfig>> {
    Json(state.config.get().channels.clone())
}
