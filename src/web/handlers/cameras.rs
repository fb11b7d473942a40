//! Camera discovery endpoints

use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::ApiResponse;
use crate::discovery::{CameraRecord, Subnet, MIN_SCAN_PREFIX};
use crate::error::{AppError, Result};
use crate::state::AppState;

pub async fn list_cameras(State(state): State<Arc<AppState>>) -> Json<Vec<CameraRecord>> {
    Json(state.discovery.cached())
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    pub subnet: Option<String>,
    pub port: Option<u16>,
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct ScanResponse {
    pub found: usize,
    pub cameras: Vec<CameraRecord>,
}

/// An empty body means all defaults; anything else must be valid JSON
fn parse_scan_request(body: &[u8]) -> Result<ScanRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ScanRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("Invalid scan request: {}", e)))
}

/// Run a scan now; omitted fields fall back to the configured defaults
pub async fn scan_cameras(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ScanResponse>> {
    let req = parse_scan_request(&body)?;

    let mut options = state.discovery.default_options();
    if let Some(subnet) = req.subnet.filter(|s| !s.trim().is_empty()) {
        let parsed = Subnet::parse(&subnet).map_err(|e| AppError::BadRequest(e.to_string()))?;
        if parsed.prefix() < MIN_SCAN_PREFIX {
            return Err(AppError::BadRequest(format!(
                "Subnet {} is too large, at most /{} is scanned",
                parsed, MIN_SCAN_PREFIX
            )));
        }
        options.subnet = Some(subnet);
    }
    if let Some(port) = req.port {
        options.port = port;
    }
    if let Some(timeout_ms) = req.timeout_ms {
        options.timeout = Duration::from_millis(timeout_ms.clamp(50, 10_000));
    }

    let cameras = state.discovery.try_scan(&options).await?;
    Ok(Json(ScanResponse {
        found: cameras.len(),
        cameras,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    #[serde(default)]
    pub ip: String,
}

pub async fn resolve_camera(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResolveQuery>,
) -> Json<CameraRecord> {
    Json(state.selector.resolve(&query.ip))
}

#[derive(Debug, Deserialize)]
pub struct PreferredRequest {
    pub camera_ip: String,
}

/// Move `camera_ip` to the front of the preference list and persist it
pub async fn set_preferred_camera(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PreferredRequest>,
) -> Result<Json<ApiResponse>> {
    let ip: Ipv4Addr = req
        .camera_ip
        .trim()
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid camera IP: {}", req.camera_ip)))?;
    let ip = ip.to_string();

    state
        .config
        .update(|config| promote_ip(&mut config.discovery.preferred_ips, &ip))
        .await?;

    info!("Preferred camera set to {}", ip);
    Ok(Json(ApiResponse::ok(format!("Preferred camera set to {}", ip))))
}

fn promote_ip(list: &mut Vec<String>, ip: &str) {
    list.retain(|existing| existing != ip);
    list.insert(0, ip.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scan_request() {
        let req = parse_scan_request(b"").unwrap();
        assert!(req.subnet.is_none() && req.port.is_none());

        let req = parse_scan_request(br#"{"subnet": "10.0.0.0/24", "port": 8554}"#).unwrap();
        assert_eq!(req.subnet.as_deref(), Some("10.0.0.0/24"));
        assert_eq!(req.port, Some(8554));

        let err = parse_scan_request(br#"{"subnet": "#).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        let err = parse_scan_request(br#"{"port": "not a port"}"#).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn test_promote_ip() {
        let mut list = vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()];
        promote_ip(&mut list, "10.0.0.6");
        assert_eq!(list, vec!["10.0.0.6", "10.0.0.5"]);

        promote_ip(&mut list, "10.0.0.7");
        assert_eq!(list, vec!["10.0.0.7", "10.0.0.6", "10.0.0.5"]);
    }
}
