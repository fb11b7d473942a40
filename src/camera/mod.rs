//! Camera vendor HTTP API (ISAPI)

mod playback;
mod recordings;

pub use playback::{format_rtsp_time, playback_stream_key, playback_url, DEFAULT_PLAYBACK_HOURS};
pub use recordings::{parse_search_date, search_window, Recording, MAX_SEARCH_RESULTS};

use bytes::Bytes;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;

use crate::discovery::{CameraRecord, Probe, TcpProbe};
use crate::error::{AppError, Result};

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);
const DEVICE_INFO_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a connectivity check
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub ip: String,
    pub rtsp_reachable: bool,
    pub http_ok: bool,
    pub message: String,
}

pub struct CameraClient {
    client: reqwest::Client,
    http_port: u16,
}

impl CameraClient {
    pub fn new(http_port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, http_port })
    }

    fn base_url(&self, camera: &CameraRecord) -> String {
        format!("http://{}:{}", camera.ip, self.http_port)
    }

    /// JPEG snapshot of `channel`
    pub async fn snapshot(&self, camera: &CameraRecord, channel: &str) -> Result<Bytes> {
        let url = format!(
            "{}/ISAPI/Streaming/channels/{}/picture",
            self.base_url(camera),
            channel
        );
        debug!("Fetching snapshot from {}", url);

        let response = self
            .client
            .get(&url)
            .basic_auth(&camera.username, Some(&camera.password))
            .timeout(SNAPSHOT_TIMEOUT)
            .send()
            .await
            .map_err(|e| AppError::Camera(format!("Snapshot request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Camera(format!(
                "Snapshot failed: HTTP {}",
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| AppError::Camera(format!("Failed to read snapshot: {}", e)))
    }

    /// Check that the RTSP port answers and the HTTP API accepts the credentials
    pub async fn test_connection(&self, camera: &CameraRecord) -> Result<ConnectionReport> {
        let ip: IpAddr = camera
            .ip
            .parse()
            .map_err(|_| AppError::BadRequest(format!("Invalid camera IP: {}", camera.ip)))?;

        let rtsp_reachable = TcpProbe
            .probe(SocketAddr::new(ip, camera.port), CONNECT_TIMEOUT)
            .await;
        if !rtsp_reachable {
            return Err(AppError::Camera(format!(
                "RTSP port {}:{} unreachable",
                camera.ip, camera.port
            )));
        }

        let url = format!("{}/ISAPI/System/deviceInfo", self.base_url(camera));
        let response = self
            .client
            .get(&url)
            .basic_auth(&camera.username, Some(&camera.password))
            .timeout(DEVICE_INFO_TIMEOUT)
            .send()
            .await
            .map_err(|e| AppError::Camera(format!("Device info request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AppError::Camera("Camera rejected the credentials".to_string()));
        }
        if !status.is_success() {
            return Err(AppError::Camera(format!("Device info failed: HTTP {}", status)));
        }

        Ok(ConnectionReport {
            ip: camera.ip.clone(),
            rtsp_reachable,
            http_ok: true,
            message: "Connection OK".to_string(),
        })
    }

    /// Recorded segments of `channel` between two dates (`dd.mm.yyyy`,
    /// whole days; the end defaults to today)
    pub async fn search_recordings(
        &self,
        camera: &CameraRecord,
        channel: &str,
        start_date: &str,
        end_date: Option<&str>,
    ) -> Result<Vec<Recording>> {
        let channel = channel.trim();
        if channel.is_empty() {
            return Err(AppError::BadRequest("Channel is required".to_string()));
        }
        let (start_time, end_time) = search_window(start_date, end_date)?;
        let body = recordings::search_request_xml(channel, &start_time, &end_time)?;

        let url = format!("{}/ISAPI/ContentMgmt/search", self.base_url(camera));
        debug!(
            "Searching recordings of channel {} from {} to {}",
            channel, start_time, end_time
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&camera.username, Some(&camera.password))
            .header(reqwest::header::CONTENT_TYPE, "application/xml; charset=UTF-8")
            .body(body)
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| AppError::Camera(format!("Recording search request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AppError::Camera("Camera rejected the credentials".to_string()));
        }
        if !status.is_success() {
            return Err(AppError::Camera(format!(
                "Recording search failed: HTTP {}",
                status
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| AppError::Camera(format!("Failed to read search response: {}", e)))?;
        recordings::parse_search_response(&text, channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::CameraCredentials;
    use axum::{
        http::{header, HeaderMap, StatusCode},
        routing::{get, post},
        Router,
    };
    use tokio::net::TcpListener;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];

    const SEARCH_RESULT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<CMSearchResult version="2.0" xmlns="http://www.hikvision.com/ver20/XMLSchema">
  <numOfMatches>1</numOfMatches>
  <matchList>
    <searchMatchItem>
      <trackID>201</trackID>
      <timeSpan>
        <startTime>2024-01-31T08:00:00Z</startTime>
        <endTime>2024-01-31T09:00:00Z</endTime>
      </timeSpan>
    </searchMatchItem>
  </matchList>
</CMSearchResult>"#;

    fn authorized(headers: &HeaderMap) -> bool {
        // admin:pw
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            == Some("Basic YWRtaW46cHc=")
    }

    /// Fake camera: HTTP API and "RTSP" port are the same listener
    async fn fake_camera() -> u16 {
        let app = Router::new()
            .route(
                "/ISAPI/Streaming/channels/:channel/picture",
                get(|headers: HeaderMap| async move {
                    if authorized(&headers) {
                        Ok(JPEG.to_vec())
                    } else {
                        Err(StatusCode::UNAUTHORIZED)
                    }
                }),
            )
            .route(
                "/ISAPI/System/deviceInfo",
                get(|headers: HeaderMap| async move {
                    if authorized(&headers) {
                        StatusCode::OK
                    } else {
                        StatusCode::UNAUTHORIZED
                    }
                }),
            )
            .route(
                "/ISAPI/ContentMgmt/search",
                post(|headers: HeaderMap, body: String| async move {
                    if !authorized(&headers) {
                        return Err(StatusCode::UNAUTHORIZED);
                    }
                    let wanted = body.contains("<trackID>201</trackID>")
                        && body.contains("<startTime>2024-01-31T00:00:00Z</startTime>")
                        && body.contains("<endTime>2024-01-31T23:59:59Z</endTime>");
                    if wanted {
                        Ok(SEARCH_RESULT)
                    } else {
                        Err(StatusCode::BAD_REQUEST)
                    }
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn camera(port: u16, password: &str) -> CameraRecord {
        CameraRecord::online("127.0.0.1", port, &CameraCredentials::new("admin", password))
    }

    #[tokio::test]
    async fn test_snapshot() {
        let port = fake_camera().await;
        let client = CameraClient::new(port).unwrap();

        let jpeg = client.snapshot(&camera(port, "pw"), "101").await.unwrap();
        assert_eq!(&jpeg[..], JPEG);

        let err = client.snapshot(&camera(port, "nope"), "101").await.unwrap_err();
        assert!(matches!(err, AppError::Camera(_)));
    }

    #[tokio::test]
    async fn test_connection_check() {
        let port = fake_camera().await;
        let client = CameraClient::new(port).unwrap();

        let report = client.test_connection(&camera(port, "pw")).await.unwrap();
        assert!(report.rtsp_reachable);
        assert!(report.http_ok);

        let err = client.test_connection(&camera(port, "nope")).await.unwrap_err();
        assert!(err.to_string().contains("credentials"));
    }

    #[tokio::test]
    async fn test_search_recordings() {
        let port = fake_camera().await;
        let client = CameraClient::new(port).unwrap();

        let recordings = client
            .search_recordings(&camera(port, "pw"), "201", "31.01.2024", Some("31.01.2024"))
            .await
            .unwrap();
        assert_eq!(recordings.len(), 1);
        assert_eq!(recordings[0].channel, "201");
        assert_eq!(recordings[0].start_time, "2024-01-31T08:00:00Z");
        assert_eq!(recordings[0].end_time, "2024-01-31T09:00:00Z");

        let err = client
            .search_recordings(&camera(port, "nope"), "201", "31.01.2024", Some("31.01.2024"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("credentials"));

        // rejected before any request is made
        let err = client
            .search_recordings(&camera(port, "pw"), "201", "2024/01/31", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
