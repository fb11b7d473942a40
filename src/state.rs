use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::camera::CameraClient;
use crate::config::ConfigStore;
use crate::discovery::{CameraSelector, CameraSettings, DiscoveryEngine, Probe, ScanOptions};
use crate::error::Result;
use crate::rtsp::{ConnectionPool, SourceDialer};
use crate::webrtc::{PumpSettings, RelaySessionManager, WebRtcConfig};

/// Application-wide state shared across handlers
///
/// Every registry lives here exactly once; handlers and background tasks
/// hold `Arc` handles to it.
pub struct AppState {
    /// Configuration store
    pub config: Arc<ConfigStore>,
    /// Camera discovery cache and scanner
    pub discovery: Arc<DiscoveryEngine>,
    /// Picks the camera for a request
    pub selector: CameraSelector,
    /// Upstream RTSP connections
    pub pool: Arc<ConnectionPool>,
    /// Viewer sessions
    pub sessions: Arc<RelaySessionManager>,
    /// Camera ISAPI client
    pub camera_api: CameraClient,
    /// Cancelled on shutdown; background loops watch it
    pub shutdown: CancellationToken,
    started_at: Instant,
}

impl AppState {
    /// Wire every component from the current configuration
    pub fn new(
        config: Arc<ConfigStore>,
        probe: Arc<dyn Probe>,
        dialer: Arc<dyn SourceDialer>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let current = config.get();

        let settings: Arc<dyn CameraSettings> = config.clone();
        let discovery = Arc::new(DiscoveryEngine::new(
            probe,
            settings,
            ScanOptions::from(&current.discovery),
            current.discovery.max_concurrent_probes,
        ));
        let selector = CameraSelector::new(discovery.clone());

        let pool = Arc::new(ConnectionPool::new(
            dialer,
            Duration::from_secs(current.relay.dial_timeout_secs.max(1)),
        ));
        let sessions = Arc::new(RelaySessionManager::new(
            WebRtcConfig::from(&current.webrtc),
            PumpSettings::from(&current.relay),
        ));
        let camera_api = CameraClient::new(current.camera.http_port)?;

        Ok(Arc::new(Self {
            config,
            discovery,
            selector,
            pool,
            sessions,
            camera_api,
            shutdown,
            started_at: Instant::now(),
        }))
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Close every session, then every upstream connection
    pub async fn shutdown_relay(&self) {
        self.sessions.close_all().await;
        self.pool.close_all().await;
    }
}
