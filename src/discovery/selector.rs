use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use super::engine::DiscoveryEngine;
use super::{CameraRecord, CameraStatus};

/// Picks the camera a request should use
pub struct CameraSelector {
    engine: Arc<DiscoveryEngine>,
}

impl CameraSelector {
    pub fn new(engine: Arc<DiscoveryEngine>) -> Self {
        Self { engine }
    }

    /// Resolve a camera; first match wins:
    ///
    /// 1. `preferred_ip`, if cached
    /// 2. the first configured preferred IP that is cached
    /// 3. the most recently seen cached camera
    /// 4. a record built from the configured defaults, status `unknown`
    ///
    /// Never fails.
    pub fn resolve(&self, preferred_ip: &str) -> CameraRecord {
        let cached = self.engine.cached();
        let settings = self.engine.settings();

        let preferred_ip = preferred_ip.trim();
        if !preferred_ip.is_empty() {
            if let Some(record) = cached.iter().find(|r| r.ip == preferred_ip) {
                return record.clone();
            }
            debug!("Requested camera {} not in cache", preferred_ip);
        }

        for ip in settings.preferred_ips() {
            if let Some(record) = cached.iter().find(|r| r.ip == ip) {
                return record.clone();
            }
        }

        if let Some(record) = cached.iter().max_by_key(|r| r.last_seen) {
            return record.clone();
        }

        let creds = settings.credentials();
        CameraRecord {
            ip: settings.default_ip(),
            username: creds.username,
            password: creds.password,
            port: settings.rtsp_port(),
            status: CameraStatus::Unknown,
            last_seen: Utc::now(),
        }
    }
}
