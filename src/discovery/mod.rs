//! Camera discovery
//!
//! A scan enumerates a subnet, probes each host's RTSP port under a
//! concurrency cap and upserts the live hosts into an in-memory cache.
//! The [`CameraSelector`] picks "the camera to use" from that cache.

mod engine;
mod probe;
mod selector;
mod subnet;

pub use engine::{DiscoveryEngine, ScanOptions};
pub use probe::{Probe, TcpProbe};
pub use selector::CameraSelector;
pub use subnet::{Subnet, MIN_SCAN_PREFIX};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Username/password pair used for RTSP and the camera HTTP API
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraCredentials {
    pub username: String,
    pub password: String,
}

impl CameraCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    /// Answered a probe
    Online,
    /// Synthesized from configuration, never probed
    Unknown,
}

impl std::fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraStatus::Online => write!(f, "online"),
            CameraStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// A camera endpoint known to the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub ip: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub port: u16,
    pub status: CameraStatus,
    pub last_seen: DateTime<Utc>,
}

impl CameraRecord {
    pub fn online(ip: impl Into<String>, port: u16, creds: &CameraCredentials) -> Self {
        Self {
            ip: ip.into(),
            username: creds.username.clone(),
            password: creds.password.clone(),
            port,
            status: CameraStatus::Online,
            last_seen: Utc::now(),
        }
    }

    pub fn credentials(&self) -> CameraCredentials {
        CameraCredentials::new(&self.username, &self.password)
    }
}

/// Settings the discovery side reads from configuration
pub trait CameraSettings: Send + Sync {
    fn credentials(&self) -> CameraCredentials;
    /// Configured camera IP, used when nothing was discovered
    fn default_ip(&self) -> String;
    fn rtsp_port(&self) -> u16;
    fn preferred_ips(&self) -> Vec<String>;
    fn auto_discovery_enabled(&self) -> bool;
    fn scan_interval_minutes(&self) -> u32;
}
