//! WebRTC configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::config::{RelayConfig, WebRtcSettings};

/// Peer connection settings shared by every relay session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Upper bound on ICE gathering before the answer is returned
    pub ice_gathering_timeout: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        WebRtcConfig::from(&WebRtcSettings::default())
    }
}

impl From<&WebRtcSettings> for WebRtcConfig {
    fn from(settings: &WebRtcSettings) -> Self {
        let stun_servers = settings
            .stun_servers
            .iter()
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .collect();

        let turn_servers = settings
            .turn_server
            .as_ref()
            .filter(|s| !s.trim().is_empty())
            .map(|url| {
                TurnServer::new(
                    url.clone(),
                    settings.turn_username.clone().unwrap_or_default(),
                    settings.turn_password.clone().unwrap_or_default(),
                )
            })
            .into_iter()
            .collect();

        Self {
            stun_servers,
            turn_servers,
            ice_gathering_timeout: Duration::from_millis(settings.ice_gathering_timeout_ms),
        }
    }
}

impl WebRtcConfig {
    /// Host candidates only; used by tests and isolated LANs
    pub fn host_only() -> Self {
        Self {
            stun_servers: vec![],
            turn_servers: vec![],
            ice_gathering_timeout: Duration::from_millis(500),
        }
    }

    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];

        for stun_url in &self.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        ice_servers
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// e.g. `turn:turn.example.com:3478?transport=udp`
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl TurnServer {
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}

/// Pump timing
#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    /// Keep-alive tick: ICE must still be connected at every tick
    pub keepalive: Duration,
    /// How long a pump waits for ICE to connect before giving up
    pub connect_timeout: Duration,
}

impl From<&RelayConfig> for PumpSettings {
    fn from(relay: &RelayConfig) -> Self {
        Self {
            keepalive: Duration::from_secs(relay.keepalive_secs.max(1)),
            connect_timeout: Duration::from_secs(relay.connect_timeout_secs.max(1)),
        }
    }
}

impl Default for PumpSettings {
    fn default() -> Self {
        PumpSettings::from(&RelayConfig::default())
    }
}
