use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP server settings
    pub server: ServerConfig,
    /// Default camera connection settings
    pub camera: CameraConfig,
    /// Channel list (live view)
    pub channels: Vec<ChannelConfig>,
    /// Network camera discovery settings
    pub discovery: DiscoveryConfig,
    /// Connection pool and session lifetime settings
    pub relay: RelayConfig,
    /// WebRTC ICE settings
    pub webrtc: WebRtcSettings,
    /// HTTP basic auth settings
    pub auth: AuthConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            camera: CameraConfig::default(),
            channels: default_channels(),
            discovery: DiscoveryConfig::default(),
            relay: RelayConfig::default(),
            webrtc: WebRtcSettings::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn channel(&self, id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// Build the live RTSP URL of a channel on the camera at `ip`.
    ///
    /// An explicit per-channel URL wins over the generated one. Credentials
    /// are never embedded; callers pass them to the pool separately.
    pub fn channel_url(&self, id: &str, ip: &str, rtsp_port: u16) -> Option<String> {
        let channel = self.channel(id)?;
        if let Some(url) = channel.url.as_ref().filter(|u| !u.trim().is_empty()) {
            return Some(url.clone());
        }
        Some(format!(
            "rtsp://{}:{}/Streaming/Channels/{}",
            ip, rtsp_port, channel.id
        ))
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub port: u16,
    /// Directory with the browser client, served at `/`
    pub static_dir: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8082,
            static_dir: None,
        }
    }
}

/// Default camera (also the fallback when discovery finds nothing)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub ip: String,
    pub username: String,
    pub password: String,
    pub rtsp_port: u16,
    /// Port of the camera's ISAPI HTTP interface
    pub http_port: u16,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            ip: "192.168.8.5".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            rtsp_port: 554,
            http_port: 80,
        }
    }
}

/// One live channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Channel id as used in `/Streaming/Channels/{id}`
    pub id: String,
    pub name: String,
    /// Explicit RTSP URL, overrides the generated one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: None,
        }
    }
}

/// Hikvision numbering: camera N main stream = N01, sub stream = N02
fn default_channels() -> Vec<ChannelConfig> {
    let mut channels = vec![ChannelConfig::new("1", "Main")];
    for cam in 2..=5 {
        channels.push(ChannelConfig::new(
            format!("{}01", cam),
            format!("Camera {} (main)", cam - 1),
        ));
        channels.push(ChannelConfig::new(
            format!("{}02", cam),
            format!("Camera {} (sub)", cam - 1),
        ));
    }
    channels
}

/// Network camera discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Run the periodic background scan
    pub auto_discovery: bool,
    pub scan_interval_minutes: u32,
    /// CIDR to scan, empty derives a /24 from the outbound address
    pub subnet: String,
    pub port: u16,
    pub probe_timeout_ms: u64,
    pub max_concurrent_probes: usize,
    /// Preferred camera IPs, in priority order
    pub preferred_ips: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            auto_discovery: true,
            scan_interval_minutes: 5,
            subnet: String::new(),
            port: 554,
            probe_timeout_ms: 500,
            max_concurrent_probes: 20,
            preferred_ips: vec![],
        }
    }
}

/// Connection pool / session lifetime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Pooled RTSP connections unused for this long are closed
    pub max_idle_secs: u64,
    /// Sessions without media activity for this long are closed
    pub max_inactivity_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Pump keep-alive tick
    pub keepalive_secs: u64,
    /// How long a pump waits for ICE to connect
    pub connect_timeout_secs: u64,
    /// RTSP DESCRIBE/SETUP/PLAY deadline
    pub dial_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_idle_secs: 300,
            max_inactivity_secs: 30,
            cleanup_interval_secs: 10,
            keepalive_secs: 5,
            connect_timeout_secs: 15,
            dial_timeout_secs: 10,
        }
    }
}

/// ICE server settings, turned into a `webrtc::WebRtcConfig` at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcSettings {
    pub stun_servers: Vec<String>,
    pub turn_server: Option<String>,
    pub turn_username: Option<String>,
    pub turn_password: Option<String>,
    pub ice_gathering_timeout_ms: u64,
}

impl Default for WebRtcSettings {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_server: None,
            turn_username: None,
            turn_password: None,
            ice_gathering_timeout_ms: 3000,
        }
    }
}

/// HTTP basic auth configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub username: String,
    pub password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: "admin".to_string(),
            password: "password".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_channels() {
        let config = AppConfig::default();
        let ids: Vec<&str> = config.channels.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["1", "201", "202", "301", "302", "401", "402", "501", "502"]
        );
    }

    #[test]
    fn test_channel_url() {
        let mut config = AppConfig::default();
        assert_eq!(
            config.channel_url("201", "10.0.0.5", 554).as_deref(),
            Some("rtsp://10.0.0.5:554/Streaming/Channels/201")
        );
        assert!(config.channel_url("999", "10.0.0.5", 554).is_none());

        config.channels[0].url = Some("rtsp://nvr.local/live".to_string());
        assert_eq!(
            config.channel_url("1", "10.0.0.5", 554).as_deref(),
            Some("rtsp://nvr.local/live")
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"camera": {"ip": "10.1.1.1"}, "relay": {"max_idle_secs": 60}}"#)
                .unwrap();
        assert_eq!(config.camera.ip, "10.1.1.1");
        assert_eq!(config.camera.rtsp_port, 554);
        assert_eq!(config.relay.max_idle_secs, 60);
        assert_eq!(config.relay.max_inactivity_secs, 30);
        assert_eq!(config.channels.len(), 9);
    }
}
