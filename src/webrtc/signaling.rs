//! WebRTC signaling types and messages

use serde::{Deserialize, Serialize};

/// SDP offer as produced by `RTCPeerConnection.createOffer()` in the browser
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpOffer {
    /// `"offer"`; accepted but not required
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// SDP content
    pub sdp: String,
}

impl SdpOffer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self {
            kind: Some("offer".to_string()),
            sdp: sdp.into(),
        }
    }
}

/// SDP answer, shaped so the browser can pass it to `setRemoteDescription`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpAnswer {
    #[serde(rename = "type")]
    pub kind: String,
    /// SDP content, including gathered candidates
    pub sdp: String,
}

impl SdpAnswer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// Archive playback offer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackOfferRequest {
    pub offer: SdpOffer,
    /// Playback RTSP URL from `/api/playback-url`
    pub url: String,
}

/// Answer returned by the offer endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResponse {
    #[serde(flatten)]
    pub answer: SdpAnswer,
    pub stream_key: String,
    pub session_id: String,
}

/// Explicit viewer disconnect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseRequest {
    pub stream_key: String,
}

/// ICE connection state of a relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Sessions in a terminal state are evicted by the janitor
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    /// States that stop the pump
    pub fn stops_media(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Offer/answer progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    New,
    HaveRemoteOffer,
    HaveLocalAnswer,
}

/// Relay session status
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub stream_key: String,
    pub source_url: Option<String>,
    pub ice_state: ConnectionState,
    pub negotiation: NegotiationState,
    pub pump_running: bool,
    pub idle_secs: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_offer_shape() {
        let offer: SdpOffer = serde_json::from_str(r#"{"type":"offer","sdp":"v=0\r\n"}"#).unwrap();
        assert_eq!(offer.kind.as_deref(), Some("offer"));

        let offer: SdpOffer = serde_json::from_str(r#"{"sdp":"v=0\r\n"}"#).unwrap();
        assert!(offer.kind.is_none());
    }

    #[test]
    fn test_answer_response_is_flat() {
        let response = AnswerResponse {
            answer: SdpAnswer::new("v=0\r\n"),
            stream_key: "201".to_string(),
            session_id: "abc".to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["type"], "answer");
        assert_eq!(json["sdp"], "v=0\r\n");
        assert_eq!(json["stream_key"], "201");
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Disconnected.stops_media());
        assert!(!ConnectionState::Connected.stops_media());
    }
}
