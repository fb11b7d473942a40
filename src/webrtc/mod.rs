//! WebRTC side of the relay
//!
//! ```text
//! ConnectionPool (one RTSP reader per URL, broadcast fan-out)
//!        |
//!        v
//! pump task (per session) ---> H264Track ---> RTCPeerConnection ---> Browser
//!                                                    ^
//!                         SDP offer/answer via /api/webrtc/offer
//! ```

pub mod config;
pub mod manager;
pub mod mdns;
pub mod session;
pub mod signaling;
pub mod track;

pub use config::{PumpSettings, TurnServer, WebRtcConfig};
pub use manager::RelaySessionManager;
pub use session::RelaySession;
pub use signaling::{
    AnswerResponse, CloseRequest, ConnectionState, NegotiationState, PlaybackOfferRequest,
    SdpAnswer, SdpOffer, SessionInfo,
};
pub use track::{H264Track, TrackStats};
