//! One viewer's peer connection and its outbound H.264 track

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::config::WebRtcConfig;
use super::mdns::{mdns_mode, mdns_mode_label, setting_engine};
use super::signaling::{ConnectionState, NegotiationState, SessionInfo};
use super::track::H264Track;
use crate::error::{AppError, Result};

/// How long `close` waits for the pump task to notice the stop signal
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

pub struct RelaySession {
    id: String,
    stream_key: String,
    pc: Arc<RTCPeerConnection>,
    track: Mutex<Option<Arc<H264Track>>>,
    /// Held across the check and `add_track` in `attach_track`
    attach: tokio::sync::Mutex<()>,
    source_url: Mutex<Option<String>>,
    stop: CancellationToken,
    state: Arc<watch::Sender<ConnectionState>>,
    negotiation: Mutex<NegotiationState>,
    last_activity: Mutex<Instant>,
    created_at: DateTime<Utc>,
    pump: Mutex<Option<JoinHandle<()>>>,
    pump_started: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("id", &self.id)
            .field("stream_key", &self.stream_key)
            .field("ice_state", &self.ice_state())
            .finish()
    }
}

impl RelaySession {
    pub async fn new(stream_key: &str, config: &WebRtcConfig) -> Result<Self> {
        let id = uuid::Uuid::new_v4().to_string();

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        debug!(
            "Session {} ({}) mDNS mode: {}",
            id,
            stream_key,
            mdns_mode_label(mdns_mode())
        );

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine(&id))
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;

        let (state_tx, _) = watch::channel(ConnectionState::New);
        let session = Self {
            id,
            stream_key: stream_key.to_string(),
            pc: Arc::new(pc),
            track: Mutex::new(None),
            attach: tokio::sync::Mutex::new(()),
            source_url: Mutex::new(None),
            stop: CancellationToken::new(),
            state: Arc::new(state_tx),
            negotiation: Mutex::new(NegotiationState::New),
            last_activity: Mutex::new(Instant::now()),
            created_at: Utc::now(),
            pump: Mutex::new(None),
            pump_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        session.register_ice_handler();

        Ok(session)
    }

    fn register_ice_handler(&self) {
        let state = self.state.clone();
        let stop = self.stop.clone();
        let session_id = self.id.clone();

        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                let new_state = match s {
                    RTCIceConnectionState::New => Some(ConnectionState::New),
                    RTCIceConnectionState::Checking => Some(ConnectionState::Connecting),
                    RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                        Some(ConnectionState::Connected)
                    }
                    RTCIceConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                    RTCIceConnectionState::Failed => Some(ConnectionState::Failed),
                    RTCIceConnectionState::Closed => Some(ConnectionState::Closed),
                    _ => None,
                };
                if let Some(new_state) = new_state {
                    apply_ice_state(&state, &stop, &session_id, new_state);
                }
                Box::pin(async {})
            }));
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn source_url(&self) -> Option<String> {
        self.source_url.lock().clone()
    }

    pub fn ice_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn negotiation(&self) -> NegotiationState {
        *self.negotiation.lock()
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn track(&self) -> Option<Arc<H264Track>> {
        self.track.lock().clone()
    }

    /// Add the outbound video track unless one is already attached.
    ///
    /// Must happen before the answer is created for the track to be
    /// negotiated.
    pub async fn attach_track(&self) -> Result<Arc<H264Track>> {
        let _attaching = self.attach.lock().await;
        if let Some(track) = self.track() {
            return Ok(track);
        }

        let track = Arc::new(H264Track::new("video", &format!("cam-relay-{}", self.stream_key)));
        self.pc
            .add_track(track.as_track_local())
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add video track: {}", e)))?;

        *self.track.lock() = Some(track.clone());
        Ok(track)
    }

    /// Apply a browser offer and return the answer SDP with gathered
    /// candidates inlined.
    pub async fn negotiate(&self, offer_sdp: String, gather_timeout: Duration) -> Result<String> {
        if self.is_closed() {
            return Err(AppError::WebRtcError(format!("Session {} is closed", self.id)));
        }
        if self.negotiation() != NegotiationState::New {
            return Err(AppError::BadRequest(format!(
                "Session {} already negotiated",
                self.id
            )));
        }

        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| AppError::BadRequest(format!("Invalid SDP offer: {}", e)))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| AppError::BadRequest(format!("Offer rejected: {}", e)))?;
        *self.negotiation.lock() = NegotiationState::HaveRemoteOffer;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;

        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(answer).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to set local description: {}", e))
        })?;

        if tokio::time::timeout(gather_timeout, gathered.recv())
            .await
            .is_err()
        {
            debug!(
                "Session {} ICE gathering not complete after {:?}, answering with partial candidates",
                self.id, gather_timeout
            );
        }

        let local = self.pc.local_description().await.ok_or_else(|| {
            AppError::WebRtcError("Local description missing after answer".to_string())
        })?;

        *self.negotiation.lock() = NegotiationState::HaveLocalAnswer;
        self.touch();
        Ok(local.sdp)
    }

    /// Claim the pump slot. Only the first caller gets `true`.
    pub(crate) fn claim_pump(&self, source_url: &str) -> bool {
        if self.pump_started.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.source_url.lock() = Some(source_url.to_string());
        true
    }

    pub(crate) fn set_pump_handle(&self, handle: JoinHandle<()>) {
        *self.pump.lock() = Some(handle);
    }

    pub fn pump_running(&self) -> bool {
        self.pump
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the pump and tear down the peer connection. Safe to call again.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.stop.cancel();
        self.state.send_replace(ConnectionState::Closed);

        if let Err(e) = self.pc.close().await {
            debug!("Session {} peer close error: {}", self.id, e);
        }

        let handle = self.pump.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(PUMP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Session {} pump did not stop in time", self.id);
            }
        }

        info!("Session {} ({}) closed", self.id, self.stream_key);
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            stream_key: self.stream_key.clone(),
            source_url: self.source_url(),
            ice_state: self.ice_state(),
            negotiation: self.negotiation(),
            pump_running: self.pump_running(),
            idle_secs: self.idle_for().as_secs(),
            created_at: self.created_at,
        }
    }

    #[cfg(test)]
    pub(crate) fn force_ice_state(&self, state: ConnectionState) {
        apply_ice_state(&self.state, &self.stop, &self.id, state);
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        let mut last = self.last_activity.lock();
        if let Some(earlier) = last.checked_sub(by) {
            *last = earlier;
        }
    }
}

/// Record an ICE transition; any state that stops media cancels the pump
fn apply_ice_state(
    state: &watch::Sender<ConnectionState>,
    stop: &CancellationToken,
    session_id: &str,
    new_state: ConnectionState,
) {
    let previous = state.send_replace(new_state);
    if previous != new_state {
        info!("Session {} ICE state: {} -> {}", session_id, previous, new_state);
    }
    if new_state.stops_media() {
        stop.cancel();
    }
}
