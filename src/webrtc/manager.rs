//! Relay session registry and media pump

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::config::{PumpSettings, WebRtcConfig};
use super::session::RelaySession;
use super::signaling::{ConnectionState, SessionInfo};
use crate::error::{AppError, Result};
use crate::rtsp::{MediaSample, SourceConnection};
use crate::warn_throttled;
use crate::utils::LogThrottler;

type SessionMap = Arc<Mutex<HashMap<String, Arc<RelaySession>>>>;

/// Remove `key` from the registry if it still holds `session_id`
fn take_if_current(
    sessions: &SessionMap,
    key: &str,
    session_id: &str,
) -> Option<Arc<RelaySession>> {
    let mut sessions = sessions.lock();
    match sessions.get(key) {
        Some(s) if s.id() == session_id => sessions.remove(key),
        _ => None,
    }
}

/// Owns at most one relay session per stream key
pub struct RelaySessionManager {
    config: WebRtcConfig,
    pump: PumpSettings,
    sessions: SessionMap,
    /// Only populated while a `create_session` for the key is in flight
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    throttler: Arc<LogThrottler>,
}

impl RelaySessionManager {
    pub fn new(config: WebRtcConfig, pump: PumpSettings) -> Self {
        Self {
            config,
            pump,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            key_locks: Mutex::new(HashMap::new()),
            throttler: Arc::new(LogThrottler::with_secs(10)),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the lock for `key` once the map holds the only reference
    fn prune_key_lock(&self, key: &str) {
        let mut locks = self.key_locks.lock();
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    /// Create a fresh session for `key`, closing any previous one first
    pub async fn create_session(&self, key: &str) -> Result<Arc<RelaySession>> {
        if key.trim().is_empty() {
            return Err(AppError::BadRequest("Stream key is empty".to_string()));
        }

        let lock = self.key_lock(key);
        let created = {
            let _guard = lock.lock().await;
            self.replace_session(key).await
        };
        drop(lock);
        self.prune_key_lock(key);
        created
    }

    async fn replace_session(&self, key: &str) -> Result<Arc<RelaySession>> {
        let previous = self.sessions.lock().remove(key);
        if let Some(previous) = previous {
            info!("Replacing session {} for stream {}", previous.id(), key);
            previous.close().await;
        }

        let session = Arc::new(RelaySession::new(key, &self.config).await?);
        self.sessions
            .lock()
            .insert(key.to_string(), session.clone());

        info!("Session {} created for stream {}", session.id(), key);
        Ok(session)
    }

    /// Negotiate `session` with a browser offer.
    ///
    /// On failure the session is torn down and unregistered.
    pub async fn handle_offer(&self, session: &Arc<RelaySession>, offer_sdp: String) -> Result<String> {
        match session
            .negotiate(offer_sdp, self.config.ice_gathering_timeout)
            .await
        {
            Ok(answer) => Ok(answer),
            Err(e) => {
                warn!("Session {} negotiation failed: {}", session.id(), e);
                self.close_session_if(session.stream_key(), session.id()).await;
                session.close().await;
                Err(e)
            }
        }
    }

    /// Negotiate the session currently registered under `key`
    pub async fn handle_offer_for_key(&self, key: &str, offer_sdp: String) -> Result<String> {
        let session = self
            .get(key)
            .ok_or_else(|| AppError::NotFound(format!("No session for stream {}", key)))?;
        self.handle_offer(&session, offer_sdp).await
    }

    /// Attach the outbound track and spawn the pump. A second call for the
    /// same session is a no-op.
    pub async fn start_pump(
        &self,
        session: &Arc<RelaySession>,
        conn: Arc<SourceConnection>,
    ) -> Result<()> {
        if session.is_closed() {
            return Err(AppError::WebRtcError(format!(
                "Session {} is closed",
                session.id()
            )));
        }

        session.attach_track().await?;

        // Subscribe before claiming so an unhealthy source leaves the slot free
        let samples = conn.subscribe()?;
        if !session.claim_pump(conn.url()) {
            debug!("Session {} pump already running", session.id());
            return Ok(());
        }

        let handle = tokio::spawn(run_pump(
            session.clone(),
            conn,
            samples,
            self.pump,
            self.throttler.clone(),
            self.sessions.clone(),
        ));
        session.set_pump_handle(handle);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Arc<RelaySession>> {
        self.sessions.lock().get(key).cloned()
    }

    /// Close and unregister the session for `key`
    pub async fn close_session(&self, key: &str) -> bool {
        let session = self.sessions.lock().remove(key);
        match session {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Close the session for `key` only if it is still `session_id`
    pub async fn close_session_if(&self, key: &str, session_id: &str) -> bool {
        match take_if_current(&self.sessions, key, session_id) {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        for session in sessions {
            session.close().await;
        }
        if count > 0 {
            info!("Closed {} relay sessions", count);
        }
    }

    /// Close sessions in a terminal ICE state or idle longer than
    /// `max_inactivity`. Returns how many were removed.
    pub async fn sweep(&self, max_inactivity: Duration) -> usize {
        let expired: Vec<Arc<RelaySession>> = {
            let mut sessions = self.sessions.lock();
            let keys: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.ice_state().is_terminal() || s.idle_for() > max_inactivity)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };

        let count = expired.len();
        for session in expired {
            debug!(
                "Evicting session {} ({}), state {}, idle {:?}",
                session.id(),
                session.stream_key(),
                session.ice_state(),
                session.idle_for()
            );
            session.close().await;
        }
        count
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self.sessions.lock().values().map(|s| s.info()).collect();
        list.sort_by(|a, b| a.stream_key.cmp(&b.stream_key));
        list
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

/// Why a pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpExit {
    /// Stop token cancelled: explicit close or an ICE state that stops media
    Stopped,
    /// ICE never reached connected, or dropped out of it
    NotConnected,
    /// The upstream connection failed or was closed
    SourceEnded,
    WriteFailed,
}

impl PumpExit {
    /// Upstream failures end the session right away
    fn tears_down(self) -> bool {
        matches!(self, PumpExit::SourceEnded | PumpExit::WriteFailed)
    }
}

/// Move samples from a pooled source into the session's track until
/// stopped, the source dies, ICE drops, or a write fails.
///
/// When the source or the track fails, the session is unregistered and
/// closed here instead of waiting for the janitor.
async fn run_pump(
    session: Arc<RelaySession>,
    conn: Arc<SourceConnection>,
    samples: tokio::sync::broadcast::Receiver<MediaSample>,
    settings: PumpSettings,
    throttler: Arc<LogThrottler>,
    sessions: SessionMap,
) {
    let exit = pump_samples(&session, &conn, samples, settings, &throttler).await;
    throttler.clear(session.id());

    if !exit.tears_down() {
        debug!("Session {} pump ended ({:?})", session.id(), exit);
        return;
    }

    let current = take_if_current(&sessions, session.stream_key(), session.id()).is_some();
    info!(
        "Session {} torn down after upstream failure ({:?}){}",
        session.id(),
        exit,
        if current { "" } else { ", already replaced" }
    );
    // close() joins this task, so it runs on its own
    tokio::spawn(async move {
        session.close().await;
    });
}

async fn pump_samples(
    session: &RelaySession,
    conn: &SourceConnection,
    mut samples: tokio::sync::broadcast::Receiver<MediaSample>,
    settings: PumpSettings,
    throttler: &LogThrottler,
) -> PumpExit {
    let stop = session.stop_token();
    let Some(track) = session.track() else {
        warn!("Session {} has no track, pump not started", session.id());
        return PumpExit::Stopped;
    };

    let mut state_rx = session.subscribe_state();
    let wait_connected = async {
        state_rx
            .wait_for(|s| *s == ConnectionState::Connected || s.stops_media())
            .await
            .map(|s| *s == ConnectionState::Connected)
            .unwrap_or(false)
    };
    let connected = tokio::select! {
        _ = stop.cancelled() => return PumpExit::Stopped,
        _ = conn.closed() => return PumpExit::SourceEnded,
        r = tokio::time::timeout(settings.connect_timeout, wait_connected) => r.unwrap_or(false),
    };
    if !connected {
        info!(
            "Session {} did not reach ICE connected (state {}), pump not started",
            session.id(),
            session.ice_state()
        );
        return PumpExit::NotConnected;
    }

    info!("Session {} pumping from {}", session.id(), conn.url());

    let mut keepalive = tokio::time::interval(settings.keepalive);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    keepalive.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!("Session {} pump stopped", session.id());
                return PumpExit::Stopped;
            }
            _ = conn.closed() => {
                info!("Session {} source {} closed, ending pump", session.id(), conn.url());
                return PumpExit::SourceEnded;
            }
            _ = keepalive.tick() => {
                if session.ice_state() != ConnectionState::Connected {
                    debug!("Session {} no longer connected, ending pump", session.id());
                    return PumpExit::NotConnected;
                }
                conn.touch();
            }
            msg = samples.recv() => match msg {
                Ok(sample) => {
                    if let Err(e) = track.write(&sample).await {
                        warn_throttled!(throttler, session.id(), "Session {} write failed: {}", session.id(), e);
                        return PumpExit::WriteFailed;
                    }
                    session.touch();
                }
                Err(RecvError::Lagged(n)) => {
                    debug!("Session {} lagged, skipped {} samples", session.id(), n);
                }
                Err(RecvError::Closed) => return PumpExit::SourceEnded,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::CameraCredentials;
    use crate::rtsp::testing::FakeDialer;
    use crate::rtsp::ConnectionPool;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::api::APIBuilder;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
    use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
    use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

    fn manager() -> RelaySessionManager {
        RelaySessionManager::new(
            WebRtcConfig::host_only(),
            PumpSettings {
                keepalive: Duration::from_millis(50),
                connect_timeout: Duration::from_secs(2),
            },
        )
    }

    async fn browser_offer() -> String {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let pc = api.new_peer_connection(Default::default()).await.unwrap();
        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        pc.set_local_description(offer.clone()).await.unwrap();
        let sdp = offer.sdp;
        pc.close().await.unwrap();
        sdp
    }

    #[tokio::test]
    async fn test_one_session_per_key() {
        let manager = manager();
        let first = manager.create_session("201").await.unwrap();
        let second = manager.create_session("201").await.unwrap();

        assert_eq!(manager.len(), 1);
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(manager.get("201").unwrap().id(), second.id());
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_concurrent_creates_keep_one_session() {
        let manager = Arc::new(manager());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.create_session("101").await.unwrap()
            }));
        }
        let mut created = Vec::new();
        for handle in handles {
            created.push(handle.await.unwrap());
        }

        assert_eq!(manager.len(), 1);
        let live = manager.get("101").unwrap();
        let open: Vec<_> = created.iter().filter(|s| !s.is_closed()).collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id(), live.id());
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_invalid_offer_unregisters_session() {
        let manager = manager();
        let session = manager.create_session("201").await.unwrap();

        let err = manager
            .handle_offer(&session, "not an sdp".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(manager.get("201").is_none());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_valid_offer_yields_video_answer() {
        let manager = manager();
        let session = manager.create_session("201").await.unwrap();
        session.attach_track().await.unwrap();

        let answer = manager
            .handle_offer_for_key("201", browser_offer().await)
            .await
            .unwrap();
        assert!(answer.contains("m=video"));
        assert!(answer.contains("H264"));
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_close_session_twice() {
        let manager = manager();
        manager.create_session("301").await.unwrap();
        assert!(manager.close_session("301").await);
        assert!(!manager.close_session("301").await);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_stale_close_does_not_remove_replacement() {
        let manager = manager();
        let old = manager.create_session("401").await.unwrap();
        let new = manager.create_session("401").await.unwrap();

        assert!(!manager.close_session_if("401", old.id()).await);
        assert_eq!(manager.get("401").unwrap().id(), new.id());
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_ice_failure_ends_pump_and_sweep_removes() {
        let dialer = Arc::new(FakeDialer::default());
        let pool = ConnectionPool::new(dialer.clone(), Duration::from_secs(1));
        let conn = pool
            .acquire("rtsp://10.0.0.5/ch1", &CameraCredentials::new("admin", "pw"))
            .await
            .unwrap();

        let manager = manager();
        let session = manager.create_session("201").await.unwrap();
        manager.start_pump(&session, conn.clone()).await.unwrap();
        // second start is a no-op
        manager.start_pump(&session, conn.clone()).await.unwrap();

        session.force_ice_state(ConnectionState::Connected);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(session.pump_running());
        assert!(session.track().unwrap().started());

        session.force_ice_state(ConnectionState::Failed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!session.pump_running());

        assert_eq!(manager.sweep(Duration::from_secs(30)).await, 1);
        assert!(manager.is_empty());
        assert!(session.is_closed());
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_source_failure_tears_session_down() {
        let manager = manager();
        let session = manager.create_session("201").await.unwrap();

        let dialer = Arc::new(FakeDialer::default());
        *dialer.fail_after.lock() = Some(20);
        let pool = ConnectionPool::new(dialer, Duration::from_secs(1));
        let conn = pool
            .acquire("rtsp://10.0.0.5/ch1", &CameraCredentials::default())
            .await
            .unwrap();
        manager.start_pump(&session, conn.clone()).await.unwrap();
        session.force_ice_state(ConnectionState::Connected);
        assert!(manager.throttler.should_log(session.id()));

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.get("201").is_some() || !session.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(!conn.is_healthy());
        assert!(manager.is_empty());
        assert!(manager.throttler.is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!session.pump_running());
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_key_locks_do_not_accumulate() {
        let manager = manager();
        for i in 0..50 {
            let key = format!("playback_{:016x}", i);
            manager.create_session(&key).await.unwrap();
            assert!(manager.close_session(&key).await);
        }
        assert!(manager.is_empty());
        assert_eq!(manager.key_locks.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_inactive() {
        let manager = manager();
        let idle = manager.create_session("501").await.unwrap();
        manager.create_session("502").await.unwrap();

        assert_eq!(manager.sweep(Duration::from_secs(30)).await, 0);
        idle.backdate(Duration::from_secs(31));
        assert_eq!(manager.sweep(Duration::from_secs(30)).await, 1);
        assert!(manager.get("501").is_none());
        assert!(manager.get("502").is_some());
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_start_pump_rejects_unhealthy_source() {
        let dialer = Arc::new(FakeDialer::default());
        let pool = ConnectionPool::new(dialer, Duration::from_secs(1));
        let conn = pool
            .acquire("rtsp://10.0.0.5/ch1", &CameraCredentials::default())
            .await
            .unwrap();
        conn.mark_unhealthy();

        let manager = manager();
        let session = manager.create_session("201").await.unwrap();
        assert!(manager.start_pump(&session, conn).await.is_err());
        assert!(!session.pump_running());
        manager.close_all().await;
        pool.close_all().await;
    }
}
