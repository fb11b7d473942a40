//! Media source abstraction consumed by the connection pool

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use url::Url;

use crate::discovery::CameraCredentials;
use crate::error::Result;

/// One encoded access unit (H.264 Annex B)
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
    pub is_keyframe: bool,
}

/// A playing upstream media session
#[async_trait]
pub trait MediaSource: Send {
    /// Next sample; any error means the session is dead
    async fn read_sample(&mut self) -> Result<MediaSample>;

    /// Tear the session down. Must tolerate being called after a read error.
    async fn close(&mut self);
}

/// Opens media sources
#[async_trait]
pub trait SourceDialer: Send + Sync {
    async fn dial(&self, url: &str, creds: &CameraCredentials) -> Result<Box<dyn MediaSource>>;
}

/// Pool key of a source URL: the URL with any userinfo removed
///
/// `rtsp://admin:pw@10.0.0.5/ch1` and `rtsp://10.0.0.5/ch1` share one
/// upstream connection.
pub fn source_key(url: &str) -> String {
    match Url::parse(url.trim()) {
        Ok(mut parsed) => {
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        Err(_) => url.trim().to_string(),
    }
}
