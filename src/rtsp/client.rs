//! RTSP client built on `retina`

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use retina::client::{Credentials, Demuxed, PlayOptions, Session, SessionOptions, SetupOptions};
use retina::codec::{CodecItem, ParametersRef};
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};
use url::Url;

use super::h264::{self, ParameterSets};
use super::source::{MediaSample, MediaSource, SourceDialer};
use crate::discovery::CameraCredentials;
use crate::error::{AppError, Result};

/// Nominal frame duration until two frames have been seen
const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(40);

/// Dials cameras over RTSP and plays their first H.264 video stream
pub struct RetinaDialer {
    user_agent: String,
}

impl RetinaDialer {
    pub fn new() -> Self {
        Self {
            user_agent: format!("cam-relay/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for RetinaDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceDialer for RetinaDialer {
    async fn dial(&self, url: &str, creds: &CameraCredentials) -> Result<Box<dyn MediaSource>> {
        let (url, creds) = split_credentials(url, creds)?;
        let display_url = url.to_string();
        let rtsp_err = |e: retina::Error| AppError::rtsp(display_url.as_str(), e);

        let options = SessionOptions::default()
            .creds(creds)
            .user_agent(self.user_agent.clone());
        let mut session = Session::describe(url.clone(), options)
            .await
            .map_err(rtsp_err)?;

        let video_i = session
            .streams()
            .iter()
            .position(|s| s.media() == "video" && s.encoding_name() == "h264")
            .ok_or_else(|| AppError::rtsp(display_url.as_str(), "no H.264 video stream"))?;

        let params = match session.streams()[video_i].parameters() {
            Some(ParametersRef::Video(video)) => ParameterSets::from_avcc(video.extra_data()),
            _ => None,
        };
        if params.is_none() {
            debug!("{}: no out-of-band SPS/PPS, relying on in-band parameters", display_url);
        }

        session
            .setup(video_i, SetupOptions::default())
            .await
            .map_err(rtsp_err)?;
        let playing = session
            .play(PlayOptions::default())
            .await
            .map_err(rtsp_err)?;
        let demuxed = playing.demuxed().map_err(rtsp_err)?;

        info!("RTSP session playing: {}", display_url);
        Ok(Box::new(RetinaSource {
            url: display_url,
            stream: Some(Box::pin(demuxed)),
            video_i,
            params,
            last_frame: None,
        }))
    }
}

/// A playing retina session
pub struct RetinaSource {
    url: String,
    stream: Option<Pin<Box<Demuxed>>>,
    video_i: usize,
    params: Option<ParameterSets>,
    last_frame: Option<Instant>,
}

impl RetinaSource {
    fn frame_duration(&mut self) -> Duration {
        let now = Instant::now();
        let duration = self
            .last_frame
            .map(|prev| now.duration_since(prev))
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_FRAME_DURATION);
        self.last_frame = Some(now);
        duration
    }
}

#[async_trait]
impl MediaSource for RetinaSource {
    async fn read_sample(&mut self) -> Result<MediaSample> {
        loop {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| AppError::rtsp(self.url.as_str(), "session closed"))?;

            let frame = match stream.next().await {
                Some(Ok(CodecItem::VideoFrame(frame))) if frame.stream_id() == self.video_i => frame,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(AppError::rtsp(self.url.as_str(), e)),
                None => return Err(AppError::rtsp(self.url.as_str(), "stream ended")),
            };

            let is_keyframe = frame.is_random_access_point();
            if frame.has_new_parameters() {
                debug!("{}: stream parameters changed", self.url);
            }

            let length_size = self.params.as_ref().map(|p| p.length_size).unwrap_or(4);
            let mut data = BytesMut::with_capacity(frame.data().len() + 64);
            if is_keyframe {
                if let Some(params) = self.params.as_ref().filter(|p| !p.is_empty()) {
                    params.write_annexb(&mut data);
                }
            }
            if h264::avcc_to_annexb(frame.data(), length_size, &mut data).is_none() {
                trace!("{}: dropping malformed access unit", self.url);
                continue;
            }

            return Ok(MediaSample {
                data: data.freeze(),
                duration: self.frame_duration(),
                is_keyframe,
            });
        }
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("RTSP session closed: {}", self.url);
        }
    }
}

/// Move userinfo out of the URL into retina credentials
///
/// Credentials embedded in the URL win over the configured ones.
fn split_credentials(raw: &str, creds: &CameraCredentials) -> Result<(Url, Option<Credentials>)> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| AppError::BadRequest(format!("Invalid source URL {}: {}", raw, e)))?;
    if !matches!(url.scheme(), "rtsp" | "rtsps") {
        return Err(AppError::BadRequest(format!(
            "Unsupported source scheme: {}",
            url.scheme()
        )));
    }

    let embedded = if url.username().is_empty() {
        None
    } else {
        Some(Credentials {
            username: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
        })
    };
    let _ = url.set_username("");
    let _ = url.set_password(None);

    let creds = embedded.or_else(|| {
        (!creds.is_empty()).then(|| Credentials {
            username: creds.username.clone(),
            password: creds.password.clone(),
        })
    });
    Ok((url, creds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_credentials_prefers_embedded() {
        let configured = CameraCredentials::new("admin", "configured");
        let (url, creds) =
            split_credentials("rtsp://viewer:pw@10.0.0.5:554/Streaming/Channels/101", &configured)
                .unwrap();
        assert_eq!(url.as_str(), "rtsp://10.0.0.5:554/Streaming/Channels/101");
        let creds = creds.unwrap();
        assert_eq!(creds.username, "viewer");
        assert_eq!(creds.password, "pw");
    }

    #[test]
    fn test_split_credentials_uses_configured() {
        let configured = CameraCredentials::new("admin", "configured");
        let (_, creds) =
            split_credentials("rtsp://10.0.0.5/Streaming/Channels/1", &configured).unwrap();
        assert_eq!(creds.unwrap().password, "configured");

        let (_, creds) = split_credentials(
            "rtsp://10.0.0.5/Streaming/Channels/1",
            &CameraCredentials::default(),
        )
        .unwrap();
        assert!(creds.is_none());
    }

    #[test]
    fn test_split_credentials_rejects_other_schemes() {
        let creds = CameraCredentials::default();
        assert!(matches!(
            split_credentials("http://10.0.0.5/", &creds),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            split_credentials("::", &creds),
            Err(AppError::BadRequest(_))
        ));
    }
}
