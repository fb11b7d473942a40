//! H.264 video track fed from a pooled RTSP source
//!
//! Access units arrive in Annex B form. Before handing them to
//! `TrackLocalStaticSample` the track:
//! - caches SPS/PPS and re-injects them ahead of an IDR that lacks them
//! - strips AUD and filler NAL units
//! - holds back everything until the first keyframe, so the browser
//!   decoder never starts on a P-frame

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{AppError, Result};
use crate::rtsp::h264::{annexb_units, nal, nal_type, START_CODE};
use crate::rtsp::MediaSample;

pub const H264_MIME: &str = "video/H264";
pub const H264_FMTP: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TrackStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub keyframes_sent: u64,
    pub frames_dropped: u64,
}

#[derive(Default)]
struct CachedParams {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl CachedParams {
    /// Rebuild an access unit, updating the cache on the way.
    ///
    /// Returns `None` when nothing sendable is left.
    fn prepare(&mut self, data: &[u8]) -> Option<Bytes> {
        let mut units: Vec<&[u8]> = Vec::new();
        let mut has_sps = false;
        let mut has_pps = false;
        let mut has_idr = false;

        for unit in annexb_units(data) {
            match nal_type(unit) {
                Some(nal::AUD) | Some(nal::FILLER) | None => continue,
                Some(nal::SPS) => {
                    has_sps = true;
                    self.sps = Some(Bytes::copy_from_slice(unit));
                }
                Some(nal::PPS) => {
                    has_pps = true;
                    self.pps = Some(Bytes::copy_from_slice(unit));
                }
                Some(nal::IDR_SLICE) => has_idr = true,
                Some(_) => {}
            }
            units.push(unit);
        }

        if units.is_empty() {
            return None;
        }

        let mut out = BytesMut::with_capacity(data.len() + 64);
        if has_idr {
            if !has_sps {
                if let Some(sps) = &self.sps {
                    out.put_slice(&START_CODE);
                    out.put_slice(sps);
                }
            }
            if !has_pps {
                if let Some(pps) = &self.pps {
                    out.put_slice(&START_CODE);
                    out.put_slice(pps);
                }
            }
        }
        for unit in units {
            out.put_slice(&START_CODE);
            out.put_slice(unit);
        }
        Some(out.freeze())
    }
}

/// Outgoing H.264 track of one relay session
pub struct H264Track {
    track: Arc<TrackLocalStaticSample>,
    params: Mutex<CachedParams>,
    started: AtomicBool,
    stats: Mutex<TrackStats>,
}

impl H264Track {
    pub fn new(track_id: &str, stream_id: &str) -> Self {
        let capability = RTCRtpCodecCapability {
            mime_type: H264_MIME.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: H264_FMTP.to_string(),
            rtcp_feedback: vec![],
        };

        Self {
            track: Arc::new(TrackLocalStaticSample::new(
                capability,
                track_id.to_string(),
                stream_id.to_string(),
            )),
            params: Mutex::new(CachedParams::default()),
            started: AtomicBool::new(false),
            stats: Mutex::new(TrackStats::default()),
        }
    }

    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Whether the first keyframe has gone out
    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TrackStats {
        self.stats.lock().clone()
    }

    /// Write one access unit.
    ///
    /// Returns `Ok(false)` when the sample was held back. Errors from the
    /// underlying track are returned to the caller, which ends the pump.
    pub async fn write(&self, sample: &MediaSample) -> Result<bool> {
        if !self.started() && !sample.is_keyframe {
            self.stats.lock().frames_dropped += 1;
            return Ok(false);
        }

        let Some(data) = self.params.lock().prepare(&sample.data) else {
            return Ok(false);
        };

        let len = data.len() as u64;
        self.track
            .write_sample(&Sample {
                data,
                duration: sample.duration,
                ..Default::default()
            })
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to write sample: {}", e)))?;

        if sample.is_keyframe && !self.started.swap(true, Ordering::AcqRel) {
            debug!("First keyframe written to track {}", self.track.id());
        }

        let mut stats = self.stats.lock();
        stats.frames_sent += 1;
        stats.bytes_sent += len;
        if sample.is_keyframe {
            stats.keyframes_sent += 1;
        }
        Ok(true)
    }
}
