//! Archive playback URLs

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::error::{AppError, Result};

/// Playback length when no end time is given
pub const DEFAULT_PLAYBACK_HOURS: i64 = 1;

fn parse_time(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AppError::BadRequest(format!("Invalid {} time '{}': {}", field, raw, e)))
}

/// `20240131T081500Z`
pub fn format_rtsp_time(time: &DateTime<Utc>) -> String {
    time.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Build the archive URL for `channel` between `start` and `end`
/// (RFC 3339). Credentials are not embedded.
pub fn playback_url(
    ip: &str,
    rtsp_port: u16,
    channel: &str,
    start: &str,
    end: Option<&str>,
) -> Result<String> {
    if channel.trim().is_empty() {
        return Err(AppError::BadRequest("Channel is required".to_string()));
    }

    let start = parse_time("start", start)?;
    let end = match end.filter(|s| !s.trim().is_empty()) {
        Some(raw) => parse_time("end", raw)?,
        None => start + ChronoDuration::hours(DEFAULT_PLAYBACK_HOURS),
    };
    if start >= end {
        return Err(AppError::BadRequest(
            "Start time must be before end time".to_string(),
        ));
    }

    Ok(format!(
        "rtsp://{}:{}/Streaming/tracks/{}?starttime={}&endtime={}",
        ip,
        rtsp_port,
        channel.trim(),
        format_rtsp_time(&start),
        format_rtsp_time(&end)
    ))
}

/// Stream key of an archive session. Same URL, same key.
pub fn playback_stream_key(url: &str) -> String {
    format!("playback_{:016x}", xxhash_rust::xxh64::xxh64(url.as_bytes(), 0))
}
