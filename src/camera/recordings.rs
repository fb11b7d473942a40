//! Archive recording search (`/ISAPI/ContentMgmt/search`)
//!
//! The camera speaks XML here. Dates come from the UI as `dd.mm.yyyy`
//! and cover whole days.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Upper bound on matches returned by one search
pub const MAX_SEARCH_RESULTS: u32 = 1000;

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// One recorded segment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recording {
    pub channel: String,
    pub start_time: String,
    pub end_time: String,
    /// Archive URI as reported by the camera, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TimeSpan {
    #[serde(rename = "startTime")]
    start_time: String,
    #[serde(rename = "endTime")]
    end_time: String,
}

#[derive(Debug, Serialize)]
struct TrackList {
    #[serde(rename = "trackID")]
    track_id: String,
}

#[derive(Debug, Serialize)]
struct TimeSpanList {
    #[serde(rename = "timeSpan")]
    time_span: TimeSpan,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CMSearchDescription")]
struct SearchDescription {
    #[serde(rename = "searchID")]
    search_id: String,
    #[serde(rename = "trackList")]
    track_list: TrackList,
    #[serde(rename = "timeSpanList")]
    time_span_list: TimeSpanList,
    #[serde(rename = "maxResults")]
    max_results: u32,
    #[serde(rename = "searchResultPosition")]
    search_result_position: u32,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(rename = "matchList", default)]
    match_list: MatchList,
}

#[derive(Debug, Default, Deserialize)]
struct MatchList {
    #[serde(rename = "searchMatchItem", default)]
    items: Vec<MatchItem>,
}

#[derive(Debug, Deserialize)]
struct MatchItem {
    #[serde(rename = "trackID", default)]
    track_id: Option<String>,
    #[serde(rename = "timeSpan")]
    time_span: TimeSpan,
    #[serde(rename = "mediaSegmentDescriptor", default)]
    media: Option<MediaSegment>,
}

#[derive(Debug, Deserialize)]
struct MediaSegment {
    #[serde(rename = "playbackURI", default)]
    playback_uri: Option<String>,
}

/// Accepts `dd.mm.yyyy` and `yyyy-mm-dd`
pub fn parse_search_date(raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%d.%m.%Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .map_err(|_| AppError::BadRequest(format!("Invalid date '{}', expected dd.mm.yyyy", raw)))
}

/// Whole-day search window. The end date defaults to today.
pub fn search_window(start: &str, end: Option<&str>) -> Result<(String, String)> {
    let start = parse_search_date(start)?;
    let end = match end.filter(|s| !s.trim().is_empty()) {
        Some(raw) => parse_search_date(raw)?,
        None => Utc::now().date_naive(),
    };
    if start > end {
        return Err(AppError::BadRequest(
            "Start date must not be after end date".to_string(),
        ));
    }
    Ok((
        format!("{}T00:00:00Z", start.format("%Y-%m-%d")),
        format!("{}T23:59:59Z", end.format("%Y-%m-%d")),
    ))
}

pub(crate) fn search_request_xml(channel: &str, start_time: &str, end_time: &str) -> Result<String> {
    let request = SearchDescription {
        search_id: uuid::Uuid::new_v4().to_string(),
        track_list: TrackList {
            track_id: channel.to_string(),
        },
        time_span_list: TimeSpanList {
            time_span: TimeSpan {
                start_time: start_time.to_string(),
                end_time: end_time.to_string(),
            },
        },
        max_results: MAX_SEARCH_RESULTS,
        search_result_position: 0,
    };
    let body = quick_xml::se::to_string(&request)
        .map_err(|e| AppError::Internal(format!("Failed to build search request: {}", e)))?;
    Ok(format!("{}{}", XML_DECLARATION, body))
}

pub(crate) fn parse_search_response(xml: &str, channel: &str) -> Result<Vec<Recording>> {
    let result: SearchResult = quick_xml::de::from_str(xml)
        .map_err(|e| AppError::Camera(format!("Invalid recording search response: {}", e)))?;

    Ok(result
        .match_list
        .items
        .into_iter()
        .map(|item| Recording {
            channel: item.track_id.unwrap_or_else(|| channel.to_string()),
            start_time: item.time_span.start_time,
            end_time: item.time_span.end_time,
            playback_uri: item.media.and_then(|m| m.playback_uri),
        })
        .collect())
}
