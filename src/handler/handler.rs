// SPDX-License-Identifier: GPL-2.0-or-later

#![allow(clippy::unused_async)]

mod range;
#[cfg(test)]
mod test;

use adaptive::{
    dash_live_manifest, dash_ondemand_manifest, smooth_manifest, ManifestQuery, Presentation,
    StreamType,
};
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use common::{ArcLogger, ILogger, LogEntry, LogLevel};
use http::{header, HeaderMap, Method, StatusCode};
use playready::DrmType;
use range::{parse_range, HttpRange};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use vod::{assemble_fragment, AssemblyPool, ContentStore};

#[derive(Clone)]
pub struct VodState {
    pub store: Arc<ContentStore>,
    pub pool: Arc<AssemblyPool>,
    pub logger: ArcLogger,
}

impl VodState {
    fn log_warn(&self, msg: String) {
        self.logger
            .log(LogEntry::new(LogLevel::Warning, "vod", msg));
    }
}

/// The adaptive streaming URL surface under `/{endpoint}/`.
pub fn router(endpoint: &str, state: VodState) -> Router {
    let base = format!("/{endpoint}/{{content_id}}/{{version}}/{{drm}}/{{stream}}");
    Router::new()
        .route(&format!("{base}/Manifest"), get(smooth_manifest_handler))
        .route(&format!("{base}/manifest.mpd"), get(mpd_manifest_handler))
        .route(&format!("{base}/content"), get(content_handler))
        .route(
            &format!("{base}/content/{{level}}"),
            get(dash_range_handler),
        )
        .with_state(state)
}

const ALLOW_ORIGIN_ANY: (http::HeaderName, &str) = (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");

fn not_found(reason: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        [ALLOW_ORIGIN_ANY],
        reason.to_owned(),
    )
        .into_response()
}

fn xml_response(content_type: &'static str, body: String) -> Response {
    (
        [(header::CONTENT_TYPE, content_type), ALLOW_ORIGIN_ANY],
        body,
    )
        .into_response()
}

fn media_response(content_type: &'static str, body: Vec<u8>) -> Response {
    (
        [(header::CONTENT_TYPE, content_type), ALLOW_ORIGIN_ANY],
        body,
    )
        .into_response()
}

/// Common front half of every request: parse the drm and
/// stream tags, enforce the clear-streaming switch, and load
/// the presentation.
async fn resolve(
    state: &VodState,
    content_id: &str,
    version: &str,
    drm: &str,
    stream: &str,
    expected: &[StreamType],
) -> Result<Arc<Presentation>, Response> {
    let drm_type: DrmType = drm.parse().map_err(|_| not_found("invalid drm type"))?;
    if drm_type == DrmType::Clear && !state.store.allow_clear() {
        return Err(not_found("clear streaming disabled"));
    }
    let stream_type: StreamType = stream
        .parse()
        .map_err(|_| not_found("invalid stream type"))?;
    if !expected.contains(&stream_type) {
        return Err(not_found("invalid path for stream type"));
    }

    match state
        .store
        .presentation(content_id, version, drm_type, stream_type)
        .await
    {
        Ok(presentation) => Ok(presentation),
        Err(e) => {
            state.log_warn(format!("failed to load '{content_id}': {e}"));
            Err(not_found("failed to load"))
        }
    }
}

fn query_u64(
    query: &HashMap<String, String>,
    key: &'static str,
) -> Result<Option<u64>, Response> {
    match query.get(key) {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| not_found(&format!("{key} is not a number"))),
    }
}

fn manifest_query(query: &HashMap<String, String>) -> Result<ManifestQuery, Response> {
    Ok(ManifestQuery {
        max_pixels: query_u64(query, "max_pixels")?,
        max_width: query_u64(query, "max_width")?,
        max_height: query_u64(query, "max_height")?,
        max_bitrate: query_u64(query, "max_bitrate")?,
        max_profile: query_u64(query, "max_profile")?,
        max_level: query_u64(query, "max_level")?,
        auth_token: query.get("auth_token").cloned(),
    })
}

pub async fn smooth_manifest_handler(
    State(state): State<VodState>,
    Path((content_id, version, drm, stream)): Path<(String, String, String, String)>,
    Query(raw_query): Query<HashMap<String, String>>,
) -> Response {
    let presentation = match resolve(
        &state,
        &content_id,
        &version,
        &drm,
        &stream,
        &[StreamType::Ism],
    )
    .await
    {
        Ok(v) => v,
        Err(response) => return response,
    };
    let query = match manifest_query(&raw_query) {
        Ok(v) => v,
        Err(response) => return response,
    };
    xml_response("text/xml", smooth_manifest(&presentation, &query))
}

pub async fn mpd_manifest_handler(
    State(state): State<VodState>,
    Path((content_id, version, drm, stream)): Path<(String, String, String, String)>,
    Query(raw_query): Query<HashMap<String, String>>,
) -> Response {
    let presentation = match resolve(
        &state,
        &content_id,
        &version,
        &drm,
        &stream,
        &[StreamType::DashLive, StreamType::DashOnDemand],
    )
    .await
    {
        Ok(v) => v,
        Err(response) => return response,
    };
    let query = match manifest_query(&raw_query) {
        Ok(v) => v,
        Err(response) => return response,
    };
    let body = match presentation.stream_type {
        StreamType::DashLive => dash_live_manifest(&presentation, &query),
        StreamType::DashOnDemand => dash_ondemand_manifest(&presentation, &query),
        StreamType::Ism => unreachable!("rejected by resolve"),
    };
    xml_response("application/octet-stream", body)
}

#[derive(Debug, Error)]
enum FragmentJobError {
    #[error("level vanished")]
    LevelVanished,

    #[error("assemble: {0}")]
    Assemble(#[from] vod::AssembleError),

    #[error("encrypt: {0}")]
    Encrypt(#[from] playready::EncryptError),
}

/// Read and optionally encrypt one fragment's mdat on the
/// worker pool.
fn fragment_job(
    presentation: Arc<Presentation>,
    is_video: bool,
    level_index: usize,
    fragment_index: usize,
) -> Result<Vec<u8>, FragmentJobError> {
    use FragmentJobError::*;

    let levels = if is_video {
        &presentation.video_levels
    } else {
        &presentation.audio_levels
    };
    let level = levels.get(level_index).ok_or(LevelVanished)?;
    let track = presentation.track(level);
    let fragment = track.fragments.get(fragment_index).ok_or(LevelVanished)?;

    let mut mdat = assemble_fragment(&level.filename, fragment)?;
    if presentation.drm_type.is_encrypted() {
        playready::encrypt_samples(fragment, &mut mdat, &presentation.content_key)?;
    }
    Ok(mdat)
}

fn media_content_type(is_video: bool) -> &'static str {
    if is_video {
        "video/mp4"
    } else {
        "audio/mp4"
    }
}

/// Smooth and DASH Live media endpoint: either the
/// initialization header or one assembled fragment.
pub async fn content_handler(
    State(state): State<VodState>,
    Path((content_id, version, drm, stream)): Path<(String, String, String, String)>,
    Query(raw_query): Query<HashMap<String, String>>,
) -> Response {
    let presentation = match resolve(
        &state,
        &content_id,
        &version,
        &drm,
        &stream,
        &[StreamType::Ism, StreamType::DashLive],
    )
    .await
    {
        Ok(v) => v,
        Err(response) => return response,
    };

    let Some(stream_param) = raw_query.get("stream") else {
        return not_found("missing stream parameter");
    };
    let is_video = match stream_param.as_str() {
        "video" => true,
        "audio" => false,
        _ => return not_found("stream is not \"audio\" or \"video\""),
    };
    let Some(bitrate) = raw_query.get("bitrate") else {
        return not_found("missing bitrate parameter");
    };
    let Ok(bitrate) = bitrate.parse::<u64>() else {
        return not_found("bitrate is not a number");
    };
    let Some(start_time) = raw_query.get("start_time") else {
        return not_found("missing start_time parameter");
    };
    let start_time = if start_time == "init" {
        None
    } else {
        match start_time.parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => return not_found("start_time is not a number or \"init\""),
        }
    };

    let Some((level_index, level)) = level_by_bitrate(&presentation, is_video, bitrate) else {
        return not_found("level not found for stream and bitrate");
    };
    let track = presentation.track(level);

    let Some(start_time) = start_time else {
        // The init chunk is served straight from memory,
        // never encrypted.
        return media_response(media_content_type(is_video), track.ccff_header_data.clone());
    };

    let Some(fragment_index) = track
        .fragments
        .iter()
        .position(|f| f.timestamp == start_time)
    else {
        return not_found("fragment not found for start_time");
    };

    let job_presentation = presentation.clone();
    let result = state
        .pool
        .run(move || fragment_job(job_presentation, is_video, level_index, fragment_index))
        .await;

    let mdat = match result {
        Ok(Ok(mdat)) => mdat,
        Ok(Err(e)) => {
            state.log_warn(format!("assemble fragment: {e}"));
            return not_found("failed to read fragment (broken manifest?)");
        }
        Err(_) => return not_found("worker pool is gone"),
    };

    let fragment = &presentation.track(level).fragments[fragment_index];
    let mut body = Vec::with_capacity(fragment.moof_size + mdat.len());
    body.extend_from_slice(&fragment.moof_data[..fragment.moof_size]);
    body.extend_from_slice(&mdat);
    media_response(media_content_type(is_video), body)
}

fn level_by_bitrate(
    presentation: &Presentation,
    is_video: bool,
    bitrate: u64,
) -> Option<(usize, &adaptive::Level)> {
    let levels = if is_video {
        &presentation.video_levels
    } else {
        &presentation.audio_levels
    };
    levels
        .iter()
        .enumerate()
        .find(|(_, l)| u64::from(l.bitrate) == bitrate)
}

fn append_clipped(out: &mut Vec<u8>, data: &[u8], region_start: u64, start: u64, end: u64) {
    let region_end = region_start + u64::try_from(data.len()).expect("data fits u64");
    let clip_start = start.max(region_start);
    let clip_end = end.min(region_end);
    if clip_start >= clip_end {
        return;
    }
    let a = usize::try_from(clip_start - region_start).expect("clip fits memory");
    let b = usize::try_from(clip_end - region_start).expect("clip fits memory");
    out.extend_from_slice(&data[a..b]);
}

/// DASH On-Demand level endpoint. The level is one virtual
/// file `[moov+sidx | moof | mdat | …]` addressed with HTTP
/// Range requests; the response is assembled from whichever
/// regions the range intersects.
#[allow(clippy::too_many_lines)]
pub async fn dash_range_handler(
    State(state): State<VodState>,
    Path((content_id, version, drm, stream, level_path)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let presentation = match resolve(
        &state,
        &content_id,
        &version,
        &drm,
        &stream,
        &[StreamType::DashOnDemand],
    )
    .await
    {
        Ok(v) => v,
        Err(response) => return response,
    };

    let (is_video, levels) = match level_path.chars().next() {
        Some('v') => (true, &presentation.video_levels),
        Some('a') => (false, &presentation.audio_levels),
        _ => return not_found("bad level path"),
    };
    let Ok(level_index) = level_path[1..].parse::<usize>() else {
        return not_found("bad level path");
    };
    let Some(level) = levels.get(level_index) else {
        return not_found("level not found");
    };
    let track = presentation.track(level);
    let content_type = media_content_type(is_video);

    if method == Method::HEAD {
        return (
            [
                (header::CONTENT_TYPE, content_type.to_owned()),
                (header::CONTENT_LENGTH, track.dash_size.to_string()),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_owned()),
            ],
            Vec::new(),
        )
            .into_response();
    }

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());
    let ranges = match parse_range(range_header, track.dash_size) {
        Ok(ranges) => ranges,
        Err(e) => {
            state.log_warn(format!("range '{}': {e}", range_header.unwrap_or("")));
            Vec::new()
        }
    };
    let range = match ranges.len() {
        1 => Some(&ranges[0]),
        0 => None,
        _ => {
            // One range per request; a multipart answer would
            // only complicate clients that never send one.
            state.log_warn(format!("{} ranges requested, serving whole file", ranges.len()));
            None
        }
    };
    let (start, end) = match range {
        Some(HttpRange { start, length }) => (*start, start + length),
        None => (0, track.dash_size),
    };

    let header_and_sidx =
        u64::try_from(track.dash_header_and_sidx_size).expect("header fits u64");

    let mut body = Vec::with_capacity(usize::try_from(end - start).expect("body fits memory"));
    append_clipped(&mut body, &track.dash_header_data, 0, start, end);

    for (fragment_index, fragment) in track.fragments.iter().enumerate() {
        let moof_start = header_and_sidx + fragment.offset;
        if end <= moof_start {
            break;
        }
        let moof_size = u64::try_from(fragment.moof_size).expect("moof fits u64");

        append_clipped(
            &mut body,
            &fragment.moof_data[..fragment.moof_size],
            moof_start,
            start,
            end,
        );

        let mdat_start = moof_start + moof_size;
        if start < mdat_start + fragment.mdat_size && mdat_start < end {
            let job_presentation = presentation.clone();
            let result = state
                .pool
                .run(move || {
                    fragment_job(job_presentation, is_video, level_index, fragment_index)
                })
                .await;
            let mdat = match result {
                Ok(Ok(mdat)) => mdat,
                Ok(Err(e)) => {
                    state.log_warn(format!("assemble fragment: {e}"));
                    return not_found("failed to read fragment (broken manifest?)");
                }
                Err(_) => return not_found("worker pool is gone"),
            };
            append_clipped(&mut body, &mdat, mdat_start, start, end);
        }
    }

    match range {
        Some(range) => (
            StatusCode::PARTIAL_CONTENT,
            [
                (header::CONTENT_TYPE, content_type.to_owned()),
                (
                    header::CONTENT_RANGE,
                    range.content_range(track.dash_size),
                ),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_owned()),
            ],
            body,
        )
            .into_response(),
        None => media_response(content_type, body),
    }
}
