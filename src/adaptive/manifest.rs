// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{Level, Presentation, StreamType};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use common::time::TICKS_PER_SECOND;
use playready::PLAYREADY_SCHEME_ID_URI;
use serde::Deserialize;
use std::fmt::Write;

/// Optional video filters parsed from the manifest URL. Levels
/// failing any bound are left out of the response; audio is
/// never filtered.
#[derive(Debug, Default, Deserialize)]
pub struct ManifestQuery {
    pub max_pixels: Option<u64>,
    pub max_width: Option<u64>,
    pub max_height: Option<u64>,
    pub max_bitrate: Option<u64>,
    pub max_profile: Option<u64>,
    pub max_level: Option<u64>,
    pub auth_token: Option<String>,
}

impl ManifestQuery {
    #[must_use]
    pub fn allows_video(&self, level: &Level) -> bool {
        let width = u64::from(level.width);
        let height = u64::from(level.height);
        if width > self.max_width.unwrap_or(u64::MAX)
            || height > self.max_height.unwrap_or(u64::MAX)
            || width * height > self.max_pixels.unwrap_or(u64::MAX)
            || u64::from(level.profile) > self.max_profile.unwrap_or(u64::MAX)
            || u64::from(level.level) > self.max_level.unwrap_or(u64::MAX)
            || u64::from(level.bitrate) > self.max_bitrate.unwrap_or(u64::MAX)
        {
            return false;
        }
        true
    }
}

fn protection_header_base64(p: &Presentation) -> Option<String> {
    p.protection_header.as_ref().map(|h| BASE64.encode(h))
}

/// Smooth Streaming client manifest.
#[must_use]
#[allow(clippy::missing_panics_doc)]
pub fn smooth_manifest(p: &Presentation, q: &ManifestQuery) -> String {
    let mut s = String::new();
    let w = &mut s;

    writeln!(w, "<?xml version=\"1.0\" encoding=\"utf-8\"?>").expect("infallible");
    writeln!(
        w,
        "<SmoothStreamingMedia MajorVersion=\"2\" MinorVersion=\"1\" Duration=\"{}\">",
        p.duration
    )
    .expect("infallible");

    let video = &p.video_levels[0];
    writeln!(
        w,
        "  <StreamIndex Type=\"video\" Name=\"video\" Chunks=\"{}\" QualityLevels=\"{}\" \
         MaxWidth=\"{}\" MaxHeight=\"{}\" DisplayWidth=\"{}\" DisplayHeight=\"{}\" \
         Url=\"content?stream=video&amp;bitrate={{bitrate}}&amp;start_time={{start time}}\">",
        video.n_fragments,
        p.video_levels.len(),
        p.max_width,
        p.max_height,
        p.max_width,
        p.max_height,
    )
    .expect("infallible");

    for (i, level) in p.video_levels.iter().enumerate() {
        if !q.allows_video(level) {
            continue;
        }
        writeln!(
            w,
            "    <QualityLevel Index=\"{}\" Bitrate=\"{}\" FourCC=\"H264\" MaxWidth=\"{}\" \
             MaxHeight=\"{}\" CodecPrivateData=\"{}\" />",
            i, level.bitrate, level.width, level.height, level.codec_private_data,
        )
        .expect("infallible");
    }
    for fragment in &p.track(video).fragments {
        writeln!(w, "    <c d=\"{}\" />", fragment.duration).expect("infallible");
    }
    writeln!(w, "  </StreamIndex>").expect("infallible");

    let audio = &p.audio_levels[0];
    writeln!(
        w,
        "  <StreamIndex Type=\"audio\" Index=\"0\" Name=\"audio\" Chunks=\"{}\" \
         QualityLevels=\"1\" \
         Url=\"content?stream=audio&amp;bitrate={{bitrate}}&amp;start_time={{start time}}\">",
        audio.n_fragments,
    )
    .expect("infallible");
    writeln!(
        w,
        "    <QualityLevel FourCC=\"AACL\" Bitrate=\"{}\" SamplingRate=\"{}\" Channels=\"2\" \
         BitsPerSample=\"16\" PacketSize=\"4\" AudioTag=\"255\" CodecPrivateData=\"{}\" />",
        audio.bitrate, audio.audio_rate, audio.codec_private_data,
    )
    .expect("infallible");
    for fragment in &p.track(audio).fragments {
        writeln!(w, "    <c d=\"{}\" />", fragment.duration).expect("infallible");
    }
    writeln!(w, "  </StreamIndex>").expect("infallible");

    if let Some(header) = protection_header_base64(p) {
        writeln!(w, "<Protection>").expect("infallible");
        write!(
            w,
            "  <ProtectionHeader SystemID=\"9a04f079-9840-4286-ab92-e65be0885f95\">{header}"
        )
        .expect("infallible");
        writeln!(w, "</ProtectionHeader>").expect("infallible");
        writeln!(w, "</Protection>").expect("infallible");
    }
    writeln!(w, "</SmoothStreamingMedia>").expect("infallible");

    s
}

fn append_content_protection(w: &mut String, p: &Presentation) {
    if let Some(header) = protection_header_base64(p) {
        writeln!(
            w,
            "      <ContentProtection schemeIdUri=\"{PLAYREADY_SCHEME_ID_URI}\">"
        )
        .expect("infallible");
        writeln!(w, "        <mspr:pro>{header}</mspr:pro>").expect("infallible");
        writeln!(w, "      </ContentProtection>").expect("infallible");
    }
}

fn mpd_open(w: &mut String, p: &Presentation, min_buffer_secs: u32, profiles: &str) {
    writeln!(w, "<?xml version=\"1.0\" encoding=\"utf-8\"?>").expect("infallible");
    writeln!(
        w,
        "<MPD xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\""
    )
    .expect("infallible");
    writeln!(w, "  xmlns=\"urn:mpeg:dash:schema:mpd:2011\"").expect("infallible");
    if p.protection_header.is_some() {
        writeln!(w, "  xmlns:mspr=\"urn:microsoft:playready\"").expect("infallible");
    }
    writeln!(
        w,
        "  xsi:schemaLocation=\"urn:mpeg:dash:schema:mpd:2011 DASH-MPD.xsd\""
    )
    .expect("infallible");
    writeln!(w, "  type=\"static\"").expect("infallible");
    writeln!(
        w,
        "  mediaPresentationDuration=\"PT{}S\"",
        p.duration / TICKS_PER_SECOND
    )
    .expect("infallible");
    writeln!(w, "  minBufferTime=\"PT{min_buffer_secs}S\"").expect("infallible");
    writeln!(w, "  profiles=\"{profiles}\">").expect("infallible");
    writeln!(w, "  <Period>").expect("infallible");
}

fn mpd_close(w: &mut String) {
    writeln!(w, "  </Period>").expect("infallible");
    writeln!(w, "</MPD>").expect("infallible");
}

fn segment_timeline(w: &mut String, p: &Presentation, level: &Level, stream: &str) {
    writeln!(
        w,
        "    <SegmentTemplate timescale=\"{TICKS_PER_SECOND}\" \
         media=\"content?stream={stream}&amp;bitrate=$Bandwidth$&amp;start_time=$Time$\" \
         initialization=\"content?stream={stream}&amp;bitrate=$Bandwidth$&amp;start_time=init\">"
    )
    .expect("infallible");
    writeln!(w, "      <SegmentTimeline>").expect("infallible");
    for fragment in &p.track(level).fragments {
        writeln!(w, "        <S d=\"{}\" />", fragment.duration).expect("infallible");
    }
    writeln!(w, "      </SegmentTimeline>").expect("infallible");
    writeln!(w, "    </SegmentTemplate>").expect("infallible");
}

/// MPD for the DASH Live profile, addressing fragments through
/// a segment template over the same `content` endpoint Smooth
/// uses.
#[must_use]
pub fn dash_live_manifest(p: &Presentation, q: &ManifestQuery) -> String {
    debug_assert_eq!(StreamType::DashLive, p.stream_type);

    let mut s = String::new();
    let w = &mut s;
    mpd_open(w, p, 4, "urn:mpeg:dash:profile:isoff-live:2011");

    writeln!(
        w,
        "    <AdaptationSet id=\"1\" profiles=\"ccff\" bitstreamSwitching=\"true\" \
         segmentAlignment=\"true\" contentType=\"audio\" mimeType=\"audio/mp4\" lang=\"en\">"
    )
    .expect("infallible");
    append_content_protection(w, p);
    segment_timeline(w, p, &p.audio_levels[0], "audio");
    for (i, level) in p.audio_levels.iter().enumerate() {
        writeln!(
            w,
            "      <Representation id=\"a{}\" codecs=\"{}\" bandwidth=\"{}\" \
             audioSamplingRate=\"{}\"/>",
            i, level.codec, level.bitrate, level.audio_rate,
        )
        .expect("infallible");
    }
    writeln!(w, "    </AdaptationSet>").expect("infallible");

    writeln!(
        w,
        "    <AdaptationSet id=\"2\" profiles=\"ccff\" bitstreamSwitching=\"true\" \
         segmentAlignment=\"true\" contentType=\"video\" mimeType=\"video/mp4\" \
         maxWidth=\"{}\" maxHeight=\"{}\" startWithSAP=\"1\">",
        p.max_width, p.max_height,
    )
    .expect("infallible");
    append_content_protection(w, p);
    segment_timeline(w, p, &p.video_levels[0], "video");
    for (i, level) in p.video_levels.iter().enumerate() {
        if !q.allows_video(level) {
            continue;
        }
        writeln!(
            w,
            "      <Representation id=\"v{}\" bandwidth=\"{}\" codecs=\"{}\" width=\"{}\" \
             height=\"{}\"/>",
            i, level.bitrate, level.codec, level.width, level.height,
        )
        .expect("infallible");
    }
    writeln!(w, "    </AdaptationSet>").expect("infallible");

    mpd_close(w);
    s
}

fn segment_base(w: &mut String, p: &Presentation, level: &Level) {
    let track = p.track(level);
    writeln!(
        w,
        "        <SegmentBase indexRange=\"{}-{}\"><Initialization range=\"0-{}\" /></SegmentBase>",
        track.dash_header_size,
        track.dash_header_and_sidx_size - 1,
        track.dash_header_size - 1,
    )
    .expect("infallible");
}

/// MPD for the DASH On-Demand profile: one Range-addressable
/// virtual file per level.
#[must_use]
pub fn dash_ondemand_manifest(p: &Presentation, q: &ManifestQuery) -> String {
    debug_assert_eq!(StreamType::DashOnDemand, p.stream_type);

    let mut s = String::new();
    let w = &mut s;
    mpd_open(w, p, 2, "urn:mpeg:dash:profile:isoff-on-demand:2011");

    writeln!(
        w,
        "    <AdaptationSet mimeType=\"audio/mp4\" lang=\"en\" subsegmentAlignment=\"true\" \
         subsegmentStartsWithSAP=\"1\">"
    )
    .expect("infallible");
    append_content_protection(w, p);
    if let Some(level) = p.audio_levels.first() {
        writeln!(
            w,
            "      <Representation id=\"a0\" codecs=\"{}\" bandwidth=\"{}\">",
            level.codec, level.bitrate,
        )
        .expect("infallible");
        writeln!(w, "        <BaseURL>content/a0</BaseURL>").expect("infallible");
        segment_base(w, p, level);
        writeln!(w, "      </Representation>").expect("infallible");
    }
    writeln!(w, "    </AdaptationSet>").expect("infallible");

    writeln!(
        w,
        "    <AdaptationSet mimeType=\"video/mp4\" subsegmentAlignment=\"true\" \
         subsegmentStartsWithSAP=\"1\">"
    )
    .expect("infallible");
    append_content_protection(w, p);
    for (i, level) in p.video_levels.iter().enumerate() {
        if !q.allows_video(level) {
            continue;
        }
        writeln!(
            w,
            "      <Representation id=\"v{}\" bandwidth=\"{}\" codecs=\"{}\" width=\"{}\" \
             height=\"{}\">",
            i, level.bitrate, level.codec, level.width, level.height,
        )
        .expect("infallible");
        writeln!(w, "        <BaseURL>content/v{i}</BaseURL>").expect("infallible");
        segment_base(w, p, level);
        writeln!(w, "      </Representation>").expect("infallible");
    }
    writeln!(w, "    </AdaptationSet>").expect("infallible");

    mpd_close(w);
    s
}
