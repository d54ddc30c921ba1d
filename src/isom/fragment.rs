// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    Fragment, FragmentSample, Handler, MdatChunk, Movie, DEFAULT_DEGRADATION_PRIORITY,
    SAMPLE_FLAG_IS_NON_SYNC, SDTP_SAMPLE_DEPENDENT, SDTP_SAMPLE_INDEPENDENT,
};
use common::time::{from_ticks, to_ticks, TICKS_PER_SECOND};
use mp4::{
    TFHD_DEFAULT_SAMPLE_DURATION_PRESENT, TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT,
    TRUN_DATA_OFFSET_PRESENT, TRUN_FIRST_SAMPLE_FLAGS_PRESENT,
    TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT, TRUN_SAMPLE_DURATION_PRESENT,
    TRUN_SAMPLE_SIZE_PRESENT,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentizeError {
    #[error("no video track")]
    NoVideoTrack,

    #[error("no audio track")]
    NoAudioTrack,

    #[error("video track has no samples, already fragmented?")]
    AlreadyFragmented,

    #[error("video track has no sync sample table")]
    NoSyncTable,

    #[error("sync sample {0} out of range")]
    SyncSampleOutOfRange(u32),

    #[error("sample {0} missing from sample tables")]
    MissingSample(u64),
}

/// First sample of a video fragment decodes independently.
const FIRST_VIDEO_SAMPLE_FLAGS: u32 = 0x40;

/// Default video sample duration advertised in tfhd, 40 ms.
const VIDEO_DEFAULT_SAMPLE_DURATION: u32 = 400_000;

/// Split a non-fragmented movie into streaming fragments, one
/// video fragment per sync sample, with audio fragments cut at
/// the matching timestamps. Fragments are numbered 1..2N with
/// audio odd and video even.
pub fn fragmentize(movie: &mut Movie) -> Result<(), FragmentizeError> {
    use FragmentizeError::*;

    let video_index = movie
        .tracks
        .iter()
        .position(|t| t.handler == Handler::Video)
        .ok_or(NoVideoTrack)?;
    let audio_index = movie
        .tracks
        .iter()
        .position(|t| t.handler == Handler::Audio)
        .ok_or(NoAudioTrack)?;

    let video = &movie.tracks[video_index];
    let audio = &movie.tracks[audio_index];

    if video.num_samples == 0 {
        return Err(AlreadyFragmented);
    }
    let sync_samples = video.stss.as_ref().ok_or(NoSyncTable)?;
    if sync_samples.is_empty() {
        return Err(NoSyncTable);
    }

    let n_fragments = sync_samples.len();
    let mut video_fragments = Vec::with_capacity(n_fragments);
    let mut audio_fragments = Vec::with_capacity(n_fragments);

    let mut video_timestamp: u64 = 0;
    let mut audio_timestamp: u64 = 0;
    let mut video_media_time: u64 = 0;
    let mut audio_media_time: u64 = 0;
    let mut audio_sample_index: u64 = 0;

    for i in 0..n_fragments {
        let sequence = u32::try_from(i).map_err(|_| SyncSampleOutOfRange(u32::MAX))?;

        // Sync sample numbers are one-based.
        let first_sample = u64::from(
            sync_samples[i]
                .checked_sub(1)
                .ok_or(SyncSampleOutOfRange(sync_samples[i]))?,
        );
        let end_sample = if i + 1 == n_fragments {
            video.sample_count()
        } else {
            u64::from(
                sync_samples[i + 1]
                    .checked_sub(1)
                    .ok_or(SyncSampleOutOfRange(sync_samples[i + 1]))?,
            )
        };
        if end_sample <= first_sample || end_sample > video.sample_count() {
            return Err(SyncSampleOutOfRange(sync_samples[i]));
        }
        let n_samples = usize::try_from(end_sample - first_sample).expect("bounded sample count");

        let mut fragment = Fragment {
            track_id: video.track_id,
            sequence_number: 2 * sequence + 2,
            timestamp: video_timestamp,
            tfhd_flags: TFHD_DEFAULT_SAMPLE_DURATION_PRESENT | TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT,
            default_sample_duration: VIDEO_DEFAULT_SAMPLE_DURATION,
            default_sample_flags: SAMPLE_FLAG_IS_NON_SYNC | DEFAULT_DEGRADATION_PRIORITY,
            trun_flags: TRUN_SAMPLE_SIZE_PRESENT
                | TRUN_DATA_OFFSET_PRESENT
                | TRUN_FIRST_SAMPLE_FLAGS_PRESENT
                | TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT,
            first_sample_flags: FIRST_VIDEO_SAMPLE_FLAGS,
            mdat_size: 8,
            ..Fragment::default()
        };
        fragment.samples.reserve(n_samples);
        fragment.sdtp_flags = vec![SDTP_SAMPLE_DEPENDENT; n_samples];
        fragment.sdtp_flags[0] = SDTP_SAMPLE_INDEPENDENT;

        for j in 0..n_samples {
            let index = first_sample + u64::try_from(j).expect("bounded sample count");
            let sample = video.sample(index).ok_or(MissingSample(index))?;

            video_media_time += u64::from(sample.duration);
            let next_timestamp = to_ticks(video_media_time, video.timescale);
            let duration = u32::try_from(next_timestamp - video_timestamp)
                .map_err(|_| MissingSample(index))?;
            video_timestamp = next_timestamp;

            // Composition offsets are biased by one second so
            // the scaling never goes negative.
            let cto = to_ticks(
                u64::from(sample.composition_time_offset) + u64::from(video.timescale),
                video.timescale,
            ) - TICKS_PER_SECOND;

            fragment.samples.push(FragmentSample {
                duration,
                size: sample.size,
                flags: 0,
                composition_time_offset: u32::try_from(cto).map_err(|_| MissingSample(index))?,
            });
            push_chunk(&mut fragment.chunks, sample.offset, u64::from(sample.size));
            fragment.mdat_size += u64::from(sample.size);
        }
        fragment.duration = video_timestamp - fragment.timestamp;
        video_fragments.push(fragment);

        // The audio fragment runs until the first audio sample
        // at or past the new video timestamp.
        let audio_end_index =
            audio.index_from_timestamp(from_ticks(video_timestamp, audio.timescale));

        let mut fragment = Fragment {
            track_id: audio.track_id,
            sequence_number: 2 * sequence + 1,
            timestamp: audio_timestamp,
            tfhd_flags: TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT,
            default_sample_flags: DEFAULT_DEGRADATION_PRIORITY,
            trun_flags: TRUN_SAMPLE_DURATION_PRESENT
                | TRUN_SAMPLE_SIZE_PRESENT
                | TRUN_DATA_OFFSET_PRESENT,
            mdat_size: 8,
            ..Fragment::default()
        };

        for index in audio_sample_index..audio_end_index {
            let sample = audio.sample(index).ok_or(MissingSample(index))?;

            audio_media_time += u64::from(sample.duration);
            let next_timestamp = to_ticks(audio_media_time, audio.timescale);
            let duration = u32::try_from(next_timestamp - audio_timestamp)
                .map_err(|_| MissingSample(index))?;
            audio_timestamp = next_timestamp;

            fragment.samples.push(FragmentSample {
                duration,
                size: sample.size,
                flags: 0,
                composition_time_offset: sample.composition_time_offset,
            });
            push_chunk(&mut fragment.chunks, sample.offset, u64::from(sample.size));
            fragment.mdat_size += u64::from(sample.size);
        }
        audio_sample_index = audio_end_index;
        fragment.duration = audio_timestamp - fragment.timestamp;
        audio_fragments.push(fragment);
    }

    movie.tracks[video_index].fragments = video_fragments;
    movie.tracks[audio_index].fragments = audio_fragments;
    Ok(())
}

// Contiguous source ranges merge into one read.
fn push_chunk(chunks: &mut Vec<MdatChunk>, offset: u64, size: u64) {
    if let Some(last) = chunks.last_mut() {
        if last.offset + last.size == offset {
            last.size += size;
            return;
        }
    }
    chunks.push(MdatChunk { offset, size });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Track;
    use mp4::{StscEntry, SttsEntry};
    use pretty_assertions::assert_eq;

    // 300 video samples at 30 fps in a 90 kHz timescale with a
    // sync sample every 60 samples, and AAC audio at 1024
    // samples per frame in a 48 kHz timescale.
    fn test_movie() -> Movie {
        let video = Track {
            track_id: 2,
            handler: Handler::Video,
            timescale: 90_000,
            num_samples: 300,
            sample_size: 100,
            stts: vec![SttsEntry {
                sample_count: 300,
                sample_delta: 3000,
            }],
            stss: Some(vec![1, 61, 121, 181, 241]),
            stsc: vec![StscEntry {
                first_chunk: 1,
                samples_per_chunk: 300,
                sample_description_index: 1,
            }],
            chunk_offsets: vec![10_000],
            ..Track::default()
        };
        let audio = Track {
            track_id: 1,
            handler: Handler::Audio,
            timescale: 48_000,
            num_samples: 470,
            sample_size: 50,
            stts: vec![SttsEntry {
                sample_count: 470,
                sample_delta: 1024,
            }],
            stsc: vec![StscEntry {
                first_chunk: 1,
                samples_per_chunk: 470,
                sample_description_index: 1,
            }],
            chunk_offsets: vec![50_000],
            ..Track::default()
        };
        Movie {
            timescale: 1000,
            duration: 10_000,
            next_track_id: 3,
            tracks: vec![audio, video],
            pssh: None,
        }
    }

    #[test]
    fn test_fragmentize() {
        let mut movie = test_movie();
        fragmentize(&mut movie).unwrap();

        let video = movie.video_track().unwrap();
        let audio = movie.audio_track().unwrap();
        assert_eq!(5, video.fragments.len());
        assert_eq!(5, audio.fragments.len());

        // Every GOP is 60 samples of 3000/90000 s, two seconds.
        for (i, fragment) in video.fragments.iter().enumerate() {
            assert_eq!(60, fragment.samples.len());
            assert_eq!(20_000_000, fragment.duration);
            assert_eq!(u64::try_from(i).unwrap() * 20_000_000, fragment.timestamp);
            assert_eq!(u32::try_from(i).unwrap() * 2 + 2, fragment.sequence_number);
        }

        // Audio fragment boundaries land on the first audio
        // sample at or past each video boundary.
        let mut boundaries = vec![0];
        let mut total = 0;
        for fragment in &audio.fragments {
            total += fragment.samples.len();
            boundaries.push(total);
        }
        assert_eq!(vec![0, 93, 187, 281, 375, 468], boundaries);

        for (i, fragment) in audio.fragments.iter().enumerate() {
            assert_eq!(u32::try_from(i).unwrap() * 2 + 1, fragment.sequence_number);
        }
    }

    #[test]
    fn test_video_sdtp_flags() {
        let mut movie = test_movie();
        fragmentize(&mut movie).unwrap();

        for fragment in &movie.video_track().unwrap().fragments {
            assert_eq!(SDTP_SAMPLE_INDEPENDENT, fragment.sdtp_flags[0]);
            for flag in &fragment.sdtp_flags[1..] {
                assert_eq!(SDTP_SAMPLE_DEPENDENT, *flag);
            }
        }
    }

    #[test]
    fn test_durations_sum_to_movie_duration() {
        let mut movie = test_movie();
        fragmentize(&mut movie).unwrap();

        let sum: u64 = movie
            .video_track()
            .unwrap()
            .fragments
            .iter()
            .map(|f| f.duration)
            .sum();
        let duration = movie.duration_ticks();
        assert!(sum.abs_diff(duration) <= 1, "{sum} vs {duration}");
    }

    #[test]
    fn test_audio_never_leads_video_by_a_gop() {
        let mut movie = test_movie();
        fragmentize(&mut movie).unwrap();

        let video = movie.video_track().unwrap();
        let audio = movie.audio_track().unwrap();

        let mut prev = 0;
        for (a, v) in audio.fragments.iter().zip(&video.fragments) {
            let a_end = a.timestamp + a.duration;
            let v_end = v.timestamp + v.duration;
            assert!(a_end <= v_end + v.duration);
            assert!(a.timestamp >= prev || a.timestamp == 0);
            prev = a.timestamp;
        }
    }

    #[test]
    fn test_chunks_merge() {
        let mut movie = test_movie();
        fragmentize(&mut movie).unwrap();

        // All samples are contiguous within one chunk, so each
        // fragment collapses to a single read.
        let video = movie.video_track().unwrap();
        assert_eq!(1, video.fragments[0].chunks.len());
        assert_eq!(
            MdatChunk {
                offset: 10_000,
                size: 6000,
            },
            video.fragments[0].chunks[0]
        );
        assert_eq!(
            MdatChunk {
                offset: 16_000,
                size: 6000,
            },
            video.fragments[1].chunks[0]
        );
        assert_eq!(8 + 6000, video.fragments[0].mdat_size);
    }

    #[test]
    fn test_no_sync_table() {
        let mut movie = test_movie();
        movie.tracks[1].stss = None;
        assert_eq!(FragmentizeError::NoSyncTable, fragmentize(&mut movie).unwrap_err());
    }

    #[test]
    fn test_already_fragmented() {
        let mut movie = test_movie();
        movie.tracks[1].num_samples = 0;
        assert_eq!(
            FragmentizeError::AlreadyFragmented,
            fragmentize(&mut movie).unwrap_err()
        );
    }

    #[test]
    fn test_no_audio() {
        let mut movie = test_movie();
        movie.tracks.remove(0);
        assert_eq!(FragmentizeError::NoAudioTrack, fragmentize(&mut movie).unwrap_err());
    }
}
