// SPDX-License-Identifier: GPL-2.0-or-later

mod fragment;
mod parse;
mod reader;
mod serialize;

pub use fragment::{fragmentize, FragmentizeError};
pub use parse::{parse_file, parse_movie, FtypBrands, ParseError};
pub use reader::{BytesReader, FourCc, ReadError};
pub use serialize::{
    serialize_fragment, serialize_track_ccff, serialize_track_dash, DashHeader, SerializeError,
};

use common::time::to_ticks;
use mp4::{SampleEncryptionSample, SampleEncryptionSubsample, StscEntry, SttsEntry};

/// One parsed source file: the movie header tree plus
/// whatever ftyp brands the file declared.
#[derive(Debug)]
pub struct SourceFile {
    pub brands: FtypBrands,
    pub movie: Movie,
}

/// Movie header tree. Owns its tracks.
#[derive(Default, Debug)]
pub struct Movie {
    pub timescale: u32,
    pub duration: u64,
    pub next_track_id: u32,
    pub tracks: Vec<Track>,
    pub pssh: Option<PsshData>,
}

/// Per-movie protection metadata, either from a `pssh` box or
/// the PIFF ProtectionSystemSpecificHeader uuid box.
#[derive(Debug)]
pub struct PsshData {
    pub system_id: [u8; 16],
    pub data: Vec<u8>,
}

impl Movie {
    /// Total duration in 100 ns ticks. Falls back to summed
    /// fragment durations when the movie header carries none.
    #[must_use]
    pub fn duration_ticks(&self) -> u64 {
        if self.duration != 0 && self.timescale != 0 {
            return to_ticks(self.duration, self.timescale);
        }
        self.tracks
            .iter()
            .map(|t| t.fragments.iter().map(|f| f.duration).sum())
            .max()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn video_track(&self) -> Option<&Track> {
        self.tracks.iter().find(|t| t.handler == Handler::Video)
    }

    #[must_use]
    pub fn audio_track(&self) -> Option<&Track> {
        self.tracks.iter().find(|t| t.handler == Handler::Audio)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handler {
    Video,
    Audio,
    Other([u8; 4]),
}

impl Handler {
    #[must_use]
    pub fn is_video(self) -> bool {
        self == Handler::Video
    }
}

impl Default for Handler {
    fn default() -> Self {
        Handler::Other([0; 4])
    }
}

/// One track of a movie. Sample tables come from the source
/// file; fragments and the serialized streaming headers are
/// derived state filled in by the fragmenter and serializer.
#[derive(Debug, Default)]
pub struct Track {
    pub track_id: u32,
    pub handler: Handler,
    pub timescale: u32,
    pub duration: u64,
    pub language: [u8; 3],

    // Sample description.
    pub width: u16,
    pub height: u16,
    pub sample_rate: u32, // fixed-point 16.16
    pub channel_count: u16,
    pub codec_data: Vec<u8>,
    pub is_encrypted: bool,

    // Sample tables.
    pub stts: Vec<SttsEntry>,
    pub ctts: Vec<CttsEntry>,
    pub stss: Option<Vec<u32>>,
    pub stsc: Vec<StscEntry>,
    pub chunk_offsets: Vec<u64>,
    pub sample_size: u32,
    pub sample_sizes: Vec<u32>,
    pub num_samples: u32,

    pub fragments: Vec<Fragment>,

    // Prepared streaming state.
    pub ccff_header_data: Vec<u8>,
    pub dash_header_data: Vec<u8>,
    pub dash_header_size: usize,
    pub dash_header_and_sidx_size: usize,
    pub dash_size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CttsEntry {
    pub sample_count: u32,
    pub sample_offset: u32,
}

/// One sample as described by the sample tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sample {
    pub offset: u64,
    pub size: u32,
    pub duration: u32,
    pub composition_time_offset: u32,
    pub is_sync: bool,
}

impl Track {
    #[must_use]
    pub fn sample_count(&self) -> u64 {
        u64::from(self.num_samples)
    }

    #[must_use]
    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate >> 16
    }

    /// Decode one sample from the stts/ctts/stsz/stsc/stco tables.
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn sample(&self, sample_index: u64) -> Option<Sample> {
        if sample_index >= self.sample_count() {
            return None;
        }
        let index =
            u32::try_from(sample_index).expect("sample index bounded by 32-bit sample count");

        let mut duration = 0;
        let mut offset = 0;
        for entry in &self.stts {
            if index < offset + entry.sample_count {
                duration = entry.sample_delta;
                break;
            }
            offset += entry.sample_count;
        }

        let mut composition_time_offset = 0;
        let mut offset = 0;
        for entry in &self.ctts {
            if index < offset + entry.sample_count {
                composition_time_offset = entry.sample_offset;
                break;
            }
            offset += entry.sample_count;
        }

        let size = self.sample_size_at(index);

        // Locate the containing chunk by walking the stsc runs.
        let mut chunk_index = 0;
        let mut index_in_chunk = 0;
        let mut samples_before = 0;
        for (i, entry) in self.stsc.iter().enumerate() {
            let run_chunks = match self.stsc.get(i + 1) {
                Some(next) => u64::from(next.first_chunk - entry.first_chunk),
                // The final run covers the rest of the samples.
                None => u64::MAX,
            };
            let run_samples = run_chunks.saturating_mul(u64::from(entry.samples_per_chunk));
            let index_in_run = u64::from(index) - samples_before;
            if index_in_run < run_samples {
                chunk_index = u64::from(entry.first_chunk - 1)
                    + index_in_run / u64::from(entry.samples_per_chunk);
                index_in_chunk = index_in_run % u64::from(entry.samples_per_chunk);
                break;
            }
            samples_before += run_samples;
        }

        let chunk_offset = *self
            .chunk_offsets
            .get(usize::try_from(chunk_index).expect("chunk index fits usize"))?;

        // Samples before this one in the same chunk shift the offset.
        let first_in_chunk = index - u32::try_from(index_in_chunk).expect("bounded by u32 index");
        let mut offset_in_chunk = 0;
        for i in first_in_chunk..index {
            offset_in_chunk += u64::from(self.sample_size_at(i));
        }

        Some(Sample {
            offset: chunk_offset + offset_in_chunk,
            size,
            duration,
            composition_time_offset,
            is_sync: self.is_sync_sample(index),
        })
    }

    fn sample_size_at(&self, index: u32) -> u32 {
        if self.sample_size != 0 {
            self.sample_size
        } else {
            let i = usize::try_from(index).expect("sample index fits usize");
            self.sample_sizes.get(i).copied().unwrap_or(0)
        }
    }

    fn is_sync_sample(&self, index: u32) -> bool {
        match &self.stss {
            // Sample numbers are one-based.
            Some(numbers) => numbers.binary_search(&(index + 1)).is_ok(),
            // Without a sync table every sample is a sync sample.
            None => true,
        }
    }

    /// Index of the sample containing `timestamp` in media
    /// timescale units. Past the end of the track this returns
    /// the sample count.
    #[must_use]
    pub fn index_from_timestamp(&self, timestamp: u64) -> u64 {
        let mut ts = 0;
        let mut offset = 0;
        for entry in &self.stts {
            let run = u64::from(entry.sample_count) * u64::from(entry.sample_delta);
            if timestamp - ts >= run {
                ts += run;
                offset += u64::from(entry.sample_count);
            } else {
                return offset + (timestamp - ts) / u64::from(entry.sample_delta);
            }
        }
        self.sample_count()
    }

    #[must_use]
    pub fn fragment(&self, index: usize) -> Option<&Fragment> {
        self.fragments.get(index)
    }

    /// Fragment starting exactly at `timestamp` 100 ns ticks.
    #[must_use]
    pub fn fragment_by_timestamp(&self, timestamp: u64) -> Option<&Fragment> {
        self.fragments.iter().find(|f| f.timestamp == timestamp)
    }
}

/// Scatter-gather source range within the source file's mdat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MdatChunk {
    pub offset: u64,
    pub size: u64,
}

/// Sample flag bits of ISO/IEC 14496-12 8.8.3.1.
pub const SAMPLE_FLAG_IS_NON_SYNC: u32 = 0x0001_0000;
/// Degradation priority the original encoders stamp on
/// every sample.
pub const DEFAULT_DEGRADATION_PRIORITY: u32 = 0x0000_00c0;

/// sdtp entry for an I frame: sample_depends_on=2 (no), is_depended_on=1.
pub const SDTP_SAMPLE_INDEPENDENT: u8 = 0x14;
/// sdtp entry for a P/B frame: sample_depends_on=1 (yes), is_depended_on=3.
pub const SDTP_SAMPLE_DEPENDENT: u8 = 0x1c;

/// One fragment covering a single GOP of a single track.
#[derive(Debug, Default)]
pub struct Fragment {
    pub track_id: u32,
    pub sequence_number: u32,

    /// Start in 100 ns ticks.
    pub timestamp: u64,
    /// Length in 100 ns ticks.
    pub duration: u64,

    pub tfhd_flags: u32,
    pub default_sample_duration: u32,
    pub default_sample_flags: u32,

    pub trun_flags: u32,
    pub first_sample_flags: u32,
    pub samples: Vec<FragmentSample>,

    /// Video only; first sample I, rest P/B.
    pub sdtp_flags: Vec<u8>,

    pub sample_encryption: Option<SampleEncryptionTable>,
    pub saiz: Option<Saiz>,
    pub saio: Option<Saio>,

    /// Source ranges making up the mdat payload.
    pub chunks: Vec<MdatChunk>,

    /// Byte offset of the serialized moof within the virtual
    /// DASH stream, relative to the end of the header+sidx.
    pub offset: u64,
    /// Serialized moof box followed by the 8-byte mdat header.
    pub moof_data: Vec<u8>,
    /// Size of the moof box alone.
    pub moof_size: usize,
    /// mdat box size including its 8-byte header.
    pub mdat_size: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FragmentSample {
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
    pub composition_time_offset: u32,
}

/// Per-sample IVs and clear/cipher spans for one fragment.
#[derive(Debug)]
pub struct SampleEncryptionTable {
    pub with_subsamples: bool,
    pub samples: Vec<SampleEncryptionSample>,
}

/// Parsed saiz box, kept for files that already carry
/// encryption side data.
#[derive(Debug)]
pub struct Saiz {
    pub default_sample_info_size: u8,
    pub sample_info_sizes: Vec<u8>,
}

/// Parsed saio box.
#[derive(Debug)]
pub struct Saio {
    pub offsets: Vec<u64>,
}

impl Fragment {
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Attach per-sample IVs. H.264 samples keep their 4-byte
    /// NAL length prefix plus NAL type byte in the clear.
    pub fn set_sample_encryption(&mut self, init_vectors: &[u64], is_video: bool) {
        let samples = init_vectors
            .iter()
            .zip(&self.samples)
            .map(|(iv, sample)| SampleEncryptionSample {
                iv: *iv,
                subsamples: if is_video {
                    vec![SampleEncryptionSubsample {
                        bytes_of_clear_data: 5,
                        bytes_of_encrypted_data: sample.size.saturating_sub(5),
                    }]
                } else {
                    Vec::new()
                },
            })
            .collect();
        self.sample_encryption = Some(SampleEncryptionTable {
            with_subsamples: is_video,
            samples,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn test_track() -> Track {
        // Two chunks: [s0 s1 s2] at 1000, [s3 s4] at 5000.
        Track {
            track_id: 1,
            handler: Handler::Video,
            timescale: 90000,
            num_samples: 5,
            sample_size: 0,
            sample_sizes: vec![10, 20, 30, 40, 50],
            stts: vec![
                SttsEntry {
                    sample_count: 3,
                    sample_delta: 3000,
                },
                SttsEntry {
                    sample_count: 2,
                    sample_delta: 6000,
                },
            ],
            ctts: vec![CttsEntry {
                sample_count: 5,
                sample_offset: 100,
            }],
            stss: Some(vec![1, 4]),
            stsc: vec![
                StscEntry {
                    first_chunk: 1,
                    samples_per_chunk: 3,
                    sample_description_index: 1,
                },
                StscEntry {
                    first_chunk: 2,
                    samples_per_chunk: 2,
                    sample_description_index: 1,
                },
            ],
            chunk_offsets: vec![1000, 5000],
            ..Track::default()
        }
    }

    #[test_case(0, 1000, 10, 3000, true; "first in chunk")]
    #[test_case(1, 1010, 20, 3000, false; "second in chunk")]
    #[test_case(2, 1030, 30, 3000, false; "third in chunk")]
    #[test_case(3, 5000, 40, 6000, true; "second chunk")]
    #[test_case(4, 5040, 50, 6000, false; "second chunk offset")]
    fn test_sample(index: u64, offset: u64, size: u32, duration: u32, is_sync: bool) {
        let track = test_track();
        let got = track.sample(index).unwrap();
        assert_eq!(
            Sample {
                offset,
                size,
                duration,
                composition_time_offset: 100,
                is_sync,
            },
            got
        );
    }

    #[test]
    fn test_sample_out_of_range() {
        assert!(test_track().sample(5).is_none());
    }

    #[test_case(0, 0; "zero")]
    #[test_case(2999, 0; "within first")]
    #[test_case(3000, 1; "second")]
    #[test_case(8999, 2; "last of run")]
    #[test_case(9000, 3; "second run")]
    #[test_case(15_000, 4; "last")]
    #[test_case(21_000, 5; "past the end")]
    #[test_case(1_000_000, 5; "far past the end")]
    fn test_index_from_timestamp(ts: u64, want: u64) {
        assert_eq!(want, test_track().index_from_timestamp(ts));
    }

    // Sample offsets must strictly increase with timestamp.
    #[test]
    fn test_sample_offsets_monotone() {
        let track = test_track();
        let mut prev = None;
        for ts in [0, 3000, 6000, 9000, 15_000] {
            let index = track.index_from_timestamp(ts);
            let sample = track.sample(index).unwrap();
            if let Some(prev) = prev {
                assert!(sample.offset > prev, "offset did not increase");
            }
            prev = Some(sample.offset);
        }
    }

    #[test]
    fn test_fragment_by_timestamp() {
        let track = Track {
            fragments: vec![
                Fragment {
                    timestamp: 0,
                    duration: 20_000_000,
                    ..Fragment::default()
                },
                Fragment {
                    timestamp: 20_000_000,
                    duration: 20_000_000,
                    ..Fragment::default()
                },
            ],
            ..Track::default()
        };
        assert!(track.fragment_by_timestamp(20_000_000).is_some());
        assert!(track.fragment_by_timestamp(1).is_none());
    }

    #[test]
    fn test_set_sample_encryption() {
        let mut fragment = Fragment {
            samples: vec![
                FragmentSample {
                    size: 100,
                    ..FragmentSample::default()
                },
                FragmentSample {
                    size: 200,
                    ..FragmentSample::default()
                },
            ],
            ..Fragment::default()
        };
        fragment.set_sample_encryption(&[7, 8], true);

        let se = fragment.sample_encryption.unwrap();
        assert!(se.with_subsamples);
        assert_eq!(2, se.samples.len());
        assert_eq!(7, se.samples[0].iv);
        assert_eq!(5, se.samples[0].subsamples[0].bytes_of_clear_data);
        assert_eq!(95, se.samples[0].subsamples[0].bytes_of_encrypted_data);
        assert_eq!(195, se.samples[1].subsamples[0].bytes_of_encrypted_data);
    }
}
