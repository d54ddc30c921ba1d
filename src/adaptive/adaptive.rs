// SPDX-License-Identifier: GPL-2.0-or-later

mod manifest;

pub use manifest::{dash_live_manifest, dash_ondemand_manifest, smooth_manifest, ManifestQuery};

use common::{hex_encode, time::TICKS_PER_SECOND, ArcLogger};
use isom::{fragmentize, parse_file, serialize_fragment, serialize_track_ccff, serialize_track_dash, Handler, Movie, PsshData, Track};
use playready::{DrmType, KeySeed, PLAYREADY_SYSTEM_ID};
use serde::Deserialize;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Salt mixed into the content id when deriving the key id.
const KEY_ID_SALT: &str = "KThMK9Tibb+X9qRuTvwOchPRwH+4hV05yZXnx7C";

/// Name of the per-content descriptor listing the source files.
pub const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamType {
    Ism,
    DashLive,
    DashOnDemand,
}

impl StreamType {
    /// Tag used in URLs and cache keys.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            StreamType::Ism => "ism",
            StreamType::DashLive => "isoff-live",
            StreamType::DashOnDemand => "isoff-ondemand",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown stream type: '{0}'")]
pub struct ParseStreamTypeError(String);

impl std::str::FromStr for StreamType {
    type Err = ParseStreamTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ism" => Ok(StreamType::Ism),
            "isoff-live" => Ok(StreamType::DashLive),
            "isoff-ondemand" => Ok(StreamType::DashOnDemand),
            _ => Err(ParseStreamTypeError(s.to_owned())),
        }
    }
}

/// One bitrate of one presentation, describing a single track
/// of a single source file.
#[derive(Debug)]
pub struct Level {
    pub is_video: bool,
    pub bitrate: u32,
    pub width: u16,
    pub height: u16,
    pub profile: u8,
    pub level: u8,
    pub codec: String,
    pub codec_private_data: String,
    pub audio_rate: u32,
    pub filename: PathBuf,
    pub n_fragments: usize,

    /// Counter seed the per-sample IVs derive from.
    pub iv_seed: u64,

    pub movie_index: usize,
    pub track_index: usize,
}

/// PlayReady parameters needed when loading protected content.
#[derive(Clone)]
pub struct PlayReadyOptions {
    pub license_url: String,
    pub key_seed: KeySeed,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("read {0}: {1}")]
    ReadManifest(PathBuf, std::io::Error),

    #[error("parse {0}: {1}")]
    ParseManifest(PathBuf, serde_json::Error),

    #[error("unsupported manifest version {0}")]
    ManifestVersion(u32),

    #[error("manifest lists no versions")]
    NoVersions,

    #[error("manifest lists no files")]
    NoFiles,

    #[error("parse '{0}': {1}")]
    ParseFile(PathBuf, isom::ParseError),

    #[error("fragment '{0}': {1}")]
    Fragmentize(PathBuf, isom::FragmentizeError),

    #[error("serialize: {0}")]
    Serialize(#[from] isom::SerializeError),

    #[error("'{0}' has neither video nor audio track")]
    NoUsableTracks(PathBuf),

    #[error("presentation needs at least one video and one audio level")]
    MissingLevels,
}

#[derive(Debug, Deserialize)]
struct ManifestDescriptor {
    manifest_version: u32,
    versions: Vec<ManifestVersion>,
}

#[derive(Debug, Deserialize)]
struct ManifestVersion {
    version: String,
    files: Vec<String>,
}

/// All bitrates of one piece of content, ready to serve one
/// stream type under one DRM mode. Immutable once loaded.
#[derive(Debug)]
pub struct Presentation {
    pub content_id: String,
    pub stream_type: StreamType,
    pub drm_type: DrmType,

    /// Longest source duration in 100 ns ticks.
    pub duration: u64,
    pub max_width: u16,
    pub max_height: u16,

    pub video_levels: Vec<Level>,
    pub audio_levels: Vec<Level>,

    pub kid: [u8; 16],
    pub content_key: [u8; 16],
    /// WRMHEADER envelope, present when protected.
    pub protection_header: Option<Vec<u8>>,

    /// Parsed source movies the levels index into.
    pub movies: Vec<Movie>,
}

impl Presentation {
    /// Load a presentation from its content directory.
    pub fn load(
        dir: &Path,
        content_id: &str,
        version: &str,
        drm_type: DrmType,
        stream_type: StreamType,
        playready: &PlayReadyOptions,
        logger: &ArcLogger,
    ) -> Result<Self, LoadError> {
        use LoadError::*;

        let manifest_path = dir.join(MANIFEST_FILENAME);
        let manifest_json = std::fs::read_to_string(&manifest_path)
            .map_err(|e| ReadManifest(manifest_path.clone(), e))?;
        let descriptor: ManifestDescriptor = serde_json::from_str(&manifest_json)
            .map_err(|e| ParseManifest(manifest_path.clone(), e))?;

        if descriptor.manifest_version != 0 {
            return Err(ManifestVersion(descriptor.manifest_version));
        }
        if descriptor.versions.is_empty() {
            return Err(NoVersions);
        }
        let files = descriptor
            .versions
            .iter()
            .find(|v| v.version == version)
            .unwrap_or(&descriptor.versions[0])
            .files
            .clone();
        if files.is_empty() {
            return Err(NoFiles);
        }

        let kid = derive_key_id(content_id);
        let content_key = playready.key_seed.generate_content_key(&kid);
        let protection_header = drm_type
            .is_encrypted()
            .then(|| playready::protection_header(&kid, &playready.license_url));

        let mut presentation = Self {
            content_id: content_id.to_owned(),
            stream_type,
            drm_type,
            duration: 0,
            max_width: 0,
            max_height: 0,
            video_levels: Vec::new(),
            audio_levels: Vec::new(),
            kid,
            content_key,
            protection_header,
            movies: Vec::new(),
        };

        for file in files {
            let path = dir.join(file);
            presentation.load_source_file(&path, logger)?;
        }

        // The manifest emitters assume both media types.
        if presentation.video_levels.is_empty() || presentation.audio_levels.is_empty() {
            return Err(MissingLevels);
        }

        Ok(presentation)
    }

    fn load_source_file(&mut self, path: &Path, logger: &ArcLogger) -> Result<(), LoadError> {
        use LoadError::*;

        let parsed = parse_file(path, logger).map_err(|e| ParseFile(path.to_owned(), e))?;
        let mut movie = parsed.movie;

        let already_fragmented = movie.tracks.iter().any(|t| !t.fragments.is_empty());
        if !already_fragmented {
            fragmentize(&mut movie).map_err(|e| Fragmentize(path.to_owned(), e))?;
        }

        self.duration = self.duration.max(movie.duration_ticks());

        if self.drm_type.is_encrypted() && self.stream_type == StreamType::DashOnDemand {
            if let Some(header) = &self.protection_header {
                movie.pssh = Some(PsshData {
                    system_id: PLAYREADY_SYSTEM_ID,
                    data: header.clone(),
                });
            }
        }

        let movie_index = self.movies.len();
        let mut found = false;
        for track_index in 0..movie.tracks.len() {
            let handler = movie.tracks[track_index].handler;
            let is_video = match handler {
                Handler::Video => true,
                Handler::Audio => false,
                Handler::Other(_) => continue,
            };
            found = true;

            let level = self.make_level(&mut movie, path, movie_index, track_index, is_video)?;
            if is_video {
                self.max_width = self.max_width.max(level.width);
                self.max_height = self.max_height.max(level.height);
                self.video_levels.push(level);
            } else {
                self.audio_levels.push(level);
            }
        }
        if !found {
            return Err(NoUsableTracks(path.to_owned()));
        }

        self.movies.push(movie);
        Ok(())
    }

    fn make_level(
        &mut self,
        movie: &mut Movie,
        path: &Path,
        movie_index: usize,
        track_index: usize,
        is_video: bool,
    ) -> Result<Level, LoadError> {
        let iv_seed = {
            let track = &movie.tracks[track_index];
            iv_seed(&path.to_string_lossy(), track.track_id)
        };

        if self.drm_type.is_encrypted() {
            let track = &mut movie.tracks[track_index];
            for (fragment_index, fragment) in track.fragments.iter_mut().enumerate() {
                let base = iv_seed
                    .wrapping_add(u64::try_from(fragment_index).expect("bounded") << 32);
                let ivs: Vec<u64> = (0..fragment.sample_count())
                    .map(|i| base.wrapping_add(u64::try_from(i).expect("bounded")))
                    .collect();
                fragment.set_sample_encryption(&ivs, is_video);
            }
        }

        // Serialize every fragment and lay them out back to
        // back for the DASH byte mapping.
        {
            let track = &mut movie.tracks[track_index];
            track.is_encrypted |= self.drm_type.is_encrypted();
            let mut offset: u64 = 0;
            for fragment in &mut track.fragments {
                fragment.offset = offset;
                serialize_fragment(fragment, is_video)?;
                offset += u64::try_from(fragment.moof_size).expect("moof fits u64");
                offset += fragment.mdat_size;
            }
            track.dash_size = offset;
        }

        match self.stream_type {
            StreamType::Ism | StreamType::DashLive => {
                let header = serialize_track_ccff(movie, &movie.tracks[track_index])?;
                movie.tracks[track_index].ccff_header_data = header;
            }
            StreamType::DashOnDemand => {
                let header = serialize_track_dash(movie, &movie.tracks[track_index])?;
                let track = &mut movie.tracks[track_index];
                track.dash_header_size = header.header_size;
                track.dash_header_and_sidx_size = header.header_and_sidx_size;
                track.dash_header_data = header.data;
                track.dash_size += u64::try_from(header.header_and_sidx_size)
                    .expect("header fits u64");
            }
        }

        let track = &movie.tracks[track_index];
        let codec_private_data = hex_encode(&track.codec_data);
        let (codec, profile, level) = if is_video {
            let profile = track.codec_data.get(1).copied().unwrap_or(0);
            let compat = track.codec_data.get(2).copied().unwrap_or(0);
            let level = track.codec_data.get(3).copied().unwrap_or(0);
            (
                format!("avc1.{profile:02x}{compat:02x}{level:02x}"),
                profile,
                level,
            )
        } else {
            // AAC LC.
            ("mp4a.40.2".to_owned(), 2, 0)
        };

        Ok(Level {
            is_video,
            bitrate: estimate_bitrate(track),
            width: track.width,
            height: track.height,
            profile,
            level,
            codec,
            codec_private_data,
            audio_rate: track.sample_rate_hz(),
            filename: path.to_owned(),
            n_fragments: track.fragments.len(),
            iv_seed,
            movie_index,
            track_index,
        })
    }

    /// Level with an exact bitrate match.
    #[must_use]
    pub fn level(&self, is_video: bool, bitrate: u64) -> Option<&Level> {
        let levels = if is_video {
            &self.video_levels
        } else {
            &self.audio_levels
        };
        levels.iter().find(|l| u64::from(l.bitrate) == bitrate)
    }

    /// The track a level describes.
    #[must_use]
    pub fn track(&self, level: &Level) -> &Track {
        &self.movies[level.movie_index].tracks[level.track_index]
    }
}

/// Key id for a content id: leading 16 bytes of the salted
/// SHA-1.
#[must_use]
pub fn derive_key_id(content_id: &str) -> [u8; 16] {
    let digest = Sha1::new()
        .chain_update(content_id.as_bytes())
        .chain_update(KEY_ID_SALT.as_bytes())
        .finalize();
    let mut kid = [0; 16];
    kid.copy_from_slice(&digest[..16]);
    kid
}

/// Per-level IV seed: leading 64 bits of SHA-1 over
/// "filename:track_id".
#[must_use]
pub fn iv_seed(filename: &str, track_id: u32) -> u64 {
    let digest = Sha1::new()
        .chain_update(filename.as_bytes())
        .chain_update(b":")
        .chain_update(track_id.to_string().as_bytes())
        .finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("sha1 digest is 20 bytes"))
}

/// Bits per second from total fragment bytes over total
/// fragment duration.
#[must_use]
pub fn estimate_bitrate(track: &Track) -> u32 {
    let mut size: u64 = 0;
    let mut duration: u64 = 0;
    for fragment in &track.fragments {
        size += u64::try_from(fragment.moof_size).expect("moof fits u64");
        size += fragment.mdat_size;
        duration += fragment.duration;
    }
    if duration == 0 {
        return 0;
    }
    let bits = u128::from(size) * 8 * u128::from(TICKS_PER_SECOND) / u128::from(duration);
    u32::try_from(bits).unwrap_or(u32::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use common::DummyLogger;
    use mp4::{Boxes, FullBox};
    use std::io::Write;

    pub(crate) fn playready_options() -> PlayReadyOptions {
        PlayReadyOptions {
            license_url: playready::DEMO_LICENSE_URL.to_owned(),
            key_seed: KeySeed::from_hex(playready::DEMO_KEY_SEED).unwrap(),
        }
    }

    #[test]
    fn test_derive_key_id() {
        let want = [
            0xbc, 0x03, 0xbd, 0xa4, 0x54, 0xe9, 0xb6, 0xb6, 0x74, 0x3b, 0xc4, 0xc2, 0x26, 0xad,
            0x22, 0x68,
        ];
        assert_eq!(want, derive_key_id("test"));
    }

    #[test]
    fn test_iv_seed() {
        assert_eq!(0x5db7_3fab_7e4b_e7b5, iv_seed("video.ismv", 2));
    }

    #[test]
    fn test_stream_type_tags() {
        use std::str::FromStr;
        assert_eq!(StreamType::Ism, StreamType::from_str("ism").unwrap());
        assert_eq!(
            StreamType::DashLive,
            StreamType::from_str("isoff-live").unwrap()
        );
        assert_eq!(
            StreamType::DashOnDemand,
            StreamType::from_str("isoff-ondemand").unwrap()
        );
        assert!(StreamType::from_str("hls").is_err());
        assert_eq!("isoff-ondemand", StreamType::DashOnDemand.name());
    }

    // Builds a minimal but complete non-fragmented source file:
    // ftyp, mdat with both tracks' samples, then moov.
    pub(crate) fn write_source_file(dir: &Path, name: &str) {
        let mut buf = Vec::new();

        // ftyp, 24 bytes.
        Boxes::new(mp4::Ftyp {
            major_brand: *b"mp42",
            minor_version: 1,
            compatible_brands: vec![
                mp4::CompatibleBrandElem(*b"mp41"),
                mp4::CompatibleBrandElem(*b"isom"),
            ],
        })
        .marshal(&mut buf)
        .unwrap();
        assert_eq!(24, buf.len());

        // mdat: 4 video samples of 10 bytes at offset 32, then
        // 4 audio samples of 5 bytes at offset 72.
        let mut payload = Vec::new();
        for i in 0..40u8 {
            payload.push(i);
        }
        for i in 0..20u8 {
            payload.push(0x80 + i);
        }
        Boxes::new(mp4::Mdat(payload)).marshal(&mut buf).unwrap();

        let video_stbl = Boxes::new(mp4::Stbl).with_children(vec![
            Boxes::new(mp4::Stsd {
                full_box: FullBox::default(),
                entry_count: 1,
            })
            .with_child(
                Boxes::new(mp4::Avc1 {
                    sample_entry: mp4::SampleEntry {
                        reserved: [0; 6],
                        data_reference_index: 1,
                    },
                    width: 640,
                    height: 360,
                    frame_count: 1,
                    depth: 24,
                    pre_defined3: -1,
                    ..mp4::Avc1::default()
                })
                .with_child(Boxes::new(mp4::RawBox {
                    typ: *b"avcC",
                    data: vec![1, 0x64, 0x00, 0x1f, 0xff, 0xe1],
                })),
            ),
            Boxes::new(mp4::Stts {
                full_box: FullBox::default(),
                entries: vec![mp4::SttsEntry {
                    sample_count: 4,
                    sample_delta: 3000,
                }],
            }),
            Boxes::new(mp4::Stss {
                full_box: FullBox::default(),
                sample_numbers: vec![1, 3],
            }),
            Boxes::new(mp4::Stsz {
                full_box: FullBox::default(),
                sample_size: 10,
                sample_count: 4,
                entry_sizes: Vec::new(),
            }),
            Boxes::new(mp4::Stsc {
                full_box: FullBox::default(),
                entries: vec![mp4::StscEntry {
                    first_chunk: 1,
                    samples_per_chunk: 4,
                    sample_description_index: 1,
                }],
            }),
            Boxes::new(mp4::Stco {
                full_box: FullBox::default(),
                chunk_offsets: vec![32],
            }),
        ]);

        let audio_stbl = Boxes::new(mp4::Stbl).with_children(vec![
            Boxes::new(mp4::Stsd {
                full_box: FullBox::default(),
                entry_count: 1,
            })
            .with_child(
                Boxes::new(mp4::Mp4a {
                    sample_entry: mp4::SampleEntry {
                        reserved: [0; 6],
                        data_reference_index: 1,
                    },
                    channel_count: 2,
                    sample_size: 16,
                    sample_rate: 48000 << 16,
                    ..mp4::Mp4a::default()
                })
                .with_child(Boxes::new(mp4::Esds {
                    full_box: FullBox::default(),
                    es_id: 1,
                    object_type_indication: 0x40,
                    stream_type: 0x15,
                    buffer_size_db: 0,
                    max_bitrate: 0,
                    avg_bitrate: 0,
                    decoder_config: vec![0x11, 0x90],
                })),
            ),
            Boxes::new(mp4::Stts {
                full_box: FullBox::default(),
                entries: vec![mp4::SttsEntry {
                    sample_count: 4,
                    sample_delta: 1024,
                }],
            }),
            Boxes::new(mp4::Stsz {
                full_box: FullBox::default(),
                sample_size: 5,
                sample_count: 4,
                entry_sizes: Vec::new(),
            }),
            Boxes::new(mp4::Stsc {
                full_box: FullBox::default(),
                entries: vec![mp4::StscEntry {
                    first_chunk: 1,
                    samples_per_chunk: 4,
                    sample_description_index: 1,
                }],
            }),
            Boxes::new(mp4::Stco {
                full_box: FullBox::default(),
                chunk_offsets: vec![72],
            }),
        ]);

        let make_trak = |track_id: u32, timescale: u32, duration: u32, video: bool, stbl| {
            Boxes::new(mp4::Trak).with_children(vec![
                Boxes::new(mp4::Tkhd {
                    flags: [0, 0, 3],
                    track_id,
                    ..mp4::Tkhd::default()
                }),
                Boxes::new(mp4::Mdia).with_children(vec![
                    Boxes::new(mp4::Mdhd {
                        timescale,
                        language: *b"und",
                        version: mp4::MdhdVersion::V0(mp4::MdhdV0 {
                            duration,
                            ..mp4::MdhdV0::default()
                        }),
                        ..mp4::Mdhd::default()
                    }),
                    Boxes::new(mp4::Hdlr {
                        handler_type: if video { *b"vide" } else { *b"soun" },
                        name: "Handler".to_owned(),
                        ..mp4::Hdlr::default()
                    }),
                    Boxes::new(mp4::Minf).with_children(vec![
                        if video {
                            Boxes::new(mp4::Vmhd::default())
                        } else {
                            Boxes::new(mp4::Smhd::default())
                        },
                        Boxes::new(mp4::Dinf).with_child(
                            Boxes::new(mp4::Dref {
                                full_box: FullBox::default(),
                                entry_count: 1,
                            })
                            .with_child(Boxes::new(mp4::Url {
                                full_box: FullBox {
                                    version: 0,
                                    flags: [0, 0, 1],
                                },
                                location: String::new(),
                            })),
                        ),
                        stbl,
                    ]),
                ]),
            ])
        };

        Boxes::new(mp4::Moov)
            .with_children(vec![
                Boxes::new(mp4::Mvhd {
                    timescale: 1000,
                    next_track_id: 3,
                    ..mp4::Mvhd::default()
                }),
                make_trak(1, 48000, 4096, false, audio_stbl),
                make_trak(2, 90000, 12000, true, video_stbl),
            ])
            .marshal(&mut buf)
            .unwrap();

        let mut file = std::fs::File::create(dir.join(name)).unwrap();
        file.write_all(&buf).unwrap();
    }

    pub(crate) fn write_descriptor(dir: &Path, files: &[&str]) {
        let list: Vec<String> = files.iter().map(|f| format!("\"{f}\"")).collect();
        let json = format!(
            "{{\"manifest_version\": 0, \"versions\": [{{\"version\": \"0\", \"files\": [{}]}}]}}",
            list.join(", ")
        );
        std::fs::write(dir.join(MANIFEST_FILENAME), json).unwrap();
    }

    fn load(drm: DrmType, stream: StreamType) -> Presentation {
        let dir = tempfile::TempDir::new().unwrap();
        write_source_file(dir.path(), "a.ismv");
        write_descriptor(dir.path(), &["a.ismv"]);
        let logger: ArcLogger = DummyLogger::new();
        Presentation::load(
            dir.path(),
            "test",
            "0",
            drm,
            stream,
            &playready_options(),
            &logger,
        )
        .unwrap()
    }

    #[test]
    fn test_load_clear_ism() {
        let p = load(DrmType::Clear, StreamType::Ism);

        assert_eq!(1, p.video_levels.len());
        assert_eq!(1, p.audio_levels.len());
        assert_eq!(640, p.max_width);
        assert_eq!(360, p.max_height);
        // Fallback duration: the longer of the two track sums.
        assert_eq!(1_333_333, p.duration);

        let video = &p.video_levels[0];
        assert!(video.is_video);
        assert_eq!("avc1.64001f", video.codec);
        assert_eq!("016400001fffe1", video.codec_private_data);
        assert_eq!(0x64, video.profile);
        assert_eq!(0x1f, video.level);
        assert_eq!(2, video.n_fragments);
        assert!(video.bitrate > 0);

        let audio = &p.audio_levels[0];
        assert_eq!("mp4a.40.2", audio.codec);
        assert_eq!(48000, audio.audio_rate);
        assert_eq!("1190", audio.codec_private_data);

        // Smooth init chunks exist; DASH state does not.
        let track = p.track(video);
        assert!(!track.ccff_header_data.is_empty());
        assert!(track.dash_header_data.is_empty());
        assert!(track.fragments[0].sample_encryption.is_none());

        // Exact bitrate lookup.
        assert!(p.level(true, u64::from(video.bitrate)).is_some());
        assert!(p.level(true, u64::from(video.bitrate) + 1).is_none());
        assert!(p.level(false, u64::from(audio.bitrate)).is_some());
    }

    #[test]
    fn test_load_key_derivation() {
        let p = load(DrmType::PlayReady, StreamType::Ism);
        let want_kid = [
            0xbc, 0x03, 0xbd, 0xa4, 0x54, 0xe9, 0xb6, 0xb6, 0x74, 0x3b, 0xc4, 0xc2, 0x26, 0xad,
            0x22, 0x68,
        ];
        let want_key = [
            0xc4, 0x60, 0xac, 0x65, 0xee, 0xe2, 0x5a, 0x72, 0xbd, 0xb7, 0x06, 0xaf, 0x1e, 0x5b,
            0x52, 0xb6,
        ];
        assert_eq!(want_kid, p.kid);
        assert_eq!(want_key, p.content_key);
        assert!(p.protection_header.is_some());
    }

    #[test]
    fn test_load_playready_ivs() {
        let p = load(DrmType::PlayReady, StreamType::Ism);
        let video = &p.video_levels[0];
        let track = p.track(video);

        // IV = seed + (fragment_index << 32) + sample_index.
        let se0 = track.fragments[0].sample_encryption.as_ref().unwrap();
        assert_eq!(video.iv_seed, se0.samples[0].iv);
        assert_eq!(video.iv_seed.wrapping_add(1), se0.samples[1].iv);
        let se1 = track.fragments[1].sample_encryption.as_ref().unwrap();
        assert_eq!(video.iv_seed.wrapping_add(1 << 32), se1.samples[0].iv);

        // H.264 keeps the 5-byte NAL prefix clear.
        assert_eq!(5, se0.samples[0].subsamples[0].bytes_of_clear_data);
        assert_eq!(
            track.fragments[0].samples[0].size - 5,
            se0.samples[0].subsamples[0].bytes_of_encrypted_data
        );

        // Audio has no subsamples.
        let audio_track = p.track(&p.audio_levels[0]);
        let audio_se = audio_track.fragments[0].sample_encryption.as_ref().unwrap();
        assert!(audio_se.samples[0].subsamples.is_empty());
        assert!(!audio_se.with_subsamples);
    }

    #[test]
    fn test_load_dash_ondemand_layout() {
        let p = load(DrmType::PlayReady, StreamType::DashOnDemand);
        let video = &p.video_levels[0];
        let track = p.track(video);

        assert!(track.dash_header_size > 0);
        assert!(track.dash_header_and_sidx_size > track.dash_header_size);
        assert_eq!(track.dash_header_and_sidx_size, track.dash_header_data.len());

        // dash_size covers header, sidx and every fragment.
        let mut want = u64::try_from(track.dash_header_and_sidx_size).unwrap();
        for fragment in &track.fragments {
            want += u64::try_from(fragment.moof_size).unwrap() + fragment.mdat_size;
        }
        assert_eq!(want, track.dash_size);

        // Fragment offsets are back to back.
        assert_eq!(0, track.fragments[0].offset);
        assert_eq!(
            u64::try_from(track.fragments[0].moof_size).unwrap() + track.fragments[0].mdat_size,
            track.fragments[1].offset
        );

        // The protected header grew a pssh box.
        let header = &track.dash_header_data;
        let needle = *b"pssh";
        assert!(header.windows(4).any(|w| w == needle));
    }

    #[test]
    fn test_load_missing_manifest() {
        let dir = tempfile::TempDir::new().unwrap();
        let logger: ArcLogger = DummyLogger::new();
        let err = Presentation::load(
            dir.path(),
            "test",
            "0",
            DrmType::Clear,
            StreamType::Ism,
            &playready_options(),
            &logger,
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::ReadManifest(..)));
    }

    #[test]
    fn test_load_broken_source() {
        let dir = tempfile::TempDir::new().unwrap();
        write_descriptor(dir.path(), &["missing.ismv"]);
        let logger: ArcLogger = DummyLogger::new();
        let err = Presentation::load(
            dir.path(),
            "test",
            "0",
            DrmType::Clear,
            StreamType::Ism,
            &playready_options(),
            &logger,
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::ParseFile(..)));
    }
}
