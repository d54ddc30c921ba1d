// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{Fragment, Handler, Movie, Track};
use common::time::TICKS_PER_SECOND;
use mp4::{Boxes, FullBox};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("mp4: {0}")]
    Mp4(#[from] mp4::Mp4Error),

    #[error("from int: {0}")]
    FromInt(#[from] std::num::TryFromIntError),
}

/// Serialize a fragment's moof box into `moof_data`, followed
/// by the 8-byte mdat header. The trun data offset points just
/// past that header.
pub fn serialize_fragment(fragment: &mut Fragment, is_video: bool) -> Result<(), SerializeError> {
    let moof_size = make_moof(fragment, is_video, 0).size();
    let data_offset = i32::try_from(moof_size + 8)?;
    let moof = make_moof(fragment, is_video, data_offset);

    let mut buf = Vec::with_capacity(moof_size + 8);
    moof.marshal(&mut buf)?;
    buf.extend_from_slice(&u32::try_from(fragment.mdat_size)?.to_be_bytes());
    buf.extend_from_slice(b"mdat");

    fragment.moof_size = moof_size;
    fragment.moof_data = buf;
    Ok(())
}

fn make_moof(fragment: &Fragment, is_video: bool, data_offset: i32) -> Boxes {
    let mut traf = Boxes::new(mp4::Traf)
        .with_child(Boxes::new(mp4::Tfhd {
            full_box: FullBox {
                version: 0,
                flags: mp4::u32_to_flags(fragment.tfhd_flags),
            },
            track_id: fragment.track_id,
            default_sample_duration: fragment.default_sample_duration,
            default_sample_flags: fragment.default_sample_flags,
            ..mp4::Tfhd::default()
        }))
        .with_child(Boxes::new(mp4::Trun {
            flags: mp4::u32_to_flags(fragment.trun_flags),
            data_offset,
            first_sample_flags: fragment.first_sample_flags,
            entries: fragment
                .samples
                .iter()
                .map(|s| mp4::TrunEntry {
                    sample_duration: s.duration,
                    sample_size: s.size,
                    sample_flags: s.flags,
                    sample_composition_time_offset: s.composition_time_offset,
                })
                .collect(),
        }));

    if is_video && !fragment.sdtp_flags.is_empty() {
        traf.children.push(Boxes::new(mp4::Sdtp {
            full_box: FullBox::default(),
            sample_flags: fragment.sdtp_flags.clone(),
        }));
    }

    if let Some(se) = &fragment.sample_encryption {
        let flags = if se.with_subsamples {
            mp4::SAMPLE_ENCRYPTION_SUBSAMPLES
        } else {
            0
        };
        traf.children.push(Boxes::new(mp4::SampleEncryption {
            full_box: FullBox {
                version: 0,
                flags: mp4::u32_to_flags(flags),
            },
            algorithm_id: 0,
            iv_size: 0,
            kid: [0; 16],
            samples: se
                .samples
                .iter()
                .map(|s| mp4::SampleEncryptionSample {
                    iv: s.iv,
                    subsamples: s.subsamples.clone(),
                })
                .collect(),
        }));
    }

    Boxes::new(mp4::Moof)
        .with_child(Boxes::new(mp4::Mfhd {
            full_box: FullBox::default(),
            sequence_number: fragment.sequence_number,
        }))
        .with_child(traf)
}

/// Initialization header for Smooth Streaming and DASH Live:
/// ftyp plus a moov without sample data.
pub fn serialize_track_ccff(movie: &Movie, track: &Track) -> Result<Vec<u8>, SerializeError> {
    let ftyp = Boxes::new(mp4::Ftyp {
        major_brand: *b"isml",
        minor_version: 1,
        compatible_brands: vec![
            mp4::CompatibleBrandElem(*b"piff"),
            mp4::CompatibleBrandElem(*b"iso2"),
        ],
    });
    let moov = make_track_moov(movie, track);

    let mut buf = Vec::with_capacity(ftyp.size() + moov.size());
    ftyp.marshal(&mut buf)?;
    moov.marshal(&mut buf)?;
    Ok(buf)
}

pub struct DashHeader {
    /// ftyp + moov + sidx.
    pub data: Vec<u8>,
    /// Size of ftyp + moov alone.
    pub header_size: usize,
    /// Size of ftyp + moov + sidx.
    pub header_and_sidx_size: usize,
}

/// Header of the virtual DASH On-Demand file: ftyp + moov
/// followed by a segment index listing every fragment.
pub fn serialize_track_dash(movie: &Movie, track: &Track) -> Result<DashHeader, SerializeError> {
    let ftyp = Boxes::new(mp4::Ftyp {
        major_brand: *b"mp42",
        minor_version: 1,
        compatible_brands: vec![
            mp4::CompatibleBrandElem(*b"mp41"),
            mp4::CompatibleBrandElem(*b"mp42"),
            mp4::CompatibleBrandElem(*b"isom"),
        ],
    });
    let moov = make_track_moov(movie, track);
    let sidx = make_sidx(track)?;

    let header_size = ftyp.size() + moov.size();
    let header_and_sidx_size = header_size + sidx.size();

    let mut buf = Vec::with_capacity(header_and_sidx_size);
    ftyp.marshal(&mut buf)?;
    moov.marshal(&mut buf)?;
    sidx.marshal(&mut buf)?;

    Ok(DashHeader {
        data: buf,
        header_size,
        header_and_sidx_size,
    })
}

fn make_sidx(track: &Track) -> Result<Boxes, SerializeError> {
    let mut entries = Vec::with_capacity(track.fragments.len());
    for fragment in &track.fragments {
        entries.push(mp4::SidxEntry {
            reference_type: false,
            referenced_size: u32::try_from(u64::try_from(fragment.moof_size)? + fragment.mdat_size)?,
            subsegment_duration: u32::try_from(fragment.duration)?,
            starts_with_sap: true,
            sap_type: 1,
            sap_delta_time: 0,
        });
    }
    Ok(Boxes::new(mp4::Sidx {
        full_box: FullBox::default(),
        reference_id: track.track_id,
        timescale: u32::try_from(TICKS_PER_SECOND)?,
        earliest_presentation_time: 0,
        first_offset: 0,
        entries,
    }))
}

fn saturating_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

fn make_track_moov(movie: &Movie, track: &Track) -> Boxes {
    let mut moov = Boxes::new(mp4::Moov).with_child(Boxes::new(mp4::Mvhd {
        timescale: movie.timescale,
        version: mp4::MvhdVersion::V0(mp4::MvhdV0 {
            duration: saturating_u32(movie.duration),
            ..mp4::MvhdV0::default()
        }),
        rate: 0x0001_0000,
        volume: 0x0100,
        matrix: [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000],
        next_track_id: movie.next_track_id,
        ..mp4::Mvhd::default()
    }));

    moov.children.push(make_trak(track));

    moov.children.push(
        Boxes::new(mp4::Mvex)
            .with_child(Boxes::new(mp4::Mehd {
                full_box: FullBox::default(),
                fragment_duration: saturating_u32(movie.duration),
            }))
            .with_child(Boxes::new(mp4::Trex {
                track_id: track.track_id,
                default_sample_description_index: 1,
                ..mp4::Trex::default()
            })),
    );

    if let Some(pssh) = &movie.pssh {
        moov.children.push(Boxes::new(mp4::Pssh {
            full_box: FullBox::default(),
            system_id: pssh.system_id,
            data: pssh.data.clone(),
        }));
    }

    moov
}

fn make_trak(track: &Track) -> Boxes {
    let is_video = track.handler.is_video();

    let stsd_entry = if is_video {
        Boxes::new(mp4::Avc1 {
            sample_entry: mp4::SampleEntry {
                reserved: [0; 6],
                data_reference_index: 1,
            },
            width: track.width,
            height: track.height,
            horiz_resolution: 0x0048_0000,
            vert_resolution: 0x0048_0000,
            frame_count: 1,
            depth: 24,
            pre_defined3: -1,
            ..mp4::Avc1::default()
        })
        .with_child(Boxes::new(mp4::RawBox {
            typ: *b"avcC",
            data: track.codec_data.clone(),
        }))
    } else {
        Boxes::new(mp4::Mp4a {
            sample_entry: mp4::SampleEntry {
                reserved: [0; 6],
                data_reference_index: 1,
            },
            channel_count: track.channel_count,
            sample_size: 16,
            sample_rate: track.sample_rate,
            ..mp4::Mp4a::default()
        })
        .with_child(Boxes::new(mp4::Esds {
            full_box: FullBox::default(),
            es_id: u16::try_from(track.track_id).unwrap_or(0),
            object_type_indication: 0x40, // AAC
            stream_type: 0x15,            // audio, upstream flag clear
            buffer_size_db: 0,
            max_bitrate: 0,
            avg_bitrate: 0,
            decoder_config: track.codec_data.clone(),
        }))
    };

    let stbl = Boxes::new(mp4::Stbl).with_children(vec![
        Boxes::new(mp4::Stsd {
            full_box: FullBox::default(),
            entry_count: 1,
        })
        .with_child(stsd_entry),
        Boxes::new(mp4::Stts::default()),
        Boxes::new(mp4::Stsc::default()),
        Boxes::new(mp4::Stsz::default()),
        Boxes::new(mp4::Stco::default()),
    ]);

    let media_header = if is_video {
        Boxes::new(mp4::Vmhd {
            full_box: FullBox {
                version: 0,
                flags: [0, 0, 1],
            },
            ..mp4::Vmhd::default()
        })
    } else {
        Boxes::new(mp4::Smhd::default())
    };

    let minf = Boxes::new(mp4::Minf).with_children(vec![
        media_header,
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
    ]);

    Boxes::new(mp4::Trak).with_children(vec![
        Boxes::new(mp4::Tkhd {
            flags: [0, 0, 3],
            track_id: track.track_id,
            volume: if is_video { 0 } else { 0x0100 },
            width: u32::from(track.width) << 16,
            height: u32::from(track.height) << 16,
            matrix: [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000],
            version: mp4::TkhdVersion::V0(mp4::TkhdV0 {
                duration: saturating_u32(track.duration),
                ..mp4::TkhdV0::default()
            }),
            ..mp4::Tkhd::default()
        }),
        Boxes::new(mp4::Mdia).with_children(vec![
            Boxes::new(mp4::Mdhd {
                timescale: track.timescale,
                language: track.language,
                version: mp4::MdhdVersion::V0(mp4::MdhdV0 {
                    duration: saturating_u32(track.duration),
                    ..mp4::MdhdV0::default()
                }),
                ..mp4::Mdhd::default()
            }),
            Boxes::new(mp4::Hdlr {
                handler_type: if is_video { *b"vide" } else { *b"soun" },
                name: if is_video {
                    "VideoHandler".to_owned()
                } else {
                    "SoundHandler".to_owned()
                },
                ..mp4::Hdlr::default()
            }),
            minf,
        ]),
    ])
}
