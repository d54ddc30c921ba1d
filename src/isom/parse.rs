// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    reader::{BytesReader, FourCc, ReadError},
    CttsEntry, Fragment, FragmentSample, Handler, MdatChunk, Movie, PsshData, Saio, Saiz,
    SampleEncryptionTable, SourceFile, Track,
};
use common::{ArcLogger, ILogger, LogEntry, LogLevel};
use mp4::{
    SampleEncryptionSample, SampleEncryptionSubsample, StscEntry, SttsEntry,
    SAMPLE_ENCRYPTION_OVERRIDE_PARAMETERS, SAMPLE_ENCRYPTION_SUBSAMPLES, TFHD_BASE_DATA_OFFSET_PRESENT,
    TFHD_DEFAULT_SAMPLE_DURATION_PRESENT, TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT,
    TFHD_DEFAULT_SAMPLE_SIZE_PRESENT, TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT,
    TRUN_DATA_OFFSET_PRESENT, TRUN_FIRST_SAMPLE_FLAGS_PRESENT,
    TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT, TRUN_SAMPLE_DURATION_PRESENT,
    TRUN_SAMPLE_FLAGS_PRESENT, TRUN_SAMPLE_SIZE_PRESENT, UUID_PROTECTION_HEADER,
    UUID_SAMPLE_ENCRYPTION,
};
use std::{
    io::{Read, Seek, SeekFrom},
    path::Path,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("open: {0}")]
    Open(std::io::Error),

    #[error("metadata: {0}")]
    Metadata(std::io::Error),

    #[error("seek: {0}")]
    Seek(std::io::Error),

    #[error("read: {0}")]
    Read(std::io::Error),

    #[error("box '{typ}' has impossible size {size}")]
    BoxSize { typ: FourCc, size: u64 },

    #[error("truncated '{typ}' box: {source}")]
    Truncated { typ: FourCc, source: ReadError },

    #[error("mdat without a preceding moof in fragmented file")]
    MdatWithoutFragment,
}

/// ftyp compatibility brands as a bit set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FtypBrands(u32);

pub const BRAND_ISML: u32 = 1 << 0;
pub const BRAND_MP42: u32 = 1 << 1;
pub const BRAND_MP41: u32 = 1 << 2;
pub const BRAND_PIFF: u32 = 1 << 3;
pub const BRAND_ISO2: u32 = 1 << 4;
pub const BRAND_ISOM: u32 = 1 << 5;
pub const BRAND_QT: u32 = 1 << 6;
pub const BRAND_ISO6: u32 = 1 << 7;

impl FtypBrands {
    #[must_use]
    pub fn new(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    fn add(&mut self, bits: u32) {
        self.0 |= bits;
    }

    /// Brands that store hdlr.name as a null-terminated string
    /// rather than a Pascal string.
    #[must_use]
    pub fn null_terminated_strings(self) -> bool {
        self.contains(BRAND_MP41 | BRAND_MP42 | BRAND_PIFF)
    }
}

fn brand_bit(brand: FourCc) -> Option<u32> {
    match &brand.0 {
        b"isml" => Some(BRAND_ISML),
        b"mp42" => Some(BRAND_MP42),
        b"mp41" => Some(BRAND_MP41),
        b"piff" => Some(BRAND_PIFF),
        b"iso2" => Some(BRAND_ISO2),
        b"isom" => Some(BRAND_ISOM),
        b"qt  " => Some(BRAND_QT),
        b"iso6" => Some(BRAND_ISO6),
        _ => None,
    }
}

fn warn(logger: &ArcLogger, msg: String) {
    logger.log(LogEntry::new(LogLevel::Warning, "isom", msg));
}

fn warn_unknown(logger: &ArcLogger, container: &str, typ: FourCc, size: usize) {
    warn(
        logger,
        format!("unknown box '{typ}' inside {container}, size {size}, skipping"),
    );
}

struct BoxHeader {
    typ: FourCc,
    // Total box size including the header.
    size: u64,
    header_size: u64,
}

/// Read one box header from a payload reader. `size == 0`
/// (to end of file) is only valid at the top level and is
/// resolved by the caller.
fn read_box_header(r: &mut BytesReader) -> Result<Option<BoxHeader>, ReadError> {
    if r.remaining() < 8 {
        return Ok(None);
    }
    let size32 = r.read_u32_be()?;
    let typ = r.read_fourcc()?;
    let (size, header_size) = if size32 == 1 {
        (r.read_u64_be()?, 16)
    } else {
        (u64::from(size32), 8)
    };
    Ok(Some(BoxHeader {
        typ,
        size,
        header_size,
    }))
}

/// Walk the children of a container, calling `child` with a
/// sub-reader per box. Unknown children are the callee's
/// problem; truncated children end the parse.
fn walk_children<F>(
    r: &mut BytesReader,
    container: FourCc,
    mut child: F,
) -> Result<(), ParseError>
where
    F: FnMut(FourCc, &mut BytesReader) -> Result<(), ParseError>,
{
    while let Some(header) = read_box_header(r).map_err(|source| ParseError::Truncated {
        typ: container,
        source,
    })? {
        if header.size < header.header_size {
            return Err(ParseError::BoxSize {
                typ: header.typ,
                size: header.size,
            });
        }
        let body = usize::try_from(header.size - header.header_size)
            .map_err(|_| ParseError::BoxSize {
                typ: header.typ,
                size: header.size,
            })?;
        let mut sub = r
            .sub_reader(body)
            .map_err(|source| ParseError::Truncated {
                typ: header.typ,
                source,
            })?;
        child(header.typ, &mut sub)?;
        r.skip(body).expect("sub_reader already validated size");
    }
    Ok(())
}

fn truncated(typ: FourCc) -> impl Fn(ReadError) -> ParseError {
    move |source| ParseError::Truncated { typ, source }
}

/// Parse a complete source file. The mdat payload is never
/// loaded; only its byte ranges are recorded.
pub fn parse_file(path: &Path, logger: &ArcLogger) -> Result<SourceFile, ParseError> {
    use ParseError::*;
    let mut file = std::fs::File::open(path).map_err(Open)?;
    let file_size = file.metadata().map_err(Metadata)?.len();

    let mut brands = FtypBrands::default();
    let mut movie = Movie::default();
    let mut fragments: Vec<Fragment> = Vec::new();
    let mut offset = 0;

    while offset + 8 <= file_size {
        let mut header = [0; 16];
        let header_len = usize::try_from((file_size - offset).min(16)).expect("at most 16");
        file.seek(SeekFrom::Start(offset)).map_err(Seek)?;
        file.read_exact(&mut header[..header_len]).map_err(Read)?;

        let mut hr = BytesReader::new(&header[..header_len]);
        let size32 = hr.read_u32_be().expect("at least 8 header bytes");
        let typ = hr.read_fourcc().expect("at least 8 header bytes");
        let (size, header_size) = match size32 {
            0 => (file_size - offset, 8),
            1 => (
                hr.read_u64_be()
                    .map_err(|source| Truncated { typ, source })?,
                16,
            ),
            _ => (u64::from(size32), 8),
        };
        if size < header_size || offset + size > file_size {
            return Err(BoxSize { typ, size });
        }

        match &typ.0 {
            b"ftyp" => {
                let payload = load_payload(&mut file, offset + 8, size - 8)?;
                brands = parse_ftyp(&payload, logger).map_err(truncated(typ))?;
            }
            b"moov" => {
                let payload = load_payload(&mut file, offset + 8, size - 8)?;
                movie = parse_movie(&payload, brands, logger)?;
            }
            b"moof" => {
                let payload = load_payload(&mut file, offset + 8, size - 8)?;
                let mut fragment = parse_moof(&payload, logger)?;
                fragment.moof_size = usize::try_from(size).expect("moof fits memory");
                fragments.push(fragment);
            }
            b"mdat" => {
                if let Some(fragment) = fragments.last_mut() {
                    fragment.mdat_size = size;
                    fragment.chunks.push(MdatChunk {
                        offset: offset + 8,
                        size: size - 8,
                    });
                }
                // A plain file's mdat is addressed through stco.
            }
            b"mfra" | b"free" | b"wide" | b"skip" => {}
            b"uuid" => {
                let payload = load_payload(&mut file, offset + 8, (size - 8).min(16))?;
                let mut r = BytesReader::new(&payload);
                let uuid = r.read_bytes(16).map_err(truncated(typ))?;
                warn(
                    logger,
                    format!("unknown top-level uuid box {}, skipping", format_uuid(uuid)),
                );
            }
            _ => {
                warn(
                    logger,
                    format!("unknown top-level box '{typ}' at offset {offset}, size {size}"),
                );
            }
        }

        offset += size;
    }

    attach_fragments(&mut movie, fragments, logger);

    Ok(SourceFile { brands, movie })
}

fn load_payload(
    file: &mut std::fs::File,
    offset: u64,
    size: u64,
) -> Result<Vec<u8>, ParseError> {
    use ParseError::*;
    file.seek(SeekFrom::Start(offset)).map_err(Seek)?;
    let mut payload = vec![0; usize::try_from(size).expect("payload fits memory")];
    file.read_exact(&mut payload).map_err(Read)?;
    Ok(payload)
}

fn format_uuid(uuid: &[u8]) -> String {
    let h = common::hex_encode(uuid);
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
}

/// Distribute moof fragments onto their tracks and accumulate
/// per-track timestamps.
fn attach_fragments(movie: &mut Movie, fragments: Vec<Fragment>, logger: &ArcLogger) {
    for fragment in fragments {
        let Some(track) = movie
            .tracks
            .iter_mut()
            .find(|t| t.track_id == fragment.track_id)
        else {
            warn(
                logger,
                format!("fragment for unknown track {}", fragment.track_id),
            );
            continue;
        };
        track.fragments.push(fragment);
    }
    for track in &mut movie.tracks {
        let mut ts = 0;
        for fragment in &mut track.fragments {
            fragment.timestamp = ts;
            ts += fragment.duration;
        }
    }
}

fn parse_ftyp(payload: &[u8], logger: &ArcLogger) -> Result<FtypBrands, ReadError> {
    let mut r = BytesReader::new(payload);
    let mut brands = FtypBrands::default();

    let major = r.read_fourcc()?;
    if let Some(bit) = brand_bit(major) {
        brands.add(bit);
    }
    let _minor_version = r.read_u32_be()?;
    while r.remaining() >= 4 {
        let brand = r.read_fourcc()?;
        match brand_bit(brand) {
            Some(bit) => brands.add(bit),
            None if brand.0 == [0; 4] => {}
            None => warn(logger, format!("unknown ftyp brand '{brand}'")),
        }
    }
    Ok(brands)
}

/// Parse a moov payload (the bytes after the box header).
pub fn parse_movie(
    payload: &[u8],
    brands: FtypBrands,
    logger: &ArcLogger,
) -> Result<Movie, ParseError> {
    let mut movie = Movie::default();
    let mut r = BytesReader::new(payload);

    walk_children(&mut r, FourCc(*b"moov"), |typ, sub| {
        match &typ.0 {
            b"mvhd" => parse_mvhd(sub, &mut movie).map_err(truncated(typ))?,
            b"trak" => {
                let track = parse_trak(sub, brands, logger)?;
                movie.tracks.push(track);
            }
            b"pssh" => parse_pssh(sub, &mut movie).map_err(truncated(typ))?,
            b"uuid" => {
                let uuid = sub.read_bytes(16).map_err(truncated(typ))?;
                if uuid == UUID_PROTECTION_HEADER {
                    parse_piff_pssh(sub, &mut movie).map_err(truncated(typ))?;
                } else {
                    warn(
                        logger,
                        format!("unknown uuid box {} inside moov", format_uuid(uuid)),
                    );
                }
            }
            b"mvex" | b"udta" | b"meta" | b"iods" => {}
            _ => warn_unknown(logger, "moov", typ, sub.remaining() + 8),
        }
        Ok(())
    })?;

    Ok(movie)
}

fn parse_mvhd(r: &mut BytesReader, movie: &mut Movie) -> Result<(), ReadError> {
    let (version, _flags) = r.read_version_flags()?;
    if version == 1 {
        let _creation = r.read_u64_be()?;
        let _modification = r.read_u64_be()?;
        movie.timescale = r.read_u32_be()?;
        movie.duration = r.read_u64_be()?;
    } else {
        let _creation = r.read_u32_be()?;
        let _modification = r.read_u32_be()?;
        movie.timescale = r.read_u32_be()?;
        movie.duration = u64::from(r.read_u32_be()?);
    }
    r.skip(4)?; // rate
    r.skip(2)?; // volume
    r.skip(2)?; // reserved
    r.skip(8)?; // reserved
    r.skip(9 * 4)?; // matrix
    r.skip(6 * 4)?; // pre_defined
    movie.next_track_id = r.read_u32_be()?;
    Ok(())
}

fn parse_pssh(r: &mut BytesReader, movie: &mut Movie) -> Result<(), ReadError> {
    let (_version, _flags) = r.read_version_flags()?;
    let mut system_id = [0; 16];
    system_id.copy_from_slice(r.read_bytes(16)?);
    let data_len = usize::try_from(r.read_u32_be()?).expect("u32 fits usize");
    let data = r.read_bytes(data_len)?.to_vec();
    movie.pssh = Some(PsshData { system_id, data });
    Ok(())
}

// PIFF carries the same payload in a uuid box; the 16 uuid
// bytes have already been consumed.
fn parse_piff_pssh(r: &mut BytesReader, movie: &mut Movie) -> Result<(), ReadError> {
    parse_pssh(r, movie)
}

fn parse_trak(
    r: &mut BytesReader,
    brands: FtypBrands,
    logger: &ArcLogger,
) -> Result<Track, ParseError> {
    let mut track = Track::default();

    walk_children(r, FourCc(*b"trak"), |typ, sub| {
        match &typ.0 {
            b"tkhd" => parse_tkhd(sub, &mut track).map_err(truncated(typ))?,
            b"mdia" => parse_mdia(sub, &mut track, brands, logger)?,
            b"edts" => parse_edts(sub, logger)?,
            b"tref" | b"udta" | b"meta" | b"load" | b"tapt" => {}
            _ => warn_unknown(logger, "trak", typ, sub.remaining() + 8),
        }
        Ok(())
    })?;

    Ok(track)
}

fn parse_tkhd(r: &mut BytesReader, track: &mut Track) -> Result<(), ReadError> {
    let (version, _flags) = r.read_version_flags()?;
    if version == 1 {
        r.skip(16)?; // creation, modification
        track.track_id = r.read_u32_be()?;
        r.skip(4)?; // reserved
        r.skip(8)?; // duration
    } else {
        r.skip(8)?;
        track.track_id = r.read_u32_be()?;
        r.skip(4)?;
        r.skip(4)?;
    }
    r.skip(8)?; // reserved
    r.skip(2)?; // layer
    r.skip(2)?; // alternate_group
    r.skip(2)?; // volume
    r.skip(2)?; // reserved
    r.skip(9 * 4)?; // matrix
    let _width = r.read_u32_be()?;
    let _height = r.read_u32_be()?;
    Ok(())
}

fn parse_edts(r: &mut BytesReader, logger: &ArcLogger) -> Result<(), ParseError> {
    walk_children(r, FourCc(*b"edts"), |typ, sub| {
        match &typ.0 {
            // Edit lists do not affect fragment timing here.
            b"elst" => {}
            _ => warn_unknown(logger, "edts", typ, sub.remaining() + 8),
        }
        Ok(())
    })
}

fn parse_mdia(
    r: &mut BytesReader,
    track: &mut Track,
    brands: FtypBrands,
    logger: &ArcLogger,
) -> Result<(), ParseError> {
    walk_children(r, FourCc(*b"mdia"), |typ, sub| {
        match &typ.0 {
            b"mdhd" => parse_mdhd(sub, track).map_err(truncated(typ))?,
            b"hdlr" => parse_hdlr(sub, track, brands, logger).map_err(truncated(typ))?,
            b"minf" => parse_minf(sub, track, logger)?,
            b"imap" | b"udta" => {}
            _ => warn_unknown(logger, "mdia", typ, sub.remaining() + 8),
        }
        Ok(())
    })
}

fn parse_mdhd(r: &mut BytesReader, track: &mut Track) -> Result<(), ReadError> {
    let (version, _flags) = r.read_version_flags()?;
    if version == 1 {
        r.skip(16)?;
        track.timescale = r.read_u32_be()?;
        track.duration = r.read_u64_be()?;
    } else {
        r.skip(8)?;
        track.timescale = r.read_u32_be()?;
        track.duration = u64::from(r.read_u32_be()?);
    }
    let code = r.read_u16_be()?;
    track.language = unpack_language_code(code);
    let _pre_defined = r.read_u16_be()?;
    Ok(())
}

#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn unpack_language_code(code: u16) -> [u8; 3] {
    [
        0x60 + ((code >> 10) & 0x1f) as u8,
        0x60 + ((code >> 5) & 0x1f) as u8,
        0x60 + (code & 0x1f) as u8,
    ]
}

fn parse_hdlr(
    r: &mut BytesReader,
    track: &mut Track,
    brands: FtypBrands,
    logger: &ArcLogger,
) -> Result<(), ReadError> {
    let (_version, _flags) = r.read_version_flags()?;
    let _pre_defined = r.read_u32_be()?;
    let handler = r.read_fourcc()?;
    track.handler = match &handler.0 {
        b"vide" => Handler::Video,
        b"soun" => Handler::Audio,
        other => Handler::Other(*other),
    };
    r.skip(12)?; // reserved

    parse_handler_name(r, brands, logger)?;
    Ok(())
}

// hdlr.name is a Pascal string in QuickTime-derived files and
// null-terminated in MP4-derived ones. The ftyp compatibility
// set picks the expectation; the actual layout wins, with a
// warning on mismatch.
fn parse_handler_name(
    r: &mut BytesReader,
    brands: FtypBrands,
    logger: &ArcLogger,
) -> Result<(), ReadError> {
    let expect_null_terminated = brands.null_terminated_strings();
    if r.remaining() == 0 {
        return Ok(());
    }

    let len = usize::from(r.read_bytes(1)?[0]);
    let remaining = r.remaining();
    if remaining == len {
        if expect_null_terminated {
            warn(
                logger,
                "expected null-terminated hdlr name, got Pascal string".to_owned(),
            );
        }
        r.skip(len)?;
    } else {
        if !expect_null_terminated {
            warn(
                logger,
                "expected Pascal hdlr name, got null-terminated string".to_owned(),
            );
        }
        r.skip(remaining)?;
    }
    Ok(())
}

fn parse_minf(
    r: &mut BytesReader,
    track: &mut Track,
    logger: &ArcLogger,
) -> Result<(), ParseError> {
    walk_children(r, FourCc(*b"minf"), |typ, sub| {
        match &typ.0 {
            b"stbl" => parse_stbl(sub, track, logger)?,
            b"dinf" => parse_dinf(sub, logger)?,
            b"vmhd" | b"smhd" | b"hmhd" | b"gmhd" | b"hdlr" | b"code" => {}
            _ => warn_unknown(logger, "minf", typ, sub.remaining() + 8),
        }
        Ok(())
    })
}

fn parse_dinf(r: &mut BytesReader, logger: &ArcLogger) -> Result<(), ParseError> {
    walk_children(r, FourCc(*b"dinf"), |typ, sub| {
        match &typ.0 {
            b"dref" => {}
            _ => warn_unknown(logger, "dinf", typ, sub.remaining() + 8),
        }
        Ok(())
    })
}

fn parse_stbl(
    r: &mut BytesReader,
    track: &mut Track,
    logger: &ArcLogger,
) -> Result<(), ParseError> {
    walk_children(r, FourCc(*b"stbl"), |typ, sub| {
        match &typ.0 {
            b"stts" => parse_stts(sub, track).map_err(truncated(typ))?,
            b"ctts" => parse_ctts(sub, track).map_err(truncated(typ))?,
            b"stss" => parse_stss(sub, track).map_err(truncated(typ))?,
            b"stsd" => parse_stsd(sub, track, logger)?,
            b"stsz" => parse_stsz(sub, track).map_err(truncated(typ))?,
            b"stsc" => parse_stsc(sub, track).map_err(truncated(typ))?,
            b"stco" => parse_stco(sub, track).map_err(truncated(typ))?,
            b"co64" => parse_co64(sub, track).map_err(truncated(typ))?,
            b"stsh" | b"stdp" | b"cslg" | b"stps" | b"sdtp" => {}
            _ => warn_unknown(logger, "stbl", typ, sub.remaining() + 8),
        }
        Ok(())
    })
}

fn parse_stts(r: &mut BytesReader, track: &mut Track) -> Result<(), ReadError> {
    let (_version, _flags) = r.read_version_flags()?;
    let entry_count = r.read_u32_be()?;
    let mut entries = Vec::with_capacity(usize::try_from(entry_count.min(1 << 20)).expect("bounded"));
    for _ in 0..entry_count {
        entries.push(SttsEntry {
            sample_count: r.read_u32_be()?,
            sample_delta: r.read_u32_be()?,
        });
    }
    track.stts = entries;
    Ok(())
}

fn parse_ctts(r: &mut BytesReader, track: &mut Track) -> Result<(), ReadError> {
    let (_version, _flags) = r.read_version_flags()?;
    let entry_count = r.read_u32_be()?;
    let mut entries = Vec::with_capacity(usize::try_from(entry_count.min(1 << 20)).expect("bounded"));
    for _ in 0..entry_count {
        entries.push(CttsEntry {
            sample_count: r.read_u32_be()?,
            sample_offset: r.read_u32_be()?,
        });
    }
    track.ctts = entries;
    Ok(())
}

fn parse_stss(r: &mut BytesReader, track: &mut Track) -> Result<(), ReadError> {
    let (_version, _flags) = r.read_version_flags()?;
    let entry_count = r.read_u32_be()?;
    let mut numbers = Vec::with_capacity(usize::try_from(entry_count.min(1 << 20)).expect("bounded"));
    for _ in 0..entry_count {
        numbers.push(r.read_u32_be()?);
    }
    track.stss = Some(numbers);
    Ok(())
}

fn parse_stsz(r: &mut BytesReader, track: &mut Track) -> Result<(), ReadError> {
    let (_version, _flags) = r.read_version_flags()?;
    track.sample_size = r.read_u32_be()?;
    track.num_samples = r.read_u32_be()?;
    if track.sample_size == 0 {
        let mut sizes = Vec::with_capacity(usize::try_from(track.num_samples.min(1 << 20)).expect("bounded"));
        for _ in 0..track.num_samples {
            sizes.push(r.read_u32_be()?);
        }
        track.sample_sizes = sizes;
    }
    Ok(())
}

fn parse_stsc(r: &mut BytesReader, track: &mut Track) -> Result<(), ReadError> {
    let (_version, _flags) = r.read_version_flags()?;
    let entry_count = r.read_u32_be()?;
    let mut entries = Vec::with_capacity(usize::try_from(entry_count.min(1 << 20)).expect("bounded"));
    for _ in 0..entry_count {
        entries.push(StscEntry {
            first_chunk: r.read_u32_be()?,
            samples_per_chunk: r.read_u32_be()?,
            sample_description_index: r.read_u32_be()?,
        });
    }
    track.stsc = entries;
    Ok(())
}

fn parse_stco(r: &mut BytesReader, track: &mut Track) -> Result<(), ReadError> {
    let (_version, _flags) = r.read_version_flags()?;
    let entry_count = r.read_u32_be()?;
    let mut offsets = Vec::with_capacity(usize::try_from(entry_count.min(1 << 20)).expect("bounded"));
    for _ in 0..entry_count {
        offsets.push(u64::from(r.read_u32_be()?));
    }
    track.chunk_offsets = offsets;
    Ok(())
}

fn parse_co64(r: &mut BytesReader, track: &mut Track) -> Result<(), ReadError> {
    let (_version, _flags) = r.read_version_flags()?;
    let entry_count = r.read_u32_be()?;
    let mut offsets = Vec::with_capacity(usize::try_from(entry_count.min(1 << 20)).expect("bounded"));
    for _ in 0..entry_count {
        offsets.push(r.read_u64_be()?);
    }
    track.chunk_offsets = offsets;
    Ok(())
}

fn parse_stsd(
    r: &mut BytesReader,
    track: &mut Track,
    logger: &ArcLogger,
) -> Result<(), ParseError> {
    let typ = FourCc(*b"stsd");
    let (_version, _flags) = r.read_version_flags().map_err(truncated(typ))?;
    let _entry_count = r.read_u32_be().map_err(truncated(typ))?;

    walk_children(r, typ, |entry_typ, sub| {
        match &entry_typ.0 {
            b"mp4a" | b"enca" => {
                track.is_encrypted |= entry_typ.0 == *b"enca";
                parse_audio_sample_entry(sub, track, logger).map_err(truncated(entry_typ))?;
            }
            b"avc1" | b"encv" | b"mp4v" => {
                track.is_encrypted |= entry_typ.0 == *b"encv";
                parse_visual_sample_entry(sub, track, logger).map_err(truncated(entry_typ))?;
            }
            b"tmcd" | b"apch" => {}
            _ => warn_unknown(logger, "stsd", entry_typ, sub.remaining() + 8),
        }
        Ok(())
    })
}

fn parse_audio_sample_entry(
    r: &mut BytesReader,
    track: &mut Track,
    logger: &ArcLogger,
) -> Result<(), ReadError> {
    r.skip(6)?; // reserved
    let _data_reference_index = r.read_u16_be()?;
    r.skip(8)?; // reserved
    track.channel_count = r.read_u16_be()?;
    let _sample_size = r.read_u16_be()?;
    r.skip(4)?; // pre_defined, reserved
    track.sample_rate = r.read_u32_be()?;

    parse_sample_entry_extensions(r, track, logger)
}

fn parse_visual_sample_entry(
    r: &mut BytesReader,
    track: &mut Track,
    logger: &ArcLogger,
) -> Result<(), ReadError> {
    r.skip(6)?; // reserved
    let _data_reference_index = r.read_u16_be()?;
    r.skip(16)?; // pre_defined, reserved
    track.width = r.read_u16_be()?;
    track.height = r.read_u16_be()?;
    r.skip(50)?; // resolution through pre_defined

    parse_sample_entry_extensions(r, track, logger)
}

fn parse_sample_entry_extensions(
    r: &mut BytesReader,
    track: &mut Track,
    logger: &ArcLogger,
) -> Result<(), ReadError> {
    while let Some(header) = read_box_header(r)? {
        let body = usize::try_from(header.size.saturating_sub(header.header_size))
            .expect("box fits memory");
        let mut sub = r.sub_reader(body)?;
        match &header.typ.0 {
            b"avcC" => {
                track.codec_data = sub.read_bytes(sub.remaining())?.to_vec();
            }
            b"esds" => parse_esds(&mut sub, track)?,
            b"sinf" | b"btrt" | b"pasp" | b"colr" => {}
            _ => warn_unknown(logger, "sample entry", header.typ, usize::try_from(header.size).unwrap_or(usize::MAX)),
        }
        r.skip(body)?;
    }
    Ok(())
}

const ES_DESCR_TAG: u8 = 0x03;
const DECODER_CONFIG_DESCR_TAG: u8 = 0x04;
const DEC_SPECIFIC_INFO_TAG: u8 = 0x05;

// MPEG-4 descriptor lengths are 7 bits per byte with a
// continuation bit in the high bit.
fn read_descriptor_length(r: &mut BytesReader) -> Result<usize, ReadError> {
    let mut len: usize = 0;
    loop {
        let b = r.read_u8()?;
        len = (len << 7) | usize::from(b & 0x7f);
        if b & 0x80 == 0 {
            return Ok(len);
        }
    }
}

fn parse_esds(r: &mut BytesReader, track: &mut Track) -> Result<(), ReadError> {
    let (_version, _flags) = r.read_version_flags()?;

    while r.remaining() > 0 {
        let tag = r.read_u8()?;
        let len = read_descriptor_length(r)?;
        match tag {
            ES_DESCR_TAG => {
                let _es_id = r.read_u16_be()?;
                let es_flags = r.read_u8()?;
                if es_flags & 0x80 != 0 {
                    r.skip(2)?;
                }
                if es_flags & 0x40 != 0 {
                    r.skip(2)?;
                }
                if es_flags & 0x20 != 0 {
                    r.skip(2)?;
                }
            }
            DECODER_CONFIG_DESCR_TAG => {
                let _object_type = r.read_u8()?;
                let _stream_type = r.read_u8()?;
                let _buffer_size_db = r.read_u24_be()?;
                let _max_bitrate = r.read_u32_be()?;
                let _avg_bitrate = r.read_u32_be()?;
            }
            DEC_SPECIFIC_INFO_TAG => {
                track.codec_data = r.read_bytes(len)?.to_vec();
            }
            _ => {
                r.skip(len.min(r.remaining()))?;
            }
        }
    }
    Ok(())
}

/// Parse a moof payload into a fragment. Timestamps are fixed
/// up later once all fragments of a track are known.
pub(crate) fn parse_moof(payload: &[u8], logger: &ArcLogger) -> Result<Fragment, ParseError> {
    let mut fragment = Fragment::default();
    let mut r = BytesReader::new(payload);

    walk_children(&mut r, FourCc(*b"moof"), |typ, sub| {
        match &typ.0 {
            b"mfhd" => {
                let (_version, _flags) = sub.read_version_flags().map_err(truncated(typ))?;
                fragment.sequence_number = sub.read_u32_be().map_err(truncated(typ))?;
            }
            b"traf" => parse_traf(sub, &mut fragment, logger)?,
            b"uuid" => {
                let uuid = sub.read_bytes(16).map_err(truncated(typ))?;
                warn(
                    logger,
                    format!("unknown uuid box {} inside moof", format_uuid(uuid)),
                );
            }
            _ => warn_unknown(logger, "moof", typ, sub.remaining() + 8),
        }
        Ok(())
    })?;

    apply_tfhd_defaults(&mut fragment);
    fragment.duration = fragment
        .samples
        .iter()
        .map(|s| u64::from(s.duration))
        .sum();

    Ok(fragment)
}

fn parse_traf(
    r: &mut BytesReader,
    fragment: &mut Fragment,
    logger: &ArcLogger,
) -> Result<(), ParseError> {
    walk_children(r, FourCc(*b"traf"), |typ, sub| {
        match &typ.0 {
            b"tfhd" => parse_tfhd(sub, fragment).map_err(truncated(typ))?,
            b"trun" => parse_trun(sub, fragment).map_err(truncated(typ))?,
            b"sdtp" => parse_sdtp(sub, fragment).map_err(truncated(typ))?,
            b"saiz" => parse_saiz(sub, fragment).map_err(truncated(typ))?,
            b"saio" => parse_saio(sub, fragment).map_err(truncated(typ))?,
            b"tfdt" => {}
            b"uuid" => {
                let uuid = sub.read_bytes(16).map_err(truncated(typ))?;
                if uuid == UUID_SAMPLE_ENCRYPTION {
                    parse_sample_encryption(sub, fragment).map_err(truncated(typ))?;
                } else {
                    warn(
                        logger,
                        format!("unknown uuid box {} inside traf", format_uuid(uuid)),
                    );
                }
            }
            _ => warn_unknown(logger, "traf", typ, sub.remaining() + 8),
        }
        Ok(())
    })
}

fn parse_tfhd(r: &mut BytesReader, fragment: &mut Fragment) -> Result<(), ReadError> {
    let (_version, flags) = r.read_version_flags()?;
    fragment.tfhd_flags = flags;
    fragment.track_id = r.read_u32_be()?;
    if flags & TFHD_BASE_DATA_OFFSET_PRESENT != 0 {
        r.skip(8)?;
    }
    if flags & TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT != 0 {
        r.skip(4)?;
    }
    if flags & TFHD_DEFAULT_SAMPLE_DURATION_PRESENT != 0 {
        fragment.default_sample_duration = r.read_u32_be()?;
    }
    if flags & TFHD_DEFAULT_SAMPLE_SIZE_PRESENT != 0 {
        r.skip(4)?;
    }
    if flags & TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT != 0 {
        fragment.default_sample_flags = r.read_u32_be()?;
    }
    Ok(())
}

fn parse_trun(r: &mut BytesReader, fragment: &mut Fragment) -> Result<(), ReadError> {
    let (_version, flags) = r.read_version_flags()?;
    fragment.trun_flags = flags;
    let sample_count = r.read_u32_be()?;
    if flags & TRUN_DATA_OFFSET_PRESENT != 0 {
        let _data_offset = r.read_u32_be()?;
    }
    if flags & TRUN_FIRST_SAMPLE_FLAGS_PRESENT != 0 {
        fragment.first_sample_flags = r.read_u32_be()?;
    }

    let mut samples = Vec::with_capacity(usize::try_from(sample_count.min(1 << 20)).expect("bounded"));
    for _ in 0..sample_count {
        let mut sample = FragmentSample::default();
        if flags & TRUN_SAMPLE_DURATION_PRESENT != 0 {
            sample.duration = r.read_u32_be()?;
        }
        if flags & TRUN_SAMPLE_SIZE_PRESENT != 0 {
            sample.size = r.read_u32_be()?;
        }
        if flags & TRUN_SAMPLE_FLAGS_PRESENT != 0 {
            sample.flags = r.read_u32_be()?;
        }
        if flags & TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT != 0 {
            sample.composition_time_offset = r.read_u32_be()?;
        }
        samples.push(sample);
    }
    fragment.samples = samples;
    Ok(())
}

fn apply_tfhd_defaults(fragment: &mut Fragment) {
    if fragment.trun_flags & TRUN_SAMPLE_DURATION_PRESENT == 0 {
        for sample in &mut fragment.samples {
            sample.duration = fragment.default_sample_duration;
        }
    }
    if fragment.trun_flags & TRUN_SAMPLE_FLAGS_PRESENT == 0 {
        for sample in &mut fragment.samples {
            sample.flags = fragment.default_sample_flags;
        }
    }
}

fn parse_sdtp(r: &mut BytesReader, fragment: &mut Fragment) -> Result<(), ReadError> {
    let (_version, _flags) = r.read_version_flags()?;
    fragment.sdtp_flags = r.read_bytes(r.remaining())?.to_vec();
    Ok(())
}

fn parse_saiz(r: &mut BytesReader, fragment: &mut Fragment) -> Result<(), ReadError> {
    let (_version, flags) = r.read_version_flags()?;
    if flags & 1 != 0 {
        r.skip(8)?; // aux_info_type, aux_info_type_parameter
    }
    let default_sample_info_size = r.read_u8()?;
    let sample_count = r.read_u32_be()?;
    let mut sample_info_sizes = Vec::new();
    if default_sample_info_size == 0 {
        sample_info_sizes = r
            .read_bytes(usize::try_from(sample_count).expect("u32 fits usize"))?
            .to_vec();
    }
    fragment.saiz = Some(Saiz {
        default_sample_info_size,
        sample_info_sizes,
    });
    Ok(())
}

fn parse_saio(r: &mut BytesReader, fragment: &mut Fragment) -> Result<(), ReadError> {
    let (version, flags) = r.read_version_flags()?;
    if flags & 1 != 0 {
        r.skip(8)?;
    }
    let entry_count = r.read_u32_be()?;
    let mut offsets = Vec::with_capacity(usize::try_from(entry_count.min(1 << 20)).expect("bounded"));
    for _ in 0..entry_count {
        if version == 1 {
            offsets.push(r.read_u64_be()?);
        } else {
            offsets.push(u64::from(r.read_u32_be()?));
        }
    }
    fragment.saio = Some(Saio { offsets });
    Ok(())
}

fn parse_sample_encryption(r: &mut BytesReader, fragment: &mut Fragment) -> Result<(), ReadError> {
    let (_version, flags) = r.read_version_flags()?;
    if flags & SAMPLE_ENCRYPTION_OVERRIDE_PARAMETERS != 0 {
        let _algorithm_id = r.read_u24_be()?;
        let _iv_size = r.read_u8()?;
        r.skip(16)?; // kid
    }
    let sample_count = r.read_u32_be()?;
    let mut samples = Vec::with_capacity(usize::try_from(sample_count.min(1 << 20)).expect("bounded"));
    for _ in 0..sample_count {
        let iv = r.read_u64_be()?;
        let mut subsamples = Vec::new();
        if flags & SAMPLE_ENCRYPTION_SUBSAMPLES != 0 {
            let num_entries = r.read_u16_be()?;
            for _ in 0..num_entries {
                subsamples.push(SampleEncryptionSubsample {
                    bytes_of_clear_data: r.read_u16_be()?,
                    bytes_of_encrypted_data: r.read_u32_be()?,
                });
            }
        }
        samples.push(SampleEncryptionSample { iv, subsamples });
    }
    fragment.sample_encryption = Some(SampleEncryptionTable {
        with_subsamples: flags & SAMPLE_ENCRYPTION_SUBSAMPLES != 0,
        samples,
    });
    Ok(())
}
