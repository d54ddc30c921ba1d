// SPDX-License-Identifier: GPL-2.0-or-later

#[cfg(test)]
mod test;

use std::io::Write;

use thiserror::Error;

// Mpeg box type.
pub type BoxType = [u8; 4];

// ImmutableBox is the common trait of boxes.
pub trait ImmutableBox {
    // Type returns the BoxType.
    fn box_type(&self) -> BoxType;

    // Size returns the marshaled size in bytes.
    // The size must be known before marshaling
    // since the box header contains the size.
    fn size(&self) -> usize;

    // Marshal box to writer.
    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error>;
}

#[derive(Debug, Error)]
pub enum Mp4Error {
    #[error("write: {0}")]
    Write(#[from] std::io::Error),

    #[error("from int: {0} {1}")]
    FromInt(String, std::num::TryFromIntError),
}

// Tree of boxes that can be marshaled together.
pub struct Boxes {
    pub mp4_box: Box<dyn ImmutableBox>,
    pub children: Vec<Boxes>,
}

impl Boxes {
    #[must_use]
    pub fn new<T: Into<Box<dyn ImmutableBox>>>(mp4_box: T) -> Self {
        Self {
            mp4_box: mp4_box.into(),
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_child(mut self, child: Boxes) -> Self {
        self.children.push(child);
        self
    }

    #[must_use]
    pub fn with_children(mut self, children: Vec<Boxes>) -> Self {
        self.children.extend(children);
        self
    }

    // Size returns the total size of the box including children.
    #[must_use]
    pub fn size(&self) -> usize {
        let mut total = self.mp4_box.size() + 8;

        for child in &self.children {
            total += child.size();
        }

        total
    }

    // Marshal box including children.
    pub fn marshal<W: Write>(&self, w: &mut W) -> Result<(), Mp4Error> {
        let size = self.size();

        write_box_info(w, size, self.mp4_box.box_type())?;

        // The size of a empty box is 8 bytes.
        if size != 8 {
            self.mp4_box.marshal(w)?;
        }

        for child in &self.children {
            child.marshal(w)?;
        }
        Ok(())
    }
}

pub fn write_box_info<W: Write>(w: &mut W, size: usize, typ: BoxType) -> Result<(), Mp4Error> {
    w.write_all(
        &u32::try_from(size)
            .map_err(|e| Mp4Error::FromInt("write box info".to_owned(), e))?
            .to_be_bytes(),
    )?;
    w.write_all(&typ)?;
    Ok(())
}

pub fn write_single_box<W: Write>(w: &mut W, b: &dyn ImmutableBox) -> Result<usize, Mp4Error> {
    let size = 8 + b.size();

    write_box_info(w, size, b.box_type())?;

    // The size of a empty box is 8 bytes.
    if size != 8 {
        b.marshal(w)?;
    }
    Ok(size)
}

/************************* FullBox **************************/

#[derive(Clone, Copy, Default)]
pub struct FullBox {
    pub version: u8,
    pub flags: [u8; 3],
}

impl FullBox {
    fn get_flags(self) -> u32 {
        parse_fullbox_flags(self.flags)
    }

    fn check_flag(self, flag: u32) -> bool {
        self.get_flags() & flag != 0
    }

    pub fn marshal_field(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        w.write_all(&[self.version])?;
        w.write_all(&self.flags)?;
        Ok(())
    }
}

fn parse_fullbox_flags(flags: [u8; 3]) -> u32 {
    (u32::from(flags[0]) << 16) ^ (u32::from(flags[1]) << 8) ^ (u32::from(flags[2]))
}

fn check_fullbox_flag(flags: [u8; 3], flag: u32) -> bool {
    let flags = parse_fullbox_flags(flags);
    flags & flag != 0
}

#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
pub fn u32_to_flags(v: u32) -> [u8; 3] {
    [(v >> 16) as u8, (v >> 8) as u8, v as u8]
}

/*************************** raw ****************************/

// Box with an externally produced payload, e.g. an avcC
// configuration record copied out of a source file.
pub struct RawBox {
    pub typ: BoxType,
    pub data: Vec<u8>,
}

impl ImmutableBox for RawBox {
    fn box_type(&self) -> BoxType {
        self.typ
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        w.write_all(&self.data)?;
        Ok(())
    }
}

impl From<RawBox> for Box<dyn ImmutableBox> {
    fn from(value: RawBox) -> Self {
        Box::new(value)
    }
}

/*************************** btrt ****************************/

pub const TYPE_BTRT: BoxType = *b"btrt";

pub struct Btrt {
    pub buffer_size_db: u32,
    pub max_bitrate: u32,
    pub avg_bitrate: u32,
}

impl ImmutableBox for Btrt {
    fn box_type(&self) -> BoxType {
        TYPE_BTRT
    }

    fn size(&self) -> usize {
        12
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        w.write_all(&self.buffer_size_db.to_be_bytes())?;
        w.write_all(&self.max_bitrate.to_be_bytes())?;
        w.write_all(&self.avg_bitrate.to_be_bytes())?;
        Ok(())
    }
}

impl From<Btrt> for Box<dyn ImmutableBox> {
    fn from(value: Btrt) -> Self {
        Box::new(value)
    }
}

/*************************** dinf ****************************/

pub const TYPE_DINF: BoxType = *b"dinf";

pub struct Dinf;

impl ImmutableBox for Dinf {
    fn box_type(&self) -> BoxType {
        TYPE_DINF
    }

    fn size(&self) -> usize {
        0
    }

    fn marshal(&self, _: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        Ok(())
    }
}

impl From<Dinf> for Box<dyn ImmutableBox> {
    fn from(value: Dinf) -> Self {
        Box::new(value)
    }
}

/*************************** dref ****************************/

pub const TYPE_DREF: BoxType = *b"dref";

pub struct Dref {
    pub full_box: FullBox,
    pub entry_count: u32,
}

impl ImmutableBox for Dref {
    fn box_type(&self) -> BoxType {
        TYPE_DREF
    }

    fn size(&self) -> usize {
        8
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.entry_count.to_be_bytes())?;
        Ok(())
    }
}

impl From<Dref> for Box<dyn ImmutableBox> {
    fn from(value: Dref) -> Self {
        Box::new(value)
    }
}

/*************************** url ****************************/

pub const TYPE_URL: BoxType = *b"url ";

pub struct Url {
    pub full_box: FullBox,
    pub location: String,
}

pub const URL_NOPT: u32 = 0x0000_0001;

impl ImmutableBox for Url {
    fn box_type(&self) -> BoxType {
        TYPE_URL
    }

    fn size(&self) -> usize {
        if self.full_box.check_flag(URL_NOPT) {
            4
        } else {
            self.location.len() + 5
        }
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        if !self.full_box.check_flag(URL_NOPT) {
            w.write_all((self.location.clone() + "\0").as_bytes())?;
        }
        Ok(())
    }
}

impl From<Url> for Box<dyn ImmutableBox> {
    fn from(value: Url) -> Self {
        Box::new(value)
    }
}

/*************************** ftyp ****************************/

pub const TYPE_FTYP: BoxType = *b"ftyp";

pub struct Ftyp {
    pub major_brand: [u8; 4],
    pub minor_version: u32,
    pub compatible_brands: Vec<CompatibleBrandElem>,
}

#[repr(transparent)]
pub struct CompatibleBrandElem(pub [u8; 4]);

impl ImmutableBox for Ftyp {
    fn box_type(&self) -> BoxType {
        TYPE_FTYP
    }

    fn size(&self) -> usize {
        8 + self.compatible_brands.len() * 4
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        w.write_all(&self.major_brand)?;
        w.write_all(&self.minor_version.to_be_bytes())?;
        for brands in &self.compatible_brands {
            w.write_all(&brands.0)?;
        }
        Ok(())
    }
}

impl From<Ftyp> for Box<dyn ImmutableBox> {
    fn from(value: Ftyp) -> Self {
        Box::new(value)
    }
}

/*************************** hdlr ****************************/

pub const TYPE_HDLR: BoxType = *b"hdlr";

#[derive(Default)]
pub struct Hdlr {
    pub full_box: FullBox,
    pub pre_defined: u32,
    pub handler_type: [u8; 4],
    pub reserved: [u32; 3],
    pub name: String,
}

impl ImmutableBox for Hdlr {
    fn box_type(&self) -> BoxType {
        TYPE_HDLR
    }

    fn size(&self) -> usize {
        25 + self.name.len()
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.pre_defined.to_be_bytes())?;
        w.write_all(&self.handler_type)?;
        for reserved in &self.reserved {
            w.write_all(&reserved.to_be_bytes())?;
        }
        w.write_all((self.name.clone() + "\0").as_bytes())?;
        Ok(())
    }
}

impl From<Hdlr> for Box<dyn ImmutableBox> {
    fn from(value: Hdlr) -> Self {
        Box::new(value)
    }
}

/*************************** mdat ****************************/

pub const TYPE_MDAT: BoxType = *b"mdat";

pub struct Mdat(pub Vec<u8>);

impl ImmutableBox for Mdat {
    fn box_type(&self) -> BoxType {
        TYPE_MDAT
    }

    fn size(&self) -> usize {
        self.0.len()
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        w.write_all(&self.0)?;
        Ok(())
    }
}

impl From<Mdat> for Box<dyn ImmutableBox> {
    fn from(value: Mdat) -> Self {
        Box::new(value)
    }
}

/*************************** mdia ****************************/

pub const TYPE_MDIA: BoxType = *b"mdia";

pub struct Mdia;

impl ImmutableBox for Mdia {
    fn box_type(&self) -> BoxType {
        TYPE_MDIA
    }

    fn size(&self) -> usize {
        0
    }

    fn marshal(&self, _: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        Ok(())
    }
}

impl From<Mdia> for Box<dyn ImmutableBox> {
    fn from(value: Mdia) -> Self {
        Box::new(value)
    }
}

/*************************** mdhd ****************************/

pub const TYPE_MDHD: BoxType = *b"mdhd";

#[derive(Default)]
pub struct Mdhd {
    pub flags: [u8; 3],
    pub version: MdhdVersion,
    pub timescale: u32,

    pub pad: bool,         // 1 bit.
    pub language: [u8; 3], // 5 bits. ISO-639-2/T language code
    pub pre_defined: u16,
}

pub enum MdhdVersion {
    V0(MdhdV0),
    V1(MdhdV1),
}

impl Default for MdhdVersion {
    fn default() -> Self {
        Self::V0(MdhdV0::default())
    }
}

#[derive(Default)]
pub struct MdhdV0 {
    pub creation_time: u32,
    pub modification_time: u32,
    pub duration: u32,
}

pub struct MdhdV1 {
    pub creation_time: u64,
    pub modification_time: u64,
    pub duration: u64,
}

impl ImmutableBox for Mdhd {
    fn box_type(&self) -> BoxType {
        TYPE_MDHD
    }

    fn size(&self) -> usize {
        match self.version {
            MdhdVersion::V0(_) => 24,
            MdhdVersion::V1(_) => 36,
        }
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        match &self.version {
            MdhdVersion::V0(v) => {
                w.write_all(&[0])?;
                w.write_all(&self.flags)?;
                w.write_all(&v.creation_time.to_be_bytes())?;
                w.write_all(&v.modification_time.to_be_bytes())?;
                w.write_all(&self.timescale.to_be_bytes())?;
                w.write_all(&v.duration.to_be_bytes())?;
            }
            MdhdVersion::V1(v) => {
                w.write_all(&[1])?;
                w.write_all(&self.flags)?;
                w.write_all(&v.creation_time.to_be_bytes())?;
                w.write_all(&v.modification_time.to_be_bytes())?;
                w.write_all(&self.timescale.to_be_bytes())?;
                w.write_all(&v.duration.to_be_bytes())?;
            }
        }

        if self.pad {
            w.write_all(&[(0b0000_0001 << 7
                | (self.language[0] & 0b0001_1111) << 2
                | (self.language[1] & 0b0001_1111) >> 3)])?;
        } else {
            w.write_all(&[
                ((self.language[0] & 0b0001_1111) << 2 | (self.language[1] & 0b0001_1111) >> 3)
            ])?;
        }

        w.write_all(&[(self.language[1] << 5 | self.language[2] & 0b0001_1111)])?;
        w.write_all(&self.pre_defined.to_be_bytes())?;
        Ok(())
    }
}

impl From<Mdhd> for Box<dyn ImmutableBox> {
    fn from(value: Mdhd) -> Self {
        Box::new(value)
    }
}

/*************************** mehd ****************************/

pub const TYPE_MEHD: BoxType = *b"mehd";

pub struct Mehd {
    pub full_box: FullBox,
    pub fragment_duration: u32,
}

impl ImmutableBox for Mehd {
    fn box_type(&self) -> BoxType {
        TYPE_MEHD
    }

    fn size(&self) -> usize {
        8
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.fragment_duration.to_be_bytes())?;
        Ok(())
    }
}

impl From<Mehd> for Box<dyn ImmutableBox> {
    fn from(value: Mehd) -> Self {
        Box::new(value)
    }
}

/*************************** mfhd ****************************/

pub const TYPE_MFHD: BoxType = *b"mfhd";

pub struct Mfhd {
    pub full_box: FullBox,
    pub sequence_number: u32,
}

impl ImmutableBox for Mfhd {
    fn box_type(&self) -> BoxType {
        TYPE_MFHD
    }

    fn size(&self) -> usize {
        8
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.sequence_number.to_be_bytes())?;
        Ok(())
    }
}

impl From<Mfhd> for Box<dyn ImmutableBox> {
    fn from(value: Mfhd) -> Self {
        Box::new(value)
    }
}

/*************************** minf ****************************/

pub const TYPE_MINF: BoxType = *b"minf";

pub struct Minf;

impl ImmutableBox for Minf {
    fn box_type(&self) -> BoxType {
        TYPE_MINF
    }

    fn size(&self) -> usize {
        0
    }

    fn marshal(&self, _: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        Ok(())
    }
}

impl From<Minf> for Box<dyn ImmutableBox> {
    fn from(value: Minf) -> Self {
        Box::new(value)
    }
}

/*************************** moof ****************************/

pub const TYPE_MOOF: BoxType = *b"moof";

pub struct Moof;

impl ImmutableBox for Moof {
    fn box_type(&self) -> BoxType {
        TYPE_MOOF
    }

    fn size(&self) -> usize {
        0
    }

    fn marshal(&self, _: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        Ok(())
    }
}

impl From<Moof> for Box<dyn ImmutableBox> {
    fn from(value: Moof) -> Self {
        Box::new(value)
    }
}

/*************************** moov ****************************/

pub const TYPE_MOOV: BoxType = *b"moov";

pub struct Moov;

impl ImmutableBox for Moov {
    fn box_type(&self) -> BoxType {
        TYPE_MOOV
    }

    fn size(&self) -> usize {
        0
    }

    fn marshal(&self, _: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        Ok(())
    }
}

impl From<Moov> for Box<dyn ImmutableBox> {
    fn from(value: Moov) -> Self {
        Box::new(value)
    }
}

/*************************** mvex ****************************/

pub const TYPE_MVEX: BoxType = *b"mvex";

pub struct Mvex;

impl ImmutableBox for Mvex {
    fn box_type(&self) -> BoxType {
        TYPE_MVEX
    }

    fn size(&self) -> usize {
        0
    }

    fn marshal(&self, _: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        Ok(())
    }
}

impl From<Mvex> for Box<dyn ImmutableBox> {
    fn from(value: Mvex) -> Self {
        Box::new(value)
    }
}

/*************************** mvhd ****************************/

pub const TYPE_MVHD: BoxType = *b"mvhd";

#[derive(Default)]
pub struct Mvhd {
    pub flags: [u8; 3],
    pub version: MvhdVersion,
    pub timescale: u32,
    pub rate: i32,   // fixed-point 16.16 - template=0x00010000
    pub volume: i16, // template=0x0100
    pub reserved: i16,
    pub reserved2: [i32; 2],
    pub matrix: [i32; 9], // template={ 0x00010000,0,0,0,0x00010000,0,0,0,0x40000000 }
    pub pre_defined: [i32; 6],
    pub next_track_id: u32,
}

pub enum MvhdVersion {
    V0(MvhdV0),
    V1(MvhdV1),
}

impl Default for MvhdVersion {
    fn default() -> Self {
        Self::V0(MvhdV0::default())
    }
}

#[derive(Default)]
pub struct MvhdV0 {
    pub creation_time: u32,
    pub modification_time: u32,
    pub duration: u32,
}

pub struct MvhdV1 {
    pub creation_time: u64,
    pub modification_time: u64,
    pub duration: u64,
}

impl ImmutableBox for Mvhd {
    fn box_type(&self) -> BoxType {
        TYPE_MVHD
    }

    fn size(&self) -> usize {
        match self.version {
            MvhdVersion::V0(_) => 100,
            MvhdVersion::V1(_) => 112,
        }
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        match &self.version {
            MvhdVersion::V0(v) => {
                w.write_all(&[0])?;
                w.write_all(&self.flags)?;
                w.write_all(&v.creation_time.to_be_bytes())?;
                w.write_all(&v.modification_time.to_be_bytes())?;
                w.write_all(&self.timescale.to_be_bytes())?;
                w.write_all(&v.duration.to_be_bytes())?;
            }
            MvhdVersion::V1(v) => {
                w.write_all(&[1])?;
                w.write_all(&self.flags)?;
                w.write_all(&v.creation_time.to_be_bytes())?;
                w.write_all(&v.modification_time.to_be_bytes())?;
                w.write_all(&self.timescale.to_be_bytes())?;
                w.write_all(&v.duration.to_be_bytes())?;
            }
        }

        w.write_all(&self.rate.to_be_bytes())?;
        w.write_all(&self.volume.to_be_bytes())?;
        w.write_all(&self.reserved.to_be_bytes())?;

        for reserved in &self.reserved2 {
            w.write_all(&reserved.to_be_bytes())?;
        }
        for matrix in &self.matrix {
            w.write_all(&matrix.to_be_bytes())?;
        }
        for pre_defined in &self.pre_defined {
            w.write_all(&pre_defined.to_be_bytes())?;
        }

        w.write_all(&self.next_track_id.to_be_bytes())?;

        Ok(())
    }
}

impl From<Mvhd> for Box<dyn ImmutableBox> {
    fn from(value: Mvhd) -> Self {
        Box::new(value)
    }
}

/*********************** SampleEntry *************************/

#[derive(Default)]
pub struct SampleEntry {
    pub reserved: [u8; 6],
    pub data_reference_index: u16,
}

impl SampleEntry {
    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        for reserved in &self.reserved {
            w.write_all(&reserved.to_be_bytes())?;
        }
        w.write_all(&self.data_reference_index.to_be_bytes())?;
        Ok(())
    }
}

/*********************** avc1 *************************/

pub const TYPE_AVC1: BoxType = *b"avc1";

#[derive(Default)]
pub struct Avc1 {
    pub sample_entry: SampleEntry,
    pub pre_defined: u16,
    pub reserved: u16,
    pub pre_defined2: [u32; 3],
    pub width: u16,
    pub height: u16,
    pub horiz_resolution: u32,
    pub vert_resolution: u32,
    pub reserved2: u32,
    pub frame_count: u16,
    pub compressor_name: [u8; 32],
    pub depth: u16,
    pub pre_defined3: i16,
}

impl ImmutableBox for Avc1 {
    fn box_type(&self) -> BoxType {
        TYPE_AVC1
    }

    fn size(&self) -> usize {
        78
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.sample_entry.marshal(w)?;
        w.write_all(&self.pre_defined.to_be_bytes())?;
        w.write_all(&self.reserved.to_be_bytes())?;
        for pre_defined in &self.pre_defined2 {
            w.write_all(&pre_defined.to_be_bytes())?;
        }
        w.write_all(&self.width.to_be_bytes())?;
        w.write_all(&self.height.to_be_bytes())?;
        w.write_all(&self.horiz_resolution.to_be_bytes())?;
        w.write_all(&self.vert_resolution.to_be_bytes())?;
        w.write_all(&self.reserved2.to_be_bytes())?;
        w.write_all(&self.frame_count.to_be_bytes())?;
        w.write_all(&self.compressor_name)?;
        w.write_all(&self.depth.to_be_bytes())?;
        w.write_all(&self.pre_defined3.to_be_bytes())?;
        Ok(())
    }
}

impl From<Avc1> for Box<dyn ImmutableBox> {
    fn from(value: Avc1) -> Self {
        Box::new(value)
    }
}

/*************************** mp4a ****************************/

pub const TYPE_MP4A: BoxType = *b"mp4a";

#[derive(Default)]
pub struct Mp4a {
    pub sample_entry: SampleEntry,
    pub reserved: [u32; 2],
    pub channel_count: u16,
    pub sample_size: u16,
    pub pre_defined: u16,
    pub reserved2: u16,
    pub sample_rate: u32, // fixed-point 16.16
}

impl ImmutableBox for Mp4a {
    fn box_type(&self) -> BoxType {
        TYPE_MP4A
    }

    fn size(&self) -> usize {
        28
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.sample_entry.marshal(w)?;
        for reserved in &self.reserved {
            w.write_all(&reserved.to_be_bytes())?;
        }
        w.write_all(&self.channel_count.to_be_bytes())?;
        w.write_all(&self.sample_size.to_be_bytes())?;
        w.write_all(&self.pre_defined.to_be_bytes())?;
        w.write_all(&self.reserved2.to_be_bytes())?;
        w.write_all(&self.sample_rate.to_be_bytes())?;
        Ok(())
    }
}

impl From<Mp4a> for Box<dyn ImmutableBox> {
    fn from(value: Mp4a) -> Self {
        Box::new(value)
    }
}

/*************************** esds ****************************/

pub const TYPE_ESDS: BoxType = *b"esds";

pub const ES_DESCR_TAG: u8 = 0x03;
pub const DECODER_CONFIG_DESCR_TAG: u8 = 0x04;
pub const DEC_SPECIFIC_INFO_TAG: u8 = 0x05;
pub const SL_CONFIG_DESCR_TAG: u8 = 0x06;

// MPEG-4 elementary stream descriptor with a single decoder
// specific info blob. Descriptor lengths use the single-byte
// form, limiting the decoder config to 127 bytes.
pub struct Esds {
    pub full_box: FullBox,
    pub es_id: u16,
    pub object_type_indication: u8,
    pub stream_type: u8,
    pub buffer_size_db: u32, // 24 bits on the wire.
    pub max_bitrate: u32,
    pub avg_bitrate: u32,
    pub decoder_config: Vec<u8>,
}

impl Esds {
    fn dec_specific_size(&self) -> usize {
        2 + self.decoder_config.len()
    }

    fn decoder_config_size(&self) -> usize {
        2 + 13 + self.dec_specific_size()
    }

    fn es_descr_payload(&self) -> usize {
        // es_id + flags, nested decoder config, SLConfig.
        3 + self.decoder_config_size() + 3
    }
}

impl ImmutableBox for Esds {
    fn box_type(&self) -> BoxType {
        TYPE_ESDS
    }

    fn size(&self) -> usize {
        4 + 2 + self.es_descr_payload()
    }

    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;

        w.write_all(&[ES_DESCR_TAG, self.es_descr_payload() as u8])?;
        w.write_all(&self.es_id.to_be_bytes())?;
        w.write_all(&[0])?; // No optional ES descriptor fields.

        w.write_all(&[
            DECODER_CONFIG_DESCR_TAG,
            (13 + self.dec_specific_size()) as u8,
        ])?;
        w.write_all(&[self.object_type_indication, self.stream_type])?;
        w.write_all(&self.buffer_size_db.to_be_bytes()[1..])?;
        w.write_all(&self.max_bitrate.to_be_bytes())?;
        w.write_all(&self.avg_bitrate.to_be_bytes())?;

        w.write_all(&[DEC_SPECIFIC_INFO_TAG, self.decoder_config.len() as u8])?;
        w.write_all(&self.decoder_config)?;

        w.write_all(&[SL_CONFIG_DESCR_TAG, 1, 0x02])?;
        Ok(())
    }
}

impl From<Esds> for Box<dyn ImmutableBox> {
    fn from(value: Esds) -> Self {
        Box::new(value)
    }
}

/*************************** smhd ****************************/

pub const TYPE_SMHD: BoxType = *b"smhd";

#[derive(Default)]
pub struct Smhd {
    pub full_box: FullBox,
    pub balance: i16, // fixed-point 8.8, template=0
    pub reserved: u16,
}

impl ImmutableBox for Smhd {
    fn box_type(&self) -> BoxType {
        TYPE_SMHD
    }

    fn size(&self) -> usize {
        8
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.balance.to_be_bytes())?;
        w.write_all(&self.reserved.to_be_bytes())?;
        Ok(())
    }
}

impl From<Smhd> for Box<dyn ImmutableBox> {
    fn from(value: Smhd) -> Self {
        Box::new(value)
    }
}

/*************************** stbl ****************************/

pub const TYPE_STBL: BoxType = *b"stbl";

pub struct Stbl;

impl ImmutableBox for Stbl {
    fn box_type(&self) -> BoxType {
        TYPE_STBL
    }

    fn size(&self) -> usize {
        0
    }

    fn marshal(&self, _: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        Ok(())
    }
}

impl From<Stbl> for Box<dyn ImmutableBox> {
    fn from(value: Stbl) -> Self {
        Box::new(value)
    }
}

/*************************** stco ****************************/

pub const TYPE_STCO: BoxType = *b"stco";

#[derive(Default)]
pub struct Stco {
    pub full_box: FullBox,
    pub chunk_offsets: Vec<u32>,
}

impl ImmutableBox for Stco {
    fn box_type(&self) -> BoxType {
        TYPE_STCO
    }

    fn size(&self) -> usize {
        8 + (self.chunk_offsets.len()) * 4
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(
            &u32::try_from(self.chunk_offsets.len())
                .map_err(|e| Mp4Error::FromInt("stco".to_owned(), e))?
                .to_be_bytes(),
        )?;
        for offset in &self.chunk_offsets {
            w.write_all(&offset.to_be_bytes())?;
        }
        Ok(())
    }
}

impl From<Stco> for Box<dyn ImmutableBox> {
    fn from(value: Stco) -> Self {
        Box::new(value)
    }
}

/*************************** stsc ****************************/

pub const TYPE_STSC: BoxType = *b"stsc";

#[derive(Debug, Clone, Copy)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_index: u32,
}

impl StscEntry {
    fn marshal_field(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        w.write_all(&self.first_chunk.to_be_bytes())?;
        w.write_all(&self.samples_per_chunk.to_be_bytes())?;
        w.write_all(&self.sample_description_index.to_be_bytes())?;
        Ok(())
    }
}

#[derive(Default)]
pub struct Stsc {
    pub full_box: FullBox,
    pub entries: Vec<StscEntry>,
}

impl ImmutableBox for Stsc {
    fn box_type(&self) -> BoxType {
        TYPE_STSC
    }

    fn size(&self) -> usize {
        8 + self.entries.len() * 12
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(
            &u32::try_from(self.entries.len())
                .map_err(|e| Mp4Error::FromInt("stsc".to_owned(), e))?
                .to_be_bytes(),
        )?;
        for entry in &self.entries {
            entry.marshal_field(w)?;
        }
        Ok(())
    }
}

impl From<Stsc> for Box<dyn ImmutableBox> {
    fn from(value: Stsc) -> Self {
        Box::new(value)
    }
}

/*************************** stsd ****************************/

pub const TYPE_STSD: BoxType = *b"stsd";

pub struct Stsd {
    pub full_box: FullBox,
    pub entry_count: u32,
}

impl ImmutableBox for Stsd {
    fn box_type(&self) -> BoxType {
        TYPE_STSD
    }

    fn size(&self) -> usize {
        8
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.entry_count.to_be_bytes())?;
        Ok(())
    }
}

impl From<Stsd> for Box<dyn ImmutableBox> {
    fn from(value: Stsd) -> Self {
        Box::new(value)
    }
}

/*************************** stss ****************************/

pub const TYPE_STSS: BoxType = *b"stss";

pub struct Stss {
    pub full_box: FullBox,
    pub sample_numbers: Vec<u32>,
}

impl ImmutableBox for Stss {
    fn box_type(&self) -> BoxType {
        TYPE_STSS
    }

    fn size(&self) -> usize {
        8 + self.sample_numbers.len() * 4
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(
            &u32::try_from(self.sample_numbers.len())
                .map_err(|e| Mp4Error::FromInt("stss".to_owned(), e))?
                .to_be_bytes(),
        )?;
        for number in &self.sample_numbers {
            w.write_all(&number.to_be_bytes())?;
        }
        Ok(())
    }
}

impl From<Stss> for Box<dyn ImmutableBox> {
    fn from(value: Stss) -> Self {
        Box::new(value)
    }
}

/*************************** stsz ****************************/

pub const TYPE_STSZ: BoxType = *b"stsz";

#[derive(Default)]
pub struct Stsz {
    pub full_box: FullBox,
    pub sample_size: u32,
    pub sample_count: u32,
    pub entry_sizes: Vec<u32>,
}

impl ImmutableBox for Stsz {
    fn box_type(&self) -> BoxType {
        TYPE_STSZ
    }

    fn size(&self) -> usize {
        12 + self.entry_sizes.len() * 4
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.sample_size.to_be_bytes())?;
        w.write_all(&self.sample_count.to_be_bytes())?;
        for entry in &self.entry_sizes {
            w.write_all(&entry.to_be_bytes())?;
        }
        Ok(())
    }
}

impl From<Stsz> for Box<dyn ImmutableBox> {
    fn from(value: Stsz) -> Self {
        Box::new(value)
    }
}

/*************************** stts ****************************/

pub const TYPE_STTS: BoxType = *b"stts";

#[derive(Default)]
pub struct Stts {
    pub full_box: FullBox,
    pub entries: Vec<SttsEntry>,
}

#[derive(Debug, Clone)]
pub struct SttsEntry {
    pub sample_count: u32,
    pub sample_delta: u32,
}

impl SttsEntry {
    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        w.write_all(&self.sample_count.to_be_bytes())?;
        w.write_all(&self.sample_delta.to_be_bytes())?;
        Ok(())
    }
}

impl ImmutableBox for Stts {
    fn box_type(&self) -> BoxType {
        TYPE_STTS
    }

    fn size(&self) -> usize {
        8 + self.entries.len() * 8
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(
            &u32::try_from(self.entries.len())
                .map_err(|e| Mp4Error::FromInt("stts".to_owned(), e))?
                .to_be_bytes(),
        )?;
        for entry in &self.entries {
            entry.marshal(w)?;
        }
        Ok(())
    }
}

impl From<Stts> for Box<dyn ImmutableBox> {
    fn from(value: Stts) -> Self {
        Box::new(value)
    }
}

/*************************** sidx ****************************/

pub const TYPE_SIDX: BoxType = *b"sidx";

pub struct Sidx {
    pub full_box: FullBox,
    pub reference_id: u32,
    pub timescale: u32,
    pub earliest_presentation_time: u32,
    pub first_offset: u32,
    pub entries: Vec<SidxEntry>,
}

pub struct SidxEntry {
    pub reference_type: bool, // 1 bit, true=sidx false=media.
    pub referenced_size: u32, // 31 bits.
    pub subsegment_duration: u32,
    pub starts_with_sap: bool, // 1 bit.
    pub sap_type: u8,          // 3 bits.
    pub sap_delta_time: u32,   // 28 bits.
}

impl SidxEntry {
    fn marshal_field(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        let mut word = self.referenced_size & 0x7fff_ffff;
        if self.reference_type {
            word |= 1 << 31;
        }
        w.write_all(&word.to_be_bytes())?;
        w.write_all(&self.subsegment_duration.to_be_bytes())?;

        let mut sap = (u32::from(self.sap_type & 0b111) << 28) | (self.sap_delta_time & 0x0fff_ffff);
        if self.starts_with_sap {
            sap |= 1 << 31;
        }
        w.write_all(&sap.to_be_bytes())?;
        Ok(())
    }
}

impl ImmutableBox for Sidx {
    fn box_type(&self) -> BoxType {
        TYPE_SIDX
    }

    fn size(&self) -> usize {
        24 + self.entries.len() * 12
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.reference_id.to_be_bytes())?;
        w.write_all(&self.timescale.to_be_bytes())?;
        w.write_all(&self.earliest_presentation_time.to_be_bytes())?;
        w.write_all(&self.first_offset.to_be_bytes())?;
        w.write_all(&0u16.to_be_bytes())?;
        w.write_all(
            &u16::try_from(self.entries.len())
                .map_err(|e| Mp4Error::FromInt("sidx".to_owned(), e))?
                .to_be_bytes(),
        )?;
        for entry in &self.entries {
            entry.marshal_field(w)?;
        }
        Ok(())
    }
}

impl From<Sidx> for Box<dyn ImmutableBox> {
    fn from(value: Sidx) -> Self {
        Box::new(value)
    }
}

/*************************** pssh ****************************/

pub const TYPE_PSSH: BoxType = *b"pssh";

pub struct Pssh {
    pub full_box: FullBox,
    pub system_id: [u8; 16],
    pub data: Vec<u8>,
}

impl ImmutableBox for Pssh {
    fn box_type(&self) -> BoxType {
        TYPE_PSSH
    }

    fn size(&self) -> usize {
        24 + self.data.len()
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.system_id)?;
        w.write_all(
            &u32::try_from(self.data.len())
                .map_err(|e| Mp4Error::FromInt("pssh".to_owned(), e))?
                .to_be_bytes(),
        )?;
        w.write_all(&self.data)?;
        Ok(())
    }
}

impl From<Pssh> for Box<dyn ImmutableBox> {
    fn from(value: Pssh) -> Self {
        Box::new(value)
    }
}

/*************************** tfdt ****************************/

pub const TYPE_TFDT: BoxType = *b"tfdt";

pub struct Tfdt {
    pub flags: [u8; 3],
    pub base_media_decode_time: TfdtBaseMediaDecodeTime,
}

pub enum TfdtBaseMediaDecodeTime {
    V0(u32),
    V1(u64),
}

impl ImmutableBox for Tfdt {
    fn box_type(&self) -> BoxType {
        TYPE_TFDT
    }

    fn size(&self) -> usize {
        match self.base_media_decode_time {
            TfdtBaseMediaDecodeTime::V0(_) => 8,
            TfdtBaseMediaDecodeTime::V1(_) => 12,
        }
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        match self.base_media_decode_time {
            TfdtBaseMediaDecodeTime::V0(v) => {
                w.write_all(&[0])?;
                w.write_all(&self.flags)?;
                w.write_all(&v.to_be_bytes())?;
            }
            TfdtBaseMediaDecodeTime::V1(v) => {
                w.write_all(&[1])?;
                w.write_all(&self.flags)?;
                w.write_all(&v.to_be_bytes())?;
            }
        }
        Ok(())
    }
}

impl From<Tfdt> for Box<dyn ImmutableBox> {
    fn from(value: Tfdt) -> Self {
        Box::new(value)
    }
}

/*************************** tfhd ****************************/

pub const TYPE_TFHD: BoxType = *b"tfhd";

#[derive(Default)]
pub struct Tfhd {
    pub full_box: FullBox,
    pub track_id: u32,

    // optional
    pub base_data_offset: u64,
    pub sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

pub const TFHD_BASE_DATA_OFFSET_PRESENT: u32 = 0x0000_0001;
pub const TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT: u32 = 0x0000_0002;
pub const TFHD_DEFAULT_SAMPLE_DURATION_PRESENT: u32 = 0x0000_0008;
pub const TFHD_DEFAULT_SAMPLE_SIZE_PRESENT: u32 = 0x0000_0010;
pub const TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT: u32 = 0x0000_0020;

impl ImmutableBox for Tfhd {
    fn box_type(&self) -> BoxType {
        TYPE_TFHD
    }

    fn size(&self) -> usize {
        let mut total: usize = 8;
        if self.full_box.check_flag(TFHD_BASE_DATA_OFFSET_PRESENT) {
            total += 8;
        }
        if self
            .full_box
            .check_flag(TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT)
        {
            total += 4;
        }
        if self
            .full_box
            .check_flag(TFHD_DEFAULT_SAMPLE_DURATION_PRESENT)
        {
            total += 4;
        }
        if self.full_box.check_flag(TFHD_DEFAULT_SAMPLE_SIZE_PRESENT) {
            total += 4;
        }
        if self.full_box.check_flag(TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT) {
            total += 4;
        }
        total
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.track_id.to_be_bytes())?;
        if self.full_box.check_flag(TFHD_BASE_DATA_OFFSET_PRESENT) {
            w.write_all(&self.base_data_offset.to_be_bytes())?;
        }
        if self
            .full_box
            .check_flag(TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT)
        {
            w.write_all(&self.sample_description_index.to_be_bytes())?;
        }
        if self
            .full_box
            .check_flag(TFHD_DEFAULT_SAMPLE_DURATION_PRESENT)
        {
            w.write_all(&self.default_sample_duration.to_be_bytes())?;
        }
        if self.full_box.check_flag(TFHD_DEFAULT_SAMPLE_SIZE_PRESENT) {
            w.write_all(&self.default_sample_size.to_be_bytes())?;
        }
        if self.full_box.check_flag(TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT) {
            w.write_all(&self.default_sample_flags.to_be_bytes())?;
        }
        Ok(())
    }
}

impl From<Tfhd> for Box<dyn ImmutableBox> {
    fn from(value: Tfhd) -> Self {
        Box::new(value)
    }
}

/*************************** tkhd ****************************/

pub const TYPE_TKHD: BoxType = *b"tkhd";

#[derive(Default)]
pub struct Tkhd {
    pub flags: [u8; 3],
    pub version: TkhdVersion,
    pub track_id: u32,
    pub reserved0: u32,
    pub reserved1: [u32; 2],
    pub layer: i16,           // template=0
    pub alternate_group: i16, // template=0
    pub volume: i16,          // template={if track_is_audio 0x0100 else 0}
    pub reserved2: u16,
    pub matrix: [i32; 9], // template={ 0x00010000,0,0,0,0x00010000,0,0,0,0x40000000 };
    pub width: u32,       // fixed-point 16.16
    pub height: u32,      // fixed-point 16.16
}

pub enum TkhdVersion {
    V0(TkhdV0),
    V1(TkhdV1),
}

impl Default for TkhdVersion {
    fn default() -> Self {
        Self::V0(TkhdV0::default())
    }
}

#[derive(Default)]
pub struct TkhdV0 {
    pub creation_time: u32,
    pub modification_time: u32,
    pub duration: u32,
}

pub struct TkhdV1 {
    pub creation_time: u64,
    pub modification_time: u64,
    pub duration: u64,
}

impl ImmutableBox for Tkhd {
    fn box_type(&self) -> BoxType {
        TYPE_TKHD
    }

    fn size(&self) -> usize {
        match self.version {
            TkhdVersion::V0(_) => 84,
            TkhdVersion::V1(_) => 96,
        }
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        match &self.version {
            TkhdVersion::V0(v) => {
                w.write_all(&[0])?;
                w.write_all(&self.flags)?;
                w.write_all(&v.creation_time.to_be_bytes())?;
                w.write_all(&v.modification_time.to_be_bytes())?;
                w.write_all(&self.track_id.to_be_bytes())?;
                w.write_all(&self.reserved0.to_be_bytes())?;
                w.write_all(&v.duration.to_be_bytes())?;
            }
            TkhdVersion::V1(v) => {
                w.write_all(&[1])?;
                w.write_all(&self.flags)?;
                w.write_all(&v.creation_time.to_be_bytes())?;
                w.write_all(&v.modification_time.to_be_bytes())?;
                w.write_all(&self.track_id.to_be_bytes())?;
                w.write_all(&self.reserved0.to_be_bytes())?;
                w.write_all(&v.duration.to_be_bytes())?;
            }
        }

        for reserved in &self.reserved1 {
            w.write_all(&reserved.to_be_bytes())?;
        }
        w.write_all(&self.layer.to_be_bytes())?;
        w.write_all(&self.alternate_group.to_be_bytes())?;
        w.write_all(&self.volume.to_be_bytes())?;
        w.write_all(&self.reserved2.to_be_bytes())?;
        for matrix in &self.matrix {
            w.write_all(&matrix.to_be_bytes())?;
        }
        w.write_all(&self.width.to_be_bytes())?;
        w.write_all(&self.height.to_be_bytes())?;

        Ok(())
    }
}

impl From<Tkhd> for Box<dyn ImmutableBox> {
    fn from(value: Tkhd) -> Self {
        Box::new(value)
    }
}

/*************************** traf ****************************/

pub const TYPE_TRAF: BoxType = *b"traf";

pub struct Traf;

impl ImmutableBox for Traf {
    fn box_type(&self) -> BoxType {
        TYPE_TRAF
    }

    fn size(&self) -> usize {
        0
    }

    fn marshal(&self, _: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        Ok(())
    }
}

impl From<Traf> for Box<dyn ImmutableBox> {
    fn from(value: Traf) -> Self {
        Box::new(value)
    }
}

/*************************** trak ****************************/

pub const TYPE_TRAK: BoxType = *b"trak";

pub struct Trak;

impl ImmutableBox for Trak {
    fn box_type(&self) -> BoxType {
        TYPE_TRAK
    }

    fn size(&self) -> usize {
        0
    }

    fn marshal(&self, _: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        Ok(())
    }
}

impl From<Trak> for Box<dyn ImmutableBox> {
    fn from(value: Trak) -> Self {
        Box::new(value)
    }
}

/*************************** trex ****************************/

pub const TYPE_TREX: BoxType = *b"trex";

#[derive(Default)]
pub struct Trex {
    pub full_box: FullBox,
    pub track_id: u32,
    pub default_sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

impl ImmutableBox for Trex {
    fn box_type(&self) -> BoxType {
        TYPE_TREX
    }

    fn size(&self) -> usize {
        24
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.track_id.to_be_bytes())?;
        w.write_all(&self.default_sample_description_index.to_be_bytes())?;
        w.write_all(&self.default_sample_duration.to_be_bytes())?;
        w.write_all(&self.default_sample_size.to_be_bytes())?;
        w.write_all(&self.default_sample_flags.to_be_bytes())?;
        Ok(())
    }
}

impl From<Trex> for Box<dyn ImmutableBox> {
    fn from(value: Trex) -> Self {
        Box::new(value)
    }
}

/*************************** trun ****************************/

pub const TRUN_DATA_OFFSET_PRESENT: u32 = 0b0000_0000_0001;
pub const TRUN_FIRST_SAMPLE_FLAGS_PRESENT: u32 = 0b0000_0000_0100;
pub const TRUN_SAMPLE_DURATION_PRESENT: u32 = 0b0001_0000_0000;
pub const TRUN_SAMPLE_SIZE_PRESENT: u32 = 0b0010_0000_0000;
pub const TRUN_SAMPLE_FLAGS_PRESENT: u32 = 0b0100_0000_0000;
pub const TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT: u32 = 0b1000_0000_0000;

#[derive(Clone, Copy, Default)]
pub struct TrunEntry {
    pub sample_duration: u32,
    pub sample_size: u32,
    pub sample_flags: u32,
    pub sample_composition_time_offset: u32,
}

impl TrunEntry {
    fn marshal_field(&self, w: &mut dyn std::io::Write, flags: [u8; 3]) -> Result<(), Mp4Error> {
        if check_fullbox_flag(flags, TRUN_SAMPLE_DURATION_PRESENT) {
            w.write_all(&self.sample_duration.to_be_bytes())?;
        }
        if check_fullbox_flag(flags, TRUN_SAMPLE_SIZE_PRESENT) {
            w.write_all(&self.sample_size.to_be_bytes())?;
        }
        if check_fullbox_flag(flags, TRUN_SAMPLE_FLAGS_PRESENT) {
            w.write_all(&self.sample_flags.to_be_bytes())?;
        }
        if check_fullbox_flag(flags, TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT) {
            w.write_all(&self.sample_composition_time_offset.to_be_bytes())?;
        }
        Ok(())
    }
}

pub const TYPE_TRUN: BoxType = *b"trun";

pub struct Trun {
    pub flags: [u8; 3],

    pub data_offset: i32,
    pub first_sample_flags: u32,
    pub entries: Vec<TrunEntry>,
}

fn trun_field_size(fullbox_flags: [u8; 3]) -> usize {
    let mut total = 0;
    if check_fullbox_flag(fullbox_flags, TRUN_SAMPLE_DURATION_PRESENT) {
        total += 4;
    }
    if check_fullbox_flag(fullbox_flags, TRUN_SAMPLE_SIZE_PRESENT) {
        total += 4;
    }
    if check_fullbox_flag(fullbox_flags, TRUN_SAMPLE_FLAGS_PRESENT) {
        total += 4;
    }
    if check_fullbox_flag(fullbox_flags, TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT) {
        total += 4;
    }
    total
}

impl ImmutableBox for Trun {
    fn box_type(&self) -> BoxType {
        TYPE_TRUN
    }

    fn size(&self) -> usize {
        let mut total = 8;
        if check_fullbox_flag(self.flags, TRUN_DATA_OFFSET_PRESENT) {
            total += 4;
        }
        if check_fullbox_flag(self.flags, TRUN_FIRST_SAMPLE_FLAGS_PRESENT) {
            total += 4;
        }
        total += trun_field_size(self.flags) * self.entries.len();
        total
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        w.write_all(&[0])?;
        w.write_all(&self.flags)?;
        w.write_all(
            &u32::try_from(self.entries.len())
                .map_err(|e| Mp4Error::FromInt("trun".to_owned(), e))?
                .to_be_bytes(),
        )?;
        if check_fullbox_flag(self.flags, TRUN_DATA_OFFSET_PRESENT) {
            w.write_all(&self.data_offset.to_be_bytes())?;
        }
        if check_fullbox_flag(self.flags, TRUN_FIRST_SAMPLE_FLAGS_PRESENT) {
            w.write_all(&self.first_sample_flags.to_be_bytes())?;
        }
        for entry in &self.entries {
            entry.marshal_field(w, self.flags)?;
        }
        Ok(())
    }
}

impl From<Trun> for Box<dyn ImmutableBox> {
    fn from(value: Trun) -> Self {
        Box::new(value)
    }
}

/*************************** sdtp ****************************/

pub const TYPE_SDTP: BoxType = *b"sdtp";

pub struct Sdtp {
    pub full_box: FullBox,
    // is_leading, sample_depends_on, sample_is_depended_on,
    // sample_has_redundancy packed two bits each.
    pub sample_flags: Vec<u8>,
}

impl ImmutableBox for Sdtp {
    fn box_type(&self) -> BoxType {
        TYPE_SDTP
    }

    fn size(&self) -> usize {
        4 + self.sample_flags.len()
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.sample_flags)?;
        Ok(())
    }
}

impl From<Sdtp> for Box<dyn ImmutableBox> {
    fn from(value: Sdtp) -> Self {
        Box::new(value)
    }
}

/*************************** vmhd ****************************/

pub const TYPE_VMHD: BoxType = *b"vmhd";

#[derive(Default)]
pub struct Vmhd {
    pub full_box: FullBox,
    pub graphics_mode: u16, // template=0
    pub opcolor: [u16; 3],  // template={0, 0, 0}
}

impl ImmutableBox for Vmhd {
    fn box_type(&self) -> BoxType {
        TYPE_VMHD
    }

    fn size(&self) -> usize {
        12
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.graphics_mode.to_be_bytes())?;
        for color in &self.opcolor {
            w.write_all(&color.to_be_bytes())?;
        }
        Ok(())
    }
}

impl From<Vmhd> for Box<dyn ImmutableBox> {
    fn from(value: Vmhd) -> Self {
        Box::new(value)
    }
}

/******************* uuid SampleEncryption *******************/

pub const TYPE_UUID: BoxType = *b"uuid";

// PIFF SampleEncryption extended type.
pub const UUID_SAMPLE_ENCRYPTION: [u8; 16] = [
    0xa2, 0x39, 0x4f, 0x52, 0x5a, 0x9b, 0x4f, 0x14, 0xa2, 0x44, 0x6c, 0x42, 0x7c, 0x64, 0x8d, 0xf4,
];

// PIFF ProtectionSystemSpecificHeader extended type.
pub const UUID_PROTECTION_HEADER: [u8; 16] = [
    0xd0, 0x8a, 0x4f, 0x18, 0x10, 0xf3, 0x4a, 0x82, 0xb6, 0xc8, 0x32, 0xd8, 0xab, 0xa1, 0x83, 0xd3,
];

pub const SAMPLE_ENCRYPTION_OVERRIDE_PARAMETERS: u32 = 0x0000_0001;
pub const SAMPLE_ENCRYPTION_SUBSAMPLES: u32 = 0x0000_0002;

pub struct SampleEncryption {
    pub full_box: FullBox,

    // Only present with the override-parameters flag.
    pub algorithm_id: u32, // 24 bits.
    pub iv_size: u8,
    pub kid: [u8; 16],

    pub samples: Vec<SampleEncryptionSample>,
}

#[derive(Debug)]
pub struct SampleEncryptionSample {
    pub iv: u64,
    pub subsamples: Vec<SampleEncryptionSubsample>,
}

#[derive(Debug, Clone, Copy)]
pub struct SampleEncryptionSubsample {
    pub bytes_of_clear_data: u16,
    pub bytes_of_encrypted_data: u32,
}

impl ImmutableBox for SampleEncryption {
    fn box_type(&self) -> BoxType {
        TYPE_UUID
    }

    fn size(&self) -> usize {
        let mut total = 16 + 4 + 4;
        if self.full_box.check_flag(SAMPLE_ENCRYPTION_OVERRIDE_PARAMETERS) {
            total += 20;
        }
        for sample in &self.samples {
            total += 8;
            if self.full_box.check_flag(SAMPLE_ENCRYPTION_SUBSAMPLES) {
                total += 2 + sample.subsamples.len() * 6;
            }
        }
        total
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        w.write_all(&UUID_SAMPLE_ENCRYPTION)?;
        self.full_box.marshal_field(w)?;
        if self.full_box.check_flag(SAMPLE_ENCRYPTION_OVERRIDE_PARAMETERS) {
            w.write_all(&self.algorithm_id.to_be_bytes()[1..])?;
            w.write_all(&[self.iv_size])?;
            w.write_all(&self.kid)?;
        }
        w.write_all(
            &u32::try_from(self.samples.len())
                .map_err(|e| Mp4Error::FromInt("sample encryption".to_owned(), e))?
                .to_be_bytes(),
        )?;
        for sample in &self.samples {
            w.write_all(&sample.iv.to_be_bytes())?;
            if self.full_box.check_flag(SAMPLE_ENCRYPTION_SUBSAMPLES) {
                w.write_all(
                    &u16::try_from(sample.subsamples.len())
                        .map_err(|e| Mp4Error::FromInt("subsamples".to_owned(), e))?
                        .to_be_bytes(),
                )?;
                for entry in &sample.subsamples {
                    w.write_all(&entry.bytes_of_clear_data.to_be_bytes())?;
                    w.write_all(&entry.bytes_of_encrypted_data.to_be_bytes())?;
                }
            }
        }
        Ok(())
    }
}

impl From<SampleEncryption> for Box<dyn ImmutableBox> {
    fn from(value: SampleEncryption) -> Self {
        Box::new(value)
    }
}
