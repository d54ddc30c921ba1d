// SPDX-License-Identifier: GPL-2.0-or-later

use std::fmt;
use thiserror::Error;

/// Four character box type that compares and prints
/// independently of host endianness.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    #[must_use]
    pub fn as_bytes(self) -> [u8; 4] {
        self.0
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", char::from(b))?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

impl From<[u8; 4]> for FourCc {
    fn from(v: [u8; 4]) -> Self {
        Self(v)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("short read: want {want} bytes, {remaining} remaining")]
    ShortRead { want: usize, remaining: usize },
}

/// Byte reader bounded by its input slice. Reads past the
/// end return an error instead of whatever the allocator
/// left behind.
pub struct BytesReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BytesReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[must_use]
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ReadError> {
        if n > self.remaining() {
            return Err(ReadError::ShortRead {
                want: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ReadError> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8, ReadError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16_be(&mut self) -> Result<u16, ReadError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u24_be(&mut self) -> Result<u32, ReadError> {
        let b = self.read_bytes(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn read_u32_be(&mut self) -> Result<u32, ReadError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64_be(&mut self) -> Result<u64, ReadError> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_fourcc(&mut self) -> Result<FourCc, ReadError> {
        let b = self.read_bytes(4)?;
        Ok(FourCc([b[0], b[1], b[2], b[3]]))
    }

    /// Version byte and 24-bit flags of a full box.
    pub fn read_version_flags(&mut self) -> Result<(u8, u32), ReadError> {
        let version = self.read_u8()?;
        let flags = self.read_u24_be()?;
        Ok((version, flags))
    }

    /// Sub-reader over the next `n` bytes. The parent position
    /// is not advanced; pair with `skip`.
    pub fn sub_reader(&self, n: usize) -> Result<BytesReader<'a>, ReadError> {
        if n > self.remaining() {
            return Err(ReadError::ShortRead {
                want: n,
                remaining: self.remaining(),
            });
        }
        Ok(BytesReader::new(&self.data[self.pos..self.pos + n]))
    }
}
