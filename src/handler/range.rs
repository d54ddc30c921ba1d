// SPDX-License-Identifier: GPL-2.0-or-later

use thiserror::Error;

// Specifies the byte range to be sent to the client.
#[derive(Debug, PartialEq, Eq)]
pub struct HttpRange {
    pub start: u64,
    pub length: u64,
}

impl HttpRange {
    #[must_use]
    pub fn content_range(&self, size: u64) -> String {
        format!(
            "bytes {}-{}/{}",
            self.start,
            self.start + self.length - 1,
            size,
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseRangeError {
    #[error("invalid range")]
    InvalidRange,

    // If first-byte-pos of all of the byte-range-spec values is
    // greater than the content size.
    #[error("invalid range: failed to overlap")]
    NoOverlap,
}

// Parses a Range header string as per RFC 7233.
// NoOverlap is returned if none of the ranges overlap.
pub fn parse_range(s: Option<&str>, size: u64) -> Result<Vec<HttpRange>, ParseRangeError> {
    use ParseRangeError::*;
    let Some(s) = s else {
        return Ok(Vec::new());
    };

    const B: &str = "bytes=";

    if !s.starts_with(B) {
        return Err(InvalidRange);
    }

    let mut ranges = Vec::new();
    let mut no_overlap = false;

    for ra in s[B.len()..].split(',') {
        let ra = ra.trim();
        if ra.is_empty() {
            continue;
        }

        let i = ra.find('-').ok_or(InvalidRange)?;
        let start = ra[..i].trim();
        let end = ra[i + 1..].trim();

        let mut r = HttpRange {
            start: 0,
            length: 0,
        };

        if start.is_empty() {
            // If no start is specified, end specifies the
            // range start relative to the end of the file,
            // and we are dealing with <suffix-length>
            // which has to be a non-negative integer as per
            // RFC 7233 Section 2.1 "Byte-Ranges".
            if end.is_empty() || end.starts_with('-') {
                return Err(InvalidRange);
            }
            let mut i: u64 = end.parse().map_err(|_| InvalidRange)?;
            if i > size {
                i = size;
            }
            r.start = size - i;
            r.length = size - r.start;
        } else {
            let i: u64 = start.parse().map_err(|_| InvalidRange)?;
            if i >= size {
                // If the range begins after the size of the
                // content, then it does not overlap.
                no_overlap = true;
                continue;
            }
            r.start = i;
            if end.is_empty() {
                // If no end is specified, range extends to the
                // end of the file.
                r.length = size - r.start;
            } else {
                let mut i: u64 = end.parse().map_err(|_| InvalidRange)?;
                if r.start > i {
                    return Err(InvalidRange);
                }
                if i >= size {
                    i = size - 1;
                }
                r.length = i - r.start + 1;
            }
        }

        ranges.push(r);
    }

    if no_overlap && ranges.is_empty() {
        // The specified ranges did not overlap with the content.
        return Err(NoOverlap);
    }

    Ok(ranges)
}
