// SPDX-License-Identifier: GPL-2.0-or-later

pub mod time;

use serde::Serialize;
use std::{borrow::Cow, fmt, str::FromStr, sync::Arc};
use thiserror::Error;

pub type ArcLogger = Arc<dyn ILogger + Send + Sync>;

pub trait ILogger {
    /// Send log.
    fn log(&self, _: LogEntry) {}
}

/// Log entry. The timestamp is applied by the logger.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
}

impl LogEntry {
    #[must_use]
    pub fn new(level: LogLevel, source: &'static str, message: String) -> Self {
        let source = LogSource(Cow::Borrowed(source));
        Self {
            level,
            source,
            message,
        }
    }
}

/// Severity of the log message.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Something requires attention.
    Error,

    /// Something may require attention.
    Warning,

    /// Standard information.
    Info,

    /// Verbose debugging information.
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseLogLevelError {
    #[error("unknown log level: '{0}'")]
    UnknownLevel(String),
}

impl FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(LogLevel::Error),
            "warning" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            _ => Err(ParseLogLevelError::UnknownLevel(s.to_owned())),
        }
    }
}

/// Which subsystem produced a log entry.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize)]
#[repr(transparent)]
pub struct LogSource(Cow<'static, str>);

impl LogSource {
    #[must_use]
    pub fn new(source: &'static str) -> Self {
        Self(Cow::Borrowed(source))
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logger that does nothing.
pub struct DummyLogger;

impl DummyLogger {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(DummyLogger {})
    }
}

impl ILogger for DummyLogger {
    fn log(&self, _: LogEntry) {}
}

/// The receiving end went away before the response could be delivered.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cancelled")]
pub struct Cancelled;

/// Lowercase hex encoding, used for codec private data in manifests.
#[must_use]
pub fn hex_encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push(char::from_digit(u32::from(b >> 4), 16).expect("nibble in range"));
        s.push(char::from_digit(u32::from(b & 0xf), 16).expect("nibble in range"));
    }
    s
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseHexError {
    #[error("odd number of hex digits: {0}")]
    OddLength(usize),

    #[error("invalid hex digit: '{0}'")]
    InvalidDigit(char),
}

/// Inverse of `hex_encode`. Accepts both cases.
pub fn hex_decode(s: &str) -> Result<Vec<u8>, ParseHexError> {
    use ParseHexError::*;
    if s.len() % 2 != 0 {
        return Err(OddLength(s.len()));
    }
    let digit = |c: char| c.to_digit(16).ok_or(InvalidDigit(c));

    let mut out = Vec::with_capacity(s.len() / 2);
    let mut chars = s.chars();
    while let (Some(hi), Some(lo)) = (chars.next(), chars.next()) {
        let b = (digit(hi)? << 4) | digit(lo)?;
        out.push(u8::try_from(b).expect("two nibbles fit a byte"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("", &[]; "empty")]
    #[test_case("00", &[0]; "zero")]
    #[test_case("0164001f", &[1, 0x64, 0, 0x1f]; "avc profile")]
    #[test_case("DEADBEEF", &[0xde, 0xad, 0xbe, 0xef]; "uppercase")]
    fn test_hex_decode(s: &str, want: &[u8]) {
        assert_eq!(want, hex_decode(s).unwrap().as_slice());
    }

    #[test]
    fn test_hex_roundtrip() {
        let data = vec![0x00, 0x01, 0x7f, 0x80, 0xff];
        assert_eq!(data, hex_decode(&hex_encode(&data)).unwrap());
    }

    #[test]
    fn test_hex_decode_errors() {
        assert_eq!(ParseHexError::OddLength(3), hex_decode("abc").unwrap_err());
        assert_eq!(
            ParseHexError::InvalidDigit('x'),
            hex_decode("0x").unwrap_err()
        );
    }
}
