//! 128-bit provider / event identities.
//!
//! Stored in the Windows field layout (`Data1..Data4`) so ordering, hashing and
//! the little-endian byte form match what the tracing subsystem hands us.

use std::{fmt, str::FromStr};
use thiserror::Error;

/// Identity of the kernel trace-control provider. Its events are generated by
/// the session itself and never reach listeners.
pub const EVENT_TRACE_GUID: Guid = Guid::from_fields(
    0x68fd_d900,
    0x4a3e,
    0x11d1,
    [0x84, 0xf4, 0x00, 0x00, 0xf8, 0x04, 0x64, 0xe3],
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GuidParseError {
    #[error("expected 32 hex digits in 8-4-4-4-12 groups, got '{0}'")]
    Layout(String),

    #[error("invalid hex digit in '{0}'")]
    Digit(String),
}

impl Guid {
    pub const SIZE: usize = 16;

    pub const fn from_fields(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self { data1, data2, data3, data4 }
    }

    /// Decode the in-memory (`GUID` struct) byte layout.
    pub fn from_bytes_le(bytes: [u8; 16]) -> Self {
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&bytes[8..]);
        Self {
            data1: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_le_bytes([bytes[4], bytes[5]]),
            data3: u16::from_le_bytes([bytes[6], bytes[7]]),
            data4,
        }
    }

    pub fn to_bytes_le(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.data1.to_le_bytes());
        out[4..6].copy_from_slice(&self.data2.to_le_bytes());
        out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        out[8..].copy_from_slice(&self.data4);
        out
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

impl FromStr for Guid {
    type Err = GuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix('{')
            .and_then(|b| b.strip_suffix('}'))
            .unwrap_or(trimmed);

        let groups: Vec<&str> = body.split('-').collect();
        let lens: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        if lens != [8, 4, 4, 4, 12] {
            return Err(GuidParseError::Layout(s.into()));
        }

        let hex = |g: &str| u64::from_str_radix(g, 16).map_err(|_| GuidParseError::Digit(s.into()));
        // from_str_radix tolerates a leading '+'
        if body.contains('+') {
            return Err(GuidParseError::Digit(s.into()));
        }

        let clock = hex(groups[3])?;
        let node = hex(groups[4])?;
        let mut data4 = [0u8; 8];
        data4[0..2].copy_from_slice(&(clock as u16).to_be_bytes());
        data4[2..].copy_from_slice(&node.to_be_bytes()[2..]);

        Ok(Self {
            data1: hex(groups[0])? as u32,
            data2: hex(groups[1])? as u16,
            data3: hex(groups[2])? as u16,
            data4,
        })
    }
}
