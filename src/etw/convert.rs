// src/etw/convert.rs
//! Typed decoding of [`PropertyValue`] bytes.
//!
//! Each target type lists the declared input types it accepts and the exact
//! byte length each one must have. Widening is allowed, narrowing never is:
//! a `UINT16` property decodes as `u32` or `u64` but not as `u8`, whatever
//! its actual magnitude.

use std::fmt;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use super::error::DecodeError;
use super::guid::Guid;
use super::property::PropertyValue;
use super::tdh::InType;

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_OFFSET: i64 = 11_644_473_600;
const FILETIME_TICKS_PER_SECOND: u64 = 10_000_000;

/// Conversion from a property's raw bytes into a native value.
pub trait FromProperty: Sized {
    /// Name used in "incorrect property type" errors.
    const TARGET: &'static str;

    fn from_property(value: &PropertyValue) -> Result<Self, DecodeError>;
}

/// One UTF-16 code unit (`TDH_INTYPE_UNICODECHAR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WideChar(pub u16);

/// One narrow character (`TDH_INTYPE_ANSICHAR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnsiChar(pub u8);

/// Narrow string bytes, code page unknown. Displays each byte as a Latin-1 char.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnsiString(pub Vec<u8>);

/// `size_t` of the emitting process, widened to 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeT(pub u64);

/// Pointer of the emitting process, widened to 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pointer(pub u64);

impl fmt::Display for WideChar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = char::decode_utf16([self.0])
            .next()
            .and_then(Result::ok)
            .unwrap_or(char::REPLACEMENT_CHARACTER);
        write!(f, "{c}")
    }
}

impl fmt::Display for AnsiChar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 as char)
    }
}

impl fmt::Display for AnsiString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|&b| write!(f, "{}", b as char))
    }
}

fn incorrect<T: FromProperty>(value: &PropertyValue) -> DecodeError {
    DecodeError::IncorrectType { in_type: value.in_type_raw(), target: T::TARGET }
}

fn invalid_size(value: &PropertyValue) -> DecodeError {
    DecodeError::InvalidSize { in_type: value.in_type_raw(), actual: value.raw().len() }
}

/// Raw bytes as a fixed array, rejecting any other length.
fn exact<const N: usize>(value: &PropertyValue) -> Result<[u8; N], DecodeError> {
    value.raw().try_into().map_err(|_| invalid_size(value))
}

macro_rules! widening {
    ($target:ty, $name:literal, { $( $in_type:ident => $source:ty ),+ $(,)? }) => {
        impl FromProperty for $target {
            const TARGET: &'static str = $name;

            fn from_property(value: &PropertyValue) -> Result<Self, DecodeError> {
                match value.in_type() {
                    $( Some(InType::$in_type) => Ok(<$target>::from(<$source>::from_le_bytes(exact(value)?))), )+
                    _ => Err(incorrect::<Self>(value)),
                }
            }
        }
    };
}

widening!(u64, "u64", { UInt64 => u64, UInt32 => u32, UInt16 => u16, UInt8 => u8 });
widening!(u32, "u32", { UInt32 => u32, UInt16 => u16, UInt8 => u8 });
widening!(u16, "u16", { UInt16 => u16, UInt8 => u8 });
widening!(u8, "u8", { UInt8 => u8 });

widening!(i64, "i64", {
    Int64 => i64, HexInt64 => i64, Int32 => i32, HexInt32 => i32, Int16 => i16, Int8 => i8,
});
widening!(i32, "i32", { Int32 => i32, HexInt32 => i32, Int16 => i16, Int8 => i8 });
widening!(i16, "i16", { Int16 => i16, Int8 => i8 });
widening!(i8, "i8", { Int8 => i8 });

widening!(f64, "f64", { Double => f64, Float => f32 });
widening!(f32, "f32", { Float => f32 });

impl FromProperty for bool {
    const TARGET: &'static str = "bool";

    fn from_property(value: &PropertyValue) -> Result<Self, DecodeError> {
        match value.in_type() {
            Some(InType::Boolean) => Ok(u32::from_le_bytes(exact(value)?) != 0),
            _ => Err(incorrect::<Self>(value)),
        }
    }
}

impl FromProperty for WideChar {
    const TARGET: &'static str = "UTF-16 char";

    fn from_property(value: &PropertyValue) -> Result<Self, DecodeError> {
        match value.in_type() {
            Some(InType::UnicodeChar) => Ok(WideChar(u16::from_le_bytes(exact(value)?))),
            _ => Err(incorrect::<Self>(value)),
        }
    }
}

impl FromProperty for AnsiChar {
    const TARGET: &'static str = "ANSI char";

    fn from_property(value: &PropertyValue) -> Result<Self, DecodeError> {
        match value.in_type() {
            Some(InType::AnsiChar) => Ok(AnsiChar(exact::<1>(value)?[0])),
            _ => Err(incorrect::<Self>(value)),
        }
    }
}

/// The four ways a string can be laid out in a payload.
#[derive(Clone, Copy)]
enum Layout {
    /// Up to the first NUL, or the whole span when there is none.
    Terminated,
    /// First unit is the length.
    Counted,
    /// First unit is the length with its bytes swapped.
    ReversedCounted,
    /// The whole span.
    Fixed,
}

/// Pick the units that make up the string out of `units`.
fn string_units<U>(units: &[U], layout: Layout, length_of: impl Fn(&U, bool) -> usize) -> Option<&[U]>
where
    U: Default + PartialEq,
{
    match layout {
        Layout::Terminated => {
            let end = units.iter().position(|u| *u == U::default()).unwrap_or(units.len());
            Some(&units[..end])
        }
        Layout::Counted | Layout::ReversedCounted => {
            let count = length_of(units.first()?, matches!(layout, Layout::ReversedCounted));
            units.get(1..count.checked_add(1)?)
        }
        Layout::Fixed => Some(units),
    }
}

impl FromProperty for String {
    const TARGET: &'static str = "UTF-16 string";

    fn from_property(value: &PropertyValue) -> Result<Self, DecodeError> {
        let layout = match value.in_type() {
            Some(InType::UnicodeString) => Layout::Terminated,
            Some(InType::CountedString) => Layout::Counted,
            Some(InType::ReversedCountedString) => Layout::ReversedCounted,
            Some(InType::NonNullTerminatedString) => Layout::Fixed,
            _ => return Err(incorrect::<Self>(value)),
        };

        let raw = value.raw();
        if raw.len() % 2 != 0 {
            return Err(invalid_size(value));
        }
        let units: Vec<u16> = raw.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        string_units(&units, layout, |&n, reversed| usize::from(if reversed { n.swap_bytes() } else { n }))
            .map(String::from_utf16_lossy)
            .ok_or_else(|| invalid_size(value))
    }
}

impl FromProperty for AnsiString {
    const TARGET: &'static str = "ANSI string";

    fn from_property(value: &PropertyValue) -> Result<Self, DecodeError> {
        let layout = match value.in_type() {
            Some(InType::AnsiString) => Layout::Terminated,
            Some(InType::CountedAnsiString) => Layout::Counted,
            Some(InType::ReversedCountedAnsiString) => Layout::ReversedCounted,
            Some(InType::NonNullTerminatedAnsiString) => Layout::Fixed,
            _ => return Err(incorrect::<Self>(value)),
        };

        // a single byte reads the same in either order
        string_units(value.raw(), layout, |&n, _| usize::from(n))
            .map(|text| AnsiString(text.to_vec()))
            .ok_or_else(|| invalid_size(value))
    }
}

/// Pointer-width dependent integer: 8 bytes on a 64-bit record, 4 otherwise.
fn pointer_sized(value: &PropertyValue) -> Result<u64, DecodeError> {
    if value.is_wide_pointer() {
        Ok(u64::from_le_bytes(exact(value)?))
    } else {
        Ok(u64::from(u32::from_le_bytes(exact(value)?)))
    }
}

impl FromProperty for SizeT {
    const TARGET: &'static str = "size_t";

    fn from_property(value: &PropertyValue) -> Result<Self, DecodeError> {
        match value.in_type() {
            Some(InType::SizeT) => pointer_sized(value).map(SizeT),
            _ => Err(incorrect::<Self>(value)),
        }
    }
}

impl FromProperty for Pointer {
    const TARGET: &'static str = "pointer";

    fn from_property(value: &PropertyValue) -> Result<Self, DecodeError> {
        match value.in_type() {
            Some(InType::Pointer) => pointer_sized(value).map(Pointer),
            _ => Err(incorrect::<Self>(value)),
        }
    }
}

impl FromProperty for DateTime<Utc> {
    const TARGET: &'static str = "timestamp";

    fn from_property(value: &PropertyValue) -> Result<Self, DecodeError> {
        match value.in_type() {
            Some(InType::SystemTime) => from_system_time(exact(value)?),
            Some(InType::FileTime) => from_file_time(u64::from_le_bytes(exact(value)?)),
            _ => Err(incorrect::<Self>(value)),
        }
    }
}

/// `SYSTEMTIME`: year, month, day-of-week, day, hour, minute, second, millis.
fn from_system_time(raw: [u8; 16]) -> Result<DateTime<Utc>, DecodeError> {
    let field = |i: usize| u16::from_le_bytes([raw[2 * i], raw[2 * i + 1]]);
    let naive = NaiveDate::from_ymd_opt(i32::from(field(0)), u32::from(field(1)), u32::from(field(3)))
        .and_then(|date| date.and_hms_opt(u32::from(field(4)), u32::from(field(5)), u32::from(field(6))))
        .ok_or(DecodeError::InvalidSystemTime)?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// `FILETIME` ticks, truncated to whole seconds. Values with the top bit set
/// are rejected, as `FileTimeToSystemTime` does.
fn from_file_time(ticks: u64) -> Result<DateTime<Utc>, DecodeError> {
    if ticks > i64::MAX as u64 {
        return Err(DecodeError::InvalidFileTime(ticks));
    }
    let secs = (ticks / FILETIME_TICKS_PER_SECOND) as i64 - FILETIME_UNIX_OFFSET;
    DateTime::from_timestamp(secs, 0).ok_or(DecodeError::InvalidFileTime(ticks))
}

impl FromProperty for Guid {
    const TARGET: &'static str = "GUID";

    fn from_property(value: &PropertyValue) -> Result<Self, DecodeError> {
        match value.in_type() {
            Some(InType::Guid) => Ok(Guid::from_bytes_le(exact(value)?)),
            _ => Err(incorrect::<Self>(value)),
        }
    }
}
