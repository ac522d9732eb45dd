// src/etw/property.rs
//! One decoded property: owned raw bytes plus the type tags needed to
//! interpret them. Values are copied out of the record, so they outlive the
//! callback that produced them.

use std::fmt;

use chrono::{DateTime, Utc};

use super::convert::{AnsiChar, AnsiString, FromProperty, Pointer, SizeT, WideChar};
use super::error::DecodeError;
use super::guid::Guid;
use super::tdh::InType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyValue {
    in_type: u16,
    out_type: u16,
    wide_pointer: bool,
    raw: Vec<u8>,
    name: String,
}

impl PropertyValue {
    pub fn new(in_type: u16, out_type: u16, wide_pointer: bool, raw: Vec<u8>, name: impl Into<String>) -> Self {
        Self { in_type, out_type, wide_pointer, raw, name: name.into() }
    }

    /// Declared input type, or `None` for a tag this crate does not know.
    pub fn in_type(&self) -> Option<InType> {
        InType::from_raw(self.in_type)
    }

    pub fn in_type_raw(&self) -> u16 {
        self.in_type
    }

    /// Output type hint. Never consulted by the converters.
    pub fn out_type(&self) -> u16 {
        self.out_type
    }

    pub fn is_wide_pointer(&self) -> bool {
        self.wide_pointer
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn decode<T: FromProperty>(&self) -> Result<T, DecodeError> {
        T::from_property(self)
    }

    /// `[TYPE]   name = value`, failing if the bytes do not fit the declared type.
    pub fn to_display_string(&self) -> Result<String, DecodeError> {
        use InType as T;

        let in_type = self.in_type();
        let value = match in_type {
            Some(T::Boolean) => self.decode::<bool>()?.to_string(),
            Some(T::UInt64 | T::UInt32 | T::UInt16 | T::UInt8) => self.decode::<u64>()?.to_string(),
            Some(T::Int64 | T::HexInt64 | T::Int32 | T::HexInt32 | T::Int16 | T::Int8) => {
                self.decode::<i64>()?.to_string()
            }
            Some(T::Double) => format!("{:.6}", self.decode::<f64>()?),
            Some(T::Float) => format!("{:.6}", self.decode::<f32>()?),
            Some(
                T::UnicodeString | T::CountedString | T::ReversedCountedString | T::NonNullTerminatedString,
            ) => self.decode::<String>()?,
            Some(
                T::AnsiString
                | T::CountedAnsiString
                | T::ReversedCountedAnsiString
                | T::NonNullTerminatedAnsiString,
            ) => self.decode::<AnsiString>()?.to_string(),
            Some(T::UnicodeChar) => self.decode::<WideChar>()?.to_string(),
            Some(T::AnsiChar) => self.decode::<AnsiChar>()?.to_string(),
            Some(T::Null) => String::new(),
            Some(T::SizeT) => self.decode::<SizeT>()?.0.to_string(),
            Some(T::Pointer) => self.decode::<Pointer>()?.0.to_string(),
            Some(T::SystemTime | T::FileTime) => {
                self.decode::<DateTime<Utc>>()?.format("%Y-%m-%d %H:%M:%S UTC").to_string()
            }
            Some(T::Guid) => self.decode::<Guid>()?.to_string(),
            Some(T::Binary | T::Sid | T::HexDump | T::WbemSid) | None => {
                format!("[unsupported type {}]", self.in_type)
            }
        };

        Ok(match in_type.and_then(InType::label) {
            Some(label) => format!("{label:<9}{} = {value}", self.name),
            None => format!("{} = {value}", self.name),
        })
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_display_string() {
            Ok(text) => f.write_str(&text),
            Err(err) => write!(f, "{} = [invalid value: {err}]", self.name),
        }
    }
}
