// src/etw/tdh.rs
//! `TRACE_EVENT_INFO` layout and TDH type tags.
//!
//! The schema blob returned by `TdhGetEventInformation` is read with explicit
//! offsets instead of casting it to a C struct, so the decoder runs (and is
//! tested) on any host and never trusts an offset it has not bounds-checked.
//!
//!   ┌──── 0 ─────────────── 112 ──────────────── 112 + 24·n ─────────────┐
//!   │ fixed header │ EVENT_PROPERTY_INFO × PropertyCount │ names, strings │
//!   └──────────────────────────────────────────────────────────────────────┘

use super::error::DecodeError;
use super::guid::Guid;
use super::native::EventDescriptor;

/// Byte size of the fixed `TRACE_EVENT_INFO` header.
pub const TRACE_EVENT_INFO_HEADER: usize = 112;
/// Byte size of one `EVENT_PROPERTY_INFO`.
pub const EVENT_PROPERTY_INFO_SIZE: usize = 24;
/// `sizeof(TRACE_EVENT_INFO)` including its single-element property array.
pub const TRACE_EVENT_INFO_SIZE: usize = TRACE_EVENT_INFO_HEADER + EVENT_PROPERTY_INFO_SIZE;

// Header field offsets.
const PROVIDER_GUID: usize = 0;
const EVENT_DESCRIPTOR: usize = 32;
const PROVIDER_NAME_OFFSET: usize = 52;
const TASK_NAME_OFFSET: usize = 68;
const OPCODE_NAME_OFFSET: usize = 72;
const EVENT_MESSAGE_OFFSET: usize = 76;
const PROPERTY_COUNT: usize = 100;
const TOP_LEVEL_PROPERTY_COUNT: usize = 104;

/// `PROPERTY_FLAGS` bits.
pub const PROPERTY_STRUCT: u32 = 0x1;
pub const PROPERTY_PARAM_LENGTH: u32 = 0x2;
pub const PROPERTY_PARAM_COUNT: u32 = 0x4;

/// `TDH_INTYPE_*` declared input types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum InType {
    Null = 0,
    UnicodeString = 1,
    AnsiString = 2,
    Int8 = 3,
    UInt8 = 4,
    Int16 = 5,
    UInt16 = 6,
    Int32 = 7,
    UInt32 = 8,
    Int64 = 9,
    UInt64 = 10,
    Float = 11,
    Double = 12,
    Boolean = 13,
    Binary = 14,
    Guid = 15,
    Pointer = 16,
    FileTime = 17,
    SystemTime = 18,
    Sid = 19,
    HexInt32 = 20,
    HexInt64 = 21,
    CountedString = 300,
    CountedAnsiString = 301,
    ReversedCountedString = 302,
    ReversedCountedAnsiString = 303,
    NonNullTerminatedString = 304,
    NonNullTerminatedAnsiString = 305,
    UnicodeChar = 306,
    AnsiChar = 307,
    SizeT = 308,
    HexDump = 309,
    WbemSid = 310,
}

impl InType {
    pub fn from_raw(raw: u16) -> Option<Self> {
        use InType::*;
        Some(match raw {
            0 => Null,
            1 => UnicodeString,
            2 => AnsiString,
            3 => Int8,
            4 => UInt8,
            5 => Int16,
            6 => UInt16,
            7 => Int32,
            8 => UInt32,
            9 => Int64,
            10 => UInt64,
            11 => Float,
            12 => Double,
            13 => Boolean,
            14 => Binary,
            15 => InType::Guid,
            16 => Pointer,
            17 => FileTime,
            18 => SystemTime,
            19 => Sid,
            20 => HexInt32,
            21 => HexInt64,
            300 => CountedString,
            301 => CountedAnsiString,
            302 => ReversedCountedString,
            303 => ReversedCountedAnsiString,
            304 => NonNullTerminatedString,
            305 => NonNullTerminatedAnsiString,
            306 => UnicodeChar,
            307 => AnsiChar,
            308 => SizeT,
            309 => HexDump,
            310 => WbemSid,
            _ => return None,
        })
    }

    pub fn raw(self) -> u16 {
        self as u16
    }

    /// Column tag used when rendering a property.
    pub fn label(self) -> Option<&'static str> {
        use InType::*;
        Some(match self {
            Boolean => "[BOOL]",
            UInt64 => "[UINT64]",
            UInt32 => "[UINT32]",
            UInt16 => "[UINT16]",
            UInt8 => "[UINT8]",
            Int64 => "[INT64]",
            HexInt64 => "[HEX64]",
            Int32 => "[INT32]",
            HexInt32 => "[HEX32]",
            Int16 => "[INT16]",
            Int8 => "[INT8]",
            Double => "[DOUBLE]",
            Float => "[FLOAT]",
            UnicodeString => "[USTR]",
            CountedString => "[CUSTR]",
            ReversedCountedString => "[RCUSTR]",
            NonNullTerminatedString => "[NUSTR]",
            AnsiString => "[ASTR]",
            CountedAnsiString => "[CASTR]",
            ReversedCountedAnsiString => "[RCASTR]",
            NonNullTerminatedAnsiString => "[NASTR]",
            UnicodeChar => "[UCHAR]",
            AnsiChar => "[CHAR]",
            Null => "[NULL]",
            SizeT => "[SIZET]",
            Pointer => "[PTR]",
            SystemTime => "[STIME]",
            FileTime => "[FTIME]",
            InType::Guid => "[GUID]",
            Binary | Sid | HexDump | WbemSid => return None,
        })
    }
}

/// Shape of one `EVENT_PROPERTY_INFO` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyShape {
    Scalar { in_type: u16, out_type: u16 },
    Struct { start_index: u16, member_count: u16 },
}

/// Decoded `EVENT_PROPERTY_INFO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub flags: u32,
    pub shape: PropertyShape,
    /// Fixed element count, or the index of the count property when
    /// `PROPERTY_PARAM_COUNT` is set.
    pub count: u16,
    pub length: u16,
    /// Name as UTF-16, NUL-terminated, ready for a property locator.
    pub name: Vec<u16>,
}

impl PropertyInfo {
    pub fn is_struct(&self) -> bool {
        self.flags & PROPERTY_STRUCT != 0
    }

    pub fn has_param_count(&self) -> bool {
        self.flags & PROPERTY_PARAM_COUNT != 0
    }

    pub fn name_string(&self) -> String {
        super::native::from_wide(&self.name)
    }
}

/// Parsed view of a `TRACE_EVENT_INFO` blob.
#[derive(Debug, Clone)]
pub struct TraceEventInfo {
    pub provider_id: Guid,
    pub descriptor: EventDescriptor,
    pub top_level_count: u32,
    pub properties: Vec<PropertyInfo>,
    provider_name_offset: u32,
    task_name_offset: u32,
    opcode_name_offset: u32,
    event_message_offset: u32,
}

impl TraceEventInfo {
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < TRACE_EVENT_INFO_HEADER {
            return Err(DecodeError::MalformedSchema("buffer shorter than TRACE_EVENT_INFO"));
        }

        let property_count = read_u32(buf, PROPERTY_COUNT)?;
        let top_level_count = read_u32(buf, TOP_LEVEL_PROPERTY_COUNT)?;
        if top_level_count > property_count {
            return Err(DecodeError::MalformedSchema("more top-level properties than properties"));
        }

        let array_end = (property_count as usize)
            .checked_mul(EVENT_PROPERTY_INFO_SIZE)
            .and_then(|n| n.checked_add(TRACE_EVENT_INFO_HEADER))
            .ok_or(DecodeError::MalformedSchema("property count overflows"))?;
        if array_end > buf.len() {
            return Err(DecodeError::MalformedSchema("property array exceeds buffer"));
        }

        let properties = (0..property_count as usize)
            .map(|i| parse_property(buf, TRACE_EVENT_INFO_HEADER + i * EVENT_PROPERTY_INFO_SIZE))
            .collect::<Result<Vec<_>, _>>()?;

        for p in &properties {
            if let PropertyShape::Struct { start_index, member_count } = p.shape {
                if start_index as u32 + member_count as u32 > property_count {
                    return Err(DecodeError::MalformedSchema("struct members exceed property array"));
                }
            }
        }

        Ok(Self {
            provider_id: Guid::from_bytes_le(read_array(buf, PROVIDER_GUID)?),
            descriptor: parse_descriptor(buf, EVENT_DESCRIPTOR)?,
            top_level_count,
            properties,
            provider_name_offset: read_u32(buf, PROVIDER_NAME_OFFSET)?,
            task_name_offset: read_u32(buf, TASK_NAME_OFFSET)?,
            opcode_name_offset: read_u32(buf, OPCODE_NAME_OFFSET)?,
            event_message_offset: read_u32(buf, EVENT_MESSAGE_OFFSET)?,
        })
    }

    pub fn provider_name(&self, buf: &[u8]) -> Option<String> {
        optional_string(buf, self.provider_name_offset)
    }

    pub fn task_name(&self, buf: &[u8]) -> Option<String> {
        optional_string(buf, self.task_name_offset)
    }

    pub fn opcode_name(&self, buf: &[u8]) -> Option<String> {
        optional_string(buf, self.opcode_name_offset)
    }

    pub fn event_message(&self, buf: &[u8]) -> Option<String> {
        optional_string(buf, self.event_message_offset)
    }
}

fn parse_property(buf: &[u8], at: usize) -> Result<PropertyInfo, DecodeError> {
    let flags = read_u32(buf, at)?;
    let name_offset = read_u32(buf, at + 4)?;
    let first = read_u16(buf, at + 8)?;
    let second = read_u16(buf, at + 10)?;
    let shape = if flags & PROPERTY_STRUCT != 0 {
        PropertyShape::Struct { start_index: first, member_count: second }
    } else {
        PropertyShape::Scalar { in_type: first, out_type: second }
    };

    Ok(PropertyInfo {
        flags,
        shape,
        count: read_u16(buf, at + 16)?,
        length: read_u16(buf, at + 18)?,
        name: if name_offset == 0 { vec![0] } else { read_wide_z(buf, name_offset as usize)? },
    })
}

fn parse_descriptor(buf: &[u8], at: usize) -> Result<EventDescriptor, DecodeError> {
    Ok(EventDescriptor {
        id: read_u16(buf, at)?,
        version: read_u8(buf, at + 2)?,
        channel: read_u8(buf, at + 3)?,
        level: read_u8(buf, at + 4)?,
        opcode: read_u8(buf, at + 5)?,
        task: read_u16(buf, at + 6)?,
        keyword: u64::from_le_bytes(read_array(buf, at + 8)?),
    })
}

fn optional_string(buf: &[u8], offset: u32) -> Option<String> {
    if offset == 0 {
        return None;
    }
    read_wide_z(buf, offset as usize).ok().map(|w| super::native::from_wide(&w))
}

/// NUL-terminated UTF-16 at `at`, terminator included.
fn read_wide_z(buf: &[u8], at: usize) -> Result<Vec<u16>, DecodeError> {
    let tail = buf
        .get(at..)
        .ok_or(DecodeError::MalformedSchema("string offset outside buffer"))?;
    let mut out = Vec::new();
    for pair in tail.chunks_exact(2) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        out.push(unit);
        if unit == 0 {
            return Ok(out);
        }
    }
    Err(DecodeError::MalformedSchema("unterminated string"))
}

fn read_array<const N: usize>(buf: &[u8], at: usize) -> Result<[u8; N], DecodeError> {
    buf.get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(DecodeError::MalformedSchema("field outside buffer"))
}

fn read_u8(buf: &[u8], at: usize) -> Result<u8, DecodeError> {
    Ok(read_array::<1>(buf, at)?[0])
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16, DecodeError> {
    read_array(buf, at).map(u16::from_le_bytes)
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, DecodeError> {
    read_array(buf, at).map(u32::from_le_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etw::native::mock::SchemaBuilder;

    #[test]
    fn parses_builder_layout() {
        let blob = SchemaBuilder::new(7)
            .message("Process %1 started")
            .scalar("ProcessID", InType::UInt32)
            .array("Flags", InType::UInt8, 3)
            .build();
        let info = TraceEventInfo::parse(&blob).unwrap();

        assert_eq!(info.descriptor.id, 7);
        assert_eq!(info.top_level_count, 2);
        assert_eq!(info.properties.len(), 2);
        assert_eq!(info.properties[0].name_string(), "ProcessID");
        assert_eq!(
            info.properties[1].shape,
            PropertyShape::Scalar { in_type: InType::UInt8.raw(), out_type: 0 }
        );
        assert_eq!(info.properties[1].count, 3);
        assert_eq!(info.event_message(&blob).as_deref(), Some("Process %1 started"));
        assert_eq!(info.task_name(&blob), None);
    }

    #[test]
    fn rejects_truncated_blobs() {
        let blob = SchemaBuilder::new(1).scalar("A", InType::UInt32).build();
        assert!(matches!(
            TraceEventInfo::parse(&blob[..TRACE_EVENT_INFO_HEADER + 10]),
            Err(DecodeError::MalformedSchema(_))
        ));
        assert!(matches!(TraceEventInfo::parse(&blob[..40]), Err(DecodeError::MalformedSchema(_))));
    }

    #[test]
    fn rejects_name_offsets_outside_buffer() {
        let mut blob = SchemaBuilder::new(1).scalar("A", InType::UInt32).build();
        let at = TRACE_EVENT_INFO_HEADER + 4;
        blob[at..at + 4].copy_from_slice(&0xffff_u32.to_le_bytes());
        assert!(matches!(TraceEventInfo::parse(&blob), Err(DecodeError::MalformedSchema(_))));
    }

    #[test]
    fn unknown_in_types_have_no_tag() {
        assert_eq!(InType::from_raw(999), None);
        assert_eq!(InType::from_raw(308), Some(InType::SizeT));
        assert_eq!(InType::Binary.label(), None);
        assert_eq!(InType::Boolean.label(), Some("[BOOL]"));
    }
}
