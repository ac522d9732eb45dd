// src/etw/schema.rs
//! Schema-driven access to the properties of one event record.
//!
//! [`EventSchema`] borrows the record for the duration of a callback. Every
//! value it hands out is a [`PropertyValue`] owning a copy of the bytes, so
//! nothing derived from the record outlives the callback by accident.

use super::convert::FromProperty;
use super::error::{DecodeError, Result, TraceError};
use super::native::{
    ERROR_INSUFFICIENT_BUFFER, ERROR_SUCCESS, EventDescriptor, EventHeader, EventRecord,
    PropertyLocator, from_wide,
};
use super::property::PropertyValue;
use super::tdh::{InType, PropertyInfo, PropertyShape, TRACE_EVENT_INFO_SIZE, TraceEventInfo};

/// Name given to the payload of a string-only record.
pub const STRING_ONLY_NAME: &str = "<Unnamed String Only>";

/// Contiguous run of properties that make up one struct-typed top-level
/// property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStructure {
    name: Vec<u16>,
    start: u32,
    member_count: u32,
    top_level_index: u32,
}

impl EventStructure {
    /// Struct name, `None` when the schema leaves it unnamed.
    pub fn name(&self) -> Option<String> {
        let name = from_wide(&self.name);
        (!name.is_empty()).then_some(name)
    }

    /// Absolute index of the first member.
    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn member_count(&self) -> u32 {
        self.member_count
    }

    pub fn top_level_index(&self) -> u32 {
        self.top_level_index
    }

    fn contains(&self, index: u32) -> bool {
        (self.start..self.start + self.member_count).contains(&index)
    }
}

/// Which property a fetch targets and what cardinality the caller expects.
#[derive(Clone, Copy)]
enum Target<'s> {
    TopLevel { index: u32, element: u32, is_array: bool },
    Member {
        structure: &'s EventStructure,
        instance: u32,
        member: u32,
        element: u32,
        is_array: bool,
        is_member_array: bool,
    },
}

pub struct EventSchema<'a> {
    record: &'a dyn EventRecord,
    header: EventHeader,
    buffer: Vec<u8>,
    info: Option<TraceEventInfo>,
}

impl<'a> EventSchema<'a> {
    /// Acquire and parse the schema of `record`. String-only records skip the
    /// query entirely.
    pub fn new(record: &'a dyn EventRecord) -> Result<Self> {
        let header = record.header();
        if header.is_string_only() {
            return Ok(Self { record, header, buffer: Vec::new(), info: None });
        }

        let buffer = acquire(record)?;
        let info = TraceEventInfo::parse(&buffer)?;
        Ok(Self { record, header, buffer, info: Some(info) })
    }

    pub fn header(&self) -> &EventHeader {
        &self.header
    }

    pub fn is_string_only(&self) -> bool {
        self.info.is_none()
    }

    /// Descriptor from the schema, falling back to the record header.
    pub fn descriptor(&self) -> EventDescriptor {
        self.info.as_ref().map_or(self.header.descriptor, |i| i.descriptor)
    }

    pub fn event_id(&self) -> u16 {
        self.descriptor().id
    }

    pub fn event_message(&self) -> Option<String> {
        self.info.as_ref()?.event_message(&self.buffer)
    }

    pub fn provider_name(&self) -> Option<String> {
        self.info.as_ref()?.provider_name(&self.buffer)
    }

    pub fn task_name(&self) -> Option<String> {
        self.info.as_ref()?.task_name(&self.buffer)
    }

    pub fn opcode_name(&self) -> Option<String> {
        self.info.as_ref()?.opcode_name(&self.buffer)
    }

    /// The record payload as a single UTF-16 string property.
    pub fn event_string(&self) -> PropertyValue {
        PropertyValue::new(
            InType::UnicodeString.raw(),
            InType::UnicodeString.raw(),
            false,
            self.record.user_data().to_vec(),
            STRING_ONLY_NAME,
        )
    }

    fn info(&self) -> Result<&TraceEventInfo, DecodeError> {
        self.info.as_ref().ok_or(DecodeError::StringOnly)
    }

    pub fn top_level_count(&self) -> Result<u32> {
        Ok(self.info()?.top_level_count)
    }

    fn info_at(&self, index: u32) -> Result<&PropertyInfo, DecodeError> {
        let info = self.info()?;
        info.properties.get(index as usize).ok_or(DecodeError::IndexOutOfRange {
            index,
            count: info.properties.len() as u32,
        })
    }

    fn top_level_at(&self, index: u32) -> Result<&PropertyInfo, DecodeError> {
        let info = self.info()?;
        if index >= info.top_level_count {
            return Err(DecodeError::IndexOutOfRange { index, count: info.top_level_count });
        }
        self.info_at(index)
    }

    /// Index of the first top-level property called `name`.
    pub fn find_property(&self, name: &str) -> Result<Option<u32>> {
        let info = self.info()?;
        Ok((0..info.top_level_count).find(|&i| name_matches(&info.properties[i as usize], name)))
    }

    /// Member index (relative to the struct) of the member called `name`.
    pub fn find_struct_member(&self, structure: &EventStructure, name: &str) -> Result<Option<u32>> {
        let info = self.info()?;
        Ok((0..structure.member_count).find(|&m| {
            info.properties
                .get((structure.start + m) as usize)
                .is_some_and(|p| name_matches(p, name))
        }))
    }

    pub fn is_property_struct(&self, index: u32) -> Result<bool> {
        Ok(self.top_level_at(index)?.is_struct())
    }

    pub fn structure(&self, index: u32) -> Result<EventStructure> {
        let p = self.top_level_at(index)?;
        match p.shape {
            PropertyShape::Struct { start_index, member_count } => Ok(EventStructure {
                name: p.name.clone(),
                start: u32::from(start_index),
                member_count: u32::from(member_count),
                top_level_index: index,
            }),
            PropertyShape::Scalar { .. } => Err(DecodeError::ExpectedStruct.into()),
        }
    }

    /// Element count of a top-level property.
    pub fn array_size(&self, index: u32) -> Result<u32> {
        self.top_level_at(index)?;
        self.resolved_len(index, None)
    }

    /// Element count of a struct member, taken from the first struct instance
    /// when it depends on a sibling member.
    pub fn member_array_size(&self, structure: &EventStructure, member: u32) -> Result<u32> {
        self.member_len(structure, 0, member)
    }

    pub(crate) fn member_len(&self, structure: &EventStructure, instance: u32, member: u32) -> Result<u32> {
        if member >= structure.member_count {
            return Err(DecodeError::IndexOutOfRange { index: member, count: structure.member_count }.into());
        }
        self.resolved_len(structure.start + member, Some((structure, instance)))
    }

    /// Declared count, or the value of the count property when the length is
    /// carried by a sibling.
    fn resolved_len(&self, index: u32, scope: Option<(&EventStructure, u32)>) -> Result<u32> {
        let p = self.info_at(index)?;
        if !p.has_param_count() {
            return Ok(u32::from(p.count));
        }

        let count_index = u32::from(p.count);
        if self.info_at(count_index)?.has_param_count() {
            return Err(DecodeError::MalformedSchema("count property is itself counted").into());
        }

        let top_level_count = self.info()?.top_level_count;
        let target = match scope {
            Some((structure, instance)) if structure.contains(count_index) => Target::Member {
                structure,
                instance,
                member: count_index - structure.start,
                element: 0,
                is_array: true,
                is_member_array: false,
            },
            _ if count_index < top_level_count => {
                Target::TopLevel { index: count_index, element: 0, is_array: false }
            }
            _ => return Err(DecodeError::MalformedSchema("count property outside scope").into()),
        };
        Ok(self.fetch(target)?.decode::<u32>()?)
    }

    /// Single-valued top-level property.
    pub fn property(&self, index: u32) -> Result<PropertyValue> {
        self.fetch(Target::TopLevel { index, element: 0, is_array: false })
    }

    /// One element of a top-level array property.
    pub fn element(&self, index: u32, element: u32) -> Result<PropertyValue> {
        self.fetch(Target::TopLevel { index, element, is_array: true })
    }

    /// Single-valued member of a single (non-array) struct.
    pub fn member(&self, structure: &EventStructure, member: u32) -> Result<PropertyValue> {
        self.fetch(Target::Member {
            structure,
            instance: 0,
            member,
            element: 0,
            is_array: false,
            is_member_array: false,
        })
    }

    /// Single-valued member of one instance of a struct array.
    pub fn struct_member(&self, structure: &EventStructure, instance: u32, member: u32) -> Result<PropertyValue> {
        self.fetch(Target::Member {
            structure,
            instance,
            member,
            element: 0,
            is_array: true,
            is_member_array: false,
        })
    }

    /// One element of an array member of one struct instance.
    pub fn member_element(
        &self,
        structure: &EventStructure,
        instance: u32,
        member: u32,
        element: u32,
    ) -> Result<PropertyValue> {
        self.fetch(Target::Member { structure, instance, member, element, is_array: true, is_member_array: true })
    }

    /// Decode the single-valued top-level property called `name`.
    pub fn decode<T: FromProperty>(&self, name: &str) -> Result<T> {
        self.try_decode(name)?
            .ok_or_else(|| DecodeError::PropertyNotFound(name.into()).into())
    }

    /// Like [`decode`](Self::decode) but a missing property is `None`.
    pub fn try_decode<T: FromProperty>(&self, name: &str) -> Result<Option<T>> {
        match self.find_property(name)? {
            Some(index) => Ok(Some(self.property(index)?.decode()?)),
            None => Ok(None),
        }
    }

    pub fn property_as<T: FromProperty>(&self, index: u32) -> Result<T> {
        Ok(self.property(index)?.decode()?)
    }

    pub fn element_as<T: FromProperty>(&self, index: u32, element: u32) -> Result<T> {
        Ok(self.element(index, element)?.decode()?)
    }

    pub fn member_as<T: FromProperty>(&self, structure: &EventStructure, member: u32) -> Result<T> {
        Ok(self.member(structure, member)?.decode()?)
    }

    pub fn struct_member_as<T: FromProperty>(
        &self,
        structure: &EventStructure,
        instance: u32,
        member: u32,
    ) -> Result<T> {
        Ok(self.struct_member(structure, instance, member)?.decode()?)
    }

    pub fn member_element_as<T: FromProperty>(
        &self,
        structure: &EventStructure,
        instance: u32,
        member: u32,
        element: u32,
    ) -> Result<T> {
        Ok(self.member_element(structure, instance, member, element)?.decode()?)
    }

    fn fetch(&self, target: Target<'_>) -> Result<PropertyValue> {
        let (top, element, is_array) = match target {
            Target::TopLevel { index, element, is_array } => (index, element, is_array),
            Target::Member { structure, instance, is_array, .. } => {
                (structure.top_level_index, instance, is_array)
            }
        };

        let top_info = self.top_level_at(top)?;
        let len = self.resolved_len(top, None)?;
        if !is_array && len != 1 {
            return Err(DecodeError::ExpectedSingleValue(len).into());
        }
        if element >= len {
            return Err(DecodeError::IndexOutOfBounds { index: element, len }.into());
        }

        let locators;
        let property = match target {
            Target::TopLevel { .. } => {
                if top_info.is_struct() {
                    return Err(DecodeError::UnexpectedStruct.into());
                }
                locators = vec![PropertyLocator { name: &top_info.name, array_index: element }];
                top_info
            }
            Target::Member { structure, instance, member, element: member_element, is_member_array, .. } => {
                if !top_info.is_struct() {
                    return Err(DecodeError::ExpectedStruct.into());
                }
                let member_len = self.member_len(structure, instance, member)?;
                if !is_member_array && member_len != 1 {
                    return Err(DecodeError::ExpectedSingleMember(member_len).into());
                }
                if member_element >= member_len {
                    return Err(DecodeError::IndexOutOfBounds { index: member_element, len: member_len }.into());
                }
                let member_info = self.info_at(structure.start + member)?;
                locators = vec![
                    PropertyLocator { name: &structure.name, array_index: instance },
                    PropertyLocator { name: &member_info.name, array_index: member_element },
                ];
                member_info
            }
        };

        let (in_type, out_type) = match property.shape {
            PropertyShape::Scalar { in_type, out_type } => (in_type, out_type),
            PropertyShape::Struct { .. } => return Err(DecodeError::UnexpectedStruct.into()),
        };

        let size = self
            .record
            .property_size(&locators)
            .map_err(|status| TraceError::os("get property size", status))?;
        let mut raw = vec![0u8; size as usize];
        self.record
            .property(&locators, &mut raw)
            .map_err(|status| TraceError::os("get property", status))?;

        Ok(PropertyValue::new(
            in_type,
            out_type,
            self.header.is_wide_pointer(),
            raw,
            property.name_string(),
        ))
    }
}

fn acquire(record: &dyn EventRecord) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; TRACE_EVENT_INFO_SIZE];
    let mut size = buffer.len() as u32;
    let mut status = record.event_information(&mut buffer, &mut size);
    if status == ERROR_INSUFFICIENT_BUFFER {
        buffer = vec![0u8; size as usize];
        status = record.event_information(&mut buffer, &mut size);
    }
    if status != ERROR_SUCCESS {
        return Err(TraceError::os("get event information", status));
    }
    Ok(buffer)
}

fn name_matches(p: &PropertyInfo, name: &str) -> bool {
    let stored = p.name.split_last().map_or(&p.name[..], |(_, rest)| rest);
    name.encode_utf16().eq(stored.iter().copied())
}
