//! Scripted records for unit tests: real `TRACE_EVENT_INFO` byte layouts and
//! TDH answers keyed by property locator path.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};

use super::{
    EVENT_HEADER_FLAG_64_BIT_HEADER, ERROR_INSUFFICIENT_BUFFER, ERROR_NOT_FOUND, ERROR_SUCCESS,
    EventDescriptor, EventHeader, EventRecord, PropertyLocator, Status, from_wide,
};
use crate::etw::guid::Guid;
use crate::etw::tdh::{
    EVENT_PROPERTY_INFO_SIZE, InType, PROPERTY_PARAM_COUNT, PROPERTY_STRUCT,
    TRACE_EVENT_INFO_HEADER,
};

pub(crate) const TEST_PROVIDER: Guid = Guid::from_fields(
    0x22fb_2cd6,
    0x0e7b,
    0x422b,
    [0xa0, 0xc7, 0x2f, 0xad, 0x1f, 0xd0, 0xe7, 0x16],
);

#[derive(Debug, Clone, Copy)]
pub(crate) enum Count {
    Fixed(u16),
    Param(u16),
}

struct Entry {
    flags: u32,
    name: String,
    first: u16,
    second: u16,
    count: u16,
    // struct members: offset into `members`, fixed up to an absolute index on build
    member_offset: Option<u16>,
}

fn entry(name: &str, in_type: InType, count: Count) -> Entry {
    let (flags, count) = match count {
        Count::Fixed(n) => (0, n),
        Count::Param(i) => (PROPERTY_PARAM_COUNT, i),
    };
    Entry { flags, name: name.into(), first: in_type.raw(), second: 0, count, member_offset: None }
}

pub(crate) struct SchemaBuilder {
    event_id: u16,
    message: Option<String>,
    provider_name: Option<String>,
    top: Vec<Entry>,
    members: Vec<Entry>,
}

impl SchemaBuilder {
    pub fn new(event_id: u16) -> Self {
        Self { event_id, message: None, provider_name: None, top: Vec::new(), members: Vec::new() }
    }

    pub fn message(mut self, text: &str) -> Self {
        self.message = Some(text.into());
        self
    }

    pub fn provider_name(mut self, text: &str) -> Self {
        self.provider_name = Some(text.into());
        self
    }

    pub fn scalar(self, name: &str, in_type: InType) -> Self {
        self.counted(name, in_type, Count::Fixed(1))
    }

    pub fn array(self, name: &str, in_type: InType, count: u16) -> Self {
        self.counted(name, in_type, Count::Fixed(count))
    }

    pub fn counted(mut self, name: &str, in_type: InType, count: Count) -> Self {
        self.top.push(entry(name, in_type, count));
        self
    }

    /// Struct property whose members follow all top-level properties.
    pub fn structure(mut self, name: &str, count: Count, members: &[(&str, InType, Count)]) -> Self {
        let mut e = entry(name, InType::Null, count);
        e.flags |= PROPERTY_STRUCT;
        e.first = 0;
        e.second = members.len() as u16;
        e.member_offset = Some(self.members.len() as u16);
        self.top.push(e);
        for (n, t, c) in members {
            self.members.push(entry(n, *t, *c));
        }
        self
    }

    pub fn build(self) -> Vec<u8> {
        let total = self.top.len() + self.members.len();
        let mut buf = vec![0u8; TRACE_EVENT_INFO_HEADER + total * EVENT_PROPERTY_INFO_SIZE];

        buf[0..16].copy_from_slice(&TEST_PROVIDER.to_bytes_le());
        buf[32..34].copy_from_slice(&self.event_id.to_le_bytes());
        buf[100..104].copy_from_slice(&(total as u32).to_le_bytes());
        buf[104..108].copy_from_slice(&(self.top.len() as u32).to_le_bytes());

        if let Some(name) = &self.provider_name {
            let at = append_wide(&mut buf, name);
            buf[52..56].copy_from_slice(&at.to_le_bytes());
        }
        if let Some(msg) = &self.message {
            let at = append_wide(&mut buf, msg);
            buf[76..80].copy_from_slice(&at.to_le_bytes());
        }

        let top_len = self.top.len() as u16;
        for (i, e) in self.top.iter().chain(self.members.iter()).enumerate() {
            let name_at = append_wide(&mut buf, &e.name);
            let first = match e.member_offset {
                Some(offset) => top_len + offset,
                None => e.first,
            };
            let at = TRACE_EVENT_INFO_HEADER + i * EVENT_PROPERTY_INFO_SIZE;
            buf[at..at + 4].copy_from_slice(&e.flags.to_le_bytes());
            buf[at + 4..at + 8].copy_from_slice(&name_at.to_le_bytes());
            buf[at + 8..at + 10].copy_from_slice(&first.to_le_bytes());
            buf[at + 10..at + 12].copy_from_slice(&e.second.to_le_bytes());
            buf[at + 16..at + 18].copy_from_slice(&e.count.to_le_bytes());
        }
        buf
    }
}

fn append_wide(buf: &mut Vec<u8>, text: &str) -> u32 {
    let at = buf.len() as u32;
    for unit in text.encode_utf16().chain(Some(0)) {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    at
}

/// Little-endian UTF-16 bytes, no terminator.
pub(crate) fn wide_bytes(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum InfoReply {
    TooSmall(u32),
    Fail(Status),
}

type LocatorPath = Vec<(String, u32)>;

pub(crate) struct MockRecord {
    header: EventHeader,
    user_data: Vec<u8>,
    schema: Vec<u8>,
    script: RefCell<VecDeque<InfoReply>>,
    values: HashMap<LocatorPath, Vec<u8>>,
    pub info_calls: Cell<u32>,
    pub last_info_buffer: Cell<usize>,
}

impl MockRecord {
    pub fn new(schema: Vec<u8>) -> Self {
        Self {
            header: EventHeader {
                flags: EVENT_HEADER_FLAG_64_BIT_HEADER,
                provider_id: TEST_PROVIDER,
                descriptor: EventDescriptor { id: 1, ..Default::default() },
                ..Default::default()
            },
            user_data: Vec::new(),
            schema,
            script: RefCell::new(VecDeque::new()),
            values: HashMap::new(),
            info_calls: Cell::new(0),
            last_info_buffer: Cell::new(0),
        }
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.header.flags = flags;
        self
    }

    pub fn provider(mut self, provider: Guid) -> Self {
        self.header.provider_id = provider;
        self
    }

    pub fn event_id(mut self, id: u16) -> Self {
        self.header.descriptor.id = id;
        self
    }

    pub fn user_data(mut self, data: Vec<u8>) -> Self {
        self.user_data = data;
        self
    }

    pub fn reply(self, reply: InfoReply) -> Self {
        self.script.borrow_mut().push_back(reply);
        self
    }

    /// Bytes returned for the locator path `[(name, index), ..]`.
    pub fn value(mut self, path: &[(&str, u32)], bytes: impl Into<Vec<u8>>) -> Self {
        let key = path.iter().map(|(n, i)| (n.to_string(), *i)).collect();
        self.values.insert(key, bytes.into());
        self
    }

    fn lookup(&self, locators: &[PropertyLocator<'_>]) -> Option<&Vec<u8>> {
        let key: LocatorPath =
            locators.iter().map(|l| (from_wide(l.name), l.array_index)).collect();
        self.values.get(&key)
    }
}

impl EventRecord for MockRecord {
    fn header(&self) -> EventHeader {
        self.header
    }

    fn user_data(&self) -> &[u8] {
        &self.user_data
    }

    fn event_information(&self, buffer: &mut [u8], buffer_size: &mut u32) -> Status {
        self.info_calls.set(self.info_calls.get() + 1);
        self.last_info_buffer.set(buffer.len());
        if let Some(reply) = self.script.borrow_mut().pop_front() {
            return match reply {
                InfoReply::TooSmall(n) => {
                    *buffer_size = n;
                    ERROR_INSUFFICIENT_BUFFER
                }
                InfoReply::Fail(status) => status,
            };
        }

        let needed = self.schema.len();
        if (*buffer_size as usize) < needed || buffer.len() < needed {
            *buffer_size = needed as u32;
            return ERROR_INSUFFICIENT_BUFFER;
        }
        buffer[..needed].copy_from_slice(&self.schema);
        *buffer_size = needed as u32;
        ERROR_SUCCESS
    }

    fn property_size(&self, locators: &[PropertyLocator<'_>]) -> Result<u32, Status> {
        self.lookup(locators).map(|v| v.len() as u32).ok_or(ERROR_NOT_FOUND)
    }

    fn property(&self, locators: &[PropertyLocator<'_>], buffer: &mut [u8]) -> Result<(), Status> {
        let value = self.lookup(locators).ok_or(ERROR_NOT_FOUND)?;
        if value.len() != buffer.len() {
            return Err(ERROR_INSUFFICIENT_BUFFER);
        }
        buffer.copy_from_slice(value);
        Ok(())
    }
}
