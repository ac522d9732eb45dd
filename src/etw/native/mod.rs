//! OS seams for the tracing subsystem.
//!
//! Everything above this module is plain Rust: it talks to the kernel only
//! through the three traits below. The Windows implementation lives in
//! [`windows`]; tests plug in scripted implementations.
//!
//!   • [`EventRecord`]    ← one raw record, valid for a single callback
//!   • [`SessionControl`] ← StartTrace / ControlTrace / EnableTraceEx2
//!   • [`TraceConsumer`]  ← OpenTrace / ProcessTrace / CloseTrace

use std::sync::Arc;

use super::guid::Guid;

#[cfg(windows)]
pub mod windows;

#[cfg(test)]
pub(crate) mod mock;

#[cfg(windows)]
pub use self::windows::{WindowsConsumer, WindowsController, enumerate_providers, is_elevated};

/// Win32 error code as returned by the tracing APIs.
pub type Status = u32;

pub const ERROR_SUCCESS: Status = 0;
pub const ERROR_INVALID_HANDLE: Status = 6;
pub const ERROR_INVALID_PARAMETER: Status = 87;
pub const ERROR_INSUFFICIENT_BUFFER: Status = 122;
pub const ERROR_ALREADY_EXISTS: Status = 183;
pub const ERROR_NOT_FOUND: Status = 1168;
pub const ERROR_CANCELLED: Status = 1223;
pub const ERROR_WMI_INSTANCE_NOT_FOUND: Status = 4201;
pub const ERROR_CTX_CLOSE_PENDING: Status = 7007;

/// Session handle returned by `StartTrace`.
pub type ControlHandle = u64;
/// Consumer handle returned by `OpenTrace`.
pub type TraceHandle = u64;

pub const INVALID_TRACE_HANDLE: TraceHandle = u64::MAX;

/// `EVENT_HEADER.Flags` bits the decoder cares about.
pub const EVENT_HEADER_FLAG_STRING_ONLY: u16 = 0x0004;
pub const EVENT_HEADER_FLAG_32_BIT_HEADER: u16 = 0x0020;
pub const EVENT_HEADER_FLAG_64_BIT_HEADER: u16 = 0x0040;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventDescriptor {
    pub id: u16,
    pub version: u8,
    pub channel: u8,
    pub level: u8,
    pub opcode: u8,
    pub task: u16,
    pub keyword: u64,
}

/// Copy of the fixed part of a record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventHeader {
    pub flags: u16,
    pub thread_id: u32,
    pub process_id: u32,
    /// FILETIME ticks (100 ns since 1601-01-01) unless the session says otherwise.
    pub timestamp: i64,
    pub provider_id: Guid,
    pub descriptor: EventDescriptor,
}

impl EventHeader {
    pub fn is_string_only(&self) -> bool {
        self.flags & EVENT_HEADER_FLAG_STRING_ONLY != 0
    }

    /// Pointer-sized values in the payload are 8 bytes wide.
    pub fn is_wide_pointer(&self) -> bool {
        self.flags & EVENT_HEADER_FLAG_32_BIT_HEADER == 0
    }
}

/// One `PROPERTY_DATA_DESCRIPTOR`: a property name (NUL-terminated UTF-16)
/// plus the element index inside it.
#[derive(Debug, Clone, Copy)]
pub struct PropertyLocator<'a> {
    pub name: &'a [u16],
    pub array_index: u32,
}

/// Borrowed view of a raw event record.
///
/// Implementations wrap memory owned by the delivery loop; a `&dyn EventRecord`
/// must not outlive the callback it was handed to.
pub trait EventRecord {
    fn header(&self) -> EventHeader;

    /// Raw payload (`UserData`/`UserDataLength`).
    fn user_data(&self) -> &[u8];

    /// `TdhGetEventInformation`: fill `buffer` with the event's
    /// `TRACE_EVENT_INFO`. `buffer_size` carries the buffer length in and the
    /// required length out.
    fn event_information(&self, buffer: &mut [u8], buffer_size: &mut u32) -> Status;

    /// `TdhGetPropertySize` for the located property.
    fn property_size(&self, locators: &[PropertyLocator<'_>]) -> Result<u32, Status>;

    /// `TdhGetProperty`: copy exactly `buffer.len()` bytes of the located property.
    fn property(&self, locators: &[PropertyLocator<'_>], buffer: &mut [u8]) -> Result<(), Status>;
}

/// Controller side of a named session.
pub trait SessionControl: Send + Sync {
    /// Start a real-time session called `name`.
    fn start(&self, name: &str) -> Result<ControlHandle, Status>;

    /// Stop the session called `name`, whoever owns it.
    fn stop(&self, name: &str) -> Result<(), Status>;

    fn enable_provider(
        &self,
        handle: ControlHandle,
        provider: &Guid,
        level: u8,
        match_any_keywords: u64,
    ) -> Result<(), Status>;
}

/// Receives every record the delivery loop hands out, serially, on the thread
/// blocked in [`TraceConsumer::process`].
pub trait RecordSink: Send + Sync {
    fn on_record(&self, record: &dyn EventRecord);
}

/// Consumer side: real-time processing handles.
pub trait TraceConsumer: Send + Sync {
    /// Bind a real-time handle to the session called `session_name`.
    fn open(&self, session_name: &str, sink: Arc<dyn RecordSink>) -> Result<TraceHandle, Status>;

    /// Run the delivery loop until the handle is closed or the session ends.
    fn process(&self, handle: TraceHandle) -> Status;

    fn close(&self, handle: TraceHandle) -> Status;
}

/// UTF-16 with a trailing NUL, as the wide Win32 APIs expect.
pub fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(Some(0)).collect()
}

/// Text up to (not including) the first NUL.
pub fn from_wide(units: &[u16]) -> String {
    let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..end])
}
