//! Win32 implementation of the tracing seams.
//! ------------------------------------------
//! Thin, unsafe-at-the-edges wrappers over `advapi32` (session control and
//! real-time consumption) and `tdh` (schema and property access).
//!
//!   StartTraceW ─▶ EnableTraceEx2 ─▶ OpenTraceW ─▶ ProcessTrace ─▶ CloseTrace
//!                                                  │
//!                                                  └─ on_event_record ─▶ RecordSink
//!
//! * The session properties block is `EVENT_TRACE_PROPERTIES` followed by
//!   room for the logger name; `StartTraceW` copies the name in itself.
//! * Every open consumer handle owns a boxed sink whose address travels in
//!   `EVENT_TRACE_LOGFILEW.Context` and comes back as `UserContext`.

use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::{self, offset_of};
use std::ptr;
use std::slice;
use std::sync::{Arc, Mutex};

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::Security::{GetTokenInformation, TOKEN_ELEVATION, TOKEN_QUERY, TokenElevation};
use windows_sys::Win32::System::Diagnostics::Etw::{
    CONTROLTRACE_HANDLE, CloseTrace, ControlTraceW, EVENT_CONTROL_CODE_ENABLE_PROVIDER, EVENT_RECORD,
    EVENT_TRACE_CONTROL_STOP, EVENT_TRACE_LOGFILEW, EVENT_TRACE_PROPERTIES, EVENT_TRACE_REAL_TIME_MODE,
    EnableTraceEx2, OpenTraceW, PROCESS_TRACE_MODE_EVENT_RECORD, PROCESS_TRACE_MODE_REAL_TIME,
    PROCESSTRACE_HANDLE, PROPERTY_DATA_DESCRIPTOR, PROVIDER_ENUMERATION_INFO, ProcessTrace, StartTraceW,
    TRACE_EVENT_INFO, TdhEnumerateProviders, TdhGetEventInformation, TdhGetProperty, TdhGetPropertySize,
    WNODE_FLAG_TRACED_GUID,
};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};
use windows_sys::core::GUID;

use super::{
    ControlHandle, ERROR_INSUFFICIENT_BUFFER, ERROR_INVALID_PARAMETER, ERROR_SUCCESS, EventDescriptor,
    EventHeader, EventRecord, INVALID_TRACE_HANDLE, PropertyLocator, RecordSink, SessionControl, Status,
    TraceConsumer, TraceHandle, to_wide,
};
use crate::etw::dispatch::lock;
use crate::etw::error::{Result, TraceError};
use crate::etw::guid::Guid;

/// Logger names longer than this (in UTF-16 units, NUL included) are refused.
const MAX_SESSION_NAME: usize = 1024;

fn native_guid(g: &Guid) -> GUID {
    GUID { data1: g.data1, data2: g.data2, data3: g.data3, data4: g.data4 }
}

fn crate_guid(g: &GUID) -> Guid {
    Guid::from_fields(g.data1, g.data2, g.data3, g.data4)
}

/// Zeroed scratch buffer with `u64` alignment, for TDH structures.
fn aligned(len: usize) -> Vec<u64> {
    vec![0u64; len.div_ceil(mem::size_of::<u64>())]
}

fn as_bytes(words: &[u64]) -> &[u8] {
    // SAFETY: u64 has no padding and u8 has alignment 1.
    unsafe { slice::from_raw_parts(words.as_ptr().cast::<u8>(), mem::size_of_val(words)) }
}

// ============================================================================
// 0 ▸ Records
// ============================================================================

/// A record borrowed for the duration of one callback.
pub struct WindowsRecord<'a>(&'a EVENT_RECORD);

impl WindowsRecord<'_> {
    fn descriptors(locators: &[PropertyLocator<'_>]) -> Vec<PROPERTY_DATA_DESCRIPTOR> {
        locators
            .iter()
            .map(|l| PROPERTY_DATA_DESCRIPTOR {
                PropertyName: l.name.as_ptr() as u64,
                ArrayIndex: l.array_index,
                Reserved: 0,
            })
            .collect()
    }
}

impl EventRecord for WindowsRecord<'_> {
    fn header(&self) -> EventHeader {
        let h = &self.0.EventHeader;
        let d = &h.EventDescriptor;
        EventHeader {
            flags: h.Flags,
            thread_id: h.ThreadId,
            process_id: h.ProcessId,
            timestamp: h.TimeStamp,
            provider_id: crate_guid(&h.ProviderId),
            descriptor: EventDescriptor {
                id: d.Id,
                version: d.Version,
                channel: d.Channel,
                level: d.Level,
                opcode: d.Opcode,
                task: d.Task,
                keyword: d.Keyword,
            },
        }
    }

    fn user_data(&self) -> &[u8] {
        let len = self.0.UserDataLength as usize;
        if self.0.UserData.is_null() || len == 0 {
            return &[];
        }
        // SAFETY: the OS guarantees UserDataLength readable bytes at UserData
        // for as long as the record is borrowed.
        unsafe { slice::from_raw_parts(self.0.UserData.cast::<u8>(), len) }
    }

    fn event_information(&self, buffer: &mut [u8], buffer_size: &mut u32) -> Status {
        let mut size = (*buffer_size).min(buffer.len() as u32);
        let mut scratch = aligned(size as usize);
        let out = if size == 0 {
            ptr::null_mut()
        } else {
            scratch.as_mut_ptr().cast::<TRACE_EVENT_INFO>()
        };

        let status = unsafe { TdhGetEventInformation(self.0, 0, ptr::null(), out, &mut size) };
        if status == ERROR_SUCCESS {
            let n = (size as usize).min(buffer.len());
            buffer[..n].copy_from_slice(&as_bytes(&scratch)[..n]);
        }
        *buffer_size = size;
        status
    }

    fn property_size(&self, locators: &[PropertyLocator<'_>]) -> std::result::Result<u32, Status> {
        let descriptors = Self::descriptors(locators);
        let mut size = 0u32;
        let status = unsafe {
            TdhGetPropertySize(
                self.0,
                0,
                ptr::null(),
                descriptors.len() as u32,
                descriptors.as_ptr(),
                &mut size,
            )
        };
        match status {
            ERROR_SUCCESS => Ok(size),
            status => Err(status),
        }
    }

    fn property(&self, locators: &[PropertyLocator<'_>], buffer: &mut [u8]) -> std::result::Result<(), Status> {
        let descriptors = Self::descriptors(locators);
        let status = unsafe {
            TdhGetProperty(
                self.0,
                0,
                ptr::null(),
                descriptors.len() as u32,
                descriptors.as_ptr(),
                buffer.len() as u32,
                buffer.as_mut_ptr(),
            )
        };
        match status {
            ERROR_SUCCESS => Ok(()),
            status => Err(status),
        }
    }
}

// ============================================================================
// 1 ▸ Session control
// ============================================================================

#[repr(C)]
struct SessionProperties {
    native: EVENT_TRACE_PROPERTIES,
    logger_name: [u16; MAX_SESSION_NAME],
}

impl SessionProperties {
    fn realtime() -> Box<Self> {
        // SAFETY: both fields are plain C data for which all-zero is valid.
        let mut props: Box<Self> = Box::new(unsafe { mem::zeroed() });
        props.native.Wnode.BufferSize = mem::size_of::<Self>() as u32;
        props.native.Wnode.Flags = WNODE_FLAG_TRACED_GUID;
        props.native.Wnode.ClientContext = 1; // QPC timestamps
        props.native.LogFileMode = EVENT_TRACE_REAL_TIME_MODE;
        props.native.LoggerNameOffset = offset_of!(SessionProperties, logger_name) as u32;
        props
    }

    fn as_mut_ptr(&mut self) -> *mut EVENT_TRACE_PROPERTIES {
        &mut self.native
    }
}

fn session_name(name: &str) -> std::result::Result<Vec<u16>, Status> {
    let wide = to_wide(name);
    if wide.len() > MAX_SESSION_NAME {
        return Err(ERROR_INVALID_PARAMETER);
    }
    Ok(wide)
}

/// `StartTraceW` / `ControlTraceW` / `EnableTraceEx2`.
#[derive(Debug, Default)]
pub struct WindowsController;

impl SessionControl for WindowsController {
    fn start(&self, name: &str) -> std::result::Result<ControlHandle, Status> {
        let wide = session_name(name)?;
        let mut props = SessionProperties::realtime();
        let mut handle = CONTROLTRACE_HANDLE { Value: 0 };

        let status = unsafe { StartTraceW(&mut handle, wide.as_ptr(), props.as_mut_ptr()) };
        match status {
            ERROR_SUCCESS => Ok(handle.Value),
            status => Err(status),
        }
    }

    fn stop(&self, name: &str) -> std::result::Result<(), Status> {
        let wide = session_name(name)?;
        let mut props = SessionProperties::realtime();

        let status = unsafe {
            ControlTraceW(
                CONTROLTRACE_HANDLE { Value: 0 },
                wide.as_ptr(),
                props.as_mut_ptr(),
                EVENT_TRACE_CONTROL_STOP,
            )
        };
        match status {
            ERROR_SUCCESS => Ok(()),
            status => Err(status),
        }
    }

    fn enable_provider(
        &self,
        handle: ControlHandle,
        provider: &Guid,
        level: u8,
        match_any_keywords: u64,
    ) -> std::result::Result<(), Status> {
        let guid = native_guid(provider);
        let status = unsafe {
            EnableTraceEx2(
                CONTROLTRACE_HANDLE { Value: handle },
                &guid,
                EVENT_CONTROL_CODE_ENABLE_PROVIDER,
                level,
                match_any_keywords,
                0,
                0,
                ptr::null(),
            )
        };
        match status {
            ERROR_SUCCESS => Ok(()),
            status => Err(status),
        }
    }
}

// ============================================================================
// 2 ▸ Real-time consumption
// ============================================================================

struct SinkSlot {
    // double box: the context pointer must be thin
    sink: Box<Arc<dyn RecordSink>>,
    processing: bool,
}

/// `OpenTraceW` / `ProcessTrace` / `CloseTrace`.
#[derive(Default)]
pub struct WindowsConsumer {
    sinks: Mutex<HashMap<TraceHandle, SinkSlot>>,
}

unsafe extern "system" fn on_event_record(record: *mut EVENT_RECORD) {
    // SAFETY: the OS hands us a record that lives until we return, and
    // UserContext is the `Arc<dyn RecordSink>` registered in `open`, which
    // stays boxed in `sinks` until `process` returns.
    let Some(record) = (unsafe { record.as_ref() }) else {
        return;
    };
    let sink = record.UserContext as *const Arc<dyn RecordSink>;
    if let Some(sink) = unsafe { sink.as_ref() } {
        sink.on_record(&WindowsRecord(record));
    }
}

impl TraceConsumer for WindowsConsumer {
    fn open(&self, session_name: &str, sink: Arc<dyn RecordSink>) -> std::result::Result<TraceHandle, Status> {
        let mut wide = to_wide(session_name);
        let sink = Box::new(sink);

        // SAFETY: all-zero is a valid EVENT_TRACE_LOGFILEW.
        let mut logfile: EVENT_TRACE_LOGFILEW = unsafe { mem::zeroed() };
        logfile.LoggerName = wide.as_mut_ptr();
        logfile.Anonymous1.ProcessTraceMode = PROCESS_TRACE_MODE_REAL_TIME | PROCESS_TRACE_MODE_EVENT_RECORD;
        logfile.Anonymous2.EventRecordCallback = Some(on_event_record);
        logfile.Context = sink.as_ref() as *const Arc<dyn RecordSink> as *mut c_void;

        let handle = unsafe { OpenTraceW(&mut logfile) }.Value;
        if handle == INVALID_TRACE_HANDLE {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(-1) as Status);
        }

        lock(&self.sinks).insert(handle, SinkSlot { sink, processing: false });
        Ok(handle)
    }

    fn process(&self, handle: TraceHandle) -> Status {
        if let Some(slot) = lock(&self.sinks).get_mut(&handle) {
            slot.processing = true;
        }

        let handles = [PROCESSTRACE_HANDLE { Value: handle }];
        let status = unsafe { ProcessTrace(handles.as_ptr(), 1, ptr::null(), ptr::null()) };

        lock(&self.sinks).remove(&handle);
        status
    }

    fn close(&self, handle: TraceHandle) -> Status {
        let status = unsafe { CloseTrace(PROCESSTRACE_HANDLE { Value: handle }) };

        // a running delivery loop still owns the sink until ProcessTrace returns
        let mut sinks = lock(&self.sinks);
        if sinks.get(&handle).is_some_and(|slot| !slot.processing) {
            sinks.remove(&handle);
        }
        status
    }
}

// ============================================================================
// 3 ▸ Provider enumeration and privileges
// ============================================================================

/// Raw `PROVIDER_ENUMERATION_INFO` blob for every registered provider.
pub fn enumerate_providers() -> Result<Vec<u8>> {
    let mut size = 0u32;
    let mut scratch: Vec<u64> = Vec::new();

    // the provider set can grow between the size query and the fetch
    loop {
        let out = if scratch.is_empty() {
            ptr::null_mut()
        } else {
            scratch.as_mut_ptr().cast::<PROVIDER_ENUMERATION_INFO>()
        };
        let status = unsafe { TdhEnumerateProviders(out, &mut size) };
        match status {
            ERROR_SUCCESS => {
                let bytes = as_bytes(&scratch);
                return Ok(bytes[..(size as usize).min(bytes.len())].to_vec());
            }
            ERROR_INSUFFICIENT_BUFFER => scratch = aligned(size as usize),
            status => return Err(TraceError::os("enumerate providers", status)),
        }
    }
}

/// Whether the current process token is elevated. Session control needs it.
pub fn is_elevated() -> bool {
    let mut token: HANDLE = ptr::null_mut();
    if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) } == 0 {
        return false;
    }

    let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
    let mut returned = 0u32;
    let ok = unsafe {
        GetTokenInformation(
            token,
            TokenElevation,
            (&mut elevation as *mut TOKEN_ELEVATION).cast::<c_void>(),
            mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        )
    };
    unsafe { CloseHandle(token) };
    ok != 0 && elevation.TokenIsElevated != 0
}
