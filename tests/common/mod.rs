//! Scripted OS layer shared by the integration tests.
//!
//! * `MockController` answers `StartTrace`/`ControlTrace`/`EnableTraceEx2`
//!   from a script and counts calls.
//! * `MockConsumer` runs a fake delivery loop: records pushed with
//!   [`MockConsumer::feed`] are handed to the sink on the thread blocked in
//!   `process`, until an `End(status)` arrives or the handle is closed.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Receiver, Sender};

use etw::etw::Guid;
use etw::etw::native::{
    ControlHandle, ERROR_CTX_CLOSE_PENDING, ERROR_INVALID_HANDLE, ERROR_NOT_FOUND, ERROR_SUCCESS,
    EventDescriptor, EventHeader, EventRecord, PropertyLocator, RecordSink, SessionControl, Status,
    TraceConsumer, TraceHandle,
};

pub const PROVIDER_A: Guid =
    Guid::from_fields(0x22fb_2cd6, 0x0e7b, 0x422b, [0xa0, 0xc7, 0x2f, 0xad, 0x1f, 0xd0, 0xe7, 0x16]);
pub const PROVIDER_B: Guid =
    Guid::from_fields(0xedd0_8927, 0x9cc4, 0x4e65, [0xb9, 0x70, 0xc2, 0x56, 0x0f, 0xb5, 0xc2, 0x89]);

/// Header-only record; every TDH call reports "not found".
#[derive(Debug, Clone, Copy)]
pub struct StubRecord {
    header: EventHeader,
}

impl StubRecord {
    pub fn new(provider: Guid, event_id: u16) -> Self {
        Self {
            header: EventHeader {
                provider_id: provider,
                descriptor: EventDescriptor { id: event_id, ..Default::default() },
                ..Default::default()
            },
        }
    }
}

impl EventRecord for StubRecord {
    fn header(&self) -> EventHeader {
        self.header
    }

    fn user_data(&self) -> &[u8] {
        &[]
    }

    fn event_information(&self, _buffer: &mut [u8], _buffer_size: &mut u32) -> Status {
        ERROR_NOT_FOUND
    }

    fn property_size(&self, _locators: &[PropertyLocator<'_>]) -> Result<u32, Status> {
        Err(ERROR_NOT_FOUND)
    }

    fn property(&self, _locators: &[PropertyLocator<'_>], _buffer: &mut [u8]) -> Result<(), Status> {
        Err(ERROR_NOT_FOUND)
    }
}

/*──────────────────────── session control ─────────────────────────*/

pub const DEFAULT_CONTROL_HANDLE: ControlHandle = 42;

#[derive(Default)]
pub struct MockController {
    start_script: Mutex<VecDeque<Result<ControlHandle, Status>>>,
    stop_failure: Mutex<Option<Status>>,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
    pub enabled: Mutex<Vec<(ControlHandle, Guid, u8, u64)>>,
}

impl MockController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Next answers of `start`, in order; afterwards `Ok(DEFAULT_CONTROL_HANDLE)`.
    pub fn script_start(&self, results: &[Result<ControlHandle, Status>]) {
        self.start_script.lock().unwrap().extend(results.iter().copied());
    }

    pub fn fail_stop_with(&self, status: Status) {
        *self.stop_failure.lock().unwrap() = Some(status);
    }

    pub fn clear_stop_failure(&self) {
        *self.stop_failure.lock().unwrap() = None;
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }
}

impl SessionControl for MockController {
    fn start(&self, _name: &str) -> Result<ControlHandle, Status> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.start_script.lock().unwrap().pop_front().unwrap_or(Ok(DEFAULT_CONTROL_HANDLE))
    }

    fn stop(&self, _name: &str) -> Result<(), Status> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        match *self.stop_failure.lock().unwrap() {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn enable_provider(&self, handle: ControlHandle, provider: &Guid, level: u8, keywords: u64) -> Result<(), Status> {
        self.enabled.lock().unwrap().push((handle, *provider, level, keywords));
        Ok(())
    }
}

/*──────────────────────── consumer ─────────────────────────*/

pub enum Feed {
    Record(StubRecord),
    End(Status),
}

/// What `close` does to a running delivery loop.
#[derive(Debug, Clone, Copy)]
pub enum CloseBehaviour {
    /// Succeeds and ends the loop.
    EndLoop,
    /// Fails with the status; the loop keeps running.
    Refuse(Status),
    /// Reports close-pending; the loop keeps running until fed `End`.
    Pending,
}

pub struct MockConsumer {
    feed_tx: Sender<Feed>,
    feed_rx: Receiver<Feed>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    sinks: Mutex<HashMap<TraceHandle, Arc<dyn RecordSink>>>,
    closed: Mutex<HashSet<TraceHandle>>,
    next_handle: AtomicU64,
    behaviour: Mutex<CloseBehaviour>,
    open_failure: Mutex<Option<Status>>,
    pub opens: AtomicU32,
    pub processes: AtomicU32,
    pub closes: AtomicU32,
}

impl MockConsumer {
    pub fn new() -> Arc<Self> {
        Self::with_close(CloseBehaviour::EndLoop)
    }

    pub fn with_close(behaviour: CloseBehaviour) -> Arc<Self> {
        let (feed_tx, feed_rx) = channel::unbounded();
        let (wake_tx, wake_rx) = channel::unbounded();
        Arc::new(Self {
            feed_tx,
            feed_rx,
            wake_tx,
            wake_rx,
            sinks: Mutex::default(),
            closed: Mutex::default(),
            next_handle: AtomicU64::new(1),
            behaviour: Mutex::new(behaviour),
            open_failure: Mutex::new(None),
            opens: AtomicU32::new(0),
            processes: AtomicU32::new(0),
            closes: AtomicU32::new(0),
        })
    }

    pub fn fail_open_with(&self, status: Status) {
        *self.open_failure.lock().unwrap() = Some(status);
    }

    pub fn feed(&self, record: StubRecord) {
        let _ = self.feed_tx.send(Feed::Record(record));
    }

    pub fn end(&self, status: Status) {
        let _ = self.feed_tx.send(Feed::End(status));
    }

    pub fn processes(&self) -> u32 {
        self.processes.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl TraceConsumer for MockConsumer {
    fn open(&self, _session_name: &str, sink: Arc<dyn RecordSink>) -> Result<TraceHandle, Status> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.open_failure.lock().unwrap() {
            return Err(status);
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().unwrap().insert(handle, sink);
        Ok(handle)
    }

    fn process(&self, handle: TraceHandle) -> Status {
        self.processes.fetch_add(1, Ordering::SeqCst);
        let Some(sink) = self.sinks.lock().unwrap().get(&handle).cloned() else {
            return ERROR_INVALID_HANDLE;
        };

        loop {
            if self.closed.lock().unwrap().contains(&handle) {
                return ERROR_SUCCESS;
            }
            crossbeam::select! {
                recv(self.feed_rx) -> msg => match msg {
                    Ok(Feed::Record(record)) => sink.on_record(&record),
                    Ok(Feed::End(status)) => return status,
                    Err(_) => return ERROR_SUCCESS,
                },
                recv(self.wake_rx) -> _ => {}
            }
        }
    }

    fn close(&self, handle: TraceHandle) -> Status {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match *self.behaviour.lock().unwrap() {
            CloseBehaviour::EndLoop => {
                self.closed.lock().unwrap().insert(handle);
                let _ = self.wake_tx.send(());
                ERROR_SUCCESS
            }
            CloseBehaviour::Refuse(status) => status,
            CloseBehaviour::Pending => ERROR_CTX_CLOSE_PENDING,
        }
    }
}
