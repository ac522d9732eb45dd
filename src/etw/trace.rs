// src/etw/trace.rs
//! Real-time consumer bound to one session.
//!
//! State machine
//! ─────────────
//!   Idle ──run / run_async──▶ Running ──stop──▶ Stopping ──▶ Idle
//!
//!   • `run` blocks the caller in the delivery loop.
//!   • `run_async` moves the loop onto one named worker thread.
//!   • A second start while not `Idle` is a silent no-op.
//!   • `stop` closes the handle. A clean close is followed by a bounded join
//!     of the worker; a refused close abandons (detaches) it.
//!   • After `stop` the handle is gone: `run` reports `NotOpen` until
//!     [`Trace::reopen`] binds a fresh one.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver};
use log::Level;

use super::dispatch::{Dispatcher, Subscription, lock};
use super::error::{Result, TraceError};
use super::guid::Guid;
use super::native::{
    ERROR_CANCELLED, ERROR_CTX_CLOSE_PENDING, ERROR_SUCCESS, EventRecord, INVALID_TRACE_HANDLE,
    RecordSink, Status, TraceConsumer, TraceHandle,
};
use super::sessions::TraceSession;

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;

/// How [`Trace::stop`] left the delivery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Handle closed; there was no worker thread to wait for.
    Stopped,
    /// Handle closed and the worker thread finished.
    Joined,
    /// The worker thread was detached: the close was refused or the join
    /// timed out.
    Abandoned,
}

/// Delivery thread plus the signal it sends when its loop has returned.
struct Worker {
    thread: JoinHandle<()>,
    done: Receiver<()>,
}

struct TraceInner {
    session_name: String,
    consumer: Arc<dyn TraceConsumer>,
    dispatcher: Arc<Dispatcher>,
    handle: AtomicU64,
    state: AtomicU8,
    worker: Mutex<Option<Worker>>,
    join_timeout: Mutex<Duration>,
}

pub struct Trace {
    inner: Arc<TraceInner>,
}

impl Trace {
    /// Open a real-time handle on `session`.
    pub fn open(session: &TraceSession, consumer: Arc<dyn TraceConsumer>) -> Result<Self> {
        Self::open_named(session.name(), consumer)
    }

    /// Open a real-time handle on the session called `session_name`, which
    /// may be owned by another process.
    pub fn open_named(session_name: &str, consumer: Arc<dyn TraceConsumer>) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::new());
        let handle = open_handle(consumer.as_ref(), session_name, &dispatcher)?;
        log::debug!("opened trace handle {handle:#x} on '{session_name}'");

        Ok(Self {
            inner: Arc::new(TraceInner {
                session_name: session_name.to_owned(),
                consumer,
                dispatcher,
                handle: AtomicU64::new(handle),
                state: AtomicU8::new(IDLE),
                worker: Mutex::new(None),
                join_timeout: Mutex::new(DEFAULT_JOIN_TIMEOUT),
            }),
        })
    }

    /// Open `session` through the OS consumer API.
    #[cfg(windows)]
    pub fn open_realtime(session: &TraceSession) -> Result<Self> {
        Self::open(session, Arc::new(super::native::WindowsConsumer::default()))
    }

    pub fn session_name(&self) -> &str {
        &self.inner.session_name
    }

    /// Upper bound on how long `stop` waits for the worker thread.
    pub fn set_join_timeout(&self, timeout: Duration) {
        *lock(&self.inner.join_timeout) = timeout;
    }

    /*──────────────────────── registration ─────────────────────────*/

    /// Every record, whatever its provider.
    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&dyn EventRecord) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_event(listener)
    }

    pub fn on_provider_event<F>(&self, provider: Guid, listener: F) -> Subscription
    where
        F: Fn(&dyn EventRecord) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_provider_event(provider, listener)
    }

    pub fn on_event_id<F>(&self, provider: Guid, event_id: u16, listener: F) -> Subscription
    where
        F: Fn(&dyn EventRecord) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_event_id(provider, event_id, listener)
    }

    /// Delivery loop failures of `run_async`.
    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Status) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_error(listener)
    }

    /// Normal or cancelled end of the delivery loop.
    pub fn on_stop<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_stop(listener)
    }

    /*──────────────────────── lifecycle ─────────────────────────*/

    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == RUNNING
    }

    /// Process records on the calling thread until the loop ends.
    pub fn run(&self) -> Result<()> {
        let Some(handle) = self.inner.begin()? else {
            return Ok(());
        };
        let status = self.inner.consumer.process(handle);
        self.inner.finish(status)
    }

    /// Process records on a dedicated thread and return immediately.
    pub fn run_async(&self) -> Result<()> {
        // held across the spawn so a concurrent `stop` always sees the worker
        let mut slot = lock(&self.inner.worker);
        let Some(handle) = self.inner.begin()? else {
            return Ok(());
        };

        let (done_tx, done) = channel::bounded(1);
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("etw-trace:{}", self.inner.session_name))
            .spawn(move || {
                let status = inner.consumer.process(handle);
                if let Err(e) = inner.finish(status) {
                    etw_log!(Level::Error, "trace", session = inner.session_name; "{e}");
                    inner.dispatcher.notify_error(status);
                }
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(thread) => {
                *slot = Some(Worker { thread, done });
                Ok(())
            }
            Err(e) => {
                self.inner.state.store(IDLE, Ordering::Release);
                Err(TraceError::Io(e))
            }
        }
    }

    /// Close the handle and wind the delivery loop down. Idempotent.
    pub fn stop(&self) -> StopOutcome {
        self.inner.stop()
    }

    /// Bind a fresh handle after `stop`. No-op while a handle is open.
    pub fn reopen(&self) -> Result<()> {
        if self.inner.handle.load(Ordering::Acquire) != INVALID_TRACE_HANDLE {
            return Ok(());
        }
        let handle = open_handle(self.inner.consumer.as_ref(), &self.inner.session_name, &self.inner.dispatcher)?;
        self.inner.handle.store(handle, Ordering::Release);
        Ok(())
    }

    /// Weak handle an interrupt handler can use to stop this trace.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { inner: Arc::downgrade(&self.inner) }
    }
}

impl Drop for Trace {
    fn drop(&mut self) {
        self.inner.dispatcher.clear();
        self.inner.stop();
    }
}

fn open_handle(consumer: &dyn TraceConsumer, session_name: &str, dispatcher: &Arc<Dispatcher>) -> Result<TraceHandle> {
    let sink: Arc<dyn RecordSink> = Arc::clone(dispatcher) as Arc<dyn RecordSink>;
    consumer
        .open(session_name, sink)
        .map_err(|status| TraceError::os("open trace", status))
}

impl TraceInner {
    /// Claim the Idle → Running transition. `None` when already started.
    fn begin(&self) -> Result<Option<TraceHandle>> {
        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("trace '{}' already started, ignoring", self.session_name);
            return Ok(None);
        }

        let handle = self.handle.load(Ordering::Acquire);
        if handle == INVALID_TRACE_HANDLE {
            self.state.store(IDLE, Ordering::Release);
            return Err(TraceError::NotOpen);
        }
        Ok(Some(handle))
    }

    fn finish(&self, status: Status) -> Result<()> {
        match status {
            ERROR_SUCCESS | ERROR_CANCELLED => {
                log::debug!("delivery loop for '{}' ended ({status})", self.session_name);
                self.dispatcher.notify_stop();
                Ok(())
            }
            _ => Err(TraceError::Delivery(status)),
        }
    }

    fn stop(&self) -> StopOutcome {
        self.state.store(STOPPING, Ordering::Release);
        let handle = self.handle.swap(INVALID_TRACE_HANDLE, Ordering::AcqRel);
        let worker = lock(&self.worker).take();

        let closed = handle == INVALID_TRACE_HANDLE || {
            let status = self.consumer.close(handle);
            matches!(status, ERROR_SUCCESS | ERROR_CTX_CLOSE_PENDING) || {
                etw_log!(
                    Level::Error,
                    "trace",
                    session = self.session_name;
                    "closing handle failed with status {status}, abandoning delivery thread"
                );
                false
            }
        };

        let outcome = match worker {
            None => StopOutcome::Stopped,
            Some(_) if !closed => StopOutcome::Abandoned,
            Some(worker) if worker.thread.thread().id() == thread::current().id() => {
                // stop requested from a listener: the loop unwinds once we return
                StopOutcome::Stopped
            }
            Some(worker) => self.join(worker),
        };

        self.state.store(IDLE, Ordering::Release);
        outcome
    }

    fn join(&self, worker: Worker) -> StopOutcome {
        let timeout = *lock(&self.join_timeout);
        // a disconnected channel means the thread unwound without signalling
        if let Err(channel::RecvTimeoutError::Timeout) = worker.done.recv_timeout(timeout) {
            etw_log!(
                Level::Warn,
                "trace",
                session = self.session_name;
                "delivery thread still running after {}, detaching",
                humantime::format_duration(timeout)
            );
            return StopOutcome::Abandoned;
        }

        if worker.thread.join().is_err() {
            etw_log!(Level::Error, "trace", session = self.session_name; "delivery thread panicked");
        }
        StopOutcome::Joined
    }
}

/// Weak, thread-safe stop trigger. Does not keep the trace alive.
#[derive(Clone)]
pub struct StopHandle {
    inner: Weak<TraceInner>,
}

impl StopHandle {
    /// Stop the trace if it still exists.
    pub fn stop(&self) -> Option<StopOutcome> {
        self.inner.upgrade().map(|inner| inner.stop())
    }
}
