// src/etw/dispatch.rs
//! Listener registries and per-record fan-out.
//!
//! Fan-out order for every record:
//!   1. records from the trace-control provider are dropped
//!   2. global listeners
//!   3. listeners of the record's provider
//!   4. listeners of the exact (provider, event id) pair
//!
//! Listeners are snapshotted before any of them runs, so a listener may
//! unsubscribe itself (or others) mid-dispatch. Every call is isolated with
//! `catch_unwind`: a panicking listener is logged and dispatch carries on.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::Level;

use super::guid::{EVENT_TRACE_GUID, Guid};
use super::native::{EventRecord, RecordSink, Status};

pub type EventListener = dyn Fn(&dyn EventRecord) + Send + Sync;
pub type ErrorListener = dyn Fn(Status) + Send + Sync;
pub type StopListener = dyn Fn() + Send + Sync;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// 0 ▸ Signal – ordered listener list with removable slots
// ============================================================================

struct SlotTable<F: ?Sized> {
    next_id: u64,
    slots: Vec<(u64, Arc<F>)>,
}

trait Disconnect: Send + Sync {
    fn disconnect(&self, id: u64) -> bool;
    fn contains(&self, id: u64) -> bool;
}

impl<F: ?Sized + Send + Sync> Disconnect for Mutex<SlotTable<F>> {
    fn disconnect(&self, id: u64) -> bool {
        let mut table = lock(self);
        let before = table.slots.len();
        table.slots.retain(|(slot, _)| *slot != id);
        table.slots.len() != before
    }

    fn contains(&self, id: u64) -> bool {
        lock(self).slots.iter().any(|(slot, _)| *slot == id)
    }
}

/// Ordered set of listeners of one kind. Registration order is firing order.
pub struct Signal<F: ?Sized> {
    table: Arc<Mutex<SlotTable<F>>>,
}

impl<F: ?Sized> Default for Signal<F> {
    fn default() -> Self {
        Self { table: Arc::new(Mutex::new(SlotTable { next_id: 0, slots: Vec::new() })) }
    }
}

impl<F: ?Sized + Send + Sync + 'static> Signal<F> {
    pub fn connect(&self, listener: Arc<F>) -> Subscription {
        let id = {
            let mut table = lock(&self.table);
            let id = table.next_id;
            table.next_id += 1;
            table.slots.push((id, listener));
            id
        };
        let weak = Arc::downgrade(&self.table);
        let table: Weak<dyn Disconnect> = weak;
        Subscription { id, table }
    }

    /// Current listeners, detached from the table.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        lock(&self.table).slots.iter().map(|(_, f)| Arc::clone(f)).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.table).slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.table).slots.clear();
    }
}

/// Token returned by every registration. Dropping it keeps the listener
/// registered; call [`unsubscribe`](Self::unsubscribe) to remove it.
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    table: Weak<dyn Disconnect>,
}

impl Subscription {
    /// Remove exactly this listener. Returns `false` if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        self.table.upgrade().is_some_and(|t| t.disconnect(self.id))
    }

    pub fn is_connected(&self) -> bool {
        self.table.upgrade().is_some_and(|t| t.contains(self.id))
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// ============================================================================
// 1 ▸ Dispatcher – the record sink a trace hands to the delivery loop
// ============================================================================

#[derive(Default)]
pub struct Dispatcher {
    all: Signal<EventListener>,
    by_provider: Mutex<HashMap<Guid, Signal<EventListener>>>,
    by_event: Mutex<HashMap<(Guid, u16), Signal<EventListener>>>,
    errors: Signal<ErrorListener>,
    stops: Signal<StopListener>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&dyn EventRecord) + Send + Sync + 'static,
    {
        self.all.connect(Arc::new(listener))
    }

    pub fn on_provider_event<F>(&self, provider: Guid, listener: F) -> Subscription
    where
        F: Fn(&dyn EventRecord) + Send + Sync + 'static,
    {
        lock(&self.by_provider).entry(provider).or_default().connect(Arc::new(listener))
    }

    pub fn on_event_id<F>(&self, provider: Guid, event_id: u16, listener: F) -> Subscription
    where
        F: Fn(&dyn EventRecord) + Send + Sync + 'static,
    {
        lock(&self.by_event)
            .entry((provider, event_id))
            .or_default()
            .connect(Arc::new(listener))
    }

    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Status) + Send + Sync + 'static,
    {
        self.errors.connect(Arc::new(listener))
    }

    pub fn on_stop<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.stops.connect(Arc::new(listener))
    }

    pub fn dispatch(&self, record: &dyn EventRecord) {
        let header = record.header();
        if header.provider_id == EVENT_TRACE_GUID {
            return;
        }

        let mut listeners = self.all.snapshot();
        if let Some(signal) = lock(&self.by_provider).get(&header.provider_id) {
            listeners.extend(signal.snapshot());
        }
        if let Some(signal) = lock(&self.by_event).get(&(header.provider_id, header.descriptor.id)) {
            listeners.extend(signal.snapshot());
        }

        for listener in listeners {
            guarded("event", || listener(record));
        }
    }

    pub fn notify_error(&self, status: Status) {
        for listener in self.errors.snapshot() {
            guarded("error", || listener(status));
        }
    }

    pub fn notify_stop(&self) {
        for listener in self.stops.snapshot() {
            guarded("stop", || listener());
        }
    }

    /// Drop every registered listener.
    pub fn clear(&self) {
        self.all.clear();
        lock(&self.by_provider).clear();
        lock(&self.by_event).clear();
        self.errors.clear();
        self.stops.clear();
    }
}

impl RecordSink for Dispatcher {
    fn on_record(&self, record: &dyn EventRecord) {
        self.dispatch(record);
    }
}

/// Run one listener, containing any panic.
fn guarded(kind: &str, call: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(call)) {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".into());
        etw_log!(Level::Error, "dispatch", "{} listener panicked, contained: {}", kind, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etw::native::mock::{MockRecord, TEST_PROVIDER};

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recorder(log: &Log, tag: &'static str) -> impl Fn(&dyn EventRecord) + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |_: &dyn EventRecord| log.lock().unwrap().push(tag)
    }

    fn record(id: u16) -> MockRecord {
        MockRecord::new(Vec::new()).event_id(id)
    }

    #[test]
    fn fires_global_then_provider_then_exact() {
        let d = Dispatcher::new();
        let log = Log::default();
        // registered in reverse to show order comes from the key, not registration
        d.on_event_id(TEST_PROVIDER, 1, recorder(&log, "exact"));
        d.on_provider_event(TEST_PROVIDER, recorder(&log, "provider"));
        d.on_event(recorder(&log, "global"));
        d.on_event_id(TEST_PROVIDER, 2, recorder(&log, "other id"));

        d.dispatch(&record(1));
        assert_eq!(*log.lock().unwrap(), ["global", "provider", "exact"]);
    }

    #[test]
    fn trace_control_events_reach_nobody() {
        let d = Dispatcher::new();
        let log = Log::default();
        d.on_event(recorder(&log, "global"));
        d.on_provider_event(EVENT_TRACE_GUID, recorder(&log, "control"));

        d.dispatch(&record(0).provider(EVENT_TRACE_GUID));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_listener_is_contained() {
        let d = Dispatcher::new();
        let log = Log::default();
        d.on_event(|_| panic!("listener bug"));
        d.on_event(recorder(&log, "after"));

        d.dispatch(&record(1));
        d.dispatch(&record(1));
        assert_eq!(*log.lock().unwrap(), ["after", "after"]);
    }

    #[test]
    fn unsubscribe_removes_exactly_one_listener() {
        let d = Dispatcher::new();
        let log = Log::default();
        let first = d.on_event(recorder(&log, "first"));
        let second = d.on_event(recorder(&log, "second"));

        assert!(first.unsubscribe());
        assert!(!first.unsubscribe());
        assert!(!first.is_connected());
        assert!(second.is_connected());

        d.dispatch(&record(1));
        assert_eq!(*log.lock().unwrap(), ["second"]);
    }

    #[test]
    fn listener_may_unsubscribe_itself() {
        let d = Dispatcher::new();
        let hits = Arc::new(Mutex::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::default();

        let sub = d.on_event({
            let hits = Arc::clone(&hits);
            let slot = Arc::clone(&slot);
            move |_| {
                *hits.lock().unwrap() += 1;
                if let Some(me) = slot.lock().unwrap().as_ref() {
                    me.unsubscribe();
                }
            }
        });
        *slot.lock().unwrap() = Some(sub);

        d.dispatch(&record(1));
        d.dispatch(&record(1));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn error_and_stop_listeners_fire_in_order() {
        let d = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            d.on_error(move |status| seen.lock().unwrap().push(status));
        }
        {
            let seen = Arc::clone(&seen);
            d.on_stop(move || seen.lock().unwrap().push(0));
        }
        d.notify_error(6);
        d.notify_stop();
        assert_eq!(*seen.lock().unwrap(), [6, 0]);

        d.clear();
        d.notify_stop();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn subscription_outliving_dispatcher_is_inert() {
        let d = Dispatcher::new();
        let sub = d.on_event(|_| {});
        drop(d);
        assert!(!sub.is_connected());
        assert!(!sub.unsubscribe());
    }
}
