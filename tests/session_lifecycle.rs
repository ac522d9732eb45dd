// tests/session_lifecycle.rs

mod common;

use std::sync::Arc;

use common::{DEFAULT_CONTROL_HANDLE, MockController, PROVIDER_A, PROVIDER_B};
use etw::etw::{ALL_KEYWORDS, SessionControl, TraceError, TraceLevel, TraceSession};

fn session(control: &Arc<MockController>) -> etw::etw::Result<TraceSession> {
    let control: Arc<dyn SessionControl> = control.clone();
    TraceSession::new("session-test", control)
}

#[test]
fn stale_session_is_replaced_once() {
    let control = MockController::new();
    control.script_start(&[Err(183), Ok(7)]);

    let s = session(&control).unwrap();
    assert_eq!(control.starts(), 2);
    assert_eq!(control.stops(), 1);

    s.enable(&PROVIDER_A, TraceLevel::Warning).unwrap();
    assert_eq!(control.enabled.lock().unwrap()[0], (7, PROVIDER_A, 3, ALL_KEYWORDS));
}

#[test]
fn second_collision_is_fatal() {
    let control = MockController::new();
    control.script_start(&[Err(183), Err(183)]);

    let err = session(&control).unwrap_err();
    assert!(matches!(err, TraceError::Os { op: "start trace session", status: 183 }));
    assert_eq!(control.starts(), 2);
}

#[test]
fn other_start_failures_do_not_retry() {
    let control = MockController::new();
    control.script_start(&[Err(5)]);

    assert_eq!(session(&control).unwrap_err().status(), Some(5));
    assert_eq!(control.starts(), 1);
    assert_eq!(control.stops(), 0);
}

#[test]
fn close_tolerates_vanished_session_and_is_idempotent() {
    let control = MockController::new();
    control.fail_stop_with(4201);

    let s = session(&control).unwrap();
    assert!(s.is_active());
    s.close().unwrap();
    s.close().unwrap();
    assert!(!s.is_active());

    drop(s);
    assert_eq!(control.stops(), 1);
}

#[test]
fn failed_close_keeps_session_active_and_retries() {
    let control = MockController::new();
    let s = session(&control).unwrap();
    control.fail_stop_with(5);

    assert_eq!(s.close().unwrap_err().status(), Some(5));
    assert!(s.is_active());
    s.enable(&PROVIDER_A, TraceLevel::Error).unwrap();

    control.clear_stop_failure();
    s.close().unwrap();
    assert!(!s.is_active());
    assert_eq!(control.stops(), 2);

    drop(s);
    assert_eq!(control.stops(), 2);
}

#[test]
fn drop_retries_a_failed_close() {
    let control = MockController::new();
    let s = session(&control).unwrap();
    control.fail_stop_with(5);
    assert!(s.close().is_err());

    control.clear_stop_failure();
    drop(s);
    assert_eq!(control.stops(), 2);
}

#[test]
fn drop_stops_the_session() {
    let control = MockController::new();
    drop(session(&control).unwrap());
    assert_eq!(control.stops(), 1);
}

#[test]
fn enable_passes_level_and_keywords() {
    let control = MockController::new();
    let s = session(&control).unwrap();

    s.enable_with_keywords(&PROVIDER_B, TraceLevel::Information, 0x70).unwrap();
    s.enable(&PROVIDER_A, TraceLevel::Verbose).unwrap();

    assert_eq!(
        *control.enabled.lock().unwrap(),
        [
            (DEFAULT_CONTROL_HANDLE, PROVIDER_B, 4, 0x70),
            (DEFAULT_CONTROL_HANDLE, PROVIDER_A, 5, ALL_KEYWORDS),
        ]
    );
}

#[test]
fn enable_after_close_is_refused() {
    let control = MockController::new();
    let s = session(&control).unwrap();
    s.close().unwrap();

    let err = s.enable(&PROVIDER_A, TraceLevel::Error).unwrap_err();
    assert!(matches!(err, TraceError::SessionClosed(name) if name == "session-test"));
    assert!(control.enabled.lock().unwrap().is_empty());
}
