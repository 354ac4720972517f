use std::thread;

use midb::session::config::SessionConfig;
use midb::session::protocol::{ExceptionDetails, ExceptionState, StopPayload, StopReason};
use uuid::Uuid;

use crate::common::{
    breakpoint_hit_stop, signal_stop, single_outcome, start_session, start_session_with,
    stop_with_reason, wait_for, DriverCall, Outward, RecordingHook,
};
use midb::session::protocol::BreakpointSpec;

#[test]
fn test_implicit_entry_stop_resumes_once() {
    let t = start_session();
    t.session.dispatch_stop(StopPayload::default()).unwrap();

    assert!(wait_for(|| t.driver.calls().contains(&DriverCall::Resume)));
    assert!(t.hook.events().is_empty());
    t.session.shutdown();
    // a resume was issued exactly once and nothing was reported outward
    assert_eq!(
        t.driver
            .calls()
            .iter()
            .filter(|c| **c == DriverCall::Resume)
            .count(),
        1
    );
}

#[test]
fn test_reasonless_stop_without_heuristic_is_async_break() {
    let config = SessionConfig {
        implicit_entry_stop: false,
        ..SessionConfig::default()
    };
    let t = start_session_with(RecordingHook::default(), config);
    t.session.dispatch_stop(StopPayload::default()).unwrap();
    t.session.shutdown();

    assert_eq!(t.hook.events(), vec![Outward::AsyncBreak]);
    assert!(!t.driver.calls().contains(&DriverCall::Resume));
}

#[test]
fn test_entry_point_hit_reported() {
    let t = start_session();
    t.session
        .dispatch_stop(stop_with_reason(StopReason::EntryPointHit))
        .unwrap();
    t.session.shutdown();
    assert_eq!(t.hook.events(), vec![Outward::EntryPoint]);
}

#[test]
fn test_breakpoint_hit_reported_with_bindings() {
    let t = start_session();
    t.driver.push_outcome(single_outcome("1", 0x1000));
    let id = t.session.create_breakpoint(BreakpointSpec::at_source("main.rs", 10));
    t.session.bind_outstanding().unwrap();

    t.session
        .dispatch_stop(stop_with_reason(StopReason::EntryPointHit))
        .unwrap();
    t.session.dispatch_stop(breakpoint_hit_stop("1", 0x1000)).unwrap();
    t.session.shutdown();

    let events = t.hook.events();
    assert_eq!(events.len(), 2);
    let Outward::BreakpointsHit(hits) = &events[1] else {
        panic!("expected a breakpoint hit, got {events:?}");
    };
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].breakpoint, id);
    assert_eq!(hits[0].address, 0x1000);
    assert_eq!(hits[0].hit_count, 1);
}

#[test]
fn test_disguised_entry_breakpoint_is_deleted() {
    // some backends plant an implicit breakpoint at the entry point; the
    // first stop then arrives as a hit on a number nobody registered
    let t = start_session();
    t.session.dispatch_stop(breakpoint_hit_stop("7", 0x400000)).unwrap();
    t.session.shutdown();

    assert_eq!(t.hook.events(), vec![Outward::EntryPoint]);
    assert!(t.driver.calls().contains(&DriverCall::Delete("7".to_string())));
}

#[test]
fn test_unknown_breakpoint_after_entry_is_an_exception() {
    let t = start_session();
    t.session
        .dispatch_stop(stop_with_reason(StopReason::EntryPointHit))
        .unwrap();
    t.session.dispatch_stop(breakpoint_hit_stop("9", 0x9000)).unwrap();
    t.session.shutdown();

    let events = t.hook.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[1],
        Outward::Exception { name, .. } if name == "Unknown breakpoint"
    ));
}

#[test]
fn test_hit_on_removed_breakpoint_sweeps_and_resumes() {
    let t = start_session();
    t.driver.push_outcome(single_outcome("1", 0x1000));
    let id = t.session.create_breakpoint(BreakpointSpec::at_source("main.rs", 10));
    t.session.bind_outstanding().unwrap();
    t.session
        .dispatch_stop(stop_with_reason(StopReason::EntryPointHit))
        .unwrap();

    t.session.remove_breakpoint(id).unwrap();
    t.session.dispatch_stop(breakpoint_hit_stop("1", 0x1000)).unwrap();
    t.session.shutdown();

    // the sweep deleted it on the backend before classification, the hit
    // surfaced nowhere and execution was resumed
    let calls = t.driver.calls();
    let delete_at = calls
        .iter()
        .position(|c| *c == DriverCall::Delete("1".to_string()))
        .expect("swept on stop");
    let resume_at = calls
        .iter()
        .position(|c| *c == DriverCall::Resume)
        .expect("silently resumed");
    assert!(delete_at < resume_at);
    assert_eq!(t.hook.events(), vec![Outward::EntryPoint]);
    assert!(t.session.breakpoint_view(id).is_none());
}

#[test]
fn test_step_reasons_report_step_complete() {
    let t = start_session();
    t.session
        .dispatch_stop(stop_with_reason(StopReason::EndSteppingRange))
        .unwrap();
    t.session
        .dispatch_stop(stop_with_reason(StopReason::FunctionFinished))
        .unwrap();
    t.session.shutdown();
    assert_eq!(
        t.hook.events(),
        vec![Outward::StepComplete, Outward::StepComplete]
    );
}

#[test]
fn test_quiet_signal_resumes_silently() {
    let t = start_session();
    t.session.dispatch_stop(signal_stop(Some("SIGCHLD"), None)).unwrap();
    assert!(wait_for(|| t.driver.calls().contains(&DriverCall::Resume)));
    t.session.shutdown();
    assert!(t.hook.events().is_empty());
}

#[test]
fn test_fatal_signal_reports_exception_with_completed_name() {
    let t = start_session();
    // MI reported only the numeric code; the name comes from the table
    t.session.dispatch_stop(signal_stop(None, Some(11))).unwrap();
    t.session.shutdown();

    assert_eq!(
        t.hook.events(),
        vec![Outward::Exception {
            name: "SIGSEGV".to_string(),
            code: Some(11),
            category: None,
            state: ExceptionState::None,
        }]
    );
}

#[test]
fn test_interrupt_completes_on_break_signal() {
    let t = start_session();
    let session = std::sync::Arc::new(t.session);

    let caller = session.clone();
    let interrupted = thread::spawn(move || caller.interrupt());
    assert!(wait_for(|| t.driver.calls().contains(&DriverCall::Interrupt)));

    // the scheduler keeps processing events while interrupt() blocks; the
    // matching signal stop completes the handshake instead of resuming
    session
        .dispatch_stop(signal_stop(Some("SIGINT"), None))
        .unwrap();
    interrupted.join().unwrap().unwrap();
    session.shutdown();

    assert_eq!(t.hook.events(), vec![Outward::AsyncBreak]);
    assert!(!t.driver.calls().contains(&DriverCall::Resume));
}

#[test]
fn test_exception_received_decodes_details() {
    let t = start_session();
    let category = Uuid::new_v4();
    t.driver.set_exception_details(ExceptionDetails {
        category: Some(category),
        state: ExceptionState::BreakThrown,
    });

    let stop = StopPayload {
        reason: Some(StopReason::ExceptionReceived),
        thread_id: Some(1),
        exception_name: Some("std::out_of_range".to_string()),
        exception_description: Some("vector index out of range".to_string()),
        ..Default::default()
    };
    t.session.dispatch_stop(stop).unwrap();
    t.session.shutdown();

    assert_eq!(
        t.hook.events(),
        vec![Outward::Exception {
            name: "std::out_of_range".to_string(),
            code: None,
            category: Some(category),
            state: ExceptionState::BreakThrown,
        }]
    );
}

#[test]
fn test_unrecognized_reason_is_unknown_exception() {
    let t = start_session();
    t.session
        .dispatch_stop(stop_with_reason(StopReason::EntryPointHit))
        .unwrap();
    t.session
        .dispatch_stop(stop_with_reason(StopReason::Other("solib-event".to_string())))
        .unwrap();
    t.session.shutdown();

    let events = t.hook.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[1],
        Outward::Exception { name, .. } if name == "Unknown"
    ));
}

#[test]
fn test_hook_failure_routed_to_error_sink() {
    let hook = RecordingHook {
        fail_on_step: Some("ui is gone".to_string()),
        ..RecordingHook::default()
    };
    let t = start_session_with(hook, SessionConfig::default());
    t.session
        .dispatch_stop(stop_with_reason(StopReason::EndSteppingRange))
        .unwrap();
    t.session.shutdown();

    assert!(t.hook.events().is_empty());
    let errors = t.hook.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("ui is gone"));
}
