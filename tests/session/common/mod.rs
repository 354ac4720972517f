use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use midb::session::breakpoint::BoundBreakpointView;
use midb::session::config::SessionConfig;
use midb::session::error::Error;
use midb::session::protocol::{
    BindOutcome, BreakpointLocation, BreakpointSpec, DebuggerDriver, ExceptionDetails,
    ExceptionState, LocationInfo, StopPayload, StopReason, WatchpointSpec,
};
use midb::session::{DebugSession, EventHook, ExceptionEvent};
use uuid::Uuid;

/// Every backend call the session made, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Insert(String),
    InsertWatch(String),
    Info(String),
    Delete(String),
    Enable(String, bool),
    Condition(String, String),
    Resume,
    Interrupt,
}

#[derive(Default)]
pub struct DriverState {
    pub script: VecDeque<BindOutcome>,
    pub calls: Vec<DriverCall>,
    pub exception: ExceptionDetails,
}

/// Driver mock replaying a scripted sequence of bind outcomes and recording
/// every call.
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    pub state: Arc<Mutex<DriverState>>,
}

impl ScriptedDriver {
    pub fn push_outcome(&self, outcome: BindOutcome) {
        self.state.lock().unwrap().script.push_back(outcome);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn set_exception_details(&self, details: ExceptionDetails) {
        self.state.lock().unwrap().exception = details;
    }

    fn record(&self, call: DriverCall) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn next_outcome(&self) -> BindOutcome {
        self.state
            .lock()
            .unwrap()
            .script
            .pop_front()
            .expect("scripted bind outcome")
    }
}

fn describe_location(location: &BreakpointLocation) -> String {
    match location {
        BreakpointLocation::Function(name) => name.clone(),
        BreakpointLocation::Address(addr) => format!("*{addr:#x}"),
        BreakpointLocation::Source { file, line, .. } => format!("{file}:{line}"),
    }
}

impl DebuggerDriver for ScriptedDriver {
    fn insert_breakpoint(&mut self, spec: &BreakpointSpec) -> Result<BindOutcome, Error> {
        self.record(DriverCall::Insert(describe_location(&spec.location)));
        Ok(self.next_outcome())
    }

    fn insert_watchpoint(&mut self, spec: &WatchpointSpec) -> Result<BindOutcome, Error> {
        self.record(DriverCall::InsertWatch(spec.expr.clone()));
        Ok(self.next_outcome())
    }

    fn breakpoint_info(&mut self, number: &str) -> Result<BindOutcome, Error> {
        self.record(DriverCall::Info(number.to_string()));
        Ok(self.next_outcome())
    }

    fn delete_breakpoint(&mut self, number: &str) -> Result<(), Error> {
        self.record(DriverCall::Delete(number.to_string()));
        Ok(())
    }

    fn enable_breakpoint(&mut self, number: &str, enabled: bool) -> Result<(), Error> {
        self.record(DriverCall::Enable(number.to_string(), enabled));
        Ok(())
    }

    fn set_condition(&mut self, number: &str, expr: &str) -> Result<(), Error> {
        self.record(DriverCall::Condition(number.to_string(), expr.to_string()));
        Ok(())
    }

    fn resume(&mut self) -> Result<(), Error> {
        self.record(DriverCall::Resume);
        Ok(())
    }

    fn interrupt(&mut self) -> Result<(), Error> {
        self.record(DriverCall::Interrupt);
        Ok(())
    }

    fn decode_exception(&mut self, _stop: &StopPayload) -> ExceptionDetails {
        self.state.lock().unwrap().exception.clone()
    }

    fn is_async_break_signal(&self, _stop: &StopPayload) -> bool {
        false
    }
}

/// Every outward notification the session produced, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Outward {
    EntryPoint,
    BreakpointsHit(Vec<BoundBreakpointView>),
    StepComplete,
    AsyncBreak,
    Exception {
        name: String,
        code: Option<u32>,
        category: Option<Uuid>,
        state: ExceptionState,
    },
}

#[derive(Default)]
pub struct RecordingHook {
    pub events: Arc<Mutex<Vec<Outward>>>,
    pub errors: Arc<Mutex<Vec<String>>>,
    /// When set, the step-complete hook fails with this message.
    pub fail_on_step: Option<String>,
}

impl RecordingHook {
    pub fn events(&self) -> Vec<Outward> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    fn record(&self, event: Outward) {
        self.events.lock().unwrap().push(event);
    }
}

impl EventHook for RecordingHook {
    fn on_entry_point(&self, _thread_id: Option<u32>) -> anyhow::Result<()> {
        self.record(Outward::EntryPoint);
        Ok(())
    }

    fn on_breakpoints_hit(
        &self,
        hits: &[BoundBreakpointView],
        _thread_id: Option<u32>,
    ) -> anyhow::Result<()> {
        self.record(Outward::BreakpointsHit(hits.to_vec()));
        Ok(())
    }

    fn on_step_complete(&self, _thread_id: Option<u32>) -> anyhow::Result<()> {
        if let Some(message) = &self.fail_on_step {
            anyhow::bail!("{message}");
        }
        self.record(Outward::StepComplete);
        Ok(())
    }

    fn on_async_break(&self, _thread_id: Option<u32>) -> anyhow::Result<()> {
        self.record(Outward::AsyncBreak);
        Ok(())
    }

    fn on_exception(&self, event: &ExceptionEvent, _thread_id: Option<u32>) -> anyhow::Result<()> {
        self.record(Outward::Exception {
            name: event.name.clone(),
            code: event.code,
            category: event.category,
            state: event.state,
        });
        Ok(())
    }

    fn on_error(&self, error: &Error) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

pub struct TestSession {
    pub session: DebugSession<ScriptedDriver>,
    pub driver: ScriptedDriver,
    pub hook: Arc<RecordingHook>,
}

pub fn start_session() -> TestSession {
    start_session_with(RecordingHook::default(), SessionConfig::default())
}

pub fn start_session_with(hook: RecordingHook, config: SessionConfig) -> TestSession {
    let _ = env_logger::builder().is_test(true).try_init();
    let driver = ScriptedDriver::default();
    let hook = Arc::new(hook);
    let session = DebugSession::new(driver.clone(), hook.clone(), config);
    TestSession {
        session,
        driver,
        hook,
    }
}

/// Poll `pred` until it holds or five seconds pass.
pub fn wait_for(pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

pub fn single_outcome(number: &str, address: u64) -> BindOutcome {
    BindOutcome::Single {
        number: number.to_string(),
        location: LocationInfo {
            number: Some(number.to_string()),
            address: Some(address),
            function: Some("main".to_string()),
            file: Some("main.rs".to_string()),
            line: Some(10),
            column: None,
            enabled: true,
        },
    }
}

pub fn multiple_sentinel_outcome(number: &str) -> BindOutcome {
    BindOutcome::Multiple {
        number: number.to_string(),
        locations: vec![],
    }
}

/// A `Multiple` outcome where the backend enumerates sub-locations
/// ("2.1", "2.2", ...) up front instead of the bare sentinel.
pub fn multiple_locations_outcome(number: &str, addresses: &[u64]) -> BindOutcome {
    BindOutcome::Multiple {
        number: number.to_string(),
        locations: addresses
            .iter()
            .enumerate()
            .map(|(i, address)| LocationInfo {
                number: Some(format!("{number}.{}", i + 1)),
                address: Some(*address),
                function: Some("tmpl_fn".to_string()),
                file: Some("main.rs".to_string()),
                line: Some(20 + i as u32),
                column: Some(5),
                enabled: true,
            })
            .collect(),
    }
}

pub fn stop_with_reason(reason: StopReason) -> StopPayload {
    StopPayload {
        reason: Some(reason),
        thread_id: Some(1),
        ..Default::default()
    }
}

pub fn breakpoint_hit_stop(number: &str, address: u64) -> StopPayload {
    StopPayload {
        reason: Some(StopReason::BreakpointHit),
        thread_id: Some(1),
        breakpoint_number: Some(number.to_string()),
        address: Some(address),
        ..Default::default()
    }
}

pub fn signal_stop(name: Option<&str>, code: Option<u32>) -> StopPayload {
    StopPayload {
        reason: Some(StopReason::SignalReceived),
        thread_id: Some(1),
        signal_name: name.map(str::to_string),
        signal_code: code,
        ..Default::default()
    }
}
