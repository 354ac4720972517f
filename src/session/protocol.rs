//! Typed boundary to the MI backend.
//!
//! The line-oriented MI transport and result-tree parsing live outside this
//! crate. Whatever implements [`DebuggerDriver`] is expected to decode raw MI
//! payloads into the closed types below exactly once, so the session core
//! never re-parses loosely typed trees.

use strum_macros::{Display, EnumString};
use uuid::Uuid;

use crate::session::error::Error;

/// Where a code breakpoint should be placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointLocation {
    Function(String),
    Address(u64),
    Source {
        file: String,
        line: u32,
        column: Option<u32>,
    },
}

/// A user breakpoint request, before any backend interaction.
#[derive(Debug, Clone)]
pub struct BreakpointSpec {
    pub location: BreakpointLocation,
    pub condition: Option<String>,
    pub enabled: bool,
}

impl BreakpointSpec {
    pub fn at_function(name: impl Into<String>) -> Self {
        Self {
            location: BreakpointLocation::Function(name.into()),
            condition: None,
            enabled: true,
        }
    }

    pub fn at_source(file: impl Into<String>, line: u32) -> Self {
        Self {
            location: BreakpointLocation::Source {
                file: file.into(),
                line,
                column: None,
            },
            condition: None,
            enabled: true,
        }
    }

    pub fn at_address(address: u64) -> Self {
        Self {
            location: BreakpointLocation::Address(address),
            condition: None,
            enabled: true,
        }
    }
}

/// A data (watch) breakpoint request.
#[derive(Debug, Clone)]
pub struct WatchpointSpec {
    /// Address expression observed by the backend.
    pub expr: String,
    /// Watched region size in bytes.
    pub size: u32,
}

/// One concrete location reported by the backend for a breakpoint.
#[derive(Debug, Clone, Default)]
pub struct LocationInfo {
    /// Sub-number like "2.1" when the backend assigns one.
    pub number: Option<String>,
    pub address: Option<u64>,
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub enabled: bool,
}

/// Decoded result of a breakpoint insert (or re-sync) command.
///
/// `Multiple` with an empty location list is the "<MULTIPLE>" sentinel case:
/// the backend admits there is more than one address but does not enumerate
/// them, so real addresses are discovered lazily from hits.
#[derive(Debug, Clone)]
pub enum BindOutcome {
    Error(String),
    Single {
        number: String,
        location: LocationInfo,
    },
    Multiple {
        number: String,
        locations: Vec<LocationInfo>,
    },
    PendingWarning {
        number: String,
        warning: String,
    },
}

impl BindOutcome {
    /// Backend-assigned breakpoint number, if the bind got far enough to have one.
    pub fn number(&self) -> Option<&str> {
        match self {
            BindOutcome::Error(_) => None,
            BindOutcome::Single { number, .. }
            | BindOutcome::Multiple { number, .. }
            | BindOutcome::PendingWarning { number, .. } => Some(number),
        }
    }
}

/// MI stop reason token.
#[derive(Debug, Clone, PartialEq, Eq, EnumString, Display)]
pub enum StopReason {
    #[strum(serialize = "breakpoint-hit")]
    BreakpointHit,
    #[strum(serialize = "watchpoint-trigger")]
    WatchpointTrigger,
    #[strum(serialize = "entry-point-hit")]
    EntryPointHit,
    #[strum(serialize = "end-stepping-range")]
    EndSteppingRange,
    #[strum(serialize = "function-finished")]
    FunctionFinished,
    #[strum(serialize = "signal-received")]
    SignalReceived,
    #[strum(serialize = "exception-received")]
    ExceptionReceived,
    #[strum(default)]
    Other(String),
}

/// Innermost frame attached to a stop notification.
#[derive(Debug, Clone, Default)]
pub struct FrameInfo {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// A `*stopped` notification, decoded.
#[derive(Debug, Clone, Default)]
pub struct StopPayload {
    pub reason: Option<StopReason>,
    pub thread_id: Option<u32>,
    pub breakpoint_number: Option<String>,
    pub address: Option<u64>,
    pub frame: Option<FrameInfo>,
    pub signal_name: Option<String>,
    pub signal_code: Option<u32>,
    pub signal_meaning: Option<String>,
    pub exception_name: Option<String>,
    pub exception_description: Option<String>,
}

/// How far an exception has propagated when the backend reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExceptionState {
    #[default]
    None,
    BreakThrown,
    BreakUserHandled,
}

/// Backend-specific exception classification.
#[derive(Debug, Clone, Default)]
pub struct ExceptionDetails {
    pub category: Option<Uuid>,
    pub state: ExceptionState,
}

/// Command surface of the MI backend, as seen by the session core.
///
/// Every method is called on the scheduler thread only. A returned `Err`
/// means the exchange itself failed (transport, malformed reply); an MI
/// `^error` on a bind is a regular [`BindOutcome::Error`] value.
pub trait DebuggerDriver {
    fn insert_breakpoint(&mut self, spec: &BreakpointSpec) -> Result<BindOutcome, Error>;
    fn insert_watchpoint(&mut self, spec: &WatchpointSpec) -> Result<BindOutcome, Error>;
    /// Re-query a known breakpoint, typically after a shared library load
    /// may have resolved a previously pending location.
    fn breakpoint_info(&mut self, number: &str) -> Result<BindOutcome, Error>;
    fn delete_breakpoint(&mut self, number: &str) -> Result<(), Error>;
    fn enable_breakpoint(&mut self, number: &str, enabled: bool) -> Result<(), Error>;
    fn set_condition(&mut self, number: &str, expr: &str) -> Result<(), Error>;

    fn resume(&mut self) -> Result<(), Error>;
    fn interrupt(&mut self) -> Result<(), Error>;

    /// Decode backend-specific exception category/state from a stop payload.
    fn decode_exception(&mut self, stop: &StopPayload) -> ExceptionDetails;
    /// Whether this signal stop is the backend pausing on our own interrupt
    /// request (SIGINT for gdb, SIGSTOP for some lldb setups).
    fn is_async_break_signal(&self, stop: &StopPayload) -> bool;
}
