//! Control core of an MI debugger front-end.
//!
//! Drives an external GDB/LLDB-family backend over the MI protocol and
//! exposes blocking IDE-style operations on top of the asynchronous channel.
//! The crate is the engine a presentation adapter (DAP or similar) embeds;
//! MI text marshaling and transport stay on the adapter side, behind the
//! [`session::protocol::DebuggerDriver`] trait.

pub mod session;

pub use session::breakpoint::{BoundBreakpointView, BreakpointId, BreakpointView};
pub use session::config::SessionConfig;
pub use session::error::Error;
pub use session::protocol::{BindOutcome, BreakpointSpec, StopPayload, WatchpointSpec};
pub use session::{DebugSession, EventHook, ExceptionEvent};
