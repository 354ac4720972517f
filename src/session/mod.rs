//! Session command-and-event engine.
//!
//! [`DebugSession`] wraps a [`DebuggerDriver`] (the MI command surface) in a
//! single-flight scheduler: IDE-style callers get blocking, one-at-a-time
//! operations while the backend keeps delivering results and stop
//! notifications asynchronously. Breakpoint state lives in a registry the
//! scheduler thread owns; outward notifications are delivered through the
//! caller-supplied [`EventHook`].

pub mod breakpoint;
pub mod config;
pub mod error;
pub mod protocol;
pub mod sched;
pub mod signal;
mod stop;

use std::sync::Arc;

use log::debug;
use uuid::Uuid;

use crate::session::breakpoint::{
    BindState, BoundBreakpointView, BreakpointId, BreakpointRegistry, BreakpointView,
};
use crate::session::config::SessionConfig;
use crate::session::error::Error;
use crate::session::protocol::{
    BindOutcome, BreakpointSpec, DebuggerDriver, ExceptionState, StopPayload, WatchpointSpec,
};
use crate::session::sched::{CancellationToken, Completion, Scheduler, SchedulerHandle};

/// An exception-style outward notification (real target exceptions, fatal
/// signals and the defensive unknown-stop fallback all surface here).
#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    pub name: String,
    pub description: String,
    pub code: Option<u32>,
    pub category: Option<Uuid>,
    pub state: ExceptionState,
}

/// Outward notification surface. Exactly one `on_*` event fires per stop.
///
/// Hooks run on the scheduler thread; a returned error is wrapped into
/// [`Error::Hook`] and routed to [`EventHook::on_error`], it never tears the
/// session down.
pub trait EventHook: Send + Sync {
    fn on_entry_point(&self, thread_id: Option<u32>) -> anyhow::Result<()>;
    fn on_breakpoints_hit(
        &self,
        hits: &[BoundBreakpointView],
        thread_id: Option<u32>,
    ) -> anyhow::Result<()>;
    fn on_step_complete(&self, thread_id: Option<u32>) -> anyhow::Result<()>;
    fn on_async_break(&self, thread_id: Option<u32>) -> anyhow::Result<()>;
    fn on_exception(&self, event: &ExceptionEvent, thread_id: Option<u32>) -> anyhow::Result<()>;

    /// Failure of posted (fire-and-forget) work; there is no blocked caller
    /// to re-raise it into.
    fn on_error(&self, _error: &Error) {}
}

/// Scheduler-thread-owned state: the backend driver plus everything the stop
/// resolver tracks between stops.
pub struct SessionCore<D: DebuggerDriver> {
    pub(super) driver: D,
    pub(super) breakpoints: Arc<BreakpointRegistry>,
    pub(super) config: SessionConfig,
    pub(super) hook: Arc<dyn EventHook>,
    pub(super) handle: SchedulerHandle<SessionCore<D>>,
    /// Whether the entry point was already reported (or implicitly passed).
    pub(super) entry_seen: bool,
    /// An interrupt() caller is waiting for the matching signal stop.
    pub(super) break_requested: bool,
    pub(super) pending_break: Option<Completion<()>>,
}

/// The engine facade an MI adapter embeds.
///
/// Commands block the caller; events are fed in through the `dispatch_*`
/// methods, which post into the scheduler so event processing never races a
/// foreground command.
pub struct DebugSession<D: DebuggerDriver + Send + 'static> {
    sched: Scheduler<SessionCore<D>>,
    breakpoints: Arc<BreakpointRegistry>,
}

impl<D: DebuggerDriver + Send + 'static> DebugSession<D> {
    pub fn new(driver: D, hook: Arc<dyn EventHook>, config: SessionConfig) -> Self {
        let breakpoints = Arc::new(BreakpointRegistry::default());
        let registry = breakpoints.clone();
        let error_hook = hook.clone();
        let sched = Scheduler::spawn_with_error_hook(
            move |handle| SessionCore {
                driver,
                breakpoints: registry,
                config,
                hook,
                handle,
                entry_seen: false,
                break_requested: false,
                pending_break: None,
            },
            move |e| error_hook.on_error(&e),
        );
        Self { sched, breakpoints }
    }

    /// Register a breakpoint. No backend traffic until a bind.
    pub fn create_breakpoint(&self, spec: BreakpointSpec) -> BreakpointId {
        self.breakpoints.create(spec)
    }

    /// Register a data (watch) breakpoint.
    pub fn create_watchpoint(&self, spec: WatchpointSpec) -> BreakpointId {
        self.breakpoints.create_watch(spec)
    }

    /// Bind one breakpoint against the backend, returning its updated view.
    /// A hard bind error is raised to the caller; the breakpoint itself
    /// stays `Pending` and is retried on the next [`DebugSession::bind_outstanding`].
    pub fn bind_breakpoint(&self, id: BreakpointId) -> Result<BreakpointView, Error> {
        let view = self
            .sched
            .run_sync(move |core| core.breakpoints.clone().bind(id, &mut core.driver))?;
        // a backend warning assigns a number and keeps the view result; a
        // hard error assigns nothing
        if view.number.is_none() {
            if let Some(reason) = &view.pending_reason {
                return Err(Error::Bind(reason.clone()));
            }
        }
        Ok(view)
    }

    /// Bind every still-pending breakpoint. Safe to call repeatedly, e.g.
    /// after each shared library load.
    pub fn bind_outstanding(&self) -> Result<(), Error> {
        self.sched
            .run_sync(|core| core.breakpoints.clone().bind_all(&mut core.driver))
    }

    /// As [`DebugSession::bind_outstanding`], reporting one progress message
    /// per breakpoint and honoring cancellation between binds.
    pub fn bind_outstanding_with_progress<P>(
        &self,
        progress_sink: P,
        cancel: CancellationToken,
    ) -> Result<(), Error>
    where
        P: Fn(&str) + Send + 'static,
    {
        self.sched.run_async_with_progress(
            |core, completion, progress| {
                let registry = core.breakpoints.clone();
                let pending: Vec<BreakpointId> = registry
                    .snapshot()
                    .into_iter()
                    .filter(|bp| bp.state == BindState::Pending)
                    .map(|bp| bp.id)
                    .collect();
                for id in pending {
                    if progress.is_canceled() {
                        completion.done(Err(Error::OperationCanceled));
                        return Ok(());
                    }
                    let view = registry.bind(id, &mut core.driver)?;
                    progress.report(&match &view.number {
                        Some(number) => format!("breakpoint {id} bound as {number}"),
                        None => format!("breakpoint {id} still pending"),
                    });
                }
                completion.done(Ok(()));
                Ok(())
            },
            progress_sink,
            cancel,
        )
    }

    pub fn breakpoint_view(&self, id: BreakpointId) -> Option<BreakpointView> {
        self.breakpoints.view(id)
    }

    pub fn breakpoints_snapshot(&self) -> Vec<BreakpointView> {
        self.breakpoints.snapshot()
    }

    pub fn enable_breakpoint(&self, id: BreakpointId, enabled: bool) -> Result<(), Error> {
        self.sched.run_sync(move |core| {
            core.breakpoints.clone().set_enabled(id, enabled, &mut core.driver)
        })
    }

    pub fn set_condition(&self, id: BreakpointId, expr: String) -> Result<(), Error> {
        self.sched.run_sync(move |core| {
            core.breakpoints.clone().set_condition(id, &expr, &mut core.driver)
        })
    }

    /// Queue a breakpoint for removal. The backend delete happens at the
    /// next stop; hits on it meanwhile are passed through silently.
    pub fn remove_breakpoint(&self, id: BreakpointId) -> Result<(), Error> {
        self.breakpoints.mark_pending_delete(id)
    }

    pub fn resume(&self) -> Result<(), Error> {
        self.sched.run_sync(|core| core.driver.resume())
    }

    /// Request an asynchronous pause and block until the matching signal
    /// stop arrives. The scheduler thread keeps processing events while the
    /// caller waits.
    pub fn interrupt(&self) -> Result<(), Error> {
        self.sched.run_async(|core, completion| {
            core.driver.interrupt()?;
            core.break_requested = true;
            core.pending_break = Some(completion);
            Ok(())
        })
    }

    /// Detach path: strip every instruction-level binding, keep bookkeeping.
    pub fn detach(&self) -> Result<(), Error> {
        self.sched.run_sync(|core| {
            core.breakpoints.clone().clear_all(&mut core.driver);
            Ok(())
        })
    }

    /// Feed a decoded `*stopped` notification into the resolver.
    pub fn dispatch_stop(&self, payload: StopPayload) -> Result<(), Error> {
        self.sched.post(move |core| core.handle_stop(payload))
    }

    /// Feed a decoded `=breakpoint-modified` notification.
    pub fn dispatch_breakpoint_modified(&self, outcome: BindOutcome) -> Result<(), Error> {
        self.sched.post(move |core| {
            core.breakpoints.clone().on_modified(outcome);
            Ok(())
        })
    }

    /// A shared library load may have resolved pending locations; retry the
    /// outstanding binds in the background.
    pub fn dispatch_library_loaded(&self, name: String) -> Result<(), Error> {
        self.sched.post(move |core| {
            debug!(target: "stop", "library {name} loaded, rebinding pending breakpoints");
            core.breakpoints.clone().bind_all(&mut core.driver)
        })
    }

    /// Stop accepting work, finish what is queued, join the thread.
    pub fn shutdown(&self) {
        self.sched.close();
    }
}
