//! Stop-event resolver.
//!
//! Classifies a `*stopped` notification and produces exactly one outward
//! action: an [`EventHook`] notification, a silent resume, or both sides of
//! an async-break handshake. Pending breakpoint deletions are swept on every
//! stop, and silent resumes are posted (not issued inline) so they can never
//! overtake the sweep or other queued work.

use log::{debug, warn};

use crate::session::breakpoint::{HitResolution, UNRESOLVED_ADDRESS};
use crate::session::error::Error;
use crate::session::protocol::{DebuggerDriver, StopPayload, StopReason};
use crate::session::{signal, EventHook, ExceptionEvent, SessionCore};

impl<D: DebuggerDriver> SessionCore<D> {
    pub(super) fn handle_stop(&mut self, stop: StopPayload) -> Result<(), Error> {
        let outcome = self.classify(&stop);
        // breakpoints removed while the target ran are torn down at every
        // stop; a silent resume was only posted, so it runs after this
        let swept = self.breakpoints.clone().sweep_pending_deletions(&mut self.driver);
        outcome.and(swept)
    }

    fn classify(&mut self, stop: &StopPayload) -> Result<(), Error> {
        match stop.reason.clone() {
            None => self.on_reasonless_stop(stop),
            Some(StopReason::EntryPointHit) => {
                self.entry_seen = true;
                self.emit(|hook| hook.on_entry_point(stop.thread_id))
            }
            Some(StopReason::BreakpointHit) => self.on_breakpoint_hit(stop),
            Some(StopReason::WatchpointTrigger) => self.on_watchpoint_trigger(stop),
            Some(StopReason::EndSteppingRange) | Some(StopReason::FunctionFinished) => {
                self.emit(|hook| hook.on_step_complete(stop.thread_id))
            }
            Some(StopReason::SignalReceived) => self.on_signal(stop),
            Some(StopReason::ExceptionReceived) => self.on_exception(stop),
            Some(StopReason::Other(token)) => {
                debug!(target: "stop", "unrecognized stop reason {token:?}");
                if self.break_requested {
                    self.complete_async_break(stop)
                } else {
                    self.emit_unknown(stop)
                }
            }
        }
    }

    /// A stop with no reason field. The first one is the backend arriving at
    /// the (unannounced) entry point and is passed through with a single
    /// resume; later ones are the reply to an asynchronous break request.
    fn on_reasonless_stop(&mut self, stop: &StopPayload) -> Result<(), Error> {
        if self.config.implicit_entry_stop && !self.entry_seen {
            self.entry_seen = true;
            debug!(target: "stop", "reasonless first stop, passing entry point through");
            return self.resume_or_complete_break(stop);
        }
        self.complete_async_break(stop)
    }

    fn on_breakpoint_hit(&mut self, stop: &StopPayload) -> Result<(), Error> {
        let number = stop.breakpoint_number.as_deref().unwrap_or("");
        let address = stop.address.unwrap_or(UNRESOLVED_ADDRESS);
        let (hits, should_continue) =
            self.breakpoints
                .find_hit_breakpoints(number, address, stop.frame.as_ref());
        if should_continue {
            return self.resume_or_complete_break(stop);
        }
        if !hits.is_empty() {
            return self.emit(|hook| hook.on_breakpoints_hit(&hits, stop.thread_id));
        }
        if !self.entry_seen {
            // the first stop can arrive disguised as a hit on an implicit
            // breakpoint the backend planted at the entry point; drop that
            // breakpoint so it never fires again
            self.entry_seen = true;
            if !number.is_empty() {
                if let Err(e) = self.driver.delete_breakpoint(number) {
                    warn!(target: "stop", "delete entry breakpoint {number}: {e}");
                }
            }
            return self.emit(|hook| hook.on_entry_point(stop.thread_id));
        }
        let event = ExceptionEvent {
            name: "Unknown breakpoint".to_string(),
            description: format!("Stopped at unrecognized breakpoint {number}"),
            code: None,
            category: None,
            state: Default::default(),
        };
        self.emit(|hook| hook.on_exception(&event, stop.thread_id))
    }

    fn on_watchpoint_trigger(&mut self, stop: &StopPayload) -> Result<(), Error> {
        let number = stop.breakpoint_number.as_deref().unwrap_or("");
        match self.breakpoints.find_hit_watchpoint(number) {
            HitResolution::Hit(view) => {
                let hits = [view];
                self.emit(|hook| hook.on_breakpoints_hit(&hits, stop.thread_id))
            }
            HitResolution::SilentContinue => self.resume_or_complete_break(stop),
            HitResolution::NotFound => self.emit_unknown(stop),
        }
    }

    fn on_signal(&mut self, stop: &StopPayload) -> Result<(), Error> {
        let (name, code) = signal::complete(stop.signal_name.as_deref(), stop.signal_code);
        if let Some(name) = &name {
            if self.config.is_quiet_signal(name) {
                debug!(target: "stop", "quiet signal {name}, resuming");
                return self.resume_or_complete_break(stop);
            }
        }
        let is_break_signal = name.as_deref() == Some(self.config.async_break_signal.as_str())
            || self.driver.is_async_break_signal(stop);
        if self.break_requested || is_break_signal {
            return self.complete_async_break(stop);
        }
        let name = name.unwrap_or_else(|| format!("signal {code}"));
        let event = ExceptionEvent {
            name: name.clone(),
            description: stop.signal_meaning.clone().unwrap_or(name),
            code: Some(code),
            category: None,
            state: Default::default(),
        };
        self.emit(|hook| hook.on_exception(&event, stop.thread_id))
    }

    fn on_exception(&mut self, stop: &StopPayload) -> Result<(), Error> {
        let details = self.driver.decode_exception(stop);
        let name = stop
            .exception_name
            .clone()
            .unwrap_or_else(|| "Unknown".to_string());
        let event = ExceptionEvent {
            description: stop.exception_description.clone().unwrap_or_else(|| name.clone()),
            name,
            code: stop.signal_code,
            category: details.category,
            state: details.state,
        };
        self.emit(|hook| hook.on_exception(&event, stop.thread_id))
    }

    /// Defensive fallback for stops a conformant backend should never send.
    fn emit_unknown(&mut self, stop: &StopPayload) -> Result<(), Error> {
        let event = ExceptionEvent {
            name: "Unknown".to_string(),
            description: "Unknown stopping event".to_string(),
            code: None,
            category: None,
            state: Default::default(),
        };
        self.emit(|hook| hook.on_exception(&event, stop.thread_id))
    }

    /// Silently resume after a stop nobody should see. A stop produced by an
    /// explicit break request is never auto-resumed; it completes the
    /// handshake instead.
    fn resume_or_complete_break(&mut self, stop: &StopPayload) -> Result<(), Error> {
        if self.break_requested {
            return self.complete_async_break(stop);
        }
        // posted, not inline: the resume must not run before the rest of
        // this stop's processing, the deletion sweep included
        self.handle.post(|core| core.driver.resume())
    }

    fn complete_async_break(&mut self, stop: &StopPayload) -> Result<(), Error> {
        self.break_requested = false;
        if let Some(completion) = self.pending_break.take() {
            completion.done(Ok(()));
        }
        self.emit(|hook| hook.on_async_break(stop.thread_id))
    }

    fn emit<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&dyn EventHook) -> anyhow::Result<()>,
    {
        f(self.hook.as_ref()).map_err(Error::Hook)
    }
}
