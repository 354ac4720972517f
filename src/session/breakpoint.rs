//! Breakpoint bookkeeping: pending breakpoints, their bound locations and
//! the registry that keeps both consistent with the backend.
//!
//! The registry collection is the only lock in the session core: caller
//! threads register and snapshot breakpoints while the scheduler thread
//! binds, resolves hits and sweeps deletions. Per-breakpoint state is still
//! mutated on the scheduler thread only.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use indexmap::IndexMap;
use log::{debug, warn};
use smallvec::{smallvec, SmallVec};

use crate::session::error::Error;
use crate::session::protocol::{
    BindOutcome, BreakpointSpec, DebuggerDriver, FrameInfo, LocationInfo, WatchpointSpec,
};

/// Address of a bound location that is known to exist but has not been
/// observed yet. Never a real hit address.
pub const UNRESOLVED_ADDRESS: u64 = 0;

/// Local breakpoint handle, stable across rebinds. Distinct from the
/// backend-assigned number, which appears only after a successful bind.
pub type BreakpointId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    /// Not bound to any address yet.
    Pending,
    /// Bound to a single address.
    Single,
    /// Bound to multiple addresses, possibly not all of them known.
    Multiple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakpointKind {
    Code,
    Watch,
}

#[derive(Debug, Clone)]
enum BindRequest {
    Insert(BreakpointSpec),
    InsertWatch(WatchpointSpec),
    /// Already known to the backend; re-query by number.
    Sync(String),
}

/// One physical binding of a pending breakpoint.
#[derive(Debug, Clone)]
struct BoundBreakpoint {
    number: String,
    address: u64,
    function: Option<String>,
    file: Option<String>,
    line: Option<u32>,
    column: Option<u32>,
    enabled: bool,
    hit_count: u32,
}

impl BoundBreakpoint {
    fn from_location(parent_number: &str, location: LocationInfo) -> Self {
        Self {
            number: location.number.unwrap_or_else(|| parent_number.to_string()),
            address: location.address.unwrap_or(UNRESOLVED_ADDRESS),
            function: location.function,
            file: location.file,
            line: location.line,
            column: location.column,
            enabled: location.enabled,
            hit_count: 0,
        }
    }

    fn placeholder(parent_number: &str) -> Self {
        Self {
            number: parent_number.to_string(),
            address: UNRESOLVED_ADDRESS,
            function: None,
            file: None,
            line: None,
            column: None,
            enabled: true,
            hit_count: 0,
        }
    }

    fn from_hit(parent_number: &str, address: u64, frame: Option<&FrameInfo>) -> Self {
        let mut bound = Self::placeholder(parent_number);
        bound.address = address;
        bound.fill_from_frame(frame);
        bound
    }

    /// Claim an observed address for a placeholder, preserving the entry's
    /// identity for anything already referencing it.
    fn rebind(&mut self, address: u64, frame: Option<&FrameInfo>) {
        self.address = address;
        self.fill_from_frame(frame);
    }

    fn fill_from_frame(&mut self, frame: Option<&FrameInfo>) {
        if let Some(frame) = frame {
            if self.function.is_none() {
                self.function = frame.function.clone();
            }
            if self.file.is_none() {
                self.file = frame.file.clone();
                self.line = frame.line;
            }
        }
    }
}

/// One user-requested breakpoint and everything the backend told us about it.
#[derive(Debug)]
struct PendingBreakpoint {
    id: BreakpointId,
    kind: BreakpointKind,
    request: BindRequest,
    /// Backend number; `None` until the first bind that got far enough to
    /// have one, stable afterwards.
    number: Option<String>,
    state: BindState,
    enabled: bool,
    deleted: bool,
    pending_delete: bool,
    /// Human-readable reason while unbound (bind error or backend warning).
    pending_reason: Option<String>,
    bound: SmallVec<[BoundBreakpoint; 1]>,
}

impl PendingBreakpoint {
    fn visible(&self) -> bool {
        self.enabled && !self.deleted && !self.pending_delete
    }

    /// Find the bound entry for a hit at `address`, rebinding the
    /// placeholder or lazily appending a new entry for a location of a
    /// multiple breakpoint never observed before.
    fn bind_to_address(&mut self, address: u64, frame: Option<&FrameInfo>) -> usize {
        // some backends never report hit addresses; the number match is the
        // only correlation then, so reuse the first entry
        if address == UNRESOLVED_ADDRESS && !self.bound.is_empty() {
            return 0;
        }
        if let Some(i) = self
            .bound
            .iter()
            .position(|b| b.address == address && address != UNRESOLVED_ADDRESS)
        {
            return i;
        }
        if let Some(i) = self
            .bound
            .iter()
            .position(|b| b.address == UNRESOLVED_ADDRESS)
        {
            self.bound[i].rebind(address, frame);
            return i;
        }
        let number = self.number.clone().unwrap_or_default();
        self.bound
            .push(BoundBreakpoint::from_hit(&number, address, frame));
        self.bound.len() - 1
    }

    /// Merge freshly reported locations: a live placeholder takes the first
    /// new address in place, the rest append.
    fn merge_locations(&mut self, locations: Vec<LocationInfo>) {
        let number = self.number.clone().unwrap_or_default();
        let mut locations = locations.into_iter();
        if let Some(first) = locations.next() {
            let address = first.address.unwrap_or(UNRESOLVED_ADDRESS);
            match self
                .bound
                .iter_mut()
                .find(|b| b.address == UNRESOLVED_ADDRESS)
            {
                Some(placeholder) => placeholder.rebind(address, None),
                None => self
                    .bound
                    .push(BoundBreakpoint::from_location(&number, first)),
            }
        }
        for location in locations {
            self.bound
                .push(BoundBreakpoint::from_location(&number, location));
        }
    }

    fn apply_bind_outcome(&mut self, outcome: BindOutcome) {
        match outcome {
            BindOutcome::Error(message) => {
                debug!(target: "breakpoint", "bind {} failed: {message}", self.id);
                self.state = BindState::Pending;
                self.pending_reason = Some(message);
            }
            BindOutcome::PendingWarning { number, warning } => {
                self.number.get_or_insert(number);
                self.state = BindState::Pending;
                self.pending_reason = Some(warning);
            }
            BindOutcome::Single { number, location } => {
                self.number.get_or_insert(number.clone());
                self.state = BindState::Single;
                self.pending_reason = None;
                self.bound = smallvec![BoundBreakpoint::from_location(&number, location)];
            }
            BindOutcome::Multiple { number, locations } => {
                self.number.get_or_insert(number.clone());
                self.state = BindState::Multiple;
                self.pending_reason = None;
                if locations.is_empty() {
                    // the backend won't enumerate addresses; park a single
                    // placeholder until hits reveal them
                    self.bound = smallvec![BoundBreakpoint::placeholder(&number)];
                } else {
                    self.bound = locations
                        .into_iter()
                        .map(|l| BoundBreakpoint::from_location(&number, l))
                        .collect();
                }
            }
        }
    }
}

/// Copy of a bound location handed to callers; never a live reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundBreakpointView {
    pub breakpoint: BreakpointId,
    pub number: String,
    pub address: u64,
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub hit_count: u32,
}

impl BoundBreakpointView {
    fn new(bp: &PendingBreakpoint, bound: &BoundBreakpoint) -> Self {
        Self {
            breakpoint: bp.id,
            number: bound.number.clone(),
            address: bound.address,
            function: bound.function.clone(),
            file: bound.file.clone(),
            line: bound.line,
            column: bound.column,
            hit_count: bound.hit_count,
        }
    }
}

/// Copy of a pending breakpoint handed to callers.
#[derive(Debug, Clone)]
pub struct BreakpointView {
    pub id: BreakpointId,
    pub number: Option<String>,
    pub state: BindState,
    pub enabled: bool,
    pub pending_reason: Option<String>,
    pub bound: Vec<BoundBreakpointView>,
}

impl BreakpointView {
    fn new(bp: &PendingBreakpoint) -> Self {
        Self {
            id: bp.id,
            number: bp.number.clone(),
            state: bp.state,
            enabled: bp.enabled,
            pending_reason: bp.pending_reason.clone(),
            bound: bp.bound.iter().map(|b| BoundBreakpointView::new(bp, b)).collect(),
        }
    }
}

/// Result of correlating a stop notification to a specific breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitResolution {
    /// The reported number is not one of ours.
    NotFound,
    /// Ours, but disabled/deleted/queued for deletion; execution must
    /// resume without a visible stop.
    SilentContinue,
    Hit(BoundBreakpointView),
}

#[derive(Default)]
pub struct BreakpointRegistry {
    breakpoints: Mutex<IndexMap<BreakpointId, PendingBreakpoint>>,
    counter: AtomicU32,
}

impl BreakpointRegistry {
    /// Register a code breakpoint. No backend interaction happens here.
    pub fn create(&self, spec: BreakpointSpec) -> BreakpointId {
        self.register(BreakpointKind::Code, spec.enabled, BindRequest::Insert(spec))
    }

    /// Register a data (watch) breakpoint.
    pub fn create_watch(&self, spec: WatchpointSpec) -> BreakpointId {
        self.register(BreakpointKind::Watch, true, BindRequest::InsertWatch(spec))
    }

    fn register(&self, kind: BreakpointKind, enabled: bool, request: BindRequest) -> BreakpointId {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let bp = PendingBreakpoint {
            id,
            kind,
            request,
            number: None,
            state: BindState::Pending,
            enabled,
            deleted: false,
            pending_delete: false,
            pending_reason: None,
            bound: SmallVec::new(),
        };
        self.breakpoints
            .lock()
            .expect("unpoisoned")
            .insert(id, bp);
        id
    }

    pub fn view(&self, id: BreakpointId) -> Option<BreakpointView> {
        self.breakpoints
            .lock()
            .expect("unpoisoned")
            .get(&id)
            .map(BreakpointView::new)
    }

    pub fn snapshot(&self) -> Vec<BreakpointView> {
        self.breakpoints
            .lock()
            .expect("unpoisoned")
            .values()
            .map(BreakpointView::new)
            .collect()
    }

    /// Bind a single breakpoint against the backend and return its updated
    /// view. Already-bound breakpoints are left alone.
    pub fn bind(&self, id: BreakpointId, driver: &mut dyn DebuggerDriver) -> Result<BreakpointView, Error> {
        let request = {
            let map = self.breakpoints.lock().expect("unpoisoned");
            let bp = map.get(&id).ok_or(Error::BreakpointNotFound(id))?;
            (bp.state == BindState::Pending).then(|| self.bind_request(bp))
        };
        if let Some(request) = request {
            let outcome = self.issue(request, driver)?;
            let mut map = self.breakpoints.lock().expect("unpoisoned");
            if let Some(bp) = map.get_mut(&id) {
                bp.apply_bind_outcome(outcome);
            }
        }
        self.view(id).ok_or(Error::BreakpointNotFound(id))
    }

    /// Try to bind every still-pending breakpoint. Bind errors and backend
    /// warnings stay on the breakpoint as its pending reason; only transport
    /// failures abort the pass. Calling this twice with no intervening state
    /// change performs no duplicate work.
    pub fn bind_all(&self, driver: &mut dyn DebuggerDriver) -> Result<(), Error> {
        let targets: Vec<(BreakpointId, BindRequest)> = {
            let map = self.breakpoints.lock().expect("unpoisoned");
            map.values()
                .filter(|bp| bp.state == BindState::Pending && !bp.pending_delete && !bp.deleted)
                .map(|bp| (bp.id, self.bind_request(bp)))
                .collect()
        };
        for (id, request) in targets {
            let outcome = self.issue(request, driver)?;
            let mut map = self.breakpoints.lock().expect("unpoisoned");
            if let Some(bp) = map.get_mut(&id) {
                bp.apply_bind_outcome(outcome);
            }
        }
        Ok(())
    }

    fn bind_request(&self, bp: &PendingBreakpoint) -> BindRequest {
        match &bp.number {
            // the backend already tracks it, just re-sync the addresses
            Some(number) => BindRequest::Sync(number.clone()),
            None => bp.request.clone(),
        }
    }

    fn issue(
        &self,
        request: BindRequest,
        driver: &mut dyn DebuggerDriver,
    ) -> Result<BindOutcome, Error> {
        match request {
            BindRequest::Insert(spec) => driver.insert_breakpoint(&spec),
            BindRequest::InsertWatch(spec) => driver.insert_watchpoint(&spec),
            BindRequest::Sync(number) => driver.breakpoint_info(&number),
        }
    }

    /// Apply an asynchronous `=breakpoint-modified` notification, typically
    /// an address change after a shared library load resolved a previously
    /// pending location.
    pub fn on_modified(&self, outcome: BindOutcome) {
        let Some(number) = outcome.number().map(str::to_string) else {
            return;
        };
        let mut map = self.breakpoints.lock().expect("unpoisoned");
        let Some(bp) = map
            .values_mut()
            .find(|bp| bp.number.as_deref() == Some(number.as_str()))
        else {
            debug!(target: "breakpoint", "modify notification for unknown breakpoint {number}");
            return;
        };
        match outcome {
            BindOutcome::Error(_) => {}
            BindOutcome::PendingWarning { warning, .. } => {
                bp.pending_reason = Some(warning);
            }
            BindOutcome::Single { location, .. } => {
                if bp.state == BindState::Pending {
                    bp.state = BindState::Single;
                }
                bp.pending_reason = None;
                bp.merge_locations(vec![location]);
            }
            BindOutcome::Multiple { locations, .. } => {
                bp.state = BindState::Multiple;
                bp.pending_reason = None;
                if locations.is_empty() {
                    if bp.bound.is_empty() {
                        bp.bound.push(BoundBreakpoint::placeholder(&number));
                    }
                } else {
                    bp.merge_locations(locations);
                }
            }
        }
    }

    /// Correlate a stop at (`number`, `address`) to a single bound
    /// breakpoint, rebinding the placeholder or creating a new entry for a
    /// location observed for the first time. A visible hit increments the
    /// entry's hit count.
    pub fn resolve_hit(
        &self,
        number: &str,
        address: u64,
        frame: Option<&FrameInfo>,
    ) -> HitResolution {
        let mut map = self.breakpoints.lock().expect("unpoisoned");
        let Some(bp) = map
            .values_mut()
            .find(|bp| bp.kind == BreakpointKind::Code && bp.number.as_deref() == Some(number))
        else {
            return HitResolution::NotFound;
        };
        let i = bp.bind_to_address(address, frame);
        if !bp.visible() || !bp.bound[i].enabled {
            return HitResolution::SilentContinue;
        }
        bp.bound[i].hit_count += 1;
        HitResolution::Hit(BoundBreakpointView::new(bp, &bp.bound[i]))
    }

    /// Full stop-event variant of [`BreakpointRegistry::resolve_hit`]:
    /// besides the breakpoint owning `number`, collect every other bound
    /// entry at the same address, so co-located breakpoints are reported in
    /// one list. The flag is true when the stop belongs to us but nothing is
    /// visible and the caller must resume execution.
    pub fn find_hit_breakpoints(
        &self,
        number: &str,
        address: u64,
        frame: Option<&FrameInfo>,
    ) -> (Vec<BoundBreakpointView>, bool) {
        let mut map = self.breakpoints.lock().expect("unpoisoned");

        let mut matched: Vec<(BreakpointId, usize)> = vec![];
        if address != UNRESOLVED_ADDRESS {
            for bp in map.values() {
                if bp.kind != BreakpointKind::Code {
                    continue;
                }
                for (i, bound) in bp.bound.iter().enumerate() {
                    if bound.address == address {
                        matched.push((bp.id, i));
                    }
                }
            }
        }
        // the entry claimed by the reported number may rebind a placeholder
        // or appear just now, so resolve it separately
        if let Some(bp) = map
            .values_mut()
            .find(|bp| bp.kind == BreakpointKind::Code && bp.number.as_deref() == Some(number))
        {
            let i = bp.bind_to_address(address, frame);
            let key = (bp.id, i);
            if !matched.contains(&key) {
                matched.push(key);
            }
        }
        if matched.is_empty() {
            return (vec![], false);
        }

        let mut visible = vec![];
        for (id, i) in matched {
            let bp = map.get_mut(&id).expect("matched above");
            if bp.visible() && bp.bound[i].enabled {
                bp.bound[i].hit_count += 1;
                visible.push(BoundBreakpointView::new(bp, &bp.bound[i]));
            }
        }
        let should_continue = visible.is_empty();
        (visible, should_continue)
    }

    /// Resolve a watchpoint trigger. Watch hits carry no address, so the
    /// match is by number only; the visibility contract is the same as for
    /// code breakpoints.
    pub fn find_hit_watchpoint(&self, number: &str) -> HitResolution {
        let mut map = self.breakpoints.lock().expect("unpoisoned");
        let Some(bp) = map
            .values_mut()
            .find(|bp| bp.kind == BreakpointKind::Watch && bp.number.as_deref() == Some(number))
        else {
            return HitResolution::NotFound;
        };
        let Some(bound) = bp.bound.first() else {
            return HitResolution::NotFound;
        };
        if !bp.visible() || !bound.enabled {
            return HitResolution::SilentContinue;
        }
        bp.bound[0].hit_count += 1;
        HitResolution::Hit(BoundBreakpointView::new(bp, &bp.bound[0]))
    }

    /// Queue a breakpoint for removal. The backend delete happens at the
    /// next natural stop (see [`BreakpointRegistry::sweep_pending_deletions`]);
    /// until then hits on it are silently passed through.
    pub fn mark_pending_delete(&self, id: BreakpointId) -> Result<(), Error> {
        let mut map = self.breakpoints.lock().expect("unpoisoned");
        let bp = map.get_mut(&id).ok_or(Error::BreakpointNotFound(id))?;
        bp.pending_delete = true;
        Ok(())
    }

    /// Two-phase deletion sweep: drain the marked entries out of the
    /// registry first, then issue the backend deletes. Hit resolution for
    /// another breakpoint in the same stop never observes a half-removed
    /// set.
    pub fn sweep_pending_deletions(&self, driver: &mut dyn DebuggerDriver) -> Result<(), Error> {
        let drained: Vec<PendingBreakpoint> = {
            let mut map = self.breakpoints.lock().expect("unpoisoned");
            let ids: Vec<BreakpointId> = map
                .values()
                .filter(|bp| bp.pending_delete)
                .map(|bp| bp.id)
                .collect();
            ids.iter().filter_map(|id| map.shift_remove(id)).collect()
        };
        for bp in drained {
            debug!(target: "breakpoint", "sweep breakpoint {}", bp.id);
            if let Some(number) = bp.number {
                if let Err(e) = driver.delete_breakpoint(&number) {
                    warn!(target: "breakpoint", "delete breakpoint {number}: {e}");
                }
            }
        }
        Ok(())
    }

    /// Detach path: remove every instruction-level binding from the backend
    /// but keep the bookkeeping, the session is going away regardless.
    pub fn clear_all(&self, driver: &mut dyn DebuggerDriver) {
        let numbers: Vec<String> = {
            let mut map = self.breakpoints.lock().expect("unpoisoned");
            map.values_mut()
                .filter_map(|bp| {
                    bp.deleted = true;
                    for bound in bp.bound.iter_mut() {
                        bound.enabled = false;
                    }
                    bp.number.clone()
                })
                .collect()
        };
        for number in numbers {
            if let Err(e) = driver.delete_breakpoint(&number) {
                warn!(target: "breakpoint", "clear breakpoint {number}: {e}");
            }
        }
    }

    pub fn set_enabled(
        &self,
        id: BreakpointId,
        enabled: bool,
        driver: &mut dyn DebuggerDriver,
    ) -> Result<(), Error> {
        let number = {
            let map = self.breakpoints.lock().expect("unpoisoned");
            let bp = map.get(&id).ok_or(Error::BreakpointNotFound(id))?;
            bp.number.clone()
        };
        if let Some(number) = number {
            driver.enable_breakpoint(&number, enabled)?;
        }
        let mut map = self.breakpoints.lock().expect("unpoisoned");
        let bp = map.get_mut(&id).ok_or(Error::BreakpointNotFound(id))?;
        bp.enabled = enabled;
        Ok(())
    }

    pub fn set_condition(
        &self,
        id: BreakpointId,
        expr: &str,
        driver: &mut dyn DebuggerDriver,
    ) -> Result<(), Error> {
        let number = {
            let map = self.breakpoints.lock().expect("unpoisoned");
            let bp = map.get(&id).ok_or(Error::BreakpointNotFound(id))?;
            bp.number.clone()
        };
        if let Some(number) = number {
            driver.set_condition(&number, expr)?;
        }
        let mut map = self.breakpoints.lock().expect("unpoisoned");
        let bp = map.get_mut(&id).ok_or(Error::BreakpointNotFound(id))?;
        match &mut bp.request {
            BindRequest::Insert(spec) => spec.condition = Some(expr.to_string()),
            BindRequest::InsertWatch(_) | BindRequest::Sync(_) => {}
        }
        Ok(())
    }
}
