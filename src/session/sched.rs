//! Single-flight operation scheduler.
//!
//! One dedicated thread owns the session state and executes every backend
//! interaction. Callers on other threads submit work through [`Scheduler`]:
//! blocking foreground operations (at most one in flight, FIFO) and posted
//! fire-and-forget operations (strict FIFO, fully drained before the thread
//! idles or exits). An asynchronous foreground operation holds the logical
//! foreground slot without tying up the thread; its [`Completion`] is fired
//! later by event-processing work and re-enters the loop as a message.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use log::{debug, error};

use crate::session::error::Error;

type PostedOp<S> = Box<dyn FnOnce(&mut S) -> Result<(), Error> + Send>;
type ForegroundOp<S> = Box<dyn FnOnce(&mut S) -> Slot + Send>;

/// State of the foreground slot after a foreground operation was invoked.
enum Slot {
    /// Operation ran to completion inline.
    Free,
    /// Operation is waiting on a [`Completion`]; the slot is released by a
    /// `SlotFree` message later.
    Held,
}

enum Message<S> {
    Foreground(ForegroundOp<S>),
    Posted(PostedOp<S>),
    SlotFree,
    Shutdown,
}

/// Completion handle of an asynchronous foreground operation.
///
/// The operation (or any later scheduler-thread work it armed) calls
/// [`Completion::done`] exactly once to deliver the result to the blocked
/// caller and release the foreground slot. Extra calls are ignored.
pub struct Completion<T> {
    inner: Arc<Mutex<Option<CompletionInner<T>>>>,
}

struct CompletionInner<T> {
    promise: SyncSender<Result<T, Error>>,
    release_slot: Box<dyn FnOnce() + Send>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Completion<T> {
    fn new(promise: SyncSender<Result<T, Error>>, release_slot: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(CompletionInner {
                promise,
                release_slot,
            }))),
        }
    }

    pub fn done(&self, result: Result<T, Error>) {
        let inner = self.inner.lock().expect("unpoisoned").take();
        if let Some(inner) = inner {
            // a caller that gave up waiting is not an error
            let _ = inner.promise.send(result);
            (inner.release_slot)();
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().expect("unpoisoned").is_none()
    }
}

/// Cancellation flag shared between a caller and an in-flight operation.
/// Cancellation is observed at suspension points only; it never aborts an
/// already issued backend command.
#[derive(Default)]
pub struct CancellationSource {
    flag: Arc<AtomicBool>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            flag: self.flag.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Progress reporting surface handed to `run_async_with_progress` work.
pub struct Progress {
    sink: Box<dyn Fn(&str) + Send>,
    cancel: CancellationToken,
}

impl Progress {
    pub fn report(&self, message: &str) {
        (self.sink)(message);
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }
}

/// Cheap submission handle usable from the scheduler thread itself
/// (e.g. a stop handler posting a deferred resume).
pub struct SchedulerHandle<S> {
    tx: Sender<Message<S>>,
    closed: Arc<AtomicBool>,
    thread_id: Arc<OnceLock<ThreadId>>,
}

impl<S> Clone for SchedulerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
            thread_id: self.thread_id.clone(),
        }
    }
}

impl<S> SchedulerHandle<S> {
    /// Enqueue fire-and-forget work. Never blocks; FIFO with respect to
    /// other posted work.
    pub fn post<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut S) -> Result<(), Error> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SchedulerClosed);
        }
        self.tx
            .send(Message::Posted(Box::new(f)))
            .map_err(|_| Error::SchedulerClosed)
    }

    pub fn is_scheduler_thread(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }
}

pub struct Scheduler<S> {
    handle: SchedulerHandle<S>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl<S: 'static> Scheduler<S> {
    /// Spawn the scheduler thread; `init` builds the thread-owned state and
    /// receives a handle for work that must re-submit from inside the loop.
    /// Posted-work failures are logged.
    pub fn spawn<I>(init: I) -> Self
    where
        I: FnOnce(SchedulerHandle<S>) -> S + Send + 'static,
    {
        Self::spawn_with_error_hook(init, |e| {
            error!(target: "sched", "posted operation failed: {e}")
        })
    }

    /// As [`Scheduler::spawn`], with an explicit sink for failures of posted
    /// work (there is no blocked caller to re-raise them into).
    pub fn spawn_with_error_hook<I, H>(init: I, on_posted_error: H) -> Self
    where
        I: FnOnce(SchedulerHandle<S>) -> S + Send + 'static,
        H: Fn(Error) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Message<S>>();
        let handle = SchedulerHandle {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            thread_id: Arc::new(OnceLock::new()),
        };

        let thread_handle = handle.clone();
        let thread = thread::Builder::new()
            .name("midb-session".to_string())
            .spawn(move || {
                thread_handle
                    .thread_id
                    .set(thread::current().id())
                    .expect("set once");
                let mut state = init(thread_handle);
                run_loop(&mut state, rx, &on_posted_error);
                debug!(target: "sched", "scheduler thread exited");
            })
            .expect("spawn scheduler thread");

        Self {
            handle,
            join: Mutex::new(Some(thread)),
        }
    }

    pub fn handle(&self) -> SchedulerHandle<S> {
        self.handle.clone()
    }

    /// Run `f` on the scheduler thread and block until it finishes,
    /// re-raising its failure. FIFO with respect to other foreground
    /// submissions; waits for the current foreground operation to release
    /// the slot first.
    pub fn run_sync<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> Result<T, Error> + Send + 'static,
    {
        debug_assert!(
            !self.is_scheduler_thread(),
            "blocking submission from the scheduler thread deadlocks"
        );
        let (promise, result) = mpsc::sync_channel::<Result<T, Error>>(1);
        let op: ForegroundOp<S> = Box::new(move |state| {
            let _ = promise.send(f(state));
            Slot::Free
        });
        self.submit_foreground(op)?;
        result.recv().unwrap_or(Err(Error::SchedulerClosed))
    }

    /// Run `f` on the scheduler thread; `f` starts an exchange and arms the
    /// given [`Completion`] instead of finishing inline. The caller blocks
    /// until the completion fires, but the scheduler thread keeps draining
    /// posted work and backend events meanwhile. An `Err` returned from `f`
    /// completes the operation immediately.
    pub fn run_async<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut S, Completion<T>) -> Result<(), Error> + Send + 'static,
    {
        debug_assert!(
            !self.is_scheduler_thread(),
            "blocking submission from the scheduler thread deadlocks"
        );
        let (promise, result) = mpsc::sync_channel::<Result<T, Error>>(1);
        let wake = self.handle.tx.clone();
        let op: ForegroundOp<S> = Box::new(move |state| {
            let completion = Completion::new(
                promise,
                Box::new(move || {
                    let _ = wake.send(Message::SlotFree);
                }),
            );
            if let Err(e) = f(state, completion.clone()) {
                completion.done(Err(e));
            }
            Slot::Held
        });
        self.submit_foreground(op)?;
        result.recv().unwrap_or(Err(Error::SchedulerClosed))
    }

    /// [`Scheduler::run_async`] variant that reports incremental progress
    /// and honors cancellation while the caller waits.
    pub fn run_async_with_progress<T, F, P>(
        &self,
        f: F,
        progress_sink: P,
        cancel: CancellationToken,
    ) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut S, Completion<T>, Progress) -> Result<(), Error> + Send + 'static,
        P: Fn(&str) + Send + 'static,
    {
        self.run_async(move |state, completion| {
            let progress = Progress {
                sink: Box::new(progress_sink),
                cancel,
            };
            f(state, completion, progress)
        })
    }

    /// See [`SchedulerHandle::post`].
    pub fn post<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut S) -> Result<(), Error> + Send + 'static,
    {
        self.handle.post(f)
    }

    pub fn is_scheduler_thread(&self) -> bool {
        self.handle.is_scheduler_thread()
    }

    /// Reject new submissions, let the in-flight foreground operation and
    /// all already queued work finish, then stop and join the thread.
    /// Subsequent calls are no-ops.
    pub fn close(&self) {
        debug_assert!(
            !self.is_scheduler_thread(),
            "close from the scheduler thread deadlocks"
        );
        if self.handle.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.handle.tx.send(Message::Shutdown);
        let thread = self.join.lock().expect("unpoisoned").take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    fn submit_foreground(&self, op: ForegroundOp<S>) -> Result<(), Error> {
        if self.handle.closed.load(Ordering::SeqCst) {
            return Err(Error::SchedulerClosed);
        }
        self.handle
            .tx
            .send(Message::Foreground(op))
            .map_err(|_| Error::SchedulerClosed)
    }
}

impl<S> Drop for Scheduler<S> {
    fn drop(&mut self) {
        self.handle.closed.store(true, Ordering::SeqCst);
        let _ = self.handle.tx.send(Message::Shutdown);
        let thread = self.join.lock().expect("unpoisoned").take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

struct LoopState<S> {
    foreground: VecDeque<ForegroundOp<S>>,
    posted: VecDeque<PostedOp<S>>,
    slot_held: bool,
    shutdown: bool,
}

impl<S> LoopState<S> {
    fn accept(&mut self, msg: Message<S>) {
        match msg {
            Message::Foreground(op) => self.foreground.push_back(op),
            Message::Posted(op) => self.posted.push_back(op),
            Message::SlotFree => self.slot_held = false,
            Message::Shutdown => self.shutdown = true,
        }
    }

    fn drained(&self) -> bool {
        !self.slot_held && self.foreground.is_empty() && self.posted.is_empty()
    }
}

fn run_loop<S>(state: &mut S, rx: Receiver<Message<S>>, on_posted_error: &dyn Fn(Error)) {
    let mut queue = LoopState {
        foreground: VecDeque::new(),
        posted: VecDeque::new(),
        slot_held: false,
        shutdown: false,
    };

    loop {
        loop {
            match rx.try_recv() {
                Ok(msg) => queue.accept(msg),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    queue.shutdown = true;
                    break;
                }
            }
        }

        let mut ran = false;
        if !queue.slot_held {
            if let Some(op) = queue.foreground.pop_front() {
                queue.slot_held = matches!(op(state), Slot::Held);
                ran = true;
            }
        }
        // one posted item per turn keeps foreground starts and posted work
        // interleaved instead of starving one another
        if let Some(op) = queue.posted.pop_front() {
            if let Err(e) = op(state) {
                on_posted_error(e);
            }
            ran = true;
        }
        if ran {
            continue;
        }

        // posted work always drains to empty before the thread goes away
        if queue.shutdown && queue.drained() {
            return;
        }

        match rx.recv() {
            Ok(msg) => queue.accept(msg),
            Err(_) => {
                // every sender is gone, including any armed completion;
                // a held slot can never be released now
                queue.shutdown = true;
                queue.slot_held = false;
                if queue.drained() {
                    return;
                }
            }
        }
    }
}
