//! Background I/O scheduler
//!
//! Owns one dedicated thread running a single-threaded tokio runtime with a
//! `LocalSet`. The connection state lives on that thread only; other threads
//! reach it exclusively by submitting closures through a queue, and the
//! transport reaches it by emitting events.

use crate::completion::{self, Completion, Resolver};
use quicmux_common::{QuicMuxError, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// State driven by a scheduler's event loop
///
/// Every method runs on the loop thread.
pub trait LoopState: 'static {
    /// Events delivered to the loop from the transport or from worker threads
    type Event: Send + 'static;

    fn on_event(&mut self, event: Self::Event);

    /// Earliest instant at which `on_deadline` should run
    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    fn on_deadline(&mut self, _now: Instant) {}

    /// When true the loop exits on its own
    fn is_finished(&self) -> bool {
        false
    }

    /// Last call before the state is dropped
    fn on_stop(&mut self) {}
}

/// Cloneable handle for pushing events into a running loop
pub struct EventSender<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> std::fmt::Debug for EventSender<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSender")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<E: Send + 'static> EventSender<E> {
    /// Detached sender/receiver pair for driving loop state by hand
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event; returns false once the loop has gone away
    pub fn emit(&self, event: impl Into<E>) -> bool {
        self.tx.send(event.into()).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

trait Task<S>: Send {
    fn run(self: Box<Self>, state: &mut S);

    fn reject(self: Box<Self>, error: QuicMuxError);
}

struct Submitted<F, T> {
    f: F,
    resolver: Resolver<T>,
}

impl<S, F, T> Task<S> for Submitted<F, T>
where
    F: FnOnce(&mut S) -> T + Send,
    T: Send,
{
    fn run(self: Box<Self>, state: &mut S) {
        let Submitted { f, resolver } = *self;
        resolver.succeed(f(state));
    }

    fn reject(self: Box<Self>, error: QuicMuxError) {
        self.resolver.fail(error);
    }
}

type TaskBox<S> = Box<dyn Task<S>>;

struct Running<S: LoopState> {
    tasks: mpsc::UnboundedSender<TaskBox<S>>,
    events: EventSender<S::Event>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl<S: LoopState> Running<S> {
    fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitReason {
    Stopped,
    Finished,
}

/// One dedicated event-loop thread
pub struct Scheduler<S: LoopState> {
    name: String,
    running: Mutex<Option<Running<S>>>,
}

impl<S: LoopState> Scheduler<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running<S>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the loop thread and build its state with `init`
    ///
    /// `init` runs on the loop thread inside the runtime, so it may spawn
    /// local tasks. Returns once `init` has finished. A no-op while the loop
    /// is already running.
    pub fn start<F>(&self, init: F) -> Result<()>
    where
        F: FnOnce(EventSender<S::Event>) -> Result<S> + Send + 'static,
    {
        let mut running = self.lock();
        if running.as_ref().is_some_and(Running::is_alive) {
            debug!(scheduler = %self.name, "Scheduler already running");
            return Ok(());
        }
        if let Some(stale) = running.take() {
            join_loop(&self.name, stale);
        }

        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (started, started_wait) = completion::pair::<()>();

        let events = EventSender { tx: event_tx };
        let loop_events = events.clone();
        let name = self.name.clone();

        let thread = thread::Builder::new()
            .name(format!("quicmux-{}", self.name))
            .spawn(move || run_loop(name, init, loop_events, task_rx, event_rx, shutdown_rx, started))?;

        let candidate = Running {
            tasks: task_tx,
            events,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        };

        match started_wait.wait() {
            Ok(()) => {
                *running = Some(candidate);
                Ok(())
            }
            Err(e) => {
                join_loop(&self.name, candidate);
                Err(e)
            }
        }
    }

    /// Run `f` against the loop state on the loop thread
    ///
    /// Tasks still queued when the loop is stopped resolve with
    /// `Cancelled`; if the loop is gone or dies they resolve with
    /// `SchedulerStopped`.
    pub fn submit<F, T>(&self, f: F) -> Completion<T>
    where
        F: FnOnce(&mut S) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (resolver, completion) = completion::pair();
        let task: TaskBox<S> = Box::new(Submitted { f, resolver });

        let running = self.lock();
        match running.as_ref() {
            Some(running) => {
                if let Err(mpsc::error::SendError(task)) = running.tasks.send(task) {
                    task.reject(QuicMuxError::SchedulerStopped);
                }
            }
            None => task.reject(QuicMuxError::SchedulerStopped),
        }

        completion
    }

    /// Sender for injecting events into the running loop
    pub fn events(&self) -> Option<EventSender<S::Event>> {
        self.lock().as_ref().map(|running| running.events.clone())
    }

    pub fn is_running(&self) -> bool {
        self.lock().as_ref().is_some_and(Running::is_alive)
    }

    /// Ask the loop to exit and join its thread. Safe to call repeatedly.
    pub fn stop(&self) {
        let running = self.lock().take();
        if let Some(mut running) = running {
            if let Some(shutdown) = running.shutdown.take() {
                let _ = shutdown.send(());
            }
            join_loop(&self.name, running);
        }
    }
}

impl<S: LoopState> Drop for Scheduler<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_loop<S: LoopState>(name: &str, mut running: Running<S>) {
    let Some(thread) = running.thread.take() else {
        return;
    };

    if thread.thread().id() == thread::current().id() {
        warn!(scheduler = %name, "Scheduler stopped from its own loop thread, not joining");
        return;
    }

    if thread.join().is_err() {
        error!(scheduler = %name, "Scheduler thread panicked outside the event loop");
    }
}

fn run_loop<S, F>(
    name: String,
    init: F,
    events: EventSender<S::Event>,
    mut tasks: mpsc::UnboundedReceiver<TaskBox<S>>,
    mut event_rx: mpsc::UnboundedReceiver<S::Event>,
    shutdown: oneshot::Receiver<()>,
    started: Resolver<()>,
) where
    S: LoopState,
    F: FnOnce(EventSender<S::Event>) -> Result<S>,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(scheduler = %name, "Failed to build event loop runtime: {}", e);
            started.fail(e.into());
            return;
        }
    };
    let local = tokio::task::LocalSet::new();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        local.block_on(
            &runtime,
            drive(&name, init, events, &mut tasks, &mut event_rx, shutdown, started),
        )
    }));

    let rejection = match outcome {
        Ok(ExitReason::Stopped) => QuicMuxError::Cancelled,
        Ok(ExitReason::Finished) => QuicMuxError::SchedulerStopped,
        Err(_) => {
            error!(scheduler = %name, "Event loop faulted, failing pending submissions");
            QuicMuxError::SchedulerStopped
        }
    };

    tasks.close();
    let mut discarded = 0usize;
    while let Ok(task) = tasks.try_recv() {
        task.reject(rejection.clone());
        discarded += 1;
    }
    if discarded > 0 {
        debug!(scheduler = %name, "Discarded {} queued tasks", discarded);
    }

    drop(local);
    // Handlers still running on the blocking pool finish detached
    runtime.shutdown_background();
    info!(scheduler = %name, "Event loop stopped");
}

async fn drive<S, F>(
    name: &str,
    init: F,
    events: EventSender<S::Event>,
    tasks: &mut mpsc::UnboundedReceiver<TaskBox<S>>,
    event_rx: &mut mpsc::UnboundedReceiver<S::Event>,
    mut shutdown: oneshot::Receiver<()>,
    started: Resolver<()>,
) -> ExitReason
where
    S: LoopState,
    F: FnOnce(EventSender<S::Event>) -> Result<S>,
{
    let mut state = match init(events) {
        Ok(state) => {
            started.succeed(());
            state
        }
        Err(e) => {
            warn!(scheduler = %name, "Event loop initialisation failed: {}", e);
            started.fail(e);
            return ExitReason::Finished;
        }
    };

    info!(scheduler = %name, "Event loop running");

    let reason = loop {
        if state.is_finished() {
            break ExitReason::Finished;
        }

        let deadline = state.next_deadline();
        tokio::select! {
            biased;
            _ = &mut shutdown => break ExitReason::Stopped,
            Some(event) = event_rx.recv() => state.on_event(event),
            task = tasks.recv() => match task {
                Some(task) => task.run(&mut state),
                None => break ExitReason::Stopped,
            },
            _ = sleep_until(deadline) => state.on_deadline(Instant::now()),
        }
    };

    debug!(scheduler = %name, ?reason, "Event loop exiting");
    state.on_stop();
    reason
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
