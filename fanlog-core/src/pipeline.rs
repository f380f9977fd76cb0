use std::{
    collections::BTreeSet,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Condvar, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};

use crate::{
    config::{DispatchMode, FanlogConfig, OverflowPolicy, PipelineConfig},
    diagnostics::{Diagnostic, DiagnosticHandler, Diagnostics, PipelineStats},
    error::{Error, Result},
    event::{CallerContext, LogEvent},
    level::Level,
    retention::RetentionStore,
    sink::{Sink, SinkConfig, SinkRegistry, panic_message},
    utils::lock,
};

/// Callback run after the sinks for every dispatched event.
pub type Listener = Arc<dyn Fn(&LogEvent) + Send + Sync>;

enum Message {
    Event(Arc<LogEvent>),
    /// Nudges an idle worker to look at the stop request.
    Wake,
}

#[derive(Default)]
struct Intake {
    closed: bool,
    draining: usize,
    /// Accepted but not yet dispatched or dropped.
    pending: usize,
    /// `Some(finish_pending)` once shutdown was requested.
    stop: Option<bool>,
}

struct Shared {
    retention: RetentionStore,
    sinks: SinkRegistry,
    diagnostics: Diagnostics,
    listener: RwLock<Option<Listener>>,
    intake: Mutex<Intake>,
    idle: Condvar,
}

impl Shared {
    /// With `flush`, every sink that took the event is flushed before returning.
    fn dispatch(&self, event: &Arc<LogEvent>, flush: bool) {
        self.retention.append(event.clone());
        if flush {
            self.sinks.dispatch_flushed(event, &self.diagnostics);
        } else {
            self.sinks.dispatch(event, &self.diagnostics);
        }
        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener
            && let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event)))
        {
            self.diagnostics
                .report(Diagnostic::ListenerPanicked(panic_message(panic.as_ref())));
        }
        self.diagnostics.record_dispatched();
    }

    /// Marks one accepted event as settled, dispatched or dropped.
    fn settle(&self) {
        let mut intake = lock(&self.intake);
        intake.pending = intake.pending.saturating_sub(1);
        if intake.pending == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let intake = lock(&self.intake);
        let _intake = self
            .idle
            .wait_while(intake, |intake| intake.pending > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

struct Worker {
    sender: Sender<Message>,
    /// Second handle on the queue, used by producers to evict under drop-oldest.
    receiver: Receiver<Message>,
    overflow: OverflowPolicy,
    handle: Mutex<Option<JoinHandle<()>>>,
    /// Disconnects when the worker thread exits.
    done: Receiver<()>,
}

enum Dispatcher {
    /// Serializes inline dispatch so the history keeps a single writer.
    Sync { serial: Mutex<()> },
    Async(Worker),
}

/// Accepts events from any thread and fans them out to the history and to every
/// registered sink, inline or on one worker thread.
///
/// `submit` never fails: sink errors, dropped events and rejected submissions
/// are reported through the diagnostic handler and counted in [`PipelineStats`].
pub struct Pipeline {
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    mode: DispatchMode,
    sinks_closed: AtomicBool,
    /// Bounded wait used by `Drop`.
    drop_timeout: Duration,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// A pipeline with no sinks and unbounded history.
    pub fn new(mode: DispatchMode) -> Result<Self> {
        Self::with_parts(mode, RetentionStore::unbounded(), SinkRegistry::new())
    }

    /// Builds every sink and validates the whole configuration before the
    /// pipeline accepts its first event.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let retention = RetentionStore::new(config.max_retained)?;
        let sinks = SinkRegistry::new();
        for sink in &config.sinks {
            sinks.add(Sink::from_config(sink)?)?;
        }
        Self::with_parts(config.mode, retention, sinks)
    }

    fn with_parts(mode: DispatchMode, retention: RetentionStore, sinks: SinkRegistry) -> Result<Self> {
        let settings = FanlogConfig::load()?;
        let flush_interval = settings.flush_interval();
        let shared = Arc::new(Shared {
            retention,
            sinks,
            diagnostics: Diagnostics::default(),
            listener: RwLock::new(None),
            intake: Mutex::new(Intake::default()),
            idle: Condvar::new(),
        });
        let dispatcher = match mode {
            DispatchMode::Sync => Dispatcher::Sync {
                serial: Mutex::new(()),
            },
            DispatchMode::Async { capacity, overflow } => {
                let (sender, receiver) = match overflow {
                    OverflowPolicy::Unbounded => unbounded(),
                    _ if capacity == 0 => return Err(Error::InvalidQueueCapacity),
                    _ => bounded(capacity),
                };
                let (done_sender, done) = bounded::<()>(0);
                let worker_shared = shared.clone();
                let worker_receiver = receiver.clone();
                let handle = std::thread::Builder::new()
                    .name("fanlog-worker".into())
                    .spawn(move || {
                        run_worker(&worker_shared, &worker_receiver, flush_interval);
                        drop(done_sender);
                    })?;
                Dispatcher::Async(Worker {
                    sender,
                    receiver,
                    overflow,
                    handle: Mutex::new(Some(handle)),
                    done,
                })
            }
        };
        Ok(Self {
            shared,
            dispatcher,
            mode,
            sinks_closed: AtomicBool::new(false),
            drop_timeout: settings.shutdown_timeout(),
        })
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Records an event and hands it to dispatch. Returns the event even when it
    /// was dropped by the overflow policy or rejected because intake is closed.
    pub fn submit(
        &self,
        level: Level,
        message: impl Into<String>,
        caller: Option<CallerContext>,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Arc<LogEvent> {
        let event = Arc::new(LogEvent::new(level, message, caller, tags));
        self.enqueue(event.clone());
        event
    }

    /// Submits `message`, then `Error: <error>`, then one `caused by: ...` event
    /// per source in the chain. Returns the first event.
    pub fn submit_error(
        &self,
        level: Level,
        message: impl Into<String>,
        caller: Option<CallerContext>,
        tags: impl IntoIterator<Item = impl Into<String>>,
        error: &dyn std::error::Error,
    ) -> Arc<LogEvent> {
        let tags: BTreeSet<String> = tags.into_iter().map(Into::into).collect();
        let first = self.submit(level, message, caller.clone(), tags.iter().cloned());
        self.submit(level, format!("Error: {error}"), caller.clone(), tags.iter().cloned());
        let mut source = error.source();
        while let Some(cause) = source {
            self.submit(
                level,
                format!("caused by: {cause}"),
                caller.clone(),
                tags.iter().cloned(),
            );
            source = cause.source();
        }
        first
    }

    fn admit(&self, event: &LogEvent) -> bool {
        let mut intake = lock(&self.shared.intake);
        if !intake.closed && intake.draining == 0 {
            intake.pending += 1;
            return true;
        }
        let state = if intake.closed { "shut down" } else { "draining" };
        drop(intake);
        self.shared.diagnostics.record_rejected();
        self.shared.diagnostics.report(Diagnostic::EventRejected {
            level: event.level(),
            message: event.message().to_string(),
            state,
        });
        false
    }

    fn enqueue(&self, event: Arc<LogEvent>) {
        if !self.admit(&event) {
            return;
        }
        match &self.dispatcher {
            Dispatcher::Sync { serial } => {
                {
                    let _serial = lock(serial);
                    self.shared.dispatch(&event, true);
                }
                self.shared.settle();
            }
            Dispatcher::Async(worker) => worker.push(&self.shared, event),
        }
    }

    pub fn get_last(&self) -> Option<Arc<LogEvent>> {
        self.shared.retention.get_last()
    }

    /// Snapshot of the retained history, oldest first.
    pub fn get_all(&self) -> Arc<Vec<Arc<LogEvent>>> {
        self.shared.retention.get_all()
    }

    /// `None` lifts the cap. Anything below 5 is refused.
    pub fn set_max_retained(&self, max_retained: Option<usize>) -> Result<()> {
        self.shared.retention.set_capacity(max_retained)
    }

    pub fn max_retained(&self) -> Option<usize> {
        self.shared.retention.capacity()
    }

    pub fn add_sink(&self, sink: Sink) -> Result<Arc<Sink>> {
        self.shared.sinks.add(sink)
    }

    pub fn add_sink_config(&self, config: &SinkConfig) -> Result<Arc<Sink>> {
        self.shared.sinks.add(Sink::from_config(config)?)
    }

    /// Unregisters a sink without closing it.
    pub fn remove_sink(&self, name: &str) -> Option<Arc<Sink>> {
        self.shared.sinks.remove(name)
    }

    pub fn sink(&self, name: &str) -> Option<Arc<Sink>> {
        self.shared.sinks.get(name)
    }

    pub fn list_sinks(&self) -> Vec<Arc<Sink>> {
        self.shared.sinks.list()
    }

    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(&LogEvent) + Send + Sync + 'static,
    {
        *self
            .shared
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    pub fn clear_listener(&self) {
        *self
            .shared
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn set_diagnostic_handler(&self, handler: DiagnosticHandler) {
        self.shared.diagnostics.set_handler(handler);
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.diagnostics.stats()
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.shared.intake).closed
    }

    /// Closes intake, waits until every accepted event is dispatched, flushes the
    /// sinks and reopens intake. Submissions made meanwhile are rejected.
    ///
    /// Must not be called from a sink or listener.
    pub fn drain(&self) {
        lock(&self.shared.intake).draining += 1;
        self.shared.wait_idle();
        self.shared.sinks.flush(&self.shared.diagnostics);
        lock(&self.shared.intake).draining -= 1;
    }

    /// Waits until every accepted event is dispatched, then flushes the sinks.
    /// Unlike [`Pipeline::drain`], intake stays open, so under sustained load this
    /// returns once the queue is momentarily empty.
    ///
    /// Must not be called from a sink or listener.
    pub fn flush(&self) {
        self.shared.wait_idle();
        self.shared.sinks.flush(&self.shared.diagnostics);
    }

    /// Stops intake for good and stops the worker, waiting at most `timeout`.
    ///
    /// With `finish_pending` the worker dispatches everything already queued
    /// first; without it, queued events are discarded after the event in progress.
    /// Once the worker is gone the sinks are closed. On timeout a diagnostic is
    /// reported, the sinks stay open and the call may be repeated.
    pub fn shutdown(&self, timeout: Duration, finish_pending: bool) -> Result<()> {
        {
            let mut intake = lock(&self.shared.intake);
            intake.closed = true;
            if intake.stop != Some(false) {
                intake.stop = Some(finish_pending);
            }
        }
        let stopped = match &self.dispatcher {
            Dispatcher::Sync { .. } => {
                let intake = lock(&self.shared.intake);
                let (_intake, wait) = self
                    .shared
                    .idle
                    .wait_timeout_while(intake, timeout, |intake| intake.pending > 0)
                    .unwrap_or_else(PoisonError::into_inner);
                !wait.timed_out()
            }
            Dispatcher::Async(worker) => worker.stop(timeout),
        };
        if !stopped {
            self.shared
                .diagnostics
                .report(Diagnostic::ShutdownTimeout(timeout));
            return Err(Error::ShutdownTimeout(timeout));
        }
        if !self.sinks_closed.swap(true, Ordering::AcqRel) {
            self.shared.sinks.close(&self.shared.diagnostics);
        }
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.shutdown(self.drop_timeout, true);
    }
}

impl Worker {
    fn push(&self, shared: &Shared, event: Arc<LogEvent>) {
        let message = Message::Event(event);
        match self.overflow {
            OverflowPolicy::Block | OverflowPolicy::Unbounded => {
                if self.sender.send(message).is_err() {
                    shared.settle();
                }
            }
            OverflowPolicy::DropNewest => match self.sender.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    shared.diagnostics.record_dropped();
                    shared.settle();
                }
                Err(TrySendError::Disconnected(_)) => shared.settle(),
            },
            OverflowPolicy::DropOldest => {
                let mut message = message;
                loop {
                    match self.sender.try_send(message) {
                        Ok(()) => break,
                        Err(TrySendError::Full(rejected)) => {
                            message = rejected;
                            if let Ok(Message::Event(_)) = self.receiver.try_recv() {
                                shared.diagnostics.record_dropped();
                                shared.settle();
                            }
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            shared.settle();
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Returns whether the worker thread exited within `timeout`.
    fn stop(&self, timeout: Duration) -> bool {
        let _ = self.sender.try_send(Message::Wake);
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            _ => {
                if let Some(handle) = lock(&self.handle).take() {
                    let _ = handle.join();
                }
                true
            }
        }
    }
}

fn run_worker(shared: &Shared, receiver: &Receiver<Message>, flush_interval: Duration) {
    let mut last_flush = Instant::now();
    let mut dirty = false;
    let finish_pending = loop {
        let elapsed = last_flush.elapsed();
        let timeout = if elapsed >= flush_interval {
            Duration::from_millis(1)
        } else {
            flush_interval - elapsed
        };
        match receiver.recv_timeout(timeout) {
            Ok(Message::Event(event)) => {
                shared.dispatch(&event, false);
                shared.settle();
                dirty = true;
            }
            Ok(Message::Wake) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break true,
        }

        if dirty && last_flush.elapsed() >= flush_interval {
            shared.sinks.flush(&shared.diagnostics);
            last_flush = Instant::now();
            dirty = false;
        }

        let intake = lock(&shared.intake);
        match intake.stop {
            Some(false) => break false,
            Some(true) if intake.pending == 0 => break true,
            _ => {}
        }
    };

    if !finish_pending {
        // discard until every admitted event is accounted for, so producers
        // blocked on a full queue all get through
        while lock(&shared.intake).pending > 0 {
            match receiver.recv_timeout(flush_interval) {
                Ok(Message::Event(_)) => shared.settle(),
                Ok(Message::Wake) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
    shared.sinks.flush(&shared.diagnostics);
}
